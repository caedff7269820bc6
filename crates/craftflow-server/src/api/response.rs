//! Response envelope: `{success, data | error, timestamp}`.

use craftflow_models::time::now_rfc3339;
use serde::Serialize;

#[derive(Serialize, Debug)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: now_rfc3339(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            timestamp: now_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_envelope_shape() {
        let body = serde_json::to_value(ApiResponse::ok(serde_json::json!({"x": 1}))).unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["x"], 1);
        assert!(body.get("error").is_none());
        assert!(body["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn error_envelope_shape() {
        let body = serde_json::to_value(ApiResponse::<()>::error("boom")).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "boom");
        assert!(body.get("data").is_none());
    }
}
