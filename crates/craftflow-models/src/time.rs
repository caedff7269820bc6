//! Timestamp helpers.

use chrono::Utc;

/// Current wall-clock time as epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current wall-clock time as an RFC 3339 string (webhook payloads, API envelopes).
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}
