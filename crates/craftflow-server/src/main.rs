use anyhow::Result;
use craftflow_engine::EngineConfig;
use craftflow_server::{ServeConfig, run_server};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServeConfig {
        db_path: std::env::var("CRAFTFLOW_DB").unwrap_or_else(|_| "craftflow.db".to_string()),
        addr: std::env::var("CRAFTFLOW_ADDR").unwrap_or_else(|_| "127.0.0.1:8700".to_string()),
        engine: EngineConfig::default(),
        mock_services: std::env::var("CRAFTFLOW_MOCK_SERVICES").is_ok(),
    };
    run_server(config).await
}
