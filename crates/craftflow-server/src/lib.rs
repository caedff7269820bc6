//! HTTP surface and process bootstrap for Craftflow.

pub mod api;

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use craftflow_engine::services::http::{
    EndpointConfig, HttpImageService, HttpLlmService, HttpSearchService,
};
use craftflow_engine::services::mock::{MockImage, MockLlm, MockSearch};
use craftflow_engine::{
    CancelRegistry, EngineConfig, Services, SyncExecutor, TaskQueue, WorkerPool, WorkflowRegistry,
};
use craftflow_storage::Storage;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use api::{AppState, build_router};

/// Everything `serve` needs.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub db_path: String,
    pub addr: String,
    pub engine: EngineConfig,
    /// Use deterministic in-process service doubles instead of HTTP
    /// endpoints (local development).
    pub mock_services: bool,
}

/// Build service adapters from the environment, or mocks when requested.
///
/// Env surface: `CRAFTFLOW_LLM_BASE_URL`, `CRAFTFLOW_LLM_API_KEY`,
/// `CRAFTFLOW_LLM_MODEL`, `CRAFTFLOW_SEARCH_BASE_URL`,
/// `CRAFTFLOW_IMAGE_BASE_URL`.
pub fn build_services(mock: bool) -> Result<Services> {
    if mock {
        info!("Using mock external services");
        return Ok(Services::new(
            Arc::new(MockLlm::new()),
            Arc::new(MockSearch::new()),
            Arc::new(MockImage::new()),
        ));
    }

    let llm_base = std::env::var("CRAFTFLOW_LLM_BASE_URL")
        .map_err(|_| anyhow!("CRAFTFLOW_LLM_BASE_URL is required (or pass --mock-services)"))?;
    let search_base = std::env::var("CRAFTFLOW_SEARCH_BASE_URL")
        .map_err(|_| anyhow!("CRAFTFLOW_SEARCH_BASE_URL is required (or pass --mock-services)"))?;
    let image_base = std::env::var("CRAFTFLOW_IMAGE_BASE_URL")
        .map_err(|_| anyhow!("CRAFTFLOW_IMAGE_BASE_URL is required (or pass --mock-services)"))?;

    let mut llm_config = EndpointConfig::new(llm_base);
    if let Ok(key) = std::env::var("CRAFTFLOW_LLM_API_KEY") {
        llm_config = llm_config.with_api_key(key);
    }
    if let Ok(model) = std::env::var("CRAFTFLOW_LLM_MODEL") {
        llm_config = llm_config.with_model(model);
    }

    Ok(Services::new(
        Arc::new(HttpLlmService::new(llm_config).map_err(|e| anyhow!("{e}"))?),
        Arc::new(
            HttpSearchService::new(EndpointConfig::new(search_base)).map_err(|e| anyhow!("{e}"))?,
        ),
        Arc::new(
            HttpImageService::new(EndpointConfig::new(image_base)).map_err(|e| anyhow!("{e}"))?,
        ),
    ))
}

/// Run the full stack (API + worker pool + dispatcher + lease supervisor)
/// until ctrl-c, then shut down gracefully.
pub async fn run_server(config: ServeConfig) -> Result<()> {
    let storage = Arc::new(Storage::open(&config.db_path)?);
    let registry = Arc::new(WorkflowRegistry::with_builtins());
    let services = build_services(config.mock_services)?;
    let engine_config = Arc::new(config.engine.clone());
    let queue = Arc::new(TaskQueue::new());
    let cancellations = Arc::new(CancelRegistry::new());
    let server_cancel = CancellationToken::new();

    let executor = Arc::new(SyncExecutor::new(
        storage.clone(),
        registry.clone(),
        services.clone(),
        engine_config.clone(),
        cancellations.clone(),
    ));
    let pool = Arc::new(WorkerPool::new(
        storage.clone(),
        registry.clone(),
        services,
        engine_config,
        queue.clone(),
        cancellations.clone(),
    ));
    pool.start().await;

    let state = AppState {
        storage,
        registry,
        executor,
        queue,
        cancellations,
        async_enabled: true,
        server_cancel: server_cancel.clone(),
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.addr)
        .await
        .with_context(|| format!("failed to bind {}", config.addr))?;
    info!(addr = %config.addr, db = %config.db_path, "Craftflow server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    server_cancel.cancel();
    pool.shutdown().await;
    info!("Server stopped");
    Ok(())
}
