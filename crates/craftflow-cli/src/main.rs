//! Craftflow CLI: run the server, submit tasks, inspect and cancel them.
//!
//! Every command except `serve` talks to a running server over HTTP.
//! Exit code 0 on success, 1 on any error.

mod client;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use craftflow_engine::EngineConfig;
use craftflow_server::{ServeConfig, run_server};
use tracing_subscriber::EnvFilter;

use crate::client::ApiClient;

#[derive(Parser)]
#[command(name = "craftflow", about = "Durable AI content-pipeline orchestration", version)]
struct Cli {
    /// Server base URL for client commands.
    #[arg(long, global = true, env = "CRAFTFLOW_SERVER", default_value = "http://127.0.0.1:8700")]
    server: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the API server with its worker pool.
    Serve {
        /// Path of the embedded database file.
        #[arg(long, env = "CRAFTFLOW_DB", default_value = "craftflow.db")]
        db: String,
        /// Listen address.
        #[arg(long, env = "CRAFTFLOW_ADDR", default_value = "127.0.0.1:8700")]
        addr: String,
        /// Worker concurrency.
        #[arg(long)]
        workers: Option<usize>,
        /// Use deterministic mock services instead of HTTP endpoints.
        #[arg(long)]
        mock_services: bool,
    },
    /// Submit a task.
    Submit {
        /// Workflow type (see `craftflow workflows`).
        #[arg(long)]
        workflow: String,
        /// Workflow params as inline JSON, or @path to a JSON file.
        #[arg(long)]
        params: String,
        /// Execution mode.
        #[arg(long, default_value = "sync")]
        mode: String,
        #[arg(long)]
        idempotency_key: Option<String>,
        #[arg(long)]
        callback_url: Option<String>,
        /// Comma-separated webhook events (completed,failed,progress).
        #[arg(long)]
        callback_events: Option<String>,
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },
    /// Show a task's status and progress.
    Status { task_id: String },
    /// Fetch a completed task's result.
    Result { task_id: String },
    /// Cancel a pending or running task.
    Cancel { task_id: String },
    /// List tasks.
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: u64,
        #[arg(long, default_value_t = 20)]
        limit: u64,
    },
    /// List registered workflows.
    Workflows,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            db,
            addr,
            workers,
            mock_services,
        } => {
            let mut engine = EngineConfig::default();
            if let Some(workers) = workers {
                engine.worker_count = workers;
            }
            run_server(ServeConfig {
                db_path: db,
                addr,
                engine,
                mock_services,
            })
            .await
        }
        Command::Submit {
            workflow,
            params,
            mode,
            idempotency_key,
            callback_url,
            callback_events,
            priority,
        } => {
            let params = read_params(&params)?;
            let client = ApiClient::new(&cli.server);
            let value = client
                .submit(
                    &workflow,
                    &mode,
                    params,
                    idempotency_key,
                    callback_url,
                    callback_events,
                    priority,
                )
                .await?;
            print_json(&value)
        }
        Command::Status { task_id } => {
            let value = ApiClient::new(&cli.server).task_status(&task_id).await?;
            print_json(&value)
        }
        Command::Result { task_id } => {
            let value = ApiClient::new(&cli.server).task_result(&task_id).await?;
            print_json(&value)
        }
        Command::Cancel { task_id } => {
            let value = ApiClient::new(&cli.server).cancel(&task_id).await?;
            print_json(&value)
        }
        Command::List {
            status,
            page,
            limit,
        } => {
            let value = ApiClient::new(&cli.server)
                .list(status.as_deref(), page, limit)
                .await?;
            print_json(&value)
        }
        Command::Workflows => {
            let value = ApiClient::new(&cli.server).workflows().await?;
            print_json(&value)
        }
    }
}

/// Inline JSON, or `@file` to load from disk.
fn read_params(raw: &str) -> Result<serde_json::Value> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)?,
        None => raw.to_string(),
    };
    match serde_json::from_str(&text) {
        Ok(value) => Ok(value),
        Err(e) => bail!("params is not valid JSON: {e}"),
    }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
