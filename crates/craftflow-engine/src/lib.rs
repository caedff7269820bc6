//! Craftflow execution engine.
//!
//! Ties the task store to the outside world: a registry of workflow
//! factories, a graph engine that drives node sets with checkpoints and
//! quality-gated retry loops, a blocking executor for sync clients, and a
//! worker pool + dispatcher + lease supervisor for the async path, with a
//! webhook notifier reporting terminal transitions.

pub mod cancellations;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod graph;
pub mod node;
pub mod quality;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod services;
pub mod supervisor;
pub mod webhook;
pub mod worker;
pub mod workflows;

pub use cancellations::CancelRegistry;
pub use config::EngineConfig;
pub use error::{EngineError, NodeError};
pub use executor::{CreateTaskRequest, ExecutionError, ExecutionResult, SyncExecutor, TaskRunner};
pub use graph::{CompiledGraph, GraphBuilder, GraphEngine, Route};
pub use node::{NodeContext, WorkflowNode};
pub use queue::{QueueEnvelope, QueueStats, TaskQueue};
pub use registry::{WorkflowFactory, WorkflowMetadata, WorkflowRegistry};
pub use services::Services;
pub use webhook::WebhookNotifier;
pub use worker::WorkerPool;
