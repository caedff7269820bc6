//! Shared data model for the Craftflow orchestration engine.
//!
//! Pure types only: no I/O, no async. Everything here is JSON-serializable
//! and round-trips losslessly through the storage layer and the HTTP surface.

pub mod error;
pub mod quality;
pub mod result;
pub mod state;
pub mod task;
pub mod time;
pub mod webhook;

pub use error::ErrorKind;
pub use quality::{HardConstraints, QualityReport};
pub use result::{ResultContent, ResultRecord};
pub use state::{StateBase, StatePatch, WorkflowState};
pub use task::{CallbackEvent, NewTask, Task, TaskMode, TaskStatus};
pub use time::now_ms;
pub use webhook::{WebhookError, WebhookPayload, WebhookResult};
