//! Built-in reference workflows.

pub mod content_creator;
pub mod translation;
