//! # Worker Contract
//!
//! The injected transformation seam. The orchestration core is agnostic to
//! what a worker does: it dispatches `WorkItem`s, enforces timeouts, and
//! classifies outcomes. Workers share no mutable state with each other or
//! the coordinator; each execution context gets its own worker instance
//! from the factory, created once per context lifetime (the expensive
//! one-time setup) and recycled after `max_tasks_per_child` dispatches.

use crate::error::Result;
use crate::types::WorkItem;
use async_trait::async_trait;
use std::path::PathBuf;

/// Successful output of one transformation.
#[derive(Debug, Clone, Default)]
pub struct WorkOutput {
    /// Artifact produced for this item, recorded in the manifest.
    pub output_path: Option<PathBuf>,
    /// Business-validation failure on an otherwise successful execution.
    /// Feeds the quality circuit breaker; does not fail the task.
    pub quality_failure: bool,
    /// Non-fatal condition worth surfacing; downgrades the result to
    /// `Warning` status.
    pub warning: Option<String>,
}

/// Domain errors a worker may return. No panic or foreign error type ever
/// crosses the worker/coordinator boundary.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Retryable domain failure; routed to the DLQ as `Exception`.
    #[error("{0}")]
    Transient(String),
    /// Terminal failure: the input is structurally unusable and must never
    /// be retried. Routed to the DLQ as `PermanentReject`.
    #[error("permanent: {0}")]
    Permanent(String),
}

/// The caller-supplied transformation, a pure function of the item and
/// static configuration.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn process(&self, item: &WorkItem) -> std::result::Result<WorkOutput, WorkerError>;
}

/// Creates worker instances. `create` runs the expensive one-time setup
/// (loading a model, compiling patterns) and is invoked once per execution
/// context lifetime, plus once per recycle.
pub trait WorkerFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Worker>>;
}
