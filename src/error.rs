//! # Structured Error Handling
//!
//! Closed error taxonomy for the orchestration core. Per-task failures are
//! captured at the worker pool boundary and converted into `TaskResult`s;
//! only startup-time corruption errors are allowed to abort a run before
//! dispatch begins.

use std::path::PathBuf;

/// Top-level error type for the orchestration core.
#[derive(Debug, thiserror::Error)]
pub enum ConveyorError {
    /// Admission wait exceeded its configured maximum. Recoverable: the item
    /// is surfaced as a failed result and picked up by the next run.
    #[error("resources unavailable for {item_id}: waited {waited_ms}ms for {required_bytes} bytes")]
    ResourceUnavailable {
        item_id: String,
        required_bytes: u64,
        waited_ms: u64,
    },

    /// Task exceeded its adaptive deadline. Retryable via the DLQ.
    #[error("task {item_id} timed out after {timeout_ms}ms")]
    TaskTimeout { item_id: String, timeout_ms: u64 },

    /// Worker function returned a domain error. Retryable unless marked permanent.
    #[error("task {item_id} failed: {message}")]
    TaskException { item_id: String, message: String },

    /// The execution context died without returning a result. Retryable.
    #[error("worker crashed while processing {item_id}: {detail}")]
    WorkerCrash { item_id: String, detail: String },

    /// Explicit terminal failure. Never retried.
    #[error("task {item_id} permanently rejected: {message}")]
    PermanentReject { item_id: String, message: String },

    /// Checkpoint file exists but cannot be parsed, and no usable backup was
    /// found. Fatal at startup.
    #[error("checkpoint corrupted at {path}: {detail}")]
    CheckpointCorruption { path: PathBuf, detail: String },

    /// Manifest file exists but cannot be parsed, and no usable backup was
    /// found. Fatal at startup.
    #[error("manifest corrupted at {path}: {detail}")]
    ManifestCorruption { path: PathBuf, detail: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConveyorError {
    /// Wrap an I/O error with the path that produced it.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error may abort the whole run before dispatch begins.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            Self::CheckpointCorruption { .. }
                | Self::ManifestCorruption { .. }
                | Self::Configuration(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ConveyorError>;
