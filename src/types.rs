//! # Core Value Types
//!
//! Work items, task results, and run-level state shared across the
//! orchestration core. `WorkItem` and `TaskResult` are value objects passed
//! across the pool boundary by clone; they are never mutated after creation.
//! `RunState` is owned exclusively by the coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Size classification for a work item, derived once at enumeration time
/// against configurable byte thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeCategory {
    Small,
    Medium,
    Large,
}

impl SizeCategory {
    pub fn classify(size_bytes: u64, small_max_bytes: u64, medium_max_bytes: u64) -> Self {
        if size_bytes <= small_max_bytes {
            SizeCategory::Small
        } else if size_bytes <= medium_max_bytes {
            SizeCategory::Medium
        } else {
            SizeCategory::Large
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SizeCategory::Small => "small",
            SizeCategory::Medium => "medium",
            SizeCategory::Large => "large",
        }
    }

    pub fn all() -> [SizeCategory; 3] {
        [SizeCategory::Small, SizeCategory::Medium, SizeCategory::Large]
    }
}

/// A single unit of work. Created at enumeration time; immutable thereafter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Stable identity, the path string relative to the input root.
    pub id: String,
    /// Absolute path to the input file.
    pub path: PathBuf,
    pub size_bytes: u64,
    pub category: SizeCategory,
    /// Content hash computed at enumeration time, used by the manifest for
    /// skip-if-unchanged decisions.
    pub content_hash: String,
}

impl WorkItem {
    pub fn new(
        id: impl Into<String>,
        path: impl Into<PathBuf>,
        size_bytes: u64,
        category: SizeCategory,
        content_hash: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            size_bytes,
            category,
            content_hash: content_hash.into(),
        }
    }

    /// Hash file contents for manifest comparison.
    pub fn hash_contents(path: &Path) -> std::io::Result<String> {
        let bytes = std::fs::read(path)?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }
}

/// Execution status of a single dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Warning,
    Error,
}

/// Closed classification of task failures. `PermanentReject` is terminal and
/// never retried; `ResourceUnavailable` is recoverable across runs but is not
/// a DLQ reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    Exception,
    WorkerCrash,
    PermanentReject,
    ResourceUnavailable,
}

impl FailureReason {
    /// Whether the DLQ retry pass may attempt this failure again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureReason::Timeout | FailureReason::Exception | FailureReason::WorkerCrash
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            FailureReason::Timeout => "timeout",
            FailureReason::Exception => "exception",
            FailureReason::WorkerCrash => "worker_crash",
            FailureReason::PermanentReject => "permanent_reject",
            FailureReason::ResourceUnavailable => "resource_unavailable",
        }
    }
}

/// Observed resource usage for a single dispatch attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDelta {
    pub wall_time_ms: u64,
    /// Change in process resident set size across the attempt. Negative when
    /// the allocator returned memory mid-run.
    pub rss_delta_bytes: i64,
}

/// Outcome of one dispatch attempt. Created once per attempt; never mutated,
/// only appended to logs and queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub item_id: String,
    pub status: TaskStatus,
    pub category: SizeCategory,
    pub attempt: u32,
    pub resources: ResourceDelta,
    /// Present only when `status == Error`.
    pub failure_reason: Option<FailureReason>,
    /// Human-readable detail for failures and warnings.
    pub detail: Option<String>,
    /// Business-level validation failure, orthogonal to execution status.
    /// Feeds the quality circuit breaker.
    pub quality_failure: bool,
    /// Output artifact recorded in the manifest on success.
    pub output_path: Option<PathBuf>,
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn success(
        item: &WorkItem,
        attempt: u32,
        resources: ResourceDelta,
        output_path: Option<PathBuf>,
    ) -> Self {
        Self {
            item_id: item.id.clone(),
            status: TaskStatus::Success,
            category: item.category,
            attempt,
            resources,
            failure_reason: None,
            detail: None,
            quality_failure: false,
            output_path,
            completed_at: Utc::now(),
        }
    }

    pub fn failure(
        item: &WorkItem,
        attempt: u32,
        resources: ResourceDelta,
        reason: FailureReason,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            item_id: item.id.clone(),
            status: TaskStatus::Error,
            category: item.category,
            attempt,
            resources,
            failure_reason: Some(reason),
            detail: Some(detail.into()),
            quality_failure: false,
            output_path: None,
            completed_at: Utc::now(),
        }
    }

    pub fn with_quality_failure(mut self, quality_failure: bool) -> Self {
        self.quality_failure = quality_failure;
        self
    }

    pub fn with_warning(mut self, detail: impl Into<String>) -> Self {
        self.status = TaskStatus::Warning;
        self.detail = Some(detail.into());
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, TaskStatus::Success | TaskStatus::Warning)
    }

    pub fn wall_time(&self) -> Duration {
        Duration::from_millis(self.resources.wall_time_ms)
    }
}

/// Per-run counters, owned exclusively by the coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunState {
    pub total: u64,
    pub skipped: u64,
    pub success: u64,
    pub warning: u64,
    pub error: u64,
    pub quality_failures: u64,
    pub circuit_breaker_tripped: bool,
}

impl RunState {
    pub fn observe(&mut self, result: &TaskResult) {
        match result.status {
            TaskStatus::Success => self.success += 1,
            TaskStatus::Warning => self.warning += 1,
            TaskStatus::Error => self.error += 1,
        }
        if result.quality_failure {
            self.quality_failures += 1;
        }
    }

    pub fn processed(&self) -> u64 {
        self.success + self.warning + self.error
    }
}

/// Terminal status of a run, mapped onto process exit codes for downstream
/// automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// All dispatched items succeeded and the DLQ is empty.
    Clean,
    /// Some items failed (non-empty DLQ) or warnings with `--fail-on-warn`.
    PartialFailure,
    /// The quality circuit breaker halted dispatch.
    BreakerHalt,
}

impl RunOutcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::Clean => 0,
            RunOutcome::PartialFailure => 1,
            RunOutcome::BreakerHalt => 2,
        }
    }
}
