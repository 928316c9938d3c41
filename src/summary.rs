//! # Run Summary
//!
//! Machine-readable run summary handed to downstream report generators:
//! counters, failure rate, per-category timings, breaker state, and the
//! final outcome. Written once at the end of every run, plus once for
//! dry runs describing what would have been dispatched.

use crate::error::Result;
use crate::persist;
use crate::resilience::BreakerSnapshot;
use crate::resource::CategoryStats;
use crate::types::{RunOutcome, RunState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub dry_run: bool,
    pub counters: RunState,
    /// Execution-failure rate over processed items (errors / processed).
    pub failure_rate: f64,
    /// Items recovered by the DLQ retry pass this run.
    pub recovered_on_retry: u64,
    /// Entries still queued in the DLQ at run end.
    pub dlq_remaining: usize,
    pub breaker: BreakerSnapshot,
    pub per_category: BTreeMap<String, CategoryStats>,
}

impl RunSummary {
    pub fn failure_rate_of(state: &RunState) -> f64 {
        let processed = state.processed();
        if processed == 0 {
            0.0
        } else {
            state.error as f64 / processed as f64
        }
    }

    /// Atomic publish, same discipline as the manifest.
    pub fn write(&self, path: &Path) -> Result<()> {
        persist::save_atomic(path, self, false)?;
        info!(
            path = %path.display(),
            outcome = ?self.outcome,
            success = self.counters.success,
            error = self.counters.error,
            "SUMMARY: run summary written"
        );
        Ok(())
    }
}

/// Marker artifact written on a circuit-breaker trip, consumed by
/// downstream automation to abort dependent pipeline stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaltMarker {
    pub run_id: Uuid,
    pub tripped_at: DateTime<Utc>,
    pub breaker: BreakerSnapshot,
}

impl HaltMarker {
    pub fn write(&self, path: &Path) -> Result<()> {
        persist::save_atomic(path, self, false)
    }
}
