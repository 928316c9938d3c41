//! # Dead-Letter Queue
//!
//! Durable store of failed work items with enough metadata to retry or
//! inspect them later. Failures are classified into a closed reason set;
//! `PermanentReject` is terminal and never retried, every other reason gets
//! exactly one retry per `drain()` call, with a timeout scaled per size
//! category. Entries that fail again stay queued for the next run's drain.
//!
//! Two artifacts: an atomic snapshot (`dlq.json`, the queue state) and an
//! append-only JSONL event log (`dlq.log`, the human-auditable trail).

use crate::config::DlqConfig;
use crate::error::{ConveyorError, Result};
use crate::persist;
use crate::types::{FailureReason, TaskResult, WorkItem};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One queued failure. Attempt count is monotonically non-decreasing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub item: WorkItem,
    pub reason: FailureReason,
    pub detail: String,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
    /// Copy of the offending input, when the coordinator quarantined one.
    pub quarantine_path: Option<PathBuf>,
}

/// Append-only audit record, one JSONL line per queue mutation.
#[derive(Debug, Serialize, Deserialize)]
struct DlqEvent<'a> {
    at: DateTime<Utc>,
    event: &'a str,
    item_id: &'a str,
    reason: &'a str,
    attempt_count: u32,
    detail: &'a str,
}

pub struct DeadLetterQueue {
    snapshot_path: PathBuf,
    log_path: PathBuf,
    config: DlqConfig,
    entries: BTreeMap<String, DlqEntry>,
}

impl DeadLetterQueue {
    /// Load the queue left by prior runs, or start empty.
    pub fn load(snapshot_path: &Path, log_path: &Path, config: DlqConfig) -> Result<Self> {
        let entries: BTreeMap<String, DlqEntry> = persist::load_with_backup(snapshot_path)
            .map_err(|detail| {
                ConveyorError::InvalidState(format!(
                    "DLQ snapshot unreadable at {}: {detail}",
                    snapshot_path.display()
                ))
            })?
            .unwrap_or_default();

        if !entries.is_empty() {
            info!(
                entries = entries.len(),
                "DLQ: loaded queued failures from prior runs"
            );
        }
        Ok(Self {
            snapshot_path: snapshot_path.to_path_buf(),
            log_path: log_path.to_path_buf(),
            config,
            entries,
        })
    }

    /// Record a failed item. An existing entry for the same item is
    /// replaced, keeping the larger attempt count.
    pub fn enqueue(
        &mut self,
        item: &WorkItem,
        reason: FailureReason,
        detail: &str,
        attempt_count: u32,
    ) -> Result<()> {
        let attempt_count = self
            .entries
            .get(&item.id)
            .map(|e| e.attempt_count.max(attempt_count))
            .unwrap_or(attempt_count);

        warn!(
            item_id = %item.id,
            reason = reason.name(),
            attempt_count,
            "DLQ: item enqueued"
        );

        self.entries.insert(
            item.id.clone(),
            DlqEntry {
                item: item.clone(),
                reason,
                detail: detail.to_string(),
                enqueued_at: Utc::now(),
                attempt_count,
                quarantine_path: None,
            },
        );
        self.append_event("enqueued", &item.id, reason, attempt_count, detail)?;
        self.save()
    }

    /// Retry every retryable entry exactly once, routing each through
    /// `retry_fn(item, next_attempt, timeout_scale)`. Successful retries are
    /// removed and surfaced in the returned results; repeat failures stay
    /// queued with an incremented attempt count. `PermanentReject` entries
    /// are never passed to `retry_fn`.
    pub async fn drain<F, Fut>(&mut self, mut retry_fn: F) -> Result<Vec<TaskResult>>
    where
        F: FnMut(WorkItem, u32, f64) -> Fut,
        Fut: Future<Output = TaskResult>,
    {
        let candidates: Vec<DlqEntry> = self
            .entries
            .values()
            .filter(|e| e.reason.is_retryable())
            .cloned()
            .collect();

        if candidates.is_empty() {
            debug!("DLQ: nothing to drain");
            return Ok(Vec::new());
        }

        info!(candidates = candidates.len(), "DLQ: starting retry pass");
        let mut results = Vec::with_capacity(candidates.len());

        for entry in candidates {
            let next_attempt = entry.attempt_count + 1;
            let scale = self.config.retry_scale(entry.item.category);
            let result = retry_fn(entry.item.clone(), next_attempt, scale).await;

            if result.is_success() {
                self.resolve(&entry.item.id)?;
            } else {
                self.record_retry_failure(&entry.item.id, &result)?;
            }
            results.push(result);
        }

        self.save()?;
        Ok(results)
    }

    /// Drop a queued entry whose item succeeded outside the retry pass,
    /// typically on the next run's primary dispatch.
    pub fn discard_resolved(&mut self, item_id: &str) -> Result<()> {
        if let Some(entry) = self.entries.remove(item_id) {
            info!(item_id, "DLQ: entry resolved outside retry pass");
            self.append_event(
                "resolved",
                item_id,
                entry.reason,
                entry.attempt_count,
                "succeeded on primary dispatch",
            )?;
            self.save()?;
        }
        Ok(())
    }

    /// Remove an entry after a successful retry.
    fn resolve(&mut self, item_id: &str) -> Result<()> {
        if let Some(entry) = self.entries.remove(item_id) {
            info!(item_id, attempt_count = entry.attempt_count + 1, "DLQ: retry succeeded");
            self.append_event(
                "resolved",
                item_id,
                entry.reason,
                entry.attempt_count + 1,
                "retry succeeded",
            )?;
        }
        Ok(())
    }

    /// Keep a failed retry queued for the next run's drain.
    fn record_retry_failure(&mut self, item_id: &str, result: &TaskResult) -> Result<()> {
        let Some(entry) = self.entries.get_mut(item_id) else {
            return Ok(());
        };
        entry.attempt_count += 1;
        entry.enqueued_at = Utc::now();
        if let Some(reason) = result.failure_reason {
            entry.reason = reason;
        }
        if let Some(detail) = &result.detail {
            entry.detail = detail.clone();
        }
        let (reason, attempt, detail) = (entry.reason, entry.attempt_count, entry.detail.clone());
        warn!(item_id, attempt_count = attempt, "DLQ: retry failed, staying queued");
        self.append_event("retry_failed", item_id, reason, attempt, &detail)
    }

    fn append_event(
        &self,
        event: &str,
        item_id: &str,
        reason: FailureReason,
        attempt_count: u32,
        detail: &str,
    ) -> Result<()> {
        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConveyorError::io(parent, e))?;
        }
        let record = DlqEvent {
            at: Utc::now(),
            event,
            item_id,
            reason: reason.name(),
            attempt_count,
            detail,
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|e| ConveyorError::io(&self.log_path, e))?;
        file.write_all(&line)
            .map_err(|e| ConveyorError::io(&self.log_path, e))
    }

    fn save(&self) -> Result<()> {
        persist::save_atomic(&self.snapshot_path, &self.entries, true)
    }

    pub fn get(&self, item_id: &str) -> Option<&DlqEntry> {
        self.entries.get(item_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &DlqEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
