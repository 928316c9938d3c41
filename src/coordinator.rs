//! # Run Coordinator
//!
//! Owns the full control flow of one batch run: enumerate inputs, filter
//! through the manifest (and checkpoint on resume), dispatch admitted items
//! through the worker pool, route every result to the manifest/checkpoint
//! or DLQ/circuit breaker, run the DLQ retry pass, and publish the run
//! summary. All shared-state mutation happens here, after a result is
//! received. Single-writer, so no locks are needed on the manifest,
//! checkpoint, or counters.

use crate::admission::AdmissionController;
use crate::checkpoint::CheckpointManager;
use crate::config::ConveyorConfig;
use crate::dlq::DeadLetterQueue;
use crate::error::{ConveyorError, Result};
use crate::manifest::StateManifest;
use crate::pool::{WorkerFactory, WorkerPool};
use crate::resilience::QualityCircuitBreaker;
use crate::resource::{MemoryProbe, ResourceTracker};
use crate::summary::{HaltMarker, RunSummary};
use crate::types::{FailureReason, ResourceDelta, RunOutcome, RunState, TaskResult, WorkItem};
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Per-invocation options, set by the CLI layer.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub input_dir: PathBuf,
    /// Resume a crashed run from its checkpoint.
    pub resume: bool,
    /// Reprocess items even when the manifest says they are unchanged.
    pub force: bool,
    /// Report what would be dispatched without running anything.
    pub dry_run: bool,
    /// Drop manifest entries whose source files no longer exist.
    pub prune_deleted: bool,
    /// Treat a run with warnings as a partial failure.
    pub fail_on_warn: bool,
}

/// Fires once per item per run, on primary-pass completion. Intended for
/// append-only progress reporting.
pub type ProgressCallback = Box<dyn Fn(&TaskResult) + Send + Sync>;

#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub state: RunState,
    pub summary: RunSummary,
}

pub struct RunCoordinator {
    config: ConveyorConfig,
    admission: Arc<AdmissionController>,
    pool: WorkerPool,
    progress: Option<ProgressCallback>,
}

impl RunCoordinator {
    pub fn new(
        config: ConveyorConfig,
        factory: Arc<dyn WorkerFactory>,
        probe: Arc<dyn MemoryProbe>,
    ) -> Result<Self> {
        config.validate()?;
        let admission = Arc::new(AdmissionController::new(
            config.admission.clone(),
            Arc::clone(&probe),
        ));
        let pool = WorkerPool::new(config.pool.clone(), factory, probe);
        Ok(Self {
            config,
            admission,
            pool,
            progress: None,
        })
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Execute one run end to end. Only startup-time corruption errors
    /// escape as `Err`; every per-task failure is captured in the report.
    pub async fn run(&self, options: &RunOptions) -> Result<RunReport> {
        let started_at = Utc::now();
        let state_paths = self.config.state.clone();
        let fingerprint = self.config.fingerprint();

        // Startup loads: the only point where corruption may abort the run.
        let mut manifest = StateManifest::load(&state_paths.manifest_path())?;
        let mut dlq = DeadLetterQueue::load(
            &state_paths.dlq_path(),
            &state_paths.dlq_log_path(),
            self.config.dlq.clone(),
        )?;
        let mut checkpoint = if options.resume {
            CheckpointManager::resume(
                state_paths.checkpoint_path(),
                self.config.checkpoint.clone(),
                fingerprint,
            )?
        } else {
            if CheckpointManager::load(&state_paths.checkpoint_path())?.is_some() {
                warn!(
                    "COORDINATOR: stale checkpoint from an incomplete run exists; \
                     starting fresh (use --resume to continue it)"
                );
            }
            CheckpointManager::start_fresh(
                state_paths.checkpoint_path(),
                self.config.checkpoint.clone(),
                fingerprint,
            )
        };
        let run_id = checkpoint.run_id();
        remove_stale_marker(&state_paths.halt_marker_path())?;

        // Enumeration and cross-run filtering, strictly before admission.
        let all_items = self.enumerate(&options.input_dir)?;
        let existing_ids: BTreeSet<String> =
            all_items.iter().map(|item| item.id.clone()).collect();

        if options.prune_deleted {
            let removed = manifest.prune(&existing_ids);
            info!(removed, "COORDINATOR: manifest pruned");
            manifest.save()?;
        }

        let mut run_state = RunState {
            total: all_items.len() as u64,
            ..RunState::default()
        };

        let mut planned: Vec<WorkItem> = Vec::new();
        let mut backfilled = 0usize;
        for item in all_items {
            if !manifest.should_process(&item, options.force) {
                run_state.skipped += 1;
                continue;
            }
            if options.resume && checkpoint.is_completed(&item.id) {
                // Completed before the crash but never published to the
                // manifest; record it now so the resumed run's manifest
                // matches a from-scratch run and later runs skip it.
                let attempt = manifest
                    .get(&item.id)
                    .map(|entry| entry.attempt_count)
                    .unwrap_or(1)
                    .max(1);
                manifest.record_success(&item, None, run_id, attempt);
                backfilled += 1;
                run_state.skipped += 1;
                continue;
            }
            planned.push(item);
        }
        if backfilled > 0 {
            info!(
                backfilled,
                "COORDINATOR: manifest backfilled from checkpoint completions"
            );
            manifest.save()?;
        }

        info!(
            run_id = %run_id,
            total = run_state.total,
            skipped = run_state.skipped,
            planned = planned.len(),
            "COORDINATOR: enumeration complete"
        );

        let mut tracker = ResourceTracker::new();
        let mut breaker = QualityCircuitBreaker::new(self.config.breaker.clone());

        if options.dry_run {
            info!(
                planned = planned.len(),
                "COORDINATOR: dry run, nothing dispatched"
            );
            let summary = self.build_summary(
                run_id,
                started_at,
                RunOutcome::Clean,
                true,
                run_state.clone(),
                0,
                dlq.len(),
                &breaker,
                &tracker,
            );
            summary.write(&state_paths.summary_path())?;
            return Ok(RunReport {
                outcome: RunOutcome::Clean,
                state: run_state,
                summary,
            });
        }

        // Primary dispatch.
        let items_by_id: HashMap<String, WorkItem> = planned
            .iter()
            .map(|item| (item.id.clone(), item.clone()))
            .collect();
        let dispatches: Vec<(WorkItem, u32)> = planned
            .into_iter()
            .map(|item| {
                let attempt = manifest
                    .get(&item.id)
                    .map(|entry| entry.attempt_count + 1)
                    .unwrap_or(1);
                (item, attempt)
            })
            .collect();

        let mut resource_unavailable = 0u64;
        let mut handle = self
            .pool
            .spawn_batch(dispatches, Arc::clone(&self.admission), 1.0);

        while let Some(result) = handle.next_result().await {
            tracker.record(&result);
            run_state.observe(&result);
            if let Some(callback) = &self.progress {
                callback(&result);
            }

            let admission_failure =
                result.failure_reason == Some(FailureReason::ResourceUnavailable);

            let Some(item) = items_by_id.get(&result.item_id) else {
                warn!(item_id = %result.item_id, "COORDINATOR: result for unknown item");
                continue;
            };

            if result.is_success() {
                manifest.record_success(
                    item,
                    result.output_path.clone(),
                    run_id,
                    result.attempt,
                );
                // Manifest and checkpoint persist on the same cadence so a
                // crash never leaves the checkpoint ahead of the manifest.
                if checkpoint.record_done(&item.id)? {
                    manifest.save()?;
                }
                dlq.discard_resolved(&item.id)?;
            } else {
                let reason = result.failure_reason.unwrap_or(FailureReason::Exception);
                let detail = result.detail.clone().unwrap_or_default();
                manifest.record_failure(item, run_id, reason.name());
                match reason {
                    FailureReason::ResourceUnavailable => {
                        // Not a DLQ reason: the item stays eligible via the
                        // manifest and is picked up by the next run.
                        resource_unavailable += 1;
                    }
                    _ => dlq.enqueue(item, reason, &detail, result.attempt)?,
                }
            }

            // Items that never reached a worker do not count toward the
            // quality ratio.
            if !admission_failure
                && breaker.observe(result.quality_failure)
                && !handle.is_halted()
            {
                run_state.circuit_breaker_tripped = true;
                handle.halt();
                HaltMarker {
                    run_id,
                    tripped_at: Utc::now(),
                    breaker: breaker.snapshot(),
                }
                .write(&state_paths.halt_marker_path())?;
            }
        }

        manifest.save()?;
        checkpoint.save()?;

        // DLQ retry pass, never interleaved with primary dispatch.
        let retry_items: HashMap<String, WorkItem> = dlq
            .entries()
            .map(|entry| (entry.item.id.clone(), entry.item.clone()))
            .collect();
        let admission = Arc::clone(&self.admission);
        let pool = &self.pool;
        let retry_results = dlq
            .drain(|item, attempt, scale| {
                let admission = Arc::clone(&admission);
                async move {
                    match admission.admit(&item, scale).await {
                        Ok(timeout) => pool.process_single(item, timeout, attempt).await,
                        Err(ConveyorError::ResourceUnavailable {
                            required_bytes,
                            waited_ms,
                            ..
                        }) => TaskResult::failure(
                            &item,
                            attempt,
                            ResourceDelta {
                                wall_time_ms: waited_ms,
                                rss_delta_bytes: 0,
                            },
                            FailureReason::ResourceUnavailable,
                            format!(
                                "retry admission timed out after {waited_ms}ms \
                                 waiting for {required_bytes} bytes"
                            ),
                        ),
                        Err(other) => TaskResult::failure(
                            &item,
                            attempt,
                            ResourceDelta::default(),
                            FailureReason::Exception,
                            other.to_string(),
                        ),
                    }
                }
            })
            .await?;

        let mut recovered = 0u64;
        for result in &retry_results {
            tracker.record(result);
            if result.is_success() {
                recovered += 1;
                if let Some(item) = retry_items.get(&result.item_id) {
                    manifest.record_success(
                        item,
                        result.output_path.clone(),
                        run_id,
                        result.attempt,
                    );
                    if checkpoint.record_done(&result.item_id)? {
                        manifest.save()?;
                    }
                }
            }
        }
        if !retry_results.is_empty() {
            info!(
                retried = retry_results.len(),
                recovered, "COORDINATOR: DLQ retry pass finished"
            );
            manifest.save()?;
        }

        // Outcome and teardown. A breaker halt leaves the checkpoint intact
        // so operators can resume after investigation.
        let halted = run_state.circuit_breaker_tripped;
        let outcome = if halted {
            RunOutcome::BreakerHalt
        } else if !dlq.is_empty()
            || resource_unavailable > 0
            || (options.fail_on_warn && run_state.warning > 0)
        {
            RunOutcome::PartialFailure
        } else {
            RunOutcome::Clean
        };

        if halted {
            checkpoint.save()?;
        } else {
            checkpoint.clear()?;
        }

        let summary = self.build_summary(
            run_id,
            started_at,
            outcome,
            false,
            run_state.clone(),
            recovered,
            dlq.len(),
            &breaker,
            &tracker,
        );
        summary.write(&state_paths.summary_path())?;

        info!(
            run_id = %run_id,
            outcome = ?outcome,
            success = run_state.success,
            warning = run_state.warning,
            error = run_state.error,
            dlq_remaining = dlq.len(),
            "COORDINATOR: run finished"
        );

        Ok(RunReport {
            outcome,
            state: run_state,
            summary,
        })
    }

    /// Walk the input tree in stable filename order and build immutable
    /// work items: identity, size, derived category, content hash.
    fn enumerate(&self, input_dir: &Path) -> Result<Vec<WorkItem>> {
        let mut items = Vec::new();
        for entry in WalkDir::new(input_dir).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let io = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("walk error"));
                ConveyorError::io(input_dir, io)
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let size_bytes = entry
                .metadata()
                .map_err(|e| {
                    let io = e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("metadata error"));
                    ConveyorError::io(path, io)
                })?
                .len();
            let id = path
                .strip_prefix(input_dir)
                .unwrap_or(path)
                .to_string_lossy()
                .into_owned();
            let content_hash =
                WorkItem::hash_contents(path).map_err(|e| ConveyorError::io(path, e))?;
            items.push(WorkItem::new(
                id,
                path,
                size_bytes,
                self.config.admission.classify(size_bytes),
                content_hash,
            ));
        }
        info!(
            input_dir = %input_dir.display(),
            items = items.len(),
            "COORDINATOR: input enumeration finished"
        );
        Ok(items)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_summary(
        &self,
        run_id: uuid::Uuid,
        started_at: chrono::DateTime<Utc>,
        outcome: RunOutcome,
        dry_run: bool,
        counters: RunState,
        recovered_on_retry: u64,
        dlq_remaining: usize,
        breaker: &QualityCircuitBreaker,
        tracker: &ResourceTracker,
    ) -> RunSummary {
        RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            outcome,
            dry_run,
            failure_rate: RunSummary::failure_rate_of(&counters),
            counters,
            recovered_on_retry,
            dlq_remaining,
            breaker: breaker.snapshot(),
            per_category: tracker.snapshot(),
        }
    }
}

fn remove_stale_marker(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            info!(path = %path.display(), "COORDINATOR: removed stale halt marker");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ConveyorError::io(path, e)),
    }
}
