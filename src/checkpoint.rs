//! # Checkpoint Management
//!
//! Per-run crash recovery. The checkpoint file holds the set of item ids
//! completed so far; its presence implies an incomplete or crashed run, its
//! absence means "never run" or "completed cleanly". Saves happen on a
//! cadence (every N completions or T milliseconds), not on every single
//! completion, and always via atomic publish with a `.bak` fallback.

use crate::config::CheckpointConfig;
use crate::error::{ConveyorError, Result};
use crate::persist;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Persisted progress of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Fingerprint of the configuration the run started under.
    pub config_fingerprint: String,
    pub completed: BTreeSet<String>,
}

impl CheckpointRecord {
    fn new(config_fingerprint: String) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            config_fingerprint,
            completed: BTreeSet::new(),
        }
    }
}

pub struct CheckpointManager {
    path: PathBuf,
    config: CheckpointConfig,
    record: CheckpointRecord,
    unsaved_completions: usize,
    last_save: Instant,
}

impl CheckpointManager {
    /// Load the checkpoint left by a crashed run, if any. A file that fails
    /// to parse (after `.bak` fallback) is a fatal startup error, distinct
    /// from "no checkpoint".
    pub fn load(path: &Path) -> Result<Option<CheckpointRecord>> {
        persist::load_with_backup(path).map_err(|detail| ConveyorError::CheckpointCorruption {
            path: path.to_path_buf(),
            detail,
        })
    }

    /// Start a fresh run with an empty completed set.
    pub fn start_fresh(path: PathBuf, config: CheckpointConfig, config_fingerprint: String) -> Self {
        let record = CheckpointRecord::new(config_fingerprint);
        info!(run_id = %record.run_id, path = %path.display(), "CHECKPOINT: starting fresh run");
        Self {
            path,
            config,
            record,
            unsaved_completions: 0,
            last_save: Instant::now(),
        }
    }

    /// Resume from an existing checkpoint when present, otherwise start
    /// fresh. A configuration change since the crashed run is tolerated but
    /// logged, since adaptive timeouts and thresholds may differ.
    pub fn resume(
        path: PathBuf,
        config: CheckpointConfig,
        config_fingerprint: String,
    ) -> Result<Self> {
        match Self::load(&path)? {
            Some(record) => {
                if record.config_fingerprint != config_fingerprint {
                    warn!(
                        run_id = %record.run_id,
                        "CHECKPOINT: resuming under a different configuration than the crashed run"
                    );
                }
                info!(
                    run_id = %record.run_id,
                    completed = record.completed.len(),
                    "CHECKPOINT: resuming from existing checkpoint"
                );
                Ok(Self {
                    path,
                    config,
                    record,
                    unsaved_completions: 0,
                    last_save: Instant::now(),
                })
            }
            None => {
                info!(path = %path.display(), "CHECKPOINT: no prior checkpoint, starting fresh");
                Ok(Self::start_fresh(path, config, config_fingerprint))
            }
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.record.run_id
    }

    pub fn completed(&self) -> &BTreeSet<String> {
        &self.record.completed
    }

    pub fn is_completed(&self, item_id: &str) -> bool {
        self.record.completed.contains(item_id)
    }

    /// Record a completion and persist if the save cadence is due. Returns
    /// whether a save happened, so the caller can persist companion state
    /// (the manifest) on the same cadence and a crash never leaves the
    /// checkpoint ahead of it.
    pub fn record_done(&mut self, item_id: &str) -> Result<bool> {
        if self.record.completed.insert(item_id.to_string()) {
            self.unsaved_completions += 1;
        }

        let due_by_count = self.unsaved_completions >= self.config.save_every_n;
        let due_by_time = self.last_save.elapsed().as_millis() as u64 >= self.config.save_every_ms;
        if due_by_count || due_by_time {
            self.save()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Persist immediately, regardless of cadence.
    pub fn save(&mut self) -> Result<()> {
        persist::save_atomic(&self.path, &self.record, true)?;
        debug!(
            run_id = %self.record.run_id,
            completed = self.record.completed.len(),
            "CHECKPOINT: saved"
        );
        self.unsaved_completions = 0;
        self.last_save = Instant::now();
        Ok(())
    }

    /// Delete the checkpoint after clean completion. Never called after a
    /// circuit-breaker halt, which must leave the checkpoint intact for a
    /// later resume.
    pub fn clear(&mut self) -> Result<()> {
        for path in [self.path.clone(), persist::backup_path(&self.path)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ConveyorError::io(path, e)),
            }
        }
        info!(run_id = %self.record.run_id, "CHECKPOINT: cleared after clean completion");
        Ok(())
    }
}
