//! # Configuration Management
//!
//! Serde-backed configuration tree for the orchestration core. Values are
//! resolved in three layers: built-in defaults, an optional TOML file, and
//! `CONVEYOR_*` environment overrides (e.g. `CONVEYOR_POOL__MAX_WORKERS=8`).
//! All duration fields are milliseconds, all size fields are bytes.

use crate::error::{ConveyorError, Result};
use crate::types::SizeCategory;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Admission control: size classification thresholds, memory cost model,
/// bounded wait, and adaptive base timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Items at or below this size are Small.
    pub small_max_bytes: u64,
    /// Items at or below this size (and above `small_max_bytes`) are Medium.
    pub medium_max_bytes: u64,
    /// Estimated working-set bytes per input byte.
    pub memory_per_byte_factor: f64,
    /// Fixed per-task memory overhead added to the estimate.
    pub fixed_overhead_bytes: u64,
    /// Extra headroom required on top of the estimate (0.2 = 20%).
    pub safety_margin: f64,
    /// Poll interval while waiting for memory to free up.
    pub poll_interval_ms: u64,
    /// Maximum total wait before admission fails with ResourceUnavailable.
    pub max_wait_ms: u64,
    pub base_timeout_small_ms: u64,
    pub base_timeout_medium_ms: u64,
    pub base_timeout_large_ms: u64,
    /// Multiplier applied to base timeouts on the primary pass.
    pub timeout_multiplier: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            small_max_bytes: 1024 * 1024,
            medium_max_bytes: 10 * 1024 * 1024,
            memory_per_byte_factor: 3.0,
            fixed_overhead_bytes: 32 * 1024 * 1024,
            safety_margin: 0.2,
            poll_interval_ms: 250,
            max_wait_ms: 60_000,
            base_timeout_small_ms: 30_000,
            base_timeout_medium_ms: 120_000,
            base_timeout_large_ms: 600_000,
            timeout_multiplier: 1.0,
        }
    }
}

impl AdmissionConfig {
    pub fn base_timeout(&self, category: SizeCategory) -> Duration {
        let ms = match category {
            SizeCategory::Small => self.base_timeout_small_ms,
            SizeCategory::Medium => self.base_timeout_medium_ms,
            SizeCategory::Large => self.base_timeout_large_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn classify(&self, size_bytes: u64) -> SizeCategory {
        SizeCategory::classify(size_bytes, self.small_max_bytes, self.medium_max_bytes)
    }

    /// Estimated memory required to process an item of the given size.
    pub fn required_bytes(&self, size_bytes: u64) -> u64 {
        (size_bytes as f64 * self.memory_per_byte_factor) as u64 + self.fixed_overhead_bytes
    }
}

/// Worker pool sizing and context recycling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of concurrent worker contexts. 1 selects the deterministic
    /// sequential mode.
    pub max_workers: usize,
    /// Dispatches a context serves before its worker is torn down and
    /// re-created, bounding memory growth in long-lived contexts.
    pub max_tasks_per_child: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_tasks_per_child: 100,
        }
    }
}

/// Checkpoint persistence cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Persist after this many completions since the last save.
    pub save_every_n: usize,
    /// Persist after this long since the last save, whichever comes first.
    pub save_every_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            save_every_n: 25,
            save_every_ms: 30_000,
        }
    }
}

/// Dead-letter queue retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqConfig {
    /// Timeout scale applied on the retry pass, per size category.
    pub retry_timeout_scale_small: f64,
    pub retry_timeout_scale_medium: f64,
    pub retry_timeout_scale_large: f64,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            retry_timeout_scale_small: 2.0,
            retry_timeout_scale_medium: 2.0,
            retry_timeout_scale_large: 1.5,
        }
    }
}

impl DlqConfig {
    pub fn retry_scale(&self, category: SizeCategory) -> f64 {
        match category {
            SizeCategory::Small => self.retry_timeout_scale_small,
            SizeCategory::Medium => self.retry_timeout_scale_medium,
            SizeCategory::Large => self.retry_timeout_scale_large,
        }
    }
}

/// Quality circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Minimum completions before the ratio is evaluated, so tiny batches
    /// never trip on a single bad item.
    pub min_sample_size: u64,
    /// Quality-failure ratio above which dispatch halts.
    pub threshold: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            min_sample_size: 20,
            threshold: 0.05,
        }
    }
}

/// Filesystem layout for persisted run state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Directory holding the manifest, checkpoint, DLQ, summary, and halt
    /// marker files.
    pub state_dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".conveyor"),
        }
    }
}

impl StateConfig {
    pub fn manifest_path(&self) -> PathBuf {
        self.state_dir.join("manifest.json")
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.state_dir.join("checkpoint.json")
    }

    pub fn dlq_path(&self) -> PathBuf {
        self.state_dir.join("dlq.json")
    }

    pub fn dlq_log_path(&self) -> PathBuf {
        self.state_dir.join("dlq.log")
    }

    pub fn summary_path(&self) -> PathBuf {
        self.state_dir.join("run_summary.json")
    }

    pub fn halt_marker_path(&self) -> PathBuf {
        self.state_dir.join("HALT")
    }
}

/// Root configuration for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConveyorConfig {
    pub admission: AdmissionConfig,
    pub pool: PoolConfig,
    pub checkpoint: CheckpointConfig,
    pub dlq: DlqConfig,
    pub breaker: BreakerConfig,
    pub state: StateConfig,
}

impl ConveyorConfig {
    /// Load configuration: defaults, then the optional TOML file, then
    /// `CONVEYOR_*` environment overrides.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(
            config::Config::try_from(&ConveyorConfig::default())
                .map_err(|e| ConveyorError::Configuration(e.to_string()))?,
        );

        if let Some(path) = config_file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let loaded: ConveyorConfig = builder
            .add_source(config::Environment::with_prefix("CONVEYOR").separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConveyorError::Configuration(e.to_string()))?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject inconsistent settings before any dispatch.
    pub fn validate(&self) -> Result<()> {
        if self.admission.small_max_bytes >= self.admission.medium_max_bytes {
            return Err(ConveyorError::Configuration(format!(
                "small_max_bytes ({}) must be below medium_max_bytes ({})",
                self.admission.small_max_bytes, self.admission.medium_max_bytes
            )));
        }
        if self.admission.memory_per_byte_factor <= 0.0 {
            return Err(ConveyorError::Configuration(
                "memory_per_byte_factor must be positive".to_string(),
            ));
        }
        if self.admission.safety_margin < 0.0 {
            return Err(ConveyorError::Configuration(
                "safety_margin must not be negative".to_string(),
            ));
        }
        if self.admission.poll_interval_ms == 0 {
            return Err(ConveyorError::Configuration(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.admission.timeout_multiplier <= 0.0 {
            return Err(ConveyorError::Configuration(
                "timeout_multiplier must be positive".to_string(),
            ));
        }
        if self.pool.max_workers == 0 {
            return Err(ConveyorError::Configuration(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.pool.max_tasks_per_child == 0 {
            return Err(ConveyorError::Configuration(
                "max_tasks_per_child must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.breaker.threshold) {
            return Err(ConveyorError::Configuration(format!(
                "breaker threshold ({}) must be within 0.0..=1.0",
                self.breaker.threshold
            )));
        }
        for category in SizeCategory::all() {
            if self.dlq.retry_scale(category) <= 0.0 {
                return Err(ConveyorError::Configuration(format!(
                    "retry timeout scale for {} must be positive",
                    category.name()
                )));
            }
        }
        Ok(())
    }

    /// Stable fingerprint of the configuration, stored in checkpoint
    /// metadata so a resume under changed settings can be detected.
    pub fn fingerprint(&self) -> String {
        let rendered = serde_json::to_vec(self).unwrap_or_default();
        blake3::hash(&rendered).to_hex().to_string()
    }
}
