//! # Admission Control
//!
//! A best-effort memory semaphore gating dispatch. Each item's memory cost
//! is estimated from its size; the coordinator blocks here (never a worker)
//! until enough system memory is available or the bounded wait elapses.
//! Admission does not reserve memory: it is an advisory gate, not an
//! allocator.

use crate::config::AdmissionConfig;
use crate::error::{ConveyorError, Result};
use crate::resource::MemoryProbe;
use crate::types::WorkItem;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub struct AdmissionController {
    config: AdmissionConfig,
    probe: Arc<dyn MemoryProbe>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        Self { config, probe }
    }

    /// Block until the estimated memory for `item` is available, then return
    /// the adaptive per-item timeout (`base_timeout[category] * multiplier`).
    ///
    /// Returns `ResourceUnavailable` once the configured maximum wait
    /// elapses. That is a deliberate failure mode, not a deadlock: the item
    /// is surfaced as a failed result and remains eligible for the next run.
    pub async fn admit(&self, item: &WorkItem, multiplier: f64) -> Result<Duration> {
        let required = self.config.required_bytes(item.size_bytes);
        let needed = (required as f64 * (1.0 + self.config.safety_margin)) as u64;
        let max_wait = Duration::from_millis(self.config.max_wait_ms);
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let started = Instant::now();

        loop {
            let available = self.probe.available_bytes();
            if available >= needed {
                let timeout = self.adaptive_timeout(item, multiplier);
                debug!(
                    item_id = %item.id,
                    category = item.category.name(),
                    required_bytes = required,
                    available_bytes = available,
                    timeout_ms = timeout.as_millis() as u64,
                    "ADMISSION: item admitted"
                );
                return Ok(timeout);
            }

            if started.elapsed() >= max_wait {
                warn!(
                    item_id = %item.id,
                    required_bytes = required,
                    available_bytes = available,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "ADMISSION: gave up waiting for memory"
                );
                return Err(ConveyorError::ResourceUnavailable {
                    item_id: item.id.clone(),
                    required_bytes: required,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }

            debug!(
                item_id = %item.id,
                required_bytes = needed,
                available_bytes = available,
                "ADMISSION: waiting for memory"
            );
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// The adaptive timeout for an item without going through the wait. The
    /// DLQ retry pass uses this with a scaled multiplier.
    pub fn adaptive_timeout(&self, item: &WorkItem, multiplier: f64) -> Duration {
        let base = self.config.base_timeout(item.category);
        base.mul_f64(multiplier * self.config.timeout_multiplier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SizeCategory;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Probe returning a scripted sequence of availability readings.
    struct ScriptedProbe {
        readings: Vec<u64>,
        cursor: AtomicU64,
    }

    impl ScriptedProbe {
        fn new(readings: Vec<u64>) -> Self {
            Self {
                readings,
                cursor: AtomicU64::new(0),
            }
        }
    }

    impl MemoryProbe for ScriptedProbe {
        fn available_bytes(&self) -> u64 {
            let i = self.cursor.fetch_add(1, Ordering::SeqCst) as usize;
            *self
                .readings
                .get(i)
                .or(self.readings.last())
                .unwrap_or(&0)
        }

        fn process_rss_bytes(&self) -> u64 {
            0
        }
    }

    fn test_config() -> AdmissionConfig {
        AdmissionConfig {
            memory_per_byte_factor: 2.0,
            fixed_overhead_bytes: 0,
            safety_margin: 0.0,
            poll_interval_ms: 5,
            max_wait_ms: 50,
            base_timeout_small_ms: 1_000,
            base_timeout_medium_ms: 2_000,
            base_timeout_large_ms: 4_000,
            timeout_multiplier: 1.0,
            ..AdmissionConfig::default()
        }
    }

    fn item(size: u64, category: SizeCategory) -> WorkItem {
        WorkItem::new("item", "/in/item", size, category, "h")
    }

    #[tokio::test]
    async fn test_admit_immediately_when_memory_is_free() {
        let probe = Arc::new(ScriptedProbe::new(vec![u64::MAX]));
        let controller = AdmissionController::new(test_config(), probe);

        let timeout = controller
            .admit(&item(100, SizeCategory::Small), 1.0)
            .await
            .unwrap();
        assert_eq!(timeout, Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_admit_waits_until_memory_frees() {
        // First two polls see nothing free, third sees plenty.
        let probe = Arc::new(ScriptedProbe::new(vec![0, 0, u64::MAX]));
        let controller = AdmissionController::new(test_config(), probe);

        let timeout = controller
            .admit(&item(100, SizeCategory::Medium), 1.0)
            .await
            .unwrap();
        assert_eq!(timeout, Duration::from_millis(2_000));
    }

    #[tokio::test]
    async fn test_admit_fails_after_bounded_wait() {
        let probe = Arc::new(ScriptedProbe::new(vec![0]));
        let controller = AdmissionController::new(test_config(), probe);

        let err = controller
            .admit(&item(100, SizeCategory::Small), 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::ResourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_adaptive_timeout_scales_with_multiplier() {
        let probe = Arc::new(ScriptedProbe::new(vec![u64::MAX]));
        let controller = AdmissionController::new(test_config(), probe);

        let base = controller.adaptive_timeout(&item(1, SizeCategory::Large), 1.0);
        let scaled = controller.adaptive_timeout(&item(1, SizeCategory::Large), 2.0);
        assert_eq!(base, Duration::from_millis(4_000));
        assert_eq!(scaled, Duration::from_millis(8_000));
    }

    #[tokio::test]
    async fn test_safety_margin_raises_the_bar() {
        let mut config = test_config();
        config.safety_margin = 1.0; // require 2x the estimate
        // Estimate for 100 bytes is 200; with margin the bar is 400.
        let probe = Arc::new(ScriptedProbe::new(vec![300]));
        let controller = AdmissionController::new(config, probe);

        let err = controller
            .admit(&item(100, SizeCategory::Small), 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::ResourceUnavailable { .. }));
    }
}
