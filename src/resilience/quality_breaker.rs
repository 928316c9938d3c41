//! # Quality Circuit Breaker
//!
//! Tracks the ratio of business-validation failures (distinct from execution
//! failures) across a run. Trips once the sample is large enough and the
//! ratio exceeds the configured threshold; the trip is sticky for the rest
//! of the run. Tripping halts future dispatch only; in-flight tasks finish
//! naturally.

use crate::config::BreakerConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Point-in-time view of breaker state, rendered into the run summary and
/// the halt marker artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub processed_count: u64,
    pub quality_failure_count: u64,
    pub failure_ratio: f64,
    pub threshold: f64,
    pub min_sample_size: u64,
    pub tripped: bool,
}

/// Single-writer breaker owned by the coordinator; workers never touch it.
#[derive(Debug)]
pub struct QualityCircuitBreaker {
    config: BreakerConfig,
    processed_count: u64,
    quality_failure_count: u64,
    tripped: bool,
}

impl QualityCircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            processed_count: 0,
            quality_failure_count: 0,
            tripped: false,
        }
    }

    /// Record one completion and return whether the breaker is tripped.
    ///
    /// Trips only when `processed_count >= min_sample_size` and the
    /// quality-failure ratio strictly exceeds the threshold. Once tripped,
    /// stays tripped.
    pub fn observe(&mut self, is_quality_failure: bool) -> bool {
        self.processed_count += 1;
        if is_quality_failure {
            self.quality_failure_count += 1;
        }

        if self.tripped {
            return true;
        }

        if self.processed_count >= self.config.min_sample_size
            && self.failure_ratio() > self.config.threshold
        {
            self.tripped = true;
            error!(
                processed = self.processed_count,
                quality_failures = self.quality_failure_count,
                ratio = self.failure_ratio(),
                threshold = self.config.threshold,
                "BREAKER: quality failure ratio exceeded threshold, halting dispatch"
            );
        } else {
            debug!(
                processed = self.processed_count,
                quality_failures = self.quality_failure_count,
                "BREAKER: observation recorded"
            );
        }

        self.tripped
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }

    pub fn failure_ratio(&self) -> f64 {
        if self.processed_count == 0 {
            0.0
        } else {
            self.quality_failure_count as f64 / self.processed_count as f64
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            processed_count: self.processed_count,
            quality_failure_count: self.quality_failure_count,
            failure_ratio: self.failure_ratio(),
            threshold: self.config.threshold,
            min_sample_size: self.config.min_sample_size,
            tripped: self.tripped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(min_sample_size: u64, threshold: f64) -> QualityCircuitBreaker {
        QualityCircuitBreaker::new(BreakerConfig {
            min_sample_size,
            threshold,
        })
    }

    #[test]
    fn test_does_not_trip_below_min_sample() {
        let mut b = breaker(20, 0.05);
        // 10 observations, all quality failures: ratio 1.0 but sample too small.
        for _ in 0..10 {
            assert!(!b.observe(true));
        }
        assert!(!b.is_tripped());
    }

    #[test]
    fn test_trips_when_ratio_exceeds_threshold() {
        let mut b = breaker(20, 0.05);
        // 19 clean observations, then failures until the ratio crosses 5%.
        for _ in 0..19 {
            assert!(!b.observe(false));
        }
        assert!(!b.observe(true)); // 1/20 = 5.0%, not strictly above
        assert!(b.observe(true)); // 2/21 ≈ 9.5%
        assert!(b.is_tripped());
    }

    #[test]
    fn test_trip_is_sticky() {
        let mut b = breaker(1, 0.0);
        assert!(b.observe(true));
        // A long clean streak never closes it again within the run.
        for _ in 0..100 {
            assert!(b.observe(false));
        }
        assert!(b.is_tripped());
    }

    #[test]
    fn test_gradual_failure_accumulation_trips() {
        // threshold 0.05, min sample 20: the 11th quality failure at the
        // 110th completion pushes the ratio to 10% and trips.
        let mut b = breaker(20, 0.05);
        let mut tripped_at = None;
        for i in 1..=110u64 {
            let qf = i % 10 == 0; // every 10th item fails validation
            if b.observe(qf) && tripped_at.is_none() {
                tripped_at = Some(i);
            }
        }
        assert_eq!(b.snapshot().quality_failure_count, 11);
        assert!(b.is_tripped());
        assert!(tripped_at.unwrap() <= 110);
    }

    #[test]
    fn test_snapshot_reflects_state() {
        let mut b = breaker(2, 0.5);
        b.observe(true);
        b.observe(false);
        let snap = b.snapshot();
        assert_eq!(snap.processed_count, 2);
        assert_eq!(snap.quality_failure_count, 1);
        assert!((snap.failure_ratio - 0.5).abs() < f64::EPSILON);
        assert!(!snap.tripped);
    }
}
