//! # Resilience Module
//!
//! Fault-tolerance primitives for batch runs. The quality circuit breaker
//! watches the rolling ratio of business-validation failures and halts
//! further dispatch once systemic failure rates spike, so a bad model or
//! corrupt input batch cannot silently poison an entire output set.

pub mod quality_breaker;

pub use quality_breaker::{BreakerSnapshot, QualityCircuitBreaker};
