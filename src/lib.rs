#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Conveyor Core
//!
//! Resilient batch-orchestration core for long-running file-processing runs.
//!
//! ## Overview
//!
//! Conveyor takes a directory of input files and pushes each one through a
//! pluggable [`pool::Worker`] while protecting the run against the failure
//! modes that kill unattended batch jobs: memory exhaustion, hung tasks,
//! crashing transformations, and silent quality regressions.
//!
//! ## Architecture
//!
//! Results flow through a single pipeline:
//!
//! - [`coordinator`] - enumerates inputs, owns all run state, routes results
//! - [`manifest`] - cross-run skip-if-unchanged state, keyed by content hash
//! - [`checkpoint`] - per-run crash recovery with cadenced atomic saves
//! - [`admission`] - memory-gated admission with adaptive per-task timeouts
//! - [`pool`] - worker contexts with crash isolation and recycling
//! - [`dlq`] - dead-letter queue with bounded category-scaled retries
//! - [`resilience`] - quality circuit breaker halting systematically bad runs
//! - [`summary`] - machine-readable run summary and halt marker artifacts
//!
//! ## Key Guarantees
//!
//! - **At-most-once recorded success**: the manifest and checkpoint only ever
//!   record an item after its result has been received
//! - **Crash recovery**: every persisted artifact is published atomically
//!   with a `.bak` fallback; a killed run resumes from its checkpoint
//! - **Bounded retry**: `PermanentReject` is terminal, everything else gets
//!   exactly one retry per drain with a scaled timeout
//! - **Fail-fast on corruption**: unreadable state files abort at startup
//!   instead of silently reprocessing the world
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use conveyor_core::config::ConveyorConfig;
//! use conveyor_core::coordinator::{RunCoordinator, RunOptions};
//! use conveyor_core::pool::{WorkOutput, Worker, WorkerError, WorkerFactory};
//! use conveyor_core::resource::SysinfoProbe;
//! use conveyor_core::types::WorkItem;
//! use std::sync::Arc;
//!
//! struct CopyWorker;
//!
//! #[async_trait::async_trait]
//! impl Worker for CopyWorker {
//!     async fn process(&self, item: &WorkItem) -> Result<WorkOutput, WorkerError> {
//!         std::fs::read(&item.path)
//!             .map_err(|e| WorkerError::Transient(e.to_string()))?;
//!         Ok(WorkOutput::default())
//!     }
//! }
//!
//! struct CopyFactory;
//!
//! impl WorkerFactory for CopyFactory {
//!     fn create(&self) -> conveyor_core::error::Result<Box<dyn Worker>> {
//!         Ok(Box::new(CopyWorker))
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ConveyorConfig::load(None)?;
//! let coordinator = RunCoordinator::new(
//!     config,
//!     Arc::new(CopyFactory),
//!     Arc::new(SysinfoProbe::new()),
//! )?;
//! let report = coordinator
//!     .run(&RunOptions {
//!         input_dir: "data/incoming".into(),
//!         ..RunOptions::default()
//!     })
//!     .await?;
//! std::process::exit(report.outcome.exit_code() as i32);
//! # }
//! ```

pub mod admission;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod dlq;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod persist;
pub mod pool;
pub mod resilience;
pub mod resource;
pub mod summary;
pub mod types;

pub use config::ConveyorConfig;
pub use coordinator::{RunCoordinator, RunOptions, RunReport};
pub use error::{ConveyorError, Result};
pub use types::{
    FailureReason, RunOutcome, RunState, SizeCategory, TaskResult, TaskStatus, WorkItem,
};
