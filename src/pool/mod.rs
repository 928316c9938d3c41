//! # Worker Pool
//!
//! The dispatcher and the injected worker contract. See [`dispatcher`] for
//! the execution model and [`worker`] for the transformation seam.

pub mod dispatcher;
pub mod worker;

pub use dispatcher::{BatchHandle, WorkerPool};
pub use worker::{WorkOutput, Worker, WorkerError, WorkerFactory};
