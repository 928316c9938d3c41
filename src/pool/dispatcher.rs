//! # Worker Pool Dispatcher
//!
//! Pulls admitted items, runs the injected worker in an isolated execution
//! context, enforces the adaptive per-task timeout, and streams structured
//! results back to the coordinator. Two modes: sequential (`max_workers =
//! 1`, deterministic order) and parallel. No ordering guarantee is made on
//! result arrival in parallel mode.
//!
//! Isolation model: each context is a long-lived tokio task owning its own
//! worker instance; a panicking task is captured with `catch_unwind` and
//! converted into a `WorkerCrash` result, so a crashing transformation can
//! never corrupt coordinator state. The timeout is a hard cancellation
//! boundary: an expired dispatch future is dropped, independent of the
//! worker's own behavior.
//!
//! Known limitation: this contains unwinding panics only. A worker that
//! aborts the process, overflows its stack, or is OOM-killed takes the
//! coordinator down with it; only OS subprocess execution would contain
//! those, and is the hardening step if in-process workers prove
//! insufficient.

use crate::admission::AdmissionController;
use crate::config::PoolConfig;
use crate::error::ConveyorError;
use crate::pool::worker::{WorkerError, WorkerFactory};
use crate::resource::MemoryProbe;
use crate::types::{FailureReason, ResourceDelta, TaskResult, WorkItem};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error, info, warn};

/// One admitted unit of work handed to an execution context.
#[derive(Debug, Clone)]
struct Dispatch {
    item: WorkItem,
    timeout: Duration,
    attempt: u32,
}

/// Live handle to an in-flight batch. The coordinator consumes results from
/// `next_result` and may call `halt` to stop dispatch of not-yet-admitted
/// items; in-flight tasks finish naturally.
pub struct BatchHandle {
    results: mpsc::Receiver<TaskResult>,
    halt: Arc<AtomicBool>,
    halt_notify: Arc<Notify>,
}

impl BatchHandle {
    pub async fn next_result(&mut self) -> Option<TaskResult> {
        self.results.recv().await
    }

    /// Stop admitting and dispatching further items. Idempotent.
    pub fn halt(&self) {
        if !self.halt.swap(true, Ordering::AcqRel) {
            info!("POOL: halt requested, draining in-flight tasks");
        }
        self.halt_notify.notify_waiters();
    }

    pub fn is_halted(&self) -> bool {
        self.halt.load(Ordering::Acquire)
    }
}

pub struct WorkerPool {
    config: PoolConfig,
    factory: Arc<dyn WorkerFactory>,
    probe: Arc<dyn MemoryProbe>,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        factory: Arc<dyn WorkerFactory>,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        Self {
            config,
            factory,
            probe,
        }
    }

    /// Dispatch a batch. Items flow: admission gate (on the feeder, never a
    /// worker) -> bounded work channel -> worker contexts -> results
    /// channel. Admission failures surface as `ResourceUnavailable` results
    /// without ever reaching a context.
    pub fn spawn_batch(
        &self,
        items: Vec<(WorkItem, u32)>,
        admission: Arc<AdmissionController>,
        timeout_multiplier: f64,
    ) -> BatchHandle {
        let halt = Arc::new(AtomicBool::new(false));
        let halt_notify = Arc::new(Notify::new());
        let (work_tx, work_rx) = mpsc::channel::<Dispatch>(1);
        let (result_tx, result_rx) = mpsc::channel::<TaskResult>(256);

        let workers = self.config.max_workers;
        info!(
            items = items.len(),
            workers,
            mode = if workers == 1 { "sequential" } else { "parallel" },
            "POOL: batch starting"
        );

        // Worker contexts: each owns a worker instance for its lifetime.
        let work_rx = Arc::new(Mutex::new(work_rx));
        for context_id in 0..workers {
            let context = WorkerContext {
                context_id,
                factory: Arc::clone(&self.factory),
                probe: Arc::clone(&self.probe),
                max_tasks_per_child: self.config.max_tasks_per_child,
            };
            let work_rx = Arc::clone(&work_rx);
            let result_tx = result_tx.clone();
            tokio::spawn(async move { context.run(work_rx, result_tx).await });
        }

        // Feeder: admission-gated dispatch, cancelable at every suspension
        // point by a halt notification. Holds its own result sender for
        // admission failures, which never reach a context.
        let feeder_result_tx = result_tx;
        let feeder_halt = Arc::clone(&halt);
        let feeder_notify = Arc::clone(&halt_notify);
        tokio::spawn(async move {
            for (item, attempt) in items {
                if feeder_halt.load(Ordering::Acquire) {
                    debug!(item_id = %item.id, "POOL: halted before admission, item not dispatched");
                    continue;
                }

                let admitted = tokio::select! {
                    admitted = admission.admit(&item, timeout_multiplier) => admitted,
                    _ = feeder_notify.notified() => {
                        debug!(item_id = %item.id, "POOL: halted during admission wait");
                        continue;
                    }
                };

                match admitted {
                    Ok(timeout) => {
                        let dispatch = Dispatch {
                            item,
                            timeout,
                            attempt,
                        };
                        if work_tx.send(dispatch).await.is_err() {
                            // All contexts are gone; nothing left to do.
                            break;
                        }
                    }
                    Err(ConveyorError::ResourceUnavailable {
                        required_bytes,
                        waited_ms,
                        ..
                    }) => {
                        let result = TaskResult::failure(
                            &item,
                            attempt,
                            ResourceDelta {
                                wall_time_ms: waited_ms,
                                rss_delta_bytes: 0,
                            },
                            FailureReason::ResourceUnavailable,
                            format!(
                                "admission timed out after {waited_ms}ms waiting for {required_bytes} bytes"
                            ),
                        );
                        if feeder_result_tx.send(result).await.is_err() {
                            break;
                        }
                    }
                    Err(other) => {
                        error!(error = %other, "POOL: unexpected admission error");
                        break;
                    }
                }
            }
            // Dropping work_tx lets contexts drain and exit.
        });

        BatchHandle {
            results: result_rx,
            halt,
            halt_notify,
        }
    }

    /// Process one item on a fresh, single-use context. Used by the DLQ
    /// retry pass, which is never interleaved with primary dispatch.
    pub async fn process_single(
        &self,
        item: WorkItem,
        timeout: Duration,
        attempt: u32,
    ) -> TaskResult {
        let context = WorkerContext {
            context_id: usize::MAX,
            factory: Arc::clone(&self.factory),
            probe: Arc::clone(&self.probe),
            max_tasks_per_child: 1,
        };
        match self.factory.create() {
            Ok(worker) => {
                context
                    .execute(
                        worker.as_ref(),
                        &Dispatch {
                            item,
                            timeout,
                            attempt,
                        },
                    )
                    .await
            }
            Err(e) => TaskResult::failure(
                &item,
                attempt,
                ResourceDelta::default(),
                FailureReason::Exception,
                format!("worker setup failed: {e}"),
            ),
        }
    }
}

/// A single execution context: pulls dispatches, runs them on its private
/// worker instance, recycles the worker after `max_tasks_per_child` serves
/// or after a crash.
struct WorkerContext {
    context_id: usize,
    factory: Arc<dyn WorkerFactory>,
    probe: Arc<dyn MemoryProbe>,
    max_tasks_per_child: usize,
}

impl WorkerContext {
    async fn run(
        &self,
        work_rx: Arc<Mutex<mpsc::Receiver<Dispatch>>>,
        result_tx: mpsc::Sender<TaskResult>,
    ) {
        let mut worker = match self.factory.create() {
            Ok(worker) => worker,
            Err(e) => {
                error!(context_id = self.context_id, error = %e, "POOL: context setup failed");
                return;
            }
        };
        let mut served = 0usize;
        debug!(context_id = self.context_id, "POOL: context started");

        loop {
            let dispatch = {
                let mut rx = work_rx.lock().await;
                rx.recv().await
            };
            let Some(dispatch) = dispatch else {
                break;
            };

            if served >= self.max_tasks_per_child {
                debug!(
                    context_id = self.context_id,
                    served, "POOL: recycling worker after max_tasks_per_child"
                );
                match self.factory.create() {
                    Ok(fresh) => {
                        worker = fresh;
                        served = 0;
                    }
                    Err(e) => {
                        error!(context_id = self.context_id, error = %e, "POOL: worker recycle failed");
                        break;
                    }
                }
            }

            let result = self.execute(worker.as_ref(), &dispatch).await;
            let crashed = matches!(result.failure_reason, Some(FailureReason::WorkerCrash));
            served += 1;

            if result_tx.send(result).await.is_err() {
                break;
            }

            // A crashed worker may hold poisoned internal state; replace it
            // before serving another item.
            if crashed {
                match self.factory.create() {
                    Ok(fresh) => {
                        worker = fresh;
                        served = 0;
                    }
                    Err(e) => {
                        error!(context_id = self.context_id, error = %e, "POOL: worker replacement failed");
                        break;
                    }
                }
            }
        }

        debug!(context_id = self.context_id, served, "POOL: context exiting");
    }

    async fn execute(
        &self,
        worker: &dyn crate::pool::worker::Worker,
        dispatch: &Dispatch,
    ) -> TaskResult {
        let item = &dispatch.item;
        let rss_before = self.probe.process_rss_bytes();
        let started = Instant::now();

        let attempt_future = AssertUnwindSafe(worker.process(item)).catch_unwind();
        let outcome = tokio::time::timeout(dispatch.timeout, attempt_future).await;

        let resources = ResourceDelta {
            wall_time_ms: started.elapsed().as_millis() as u64,
            rss_delta_bytes: self.probe.process_rss_bytes() as i64 - rss_before as i64,
        };

        match outcome {
            Err(_elapsed) => {
                warn!(
                    item_id = %item.id,
                    timeout_ms = dispatch.timeout.as_millis() as u64,
                    "POOL: task deadline exceeded"
                );
                TaskResult::failure(
                    item,
                    dispatch.attempt,
                    resources,
                    FailureReason::Timeout,
                    format!("exceeded {}ms deadline", dispatch.timeout.as_millis()),
                )
            }
            Ok(Err(panic)) => {
                let detail = panic_detail(&*panic);
                error!(item_id = %item.id, detail = %detail, "POOL: worker crashed");
                TaskResult::failure(
                    item,
                    dispatch.attempt,
                    resources,
                    FailureReason::WorkerCrash,
                    detail,
                )
            }
            Ok(Ok(Err(WorkerError::Permanent(message)))) => {
                warn!(item_id = %item.id, message = %message, "POOL: item permanently rejected");
                TaskResult::failure(
                    item,
                    dispatch.attempt,
                    resources,
                    FailureReason::PermanentReject,
                    message,
                )
            }
            Ok(Ok(Err(WorkerError::Transient(message)))) => {
                warn!(item_id = %item.id, message = %message, "POOL: task failed");
                TaskResult::failure(
                    item,
                    dispatch.attempt,
                    resources,
                    FailureReason::Exception,
                    message,
                )
            }
            Ok(Ok(Ok(output))) => {
                debug!(
                    item_id = %item.id,
                    wall_time_ms = resources.wall_time_ms,
                    quality_failure = output.quality_failure,
                    "POOL: task completed"
                );
                let mut result = TaskResult::success(
                    item,
                    dispatch.attempt,
                    resources,
                    output.output_path.clone(),
                )
                .with_quality_failure(output.quality_failure);
                if let Some(warning) = output.warning {
                    result = result.with_warning(warning);
                }
                result
            }
        }
    }
}

fn panic_detail(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked with a non-string payload".to_string()
    }
}
