//! Background execution: worker loops and the reservation reaper.
//!
//! # Lifecycle
//!
//! 1. **Start**: [`Runtime::start`] spawns `concurrency` worker loops and the
//!    reaper loop on the current tokio runtime
//! 2. **Operation**: each worker loop takes the next visible job and handles
//!    it; an empty queue sleeps for the poll interval
//! 3. **Shutdown**: [`Runtime::shutdown`] cancels the token and waits for
//!    in-flight jobs to finish

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use tollgate_core::observability::task_span;

use crate::config::FlowConfig;
use crate::dispatch::JobQueue;
use crate::error::Result;
use crate::reaper::ReservationReaper;
use crate::worker::{JobOutcome, Worker};

/// Default sleep between polls of an empty queue.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A set of worker loops sharing one queue.
#[derive(Clone)]
pub struct WorkerPool {
    worker: Worker,
    queue: Arc<dyn JobQueue>,
    poll_interval: Duration,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("queue", &self.queue.queue_name())
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Creates a pool.
    #[must_use]
    pub fn new(worker: Worker, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            worker,
            queue,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Sets the empty-queue poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Takes one job, if any is visible, and handles it.
    ///
    /// # Errors
    ///
    /// Returns queue errors and unresolved worker errors.
    pub async fn poll_once(&self) -> Result<Option<JobOutcome>> {
        let Some(received) = self.queue.receive().await? else {
            return Ok(None);
        };
        tracing::debug!(
            message_id = %received.message_id,
            lane = %received.options.lane,
            "received job"
        );
        let job = &received.descriptor;
        let span = task_span("handle", &job.task_id.to_string(), &job.user_id.to_string());
        self.worker.handle(job).instrument(span).await.map(Some)
    }

    /// Spawns `concurrency` loops that run until `shutdown` is cancelled.
    #[must_use]
    pub fn spawn(&self, concurrency: usize, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        (0..concurrency.max(1))
            .map(|index| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.run_loop(index, shutdown).await })
            })
            .collect()
    }

    async fn run_loop(self, index: usize, shutdown: CancellationToken) {
        tracing::info!(worker = index, "worker loop started");
        while !shutdown.is_cancelled() {
            let idle = match self.poll_once().await {
                Ok(Some(outcome)) => {
                    tracing::debug!(worker = index, ?outcome, "job handled");
                    false
                }
                Ok(None) => true,
                Err(err) => {
                    tracing::error!(worker = index, error = %err, "job handling failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
        tracing::info!(worker = index, "worker loop stopped");
    }
}

/// Running worker loops plus the reaper.
#[derive(Debug)]
pub struct Runtime {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Spawns `concurrency` workers and the reaper.
    #[must_use]
    pub fn start(pool: &WorkerPool, reaper: ReservationReaper, concurrency: usize) -> Self {
        let shutdown = CancellationToken::new();
        let mut handles = pool.spawn(concurrency, &shutdown);
        let reaper_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move { reaper.run(reaper_shutdown).await }));
        tracing::info!(workers = concurrency.max(1), "runtime started");
        Self { shutdown, handles }
    }

    /// Spawns workers and the reaper sized and timed from configuration.
    #[must_use]
    pub fn from_config(pool: WorkerPool, reaper: ReservationReaper, config: &FlowConfig) -> Self {
        let pool = pool.with_poll_interval(config.worker_poll_interval);
        let reaper = reaper
            .with_timeout(config.reservation_timeout)
            .with_interval(config.reaper_interval);
        Self::start(&pool, reaper, config.worker_concurrency)
    }

    /// Token that stops every loop when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancels all loops and waits for them to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "runtime task panicked");
            }
        }
        tracing::info!("runtime stopped");
    }
}
