//! Observability metrics for billing and task execution.
//!
//! Metrics are recorded through the `metrics` crate facade so any exporter
//! (Prometheus, StatsD) can be installed by the host binary.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `tollgate_reservations_total` | Counter | `operation`, `result` | Reservation manager calls |
//! | `tollgate_ledger_transitions_total` | Counter | `kind`, `status` | Ledger entries reaching a status |
//! | `tollgate_enqueue_total` | Counter | `lane`, `result` | Dispatcher enqueue outcomes |
//! | `tollgate_lane_depth` | Gauge | `lane` | Outstanding jobs per lane |
//! | `tollgate_lane_avg_wait_seconds` | Gauge | `lane` | EMA of lane wait time |
//! | `tollgate_tasks_total` | Counter | `from_state`, `to_state` | Task state transitions |
//! | `tollgate_task_duration_seconds` | Histogram | `mode`, `state` | Task processing time |
//! | `tollgate_retries_total` | Counter | `mode`, `attempt` | Scheduled retries |
//! | `tollgate_reaper_rollbacks_total` | Counter | - | Reservations rolled back by the reaper |
//! | `tollgate_reaper_sweep_duration_seconds` | Histogram | - | Reaper sweep time |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tollgate_flow::metrics::FlowMetrics;
//!
//! let metrics = FlowMetrics::new();
//! metrics.record_task_transition("pending", "processing");
//! metrics.set_lane_depth("ml_high", 3);
//! ```

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Reservation manager calls by operation and result.
    pub const RESERVATIONS_TOTAL: &str = "tollgate_reservations_total";
    /// Counter: Ledger entries reaching a status.
    pub const LEDGER_TRANSITIONS_TOTAL: &str = "tollgate_ledger_transitions_total";
    /// Counter: Dispatcher enqueue outcomes.
    pub const ENQUEUE_TOTAL: &str = "tollgate_enqueue_total";
    /// Gauge: Outstanding jobs per lane.
    pub const LANE_DEPTH: &str = "tollgate_lane_depth";
    /// Gauge: Exponential moving average of lane wait time.
    pub const LANE_AVG_WAIT_SECONDS: &str = "tollgate_lane_avg_wait_seconds";
    /// Counter: Task state transitions.
    pub const TASKS_TOTAL: &str = "tollgate_tasks_total";
    /// Histogram: Task processing time in seconds.
    pub const TASK_DURATION_SECONDS: &str = "tollgate_task_duration_seconds";
    /// Counter: Scheduled retries.
    pub const RETRIES_TOTAL: &str = "tollgate_retries_total";
    /// Counter: Reservations rolled back by the reaper.
    pub const REAPER_ROLLBACKS_TOTAL: &str = "tollgate_reaper_rollbacks_total";
    /// Histogram: Reaper sweep duration in seconds.
    pub const REAPER_SWEEP_DURATION_SECONDS: &str = "tollgate_reaper_sweep_duration_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Reservation operation (reserve, settle, rollback, cancel, hold).
    pub const OPERATION: &str = "operation";
    /// Result status (ok, insufficient_funds, contended, error).
    pub const RESULT: &str = "result";
    /// Ledger entry kind.
    pub const KIND: &str = "kind";
    /// Ledger entry status.
    pub const STATUS: &str = "status";
    /// Queue lane name.
    pub const LANE: &str = "lane";
    /// Previous task state (for transitions).
    pub const FROM_STATE: &str = "from_state";
    /// Target task state (for transitions).
    pub const TO_STATE: &str = "to_state";
    /// Final task state.
    pub const STATE: &str = "state";
    /// Input mode (single, batch).
    pub const MODE: &str = "mode";
    /// Delivery attempt.
    pub const ATTEMPT: &str = "attempt";
}

/// High-level interface for recording billing and execution metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct FlowMetrics {
    _private: (),
}

impl FlowMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a reservation manager call outcome.
    pub fn record_reservation(&self, operation: &str, result: &str) {
        counter!(
            names::RESERVATIONS_TOTAL,
            labels::OPERATION => operation.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records a ledger entry reaching a status.
    pub fn record_ledger_transition(&self, kind: &str, status: &str) {
        counter!(
            names::LEDGER_TRANSITIONS_TOTAL,
            labels::KIND => kind.to_string(),
            labels::STATUS => status.to_string(),
        )
        .increment(1);
    }

    /// Records an enqueue outcome for a lane.
    pub fn record_enqueue(&self, lane: &str, result: &str) {
        counter!(
            names::ENQUEUE_TOTAL,
            labels::LANE => lane.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Sets the outstanding job count for a lane.
    #[allow(clippy::cast_precision_loss)] // Lane sizes are bounded by capacity
    pub fn set_lane_depth(&self, lane: &str, depth: usize) {
        gauge!(names::LANE_DEPTH, labels::LANE => lane.to_string()).set(depth as f64);
    }

    /// Sets the average wait for a lane.
    pub fn set_lane_avg_wait(&self, lane: &str, seconds: f64) {
        gauge!(names::LANE_AVG_WAIT_SECONDS, labels::LANE => lane.to_string()).set(seconds);
    }

    /// Records a task state transition.
    pub fn record_task_transition(&self, from_state: &str, to_state: &str) {
        counter!(
            names::TASKS_TOTAL,
            labels::FROM_STATE => from_state.to_string(),
            labels::TO_STATE => to_state.to_string(),
        )
        .increment(1);
    }

    /// Records task processing time.
    pub fn observe_task_duration(&self, mode: &str, final_state: &str, duration_secs: f64) {
        histogram!(
            names::TASK_DURATION_SECONDS,
            labels::MODE => mode.to_string(),
            labels::STATE => final_state.to_string(),
        )
        .record(duration_secs);
    }

    /// Records a scheduled retry.
    pub fn record_retry(&self, mode: &str, attempt: u32) {
        counter!(
            names::RETRIES_TOTAL,
            labels::MODE => mode.to_string(),
            labels::ATTEMPT => attempt.to_string(),
        )
        .increment(1);
    }

    /// Records reservations rolled back by one reaper sweep.
    pub fn record_reaper_rollbacks(&self, count: usize) {
        counter!(names::REAPER_ROLLBACKS_TOTAL).increment(count as u64);
    }

    /// Records reaper sweep duration.
    pub fn observe_reaper_sweep(&self, duration: Duration) {
        histogram!(names::REAPER_SWEEP_DURATION_SECONDS).record(duration.as_secs_f64());
    }
}

/// RAII guard for timing operations.
///
/// Automatically records duration when dropped.
///
/// ## Example
///
/// ```rust,no_run
/// use tollgate_flow::metrics::{FlowMetrics, TimingGuard};
///
/// let metrics = FlowMetrics::new();
///
/// {
///     let _guard = TimingGuard::new(|duration| {
///         metrics.observe_reaper_sweep(duration);
///     });
///
///     // Do work...
/// } // Duration recorded automatically on drop
/// ```
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard that will call `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}
