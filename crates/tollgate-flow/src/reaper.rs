//! Background rollback of orphaned reservations.
//!
//! A reservation whose task never reached a terminal state (a crashed
//! worker, a lost job) stays pending and keeps holding the user's funds.
//! The reaper rolls back every pending entry older than the reservation
//! timeout.
//!
//! ## Design Principles
//!
//! - **Backstop only**: Workers resolve reservations; the reaper catches what they missed
//! - **Best effort per entry**: One failed rollback never aborts a sweep
//! - **Deterministic tests**: [`ReservationReaper::sweep_at`] takes an explicit `now`

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::metrics::{FlowMetrics, TimingGuard};
use crate::reservation::ReservationManager;

/// Default age after which a pending reservation is rolled back.
pub const DEFAULT_RESERVATION_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Default interval between sweeps.
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stale pending entries found.
    pub scanned: usize,
    /// Entries rolled back by this sweep.
    pub rolled_back: usize,
    /// Entries skipped (resolved concurrently or failed to roll back).
    pub skipped: usize,
}

/// Rolls back reservations left pending past a timeout.
#[derive(Debug, Clone)]
pub struct ReservationReaper {
    reservations: ReservationManager,
    timeout: Duration,
    interval: Duration,
    metrics: FlowMetrics,
}

impl ReservationReaper {
    /// Creates a reaper with the default timeout and interval.
    #[must_use]
    pub fn new(reservations: ReservationManager) -> Self {
        Self {
            reservations,
            timeout: DEFAULT_RESERVATION_TIMEOUT,
            interval: DEFAULT_REAPER_INTERVAL,
            metrics: FlowMetrics::new(),
        }
    }

    /// Sets the reservation timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the sweep interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sweeps with the configured timeout at the current time.
    ///
    /// # Errors
    ///
    /// Returns an error only if the stale-entry query itself fails.
    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now(), self.timeout).await
    }

    /// Rolls back every pending entry created before `now - timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the stale-entry query itself fails.
    #[tracing::instrument(skip(self), fields(timeout_secs = timeout.as_secs()))]
    pub async fn sweep_at(&self, now: DateTime<Utc>, timeout: Duration) -> Result<SweepReport> {
        let _timer = TimingGuard::new(|elapsed| self.metrics.observe_reaper_sweep(elapsed));

        let age = chrono::Duration::from_std(timeout)
            .map_err(|e| Error::configuration(format!("reservation timeout out of range: {e}")))?;
        let stale = self.reservations.ledger().stale_pending(now - age).await?;
        let reason = format!("timed out after {} minutes", timeout.as_secs() / 60);

        let mut report = SweepReport {
            scanned: stale.len(),
            ..SweepReport::default()
        };
        for entry in stale {
            match self.reservations.rollback(&entry.id, &reason).await {
                Ok(_) => {
                    report.rolled_back += 1;
                    tracing::info!(
                        entry_id = %entry.id,
                        user_id = %entry.user_id,
                        amount = %entry.amount,
                        "rolled back stale reservation"
                    );
                }
                Err(Error::InvalidState { .. }) => {
                    report.skipped += 1;
                    tracing::debug!(entry_id = %entry.id, "reservation resolved concurrently");
                }
                Err(err) => {
                    report.skipped += 1;
                    tracing::warn!(entry_id = %entry.id, error = %err, "failed to roll back stale reservation");
                }
            }
        }

        self.metrics.record_reaper_rollbacks(report.rolled_back);
        if report.scanned > 0 {
            tracing::info!(
                scanned = report.scanned,
                rolled_back = report.rolled_back,
                skipped = report.skipped,
                "reaper sweep finished"
            );
        }
        Ok(report)
    }

    /// Sweeps every interval until `shutdown` is cancelled.
    ///
    /// The first sweep runs immediately so reservations orphaned by a
    /// previous process are reclaimed at startup.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            timeout_secs = self.timeout.as_secs(),
            "reservation reaper starting"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    tracing::info!("reservation reaper shutting down");
                    break;
                }

                _ = interval.tick() => {
                    if let Err(err) = self.sweep().await {
                        tracing::error!(error = %err, "reaper sweep failed");
                    }
                }
            }
        }
    }
}
