//! Funds reservations for billable operations.
//!
//! A reservation is a pending charge entry. It is recorded before work
//! starts and resolved (settled or rolled back) once the outcome is known.
//!
//! ## Design Principles
//!
//! - **Per-user serialization**: Every call holds the user's advisory lock
//!   (`user:{id}`) for the duration of that single ledger step, never across
//!   inference
//! - **Fail fast on reserve**: A contended reserve returns
//!   [`Error::ConcurrentModification`] immediately; resolution calls retry
//!   the lock briefly since an outcome must not be dropped
//! - **No swallowed errors**: Ledger errors propagate unchanged

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;

use tollgate_core::lock::{DEFAULT_LOCK_TTL, DEFAULT_MAX_RETRIES};
use tollgate_core::{AdvisoryLock, EntryId, LockAttempt, LockGuard, TaskId, UserId};

use crate::error::{Error, Result};
use crate::ledger::{EntryKind, Ledger, LedgerEntry};
use crate::metrics::FlowMetrics;

/// Coordinates reservations over the ledger under a per-user lock.
#[derive(Clone)]
pub struct ReservationManager {
    ledger: Ledger,
    lock: Arc<dyn AdvisoryLock>,
    lock_ttl: Duration,
    resolve_retries: u32,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for ReservationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationManager")
            .field("lock_ttl", &self.lock_ttl)
            .field("resolve_retries", &self.resolve_retries)
            .finish_non_exhaustive()
    }
}

/// Lock key for a user's balance.
#[must_use]
pub fn user_lock_key(user_id: &UserId) -> String {
    format!("user:{user_id}")
}

impl ReservationManager {
    /// Creates a manager over a ledger and a lock.
    #[must_use]
    pub fn new(ledger: Ledger, lock: Arc<dyn AdvisoryLock>) -> Self {
        Self {
            ledger,
            lock,
            lock_ttl: DEFAULT_LOCK_TTL,
            resolve_retries: DEFAULT_MAX_RETRIES,
            metrics: FlowMetrics::new(),
        }
    }

    /// Sets the lease TTL for the per-user lock.
    #[must_use]
    pub const fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Sets how many times settle, rollback and cancel retry a held lock.
    #[must_use]
    pub const fn with_resolve_retries(mut self, retries: u32) -> Self {
        self.resolve_retries = retries;
        self
    }

    /// Returns the underlying ledger.
    #[must_use]
    pub const fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Reserves `amount` (a positive cost) for a task.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if `amount` is not positive
    /// - [`Error::ConcurrentModification`] if the user's lock is held
    /// - [`Error::InsufficientFunds`] if the available balance is short
    #[tracing::instrument(skip(self), fields(%user_id, %amount, %task_id))]
    pub async fn reserve(
        &self,
        user_id: &UserId,
        amount: Decimal,
        task_id: &TaskId,
    ) -> Result<LedgerEntry> {
        if amount <= Decimal::ZERO {
            return Err(Error::validation(format!(
                "reservation amount must be positive, got {amount}"
            )));
        }
        let description = format!("Reservation for task {task_id}");
        let result = self
            .locked(user_id, "reserve", 0, || {
                self.ledger.record(
                    user_id,
                    -amount,
                    EntryKind::Charge,
                    Some(*task_id),
                    Some(description),
                )
            })
            .await;
        self.observe("reserve", &result);
        result
    }

    /// Records a locked pending debit that is not tied to a task.
    ///
    /// `amount` is positive; it is negated for debit kinds.
    ///
    /// # Errors
    ///
    /// Same as [`ReservationManager::reserve`].
    #[tracing::instrument(skip(self, description), fields(%user_id, %amount, %kind))]
    pub async fn hold(
        &self,
        user_id: &UserId,
        amount: Decimal,
        kind: EntryKind,
        description: Option<String>,
    ) -> Result<LedgerEntry> {
        if amount <= Decimal::ZERO {
            return Err(Error::validation(format!(
                "hold amount must be positive, got {amount}"
            )));
        }
        let signed = if kind.is_debit() { -amount } else { amount };
        let result = self
            .locked(user_id, "hold", 0, || {
                self.ledger.record(user_id, signed, kind, None, description)
            })
            .await;
        self.observe("hold", &result);
        result
    }

    /// Settles a reservation, applying the charge.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the entry is not pending, or
    /// [`Error::ConcurrentModification`] if the lock stays held.
    #[tracing::instrument(skip(self), fields(%entry_id))]
    pub async fn settle(&self, entry_id: &EntryId) -> Result<LedgerEntry> {
        let entry = self.ledger.entry(entry_id).await?;
        let result = self
            .locked(&entry.user_id, "settle", self.resolve_retries, || {
                self.ledger.settle(entry_id)
            })
            .await;
        self.observe("settle", &result);
        result
    }

    /// Rolls back a reservation, leaving the balance untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the entry is not pending, or
    /// [`Error::ConcurrentModification`] if the lock stays held.
    #[tracing::instrument(skip(self), fields(%entry_id))]
    pub async fn rollback(&self, entry_id: &EntryId, reason: &str) -> Result<LedgerEntry> {
        let entry = self.ledger.entry(entry_id).await?;
        let result = self
            .locked(&entry.user_id, "rollback", self.resolve_retries, || {
                self.ledger.fail(entry_id, reason)
            })
            .await;
        self.observe("rollback", &result);
        result
    }

    /// Cancels a reservation at the user's request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the entry is not pending.
    #[tracing::instrument(skip(self), fields(%entry_id))]
    pub async fn cancel(&self, entry_id: &EntryId, reason: &str) -> Result<LedgerEntry> {
        let entry = self.ledger.entry(entry_id).await?;
        let result = self
            .locked(&entry.user_id, "cancel", self.resolve_retries, || {
                self.ledger.cancel(entry_id, reason)
            })
            .await;
        self.observe("cancel", &result);
        result
    }

    async fn locked<T, F, Fut>(
        &self,
        user_id: &UserId,
        operation: &str,
        retries: u32,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.lock_user(user_id, operation, retries).await?;
        let result = op().await;
        match self.lock.release(&guard).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                %user_id,
                fencing_token = guard.fencing_token(),
                "user lock lease expired before release"
            ),
            Err(err) => tracing::warn!(%user_id, error = %err, "failed to release user lock"),
        }
        result
    }

    async fn lock_user(&self, user_id: &UserId, operation: &str, retries: u32) -> Result<LockGuard> {
        let key = user_lock_key(user_id);
        if retries == 0 {
            return match self
                .lock
                .try_acquire(&key, self.lock_ttl, Some(operation))
                .await?
            {
                LockAttempt::Acquired(guard) => Ok(guard),
                LockAttempt::Held { holder_id } => {
                    tracing::debug!(%user_id, %holder_id, operation, "user lock contended");
                    Err(Error::ConcurrentModification { user_id: *user_id })
                }
            };
        }

        match self.lock.acquire(&key, self.lock_ttl, retries).await {
            Ok(guard) => Ok(guard),
            Err(tollgate_core::Error::LockContended { .. }) => {
                Err(Error::ConcurrentModification { user_id: *user_id })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn observe<T>(&self, operation: &str, result: &Result<T>) {
        let label = match result {
            Ok(_) => "ok",
            Err(Error::InsufficientFunds { .. }) => "insufficient_funds",
            Err(Error::ConcurrentModification { .. }) => "contended",
            Err(Error::InvalidState { .. }) => "invalid_state",
            Err(_) => "error",
        };
        self.metrics.record_reservation(operation, label);
    }
}
