//! User-facing billing operations.
//!
//! Every money movement goes through the ledger as a pending entry that is
//! settled straight away, so the balance is only ever changed by completed
//! entries.

use rust_decimal::Decimal;

use tollgate_core::{EntryId, ModelId, UserId};

use crate::error::{Error, Result};
use crate::ledger::{EntryFilter, EntryKind, EntryStatus, Ledger, LedgerEntry};
use crate::pricing::{CostBreakdown, PricingService};
use crate::reservation::ReservationManager;
use crate::task::{Priority, TaskInput};

/// Default page size for transaction listings.
pub const DEFAULT_TRANSACTION_LIMIT: usize = 10;

/// Balance, deposits, withdrawals, refunds and quotes.
#[derive(Debug, Clone)]
pub struct BillingService {
    reservations: ReservationManager,
    pricing: PricingService,
}

impl BillingService {
    /// Creates a billing service.
    #[must_use]
    pub const fn new(reservations: ReservationManager, pricing: PricingService) -> Self {
        Self {
            reservations,
            pricing,
        }
    }

    fn ledger(&self) -> &Ledger {
        self.reservations.ledger()
    }

    /// Returns the settled balance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the user has no account.
    pub async fn get_balance(&self, user_id: &UserId) -> Result<Decimal> {
        self.ledger().balance(user_id).await
    }

    /// Adds funds. Returns the completed entry and the new balance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] unless `amount` is positive, or
    /// [`Error::NotFound`] if the user has no account.
    #[tracing::instrument(skip(self, description), fields(%user_id, %amount))]
    pub async fn deposit(
        &self,
        user_id: &UserId,
        amount: Decimal,
        description: Option<String>,
    ) -> Result<(LedgerEntry, Decimal)> {
        if amount <= Decimal::ZERO {
            return Err(Error::validation("deposit amount must be positive"));
        }
        let description = description.unwrap_or_else(|| "Deposit".to_string());
        let pending = self
            .reservations
            .hold(user_id, amount, EntryKind::Deposit, Some(description))
            .await?;
        let entry = self.reservations.settle(&pending.id).await?;
        let balance = self.ledger().balance(user_id).await?;
        tracing::info!(entry_id = %entry.id, %balance, "deposit completed");
        Ok((entry, balance))
    }

    /// Takes funds out. Returns the completed entry and the new balance.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] unless `amount` is positive
    /// - [`Error::InsufficientFunds`] if the available balance is short
    /// - [`Error::ConcurrentModification`] if the user's lock is held
    #[tracing::instrument(skip(self), fields(%user_id, %amount))]
    pub async fn withdraw(&self, user_id: &UserId, amount: Decimal) -> Result<(LedgerEntry, Decimal)> {
        let pending = self
            .reservations
            .hold(
                user_id,
                amount,
                EntryKind::Withdrawal,
                Some("Withdrawal".to_string()),
            )
            .await?;
        let entry = match self.reservations.settle(&pending.id).await {
            Ok(entry) => entry,
            Err(err) => {
                if let Err(rollback_err) = self
                    .reservations
                    .rollback(&pending.id, &err.to_string())
                    .await
                {
                    tracing::warn!(
                        entry_id = %pending.id,
                        error = %rollback_err,
                        "failed to roll back unsettled withdrawal"
                    );
                }
                return Err(err);
            }
        };
        let balance = self.ledger().balance(user_id).await?;
        Ok((entry, balance))
    }

    /// Refunds a completed charge in full, once.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the entry does not exist
    /// - [`Error::InvalidState`] if it is not a completed charge or was
    ///   already refunded
    #[tracing::instrument(skip(self), fields(%entry_id))]
    pub async fn refund(&self, entry_id: &EntryId, reason: &str) -> Result<LedgerEntry> {
        let original = self.ledger().entry(entry_id).await?;
        if original.kind != EntryKind::Charge || original.status != EntryStatus::Completed {
            return Err(Error::InvalidState {
                entity: "ledger entry",
                id: entry_id.to_string(),
                from: format!("{} {}", original.status, original.kind),
                to: EntryKind::Refund.to_string(),
            });
        }

        let description = format!("Refund for entry {entry_id}: {reason}");
        let pending = self
            .ledger()
            .record_refund(&original, original.amount.abs(), description)
            .await?;
        let refund = self.reservations.settle(&pending.id).await?;
        tracing::info!(refund_id = %refund.id, amount = %refund.amount, "refund completed");
        Ok(refund)
    }

    /// Lists a user's entries, most recent first.
    ///
    /// `limit` defaults to [`DEFAULT_TRANSACTION_LIMIT`].
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn get_transactions(
        &self,
        user_id: &UserId,
        filter: &EntryFilter,
        limit: Option<usize>,
    ) -> Result<Vec<LedgerEntry>> {
        self.ledger()
            .transactions(user_id, filter, limit.unwrap_or(DEFAULT_TRANSACTION_LIMIT))
            .await
    }

    /// Quotes a request without reserving anything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModelNotFound`] if the model does not exist.
    pub async fn calculate_cost(
        &self,
        model_id: &ModelId,
        input: &TaskInput,
        priority: Priority,
    ) -> Result<CostBreakdown> {
        self.pricing.quote(model_id, input, priority).await
    }
}
