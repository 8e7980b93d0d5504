//! Append-only money movements per user.
//!
//! Every funds movement is a [`LedgerEntry`] with its own state machine.
//! A user's balance changes only when an entry is settled, and the entry
//! status and the balance change in the same atomic store step.
//!
//! ## Design Principles
//!
//! - **Append-only**: Entries are never deleted; terminal entries are immutable
//!   apart from the failure reason appended to their description
//! - **Atomic finalization**: [`LedgerStore::finalize`] updates the entry and the
//!   balance together, so no reader observes one without the other
//! - **Available balance**: Debits are checked against the settled balance
//!   minus debits already held by pending entries
//!
//! ## Entry State Machine
//!
//! ```text
//!              settle        ┌───────────┐
//!          ┌────────────────▶│ COMPLETED │
//!          │                 └───────────┘
//!   ┌──────┴──┐   fail       ┌────────┐
//!   │ PENDING │─────────────▶│ FAILED │
//!   └──────┬──┘              └────────┘
//!          │      cancel     ┌───────────┐
//!          └────────────────▶│ CANCELLED │
//!                            └───────────┘
//! ```

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use tollgate_core::{EntryId, TaskId, UserId};

use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;

/// Kind of funds movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Funds added by the user.
    Deposit,
    /// Funds taken out by the user.
    Withdrawal,
    /// Payment for an inference task.
    Charge,
    /// Return of a previous charge.
    Refund,
}

impl EntryKind {
    /// Returns true if entries of this kind reduce the balance.
    #[must_use]
    pub const fn is_debit(&self) -> bool {
        matches!(self, Self::Withdrawal | Self::Charge)
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdrawal => "withdrawal",
            Self::Charge => "charge",
            Self::Refund => "refund",
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

impl std::str::FromStr for EntryKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deposit" => Ok(Self::Deposit),
            "withdrawal" => Ok(Self::Withdrawal),
            "charge" => Ok(Self::Charge),
            "refund" => Ok(Self::Refund),
            other => Err(Error::validation(format!("unknown entry kind '{other}'"))),
        }
    }
}

/// Status of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Recorded but not yet applied to the balance.
    #[default]
    Pending,
    /// Applied to the balance.
    Completed,
    /// Abandoned because the operation failed.
    Failed,
    /// Abandoned because the user cancelled.
    Cancelled,
}

impl EntryStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        matches!(self, Self::Pending) && target.is_terminal()
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

impl std::str::FromStr for EntryStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::validation(format!("unknown entry status '{other}'"))),
        }
    }
}

/// One funds movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    /// Unique entry identifier.
    pub id: EntryId,
    /// The user whose balance this entry moves.
    pub user_id: UserId,
    /// Signed amount: positive credits, negative debits.
    pub amount: Decimal,
    /// Kind of movement.
    pub kind: EntryKind,
    /// Current status.
    pub status: EntryStatus,
    /// Task paid for by this entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_task_id: Option<TaskId>,
    /// Entry returned by this refund.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_of: Option<EntryId>,
    /// Free-form description; failure reasons are appended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// When the entry was recorded.
    pub created_at: DateTime<Utc>,
    /// When the entry reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    /// Creates a new pending entry.
    #[must_use]
    pub fn pending(user_id: UserId, amount: Decimal, kind: EntryKind) -> Self {
        Self {
            id: EntryId::generate(),
            user_id,
            amount,
            kind,
            status: EntryStatus::Pending,
            reference_task_id: None,
            refund_of: None,
            description: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Sets the referenced task.
    #[must_use]
    pub const fn with_task(mut self, task_id: Option<TaskId>) -> Self {
        self.reference_task_id = task_id;
        self
    }

    /// Sets the refunded entry.
    #[must_use]
    pub const fn with_refund_of(mut self, entry_id: EntryId) -> Self {
        self.refund_of = Some(entry_id);
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    /// Overrides the creation time.
    #[must_use]
    pub const fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Returns true if the entry is still pending.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self.status, EntryStatus::Pending)
    }

    /// Returns the debit this entry holds against the available balance.
    #[must_use]
    pub fn held_debit(&self) -> Decimal {
        if self.is_pending() && self.kind.is_debit() {
            self.amount.abs()
        } else {
            Decimal::ZERO
        }
    }

    /// Moves the entry to a terminal status, appending `reason` to the description.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the entry is not pending.
    pub fn finish(
        &mut self,
        target: EntryStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(self.invalid_transition(target));
        }
        if let Some(reason) = reason {
            self.description = Some(match self.description.take() {
                Some(existing) if !existing.is_empty() => format!("{existing} | {reason}"),
                _ => reason.to_string(),
            });
        }
        self.status = target;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Builds the error for an illegal transition out of the current status.
    #[must_use]
    pub fn invalid_transition(&self, target: EntryStatus) -> Error {
        Error::InvalidState {
            entity: "ledger entry",
            id: self.id.to_string(),
            from: self.status.to_string(),
            to: target.to_string(),
        }
    }
}

/// Filter for entry listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryFilter {
    /// Only entries of this kind.
    pub kind: Option<EntryKind>,
    /// Only entries with this status.
    pub status: Option<EntryStatus>,
}

impl EntryFilter {
    /// Returns true if the entry passes the filter.
    #[must_use]
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        self.kind.is_none_or(|k| k == entry.kind) && self.status.is_none_or(|s| s == entry.status)
    }
}

/// Outcome of inserting a pending entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordResult {
    /// The entry was stored.
    Recorded,
    /// The user has no balance row.
    AccountNotFound,
    /// A debit exceeds the available balance.
    InsufficientFunds {
        /// Settled balance minus pending debits.
        available: Decimal,
    },
    /// The referenced entry already has a live refund.
    AlreadyRefunded {
        /// The existing refund entry.
        existing: EntryId,
    },
}

/// Outcome of finalizing an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeResult {
    /// The entry reached the target status.
    Finalized(LedgerEntry),
    /// No entry with that id.
    NotFound,
    /// The entry was not pending.
    NotPending(LedgerEntry),
    /// Settling would make the balance negative; the entry stays pending.
    Overdraft {
        /// The settled balance at the time of the attempt.
        balance: Decimal,
    },
}

impl FinalizeResult {
    /// Returns true if the entry was finalized.
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        matches!(self, Self::Finalized(_))
    }
}

/// Storage for ledger entries and balances.
///
/// Implementations must apply [`LedgerStore::insert_pending`] checks and
/// [`LedgerStore::finalize`] balance updates atomically with respect to
/// each other for the same user.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Opens a balance row. Returns false if it already exists.
    async fn open_account(&self, user_id: &UserId, initial: Decimal) -> Result<bool>;

    /// Returns the settled balance, or `None` if no row exists.
    async fn balance(&self, user_id: &UserId) -> Result<Option<Decimal>>;

    /// Returns the sum of debits held by the user's pending entries.
    async fn pending_debits(&self, user_id: &UserId) -> Result<Decimal>;

    /// Inserts a pending entry after checking the account, funds and refund uniqueness.
    async fn insert_pending(&self, entry: &LedgerEntry) -> Result<RecordResult>;

    /// Moves a pending entry to `target`. Completing applies the amount to the balance.
    async fn finalize(
        &self,
        entry_id: &EntryId,
        target: EntryStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<FinalizeResult>;

    /// Gets an entry by ID.
    async fn get(&self, entry_id: &EntryId) -> Result<Option<LedgerEntry>>;

    /// Lists a user's entries, most recent first.
    async fn list_for_user(
        &self,
        user_id: &UserId,
        filter: &EntryFilter,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>>;

    /// Lists pending entries created strictly before `cutoff`, oldest first.
    async fn stale_pending(&self, cutoff: DateTime<Utc>) -> Result<Vec<LedgerEntry>>;

    /// Lists entries created in `[from, to)`, oldest first.
    async fn entries_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>>;

    /// Finds a pending or completed refund of `entry_id`.
    async fn refund_for(&self, entry_id: &EntryId) -> Result<Option<LedgerEntry>>;
}

/// The ledger service.
///
/// Validates requests and maps store outcomes onto domain errors.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").finish_non_exhaustive()
    }
}

impl Ledger {
    /// Creates a ledger over a store.
    #[must_use]
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            metrics: FlowMetrics::new(),
        }
    }

    /// Opens a user's balance row with an initial balance.
    ///
    /// Opening an existing account is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a negative initial balance.
    pub async fn open_account(&self, user_id: &UserId, initial: Decimal) -> Result<()> {
        if initial.is_sign_negative() {
            return Err(Error::validation("initial balance must not be negative"));
        }
        if self.store.open_account(user_id, initial).await? {
            tracing::info!(%user_id, %initial, "opened account");
        }
        Ok(())
    }

    /// Records a pending entry.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for a zero amount or a sign that does not match `kind`
    /// - [`Error::InsufficientFunds`] if a debit exceeds the available balance
    /// - [`Error::NotFound`] if the user has no account
    #[tracing::instrument(skip(self, description), fields(%user_id, %amount, %kind))]
    pub async fn record(
        &self,
        user_id: &UserId,
        amount: Decimal,
        kind: EntryKind,
        reference_task_id: Option<TaskId>,
        description: Option<String>,
    ) -> Result<LedgerEntry> {
        let entry = LedgerEntry::pending(*user_id, amount, kind)
            .with_task(reference_task_id)
            .with_description(description);
        self.insert(entry).await
    }

    /// Records a pending refund of `original`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if `original` already has a live refund,
    /// plus the errors of [`Ledger::record`].
    pub async fn record_refund(
        &self,
        original: &LedgerEntry,
        amount: Decimal,
        description: String,
    ) -> Result<LedgerEntry> {
        let entry = LedgerEntry::pending(original.user_id, amount, EntryKind::Refund)
            .with_task(original.reference_task_id)
            .with_refund_of(original.id)
            .with_description(Some(description));
        self.insert(entry).await
    }

    async fn insert(&self, entry: LedgerEntry) -> Result<LedgerEntry> {
        validate_amount(entry.amount, entry.kind)?;

        match self.store.insert_pending(&entry).await? {
            RecordResult::Recorded => {
                self.metrics
                    .record_ledger_transition(entry.kind.as_label(), EntryStatus::Pending.as_label());
                tracing::debug!(entry_id = %entry.id, "recorded pending entry");
                Ok(entry)
            }
            RecordResult::AccountNotFound => Err(Error::not_found("account", entry.user_id)),
            RecordResult::InsufficientFunds { available } => Err(Error::InsufficientFunds {
                user_id: entry.user_id,
                available,
                required: entry.amount.abs(),
            }),
            RecordResult::AlreadyRefunded { existing } => Err(Error::InvalidState {
                entity: "ledger entry",
                id: entry.refund_of.map_or_else(String::new, |id| id.to_string()),
                from: format!("refunded by {existing}"),
                to: EntryKind::Refund.to_string(),
            }),
        }
    }

    /// Settles a pending entry, applying its amount to the balance.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if the entry is not pending
    /// - [`Error::InsufficientFunds`] if settling would overdraw the account
    /// - [`Error::NotFound`] if the entry does not exist
    #[tracing::instrument(skip(self), fields(%entry_id))]
    pub async fn settle(&self, entry_id: &EntryId) -> Result<LedgerEntry> {
        self.finalize(entry_id, EntryStatus::Completed, None).await
    }

    /// Marks a pending entry failed, appending `reason`. The balance is untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the entry is not pending.
    #[tracing::instrument(skip(self), fields(%entry_id))]
    pub async fn fail(&self, entry_id: &EntryId, reason: &str) -> Result<LedgerEntry> {
        self.finalize(entry_id, EntryStatus::Failed, Some(reason)).await
    }

    /// Marks a pending entry cancelled, appending `reason`. The balance is untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the entry is not pending.
    #[tracing::instrument(skip(self), fields(%entry_id))]
    pub async fn cancel(&self, entry_id: &EntryId, reason: &str) -> Result<LedgerEntry> {
        self.finalize(entry_id, EntryStatus::Cancelled, Some(reason)).await
    }

    async fn finalize(
        &self,
        entry_id: &EntryId,
        target: EntryStatus,
        reason: Option<&str>,
    ) -> Result<LedgerEntry> {
        match self.store.finalize(entry_id, target, reason, Utc::now()).await? {
            FinalizeResult::Finalized(entry) => {
                self.metrics
                    .record_ledger_transition(entry.kind.as_label(), target.as_label());
                tracing::info!(
                    user_id = %entry.user_id,
                    amount = %entry.amount,
                    status = %target,
                    "ledger entry finalized"
                );
                Ok(entry)
            }
            FinalizeResult::NotFound => Err(Error::not_found("ledger entry", entry_id)),
            FinalizeResult::NotPending(entry) => Err(entry.invalid_transition(target)),
            FinalizeResult::Overdraft { balance } => {
                let entry = self
                    .store
                    .get(entry_id)
                    .await?
                    .ok_or_else(|| Error::not_found("ledger entry", entry_id))?;
                Err(Error::InsufficientFunds {
                    user_id: entry.user_id,
                    available: balance,
                    required: entry.amount.abs(),
                })
            }
        }
    }

    /// Returns a user's entries, most recent first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn history(&self, user_id: &UserId, limit: usize) -> Result<Vec<LedgerEntry>> {
        self.store
            .list_for_user(user_id, &EntryFilter::default(), limit)
            .await
    }

    /// Returns a user's entries matching `filter`, most recent first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn transactions(
        &self,
        user_id: &UserId,
        filter: &EntryFilter,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>> {
        self.store.list_for_user(user_id, filter, limit).await
    }

    /// Returns the settled balance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the user has no account.
    pub async fn balance(&self, user_id: &UserId) -> Result<Decimal> {
        self.store
            .balance(user_id)
            .await?
            .ok_or_else(|| Error::not_found("account", user_id))
    }

    /// Returns the settled balance minus debits held by pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the user has no account.
    pub async fn available_balance(&self, user_id: &UserId) -> Result<Decimal> {
        let balance = self.balance(user_id).await?;
        let held = self.store.pending_debits(user_id).await?;
        Ok(balance - held)
    }

    /// Gets an entry by ID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the entry does not exist.
    pub async fn entry(&self, entry_id: &EntryId) -> Result<LedgerEntry> {
        self.store
            .get(entry_id)
            .await?
            .ok_or_else(|| Error::not_found("ledger entry", entry_id))
    }

    /// Pending entries created before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn stale_pending(&self, cutoff: DateTime<Utc>) -> Result<Vec<LedgerEntry>> {
        self.store.stale_pending(cutoff).await
    }

    /// Entries created in `[from, to)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn entries_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>> {
        self.store.entries_between(from, to).await
    }

    /// The live refund of `entry_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn refund_for(&self, entry_id: &EntryId) -> Result<Option<LedgerEntry>> {
        self.store.refund_for(entry_id).await
    }
}

fn validate_amount(amount: Decimal, kind: EntryKind) -> Result<()> {
    if amount.is_zero() {
        return Err(Error::validation("amount must not be zero"));
    }
    if kind.is_debit() != amount.is_sign_negative() {
        let expected = if kind.is_debit() { "negative" } else { "positive" };
        return Err(Error::validation(format!(
            "{kind} amount must be {expected}, got {amount}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::InMemoryLedgerStore;
    use rust_decimal_macros::dec;

    async fn ledger_with(balance: Decimal) -> (Ledger, UserId) {
        let user = UserId::generate();
        let ledger = Ledger::new(Arc::new(InMemoryLedgerStore::new()));
        ledger.open_account(&user, balance).await.unwrap();
        (ledger, user)
    }

    #[tokio::test]
    async fn settle_applies_amount() {
        let (ledger, user) = ledger_with(dec!(100)).await;

        let entry = ledger
            .record(&user, dec!(-30), EntryKind::Charge, None, None)
            .await
            .unwrap();
        assert_eq!(ledger.balance(&user).await.unwrap(), dec!(100));
        assert_eq!(ledger.available_balance(&user).await.unwrap(), dec!(70));

        let settled = ledger.settle(&entry.id).await.unwrap();
        assert_eq!(settled.status, EntryStatus::Completed);
        assert!(settled.completed_at.is_some());
        assert_eq!(ledger.balance(&user).await.unwrap(), dec!(70));
    }

    #[tokio::test]
    async fn fail_leaves_balance_and_appends_reason() {
        let (ledger, user) = ledger_with(dec!(50)).await;
        let entry = ledger
            .record(&user, dec!(-10), EntryKind::Charge, None, Some("task".into()))
            .await
            .unwrap();

        let failed = ledger.fail(&entry.id, "model crashed").await.unwrap();
        assert_eq!(failed.status, EntryStatus::Failed);
        assert_eq!(failed.description.as_deref(), Some("task | model crashed"));
        assert_eq!(ledger.balance(&user).await.unwrap(), dec!(50));
        assert_eq!(ledger.available_balance(&user).await.unwrap(), dec!(50));
    }

    #[tokio::test]
    async fn second_finalize_is_invalid_state() {
        let (ledger, user) = ledger_with(dec!(50)).await;
        let entry = ledger
            .record(&user, dec!(-10), EntryKind::Charge, None, None)
            .await
            .unwrap();
        ledger.fail(&entry.id, "first").await.unwrap();

        let err = ledger.fail(&entry.id, "second").await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        let err = ledger.settle(&entry.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));

        let stored = ledger.entry(&entry.id).await.unwrap();
        assert_eq!(stored.description.as_deref(), Some("first"));
        assert_eq!(ledger.balance(&user).await.unwrap(), dec!(50));
    }

    #[tokio::test]
    async fn record_rejects_bad_amounts() {
        let (ledger, user) = ledger_with(dec!(50)).await;

        let err = ledger
            .record(&user, Decimal::ZERO, EntryKind::Deposit, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        let err = ledger
            .record(&user, dec!(10), EntryKind::Charge, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        let err = ledger
            .record(&user, dec!(-10), EntryKind::Deposit, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn debit_beyond_available_is_rejected() {
        let (ledger, user) = ledger_with(dec!(50)).await;
        ledger
            .record(&user, dec!(-40), EntryKind::Charge, None, None)
            .await
            .unwrap();

        let err = ledger
            .record(&user, dec!(-20), EntryKind::Charge, None, None)
            .await
            .unwrap_err();
        match err {
            Error::InsufficientFunds {
                available,
                required,
                ..
            } => {
                assert_eq!(available, dec!(10));
                assert_eq!(required, dec!(20));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unknown_account_is_not_found() {
        let ledger = Ledger::new(Arc::new(InMemoryLedgerStore::new()));
        let err = ledger
            .record(&UserId::generate(), dec!(5), EntryKind::Deposit, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { resource: "account", .. }));
    }

    #[tokio::test]
    async fn history_is_most_recent_first_and_bounded() {
        let (ledger, user) = ledger_with(dec!(0)).await;
        for amount in [dec!(1), dec!(2), dec!(3)] {
            let e = ledger
                .record(&user, amount, EntryKind::Deposit, None, None)
                .await
                .unwrap();
            ledger.settle(&e.id).await.unwrap();
        }

        let history = ledger.history(&user, 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].amount, dec!(3));
        assert_eq!(history[1].amount, dec!(2));
        assert_eq!(ledger.balance(&user).await.unwrap(), dec!(6));
    }

    #[tokio::test]
    async fn refund_is_recorded_once() {
        let (ledger, user) = ledger_with(dec!(20)).await;
        let charge = ledger
            .record(&user, dec!(-5), EntryKind::Charge, None, None)
            .await
            .unwrap();
        let charge = ledger.settle(&charge.id).await.unwrap();

        let refund = ledger
            .record_refund(&charge, dec!(5), "bad output".into())
            .await
            .unwrap();
        assert_eq!(refund.refund_of, Some(charge.id));
        assert_eq!(
            ledger.refund_for(&charge.id).await.unwrap().map(|e| e.id),
            Some(refund.id)
        );

        let err = ledger
            .record_refund(&charge, dec!(5), "again".into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[test]
    fn entry_filter_matches() {
        let entry = LedgerEntry::pending(UserId::generate(), dec!(-1), EntryKind::Charge);
        assert!(EntryFilter::default().matches(&entry));
        assert!(
            EntryFilter {
                kind: Some(EntryKind::Charge),
                status: Some(EntryStatus::Pending)
            }
            .matches(&entry)
        );
        assert!(
            !EntryFilter {
                kind: Some(EntryKind::Deposit),
                status: None
            }
            .matches(&entry)
        );
    }

    #[test]
    fn entry_status_transitions() {
        assert!(EntryStatus::Pending.can_transition_to(EntryStatus::Completed));
        assert!(EntryStatus::Pending.can_transition_to(EntryStatus::Cancelled));
        assert!(!EntryStatus::Pending.can_transition_to(EntryStatus::Pending));
        assert!(!EntryStatus::Failed.can_transition_to(EntryStatus::Completed));
        assert!(!EntryStatus::Completed.can_transition_to(EntryStatus::Failed));
    }
}
