//! In-memory ledger store for testing.
//!
//! This module provides [`InMemoryLedgerStore`], a simple in-memory
//! implementation of the [`LedgerStore`] trait.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process coordination
//! - **Single-process only**: State is not shared across process boundaries
//! - **No persistence**: All state is lost when the process exits

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use tollgate_core::{EntryId, UserId};

use super::{
    EntryFilter, EntryKind, EntryStatus, FinalizeResult, LedgerEntry, LedgerStore, RecordResult,
};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct LedgerState {
    balances: HashMap<UserId, Decimal>,
    /// Entries in insertion order.
    entries: Vec<LedgerEntry>,
    index: HashMap<EntryId, usize>,
}

impl LedgerState {
    fn pending_debits(&self, user_id: &UserId) -> Decimal {
        self.entries
            .iter()
            .filter(|e| e.user_id == *user_id)
            .map(LedgerEntry::held_debit)
            .sum()
    }

    fn live_refund(&self, entry_id: &EntryId) -> Option<&LedgerEntry> {
        self.entries.iter().find(|e| {
            e.kind == EntryKind::Refund
                && e.refund_of == Some(*entry_id)
                && matches!(e.status, EntryStatus::Pending | EntryStatus::Completed)
        })
    }
}

/// In-memory ledger store.
///
/// Entry and balance rows live behind one `RwLock`, so each insert and
/// finalization is atomic.
///
/// ## Example
///
/// ```rust
/// use rust_decimal_macros::dec;
/// use tollgate_core::UserId;
/// use tollgate_flow::ledger::memory::InMemoryLedgerStore;
///
/// let user = UserId::generate();
/// let store = InMemoryLedgerStore::new().with_account(user, dec!(100));
/// ```
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    state: RwLock<LedgerState>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("ledger lock poisoned")
}

impl InMemoryLedgerStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an account with a balance.
    #[must_use]
    pub fn with_account(mut self, user_id: UserId, balance: Decimal) -> Self {
        self.state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .balances
            .insert(user_id, balance);
        self
    }

    /// Returns the number of entries stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn entry_count(&self) -> Result<usize> {
        let count = {
            let state = self.state.read().map_err(poison_err)?;
            state.entries.len()
        };
        Ok(count)
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn open_account(&self, user_id: &UserId, initial: Decimal) -> Result<bool> {
        let mut state = self.state.write().map_err(poison_err)?;
        if state.balances.contains_key(user_id) {
            drop(state);
            return Ok(false);
        }
        state.balances.insert(*user_id, initial);
        drop(state);
        Ok(true)
    }

    async fn balance(&self, user_id: &UserId) -> Result<Option<Decimal>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state.balances.get(user_id).copied()
        };
        Ok(result)
    }

    async fn pending_debits(&self, user_id: &UserId) -> Result<Decimal> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state.pending_debits(user_id)
        };
        Ok(result)
    }

    async fn insert_pending(&self, entry: &LedgerEntry) -> Result<RecordResult> {
        let mut state = self.state.write().map_err(poison_err)?;

        let Some(balance) = state.balances.get(&entry.user_id).copied() else {
            drop(state);
            return Ok(RecordResult::AccountNotFound);
        };

        if entry.kind.is_debit() {
            let available = balance - state.pending_debits(&entry.user_id);
            if available < entry.amount.abs() {
                drop(state);
                return Ok(RecordResult::InsufficientFunds { available });
            }
        }

        if let Some(original) = entry.refund_of {
            if let Some(existing) = state.live_refund(&original) {
                let existing = existing.id;
                drop(state);
                return Ok(RecordResult::AlreadyRefunded { existing });
            }
        }

        let position = state.entries.len();
        state.entries.push(entry.clone());
        state.index.insert(entry.id, position);
        drop(state);
        Ok(RecordResult::Recorded)
    }

    async fn finalize(
        &self,
        entry_id: &EntryId,
        target: EntryStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<FinalizeResult> {
        let mut state = self.state.write().map_err(poison_err)?;

        let Some(position) = state.index.get(entry_id).copied() else {
            drop(state);
            return Ok(FinalizeResult::NotFound);
        };

        let entry = state.entries[position].clone();
        if !entry.status.can_transition_to(target) {
            drop(state);
            return Ok(FinalizeResult::NotPending(entry));
        }

        let new_balance = if target == EntryStatus::Completed {
            let balance = state.balances.get(&entry.user_id).copied().unwrap_or_default();
            let updated = balance + entry.amount;
            if updated < Decimal::ZERO {
                drop(state);
                return Ok(FinalizeResult::Overdraft { balance });
            }
            Some(updated)
        } else {
            None
        };

        let mut finished = entry;
        finished.finish(target, reason, now)?;
        state.entries[position] = finished.clone();
        if let Some(updated) = new_balance {
            state.balances.insert(finished.user_id, updated);
        }
        drop(state);
        Ok(FinalizeResult::Finalized(finished))
    }

    async fn get(&self, entry_id: &EntryId) -> Result<Option<LedgerEntry>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .index
                .get(entry_id)
                .and_then(|&i| state.entries.get(i))
                .cloned()
        };
        Ok(result)
    }

    async fn list_for_user(
        &self,
        user_id: &UserId,
        filter: &EntryFilter,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let mut result: Vec<(usize, LedgerEntry)> = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.user_id == *user_id && filter.matches(e))
                .map(|(i, e)| (i, e.clone()))
                .collect()
        };
        result.sort_by(|(ia, a), (ib, b)| b.created_at.cmp(&a.created_at).then(ib.cmp(ia)));
        Ok(result.into_iter().take(limit).map(|(_, e)| e).collect())
    }

    async fn stale_pending(&self, cutoff: DateTime<Utc>) -> Result<Vec<LedgerEntry>> {
        let mut result: Vec<LedgerEntry> = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .entries
                .iter()
                .filter(|e| e.is_pending() && e.created_at < cutoff)
                .cloned()
                .collect()
        };
        result.sort_by_key(|e| e.created_at);
        Ok(result)
    }

    async fn entries_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>> {
        let mut result: Vec<LedgerEntry> = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .entries
                .iter()
                .filter(|e| e.created_at >= from && e.created_at < to)
                .cloned()
                .collect()
        };
        result.sort_by_key(|e| e.created_at);
        Ok(result)
    }

    async fn refund_for(&self, entry_id: &EntryId) -> Result<Option<LedgerEntry>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state.live_refund(entry_id).cloned()
        };
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn finalize_completed_updates_balance_atomically() {
        let user = UserId::generate();
        let store = InMemoryLedgerStore::new().with_account(user, dec!(10));
        let entry = LedgerEntry::pending(user, dec!(-4), EntryKind::Charge);
        assert_eq!(
            store.insert_pending(&entry).await.unwrap(),
            RecordResult::Recorded
        );
        assert_eq!(store.pending_debits(&user).await.unwrap(), dec!(4));

        let result = store
            .finalize(&entry.id, EntryStatus::Completed, None, Utc::now())
            .await
            .unwrap();
        assert!(result.is_finalized());
        assert_eq!(store.balance(&user).await.unwrap(), Some(dec!(6)));
        assert_eq!(store.pending_debits(&user).await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn pending_debits_reduce_available_balance() {
        let user = UserId::generate();
        let store = InMemoryLedgerStore::new().with_account(user, dec!(10));
        let entry = LedgerEntry::pending(user, dec!(-8), EntryKind::Charge);
        store.insert_pending(&entry).await.unwrap();

        let drain = LedgerEntry::pending(user, dec!(-2), EntryKind::Withdrawal);
        store.insert_pending(&drain).await.unwrap();
        store
            .finalize(&drain.id, EntryStatus::Completed, None, Utc::now())
            .await
            .unwrap();
        let extra = LedgerEntry::pending(user, dec!(-8), EntryKind::Charge);
        assert!(matches!(
            store.insert_pending(&extra).await.unwrap(),
            RecordResult::InsufficientFunds { available } if available == Decimal::ZERO
        ));

        let settled = store
            .finalize(&entry.id, EntryStatus::Completed, None, Utc::now())
            .await
            .unwrap();
        assert!(settled.is_finalized());
        assert_eq!(store.balance(&user).await.unwrap(), Some(Decimal::ZERO));
    }

    #[tokio::test]
    async fn settle_refuses_negative_balance() {
        let user = UserId::generate();
        let store = InMemoryLedgerStore::new().with_account(user, dec!(5));
        // Insert directly to skip the available-balance check.
        let entry = LedgerEntry::pending(user, dec!(-5), EntryKind::Charge);
        store.insert_pending(&entry).await.unwrap();
        let other = LedgerEntry::pending(user, dec!(-5), EntryKind::Charge);
        {
            let mut state = store.state.write().unwrap();
            let position = state.entries.len();
            state.entries.push(other.clone());
            state.index.insert(other.id, position);
        }
        store
            .finalize(&entry.id, EntryStatus::Completed, None, Utc::now())
            .await
            .unwrap();

        let result = store
            .finalize(&other.id, EntryStatus::Completed, None, Utc::now())
            .await
            .unwrap();
        assert_eq!(result, FinalizeResult::Overdraft { balance: dec!(0) });
        assert!(store.get(&other.id).await.unwrap().unwrap().is_pending());
    }

    #[tokio::test]
    async fn stale_pending_uses_strict_cutoff() {
        let user = UserId::generate();
        let store = InMemoryLedgerStore::new().with_account(user, dec!(100));
        let now = Utc::now();
        let old = LedgerEntry::pending(user, dec!(-1), EntryKind::Charge)
            .with_created_at(now - Duration::minutes(20));
        let fresh = LedgerEntry::pending(user, dec!(-1), EntryKind::Charge)
            .with_created_at(now - Duration::minutes(5));
        store.insert_pending(&old).await.unwrap();
        store.insert_pending(&fresh).await.unwrap();

        let stale = store
            .stale_pending(now - Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old.id);
    }

    #[tokio::test]
    async fn open_account_is_idempotent() {
        let user = UserId::generate();
        let store = InMemoryLedgerStore::new();
        assert!(store.open_account(&user, dec!(3)).await.unwrap());
        assert!(!store.open_account(&user, dec!(9)).await.unwrap());
        assert_eq!(store.balance(&user).await.unwrap(), Some(dec!(3)));
    }
}
