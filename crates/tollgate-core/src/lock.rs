//! Advisory locks keyed by string, with TTL leases and fencing tokens.
//!
//! Locks are used to serialize short critical sections that touch the same
//! logical resource (for example every balance mutation of one user). They
//! provide:
//! - **Non-blocking attempts**: [`AdvisoryLock::try_acquire`] reports a held lock instead of waiting
//! - **TTL (Time-to-Live)**: A crashed holder's lease expires instead of deadlocking the key
//! - **Fencing**: Every acquisition carries a monotonically increasing sequence number
//!
//! # How It Works
//!
//! 1. Acquisition writes a lease with a fresh holder token and expiry time
//! 2. If a live lease exists for another holder, the attempt reports `Held`
//! 3. An expired lease is taken over and its sequence number incremented
//! 4. Release rewrites the lease as expired, preserving the sequence number
//!
//! # Example
//!
//! ```rust,ignore
//! let locks = InMemoryAdvisoryLock::new();
//!
//! // Acquire with a 30s lease, retrying up to 5 times while held
//! let guard = locks.acquire("user:42", Duration::from_secs(30), 5).await?;
//!
//! // Critical section - only one holder at a time
//! // ... update balance ...
//!
//! locks.release(&guard).await?;
//! ```

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};

/// Default lock TTL (30 seconds).
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// Default maximum retry attempts for [`AdvisoryLock::acquire`].
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Base backoff duration for retries.
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Maximum backoff duration.
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Lease record for a held (or previously held) key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// Unique token of the acquisition holding the lease.
    pub holder_id: String,

    /// When the lease expires.
    pub expires_at: DateTime<Utc>,

    /// When the lease was acquired.
    pub acquired_at: DateTime<Utc>,

    /// Monotonically increasing sequence number used as a fencing token.
    #[serde(default)]
    pub sequence_number: u64,

    /// Optional description of the operation holding the lease.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl LockInfo {
    /// Creates a new lease with the given holder ID, TTL, and sequence number.
    #[must_use]
    pub fn new(holder_id: impl Into<String>, ttl: Duration, sequence_number: u64) -> Self {
        let now = Utc::now();
        Self {
            holder_id: holder_id.into(),
            expires_at: now + ttl_to_chrono(ttl),
            acquired_at: now,
            sequence_number,
            operation: None,
        }
    }

    /// Returns whether this lease has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Returns whether this lease has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Returns the remaining TTL, or zero if expired.
    #[must_use]
    pub fn remaining_ttl(&self) -> Duration {
        let millis = (self.expires_at - Utc::now()).num_milliseconds();
        if millis <= 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
        }
    }
}

/// Proof of a successful acquisition.
///
/// Hand the guard back to [`AdvisoryLock::release`] when the critical
/// section ends. A guard that is never released expires with its TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    key: String,
    holder_id: String,
    fencing_token: u64,
    expires_at: DateTime<Utc>,
}

impl LockGuard {
    /// Returns the key this guard locks.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the holder token for this acquisition.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Returns the fencing token for this acquisition.
    ///
    /// A higher fencing token always takes precedence over a lower one.
    #[must_use]
    pub const fn fencing_token(&self) -> u64 {
        self.fencing_token
    }

    /// Returns when the lease backing this guard expires.
    #[must_use]
    pub const fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// Result of a single acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    /// The lock was acquired.
    Acquired(LockGuard),
    /// Another holder owns a live lease.
    Held {
        /// The current holder token.
        holder_id: String,
    },
}

impl LockAttempt {
    /// Returns true if the lock was acquired.
    #[must_use]
    pub const fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }
}

/// Advisory lock service keyed by string.
///
/// Implementations may target:
/// - A database row lock or lease table
/// - An external lock service
/// - An in-process lease map (for a single process and for tests)
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from
/// multiple workers.
#[async_trait]
pub trait AdvisoryLock: Send + Sync {
    /// Attempts to acquire the lock once, without waiting.
    async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
        operation: Option<&str>,
    ) -> Result<LockAttempt>;

    /// Releases a lease previously acquired.
    ///
    /// Returns `false` if the lease had already been taken over by another
    /// holder (after expiry); the other holder's lease is left intact.
    async fn release(&self, guard: &LockGuard) -> Result<bool>;

    /// Reads the current lease for a key without acquiring it.
    async fn read_lock_info(&self, key: &str) -> Result<Option<LockInfo>>;

    /// Checks if the key is currently locked by any holder.
    async fn is_locked(&self, key: &str) -> Result<bool> {
        Ok(self
            .read_lock_info(key)
            .await?
            .is_some_and(|info| !info.is_expired()))
    }

    /// Acquires the lock, retrying with exponential backoff while it is held.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockContended`] if the lock is still held after
    /// `max_retries` attempts.
    async fn acquire(&self, key: &str, ttl: Duration, max_retries: u32) -> Result<LockGuard> {
        let mut attempts = 0;
        let mut backoff = BACKOFF_BASE;

        loop {
            match self.try_acquire(key, ttl, None).await? {
                LockAttempt::Acquired(guard) => return Ok(guard),
                LockAttempt::Held { holder_id } => {
                    attempts += 1;
                    if attempts >= max_retries {
                        return Err(Error::LockContended {
                            key: key.to_string(),
                            holder: holder_id,
                        });
                    }

                    let jitter = Duration::from_millis(rand_jitter());
                    tokio::time::sleep(backoff.min(BACKOFF_MAX) + jitter).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }
}

/// In-process advisory lock backed by a lease map.
///
/// ## Limitations
///
/// - **Single-process only**: Leases are not visible across process boundaries
/// - **No persistence**: All leases are lost when the process exits
#[derive(Debug, Default)]
pub struct InMemoryAdvisoryLock {
    leases: RwLock<HashMap<String, LockInfo>>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("advisory lock map poisoned")
}

impl InMemoryAdvisoryLock {
    /// Creates an empty lock map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates a new unique holder token.
    fn generate_holder_id() -> String {
        Ulid::new().to_string()
    }
}

#[async_trait]
impl AdvisoryLock for InMemoryAdvisoryLock {
    async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
        operation: Option<&str>,
    ) -> Result<LockAttempt> {
        let mut leases = self.leases.write().map_err(poison_err)?;
        let now = Utc::now();

        let next_sequence = match leases.get(key) {
            Some(existing) if !existing.is_expired_at(now) => {
                let holder_id = existing.holder_id.clone();
                drop(leases);
                return Ok(LockAttempt::Held { holder_id });
            }
            Some(expired) => expired.sequence_number.saturating_add(1),
            None => 1,
        };

        let mut info = LockInfo::new(Self::generate_holder_id(), ttl, next_sequence);
        info.operation = operation.map(str::to_string);
        let guard = LockGuard {
            key: key.to_string(),
            holder_id: info.holder_id.clone(),
            fencing_token: info.sequence_number,
            expires_at: info.expires_at,
        };
        leases.insert(key.to_string(), info);
        drop(leases);

        Ok(LockAttempt::Acquired(guard))
    }

    async fn release(&self, guard: &LockGuard) -> Result<bool> {
        let mut leases = self.leases.write().map_err(poison_err)?;

        let Some(info) = leases.get_mut(guard.key()) else {
            return Ok(false);
        };
        if info.holder_id != guard.holder_id {
            return Ok(false);
        }

        // Keep the expired record so the next acquisition can bump the sequence.
        info.expires_at = Utc::now() - chrono::Duration::seconds(1);
        info.operation = None;
        drop(leases);
        Ok(true)
    }

    async fn read_lock_info(&self, key: &str) -> Result<Option<LockInfo>> {
        let leases = self.leases.read().map_err(poison_err)?;
        Ok(leases.get(key).cloned())
    }
}

fn ttl_to_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30))
}

/// Generates random jitter for backoff (0-50ms).
fn rand_jitter() -> u64 {
    use std::time::SystemTime;
    let seed = u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    seed % 50
}
