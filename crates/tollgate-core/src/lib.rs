//! # tollgate-core
//!
//! Core abstractions for the Tollgate metered inference platform.
//!
//! This crate provides the foundational types and traits used across all Tollgate components:
//!
//! - **Identifiers**: Strongly-typed IDs for users, tasks, ledger entries and models
//! - **Advisory Locks**: Keyed TTL leases used to serialize per-user balance mutations
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Crate Boundary
//!
//! `tollgate-core` holds the primitives shared between crates. Domain logic
//! (ledger, dispatch, workers) lives in `tollgate-flow`.
//!
//! ## Example
//!
//! ```rust
//! use tollgate_core::prelude::*;
//!
//! let user = UserId::generate();
//! let task = TaskId::generate();
//! assert_ne!(user.to_string(), task.to_string());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod lock;
pub mod observability;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use tollgate_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{EntryId, ModelId, ModelVersionId, TaskId, UserId};
    pub use crate::lock::{AdvisoryLock, InMemoryAdvisoryLock, LockAttempt, LockGuard, LockInfo};
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use id::{EntryId, ModelId, ModelVersionId, TaskId, UserId};
pub use lock::{AdvisoryLock, InMemoryAdvisoryLock, LockAttempt, LockGuard, LockInfo};
pub use observability::{LogFormat, init_logging};
