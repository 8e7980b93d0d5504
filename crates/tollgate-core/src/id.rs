//! Strongly-typed identifiers for Tollgate entities.
//!
//! All identifiers in Tollgate are:
//! - **Strongly typed**: A ledger entry ID cannot be passed where a task ID is expected
//! - **Lexicographically sortable**: ULIDs encode creation time and sort naturally
//! - **Globally unique**: No coordination required for generation
//!
//! # Example
//!
//! ```rust
//! use tollgate_core::id::{TaskId, UserId};
//!
//! let user = UserId::generate();
//! let task = TaskId::generate();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: UserId = task;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            #[doc = concat!("Generates a new unique ", $label, " ID.")]
            #[must_use]
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            #[doc = concat!("Creates a ", $label, " ID from a raw ULID.")]
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Returns the creation timestamp encoded in the ID.
            #[must_use]
            pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
                i64::try_from(self.0.timestamp_ms())
                    .ok()
                    .and_then(chrono::DateTime::from_timestamp_millis)
                    .unwrap_or_else(chrono::Utc::now)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Ulid::from_string(s)
                    .map(Self)
                    .map_err(|e| Error::InvalidId {
                        message: format!(concat!("invalid ", $label, " ID '{}': {}"), s, e),
                    })
            }
        }
    };
}

ulid_id!(
    /// A unique identifier for an account holder.
    ///
    /// Users own balances, ledger entries and tasks.
    UserId,
    "user"
);

ulid_id!(
    /// A unique identifier for a classification task.
    ///
    /// The task ID doubles as the external job ID so tasks and queued jobs
    /// stay correlated one to one.
    TaskId,
    "task"
);

ulid_id!(
    /// A unique identifier for a ledger entry.
    EntryId,
    "entry"
);

ulid_id!(
    /// A unique identifier for a deployed model.
    ModelId,
    "model"
);

ulid_id!(
    /// A unique identifier for a specific version of a model.
    ModelVersionId,
    "model version"
);
