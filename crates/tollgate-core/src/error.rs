//! Error types and result aliases for Tollgate.
//!
//! This module defines the shared error types used by every Tollgate crate.
//! Domain crates wrap these in their own error enums via `#[from]`.

use std::fmt;

/// The result type used throughout tollgate-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in shared Tollgate primitives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The requested resource was not found.
    #[error("not found: {resource_type} with id {id}")]
    ResourceNotFound {
        /// The type of resource that was not found.
        resource_type: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A lock is held by another holder.
    #[error("lock contended: {key} held by {holder}")]
    LockContended {
        /// The lock key that was contended.
        key: String,
        /// The holder that currently owns the lease.
        holder: String,
    },

    /// A precondition for the operation was not met.
    #[error("precondition failed: {message}")]
    PreconditionFailed {
        /// Description of the failed precondition.
        message: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new resource not found error.
    #[must_use]
    pub fn resource_not_found(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::ResourceNotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Returns true if the error is transient and the operation may succeed on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::LockContended { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn storage_error_keeps_source() {
        let source = std::io::Error::new(std::io::ErrorKind::TimedOut, "db timeout");
        let err = Error::storage_with_source("balance update failed", source);
        assert!(err.to_string().contains("storage error"));
        assert!(StdError::source(&err).is_some());
        assert!(err.is_transient());
    }

    #[test]
    fn resource_not_found_display() {
        let err = Error::resource_not_found("account", "user-1");
        assert_eq!(err.to_string(), "not found: account with id user-1");
        assert!(!err.is_transient());
    }

    #[test]
    fn lock_contended_is_transient() {
        let err = Error::LockContended {
            key: "user:1".into(),
            holder: "worker-a".into(),
        };
        assert!(err.is_transient());
        assert!(err.to_string().contains("user:1"));
    }
}
