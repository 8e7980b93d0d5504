//! Error types for the billing and task execution domain.
//!
//! Every failure is a closed variant so callers switch on kind, never on
//! message text. Two classifications drive behavior:
//!
//! - [`Error::is_expected`]: business-rule rejections. Workers fail the task
//!   immediately without retrying.
//! - [`Error::is_retryable`]: transient infrastructure failures. Workers
//!   reschedule the job with backoff.

use rust_decimal::Decimal;
use tollgate_core::{ModelId, ModelVersionId, UserId};

/// The result type used throughout tollgate-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a capacity check rejected an enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapacityReason {
    /// The user already has too many pending or processing tasks.
    UserLimit {
        /// Current number of outstanding tasks for the user.
        current: usize,
        /// Maximum allowed.
        limit: usize,
    },
    /// The target lane is at its ceiling.
    LaneFull {
        /// The lane that is full.
        lane: String,
        /// The lane's configured ceiling.
        capacity: usize,
    },
}

impl std::fmt::Display for CapacityReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserLimit { current, limit } => {
                write!(f, "user limit reached: {current}/{limit} outstanding tasks")
            }
            Self::LaneFull { lane, capacity } => {
                write!(f, "lane full: queue '{lane}' is at capacity ({capacity})")
            }
        }
    }
}

/// Errors that can occur in billing and task execution.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input (bad amount, empty payload, malformed request).
    #[error("validation error: {message}")]
    Validation {
        /// Description of what was invalid.
        message: String,
    },

    /// The user's available balance does not cover a debit.
    #[error("insufficient funds for user {user_id}: available {available}, required {required}")]
    InsufficientFunds {
        /// The user being debited.
        user_id: UserId,
        /// Available balance at the time of the check.
        available: Decimal,
        /// Amount that was required.
        required: Decimal,
    },

    /// A queue or per-user limit rejected the request.
    #[error("capacity exceeded: {reason}")]
    Capacity {
        /// Which limit was hit.
        reason: CapacityReason,
    },

    /// Another operation holds the user's reservation lock.
    #[error("concurrent modification: another billing operation is in flight for user {user_id}")]
    ConcurrentModification {
        /// The contended user.
        user_id: UserId,
    },

    /// An illegal state transition was attempted.
    #[error("invalid state transition for {entity} {id}: {from} -> {to}")]
    InvalidState {
        /// Entity kind (`task`, `ledger entry`).
        entity: &'static str,
        /// Entity identifier.
        id: String,
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
    },

    /// A resource was not found.
    #[error("{resource} not found: {id}")]
    NotFound {
        /// The type of resource.
        resource: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// The requested model or model version does not exist.
    #[error("model not found: {model_id}{}", version_suffix(.version_id))]
    ModelNotFound {
        /// The model that was requested.
        model_id: ModelId,
        /// The specific version, if one was requested.
        version_id: Option<ModelVersionId>,
    },

    /// The requester may not access the resource.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denial.
        message: String,
    },

    /// Inference failed for a reason that may not recur.
    #[error("inference failed: {message}")]
    Inference {
        /// Description of the failure.
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

    /// Submitting to or revoking from the job queue failed.
    #[error("dispatch error: {message}")]
    Dispatch {
        /// Description of the dispatch failure.
        message: String,
    },

    /// Invalid configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from tollgate-core.
    #[error("core error: {0}")]
    Core(#[from] tollgate_core::Error),
}

impl Error {
    /// Creates a new validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
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

    /// Creates a new dispatch error.
    #[must_use]
    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::Dispatch {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new not found error.
    #[must_use]
    pub fn not_found(resource: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    /// Returns true for business-rule rejections that must not be retried.
    #[must_use]
    pub const fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::InsufficientFunds { .. }
                | Self::ModelNotFound { .. }
                | Self::PermissionDenied { .. }
                | Self::Capacity { .. }
        )
    }

    /// Returns true for transient failures where retrying may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Storage { .. }
            | Self::Dispatch { .. }
            | Self::Inference { .. }
            | Self::ConcurrentModification { .. } => true,
            Self::Core(inner) => inner.is_transient(),
            _ => false,
        }
    }

    /// Returns the HTTP status code the API layer reports for this error.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::InsufficientFunds { .. } => 402,
            Self::PermissionDenied { .. } => 403,
            Self::NotFound { .. } | Self::ModelNotFound { .. } => 404,
            Self::InvalidState { .. } | Self::ConcurrentModification { .. } => 409,
            Self::Capacity { .. } => 429,
            Self::Storage { .. } | Self::Dispatch { .. } => 503,
            Self::Core(inner) => {
                if inner.is_transient() {
                    503
                } else {
                    500
                }
            }
            Self::Inference { .. } | Self::Configuration { .. } | Self::Serialization { .. } => {
                500
            }
        }
    }
}

fn version_suffix(version_id: &Option<ModelVersionId>) -> String {
    version_id.map(|v| format!(" (version {v})")).unwrap_or_default()
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<csv::Error> for Error {
    fn from(err: csv::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}
