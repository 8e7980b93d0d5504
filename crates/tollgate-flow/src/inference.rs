//! Inference collaborator interface.
//!
//! Workers call an [`InferenceEngine`] outside any lock. Failures are typed:
//! [`InferenceError::is_expected`] separates bad requests (never retried)
//! from transient faults (retried with backoff).

use async_trait::async_trait;

use tollgate_core::{ModelId, ModelVersionId};

use crate::error::Error;
use crate::task::Payload;

/// Failure raised by an inference engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InferenceError {
    /// The model or version does not exist.
    #[error("model not found: {model_id}")]
    ModelNotFound {
        /// The requested model.
        model_id: ModelId,
        /// The requested version, if any.
        version_id: Option<ModelVersionId>,
    },

    /// The payload was rejected by the model.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Description of what was invalid.
        message: String,
    },

    /// Any other failure (resource exhaustion, backend down, crash).
    #[error("inference failed: {message}")]
    Failed {
        /// Description of the failure.
        message: String,
    },
}

impl InferenceError {
    /// Creates a generic failure.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Creates an invalid input failure.
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Returns true for failures that retrying cannot fix.
    #[must_use]
    pub const fn is_expected(&self) -> bool {
        matches!(self, Self::ModelNotFound { .. } | Self::InvalidInput { .. })
    }
}

impl From<InferenceError> for Error {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::ModelNotFound {
                model_id,
                version_id,
            } => Self::ModelNotFound {
                model_id,
                version_id,
            },
            InferenceError::InvalidInput { message } => Self::Validation { message },
            InferenceError::Failed { message } => Self::Inference { message },
        }
    }
}

/// ML inference backend.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Runs one prediction.
    async fn predict(
        &self,
        model_id: &ModelId,
        version_id: Option<&ModelVersionId>,
        payload: &Payload,
    ) -> std::result::Result<Payload, InferenceError>;

    /// Runs predictions over a chunk of items, one output per item.
    ///
    /// The default implementation calls [`InferenceEngine::predict`] per item
    /// and fails the whole chunk on the first error.
    async fn batch_predict(
        &self,
        model_id: &ModelId,
        version_id: Option<&ModelVersionId>,
        items: &[Payload],
    ) -> std::result::Result<Vec<Payload>, InferenceError> {
        let mut outputs = Vec::with_capacity(items.len());
        for item in items {
            outputs.push(self.predict(model_id, version_id, item).await?);
        }
        Ok(outputs)
    }
}
