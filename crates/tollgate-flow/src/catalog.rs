//! Model catalog lookups.
//!
//! The task service checks that a requested model exists and is active, and
//! pricing reads its price per call.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use tollgate_core::{ModelId, ModelVersionId};

use crate::error::{Error, Result};

/// Catalog record for a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    /// Model identifier.
    pub id: ModelId,
    /// Display name.
    pub name: String,
    /// Price charged per single prediction.
    pub price_per_call: Decimal,
    /// Inactive models accept no new tasks.
    pub is_active: bool,
    /// Published versions.
    #[serde(default)]
    pub versions: Vec<ModelVersionId>,
}

impl ModelInfo {
    /// Creates an active model with no versions.
    #[must_use]
    pub fn new(name: impl Into<String>, price_per_call: Decimal) -> Self {
        Self {
            id: ModelId::generate(),
            name: name.into(),
            price_per_call,
            is_active: true,
            versions: Vec::new(),
        }
    }

    /// Adds a published version.
    #[must_use]
    pub fn with_version(mut self, version_id: ModelVersionId) -> Self {
        self.versions.push(version_id);
        self
    }

    /// Sets whether the model is active.
    #[must_use]
    pub const fn with_active(mut self, is_active: bool) -> Self {
        self.is_active = is_active;
        self
    }

    /// Returns true if the version is published (or none was requested).
    #[must_use]
    pub fn has_version(&self, version_id: Option<&ModelVersionId>) -> bool {
        version_id.is_none_or(|v| self.versions.contains(v))
    }
}

/// Read access to the model catalog.
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    /// Gets a model by ID.
    async fn get_model(&self, model_id: &ModelId) -> Result<Option<ModelInfo>>;

    /// Gets a model that exists, is active and publishes the requested version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModelNotFound`] otherwise.
    async fn require_active(
        &self,
        model_id: &ModelId,
        version_id: Option<&ModelVersionId>,
    ) -> Result<ModelInfo> {
        match self.get_model(model_id).await? {
            Some(model) if model.is_active && model.has_version(version_id) => Ok(model),
            _ => Err(Error::ModelNotFound {
                model_id: *model_id,
                version_id: version_id.copied(),
            }),
        }
    }
}

/// In-memory model catalog.
#[derive(Debug, Default)]
pub struct InMemoryModelCatalog {
    models: RwLock<HashMap<ModelId, ModelInfo>>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("model catalog lock poisoned")
}

impl InMemoryModelCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a model.
    #[must_use]
    pub fn with_model(mut self, model: ModelInfo) -> Self {
        self.models
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(model.id, model);
        self
    }

    /// Inserts or replaces a model.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn upsert(&self, model: ModelInfo) -> Result<()> {
        let mut models = self.models.write().map_err(poison_err)?;
        models.insert(model.id, model);
        drop(models);
        Ok(())
    }
}

#[async_trait]
impl ModelCatalog for InMemoryModelCatalog {
    async fn get_model(&self, model_id: &ModelId) -> Result<Option<ModelInfo>> {
        let models = self.models.read().map_err(poison_err)?;
        Ok(models.get(model_id).cloned())
    }
}
