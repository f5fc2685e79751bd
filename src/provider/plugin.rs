//! Provider plugin interface.
//!
//! A provider implements create, update and delete for one or more resource
//! kinds. Providers never see unresolved values: every input they receive has
//! already been resolved by the executor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::graph::Properties;

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Created {
    /// External identifier assigned by the provider.
    pub id: String,
    /// Output properties.
    #[serde(default)]
    pub outputs: Properties,
}

/// Result of a successful update call.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// Updated in place; carries the new outputs.
    Updated(Properties),
    /// The change cannot be applied in place; delete and re-create.
    RequiresReplacement,
}

/// A provider plugin.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates a resource of `kind` from resolved inputs.
    async fn create(&self, kind: &str, inputs: &Properties) -> Result<Created, ProviderError>;

    /// Updates an existing resource.
    async fn update(
        &self,
        kind: &str,
        id: &str,
        old_inputs: &Properties,
        new_inputs: &Properties,
    ) -> Result<UpdateOutcome, ProviderError>;

    /// Deletes an existing resource.
    async fn delete(&self, kind: &str, id: &str, outputs: &Properties) -> Result<(), ProviderError>;
}
