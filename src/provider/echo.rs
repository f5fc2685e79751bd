//! Builtin provider that mirrors inputs as outputs.
//!
//! Nothing is created anywhere. Ids are random UUIDs. Handy for dry runs of
//! a stack's wiring and for tests.

use async_trait::async_trait;
use std::collections::BTreeSet;
use tracing::debug;

use crate::error::ProviderError;
use crate::graph::Properties;

use super::plugin::{Created, Provider, UpdateOutcome};

/// Provider whose outputs are its inputs.
#[derive(Debug, Clone, Default)]
pub struct EchoProvider {
    /// Input keys whose change forces a replacement.
    force_new: BTreeSet<String>,
}

impl EchoProvider {
    /// Creates an echo provider that updates everything in place.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks input keys that cannot change in place.
    #[must_use]
    pub fn with_force_new<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.force_new.extend(keys.into_iter().map(Into::into));
        self
    }
}

#[async_trait]
impl Provider for EchoProvider {
    async fn create(&self, kind: &str, inputs: &Properties) -> Result<Created, ProviderError> {
        let id = uuid::Uuid::new_v4().to_string();
        debug!("echo: create {kind} -> {id}");
        Ok(Created {
            id,
            outputs: inputs.clone(),
        })
    }

    async fn update(
        &self,
        kind: &str,
        id: &str,
        old_inputs: &Properties,
        new_inputs: &Properties,
    ) -> Result<UpdateOutcome, ProviderError> {
        let replace = self
            .force_new
            .iter()
            .any(|key| old_inputs.get(key) != new_inputs.get(key));
        if replace {
            debug!("echo: {kind} {id} needs replacement");
            return Ok(UpdateOutcome::RequiresReplacement);
        }
        debug!("echo: update {kind} {id}");
        Ok(UpdateOutcome::Updated(new_inputs.clone()))
    }

    async fn delete(&self, kind: &str, id: &str, _outputs: &Properties) -> Result<(), ProviderError> {
        debug!("echo: delete {kind} {id}");
        Ok(())
    }
}
