//! Resource declarations and handles.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::value::{ID_FIELD, Value};

/// Declared desired state of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Resource kind, `provider:type`.
    pub kind: String,
    /// Unique resource name within the stack.
    pub name: String,
    /// Input properties.
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    /// Explicit ordering-only dependencies.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
}

impl ResourceSpec {
    /// Creates a spec without inputs.
    #[must_use]
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            inputs: BTreeMap::new(),
            depends_on: BTreeSet::new(),
        }
    }

    /// Adds an input property.
    #[must_use]
    pub fn input(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    /// Adds an explicit dependency on another resource.
    #[must_use]
    pub fn depends_on(mut self, resource: impl Into<String>) -> Self {
        self.depends_on.insert(resource.into());
        self
    }

    /// Provider prefix of the kind (`azure` for `azure:network/Subnet`).
    #[must_use]
    pub fn provider_prefix(&self) -> &str {
        provider_prefix(&self.kind)
    }

    /// Resources whose outputs are referenced by the inputs.
    #[must_use]
    pub fn referenced_resources(&self) -> BTreeSet<String> {
        self.inputs
            .values()
            .flat_map(Value::references)
            .map(|r| r.resource.clone())
            .collect()
    }

    /// All resources this one depends on, references and `depends_on` combined.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<String> {
        let mut deps = self.referenced_resources();
        deps.extend(self.depends_on.iter().cloned());
        deps.remove(&self.name);
        deps
    }
}

/// Returns the provider prefix of a kind string.
#[must_use]
pub fn provider_prefix(kind: &str) -> &str {
    kind.split_once(':').map_or(kind, |(prefix, _)| prefix)
}

/// Handle returned by declaring a resource.
///
/// Its outputs are available as unresolved values immediately, so they can be
/// passed as inputs to resources declared later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    name: String,
}

impl ResourceHandle {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    /// Name of the declared resource.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reference to an output field of this resource.
    #[must_use]
    pub fn output(&self, field: &str) -> Value {
        Value::reference(&self.name, field)
    }

    /// Reference to the external id of this resource.
    #[must_use]
    pub fn id(&self) -> Value {
        self.output(ID_FIELD)
    }
}
