//! Registry of declared resources.

use std::collections::HashMap;

use crate::error::GraphError;

use super::resource::ResourceSpec;

/// Declared resources in declaration order.
#[derive(Debug, Default, Clone)]
pub struct ResourceRegistry {
    /// Specs in declaration order.
    specs: Vec<ResourceSpec>,
    /// Name to position in `specs`.
    index: HashMap<String, usize>,
}

impl ResourceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a spec.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DuplicateName`] if the name is already taken.
    pub fn register(&mut self, spec: ResourceSpec) -> Result<(), GraphError> {
        if self.index.contains_key(&spec.name) {
            return Err(GraphError::DuplicateName { name: spec.name });
        }
        self.index.insert(spec.name.clone(), self.specs.len());
        self.specs.push(spec);
        Ok(())
    }

    /// Looks up a spec by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceSpec> {
        self.index.get(name).map(|&i| &self.specs[i])
    }

    /// Position of a resource in declaration order.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Returns true if a resource with this name is declared.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Iterates specs in declaration order. The iterator is cheap to clone.
    pub fn all(&self) -> std::slice::Iter<'_, ResourceSpec> {
        self.specs.iter()
    }

    /// Number of declared resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Returns true if nothing is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_rejects_duplicate() {
        let mut registry = ResourceRegistry::new();
        registry
            .register(ResourceSpec::new("test:net", "net1"))
            .unwrap();
        let err = registry
            .register(ResourceSpec::new("test:net", "net1"))
            .unwrap_err();
        assert_eq!(
            err,
            GraphError::DuplicateName {
                name: String::from("net1")
            }
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_all_is_restartable_and_ordered() {
        let mut registry = ResourceRegistry::new();
        for name in ["c", "a", "b"] {
            registry.register(ResourceSpec::new("test:x", name)).unwrap();
        }

        let iter = registry.all();
        let first: Vec<_> = iter.clone().map(|s| s.name.as_str()).collect();
        let second: Vec<_> = iter.map(|s| s.name.as_str()).collect();
        assert_eq!(first, vec!["c", "a", "b"]);
        assert_eq!(first, second);
        assert_eq!(registry.position("b"), Some(2));
    }
}
