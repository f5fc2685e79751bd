//! Diff engine comparing declared resources with persisted state.
//!
//! Declared resources are visited in dependency order. Inputs are resolved
//! against the outputs recorded in state for upstream resources that stay
//! unchanged; when an upstream is itself being created or updated, the
//! dependent's inputs are unknown at plan time and it is planned as an update
//! that the executor may later downgrade to a no-op.

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::config::InputsHasher;
use crate::graph::{OutputRef, Properties, ResolvedOrder, ResourceRegistry};
use crate::state::{ResourceStatus, StackState};

/// Engine for computing diffs between declarations and state.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Inputs hasher.
    hasher: InputsHasher,
}

/// Difference for a single resource.
#[derive(Debug, Clone)]
pub struct ResourceDiff {
    /// Resource name.
    pub name: String,
    /// Resource kind (declared kind, or recorded kind for deletes).
    pub kind: String,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Why the resource is in this state.
    pub reason: String,
    /// Changed input fields.
    pub details: Vec<DiffDetail>,
    /// Hash recorded in state.
    pub old_hash: Option<String>,
    /// Hash of the new inputs; `None` when they are not known yet.
    pub new_hash: Option<String>,
    /// The change cannot be made in place (kind changed).
    pub replace: bool,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Resource needs to be updated.
    Update,
    /// Resource needs to be deleted.
    Delete,
    /// Resource is unchanged.
    NoChange,
}

/// Change of a single input field.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffDetail {
    /// Input key.
    pub field: String,
    /// Value recorded in state.
    pub old_value: Option<serde_json::Value>,
    /// New value; `None` if removed or not known yet.
    pub new_value: Option<serde_json::Value>,
    /// Whether the new value is known at plan time.
    pub known: bool,
}

/// Complete diff result.
#[derive(Debug, Default)]
pub struct DiffResult {
    /// Diffs of declared resources in dependency order, then deletes.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update.
    pub updates: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: InputsHasher::new(),
        }
    }

    /// Computes the diff between declarations and state.
    #[must_use]
    pub fn compute_diff(
        &self,
        registry: &ResourceRegistry,
        order: &ResolvedOrder,
        state: Option<&StackState>,
    ) -> DiffResult {
        let mut result = DiffResult::default();
        // Outputs usable at plan time: only those of unchanged resources.
        let mut known_outputs: HashMap<&str, &Properties> = HashMap::new();

        for name in &order.order {
            let Some(spec) = registry.get(name) else {
                continue;
            };
            let prior = state.and_then(|s| s.get_resource(name));

            let lookup = |r: &OutputRef| {
                known_outputs
                    .get(r.resource.as_str())
                    .and_then(|outputs| outputs.get(&r.field))
                    .cloned()
            };
            let resolved: Option<Properties> = spec
                .inputs
                .iter()
                .map(|(key, value)| Some((key.clone(), value.resolve_with(&lookup)?)))
                .collect();
            let new_hash = resolved
                .as_ref()
                .map(|inputs| self.hasher.hash_inputs(&spec.kind, inputs));

            let diff = match prior {
                None => ResourceDiff {
                    name: name.clone(),
                    kind: spec.kind.clone(),
                    diff_type: DiffType::Create,
                    reason: String::from("Declared, not in state"),
                    details: Vec::new(),
                    old_hash: None,
                    new_hash,
                    replace: false,
                },
                Some(prior) if !prior.has_external_id() => ResourceDiff {
                    name: name.clone(),
                    kind: spec.kind.clone(),
                    diff_type: DiffType::Create,
                    reason: String::from("Previous create did not complete"),
                    details: Vec::new(),
                    old_hash: None,
                    new_hash,
                    replace: false,
                },
                Some(prior) => {
                    let details = input_details(&prior.inputs, &spec.inputs.keys().cloned().collect(), resolved.as_ref());
                    let (diff_type, reason, replace) = if prior.kind != spec.kind {
                        (
                            DiffType::Update,
                            format!("Kind changed from {} to {}", prior.kind, spec.kind),
                            true,
                        )
                    } else if prior.status == ResourceStatus::Failed {
                        (
                            DiffType::Update,
                            String::from("Previous operation failed"),
                            false,
                        )
                    } else {
                        match &new_hash {
                            Some(hash) if InputsHasher::hashes_match(hash, &prior.inputs_hash) => (
                                DiffType::NoChange,
                                String::from("Inputs unchanged"),
                                false,
                            ),
                            Some(_) => (DiffType::Update, String::from("Inputs changed"), false),
                            None => (
                                DiffType::Update,
                                String::from("Inputs depend on changing resources (known after apply)"),
                                false,
                            ),
                        }
                    };

                    if diff_type == DiffType::NoChange {
                        known_outputs.insert(name.as_str(), &prior.outputs);
                    }

                    ResourceDiff {
                        name: name.clone(),
                        kind: spec.kind.clone(),
                        diff_type,
                        reason,
                        details,
                        old_hash: Some(prior.inputs_hash.clone()),
                        new_hash,
                        replace,
                    }
                }
            };

            debug!("Diff for {name}: {:?}", diff.diff_type);
            result.push(diff);
        }

        if let Some(state) = state {
            for (name, resource) in &state.resources {
                if !registry.contains(name) {
                    debug!("Found orphaned resource: {name}");
                    result.push(ResourceDiff {
                        name: name.clone(),
                        kind: resource.kind.clone(),
                        diff_type: DiffType::Delete,
                        reason: String::from("No longer declared"),
                        details: Vec::new(),
                        old_hash: Some(resource.inputs_hash.clone()),
                        new_hash: None,
                        replace: false,
                    });
                }
            }
        }

        result
    }
}

/// Field-level changes between recorded and new inputs.
fn input_details(
    old: &Properties,
    new_keys: &BTreeSet<String>,
    resolved: Option<&Properties>,
) -> Vec<DiffDetail> {
    let keys: BTreeSet<&String> = old.keys().chain(new_keys.iter()).collect();

    keys.into_iter()
        .filter_map(|key| {
            let old_value = old.get(key).cloned();
            if !new_keys.contains(key) {
                return Some(DiffDetail {
                    field: key.clone(),
                    old_value,
                    new_value: None,
                    known: true,
                });
            }
            match resolved.map(|inputs| inputs.get(key).cloned()) {
                Some(new_value) if new_value == old_value => None,
                Some(new_value) => Some(DiffDetail {
                    field: key.clone(),
                    old_value,
                    new_value,
                    known: true,
                }),
                None => Some(DiffDetail {
                    field: key.clone(),
                    old_value,
                    new_value: None,
                    known: false,
                }),
            }
        })
        .collect()
}

impl DiffResult {
    fn push(&mut self, diff: ResourceDiff) {
        match diff.diff_type {
            DiffType::Create => self.creates += 1,
            DiffType::Update => self.updates += 1,
            DiffType::Delete => self.deletes += 1,
            DiffType::NoChange => self.unchanged += 1,
        }
        self.diffs.push(diff);
    }

    /// Returns true if anything would change.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates > 0 || self.updates > 0 || self.deletes > 0
    }

    /// Looks up the diff of a resource.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceDiff> {
        self.diffs.iter().find(|d| d.name == name)
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}
