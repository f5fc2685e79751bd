//! Run plan types and construction.
//!
//! A plan is a list of operations where every operation lists the indices of
//! the operations that must complete first. Dependencies always point to
//! earlier indices, so the list itself is a valid sequential order.
//!
//! Deletes of resources that are no longer declared come first, dependents
//! before their dependencies. A declared resource that an orphan recorded as
//! a dependency waits for that orphan's delete.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};

use crate::error::GraphError;
use crate::graph::{DependencyResolver, ResolvedOrder};
use crate::state::StackState;

use super::diff::{DiffDetail, DiffResult, DiffType};

/// A complete run plan.
#[derive(Debug, Clone)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Hash of the declarations this plan is based on.
    pub config_hash: String,
    /// Planned operations; dependencies point to earlier entries.
    pub operations: Vec<PlannedOperation>,
}

/// A single planned operation.
#[derive(Debug, Clone)]
pub struct PlannedOperation {
    /// Operation type.
    pub operation: OperationType,
    /// Resource name.
    pub resource_name: String,
    /// Resource kind.
    pub kind: String,
    /// Reason for this operation.
    pub reason: String,
    /// Hash of the new inputs, when known at plan time.
    pub new_hash: Option<String>,
    /// Indices of operations that must complete first.
    pub dependencies: Vec<usize>,
    /// Carried out as delete then create.
    pub replace: bool,
    /// Changed input fields.
    pub details: Vec<DiffDetail>,
}

/// Types of planned operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// Create a resource.
    Create,
    /// Update a resource (in place or by replacement).
    Update,
    /// Delete a resource.
    Delete,
    /// Nothing to do; recorded outputs are reused.
    #[serde(rename = "noop")]
    NoOp,
}

/// Operation counts of a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    /// Creates.
    pub creates: usize,
    /// Updates.
    pub updates: usize,
    /// Deletes.
    pub deletes: usize,
    /// Unchanged resources.
    pub unchanged: usize,
}

impl Plan {
    /// Creates a plan from a diff result.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CyclicDependency`] if the dependencies recorded in
    /// state for the orphaned resources form a cycle.
    pub fn from_diff(
        diff: &DiffResult,
        order: &ResolvedOrder,
        state: Option<&StackState>,
        config_hash: &str,
    ) -> Result<Self, GraphError> {
        let orphans: Vec<String> = diff
            .diffs
            .iter()
            .filter(|d| d.diff_type == DiffType::Delete)
            .map(|d| d.name.clone())
            .collect();

        let mut operations = Vec::with_capacity(diff.diffs.len());
        let mut index: HashMap<String, usize> = HashMap::new();
        let recorded = recorded_dependencies(state, &orphans);

        for name in deletion_order(&orphans, &recorded)? {
            let Some(resource_diff) = diff.get(&name) else {
                continue;
            };
            let dependencies = delete_dependencies(&name, &recorded, &index);
            index.insert(name.clone(), operations.len());
            operations.push(PlannedOperation {
                operation: OperationType::Delete,
                resource_name: name,
                kind: resource_diff.kind.clone(),
                reason: resource_diff.reason.clone(),
                new_hash: None,
                dependencies,
                replace: false,
                details: Vec::new(),
            });
        }

        for name in &order.order {
            let Some(resource_diff) = diff.get(name) else {
                continue;
            };

            let mut dependencies: BTreeSet<usize> = order
                .dependencies
                .get(name)
                .into_iter()
                .flatten()
                .filter_map(|dep| index.get(dep).copied())
                .collect();
            dependencies.extend(delete_dependencies(name, &recorded, &index));

            index.insert(name.clone(), operations.len());
            operations.push(PlannedOperation {
                operation: match resource_diff.diff_type {
                    DiffType::Create => OperationType::Create,
                    DiffType::Update => OperationType::Update,
                    DiffType::Delete => OperationType::Delete,
                    DiffType::NoChange => OperationType::NoOp,
                },
                resource_name: name.clone(),
                kind: resource_diff.kind.clone(),
                reason: resource_diff.reason.clone(),
                new_hash: resource_diff.new_hash.clone(),
                dependencies: dependencies.into_iter().collect(),
                replace: resource_diff.replace,
                details: resource_diff.details.clone(),
            });
        }

        Ok(Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            operations,
        })
    }

    /// Creates a plan deleting every resource in `state`, dependents first.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CyclicDependency`] if the recorded dependencies
    /// form a cycle.
    pub fn destroy(state: &StackState, config_hash: &str) -> Result<Self, GraphError> {
        let names: Vec<String> = state.resources.keys().cloned().collect();
        let recorded = recorded_dependencies(Some(state), &names);

        let mut operations = Vec::with_capacity(names.len());
        let mut index: HashMap<String, usize> = HashMap::new();

        for name in deletion_order(&names, &recorded)? {
            let Some(resource) = state.get_resource(&name) else {
                continue;
            };
            let dependencies = delete_dependencies(&name, &recorded, &index);
            index.insert(name.clone(), operations.len());
            operations.push(PlannedOperation {
                operation: OperationType::Delete,
                resource_name: name,
                kind: resource.kind.clone(),
                reason: String::from("Stack destroyed"),
                new_hash: None,
                dependencies,
                replace: false,
                details: Vec::new(),
            });
        }

        Ok(Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            operations,
        })
    }

    /// Creates an empty plan.
    #[must_use]
    pub fn empty(config_hash: &str) -> Self {
        Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            operations: vec![],
        }
    }

    /// Returns true if the plan changes anything.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.operations
            .iter()
            .any(|op| op.operation != OperationType::NoOp)
    }

    /// Counts operations by type.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for op in &self.operations {
            match op.operation {
                OperationType::Create => summary.creates += 1,
                OperationType::Update => summary.updates += 1,
                OperationType::Delete => summary.deletes += 1,
                OperationType::NoOp => summary.unchanged += 1,
            }
        }
        summary
    }

    /// Looks up the operation planned for a resource.
    #[must_use]
    pub fn operation_for(&self, name: &str) -> Option<&PlannedOperation> {
        self.operations.iter().find(|op| op.resource_name == name)
    }

    /// Gets operations that depend on a specific operation index.
    #[must_use]
    pub fn dependent_operations(&self, index: usize) -> Vec<usize> {
        self.operations
            .iter()
            .enumerate()
            .filter(|(_, op)| op.dependencies.contains(&index))
            .map(|(i, _)| i)
            .collect()
    }
}

/// Dependencies recorded in state for `names`.
fn recorded_dependencies(
    state: Option<&StackState>,
    names: &[String],
) -> HashMap<String, BTreeSet<String>> {
    names
        .iter()
        .map(|name| {
            let deps = state
                .and_then(|s| s.get_resource(name))
                .map(|r| r.dependencies.clone())
                .unwrap_or_default();
            (name.clone(), deps)
        })
        .collect()
}

fn deletion_order(
    names: &[String],
    recorded: &HashMap<String, BTreeSet<String>>,
) -> Result<Vec<String>, GraphError> {
    Ok(DependencyResolver::order(names, recorded.clone())?.deletion_order())
}

/// Already-planned deletes of resources that recorded `name` as a dependency.
fn delete_dependencies(
    name: &str,
    recorded: &HashMap<String, BTreeSet<String>>,
    index: &HashMap<String, usize>,
) -> Vec<usize> {
    let mut dependencies: Vec<usize> = recorded
        .iter()
        .filter(|(_, deps)| deps.contains(name))
        .filter_map(|(dependent, _)| index.get(dependent).copied())
        .collect();
    dependencies.sort_unstable();
    dependencies
}

impl PlannedOperation {
    /// Returns a human-readable description of the operation.
    #[must_use]
    pub fn description(&self) -> String {
        match self.operation {
            OperationType::Create => format!("Create {} '{}'", self.kind, self.resource_name),
            OperationType::Update if self.replace => {
                format!("Replace {} '{}'", self.kind, self.resource_name)
            }
            OperationType::Update => format!("Update {} '{}'", self.kind, self.resource_name),
            OperationType::Delete => format!("Delete {} '{}'", self.kind, self.resource_name),
            OperationType::NoOp => format!("No change for '{}'", self.resource_name),
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "noop",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.operation, self.resource_name)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.has_changes() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Plan ({} operations):", self.operations.len())?;
        for (i, op) in self.operations.iter().enumerate() {
            writeln!(f, "  {i}. {op}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ResourceRegistry, ResourceSpec, Value};
    use crate::planner::DiffEngine;
    use crate::state::ResourceState;

    fn state_with(resources: &[(&str, &[&str])]) -> StackState {
        let mut state = StackState::new("dev");
        for (name, deps) in resources {
            let mut resource = ResourceState::new(name, "test:thing");
            resource.record_applied(
                format!("id-{name}"),
                Default::default(),
                String::from("h"),
                Default::default(),
            );
            resource.dependencies = deps.iter().map(|d| (*d).to_string()).collect();
            state.set_resource(resource);
        }
        state
    }

    fn plan_for(specs: Vec<ResourceSpec>, state: Option<&StackState>) -> Plan {
        let mut registry = ResourceRegistry::new();
        for spec in specs {
            registry.register(spec).unwrap();
        }
        let order = DependencyResolver::resolve(&registry).unwrap();
        let diff = DiffEngine::new().compute_diff(&registry, &order, state);
        Plan::from_diff(&diff, &order, state, "hash").unwrap()
    }

    fn assert_backward_edges(plan: &Plan) {
        for (i, op) in plan.operations.iter().enumerate() {
            assert!(op.dependencies.iter().all(|&d| d < i), "{op} points forward");
        }
    }

    #[test]
    fn test_plan_follows_dependencies() {
        let plan = plan_for(
            vec![
                ResourceSpec::new("test:vm", "vm1").input("net", Value::reference("net1", "id")),
                ResourceSpec::new("test:net", "net1"),
            ],
            None,
        );

        assert_eq!(plan.operations[0].resource_name, "net1");
        assert_eq!(plan.operations[1].resource_name, "vm1");
        assert_eq!(plan.operations[1].dependencies, vec![0]);
        assert_eq!(plan.summary().creates, 2);
        assert!(plan.has_changes());
    }

    #[test]
    fn test_orphans_deleted_first_dependents_first() {
        let state = state_with(&[("old-net", &[]), ("old-vm", &["old-net"])]);
        let plan = plan_for(vec![ResourceSpec::new("test:net", "net1")], Some(&state));

        assert_eq!(plan.operations[0].resource_name, "old-vm");
        assert_eq!(plan.operations[1].resource_name, "old-net");
        assert_eq!(plan.operations[1].dependencies, vec![0]);
        assert_eq!(plan.operations[2].resource_name, "net1");
        assert_backward_edges(&plan);
    }

    #[test]
    fn test_declared_resource_waits_for_orphan_dependent() {
        let state = state_with(&[("net1", &[]), ("old-vm", &["net1"])]);
        let plan = plan_for(vec![ResourceSpec::new("test:net", "net1")], Some(&state));

        let net = plan.operation_for("net1").unwrap();
        assert_eq!(net.dependencies, vec![0]);
        assert_backward_edges(&plan);
    }

    #[test]
    fn test_destroy_plan() {
        let state = state_with(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        let plan = Plan::destroy(&state, "hash").unwrap();

        let names: Vec<&str> = plan
            .operations
            .iter()
            .map(|op| op.resource_name.as_str())
            .collect();
        assert_eq!(names, vec!["c", "b", "a"]);
        assert_eq!(plan.summary().deletes, 3);
        assert_eq!(plan.dependent_operations(0), vec![1]);
        assert_backward_edges(&plan);
    }

    #[test]
    fn test_empty_plan() {
        let plan = Plan::empty("hash");
        assert!(!plan.has_changes());
        assert_eq!(plan.to_string(), "No changes required");
    }
}
