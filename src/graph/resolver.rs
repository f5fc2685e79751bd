//! Dependency resolution.
//!
//! Builds a partial order over resources from output references and explicit
//! `depends_on` edges. The traversal is depth-first in declaration order, so
//! ties between independent resources always follow declaration order.
//! Resources are grouped into tiers by dependency depth; everything within a
//! tier may run concurrently.

use std::collections::{BTreeSet, HashMap};

use crate::error::GraphError;

use super::registry::ResourceRegistry;

/// Result of dependency resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolvedOrder {
    /// Topological order: every resource appears after all its dependencies.
    pub order: Vec<String>,
    /// Resources grouped by dependency depth.
    pub tiers: Vec<Vec<String>>,
    /// Direct dependencies of every resource.
    pub dependencies: HashMap<String, BTreeSet<String>>,
}

impl ResolvedOrder {
    /// Order in which resources can be deleted: dependents first.
    #[must_use]
    pub fn deletion_order(&self) -> Vec<String> {
        self.order.iter().rev().cloned().collect()
    }

    /// Resources that directly depend on `resource`.
    #[must_use]
    pub fn dependents_of(&self, resource: &str) -> Vec<&str> {
        self.order
            .iter()
            .filter(|name| {
                self.dependencies
                    .get(name.as_str())
                    .is_some_and(|deps| deps.contains(resource))
            })
            .map(String::as_str)
            .collect()
    }

    /// Dependency depth of a resource (0 for roots).
    #[must_use]
    pub fn tier_of(&self, resource: &str) -> Option<usize> {
        self.tiers
            .iter()
            .position(|tier| tier.iter().any(|name| name == resource))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Orders resources by their dependencies.
pub struct DependencyResolver;

impl DependencyResolver {
    /// Resolves the order of every declared resource.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownReference`] if a resource depends on an
    /// undeclared name and [`GraphError::CyclicDependency`] on a cycle.
    pub fn resolve(registry: &ResourceRegistry) -> Result<ResolvedOrder, GraphError> {
        let nodes: Vec<String> = registry.all().map(|spec| spec.name.clone()).collect();
        let dependencies: HashMap<String, BTreeSet<String>> = registry
            .all()
            .map(|spec| (spec.name.clone(), spec.dependencies()))
            .collect();

        for spec in registry.all() {
            if let Some(target) = dependencies[&spec.name]
                .iter()
                .find(|target| !registry.contains(target))
            {
                return Err(GraphError::UnknownReference {
                    resource: spec.name.clone(),
                    target: target.clone(),
                });
            }
        }

        Self::order(&nodes, dependencies)
    }

    /// Orders an arbitrary node set.
    ///
    /// `nodes` gives the tie-breaking order. Edges to nodes outside the set
    /// are ignored, which lets callers order a subset such as the resources
    /// left in state.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CyclicDependency`] on a cycle.
    pub fn order(
        nodes: &[String],
        mut dependencies: HashMap<String, BTreeSet<String>>,
    ) -> Result<ResolvedOrder, GraphError> {
        let position: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        for name in nodes {
            let deps = dependencies.entry(name.clone()).or_default();
            deps.retain(|dep| position.contains_key(dep.as_str()));
        }

        let mut walk = Walk {
            nodes,
            position: &position,
            dependencies: &dependencies,
            marks: HashMap::new(),
            path: Vec::new(),
            order: Vec::with_capacity(nodes.len()),
            depth: HashMap::new(),
        };
        for name in nodes {
            walk.visit(name)?;
        }

        let Walk { order, depth, .. } = walk;

        let max_depth = depth.values().copied().max().map_or(0, |d| d + 1);
        let mut tiers = vec![Vec::new(); max_depth];
        for name in nodes {
            tiers[depth[name.as_str()]].push(name.clone());
        }

        dependencies.retain(|name, _| position.contains_key(name.as_str()));

        Ok(ResolvedOrder {
            order,
            tiers,
            dependencies,
        })
    }
}

struct Walk<'a> {
    nodes: &'a [String],
    position: &'a HashMap<&'a str, usize>,
    dependencies: &'a HashMap<String, BTreeSet<String>>,
    marks: HashMap<&'a str, Mark>,
    path: Vec<&'a str>,
    order: Vec<String>,
    depth: HashMap<&'a str, usize>,
}

impl<'a> Walk<'a> {
    fn visit(&mut self, name: &'a str) -> Result<usize, GraphError> {
        match self.marks.get(name) {
            Some(Mark::Done) => return Ok(self.depth[name]),
            Some(Mark::Visiting) => {
                let start = self.path.iter().position(|n| *n == name).unwrap_or(0);
                let mut cycle: Vec<String> =
                    self.path[start..].iter().map(|n| (*n).to_string()).collect();
                cycle.push(name.to_string());
                return Err(GraphError::CyclicDependency { cycle });
            }
            None => {}
        }

        self.marks.insert(name, Mark::Visiting);
        self.path.push(name);

        let nodes: &'a [String] = self.nodes;
        let position: &'a HashMap<&'a str, usize> = self.position;
        let mut deps: Vec<usize> = self
            .dependencies
            .get(name)
            .map(|deps| deps.iter().map(|dep| position[dep.as_str()]).collect())
            .unwrap_or_default();
        deps.sort_unstable();

        let mut depth = 0;
        for i in deps {
            depth = depth.max(self.visit(nodes[i].as_str())? + 1);
        }

        self.path.pop();
        self.marks.insert(name, Mark::Done);
        self.depth.insert(name, depth);
        self.order.push(name.to_string());
        Ok(depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ResourceSpec, Value};

    fn registry(specs: Vec<ResourceSpec>) -> ResourceRegistry {
        let mut registry = ResourceRegistry::new();
        for spec in specs {
            registry.register(spec).unwrap();
        }
        registry
    }

    fn is_before(order: &[String], a: &str, b: &str) -> bool {
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        pos(a) < pos(b)
    }

    #[test]
    fn test_order_respects_references() {
        // Declared out of dependency order on purpose.
        let registry = registry(vec![
            ResourceSpec::new("test:vm", "vm1").input("subnet", Value::reference("sub1", "id")),
            ResourceSpec::new("test:subnet", "sub1").input("net", Value::reference("net1", "id")),
            ResourceSpec::new("test:net", "net1"),
        ]);

        let resolved = DependencyResolver::resolve(&registry).unwrap();
        assert_eq!(resolved.order, vec!["net1", "sub1", "vm1"]);
        assert_eq!(resolved.tiers.len(), 3);
        assert_eq!(resolved.tier_of("vm1"), Some(2));
        assert_eq!(resolved.deletion_order(), vec!["vm1", "sub1", "net1"]);
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        let registry = registry(vec![
            ResourceSpec::new("test:x", "b"),
            ResourceSpec::new("test:x", "a"),
            ResourceSpec::new("test:x", "c").depends_on("a").depends_on("b"),
        ]);

        let resolved = DependencyResolver::resolve(&registry).unwrap();
        assert_eq!(resolved.order, vec!["b", "a", "c"]);
        assert_eq!(resolved.tiers[0], vec!["b", "a"]);
        assert_eq!(resolved.dependents_of("a"), vec!["c"]);
    }

    #[test]
    fn test_diamond_tiers() {
        let registry = registry(vec![
            ResourceSpec::new("test:x", "root"),
            ResourceSpec::new("test:x", "left").input("r", Value::reference("root", "id")),
            ResourceSpec::new("test:x", "right").input("r", Value::reference("root", "id")),
            ResourceSpec::new("test:x", "join")
                .input("l", Value::reference("left", "id"))
                .input("r", Value::reference("right", "id")),
        ]);

        let resolved = DependencyResolver::resolve(&registry).unwrap();
        assert_eq!(resolved.tiers[1], vec!["left", "right"]);
        for spec in registry.all() {
            for dep in spec.dependencies() {
                assert!(is_before(&resolved.order, &dep, &spec.name));
            }
        }
    }

    #[test]
    fn test_cycle_names_members() {
        let registry = registry(vec![
            ResourceSpec::new("test:x", "a").input("c", Value::reference("c", "id")),
            ResourceSpec::new("test:x", "b").input("a", Value::reference("a", "id")),
            ResourceSpec::new("test:x", "c").input("b", Value::reference("b", "id")),
        ]);

        let err = DependencyResolver::resolve(&registry).unwrap_err();
        assert_eq!(
            err,
            GraphError::CyclicDependency {
                cycle: vec![
                    String::from("a"),
                    String::from("c"),
                    String::from("b"),
                    String::from("a"),
                ]
            }
        );
    }

    #[test]
    fn test_unknown_reference() {
        let registry = registry(vec![
            ResourceSpec::new("test:x", "vm1").input("net", Value::reference("ghost", "id")),
        ]);

        let err = DependencyResolver::resolve(&registry).unwrap_err();
        assert!(matches!(err, GraphError::UnknownReference { ref target, .. } if target == "ghost"));
    }

    #[test]
    fn test_order_ignores_edges_outside_node_set() {
        let nodes = vec![String::from("vm-old"), String::from("disk-old")];
        let mut deps = HashMap::new();
        deps.insert(
            String::from("vm-old"),
            BTreeSet::from([String::from("disk-old"), String::from("net1")]),
        );

        let resolved = DependencyResolver::order(&nodes, deps).unwrap();
        assert_eq!(resolved.order, vec!["disk-old", "vm-old"]);
        assert_eq!(resolved.deletion_order(), vec!["vm-old", "disk-old"]);
    }
}
