//! Property values and the value graph.
//!
//! A resource input is either a literal, a reference to another resource's
//! output that is not known yet, or a value that has been resolved. The
//! [`ValueGraph`] records every declared resource's dependencies and the
//! outputs of resources once their provider call completes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::error::{ConfigError, GraphError};

use super::resource::{ResourceHandle, ResourceSpec};

/// Fully resolved property map (inputs or outputs of one resource).
pub type Properties = BTreeMap<String, serde_json::Value>;

/// Namespace used by stack variables in `${var.name}` templates.
pub const VARIABLE_NAMESPACE: &str = "var";

/// Output field holding a resource's external identifier.
pub const ID_FIELD: &str = "id";

/// Reference to one output field of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputRef {
    /// Name of the source resource.
    pub resource: String,
    /// Output field on the source resource.
    pub field: String,
}

/// A property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// A literal known at declaration time.
    Literal(serde_json::Value),
    /// An output of another resource that is not known yet.
    Unresolved(OutputRef),
    /// A value produced by a provider call.
    Resolved(serde_json::Value),
    /// A list whose elements may contain references.
    List(Vec<Value>),
    /// A map whose entries may contain references.
    Map(BTreeMap<String, Value>),
    /// String interpolation: every part is rendered and concatenated.
    Concat(Vec<Value>),
}

impl OutputRef {
    /// Creates a new output reference.
    #[must_use]
    pub fn new(resource: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            field: field.into(),
        }
    }
}

impl std::fmt::Display for OutputRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${{{}.{}}}", self.resource, self.field)
    }
}

impl Value {
    /// Creates a literal value.
    #[must_use]
    pub fn literal(value: impl Into<serde_json::Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Creates a reference to `resource.field`.
    #[must_use]
    pub fn reference(resource: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Unresolved(OutputRef::new(resource, field))
    }

    /// Collects every output reference contained in this value.
    pub fn collect_references<'a>(&'a self, out: &mut Vec<&'a OutputRef>) {
        match self {
            Self::Literal(_) | Self::Resolved(_) => {}
            Self::Unresolved(reference) => out.push(reference),
            Self::List(items) | Self::Concat(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Map(entries) => {
                for item in entries.values() {
                    item.collect_references(out);
                }
            }
        }
    }

    /// Returns every output reference contained in this value.
    #[must_use]
    pub fn references(&self) -> Vec<&OutputRef> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    /// Returns true if no unresolved reference remains.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.references().is_empty()
    }

    /// Materializes this value using `lookup` for references.
    ///
    /// Returns `None` if any reference cannot be looked up yet.
    pub fn resolve_with<F>(&self, lookup: &F) -> Option<serde_json::Value>
    where
        F: Fn(&OutputRef) -> Option<serde_json::Value>,
    {
        match self {
            Self::Literal(v) | Self::Resolved(v) => Some(v.clone()),
            Self::Unresolved(reference) => lookup(reference),
            Self::List(items) => items
                .iter()
                .map(|item| item.resolve_with(lookup))
                .collect::<Option<Vec<_>>>()
                .map(serde_json::Value::Array),
            Self::Map(entries) => {
                let mut map = serde_json::Map::new();
                for (key, item) in entries {
                    map.insert(key.clone(), item.resolve_with(lookup)?);
                }
                Some(serde_json::Value::Object(map))
            }
            Self::Concat(parts) => {
                let mut rendered = String::new();
                for part in parts {
                    match part.resolve_with(lookup)? {
                        serde_json::Value::String(s) => rendered.push_str(&s),
                        other => rendered.push_str(&other.to_string()),
                    }
                }
                Some(serde_json::Value::String(rendered))
            }
        }
    }

    /// Parses a string that may contain `${resource.field}` references.
    ///
    /// A string that is exactly one reference becomes [`Value::Unresolved`],
    /// a string without references stays a literal, anything else becomes
    /// [`Value::Concat`].
    ///
    /// # Errors
    ///
    /// Returns an error for unterminated or malformed references.
    pub fn parse_template(template: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidTemplate {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = Vec::new();
        let mut rest = template;

        while let Some(start) = rest.find("${") {
            if start > 0 {
                parts.push(Self::Literal(serde_json::Value::String(
                    rest[..start].to_string(),
                )));
            }
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| invalid("missing closing '}'"))?;
            let (resource, field) = after[..end]
                .trim()
                .split_once('.')
                .ok_or_else(|| invalid("expected `resource.field`"))?;
            if resource.is_empty() || field.is_empty() {
                return Err(invalid("resource and field must not be empty"));
            }
            parts.push(Self::reference(resource, field));
            rest = &after[end + 1..];
        }

        if !rest.is_empty() {
            parts.push(Self::Literal(serde_json::Value::String(rest.to_string())));
        }

        Ok(match parts.len() {
            0 => Self::Literal(serde_json::Value::String(String::new())),
            1 => parts.remove(0),
            _ => Self::Concat(parts),
        })
    }

    /// Converts a plain JSON/YAML value, parsing templates in every string.
    ///
    /// # Errors
    ///
    /// Returns an error if a template inside the value is malformed.
    pub fn from_json(value: serde_json::Value) -> Result<Self, ConfigError> {
        let converted = match value {
            serde_json::Value::String(s) => Self::parse_template(&s)?,
            serde_json::Value::Array(items) => Self::List(
                items
                    .into_iter()
                    .map(Self::from_json)
                    .collect::<Result<_, _>>()?,
            ),
            serde_json::Value::Object(entries) => Self::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((k, Self::from_json(v)?)))
                    .collect::<Result<_, ConfigError>>()?,
            ),
            other => Self::Literal(other),
        };
        Ok(converted.collapse())
    }

    /// Replaces `${var.name}` references with the variable's value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingVariable`] if a variable is not defined.
    pub fn bind_variables(self, variables: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let bound = match self {
            Self::Unresolved(reference) if reference.resource == VARIABLE_NAMESPACE => {
                let value = variables.get(&reference.field).ok_or_else(|| {
                    ConfigError::MissingVariable {
                        name: reference.field.clone(),
                    }
                })?;
                Self::Literal(serde_json::Value::String(value.clone()))
            }
            Self::List(items) => Self::List(
                items
                    .into_iter()
                    .map(|item| item.bind_variables(variables))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Concat(parts) => Self::Concat(
                parts
                    .into_iter()
                    .map(|part| part.bind_variables(variables))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Map(entries) => Self::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((k, v.bind_variables(variables)?)))
                    .collect::<Result<_, ConfigError>>()?,
            ),
            other => other,
        };
        Ok(bound.collapse())
    }

    /// Folds reference-free composites back into a single literal.
    fn collapse(self) -> Self {
        if matches!(self, Self::List(_) | Self::Map(_) | Self::Concat(_)) && self.is_resolved() {
            if let Some(literal) = self.resolve_with(&|_| None) {
                return Self::Literal(literal);
            }
        }
        self
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Literal(serde_json::Value::String(s.to_string()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Literal(serde_json::Value::String(s))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Literal(serde_json::Value::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Literal(serde_json::Value::Bool(b))
    }
}

impl From<&ResourceHandle> for Value {
    fn from(handle: &ResourceHandle) -> Self {
        handle.id()
    }
}

/// Dependency and output bookkeeping for every declared resource.
///
/// Outputs of a resource are recorded exactly once; a second
/// [`resolve`](Self::resolve) for the same resource is rejected.
#[derive(Debug, Default, Clone)]
pub struct ValueGraph {
    /// Resources that each resource depends on (references and `depends_on`).
    dependencies: HashMap<String, BTreeSet<String>>,
    /// Resources whose outputs each resource references.
    references: HashMap<String, BTreeSet<String>>,
    /// Declaration order.
    declared: Vec<String>,
    /// Resolved outputs by resource.
    outputs: HashMap<String, Properties>,
}

impl ValueGraph {
    /// Creates an empty value graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from already-validated specs.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CyclicDependency`] if the specs form a cycle.
    pub fn from_specs<'a>(specs: impl IntoIterator<Item = &'a ResourceSpec>) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for spec in specs {
            graph.declare(spec)?;
        }
        Ok(graph)
    }

    /// Records a spec and returns a handle to its outputs.
    ///
    /// References to resources that are not declared yet are accepted; the
    /// cycle check covers every edge known so far.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CyclicDependency`] if the new edges close a cycle
    /// and [`GraphError::DuplicateName`] if the name is already declared.
    pub fn declare(&mut self, spec: &ResourceSpec) -> Result<ResourceHandle, GraphError> {
        if self.dependencies.contains_key(&spec.name) {
            return Err(GraphError::DuplicateName {
                name: spec.name.clone(),
            });
        }

        let dependencies = spec.dependencies();
        if let Some(cycle) = self.find_path_back(&spec.name, &dependencies) {
            return Err(GraphError::CyclicDependency { cycle });
        }

        self.references
            .insert(spec.name.clone(), spec.referenced_resources());
        self.dependencies.insert(spec.name.clone(), dependencies);
        self.declared.push(spec.name.clone());

        Ok(ResourceHandle::new(&spec.name))
    }

    /// Looks for a path from any of `start` back to `target`.
    fn find_path_back(&self, target: &str, start: &BTreeSet<String>) -> Option<Vec<String>> {
        fn walk(
            graph: &ValueGraph,
            node: &str,
            target: &str,
            path: &mut Vec<String>,
            seen: &mut BTreeSet<String>,
        ) -> bool {
            path.push(node.to_string());
            if node == target {
                return true;
            }
            if seen.insert(node.to_string())
                && let Some(next) = graph.dependencies.get(node)
            {
                for dep in next {
                    if walk(graph, dep, target, path, seen) {
                        return true;
                    }
                }
            }
            path.pop();
            false
        }

        let mut seen = BTreeSet::new();
        for dep in start {
            let mut path = vec![target.to_string()];
            if walk(self, dep, target, &mut path, &mut seen) {
                return Some(path);
            }
        }
        None
    }

    /// Records the outputs of `resource`.
    ///
    /// Returns the declared resources whose referenced outputs are now all
    /// available and which therefore became eligible for execution.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::AlreadyResolved`] on a second call for the same resource.
    pub fn resolve(&mut self, resource: &str, outputs: Properties) -> Result<Vec<String>, GraphError> {
        if self.outputs.contains_key(resource) {
            return Err(GraphError::AlreadyResolved {
                resource: resource.to_string(),
            });
        }

        debug!("Resolved {} output(s) of {resource}", outputs.len());
        self.outputs.insert(resource.to_string(), outputs);

        let eligible = self
            .declared
            .iter()
            .filter(|name| !self.outputs.contains_key(name.as_str()))
            .filter(|name| {
                self.references.get(name.as_str()).is_some_and(|refs| {
                    refs.contains(resource) && refs.iter().all(|r| self.outputs.contains_key(r))
                })
            })
            .cloned()
            .collect();

        Ok(eligible)
    }

    /// Returns true once the outputs of `resource` are recorded.
    #[must_use]
    pub fn is_resolved(&self, resource: &str) -> bool {
        self.outputs.contains_key(resource)
    }

    /// Returns a resolved output field.
    #[must_use]
    pub fn output(&self, reference: &OutputRef) -> Option<&serde_json::Value> {
        self.outputs
            .get(&reference.resource)
            .and_then(|outputs| outputs.get(&reference.field))
    }

    /// Returns all resolved outputs of a resource.
    #[must_use]
    pub fn outputs_of(&self, resource: &str) -> Option<&Properties> {
        self.outputs.get(resource)
    }

    /// Returns true if every output `spec` references is resolved.
    #[must_use]
    pub fn is_ready(&self, spec: &ResourceSpec) -> bool {
        spec.referenced_resources()
            .iter()
            .all(|r| self.outputs.contains_key(r))
    }

    /// Resolves a single value against the recorded outputs.
    #[must_use]
    pub fn resolve_value(&self, value: &Value) -> Option<serde_json::Value> {
        value.resolve_with(&|reference: &OutputRef| self.output(reference).cloned())
    }

    /// Produces the fully resolved input snapshot of `spec`.
    ///
    /// Returns `None` while any referenced output is still unknown.
    #[must_use]
    pub fn resolve_inputs(&self, spec: &ResourceSpec) -> Option<Properties> {
        spec.inputs
            .iter()
            .map(|(key, value)| Some((key.clone(), self.resolve_value(value)?)))
            .collect()
    }

    /// Returns the dependencies recorded for `resource`.
    #[must_use]
    pub fn dependencies_of(&self, resource: &str) -> Option<&BTreeSet<String>> {
        self.dependencies.get(resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_single_reference() {
        let value = Value::parse_template("${net1.id}").unwrap();
        assert_eq!(value, Value::reference("net1", "id"));
    }

    #[test]
    fn test_parse_interpolation() {
        let value = Value::parse_template("https://${lb-ip.address}:6443").unwrap();
        let Value::Concat(parts) = &value else {
            panic!("expected concat, got {value:?}");
        };
        assert_eq!(parts.len(), 3);
        assert_eq!(value.references().len(), 1);
    }

    #[test]
    fn test_parse_plain_string_is_literal() {
        let value = Value::parse_template("10.0.0.0/16").unwrap();
        assert_eq!(value, Value::literal("10.0.0.0/16"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Value::parse_template("${net1.id").is_err());
        assert!(Value::parse_template("${net1}").is_err());
        assert!(Value::parse_template("${.id}").is_err());
    }

    #[test]
    fn test_from_json_collapses_reference_free_lists() {
        let value = Value::from_json(json!(["a", "b"])).unwrap();
        assert_eq!(value, Value::literal(json!(["a", "b"])));

        let value = Value::from_json(json!(["${subnet-01.id}", "x"])).unwrap();
        assert!(matches!(value, Value::List(_)));
    }

    #[test]
    fn test_bind_variables() {
        let mut vars = BTreeMap::new();
        vars.insert(String::from("imageId"), String::from("img-123"));

        let value = Value::parse_template("image-${var.imageId}").unwrap();
        let bound = value.bind_variables(&vars).unwrap();
        assert_eq!(bound, Value::literal("image-img-123"));

        let missing = Value::parse_template("${var.nope}").unwrap();
        assert!(matches!(
            missing.bind_variables(&vars),
            Err(ConfigError::MissingVariable { .. })
        ));
    }

    #[test]
    fn test_resolve_with_renders_concat() {
        let value = Value::Concat(vec![
            Value::literal("https://"),
            Value::reference("lb", "ip"),
            Value::literal(":"),
            Value::literal(6443),
        ]);
        let rendered = value.resolve_with(&|r: &OutputRef| {
            (r.resource == "lb").then(|| json!("1.2.3.4"))
        });
        assert_eq!(rendered, Some(json!("https://1.2.3.4:6443")));
    }

    #[test]
    fn test_resolve_once_only() {
        let mut graph = ValueGraph::new();
        let net = ResourceSpec::new("test:net", "net1");
        graph.declare(&net).unwrap();

        graph.resolve("net1", Properties::new()).unwrap();
        let second = graph.resolve("net1", Properties::new());
        assert!(matches!(second, Err(GraphError::AlreadyResolved { .. })));
    }

    #[test]
    fn test_resolve_reports_newly_eligible() {
        let mut graph = ValueGraph::new();
        let net = ResourceSpec::new("test:net", "net1");
        let subnet = ResourceSpec::new("test:subnet", "sub1").input("network_id", Value::reference("net1", "id"));
        let vm = ResourceSpec::new("test:vm", "vm1")
            .input("network_id", Value::reference("net1", "id"))
            .input("subnet_id", Value::reference("sub1", "id"));
        graph.declare(&net).unwrap();
        graph.declare(&subnet).unwrap();
        graph.declare(&vm).unwrap();

        let mut outputs = Properties::new();
        outputs.insert(String::from("id"), json!("net-abc"));
        let eligible = graph.resolve("net1", outputs).unwrap();

        assert_eq!(eligible, vec![String::from("sub1")]);
        assert!(graph.is_ready(&subnet));
        assert!(!graph.is_ready(&vm));
        assert_eq!(
            graph.resolve_inputs(&subnet).unwrap().get("network_id"),
            Some(&json!("net-abc"))
        );
        assert!(graph.resolve_inputs(&vm).is_none());
    }

    #[test]
    fn test_declare_rejects_cycle() {
        let mut graph = ValueGraph::new();
        let a = ResourceSpec::new("test:x", "a").input("b", Value::reference("b", "id"));
        let b = ResourceSpec::new("test:x", "b").input("a", Value::reference("a", "id"));
        graph.declare(&a).unwrap();

        let err = graph.declare(&b).unwrap_err();
        let GraphError::CyclicDependency { cycle } = err else {
            panic!("expected cycle");
        };
        assert_eq!(cycle, vec!["b", "a", "b"]);
    }
}
