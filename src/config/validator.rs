//! Stack file validation.
//!
//! Collects every problem in one pass so `terrace validate` can report them
//! together. Graph-level checks (cycles) are left to the resolver; this pass
//! catches what can be seen from the file alone.

use std::collections::{BTreeSet, HashSet};
use tracing::debug;
use validator::Validate;

use crate::error::{ConfigError, Result};
use crate::graph::{VARIABLE_NAMESPACE, Value, provider_prefix};

use super::spec::{ProviderConfig, ProviderType, ResourceConfig, StackConfig, StateBackend};

/// Validator for stack files.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all problems found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Validation errors.
    pub errors: Vec<ValidationError>,
    /// Non-fatal issues.
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a stack.
    ///
    /// # Errors
    ///
    /// Returns the first error if any check fails; use
    /// [`collect`](Self::collect) to get all of them.
    pub fn validate(&self, config: &StackConfig) -> Result<ValidationResult> {
        let result = self.collect(config);

        if let Some(first) = result.errors.first() {
            return Err(ConfigError::ValidationError {
                message: first.message.clone(),
                field: Some(first.field.clone()),
            }
            .into());
        }

        debug!("Stack validation passed");
        Ok(result)
    }

    /// Runs every check and returns all findings.
    #[must_use]
    pub fn collect(&self, config: &StackConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_stack(config, &mut result);
        Self::validate_settings(config, &mut result);
        Self::validate_state(config, &mut result);
        let served = Self::validate_providers(&config.providers, &mut result);
        Self::validate_resources(config, &served, &mut result);
        Self::validate_outputs(config, &mut result);

        result
    }

    fn validate_stack(config: &StackConfig, result: &mut ValidationResult) {
        if !is_valid_name(&config.stack.name) {
            result.error(
                "stack.name",
                format!(
                    "Stack name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    config.stack.name
                ),
            );
        }
    }

    fn validate_settings(config: &StackConfig, result: &mut ValidationResult) {
        if let Err(errors) = config.settings.validate() {
            for (field, field_errors) in errors.field_errors() {
                for error in field_errors {
                    result.error(
                        format!("settings.{field}"),
                        format!("Value out of range ({})", error.code),
                    );
                }
            }
        }
    }

    fn validate_state(config: &StackConfig, result: &mut ValidationResult) {
        match config.state.backend {
            StateBackend::S3 => {
                if config.state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
            }
            StateBackend::Local => {
                if config.state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored by the local backend"));
                }
            }
        }
    }

    /// Returns every kind or prefix served by a provider.
    fn validate_providers(providers: &[ProviderConfig], result: &mut ValidationResult) -> HashSet<String> {
        let mut served = HashSet::new();

        for (i, provider) in providers.iter().enumerate() {
            let prefix = format!("providers[{i}]");

            if provider.name.is_empty() || provider.name.contains(':') {
                result.error(
                    format!("{prefix}.name"),
                    format!("Provider name '{}' must be a non-empty kind prefix", provider.name),
                );
            }
            if !served.insert(provider.name.clone()) {
                result.error(
                    format!("{prefix}.name"),
                    format!("Duplicate provider: {}", provider.name),
                );
            }
            for kind in &provider.kinds {
                if !served.insert(kind.clone()) {
                    result.error(
                        format!("{prefix}.kinds"),
                        format!("Kind '{kind}' is served by more than one provider"),
                    );
                }
            }

            match provider.provider_type {
                ProviderType::Http => match provider.endpoint.as_deref() {
                    None | Some("") => result.error(
                        format!("{prefix}.endpoint"),
                        format!("HTTP provider '{}' needs an endpoint", provider.name),
                    ),
                    Some(endpoint) if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") => {
                        result.error(
                            format!("{prefix}.endpoint"),
                            format!("Endpoint '{endpoint}' must be an http(s) URL"),
                        );
                    }
                    Some(_) => {}
                },
                ProviderType::Echo => {
                    if provider.endpoint.is_some() {
                        result.warnings.push(format!(
                            "{prefix}.endpoint: ignored by echo provider '{}'",
                            provider.name
                        ));
                    }
                }
            }

            if provider.provider_type == ProviderType::Http && !provider.force_new.is_empty() {
                result.warnings.push(format!(
                    "{prefix}.force_new: ignored by http provider '{}'",
                    provider.name
                ));
            }
        }

        served
    }

    fn validate_resources(config: &StackConfig, served: &HashSet<String>, result: &mut ValidationResult) {
        if config.resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in stack"));
            return;
        }

        let declared: BTreeSet<&str> = config.resources.iter().map(|r| r.name.as_str()).collect();
        let mut seen = HashSet::new();
        let mut used_variables = BTreeSet::new();

        for (i, resource) in config.resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !seen.insert(resource.name.as_str()) {
                result.error(
                    format!("{prefix}.name"),
                    format!("Duplicate resource name: {}", resource.name),
                );
            }
            if resource.name == VARIABLE_NAMESPACE {
                result.error(
                    format!("{prefix}.name"),
                    format!("'{VARIABLE_NAMESPACE}' is reserved for stack variables"),
                );
            } else if !is_valid_name(&resource.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!(
                        "Resource name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                        resource.name
                    ),
                );
            }

            Self::validate_kind(resource, served, &prefix, result);

            for dep in &resource.depends_on {
                if dep == &resource.name {
                    result
                        .warnings
                        .push(format!("{prefix}.depends_on: '{dep}' depends on itself"));
                } else if !declared.contains(dep.as_str()) {
                    result.error(
                        format!("{prefix}.depends_on"),
                        format!("'{}' depends on undeclared resource '{dep}'", resource.name),
                    );
                }
            }

            for (key, raw) in &resource.inputs {
                let field = format!("{prefix}.inputs.{key}");
                match Value::from_json(raw.clone()) {
                    Ok(value) => {
                        check_references(&value, &declared, config, &field, &mut used_variables, result);
                    }
                    Err(e) => result.error(field, e.to_string()),
                }
            }
        }

        for value in config.outputs.values().filter_map(|t| Value::parse_template(t).ok()) {
            for reference in value.references() {
                if reference.resource == VARIABLE_NAMESPACE {
                    used_variables.insert(reference.field.clone());
                }
            }
        }

        for name in config.variables.keys() {
            if !used_variables.contains(name.as_str()) {
                result
                    .warnings
                    .push(format!("variables.{name}: defined but never used"));
            }
        }
    }

    fn validate_kind(resource: &ResourceConfig, served: &HashSet<String>, prefix: &str, result: &mut ValidationResult) {
        let valid_shape = resource
            .kind
            .split_once(':')
            .is_some_and(|(p, t)| !p.is_empty() && !t.is_empty());
        if !valid_shape {
            result.error(
                format!("{prefix}.kind"),
                format!("Kind '{}' must look like 'provider:type'", resource.kind),
            );
            return;
        }

        if !served.contains(&resource.kind) && !served.contains(provider_prefix(&resource.kind)) {
            result.error(
                format!("{prefix}.kind"),
                format!(
                    "No provider registered for kind '{}' (resource '{}')",
                    resource.kind, resource.name
                ),
            );
        }
    }

    fn validate_outputs(config: &StackConfig, result: &mut ValidationResult) {
        let declared: BTreeSet<&str> = config.resources.iter().map(|r| r.name.as_str()).collect();
        let mut used_variables = BTreeSet::new();

        for (name, template) in &config.outputs {
            let field = format!("outputs.{name}");
            match Value::parse_template(template) {
                Ok(value) => {
                    check_references(&value, &declared, config, &field, &mut used_variables, result);
                }
                Err(e) => result.error(field, e.to_string()),
            }
        }
    }
}

fn check_references(
    value: &Value,
    declared: &BTreeSet<&str>,
    config: &StackConfig,
    field: &str,
    used_variables: &mut BTreeSet<String>,
    result: &mut ValidationResult,
) {
    for reference in value.references() {
        if reference.resource == VARIABLE_NAMESPACE {
            used_variables.insert(reference.field.clone());
            if !config.variables.contains_key(&reference.field) {
                result.warnings.push(format!(
                    "{field}: variable '{}' is not set in the stack file; it must come from TERRACE_VAR_{}",
                    reference.field, reference.field
                ));
            }
        } else if !declared.contains(reference.resource.as_str()) {
            result.error(
                field,
                format!("Reference {reference} targets undeclared resource '{}'", reference.resource),
            );
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.ends_with('-')
        && !name.contains("--")
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> StackConfig {
        ConfigParser::new().parse_yaml(yaml, None).unwrap()
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("talos-rg"));
        assert!(is_valid_name("subnet-01"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Talos-Rg"));
        assert!(!is_valid_name("01-subnet"));
        assert!(!is_valid_name("talos_rg"));
        assert!(!is_valid_name("talos-"));
        assert!(!is_valid_name("talos--rg"));
    }

    #[test]
    fn test_valid_stack() {
        let config = parse(
            r"
stack:
  name: dev
providers:
  - name: echo
    type: echo
resources:
  - name: net1
    kind: echo:network
  - name: vm1
    kind: echo:vm
    inputs:
      network_id: ${net1.id}
outputs:
  vm: ${vm1.id}
",
        );
        let result = ConfigValidator::new().validate(&config).unwrap();
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_collects_all_errors() {
        let config = parse(
            r"
stack:
  name: Dev
settings:
  parallelism: 0
state:
  backend: s3
providers:
  - name: azure
    type: http
resources:
  - name: net1
    kind: gcp:network
  - name: net1
    kind: azure
    depends_on: [ghost]
    inputs:
      x: ${nowhere.id}
",
        );
        let result = ConfigValidator::new().collect(&config);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();

        assert!(fields.contains(&"stack.name"));
        assert!(fields.contains(&"settings.parallelism"));
        assert!(fields.contains(&"state.bucket"));
        assert!(fields.contains(&"providers[0].endpoint"));
        assert!(fields.contains(&"resources[0].kind"));
        assert!(fields.contains(&"resources[1].name"));
        assert!(fields.contains(&"resources[1].kind"));
        assert!(fields.contains(&"resources[1].depends_on"));
        assert!(fields.contains(&"resources[1].inputs.x"));
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_unused_variable_warning() {
        let config = parse(
            r"
stack:
  name: dev
variables:
  imageId: img
providers:
  - name: echo
    type: echo
resources:
  - name: net1
    kind: echo:network
",
        );
        let result = ConfigValidator::new().collect(&config);
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 1);
    }
}
