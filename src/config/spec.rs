//! Stack file types.
//!
//! This module defines the structs that map to `terrace.yaml`. A stack file
//! declares providers, variables, resources and exported outputs. Resource
//! inputs are plain YAML; strings may contain `${resource.field}` and
//! `${var.name}` templates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

use crate::provider::DEFAULT_CALL_TIMEOUT_SECS;

/// Default number of provider operations in flight.
pub const DEFAULT_PARALLELISM: usize = 10;

/// The root of a stack file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    /// Stack identity.
    pub stack: StackInfo,
    /// Engine settings.
    #[serde(default)]
    pub settings: SettingsConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider plugins.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Stack variables, referenced as `${var.name}`.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Declared resources.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Exported outputs: name to template.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

/// Stack identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackInfo {
    /// Stack name; also the key of the persisted state.
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
}

/// Engine settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct SettingsConfig {
    /// Maximum number of provider operations in flight.
    #[serde(default = "default_parallelism")]
    #[validate(range(min = 1, max = 256))]
    pub parallelism: usize,
    /// Per-call timeout in seconds.
    #[serde(default = "default_call_timeout_secs")]
    #[validate(range(min = 1, max = 86_400))]
    pub call_timeout_secs: u64,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// Base directory for the local backend.
    #[serde(default)]
    pub path: Option<String>,
    /// S3 bucket (required for the s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix.
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region.
    #[serde(default)]
    pub region: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local JSON files.
    #[default]
    Local,
    /// AWS S3.
    S3,
}

/// A provider plugin registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Kind prefix served by this provider (`azure` serves `azure:*`).
    pub name: String,
    /// Provider implementation.
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    /// Endpoint URL for `http` providers.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Environment variable holding a bearer token for `http` providers.
    #[serde(default)]
    pub token_env: Option<String>,
    /// Additional exact kinds served by this provider.
    #[serde(default)]
    pub kinds: Vec<String>,
    /// Input keys whose change forces replacement (`echo` providers).
    #[serde(default)]
    pub force_new: Vec<String>,
}

/// Provider implementations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Remote provider reached over HTTP.
    Http,
    /// Builtin provider mirroring inputs as outputs.
    Echo,
}

/// A declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Unique resource name.
    pub name: String,
    /// Resource kind, `provider:type`.
    pub kind: String,
    /// Input properties; strings may contain templates.
    #[serde(default)]
    pub inputs: BTreeMap<String, serde_json::Value>,
    /// Explicit ordering-only dependencies.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

const fn default_parallelism() -> usize {
    DEFAULT_PARALLELISM
}

const fn default_call_timeout_secs() -> u64 {
    DEFAULT_CALL_TIMEOUT_SECS
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
        }
    }
}

impl StackConfig {
    /// Gets a resource by name.
    #[must_use]
    pub fn get_resource(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Returns all resource names in declaration order.
    #[must_use]
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.name.as_str()).collect()
    }
}

impl std::fmt::Display for StateBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Local => "local",
            Self::S3 => "s3",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Http => "http",
            Self::Echo => "echo",
        };
        write!(f, "{s}")
    }
}
