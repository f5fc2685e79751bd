//! Persisted state of a stack.
//!
//! One [`StackState`] per stack holds the last known state of every resource
//! the engine created: external id, resolved inputs and their hash, outputs
//! and the dependencies recorded when it was last applied. Dependencies are
//! kept so that resources removed from the declarations can still be deleted
//! in a safe order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::graph::Properties;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Maximum number of history entries kept.
const MAX_HISTORY: usize = 100;

/// The complete state of one stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackState {
    /// State format version.
    pub version: String,
    /// Stack name.
    pub stack: String,
    /// Resource states keyed by name.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceState>,
    /// Exported outputs of the last run.
    #[serde(default)]
    pub exports: BTreeMap<String, serde_json::Value>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Run history (recent entries).
    #[serde(default)]
    pub history: Vec<RunHistoryEntry>,
}

/// Last known state of one resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceState {
    /// Resource name.
    pub name: String,
    /// Resource kind.
    pub kind: String,
    /// External id assigned by the provider.
    #[serde(default)]
    pub external_id: Option<String>,
    /// Resolved inputs at the last successful apply.
    #[serde(default)]
    pub inputs: Properties,
    /// Hash of `inputs`.
    #[serde(default)]
    pub inputs_hash: String,
    /// Outputs at the last successful apply, including `id`.
    #[serde(default)]
    pub outputs: Properties,
    /// Resources this one depended on when it was applied.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Current status.
    pub status: ResourceStatus,
    /// Error of the last failed operation.
    #[serde(default)]
    pub error: Option<String>,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle status of a resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// Declared, not started.
    Pending,
    /// Create in progress.
    Creating,
    /// Update in progress.
    Updating,
    /// Exists and matches its last applied inputs.
    Ready,
    /// The last operation failed.
    Failed,
    /// Delete in progress.
    Deleting,
    /// Deleted.
    Deleted,
    /// Not started because an upstream operation failed.
    Blocked,
}

/// Entry in the run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Run mode.
    pub operation: HistoryOperation,
    /// Hash of the declarations at the time of the run.
    pub config_hash: String,
    /// Resources touched by the run.
    pub resources: Vec<String>,
    /// Whether every operation succeeded.
    pub success: bool,
    /// Failure summary.
    #[serde(default)]
    pub error: Option<String>,
}

/// Kind of run recorded in history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOperation {
    /// Apply run.
    Apply,
    /// Destroy run.
    Destroy,
}

impl StackState {
    /// Creates an empty state for a stack.
    #[must_use]
    pub fn new(stack: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            stack: stack.to_string(),
            resources: BTreeMap::new(),
            exports: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a resource by name.
    #[must_use]
    pub fn get_resource(&self, name: &str) -> Option<&ResourceState> {
        self.resources.get(name)
    }

    /// Gets a mutable reference to a resource by name.
    pub fn get_resource_mut(&mut self, name: &str) -> Option<&mut ResourceState> {
        self.resources.get_mut(name)
    }

    /// Adds or replaces a resource.
    pub fn set_resource(&mut self, resource: ResourceState) {
        self.resources.insert(resource.name.clone(), resource);
        self.last_updated = Utc::now();
    }

    /// Removes a resource by name.
    pub fn remove_resource(&mut self, name: &str) -> Option<ResourceState> {
        let removed = self.resources.remove(name);
        if removed.is_some() {
            self.last_updated = Utc::now();
        }
        removed
    }

    /// Adds a history entry, dropping the oldest beyond the retention limit.
    pub fn add_history(&mut self, entry: RunHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Names of all resources in state.
    #[must_use]
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    /// Returns true if no resource is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl ResourceState {
    /// Creates the state of a freshly created resource.
    #[must_use]
    pub fn new(name: &str, kind: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            external_id: None,
            inputs: Properties::new(),
            inputs_hash: String::new(),
            outputs: Properties::new(),
            dependencies: BTreeSet::new(),
            status: ResourceStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Updates the status.
    pub fn set_status(&mut self, status: ResourceStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Records a successful create or update.
    pub fn record_applied(
        &mut self,
        external_id: String,
        inputs: Properties,
        inputs_hash: String,
        outputs: Properties,
    ) {
        self.external_id = Some(external_id);
        self.inputs = inputs;
        self.inputs_hash = inputs_hash;
        self.outputs = outputs;
        self.error = None;
        self.set_status(ResourceStatus::Ready);
    }

    /// Records a failed operation.
    pub fn record_failure(&mut self, error: &str) {
        self.error = Some(error.to_string());
        self.set_status(ResourceStatus::Failed);
    }

    /// Returns true if the resource exists remotely.
    #[must_use]
    pub const fn has_external_id(&self) -> bool {
        self.external_id.is_some()
    }
}

impl RunHistoryEntry {
    /// Creates a history entry.
    #[must_use]
    pub fn new(
        operation: HistoryOperation,
        config_hash: &str,
        resources: Vec<String>,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: error.is_none(),
            error,
        }
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Pending => "pending",
            Self::Creating => "creating",
            Self::Updating => "updating",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Blocked => "blocked",
        };
        write!(f, "{status}")
    }
}

impl std::fmt::Display for HistoryOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_history_is_bounded() {
        let mut state = StackState::new("dev");
        for i in 0..(MAX_HISTORY + 5) {
            state.add_history(RunHistoryEntry::new(
                HistoryOperation::Apply,
                &i.to_string(),
                Vec::new(),
                None,
            ));
        }
        assert_eq!(state.history.len(), MAX_HISTORY);
        assert_eq!(state.history[0].config_hash, "5");
    }

    #[test]
    fn test_record_applied_clears_error() {
        let mut resource = ResourceState::new("net1", "test:net");
        resource.record_failure("quota exceeded");
        assert_eq!(resource.status, ResourceStatus::Failed);

        let mut outputs = Properties::new();
        outputs.insert(String::from("id"), json!("net-abc"));
        resource.record_applied(String::from("net-abc"), Properties::new(), String::from("h"), outputs);

        assert_eq!(resource.status, ResourceStatus::Ready);
        assert!(resource.error.is_none());
        assert!(resource.has_external_id());
    }

    #[test]
    fn test_state_serde_defaults() {
        let raw = json!({
            "version": "1.0",
            "stack": "dev",
            "last_updated": "2026-01-01T00:00:00Z"
        });
        let state: StackState = serde_json::from_value(raw).unwrap();
        assert!(state.is_empty());
        assert!(state.exports.is_empty());
    }
}
