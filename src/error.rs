//! Error types for the Terrace provisioning engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! stack configuration, the resource graph, provider calls, state storage
//! and the run itself.
//!
//! Graph and configuration errors are fatal and surface before any provider
//! call is made. Provider errors are resource-local: the executor records them
//! against the failing resource and keeps going with independent branches.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Terrace engine.
#[derive(Debug, Error)]
pub enum TerraceError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph errors (pre-execution).
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider plugin errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Run-level errors.
    #[error("Run error: {0}")]
    Run(#[from] RunError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The stack file was not found.
    #[error("Stack file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The stack file could not be parsed.
    #[error("Failed to parse stack file: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Stack validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// A stack variable is referenced but has no value.
    #[error("Missing stack variable: {name} (set it under `variables` or via TERRACE_VAR_{name})")]
    MissingVariable {
        /// Name of the missing variable.
        name: String,
    },

    /// A `${...}` template could not be parsed.
    #[error("Invalid reference template '{template}': {reason}")]
    InvalidTemplate {
        /// The offending template string.
        template: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Resource graph errors.
///
/// All of these are raised before execution starts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// A dependency cycle was found.
    #[error("Cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency {
        /// Cycle members in traversal order; the first member is repeated at the end.
        cycle: Vec<String>,
    },

    /// A resource with the same name was already declared in this run.
    #[error("Duplicate resource name: {name}")]
    DuplicateName {
        /// The duplicated name.
        name: String,
    },

    /// A resource references one that was never declared.
    #[error("Resource '{resource}' references undeclared resource '{target}'")]
    UnknownReference {
        /// The referencing resource.
        resource: String,
        /// The missing target.
        target: String,
    },

    /// Outputs for a resource were resolved twice.
    #[error("Outputs of '{resource}' are already resolved")]
    AlreadyResolved {
        /// The resource whose outputs were resolved before.
        resource: String,
    },

    /// No provider plugin is registered for a resource kind.
    #[error("No provider registered for kind '{kind}' (resource '{resource}')")]
    UnknownKind {
        /// The resource kind.
        kind: String,
        /// The resource declaring it.
        resource: String,
    },
}

/// Category of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// The call did not finish within the configured timeout.
    Timeout,
    /// The provider refused the request (bad input, quota, permissions).
    Rejected,
    /// A temporary failure; re-running later may succeed.
    Transient,
    /// The remote resource does not exist.
    NotFound,
    /// Anything else.
    Unknown,
}

/// A failed provider call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind} error: {message}")]
pub struct ProviderError {
    /// Failure category.
    pub kind: ProviderErrorKind,
    /// Human-readable message from the provider.
    pub message: String,
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Writing state to the backend failed.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Run-level errors.
#[derive(Debug, Error)]
pub enum RunError {
    /// The run was cancelled before it could start.
    #[error("Run aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },

    /// An executor task panicked or was cancelled by the runtime.
    #[error("Task for '{resource}' did not complete: {message}")]
    TaskFailed {
        /// Resource owned by the task.
        resource: String,
        /// Join error description.
        message: String,
    },
}

/// Result type alias for Terrace operations.
pub type Result<T> = std::result::Result<T, TerraceError>;

impl TerraceError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is a pre-execution configuration problem.
    #[must_use]
    pub const fn is_pre_execution(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Graph(_))
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a write error with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a provider error of the given kind.
    #[must_use]
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Rejected, message)
    }

    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Transient, message)
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::NotFound, message)
    }

    /// Returns true if the error reports a missing remote resource.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind, ProviderErrorKind::NotFound)
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Rejected => "rejected",
            Self::Transient => "transient",
            Self::NotFound => "not found",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_members() {
        let err = GraphError::CyclicDependency {
            cycle: vec![String::from("a"), String::from("b"), String::from("a")],
        };
        assert_eq!(err.to_string(), "Cyclic dependency: a -> b -> a");
    }

    #[test]
    fn test_pre_execution_classification() {
        let graph: TerraceError = GraphError::DuplicateName {
            name: String::from("net1"),
        }
        .into();
        assert!(graph.is_pre_execution());

        let provider: TerraceError = ProviderError::timeout("slow").into();
        assert!(!provider.is_pre_execution());
    }
}
