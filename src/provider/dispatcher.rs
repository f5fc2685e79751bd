//! Routes operations to provider plugins.
//!
//! The dispatcher owns the provider registry and the per-call timeout. It
//! never retries: a failed call is reported to the executor, which records it
//! against the resource.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{GraphError, ProviderError};
use crate::graph::{ID_FIELD, Properties, provider_prefix};

use super::plugin::{Provider, UpdateOutcome};

/// Default per-call timeout in seconds.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 300;

/// Providers keyed by exact kind or by provider prefix.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    /// Registered providers.
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.providers.keys().collect();
        keys.sort();
        f.debug_struct("ProviderRegistry")
            .field("providers", &keys)
            .finish()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider for an exact kind (`azure:network/Subnet`) or a
    /// provider prefix (`azure`).
    pub fn register(&mut self, key: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(key.into(), provider);
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.register(key, provider);
        self
    }

    /// Finds the provider for a kind: exact match first, then prefix.
    #[must_use]
    pub fn lookup(&self, kind: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .get(kind)
            .or_else(|| self.providers.get(provider_prefix(kind)))
            .cloned()
    }

    /// Number of registered keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Returns true if no provider is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// One provider operation with its resolved arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchRequest {
    /// Create from resolved inputs.
    Create {
        /// Resource kind.
        kind: String,
        /// Resolved inputs.
        inputs: Properties,
    },
    /// Update in place.
    Update {
        /// Resource kind.
        kind: String,
        /// External id.
        id: String,
        /// Inputs recorded at the last successful apply.
        old_inputs: Properties,
        /// New resolved inputs.
        new_inputs: Properties,
    },
    /// Delete.
    Delete {
        /// Resource kind.
        kind: String,
        /// External id.
        id: String,
        /// Last known outputs.
        outputs: Properties,
    },
}

impl DispatchRequest {
    /// Kind targeted by the request.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Create { kind, .. } | Self::Update { kind, .. } | Self::Delete { kind, .. } => {
                kind
            }
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }
}

/// Successful dispatch outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Created; outputs include the `id` field.
    Created {
        /// External id.
        id: String,
        /// Outputs including `id`.
        outputs: Properties,
    },
    /// Updated in place; outputs include the `id` field.
    Updated {
        /// Outputs including `id`.
        outputs: Properties,
    },
    /// The update must be carried out as delete then create.
    RequiresReplacement,
    /// Deleted (or already gone).
    Deleted,
}

/// Dispatches operations to the provider registered for each kind.
#[derive(Debug)]
pub struct ProviderDispatcher {
    /// Provider registry.
    registry: ProviderRegistry,
    /// Timeout applied to every call.
    call_timeout: Duration,
}

impl ProviderDispatcher {
    /// Creates a dispatcher with the default call timeout.
    #[must_use]
    pub fn new(registry: ProviderRegistry) -> Self {
        Self {
            registry,
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
        }
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub const fn with_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Returns the configured per-call timeout.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Checks that a provider is registered for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownKind`] otherwise.
    pub fn check_kind(&self, kind: &str, resource: &str) -> Result<(), GraphError> {
        if self.registry.lookup(kind).is_some() {
            Ok(())
        } else {
            Err(GraphError::UnknownKind {
                kind: kind.to_string(),
                resource: resource.to_string(),
            })
        }
    }

    /// Runs one operation against its provider.
    ///
    /// # Errors
    ///
    /// Returns the provider's error, or [`ProviderError`] with kind `Timeout`
    /// if the call exceeds the configured timeout. A delete answered with
    /// `NotFound` is reported as [`DispatchOutcome::Deleted`].
    pub async fn apply(&self, request: DispatchRequest) -> Result<DispatchOutcome, ProviderError> {
        let provider = self.registry.lookup(request.kind()).ok_or_else(|| {
            ProviderError::rejected(format!("no provider registered for kind '{}'", request.kind()))
        })?;

        debug!("Dispatching {} for kind {}", request.verb(), request.kind());

        match request {
            DispatchRequest::Create { kind, inputs } => {
                let created = self
                    .call_with_timeout("create", provider.create(&kind, &inputs))
                    .await?;
                let outputs = with_id(created.outputs, &created.id);
                info!("Created {kind} with id {}", created.id);
                Ok(DispatchOutcome::Created {
                    id: created.id,
                    outputs,
                })
            }
            DispatchRequest::Update {
                kind,
                id,
                old_inputs,
                new_inputs,
            } => {
                let outcome = self
                    .call_with_timeout(
                        "update",
                        provider.update(&kind, &id, &old_inputs, &new_inputs),
                    )
                    .await?;
                match outcome {
                    UpdateOutcome::Updated(outputs) => Ok(DispatchOutcome::Updated {
                        outputs: with_id(outputs, &id),
                    }),
                    UpdateOutcome::RequiresReplacement => {
                        info!("Update of {id} ({kind}) requires replacement");
                        Ok(DispatchOutcome::RequiresReplacement)
                    }
                }
            }
            DispatchRequest::Delete { kind, id, outputs } => {
                match self
                    .call_with_timeout("delete", provider.delete(&kind, &id, &outputs))
                    .await
                {
                    Ok(()) => Ok(DispatchOutcome::Deleted),
                    Err(e) if e.is_not_found() => {
                        warn!("Resource {id} ({kind}) was already gone: {}", e.message);
                        Ok(DispatchOutcome::Deleted)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn call_with_timeout<T>(
        &self,
        verb: &str,
        call: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        tokio::time::timeout(self.call_timeout, call)
            .await
            .unwrap_or_else(|_| {
                Err(ProviderError::timeout(format!(
                    "{verb} did not complete within {}s",
                    self.call_timeout.as_secs_f64()
                )))
            })
    }
}

/// Ensures the external id is exposed as the `id` output.
fn with_id(mut outputs: Properties, id: &str) -> Properties {
    outputs.insert(
        ID_FIELD.to_string(),
        serde_json::Value::String(id.to_string()),
    );
    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderErrorKind;
    use crate::provider::plugin::{Created, MockProvider};
    use serde_json::json;

    fn dispatcher(mock: MockProvider) -> ProviderDispatcher {
        let registry = ProviderRegistry::new().with("test", Arc::new(mock));
        ProviderDispatcher::new(registry)
    }

    #[tokio::test]
    async fn test_create_injects_id_output() {
        let mut mock = MockProvider::new();
        mock.expect_create()
            .withf(|kind, inputs| kind == "test:net" && inputs.contains_key("cidr"))
            .times(1)
            .returning(|_, _| {
                let mut outputs = Properties::new();
                outputs.insert(String::from("cidr"), json!("10.0.0.0/16"));
                Ok(Created {
                    id: String::from("net-abc"),
                    outputs,
                })
            });

        let mut inputs = Properties::new();
        inputs.insert(String::from("cidr"), json!("10.0.0.0/16"));
        let outcome = dispatcher(mock)
            .apply(DispatchRequest::Create {
                kind: String::from("test:net"),
                inputs,
            })
            .await
            .unwrap();

        let DispatchOutcome::Created { id, outputs } = outcome else {
            panic!("expected Created");
        };
        assert_eq!(id, "net-abc");
        assert_eq!(outputs.get("id"), Some(&json!("net-abc")));
    }

    #[tokio::test]
    async fn test_delete_not_found_counts_as_deleted() {
        let mut mock = MockProvider::new();
        mock.expect_delete()
            .times(1)
            .returning(|_, _, _| Err(ProviderError::not_found("gone")));

        let outcome = dispatcher(mock)
            .apply(DispatchRequest::Delete {
                kind: String::from("test:net"),
                id: String::from("net-abc"),
                outputs: Properties::new(),
            })
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Deleted);
    }

    #[tokio::test]
    async fn test_update_requires_replacement() {
        let mut mock = MockProvider::new();
        mock.expect_update()
            .times(1)
            .returning(|_, _, _, _| Ok(UpdateOutcome::RequiresReplacement));

        let outcome = dispatcher(mock)
            .apply(DispatchRequest::Update {
                kind: String::from("test:vm"),
                id: String::from("vm-1"),
                old_inputs: Properties::new(),
                new_inputs: Properties::new(),
            })
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::RequiresReplacement);
    }

    struct SlowProvider;

    #[async_trait::async_trait]
    impl Provider for SlowProvider {
        async fn create(&self, _kind: &str, _inputs: &Properties) -> Result<Created, ProviderError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Created {
                id: String::from("late"),
                outputs: Properties::new(),
            })
        }

        async fn update(
            &self,
            _kind: &str,
            _id: &str,
            _old: &Properties,
            _new: &Properties,
        ) -> Result<UpdateOutcome, ProviderError> {
            Ok(UpdateOutcome::RequiresReplacement)
        }

        async fn delete(&self, _kind: &str, _id: &str, _outputs: &Properties) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_call_timeout() {
        let registry = ProviderRegistry::new().with("slow:thing", Arc::new(SlowProvider));
        let dispatcher =
            ProviderDispatcher::new(registry).with_timeout(Duration::from_millis(20));

        let err = dispatcher
            .apply(DispatchRequest::Create {
                kind: String::from("slow:thing"),
                inputs: Properties::new(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_fast_calls_finish_within_timeout() {
        let registry = ProviderRegistry::new().with("slow:thing", Arc::new(SlowProvider));
        let dispatcher = ProviderDispatcher::new(registry).with_timeout(Duration::from_secs(5));
        assert_eq!(dispatcher.call_timeout(), Duration::from_secs(5));

        let outcome = dispatcher
            .apply(DispatchRequest::Update {
                kind: String::from("slow:thing"),
                id: String::from("thing-1"),
                old_inputs: Properties::new(),
                new_inputs: Properties::new(),
            })
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::RequiresReplacement));

        let outcome = dispatcher
            .apply(DispatchRequest::Delete {
                kind: String::from("slow:thing"),
                id: String::from("thing-1"),
                outputs: Properties::new(),
            })
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Deleted));
    }

    #[test]
    fn test_lookup_exact_then_prefix() {
        let registry = ProviderRegistry::new()
            .with("azure", Arc::new(SlowProvider))
            .with("azure:network/Subnet", Arc::new(SlowProvider));
        let dispatcher = ProviderDispatcher::new(registry);

        assert!(dispatcher.check_kind("azure:network/Subnet", "s").is_ok());
        assert!(dispatcher.check_kind("azure:compute/VirtualMachine", "vm").is_ok());
        assert!(matches!(
            dispatcher.check_kind("talos:machine/Secrets", "secrets"),
            Err(GraphError::UnknownKind { .. })
        ));
    }
}
