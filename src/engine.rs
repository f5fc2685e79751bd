//! Engine driving a stack through plan, apply and destroy runs.
//!
//! Callers declare resources against the engine, export values built from
//! their outputs, then run it. A run resolves the dependency order and checks
//! every kind against the registered providers before any provider call, so
//! configuration errors never leave the stack half-applied. Apply and destroy
//! runs hold the state lock for the whole read-modify-write.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{DEFAULT_PARALLELISM, InputsHasher, StackDeclarations};
use crate::error::Result;
use crate::graph::{
    DependencyResolver, ResolvedOrder, ResourceHandle, ResourceRegistry, ResourceSpec, Value,
    ValueGraph,
};
use crate::planner::{
    DiffEngine, ExecutedOperation, ExecutionResult, OperationType, Plan, PlanExecutor,
    ResourceOutcome,
};
use crate::provider::ProviderDispatcher;
use crate::state::{
    HistoryOperation, ResourceStatus, RunHistoryEntry, StackState, StateStore, generate_holder_id,
};

/// What a run does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Compute the plan only; no provider calls.
    Plan,
    /// Converge remote resources to the declarations.
    Apply,
    /// Delete everything recorded in state.
    Destroy,
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every operation completed.
    Succeeded,
    /// Some resources failed or were blocked.
    PartialFailure,
    /// The run was cancelled before every operation started.
    Aborted,
}

/// Result of one run.
#[derive(Debug)]
pub struct RunResult {
    /// Run mode.
    pub mode: RunMode,
    /// Overall status.
    pub status: RunStatus,
    /// Per-resource outcome.
    pub resources: BTreeMap<String, ResourceOutcome>,
    /// Exported values whose inputs were resolved.
    pub exported_outputs: BTreeMap<String, serde_json::Value>,
    /// Provider calls in completion order.
    pub executed: Vec<ExecutedOperation>,
    /// Plan the run was based on.
    pub plan: Plan,
}

/// Declarative provisioning engine for one stack.
pub struct Engine<S: StateStore> {
    /// Stack name.
    stack: String,
    /// Declared resources.
    registry: ResourceRegistry,
    /// Declaration-time graph, used for cycle detection.
    graph: ValueGraph,
    /// Exported values by name.
    exports: BTreeMap<String, Value>,
    /// Provider dispatcher.
    dispatcher: Arc<ProviderDispatcher>,
    /// State store.
    state_store: S,
    /// Maximum concurrent provider operations.
    parallelism: usize,
    /// Cancels apply and destroy runs.
    cancel: CancellationToken,
    /// Declarations hasher.
    hasher: InputsHasher,
}

impl<S: StateStore> Engine<S> {
    /// Creates an engine for `stack`.
    #[must_use]
    pub fn new(stack: &str, dispatcher: ProviderDispatcher, state_store: S) -> Self {
        Self {
            stack: stack.to_string(),
            registry: ResourceRegistry::new(),
            graph: ValueGraph::new(),
            exports: BTreeMap::new(),
            dispatcher: Arc::new(dispatcher),
            state_store,
            parallelism: DEFAULT_PARALLELISM,
            cancel: CancellationToken::new(),
            hasher: InputsHasher::new(),
        }
    }

    /// Sets the maximum number of concurrent provider operations.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Declares a resource and returns a handle to its outputs.
    ///
    /// # Errors
    ///
    /// Returns a graph error if the name is taken or the new references close
    /// a cycle. Nothing is recorded in that case.
    pub fn declare(&mut self, spec: ResourceSpec) -> Result<ResourceHandle> {
        let handle = self.graph.declare(&spec)?;
        self.registry.register(spec)?;
        Ok(handle)
    }

    /// Declares every resource and export of a stack file.
    ///
    /// # Errors
    ///
    /// Returns the first declaration error.
    pub fn declare_all(&mut self, declarations: StackDeclarations) -> Result<()> {
        for spec in declarations.resources {
            self.declare(spec)?;
        }
        for (name, value) in declarations.exports {
            self.export(name, value);
        }
        Ok(())
    }

    /// Exports a value, typically built from resource outputs.
    pub fn export(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.exports.insert(name.into(), value.into());
    }

    /// Token that cancels a running apply or destroy.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Declared resources.
    #[must_use]
    pub const fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    /// State store used by runs.
    #[must_use]
    pub const fn state_store(&self) -> &S {
        &self.state_store
    }

    /// Stack name.
    #[must_use]
    pub fn stack(&self) -> &str {
        &self.stack
    }

    /// Resolves the dependency order and checks kinds against providers.
    ///
    /// # Errors
    ///
    /// Returns a graph error for undeclared references, cycles or kinds no
    /// provider handles.
    pub fn validate(&self) -> Result<ResolvedOrder> {
        let order = DependencyResolver::resolve(&self.registry)?;
        for spec in self.registry.all() {
            self.dispatcher.check_kind(&spec.kind, &spec.name)?;
        }
        Ok(order)
    }

    /// Runs the stack in `mode`.
    ///
    /// Provider failures do not make the run fail; they are reported per
    /// resource with status [`RunStatus::PartialFailure`].
    ///
    /// # Errors
    ///
    /// Returns an error for invalid declarations (before any provider call),
    /// lock conflicts and state storage failures.
    pub async fn run(&self, mode: RunMode) -> Result<RunResult> {
        info!("Starting {mode} run for stack {}", self.stack);

        let order = match mode {
            RunMode::Destroy => None,
            RunMode::Plan | RunMode::Apply => Some(self.validate()?),
        };

        if mode == RunMode::Plan {
            let state = self.state_store.load().await?;
            let plan = self.build_plan(order.as_ref(), state.as_ref())?;
            return Ok(RunResult::planned(plan));
        }

        let lock = self.state_store.acquire_lock(&generate_holder_id()).await?;
        let result = self.run_locked(mode, order.as_ref()).await;
        if let Err(e) = self.state_store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock: {e}");
        }
        result
    }

    async fn run_locked(&self, mode: RunMode, order: Option<&ResolvedOrder>) -> Result<RunResult> {
        let mut state = self
            .state_store
            .load()
            .await?
            .unwrap_or_else(|| StackState::new(&self.stack));

        let plan = self.build_plan(order, Some(&state))?;
        let summary = plan.summary();
        info!(
            "Plan: {} to create, {} to update, {} to delete, {} unchanged",
            summary.creates, summary.updates, summary.deletes, summary.unchanged
        );

        let execution = PlanExecutor::new(Arc::clone(&self.dispatcher), &self.registry)
            .with_parallelism(self.parallelism)
            .with_cancellation(self.cancel.clone())
            .execute(&plan, &mut state)
            .await?;

        let exported_outputs = match mode {
            RunMode::Destroy => BTreeMap::new(),
            RunMode::Plan | RunMode::Apply => self.resolve_exports(&execution.graph),
        };
        state.exports.clone_from(&exported_outputs);

        let status = if execution.cancelled && execution.not_started > 0 {
            RunStatus::Aborted
        } else if execution.failed > 0 || execution.blocked > 0 {
            RunStatus::PartialFailure
        } else {
            RunStatus::Succeeded
        };

        let error = failure_summary(&execution, status);
        if let Some(error) = &error {
            error!("Run {status}: {error}");
        }
        let history_op = if mode == RunMode::Destroy {
            HistoryOperation::Destroy
        } else {
            HistoryOperation::Apply
        };
        let touched = execution
            .resources
            .iter()
            .filter(|(_, outcome)| outcome.operation != OperationType::NoOp)
            .map(|(name, _)| name.clone())
            .collect();
        state.add_history(RunHistoryEntry::new(history_op, &plan.config_hash, touched, error));
        state.last_updated = Utc::now();

        self.state_store.save(&state).await?;
        info!("Run finished: {status}");

        Ok(RunResult {
            mode,
            status,
            resources: execution.resources,
            exported_outputs,
            executed: execution.executed,
            plan,
        })
    }

    fn build_plan(&self, order: Option<&ResolvedOrder>, state: Option<&StackState>) -> Result<Plan> {
        let config_hash = self.hasher.hash_declarations(self.registry.all());
        match order {
            Some(order) => {
                let diff = DiffEngine::new().compute_diff(&self.registry, order, state);
                Ok(Plan::from_diff(&diff, order, state, &config_hash)?)
            }
            None => match state {
                Some(state) => Ok(Plan::destroy(state, &config_hash)?),
                None => Ok(Plan::empty(&config_hash)),
            },
        }
    }

    fn resolve_exports(&self, graph: &ValueGraph) -> BTreeMap<String, serde_json::Value> {
        self.exports
            .iter()
            .filter_map(|(name, value)| match graph.resolve_value(value) {
                Some(resolved) => Some((name.clone(), resolved)),
                None => {
                    warn!("Export {name} is unresolved; a resource it uses did not become ready");
                    None
                }
            })
            .collect()
    }
}

fn failure_summary(execution: &ExecutionResult, status: RunStatus) -> Option<String> {
    match status {
        RunStatus::Succeeded => None,
        RunStatus::Aborted => Some(format!(
            "cancelled with {} operation(s) not started",
            execution.not_started
        )),
        RunStatus::PartialFailure => {
            let failed: Vec<String> = execution
                .resources
                .iter()
                .filter(|(_, outcome)| outcome.status == ResourceStatus::Failed)
                .map(|(name, outcome)| {
                    format!("{name}: {}", outcome.error.as_deref().unwrap_or("unknown error"))
                })
                .collect();
            Some(format!(
                "{} failed, {} blocked ({})",
                execution.failed,
                execution.blocked,
                failed.join("; ")
            ))
        }
    }
}

impl<S: StateStore> std::fmt::Debug for Engine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("stack", &self.stack)
            .field("resources", &self.registry.len())
            .field("exports", &self.exports.len())
            .field("parallelism", &self.parallelism)
            .field("backend", &self.state_store.backend_type())
            .finish_non_exhaustive()
    }
}

impl RunResult {
    fn planned(plan: Plan) -> Self {
        let resources = plan
            .operations
            .iter()
            .map(|op| {
                (
                    op.resource_name.clone(),
                    ResourceOutcome {
                        status: ResourceStatus::Pending,
                        operation: op.operation,
                        error: None,
                    },
                )
            })
            .collect();

        Self {
            mode: RunMode::Plan,
            status: RunStatus::Succeeded,
            resources,
            exported_outputs: BTreeMap::new(),
            executed: Vec::new(),
            plan,
        }
    }

    /// Returns true if the run succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Names of resources with the given status.
    #[must_use]
    pub fn with_status(&self, status: ResourceStatus) -> Vec<&str> {
        self.resources
            .iter()
            .filter(|(_, outcome)| outcome.status == status)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Plan => "plan",
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::PartialFailure => "partial failure",
            Self::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GraphError, TerraceError};
    use crate::provider::{EchoProvider, ProviderRegistry};
    use crate::state::LocalStateStore;
    use tempfile::TempDir;

    fn engine(temp: &TempDir) -> Engine<LocalStateStore> {
        let providers = ProviderRegistry::new().with("test", Arc::new(EchoProvider::new()));
        Engine::new(
            "dev",
            ProviderDispatcher::new(providers),
            LocalStateStore::with_base_dir(temp.path(), "dev"),
        )
    }

    #[test]
    fn test_declare_rejects_cycle_and_duplicate() {
        let temp = TempDir::new().expect("temp dir");
        let mut engine = engine(&temp);

        engine
            .declare(ResourceSpec::new("test:x", "a").input("b", Value::reference("b", "id")))
            .unwrap();
        let err = engine
            .declare(ResourceSpec::new("test:x", "b").input("a", Value::reference("a", "id")))
            .unwrap_err();
        assert!(matches!(
            err,
            TerraceError::Graph(GraphError::CyclicDependency { .. })
        ));
        assert!(!engine.registry().contains("b"));

        let err = engine.declare(ResourceSpec::new("test:x", "a")).unwrap_err();
        assert!(matches!(err, TerraceError::Graph(GraphError::DuplicateName { .. })));
    }

    #[tokio::test]
    async fn test_unknown_kind_fails_before_any_call() {
        let temp = TempDir::new().expect("temp dir");
        let mut engine = engine(&temp);
        engine.declare(ResourceSpec::new("other:thing", "x")).unwrap();

        let err = engine.run(RunMode::Apply).await.unwrap_err();
        assert!(err.is_pre_execution());
        assert!(!engine.state_store().exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_apply_plan_destroy_cycle() {
        let temp = TempDir::new().expect("temp dir");
        let mut engine = engine(&temp);
        let net = engine
            .declare(ResourceSpec::new("test:net", "net1").input("cidr", "10.0.0.0/16"))
            .unwrap();
        engine
            .declare(ResourceSpec::new("test:vm", "vm1").input("net", &net))
            .unwrap();
        engine.export("net_id", &net);

        let planned = engine.run(RunMode::Plan).await.unwrap();
        assert_eq!(planned.plan.summary().creates, 2);
        assert!(planned.executed.is_empty());

        let applied = engine.run(RunMode::Apply).await.unwrap();
        assert!(applied.is_success());
        assert!(applied.exported_outputs.contains_key("net_id"));
        assert!(!engine.state_store().is_locked().await.unwrap());

        let destroyed = engine.run(RunMode::Destroy).await.unwrap();
        assert!(destroyed.is_success());
        let ops: Vec<&str> = destroyed.executed.iter().map(|e| e.resource.as_str()).collect();
        assert_eq!(ops, vec!["vm1", "net1"]);

        let state = engine.state_store().load().await.unwrap().unwrap();
        assert!(state.is_empty());
        assert_eq!(state.history.len(), 2);
    }
}
