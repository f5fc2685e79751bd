//! Plan executor.
//!
//! Walks the operation DAG of a [`Plan`]. Every operation whose dependencies
//! completed is spawned as one task on a [`JoinSet`], with at most
//! `parallelism` tasks in flight. The executor loop is the only writer of the
//! value graph and the state table: tasks call providers and hand their
//! results back, the loop records them and releases dependents.
//!
//! A failed operation marks its transitive dependents `Blocked`; they are
//! never started and their state is left untouched. Cancellation stops new
//! tasks from starting and waits for the in-flight ones, whose results are
//! still recorded.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DEFAULT_PARALLELISM, InputsHasher};
use crate::error::{ProviderError, Result, RunError};
use crate::graph::{Properties, ResourceRegistry, ValueGraph};
use crate::provider::{DispatchOutcome, DispatchRequest, ProviderDispatcher};
use crate::state::{ResourceState, ResourceStatus, StackState};

use super::plan::{OperationType, Plan, PlannedOperation};

/// Executor for run plans.
pub struct PlanExecutor<'a> {
    /// Dispatcher shared with the spawned tasks.
    dispatcher: Arc<ProviderDispatcher>,
    /// Declared resources.
    registry: &'a ResourceRegistry,
    /// Maximum number of concurrent provider operations.
    parallelism: usize,
    /// Stops new operations from starting.
    cancel: CancellationToken,
    /// Inputs hasher.
    hasher: InputsHasher,
}

/// Final status of one resource after a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceOutcome {
    /// Resource status.
    pub status: ResourceStatus,
    /// Operation that was carried out (updates may turn into no-ops).
    pub operation: OperationType,
    /// Error message if the resource failed or was blocked.
    pub error: Option<String>,
}

/// One provider call made during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedOperation {
    /// Resource name.
    pub resource: String,
    /// Provider operation.
    pub operation: OperationType,
    /// Whether the call succeeded.
    pub success: bool,
    /// Error message (if failed).
    pub error: Option<String>,
    /// Call duration in milliseconds.
    pub duration_ms: u64,
}

/// Result of executing a plan.
#[derive(Debug)]
pub struct ExecutionResult {
    /// Outcome of every planned resource.
    pub resources: BTreeMap<String, ResourceOutcome>,
    /// Provider calls in completion order.
    pub executed: Vec<ExecutedOperation>,
    /// Resources that ended ready or deleted.
    pub successful: usize,
    /// Resources that failed.
    pub failed: usize,
    /// Resources blocked by a failed dependency.
    pub blocked: usize,
    /// Resources not started because the run was cancelled.
    pub not_started: usize,
    /// Whether cancellation was requested during the run.
    pub cancelled: bool,
    /// Value graph with every output resolved during the run.
    pub graph: ValueGraph,
}

/// Work handed to a spawned task.
struct Task {
    index: usize,
    name: String,
    kind: String,
    action: TaskAction,
}

enum TaskAction {
    Create {
        inputs: Properties,
    },
    Update {
        id: String,
        old_kind: String,
        old_inputs: Properties,
        old_outputs: Properties,
        new_inputs: Properties,
        replace: bool,
    },
    Delete {
        id: String,
        outputs: Properties,
    },
}

enum Applied {
    Resource { id: String, outputs: Properties },
    Deleted,
}

/// What a task sends back to the executor loop.
struct TaskReport {
    index: usize,
    steps: Vec<ExecutedOperation>,
    result: std::result::Result<Applied, ProviderError>,
    /// The old object was deleted during a replacement.
    removed: bool,
}

/// How an operation is carried out once its dependencies are done.
enum Prepared {
    Spawn(Task, Option<(Properties, String)>),
    /// Recorded outputs are reused without a provider call.
    Reuse(Properties),
    /// Nothing exists remotely; only the state entry goes.
    Forget,
    Fail(String),
}

/// Dependency bookkeeping over the plan's operations.
struct Schedule<'p> {
    operations: &'p [PlannedOperation],
    remaining: Vec<usize>,
    dependents: Vec<Vec<usize>>,
    ready: VecDeque<usize>,
    outcomes: BTreeMap<String, ResourceOutcome>,
}

impl<'p> Schedule<'p> {
    fn new(plan: &'p Plan) -> Self {
        let operations = plan.operations.as_slice();
        let remaining: Vec<usize> = operations.iter().map(|op| op.dependencies.len()).collect();
        let mut dependents = vec![Vec::new(); operations.len()];
        for (i, op) in operations.iter().enumerate() {
            for &dep in &op.dependencies {
                if let Some(list) = dependents.get_mut(dep) {
                    list.push(i);
                }
            }
        }
        let ready = (0..operations.len()).filter(|&i| remaining[i] == 0).collect();
        let outcomes = operations
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
            operations,
            remaining,
            dependents,
            ready,
            outcomes,
        }
    }

    fn outcome_mut(&mut self, index: usize) -> Option<&mut ResourceOutcome> {
        self.outcomes.get_mut(&self.operations[index].resource_name)
    }

    fn start(&mut self, index: usize) {
        let status = match self.operations[index].operation {
            OperationType::Create => ResourceStatus::Creating,
            OperationType::Update => ResourceStatus::Updating,
            OperationType::Delete => ResourceStatus::Deleting,
            OperationType::NoOp => ResourceStatus::Pending,
        };
        if let Some(outcome) = self.outcome_mut(index) {
            outcome.status = status;
        }
    }

    /// Marks an operation done and releases the dependents it was holding.
    fn succeed(&mut self, index: usize, status: ResourceStatus, operation: OperationType) {
        if let Some(outcome) = self.outcome_mut(index) {
            outcome.status = status;
            outcome.operation = operation;
            outcome.error = None;
        }
        for i in self.dependents[index].clone() {
            self.remaining[i] -= 1;
            if self.remaining[i] == 0 {
                self.ready.push_back(i);
            }
        }
    }

    /// Marks an operation failed and blocks everything downstream of it.
    fn fail(&mut self, index: usize, message: &str) {
        if let Some(outcome) = self.outcome_mut(index) {
            outcome.status = ResourceStatus::Failed;
            outcome.error = Some(message.to_string());
        }

        let failed = &self.operations[index].resource_name;
        let mut queue: VecDeque<usize> = self.dependents[index].iter().copied().collect();
        while let Some(i) = queue.pop_front() {
            let name = &self.operations[i].resource_name;
            let Some(outcome) = self.outcomes.get_mut(name) else {
                continue;
            };
            if outcome.status == ResourceStatus::Blocked {
                continue;
            }
            warn!("Blocking {name}: dependency {failed} failed");
            outcome.status = ResourceStatus::Blocked;
            outcome.error = Some(format!("blocked by failed dependency '{failed}'"));
            queue.extend(self.dependents[i].iter().copied());
        }
    }
}

impl<'a> PlanExecutor<'a> {
    /// Creates a new plan executor.
    #[must_use]
    pub fn new(dispatcher: Arc<ProviderDispatcher>, registry: &'a ResourceRegistry) -> Self {
        Self {
            dispatcher,
            registry,
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

    /// Sets the cancellation token observed between operations.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Executes a plan, recording every result in `state`.
    ///
    /// Provider failures do not make this fail; they are reported per
    /// resource in the returned [`ExecutionResult`].
    ///
    /// # Errors
    ///
    /// Returns an error if the declared resources do not form a valid graph.
    pub async fn execute(&self, plan: &Plan, state: &mut StackState) -> Result<ExecutionResult> {
        info!(
            "Executing plan with {} operations (parallelism {})",
            plan.operations.len(),
            self.parallelism
        );

        let mut graph = ValueGraph::from_specs(self.registry.all())?;
        let mut schedule = Schedule::new(plan);
        let mut executed = Vec::new();
        let mut applied_inputs: HashMap<usize, (Properties, String)> = HashMap::new();
        let mut in_flight: JoinSet<TaskReport> = JoinSet::new();
        let mut task_index: HashMap<tokio::task::Id, usize> = HashMap::new();
        let mut cancelled = false;

        loop {
            if !cancelled && self.cancel.is_cancelled() {
                warn!("Cancellation requested; no new operations will start");
                cancelled = true;
            }

            while !cancelled && in_flight.len() < self.parallelism {
                let Some(index) = schedule.ready.pop_front() else {
                    break;
                };
                let op = &plan.operations[index];

                match self.prepare(index, op, state, &graph) {
                    Prepared::Spawn(task, inputs) => {
                        info!("{}", op.description());
                        if let Some(inputs) = inputs {
                            applied_inputs.insert(index, inputs);
                        }
                        schedule.start(index);
                        let handle = in_flight.spawn(run_task(Arc::clone(&self.dispatcher), task));
                        task_index.insert(handle.id(), index);
                    }
                    Prepared::Reuse(outputs) => {
                        debug!("No change for {}", op.resource_name);
                        record_outputs(&mut graph, &op.resource_name, outputs)?;
                        schedule.succeed(index, ResourceStatus::Ready, OperationType::NoOp);
                    }
                    Prepared::Forget => {
                        debug!("{} has no remote object; dropping it from state", op.resource_name);
                        state.remove_resource(&op.resource_name);
                        schedule.succeed(index, ResourceStatus::Deleted, OperationType::Delete);
                    }
                    Prepared::Fail(message) => {
                        error!("Cannot {} {}: {message}", op.operation, op.resource_name);
                        self.record_failure(state, op, &message, false);
                        schedule.fail(index, &message);
                    }
                }
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                () = self.cancel.cancelled(), if !cancelled => {
                    warn!(
                        "Cancellation requested; waiting for {} in-flight operation(s)",
                        in_flight.len()
                    );
                    cancelled = true;
                }
                joined = in_flight.join_next_with_id() => match joined {
                    Some(Ok((id, report))) => {
                        task_index.remove(&id);
                        let inputs = applied_inputs.remove(&report.index);
                        executed.extend(report.steps.iter().cloned());
                        self.complete(report, inputs, plan, state, &mut graph, &mut schedule)?;
                    }
                    Some(Err(join_error)) => {
                        if let Some(index) = task_index.remove(&join_error.id()) {
                            let op = &plan.operations[index];
                            let message = RunError::TaskFailed {
                                resource: op.resource_name.clone(),
                                message: join_error.to_string(),
                            }
                            .to_string();
                            error!("{message}");
                            self.record_failure(state, op, &message, false);
                            schedule.fail(index, &message);
                        }
                    }
                    None => break,
                },
            }
        }

        let resources = schedule.outcomes;
        let count = |status: &[ResourceStatus]| {
            resources
                .values()
                .filter(|outcome| status.contains(&outcome.status))
                .count()
        };
        let successful = count(&[ResourceStatus::Ready, ResourceStatus::Deleted]);
        let failed = count(&[ResourceStatus::Failed]);
        let blocked = count(&[ResourceStatus::Blocked]);
        let not_started = count(&[ResourceStatus::Pending]);

        info!(
            "Execution finished: {successful} succeeded, {failed} failed, {blocked} blocked, {not_started} not started"
        );

        Ok(ExecutionResult {
            resources,
            executed,
            successful,
            failed,
            blocked,
            not_started,
            cancelled,
            graph,
        })
    }

    /// Decides how a ready operation is carried out.
    fn prepare(
        &self,
        index: usize,
        op: &PlannedOperation,
        state: &StackState,
        graph: &ValueGraph,
    ) -> Prepared {
        let name = &op.resource_name;
        let prior = state.get_resource(name);

        match op.operation {
            OperationType::NoOp => prior.map_or_else(
                || Prepared::Fail(String::from("no recorded state for unchanged resource")),
                |prior| Prepared::Reuse(prior.outputs.clone()),
            ),
            OperationType::Delete => match prior {
                Some(prior) => match &prior.external_id {
                    Some(id) => Prepared::Spawn(
                        Task {
                            index,
                            name: name.clone(),
                            kind: prior.kind.clone(),
                            action: TaskAction::Delete {
                                id: id.clone(),
                                outputs: prior.outputs.clone(),
                            },
                        },
                        None,
                    ),
                    None => Prepared::Forget,
                },
                None => Prepared::Forget,
            },
            OperationType::Create | OperationType::Update => {
                let Some(spec) = self.registry.get(name) else {
                    return Prepared::Fail(String::from("resource is not declared"));
                };
                let Some(inputs) = graph.resolve_inputs(spec) else {
                    return Prepared::Fail(String::from("inputs could not be resolved"));
                };
                let hash = self.hasher.hash_inputs(&spec.kind, &inputs);

                let action = match prior {
                    Some(prior) if op.operation == OperationType::Update => {
                        let Some(id) = prior.external_id.clone() else {
                            return Prepared::Spawn(
                                create_task(index, name, &spec.kind, inputs.clone()),
                                Some((inputs, hash)),
                            );
                        };
                        if !op.replace
                            && prior.status == ResourceStatus::Ready
                            && InputsHasher::hashes_match(&hash, &prior.inputs_hash)
                        {
                            return Prepared::Reuse(prior.outputs.clone());
                        }
                        TaskAction::Update {
                            id,
                            old_kind: prior.kind.clone(),
                            old_inputs: prior.inputs.clone(),
                            old_outputs: prior.outputs.clone(),
                            new_inputs: inputs.clone(),
                            replace: op.replace,
                        }
                    }
                    _ => TaskAction::Create {
                        inputs: inputs.clone(),
                    },
                };

                Prepared::Spawn(
                    Task {
                        index,
                        name: name.clone(),
                        kind: spec.kind.clone(),
                        action,
                    },
                    Some((inputs, hash)),
                )
            }
        }
    }

    /// Records a finished task in state and the value graph.
    fn complete(
        &self,
        report: TaskReport,
        inputs: Option<(Properties, String)>,
        plan: &Plan,
        state: &mut StackState,
        graph: &mut ValueGraph,
        schedule: &mut Schedule<'_>,
    ) -> Result<()> {
        let index = report.index;
        let op = &plan.operations[index];
        let name = &op.resource_name;

        match report.result {
            Ok(Applied::Resource { id, outputs }) => {
                let (inputs, hash) = inputs.unwrap_or_default();
                let replaced = report.removed;
                let mut entry = state
                    .remove_resource(name)
                    .filter(|_| !replaced)
                    .unwrap_or_else(|| ResourceState::new(name, &op.kind));
                entry.kind.clone_from(&op.kind);
                entry.dependencies = self
                    .registry
                    .get(name)
                    .map(crate::graph::ResourceSpec::dependencies)
                    .unwrap_or_default();
                entry.record_applied(id, inputs, hash, outputs.clone());
                state.set_resource(entry);

                info!("{name} is ready");
                record_outputs(graph, name, outputs)?;
                schedule.succeed(index, ResourceStatus::Ready, op.operation);
            }
            Ok(Applied::Deleted) => {
                state.remove_resource(name);
                info!("{name} deleted");
                schedule.succeed(index, ResourceStatus::Deleted, OperationType::Delete);
            }
            Err(e) => {
                let message = e.to_string();
                error!("Failed to {} {name}: {message}", op.operation);
                self.record_failure(state, op, &message, report.removed);
                schedule.fail(index, &message);
            }
        }
        Ok(())
    }

    /// Records a failed operation against the resource's state entry.
    fn record_failure(&self, state: &mut StackState, op: &PlannedOperation, message: &str, removed: bool) {
        let name = &op.resource_name;

        if op.operation == OperationType::Delete {
            if let Some(entry) = state.get_resource_mut(name) {
                entry.record_failure(message);
            }
            return;
        }

        let mut entry = state
            .remove_resource(name)
            .unwrap_or_else(|| ResourceState::new(name, &op.kind));
        if removed {
            entry.external_id = None;
            entry.outputs.clear();
        }
        if !entry.has_external_id() {
            entry.kind.clone_from(&op.kind);
            entry.dependencies = self
                .registry
                .get(name)
                .map(crate::graph::ResourceSpec::dependencies)
                .unwrap_or_default();
        }
        entry.record_failure(message);
        state.set_resource(entry);
    }
}

impl std::fmt::Debug for PlanExecutor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("resources", &self.registry.len())
            .field("parallelism", &self.parallelism)
            .finish_non_exhaustive()
    }
}

impl ExecutionResult {
    /// Returns true if every planned operation completed.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.failed == 0 && self.blocked == 0 && self.not_started == 0
    }
}

fn record_outputs(graph: &mut ValueGraph, name: &str, outputs: Properties) -> Result<()> {
    let eligible = graph.resolve(name, outputs)?;
    if !eligible.is_empty() {
        debug!("Outputs of {name} complete the inputs of {}", eligible.join(", "));
    }
    Ok(())
}

fn create_task(index: usize, name: &str, kind: &str, inputs: Properties) -> Task {
    Task {
        index,
        name: name.to_string(),
        kind: kind.to_string(),
        action: TaskAction::Create { inputs },
    }
}

/// Provider calls of one task, logged as they are made.
struct Steps {
    resource: String,
    executed: Vec<ExecutedOperation>,
}

impl Steps {
    async fn call(
        &mut self,
        dispatcher: &ProviderDispatcher,
        operation: OperationType,
        request: DispatchRequest,
    ) -> std::result::Result<DispatchOutcome, ProviderError> {
        let started = Instant::now();
        let result = dispatcher.apply(request).await;
        if !matches!(result, Ok(DispatchOutcome::RequiresReplacement)) {
            self.executed.push(ExecutedOperation {
                resource: self.resource.clone(),
                operation,
                success: result.is_ok(),
                error: result.as_ref().err().map(ToString::to_string),
                duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            });
        }
        result
    }

    async fn create(
        &mut self,
        dispatcher: &ProviderDispatcher,
        kind: String,
        inputs: Properties,
    ) -> std::result::Result<Applied, ProviderError> {
        match self
            .call(dispatcher, OperationType::Create, DispatchRequest::Create { kind, inputs })
            .await?
        {
            DispatchOutcome::Created { id, outputs } => Ok(Applied::Resource { id, outputs }),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(outcome: &DispatchOutcome) -> ProviderError {
    ProviderError::new(
        crate::error::ProviderErrorKind::Unknown,
        format!("unexpected provider outcome {outcome:?}"),
    )
}

async fn run_task(dispatcher: Arc<ProviderDispatcher>, task: Task) -> TaskReport {
    let Task {
        index,
        name,
        kind,
        action,
    } = task;
    let mut steps = Steps {
        resource: name,
        executed: Vec::new(),
    };
    let mut removed = false;

    let result = match action {
        TaskAction::Create { inputs } => steps.create(&dispatcher, kind, inputs).await,
        TaskAction::Delete { id, outputs } => steps
            .call(
                &dispatcher,
                OperationType::Delete,
                DispatchRequest::Delete { kind, id, outputs },
            )
            .await
            .map(|_| Applied::Deleted),
        TaskAction::Update {
            id,
            old_kind,
            old_inputs,
            old_outputs,
            new_inputs,
            replace,
        } => {
            let in_place = if replace {
                Ok(DispatchOutcome::RequiresReplacement)
            } else {
                steps
                    .call(
                        &dispatcher,
                        OperationType::Update,
                        DispatchRequest::Update {
                            kind: kind.clone(),
                            id: id.clone(),
                            old_inputs,
                            new_inputs: new_inputs.clone(),
                        },
                    )
                    .await
            };

            match in_place {
                Ok(DispatchOutcome::Updated { outputs }) => Ok(Applied::Resource { id, outputs }),
                Ok(DispatchOutcome::RequiresReplacement) => {
                    debug!("Replacing {}: deleting {id} first", steps.resource);
                    match steps
                        .call(
                            &dispatcher,
                            OperationType::Delete,
                            DispatchRequest::Delete {
                                kind: old_kind,
                                id,
                                outputs: old_outputs,
                            },
                        )
                        .await
                    {
                        Ok(_) => {
                            removed = true;
                            steps.create(&dispatcher, kind, new_inputs).await
                        }
                        Err(e) => Err(e),
                    }
                }
                Ok(other) => Err(unexpected(&other)),
                Err(e) => Err(e),
            }
        }
    };

    TaskReport {
        index,
        steps: steps.executed,
        result,
        removed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DependencyResolver, ResourceSpec, Value};
    use crate::planner::DiffEngine;
    use crate::provider::{EchoProvider, MockProvider, ProviderRegistry, UpdateOutcome};
    use serde_json::json;

    fn registry(specs: Vec<ResourceSpec>) -> ResourceRegistry {
        let mut registry = ResourceRegistry::new();
        for spec in specs {
            registry.register(spec).unwrap();
        }
        registry
    }

    fn plan(registry: &ResourceRegistry, state: &StackState) -> Plan {
        let order = DependencyResolver::resolve(registry).unwrap();
        let diff = DiffEngine::new().compute_diff(registry, &order, Some(state));
        Plan::from_diff(&diff, &order, Some(state), "hash").unwrap()
    }

    fn dispatcher(provider: impl crate::provider::Provider + 'static) -> Arc<ProviderDispatcher> {
        Arc::new(ProviderDispatcher::new(
            ProviderRegistry::new().with("test", Arc::new(provider)),
        ))
    }

    #[tokio::test]
    async fn test_outputs_flow_to_dependents() {
        let registry = registry(vec![
            ResourceSpec::new("test:net", "net1").input("cidr", "10.0.0.0/16"),
            ResourceSpec::new("test:vm", "vm1").input("subnet", Value::reference("net1", "id")),
        ]);
        let mut state = StackState::new("dev");
        let plan = plan(&registry, &state);

        let executor = PlanExecutor::new(dispatcher(EchoProvider::new()), &registry);
        let result = executor.execute(&plan, &mut state).await.unwrap();

        assert!(result.success());
        let net_id = state.get_resource("net1").unwrap().external_id.clone().unwrap();
        assert_eq!(state.get_resource("vm1").unwrap().inputs["subnet"], json!(net_id));
        assert!(state.get_resource("vm1").unwrap().dependencies.contains("net1"));
        assert_eq!(result.executed.len(), 2);
    }

    #[tokio::test]
    async fn test_failure_blocks_dependents() {
        let mut mock = MockProvider::new();
        mock.expect_create().returning(|kind, _| {
            if kind == "test:b" {
                Err(ProviderError::rejected("quota exceeded"))
            } else {
                Ok(crate::provider::Created {
                    id: format!("{kind}-1"),
                    outputs: Properties::new(),
                })
            }
        });

        let registry = registry(vec![
            ResourceSpec::new("test:a", "a"),
            ResourceSpec::new("test:b", "b"),
            ResourceSpec::new("test:c", "c").input("b", Value::reference("b", "id")),
            ResourceSpec::new("test:d", "d").depends_on("c"),
        ]);
        let mut state = StackState::new("dev");
        let plan = plan(&registry, &state);

        let result = PlanExecutor::new(dispatcher(mock), &registry)
            .execute(&plan, &mut state)
            .await
            .unwrap();

        assert_eq!(result.resources["a"].status, ResourceStatus::Ready);
        assert_eq!(result.resources["b"].status, ResourceStatus::Failed);
        assert_eq!(result.resources["c"].status, ResourceStatus::Blocked);
        assert_eq!(result.resources["d"].status, ResourceStatus::Blocked);
        assert_eq!(result.blocked, 2);
        assert!(!result.success());

        let b = state.get_resource("b").unwrap();
        assert_eq!(b.status, ResourceStatus::Failed);
        assert!(!b.has_external_id());
        assert!(state.get_resource("c").is_none());
    }

    #[tokio::test]
    async fn test_replacement_deletes_before_create() {
        let mut state = StackState::new("dev");
        let registry = registry(vec![
            ResourceSpec::new("test:disk", "disk1").input("size", 20_i64),
        ]);
        let plan0 = plan(&registry, &state);
        let echo = EchoProvider::new().with_force_new(["size"]);
        PlanExecutor::new(dispatcher(echo.clone()), &registry)
            .execute(&plan0, &mut state)
            .await
            .unwrap();
        let old_id = state.get_resource("disk1").unwrap().external_id.clone();

        let registry = self::registry(vec![
            ResourceSpec::new("test:disk", "disk1").input("size", 40_i64),
        ]);
        let plan1 = plan(&registry, &state);
        let result = PlanExecutor::new(dispatcher(echo), &registry)
            .execute(&plan1, &mut state)
            .await
            .unwrap();

        let ops: Vec<OperationType> = result.executed.iter().map(|e| e.operation).collect();
        assert_eq!(ops, vec![OperationType::Delete, OperationType::Create]);
        assert_ne!(state.get_resource("disk1").unwrap().external_id, old_id);
        assert_eq!(result.resources["disk1"].status, ResourceStatus::Ready);
    }

    #[tokio::test]
    async fn test_failed_replacement_clears_external_id() {
        let mut mock = MockProvider::new();
        mock.expect_update()
            .returning(|_, _, _, _| Ok(UpdateOutcome::RequiresReplacement));
        mock.expect_delete().returning(|_, _, _| Ok(()));
        mock.expect_create()
            .returning(|_, _| Err(ProviderError::transient("service unavailable")));

        let mut state = StackState::new("dev");
        let mut prior = ResourceState::new("disk1", "test:disk");
        prior.record_applied(
            String::from("disk-old"),
            Properties::new(),
            String::from("stale"),
            Properties::new(),
        );
        state.set_resource(prior);

        let registry = registry(vec![ResourceSpec::new("test:disk", "disk1").input("size", 40_i64)]);
        let plan = plan(&registry, &state);
        let result = PlanExecutor::new(dispatcher(mock), &registry)
            .execute(&plan, &mut state)
            .await
            .unwrap();

        assert_eq!(result.failed, 1);
        let disk = state.get_resource("disk1").unwrap();
        assert_eq!(disk.status, ResourceStatus::Failed);
        assert!(!disk.has_external_id());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let registry = registry(vec![ResourceSpec::new("test:net", "net1")]);
        let mut state = StackState::new("dev");
        let plan = plan(&registry, &state);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = PlanExecutor::new(dispatcher(EchoProvider::new()), &registry)
            .with_cancellation(cancel)
            .execute(&plan, &mut state)
            .await
            .unwrap();

        assert!(result.cancelled);
        assert_eq!(result.not_started, 1);
        assert!(result.executed.is_empty());
        assert!(state.is_empty());
    }
}
