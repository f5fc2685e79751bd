//! End-to-end engine runs against recording providers.

use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use terrace::config::ConfigParser;
use terrace::engine::{Engine, RunMode, RunStatus};
use terrace::error::{GraphError, ProviderError, TerraceError};
use terrace::graph::{DependencyResolver, Properties, ResourceRegistry, ResourceSpec, Value};
use terrace::planner::OperationType;
use terrace::provider::{
    Created, EchoProvider, Provider, ProviderDispatcher, ProviderRegistry, UpdateOutcome,
};
use terrace::state::{LocalStateStore, ResourceStatus, StateStore};

/// Provider that records every call as `op:kind` and can be told to fail.
#[derive(Default)]
struct RecordingProvider {
    calls: Mutex<Vec<String>>,
    inputs: Mutex<Vec<(String, Properties)>>,
    failing_kinds: BTreeSet<String>,
    force_new: BTreeSet<String>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    counter: AtomicUsize,
}

impl RecordingProvider {
    fn failing(kind: &str) -> Self {
        Self {
            failing_kinds: BTreeSet::from([kind.to_string()]),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn inputs_for(&self, kind: &str) -> Option<Properties> {
        self.inputs
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(k, _)| k == kind)
            .map(|(_, inputs)| inputs.clone())
    }

    async fn enter(&self, call: String) {
        self.calls.lock().unwrap().push(call);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Provider for RecordingProvider {
    async fn create(&self, kind: &str, inputs: &Properties) -> Result<Created, ProviderError> {
        self.enter(format!("create:{kind}")).await;
        self.inputs
            .lock()
            .unwrap()
            .push((kind.to_string(), inputs.clone()));
        if self.failing_kinds.contains(kind) {
            return Err(ProviderError::rejected(format!("quota exceeded for {kind}")));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let mut outputs = inputs.clone();
        outputs.insert(String::from("ip"), json!(format!("10.0.0.{n}")));
        Ok(Created {
            id: format!("{kind}-{n}"),
            outputs,
        })
    }

    async fn update(
        &self,
        kind: &str,
        _id: &str,
        old_inputs: &Properties,
        new_inputs: &Properties,
    ) -> Result<UpdateOutcome, ProviderError> {
        self.enter(format!("update:{kind}")).await;
        if self
            .force_new
            .iter()
            .any(|key| old_inputs.get(key) != new_inputs.get(key))
        {
            return Ok(UpdateOutcome::RequiresReplacement);
        }
        Ok(UpdateOutcome::Updated(new_inputs.clone()))
    }

    async fn delete(&self, kind: &str, _id: &str, _outputs: &Properties) -> Result<(), ProviderError> {
        self.enter(format!("delete:{kind}")).await;
        Ok(())
    }
}

fn engine_with(temp: &TempDir, provider: &Arc<RecordingProvider>) -> Engine<LocalStateStore> {
    let providers = ProviderRegistry::new().with("rec", Arc::clone(provider) as Arc<dyn Provider>);
    Engine::new(
        "scenario",
        ProviderDispatcher::new(providers),
        LocalStateStore::with_base_dir(temp.path(), "scenario"),
    )
}

fn position(calls: &[String], call: &str) -> usize {
    calls
        .iter()
        .position(|c| c == call)
        .unwrap_or_else(|| panic!("{call} not in {calls:?}"))
}

#[tokio::test]
async fn test_network_and_vm_reference_scenario() {
    let temp = TempDir::new().expect("temp dir");
    let provider = Arc::new(RecordingProvider::default());
    let mut engine = engine_with(&temp, &provider);

    let net = engine
        .declare(ResourceSpec::new("rec:network", "net1").input("cidr", "10.0.0.0/16"))
        .unwrap();
    let vm = engine
        .declare(
            ResourceSpec::new("rec:vm", "vm1")
                .input("size", "small")
                .input("networkId", net.id()),
        )
        .unwrap();
    engine.export("vmIp", vm.output("ip"));

    let result = engine.run(RunMode::Apply).await.unwrap();
    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(provider.calls(), vec!["create:rec:network", "create:rec:vm"]);

    let state = engine.state_store().load().await.unwrap().unwrap();
    let net_id = state.get_resource("net1").unwrap().external_id.clone().unwrap();
    let vm_inputs = provider.inputs_for("rec:vm").unwrap();
    assert_eq!(vm_inputs.get("networkId"), Some(&json!(net_id)));
    assert_eq!(result.exported_outputs.get("vmIp"), Some(&json!("10.0.0.1")));
    assert_eq!(state.exports, result.exported_outputs);
}

#[tokio::test]
async fn test_creates_follow_dependency_order() {
    let temp = TempDir::new().expect("temp dir");
    let provider = Arc::new(RecordingProvider::default());
    let mut engine = engine_with(&temp, &provider).with_parallelism(4);

    engine
        .declare(ResourceSpec::new("rec:d", "d").input("a", Value::reference("a", "id")))
        .unwrap();
    engine
        .declare(ResourceSpec::new("rec:c", "c").input("b", Value::reference("b", "ip")))
        .unwrap();
    engine
        .declare(ResourceSpec::new("rec:b", "b").input("a", Value::reference("a", "id")))
        .unwrap();
    engine.declare(ResourceSpec::new("rec:a", "a")).unwrap();
    engine
        .declare(ResourceSpec::new("rec:e", "e").depends_on("c").depends_on("d"))
        .unwrap();

    let order = engine.validate().unwrap();
    for (name, deps) in &order.dependencies {
        let at = order.order.iter().position(|n| n == name).unwrap();
        for dep in deps {
            assert!(order.order.iter().position(|n| n == dep).unwrap() < at);
        }
    }

    let result = engine.run(RunMode::Apply).await.unwrap();
    assert!(result.is_success());

    let calls = provider.calls();
    assert_eq!(calls.len(), 5);
    assert!(position(&calls, "create:rec:a") < position(&calls, "create:rec:b"));
    assert!(position(&calls, "create:rec:a") < position(&calls, "create:rec:d"));
    assert!(position(&calls, "create:rec:b") < position(&calls, "create:rec:c"));
    assert!(position(&calls, "create:rec:c") < position(&calls, "create:rec:e"));
    assert!(position(&calls, "create:rec:d") < position(&calls, "create:rec:e"));
}

#[test]
fn test_cycle_is_reported_with_its_path() {
    let mut registry = ResourceRegistry::new();
    registry
        .register(ResourceSpec::new("rec:x", "a").input("c", Value::reference("c", "id")))
        .unwrap();
    registry
        .register(ResourceSpec::new("rec:x", "b").input("a", Value::reference("a", "id")))
        .unwrap();
    registry
        .register(ResourceSpec::new("rec:x", "c").depends_on("b"))
        .unwrap();

    match DependencyResolver::resolve(&registry) {
        Err(GraphError::CyclicDependency { cycle }) => {
            for name in ["a", "b", "c"] {
                assert!(cycle.iter().any(|n| n == name), "{name} missing from {cycle:?}");
            }
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_graph_makes_no_provider_call() {
    let temp = TempDir::new().expect("temp dir");
    let provider = Arc::new(RecordingProvider::default());
    let mut engine = engine_with(&temp, &provider);

    engine.declare(ResourceSpec::new("rec:net", "net1")).unwrap();
    engine
        .declare(ResourceSpec::new("rec:vm", "vm1").input("subnet", Value::reference("subnet1", "id")))
        .unwrap();

    let err = engine.run(RunMode::Apply).await.unwrap_err();
    assert!(err.is_pre_execution());
    assert!(matches!(
        err,
        TerraceError::Graph(GraphError::UnknownReference { .. })
    ));
    assert!(provider.calls().is_empty());
    assert!(!engine.state_store().exists().await.unwrap());
}

#[tokio::test]
async fn test_second_apply_is_all_noop() {
    let temp = TempDir::new().expect("temp dir");
    let provider = Arc::new(RecordingProvider::default());
    let mut engine = engine_with(&temp, &provider);

    let net = engine
        .declare(ResourceSpec::new("rec:network", "net1").input("cidr", "10.0.0.0/16"))
        .unwrap();
    engine
        .declare(ResourceSpec::new("rec:vm", "vm1").input("networkIp", net.output("ip")))
        .unwrap();

    assert!(engine.run(RunMode::Apply).await.unwrap().is_success());
    let first_calls = provider.calls().len();

    let planned = engine.run(RunMode::Plan).await.unwrap();
    assert!(!planned.plan.has_changes());
    assert!(
        planned
            .plan
            .operations
            .iter()
            .all(|op| op.operation == OperationType::NoOp)
    );

    let second = engine.run(RunMode::Apply).await.unwrap();
    assert!(second.is_success());
    assert!(second.executed.is_empty());
    assert_eq!(provider.calls().len(), first_calls);
    assert_eq!(second.with_status(ResourceStatus::Ready).len(), 2);
}

#[tokio::test]
async fn test_failure_blocks_only_its_dependents() {
    let temp = TempDir::new().expect("temp dir");
    let provider = Arc::new(RecordingProvider::failing("rec:b"));
    let mut engine = engine_with(&temp, &provider);

    engine.declare(ResourceSpec::new("rec:a", "a")).unwrap();
    let b = engine.declare(ResourceSpec::new("rec:b", "b")).unwrap();
    engine
        .declare(ResourceSpec::new("rec:c", "c").input("b", b.id()))
        .unwrap();

    let result = engine.run(RunMode::Apply).await.unwrap();
    assert_eq!(result.status, RunStatus::PartialFailure);
    assert_eq!(result.with_status(ResourceStatus::Ready), vec!["a"]);
    assert_eq!(result.with_status(ResourceStatus::Failed), vec!["b"]);
    assert_eq!(result.with_status(ResourceStatus::Blocked), vec!["c"]);
    assert!(result.resources["b"].error.as_deref().unwrap().contains("quota"));
    assert!(!provider.calls().contains(&String::from("create:rec:c")));

    let state = engine.state_store().load().await.unwrap().unwrap();
    assert!(state.get_resource("a").unwrap().has_external_id());
    assert!(!state.get_resource("b").is_some_and(|r| r.has_external_id()));
    assert!(!engine.state_store().is_locked().await.unwrap());
}

#[tokio::test]
async fn test_replacement_deletes_before_create() {
    let temp = TempDir::new().expect("temp dir");
    let provider = Arc::new(RecordingProvider {
        force_new: BTreeSet::from([String::from("size")]),
        ..RecordingProvider::default()
    });

    let mut engine = engine_with(&temp, &provider);
    engine
        .declare(ResourceSpec::new("rec:vm", "vm1").input("size", "small"))
        .unwrap();
    assert!(engine.run(RunMode::Apply).await.unwrap().is_success());
    let old_id = engine.state_store().load().await.unwrap().unwrap().resources["vm1"]
        .external_id
        .clone();

    let mut engine = engine_with(&temp, &provider);
    engine
        .declare(ResourceSpec::new("rec:vm", "vm1").input("size", "large"))
        .unwrap();
    let result = engine.run(RunMode::Apply).await.unwrap();
    assert!(result.is_success());

    let calls = provider.calls();
    assert_eq!(
        calls,
        vec!["create:rec:vm", "update:rec:vm", "delete:rec:vm", "create:rec:vm"]
    );

    let state = engine.state_store().load().await.unwrap().unwrap();
    let vm = &state.resources["vm1"];
    assert_ne!(vm.external_id, old_id);
    assert_eq!(vm.inputs.get("size"), Some(&json!("large")));
}

#[tokio::test]
async fn test_parallelism_bounds_in_flight_calls() {
    let temp = TempDir::new().expect("temp dir");
    let provider = Arc::new(RecordingProvider {
        delay: Duration::from_millis(50),
        ..RecordingProvider::default()
    });
    let mut engine = engine_with(&temp, &provider).with_parallelism(2);

    for name in ["x", "y", "z"] {
        engine.declare(ResourceSpec::new("rec:x", name)).unwrap();
    }

    let result = engine.run(RunMode::Apply).await.unwrap();
    assert!(result.is_success());
    assert_eq!(provider.calls().len(), 3);
    assert_eq!(provider.max_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_cancel_mid_run_keeps_in_flight_result() {
    let temp = TempDir::new().expect("temp dir");
    let provider = Arc::new(RecordingProvider {
        delay: Duration::from_millis(200),
        ..RecordingProvider::default()
    });
    let mut engine = engine_with(&temp, &provider).with_parallelism(1);

    for name in ["x", "y", "z"] {
        engine.declare(ResourceSpec::new("rec:x", name)).unwrap();
    }

    let token = engine.cancellation_token();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    let result = engine.run(RunMode::Apply).await.unwrap();
    canceller.await.unwrap();

    assert_eq!(result.status, RunStatus::Aborted);
    assert_eq!(result.with_status(ResourceStatus::Ready), vec!["x"]);
    assert_eq!(result.with_status(ResourceStatus::Pending), vec!["y", "z"]);
    assert_eq!(provider.calls(), vec!["create:rec:x"]);

    let state = engine.state_store().load().await.unwrap().unwrap();
    assert!(state.get_resource("x").unwrap().has_external_id());
    assert!(state.get_resource("y").is_none());
    assert!(state.get_resource("z").is_none());
    assert!(!engine.state_store().is_locked().await.unwrap());
}

#[tokio::test]
async fn test_removed_resource_is_deleted() {
    let temp = TempDir::new().expect("temp dir");
    let provider = Arc::new(RecordingProvider::default());

    let mut engine = engine_with(&temp, &provider);
    engine.declare(ResourceSpec::new("rec:keep", "keep")).unwrap();
    engine.declare(ResourceSpec::new("rec:drop", "drop")).unwrap();
    assert!(engine.run(RunMode::Apply).await.unwrap().is_success());

    let mut engine = engine_with(&temp, &provider);
    engine.declare(ResourceSpec::new("rec:keep", "keep")).unwrap();

    let planned = engine.run(RunMode::Plan).await.unwrap();
    let summary = planned.plan.summary();
    assert_eq!((summary.deletes, summary.unchanged), (1, 1));

    let result = engine.run(RunMode::Apply).await.unwrap();
    assert!(result.is_success());
    assert_eq!(provider.calls().last().map(String::as_str), Some("delete:rec:drop"));

    let state = engine.state_store().load().await.unwrap().unwrap();
    assert!(state.get_resource("drop").is_none());
    assert!(state.get_resource("keep").is_some());
}

#[tokio::test]
async fn test_template_stack_applies_with_echo_providers() {
    let temp = TempDir::new().expect("temp dir");
    let config = ConfigParser::new()
        .parse_yaml(include_str!("../templates/terrace.yaml"), None)
        .unwrap();
    let declarations = ConfigParser::declarations(&config).unwrap();

    let providers = ProviderRegistry::new()
        .with(
            "azure",
            Arc::new(EchoProvider::new().with_force_new(["location", "vmSize"])),
        )
        .with("talos", Arc::new(EchoProvider::new()));
    let mut engine = Engine::new(
        &config.stack.name,
        ProviderDispatcher::new(providers),
        LocalStateStore::with_base_dir(temp.path(), &config.stack.name),
    )
    .with_parallelism(config.settings.parallelism);
    engine.declare_all(declarations).unwrap();

    let result = engine.run(RunMode::Apply).await.unwrap();
    assert!(result.is_success());
    assert_eq!(result.with_status(ResourceStatus::Ready).len(), config.resources.len());
    assert_eq!(
        result.exported_outputs.get("kubeEndpoint"),
        Some(&json!("https://20.0.0.10:6443"))
    );

    let executed: Vec<&str> = result.executed.iter().map(|e| e.resource.as_str()).collect();
    let at = |name: &str| executed.iter().position(|n| *n == name).unwrap();
    assert!(at("talos-rg") < at("talos-vnet"));
    assert!(at("ni-nsg-01") < at("talos-cp-01"));
    assert!(at("talos-cp-01") < at("bootstrap"));
    assert!(at("talos-wkr-machine-cfg") < at("talos-wkr-03"));

    let state = engine.state_store().load().await.unwrap().unwrap();
    let client_cfg = state.resources["talos-client-cfg"].external_id.clone().unwrap();
    assert_eq!(result.exported_outputs.get("talosctlCfg"), Some(&json!(client_cfg)));
    assert_eq!(
        state.resources["talos-client-cfg"].inputs.get("endpoints"),
        Some(&json!(["20.0.1.11", "20.0.1.12", "20.0.1.13"]))
    );

    let worker_cfg = state.resources["talos-wkr-machine-cfg"].external_id.clone().unwrap();
    assert_eq!(
        state.resources["talos-wkr-02"].inputs["osProfile"]["customData"],
        json!(worker_cfg)
    );
}
