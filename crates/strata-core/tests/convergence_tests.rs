use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use strata_core::error::{ErrorClass, StateError, StrataError};
use strata_core::journal::verify_chain;
use strata_core::prelude::*;
use strata_core::provider::ProviderRegistry;
use strata_core::simulator::SimulatedCloud;
use strata_core::state::LeaseTable;
use strata_core::types::{Fingerprint, RunId, ValueMap};
use strata_test_utils::{
    chain, data_chain, fast_policy, key, manifest, network_cluster_gateway, Harness,
};

fn actions(plan: &strata_core::ConvergencePlan) -> Vec<(String, Action)> {
    plan.actions()
        .into_iter()
        .map(|(k, a)| (k.to_string(), a))
        .collect()
}

#[tokio::test]
async fn test_network_cluster_gateway_scenario() {
    let h = Harness::new(network_cluster_gateway());

    let plan = h.engine.preview().await.unwrap();
    assert_eq!(
        actions(&plan),
        vec![
            ("network/vpc".to_string(), Action::Create),
            ("cluster/main".to_string(), Action::Create),
            ("gateway/kong".to_string(), Action::Create),
        ]
    );
    assert!(h.cloud.calls().iter().all(|c| !matches!(c, strata_core::simulator::SimCall::Apply(..))));

    let report = h.engine.apply(CancellationToken::new()).await.unwrap();
    assert!(report.success(), "{}", report.generate_text());
    assert_eq!(report.count(Lifecycle::Settled), 3);

    // Cluster received the network's real outputs.
    let vpc = NodeKey::new(ResourceKind::Network, "vpc");
    let cluster = NodeKey::new(ResourceKind::Cluster, "main");
    let vpc_id = h.cloud.outputs(&vpc).unwrap()["vpc_id"].clone();
    assert_eq!(h.cloud.inputs(&cluster).unwrap()["vpc_id"], vpc_id);

    let again = h.engine.apply(CancellationToken::new()).await.unwrap();
    assert!(again.success());
    assert!(again
        .outcomes
        .iter()
        .all(|o| o.action == Some(Action::NoOp)));
    assert_eq!(h.cloud.apply_count(&cluster), 1);
}

#[tokio::test]
async fn test_dependencies_settle_before_dependents_run() {
    // diamond: top <- left, right <- bottom, plus a data chain
    let mut descriptors = vec![
        manifest("top").build().unwrap(),
        manifest("left").depends_on(key("top")).build().unwrap(),
        manifest("right")
            .input_ref("top_uid", key("top").output("uid"))
            .build()
            .unwrap(),
        manifest("bottom")
            .depends_on(key("left"))
            .input_ref("right_uid", key("right").output("uid"))
            .build()
            .unwrap(),
    ];
    descriptors.extend(data_chain(&["d0", "d1", "d2", "d3"]));
    let h = Harness::slow(descriptors, 2);

    let report = h.engine.apply(CancellationToken::new()).await.unwrap();
    assert!(report.success());
    verify_chain(&report.journal).unwrap();

    let seq = |node: &NodeKey, state: Lifecycle| {
        report
            .journal
            .iter()
            .find(|e| &e.node == node && e.to == state)
            .map(|e| e.seq)
            .unwrap()
    };
    for (dependent, dependency, _) in h.graph.edges() {
        assert!(
            seq(&dependency, Lifecycle::Settled) < seq(&dependent, Lifecycle::Running),
            "{dependency} must settle before {dependent} runs"
        );
    }
}

#[tokio::test]
async fn test_failure_is_contained_to_its_subgraph() {
    let mut descriptors = chain(&["a", "b", "c"]);
    descriptors.extend(chain(&["p", "q"]));
    let h = Harness::new(descriptors);
    h.cloud.fail_apply(&key("a"), "quota exceeded");

    let report = h.engine.apply(CancellationToken::new()).await.unwrap();
    assert!(!report.success());

    let a = report.outcome(&key("a")).unwrap();
    assert_eq!(a.state, Lifecycle::Failed);
    assert_eq!(a.error_class, Some(ErrorClass::ProviderAction));
    assert!(a.retry_safe);
    assert_eq!(report.state_of(&key("b")), Some(Lifecycle::Skipped));
    assert_eq!(report.state_of(&key("c")), Some(Lifecycle::Skipped));
    assert_eq!(report.state_of(&key("p")), Some(Lifecycle::Settled));
    assert_eq!(report.state_of(&key("q")), Some(Lifecycle::Settled));

    // Failed and skipped nodes leave state untouched.
    let records = h.store.records().await.unwrap();
    assert_eq!(records.keys().cloned().collect::<Vec<_>>(), vec![key("p"), key("q")]);
    assert_eq!(h.cloud.apply_count(&key("b")), 0);
}

#[tokio::test]
async fn test_rerun_after_failure_only_retries_the_failed_subgraph() {
    let mut descriptors = chain(&["a", "b", "c"]);
    descriptors.extend(chain(&["p", "q"]));
    let h = Harness::new(descriptors);
    h.cloud.fail_apply(&key("b"), "transient outage");

    let first = h.engine.apply(CancellationToken::new()).await.unwrap();
    assert_eq!(first.state_of(&key("b")), Some(Lifecycle::Failed));
    let p_record = h.store.load(&key("p")).await.unwrap().unwrap();

    h.cloud.clear_faults(&key("b"));
    let second = h.engine.apply(CancellationToken::new()).await.unwrap();
    assert!(second.success());

    let action = |k: &str| second.outcome(&key(k)).unwrap().action;
    assert_eq!(action("a"), Some(Action::NoOp));
    assert_eq!(action("b"), Some(Action::Create));
    assert_eq!(action("c"), Some(Action::Create));
    assert_eq!(action("p"), Some(Action::NoOp));
    assert_eq!(action("q"), Some(Action::NoOp));
    assert_eq!(h.cloud.apply_count(&key("p")), 1);

    let p_after = h.store.load(&key("p")).await.unwrap().unwrap();
    assert_eq!(p_after.fingerprint, p_record.fingerprint);
    assert_eq!(p_after.version, p_record.version);
}

#[tokio::test]
async fn test_fault_tolerant_failure_releases_ordering_only_dependents() {
    let h = Harness::new(vec![
        manifest("policy").fault_tolerant().build().unwrap(),
        manifest("ordered").depends_on(key("policy")).build().unwrap(),
        manifest("consumer")
            .input_ref("policy_uid", key("policy").output("uid"))
            .build()
            .unwrap(),
    ]);
    h.cloud.fail_apply(&key("policy"), "admission webhook denied");

    let report = h.engine.apply(CancellationToken::new()).await.unwrap();
    assert!(!report.success());
    assert_eq!(report.state_of(&key("policy")), Some(Lifecycle::Failed));
    assert_eq!(report.state_of(&key("ordered")), Some(Lifecycle::Settled));
    assert_eq!(report.state_of(&key("consumer")), Some(Lifecycle::Skipped));
}

#[tokio::test(start_paused = true)]
async fn test_readiness_timeout_fails_node_without_commit() {
    let h = Harness::new(chain(&["a", "b"]));
    h.cloud.never_ready(&key("a"));

    let report = h.engine.apply(CancellationToken::new()).await.unwrap();
    let a = report.outcome(&key("a")).unwrap();
    assert_eq!(a.state, Lifecycle::Failed);
    assert_eq!(a.action, Some(Action::Create));
    assert_eq!(a.error_class, Some(ErrorClass::ReadinessTimeout));
    assert!(a.error.as_deref().unwrap().contains("not ready"));
    assert_eq!(report.state_of(&key("b")), Some(Lifecycle::Skipped));
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_explicit_failure_status_fails_fast() {
    let h = Harness::new(chain(&["a"]));
    h.cloud.fail_status(&key("a"), "ImagePullBackOff");

    let report = h.engine.apply(CancellationToken::new()).await.unwrap();
    let a = report.outcome(&key("a")).unwrap();
    assert_eq!(a.state, Lifecycle::Failed);
    assert_eq!(a.error_class, Some(ErrorClass::ProviderAction));
    assert!(a.error.as_deref().unwrap().contains("ImagePullBackOff"));
}

#[tokio::test]
async fn test_transient_probe_errors_are_retried() {
    let h = Harness::new(chain(&["a"]));
    h.cloud.transient_observes(&key("a"), 3);

    let report = h.engine.apply(CancellationToken::new()).await.unwrap();
    assert!(report.success());
}

#[tokio::test]
async fn test_out_of_band_deletion_is_repaired() {
    let h = Harness::new(network_cluster_gateway());
    h.engine.apply(CancellationToken::new()).await.unwrap();

    let cluster = NodeKey::new(ResourceKind::Cluster, "main");
    assert!(h.cloud.remove_out_of_band(&cluster));

    let plan = h.engine.preview().await.unwrap();
    let step = plan.step(&cluster).unwrap();
    assert_eq!(step.action, Action::Update);
    assert!(step.reason.contains("drift"));

    let report = h.engine.apply(CancellationToken::new()).await.unwrap();
    assert!(report.success());
    assert_eq!(report.outcome(&cluster).unwrap().action, Some(Action::Update));
    assert!(h.cloud.exists_now(&cluster));
}

#[tokio::test]
async fn test_input_change_propagates_to_consumers_in_preview() {
    let h = Harness::new(data_chain(&["a", "b", "c"]));
    h.engine.apply(CancellationToken::new()).await.unwrap();

    let mut edited = data_chain(&["a", "b", "c"]);
    edited[0] = manifest("a").input("replicas", 3).build().unwrap();
    let edited = h.redeploy(edited);

    let plan = edited.engine.preview().await.unwrap();
    assert_eq!(plan.action(&key("a")), Some(Action::Update));
    assert_eq!(plan.step(&key("b")).unwrap().reason, "upstream changes pending");
    assert_eq!(plan.action(&key("c")), Some(Action::Update));

    // Preview has no side effects.
    assert_eq!(h.cloud.apply_count(&key("a")), 1);
}

#[tokio::test]
async fn test_upstream_output_change_updates_consumer() {
    let h = Harness::new(data_chain(&["a", "b"]));
    h.engine.apply(CancellationToken::new()).await.unwrap();

    h.cloud.set_output(&key("a"), "uid", json!("rotated"));
    let report = h.engine.apply(CancellationToken::new()).await.unwrap();

    assert!(report.success());
    assert_eq!(report.outcome(&key("a")).unwrap().action, Some(Action::NoOp));
    assert_eq!(report.outcome(&key("b")).unwrap().action, Some(Action::Update));
    assert_eq!(h.cloud.inputs(&key("b")).unwrap()["upstream_uid"], json!("rotated"));

    // The producer's record picked up the new output.
    let a = h.store.load(&key("a")).await.unwrap().unwrap();
    assert_eq!(a.outputs["uid"], json!("rotated"));
    assert_eq!(a.version, 2);
}

#[tokio::test(start_paused = true)]
async fn test_parallelism_is_bounded() {
    let names: Vec<String> = (0..6).map(|i| format!("n{i}")).collect();
    let descriptors = names
        .iter()
        .map(|n| manifest(n).build().unwrap())
        .collect();
    let h = Harness::new(descriptors).with_config(EngineConfig { max_parallel: 2 });
    for n in &names {
        h.cloud.delay_apply(&key(n), Duration::from_millis(50));
    }

    let report = h.engine.apply(CancellationToken::new()).await.unwrap();
    assert!(report.success());
    assert_eq!(h.cloud.max_concurrent_applies(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_independent_branches_run_concurrently() {
    let descriptors = (0..4).map(|i| manifest(&format!("n{i}")).build().unwrap()).collect();
    let h = Harness::new(descriptors);
    for i in 0..4 {
        h.cloud.delay_apply(&key(&format!("n{i}")), Duration::from_millis(50));
    }
    h.engine.apply(CancellationToken::new()).await.unwrap();
    assert_eq!(h.cloud.max_concurrent_applies(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_scheduling_without_partial_commits() {
    let h = Harness::new(chain(&["a", "b", "c"]));
    h.cloud.never_ready(&key("a"));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let report = h.engine.apply(cancel).await.unwrap();
    let a = report.outcome(&key("a")).unwrap();
    assert_eq!(a.state, Lifecycle::Failed);
    assert_eq!(a.error_class, Some(ErrorClass::Cancelled));
    for k in ["b", "c"] {
        let o = report.outcome(&key(k)).unwrap();
        assert_eq!(o.state, Lifecycle::Skipped);
        assert_eq!(o.error.as_deref(), Some("cancelled"));
    }
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_cancelled_before_start_runs_nothing() {
    let h = Harness::new(chain(&["a", "b"]));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = h.engine.apply(cancel).await.unwrap();
    assert_eq!(report.count(Lifecycle::Skipped), 2);
    assert!(h.cloud.calls().is_empty());
}

#[tokio::test]
async fn test_callback_readiness_uses_reported_outputs() {
    let webhook = manifest("cert")
        .readiness(ReadinessSignal::Callback {
            policy: fast_policy(),
        })
        .build()
        .unwrap();
    let h = Harness::new(vec![webhook]);
    let cert = key("cert");

    // Delivered before the prober starts waiting.
    h.engine.callbacks().notify(
        &cert,
        Ok(ValueMap::from([("secret_name".to_string(), json!("tls-cert"))])),
    );
    let report = h.engine.apply(CancellationToken::new()).await.unwrap();
    assert!(report.success());
    let record = h.store.load(&cert).await.unwrap().unwrap();
    assert_eq!(record.outputs["secret_name"], json!("tls-cert"));
    assert!(record.outputs.contains_key("uid"));
}

#[tokio::test]
async fn test_orphaned_records_are_reported() {
    let h = Harness::new(chain(&["a"]));
    let legacy = NodeKey::new(ResourceKind::Gateway, "legacy");
    h.store.overwrite(StateRecord::new(
        legacy.clone(),
        Fingerprint::compute(&legacy, &ValueMap::new()),
        ValueMap::new(),
    ));

    let plan = h.engine.preview().await.unwrap();
    assert_eq!(plan.orphans(), &[legacy.clone()]);
    let report = h.engine.apply(CancellationToken::new()).await.unwrap();
    assert_eq!(report.orphans, vec![legacy]);
}

#[tokio::test]
async fn test_run_is_rejected_while_another_holds_the_lease() {
    let h = Harness::new(chain(&["a", "b"]));
    let other = RunId::new();
    let _held = h.store.leases().acquire(other, &[key("b")]).unwrap();

    let err = h.engine.apply(CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::StateConflict);
    assert!(matches!(err, StrataError::State(StateError::Locked { holder, .. }) if holder == other));
    assert!(h.cloud.calls().is_empty());
}

/// Store that lets another writer sneak in right before a chosen commit.
#[derive(Debug)]
struct RacingStore {
    inner: MemoryStateStore,
    contested: NodeKey,
}

#[async_trait::async_trait]
impl StateStore for RacingStore {
    async fn load(&self, key: &NodeKey) -> Result<Option<StateRecord>, StateError> {
        self.inner.load(key).await
    }

    async fn commit(&self, record: StateRecord, expected: Option<u64>) -> Result<u64, StateError> {
        if record.key == self.contested {
            let mut rival = record.clone();
            rival.version = 41;
            self.inner.overwrite(rival);
        }
        self.inner.commit(record, expected).await
    }

    async fn remove(&self, key: &NodeKey, expected: u64) -> Result<(), StateError> {
        self.inner.remove(key, expected).await
    }

    async fn records(&self) -> Result<BTreeMap<NodeKey, StateRecord>, StateError> {
        self.inner.records().await
    }

    fn leases(&self) -> &LeaseTable {
        self.inner.leases()
    }
}

#[tokio::test]
async fn test_state_conflict_aborts_the_run() {
    let graph = Arc::new(graph::build(chain(&["a", "b", "c"])).unwrap());
    let store = Arc::new(RacingStore {
        inner: MemoryStateStore::new(),
        contested: key("b"),
    });
    let cloud = Arc::new(SimulatedCloud::new());
    let engine = ConvergenceEngine::new(graph, store.clone(), ProviderRegistry::uniform(cloud.clone()));

    let err = engine.apply(CancellationToken::new()).await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(err.class(), ErrorClass::StateConflict);

    // The rival's record stands; nothing downstream ran.
    let b = store.load(&key("b")).await.unwrap().unwrap();
    assert_eq!(b.version, 41);
    assert_eq!(cloud.apply_count(&key("c")), 0);
}

#[tokio::test]
async fn test_fixed_delay_node_survives_transient_observe_error() {
    let policy = manifest("policy")
        .readiness(ReadinessSignal::FixedDelay {
            delay: Duration::from_millis(10),
            policy: fast_policy(),
        })
        .build()
        .unwrap();
    let h = Harness::new(vec![policy]);
    h.cloud.transient_observes(&key("policy"), 1);

    let report = h.engine.apply(CancellationToken::new()).await.unwrap();
    assert!(report.success(), "{}", report.generate_text());
    assert_eq!(report.state_of(&key("policy")), Some(Lifecycle::Settled));
}

#[tokio::test]
async fn test_noop_rerun_reports_current_settlement_time() {
    let h = Harness::new(chain(&["a"]));
    let first = h.engine.apply(CancellationToken::new()).await.unwrap();
    let first_settled = first.outcome(&key("a")).unwrap().settled_at.unwrap();
    let record = h.store.load(&key("a")).await.unwrap().unwrap();
    assert_eq!(record.settled_at, first_settled);

    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = h.engine.apply(CancellationToken::new()).await.unwrap();
    let a = second.outcome(&key("a")).unwrap();
    assert_eq!(a.action, Some(Action::NoOp));
    assert!(a.settled_at.unwrap() > first_settled);
    // Unchanged outputs leave the record alone.
    assert_eq!(h.store.load(&key("a")).await.unwrap().unwrap().version, 1);
}
