use pretty_assertions::assert_eq;
use std::io::Write;
use strata_core::graph::EdgeOrigin;
use strata_core::prelude::*;
use strata_platform::topology::{self, NAMESPACES};
use strata_platform::{PlatformConfig, PlatformError, ReadinessConfig, StackExports};
use strata_test_utils::Harness;

fn fast_config() -> PlatformConfig {
    PlatformConfig {
        readiness: ReadinessConfig {
            poll_interval_ms: 5,
            infrastructure_timeout_secs: 2,
            release_timeout_secs: 2,
            policy_settle_ms: 0,
        },
        ..Default::default()
    }
}

fn harness(config: &PlatformConfig) -> Harness {
    Harness::new(topology::descriptors(config).unwrap())
}

fn release(kind: ResourceKind, name: &str) -> NodeKey {
    NodeKey::new(kind, name)
}

#[test]
fn test_platform_graph_is_complete_and_layered() {
    let graph = topology::build(&PlatformConfig::default()).unwrap();
    assert_eq!(graph.len(), 29);

    let order = graph.topological_order();
    assert_eq!(
        &order[..3],
        &[topology::network(), topology::cluster(), topology::workers()]
    );

    // Everything in the cluster descends from the node pool.
    let in_cluster = graph.descendants(&topology::workers());
    assert_eq!(in_cluster.len(), 26);
    for ns in NAMESPACES {
        assert!(in_cluster.contains(&topology::namespace(ns)), "{ns}");
    }
}

#[test]
fn test_platform_data_edges_follow_outputs() {
    let graph = topology::build(&PlatformConfig::default()).unwrap();
    let elasticsearch = release(ResourceKind::LogPipeline, "elasticsearch");

    let fluent = graph.dependencies(&release(ResourceKind::LogPipeline, "fluent-bit"));
    assert!(fluent.contains(&(elasticsearch.clone(), EdgeOrigin::Data)));
    assert!(fluent.contains(&(topology::namespace("logging"), EdgeOrigin::Data)));
    assert!(fluent.contains(&(topology::cluster(), EdgeOrigin::Data)));
    assert!(fluent.contains(&(topology::workers(), EdgeOrigin::Explicit)));

    let jaeger = graph.dependencies(&release(ResourceKind::TracingBackend, "jaeger"));
    assert!(jaeger.contains(&(elasticsearch, EdgeOrigin::Data)));
    assert!(jaeger.contains(&(
        release(ResourceKind::TracingBackend, "jaeger-operator"),
        EdgeOrigin::Explicit
    )));

    let issuer = graph.dependencies(&release(ResourceKind::CertificateAuthority, "letsencrypt-prod"));
    assert!(issuer.contains(&(
        release(ResourceKind::CertificateAuthority, "cert-manager"),
        EdgeOrigin::Explicit
    )));
    assert!(issuer.contains(&(release(ResourceKind::Gateway, "kong"), EdgeOrigin::Explicit)));

    let ingress = graph.dependencies(&release(ResourceKind::Gateway, "istio-ingress"));
    assert!(ingress.contains(&(
        release(ResourceKind::MeshControlPlane, "istiod"),
        EdgeOrigin::Explicit
    )));
}

#[test]
fn test_node_pool_waits_for_min_ready_nodes() {
    let config = PlatformConfig {
        min_size: 3,
        desired_capacity: 4,
        ..Default::default()
    };
    let graph = topology::build(&config).unwrap();
    let pool = graph.descriptor(&topology::workers()).unwrap();
    assert!(matches!(
        &pool.readiness,
        ReadinessSignal::ConditionCount { condition, min: 3, .. } if condition == "Ready"
    ));
}

#[test]
fn test_only_network_policies_are_fault_tolerant() {
    let descriptors = topology::descriptors(&PlatformConfig::default()).unwrap();
    let tolerant: Vec<_> = descriptors
        .iter()
        .filter(|d| d.fault_tolerant)
        .map(|d| d.key.name.clone())
        .collect();
    assert_eq!(
        tolerant,
        vec![
            "logging-deny-ingress",
            "logging-allow-fluent-to-es",
            "logging-allow-kibana-to-es",
            "observability-deny-ingress",
            "observability-allow-istio-to-jaeger",
        ]
    );
}

#[test]
fn test_invalid_config_never_reaches_the_graph() {
    let config = PlatformConfig {
        vpc_cidr: "10.0.0.0/20".into(),
        ..Default::default()
    };
    let err = topology::build(&config).unwrap_err();
    assert!(matches!(err, PlatformError::Invalid { ref field, .. } if field == "vpc_cidr"));
}

#[test]
fn test_config_file_then_environment() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "cluster_name = \"edge\"\nmax_size = 8").unwrap();

    let mut config = PlatformConfig::from_file(file.path()).unwrap();
    config
        .apply_env(|name| (name == "STRATA_DESIRED_CAPACITY").then(|| "5".to_string()))
        .unwrap();
    config.validate().unwrap();
    assert_eq!(config.cluster_name, "edge");
    assert_eq!((config.min_size, config.desired_capacity, config.max_size), (2, 5, 8));

    let missing = PlatformConfig::from_file(&file.path().with_extension("absent")).unwrap_err();
    assert!(matches!(missing, PlatformError::Io { .. }));
}

#[tokio::test]
async fn test_platform_converges_and_reruns_as_no_op() {
    let config = fast_config();
    let h = harness(&config);

    let plan = h.engine.preview().await.unwrap();
    assert_eq!(plan.count(Action::Create), 29);

    let report = h.engine.apply(CancellationToken::new()).await.unwrap();
    assert!(report.success(), "{}", report.generate_text());
    assert_eq!(report.count(Lifecycle::Settled), 29);

    // The cluster was created inside the network's subnets.
    let private = h.cloud.outputs(&topology::network()).unwrap()["private_subnet_ids"].clone();
    assert_eq!(h.cloud.inputs(&topology::cluster()).unwrap()["private_subnet_ids"], private);

    // Releases were installed into their namespace.
    let kong = release(ResourceKind::Gateway, "kong");
    assert_eq!(h.cloud.inputs(&kong).unwrap()["namespace"], serde_json::json!("kong"));

    let again = h.engine.apply(CancellationToken::new()).await.unwrap();
    assert!(again.success());
    assert!(again.outcomes.iter().all(|o| o.action == Some(Action::NoOp)));
}

#[tokio::test]
async fn test_exports_after_apply() {
    let config = fast_config();
    let h = harness(&config);
    h.engine.apply(CancellationToken::new()).await.unwrap();

    let records = h.store.records().await.unwrap();
    let exports = StackExports::collect(&config, &records);
    assert!(exports.missing().is_empty());
    assert_eq!(exports.len(), 11);
    assert_eq!(
        exports.get("cluster_name"),
        Some(&serde_json::json!("microservices-cluster"))
    );
    assert_eq!(
        exports.get("vpc_id"),
        h.cloud.outputs(&topology::network()).unwrap().get("vpc_id")
    );
}

#[tokio::test]
async fn test_scaling_the_pool_only_updates_the_pool() {
    let config = fast_config();
    let h = harness(&config);
    h.engine.apply(CancellationToken::new()).await.unwrap();

    let scaled = PlatformConfig {
        desired_capacity: 5,
        ..config
    };
    let next = h.redeploy(topology::descriptors(&scaled).unwrap());
    let plan = next.engine.preview().await.unwrap();
    let changes: Vec<_> = plan
        .actions()
        .into_iter()
        .filter(|(_, action)| action.is_change())
        .collect();
    assert_eq!(changes, vec![(topology::workers(), Action::Update)]);

    let report = next.engine.apply(CancellationToken::new()).await.unwrap();
    assert!(report.success());
    assert_eq!(
        report.outcome(&topology::workers()).unwrap().action,
        Some(Action::Update)
    );
}

#[tokio::test]
async fn test_failed_gateway_skips_issuers_only() {
    let h = harness(&fast_config());
    let kong = release(ResourceKind::Gateway, "kong");
    h.cloud.fail_apply(&kong, "quota exceeded for load balancers");

    let report = h.engine.apply(CancellationToken::new()).await.unwrap();
    assert!(!report.success());
    assert_eq!(report.count(Lifecycle::Failed), 1);
    for issuer in ["letsencrypt-staging", "letsencrypt-prod"] {
        let key = release(ResourceKind::CertificateAuthority, issuer);
        assert_eq!(report.state_of(&key), Some(Lifecycle::Skipped), "{issuer}");
    }
    assert_eq!(report.count(Lifecycle::Skipped), 2);
    assert_eq!(report.count(Lifecycle::Settled), 26);
}

#[tokio::test]
async fn test_failed_network_policy_does_not_block_the_platform() {
    let h = harness(&fast_config());
    let policy = release(ResourceKind::GenericManifest, "logging-deny-ingress");
    h.cloud.fail_status(&policy, "policy controller unavailable");

    let report = h.engine.apply(CancellationToken::new()).await.unwrap();
    assert!(!report.success());
    assert_eq!(report.state_of(&policy), Some(Lifecycle::Failed));
    assert_eq!(report.count(Lifecycle::Settled), 28);
}

#[tokio::test]
async fn test_platform_teardown_ends_with_the_network() {
    let h = harness(&fast_config());
    h.engine.apply(CancellationToken::new()).await.unwrap();

    let report = h.engine.destroy(CancellationToken::new()).await.unwrap();
    assert!(report.success(), "{}", report.generate_text());
    let order = h.cloud.destroy_order();
    assert_eq!(order.len(), 29);
    assert_eq!(
        &order[26..],
        &[topology::workers(), topology::cluster(), topology::network()]
    );
    assert!(h.cloud.resource_keys().is_empty());
    assert!(h.store.is_empty());
}
