//! Testing utilities for the Strata workspace
//!
//! Shared fixtures: fast readiness policies, descriptor helpers and an
//! engine wired to a simulated cloud and an in-memory state store.

#![allow(missing_docs)]

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use strata_core::descriptor::{DescriptorBuilder, ResourceDescriptor};
use strata_core::engine::{ConvergenceEngine, EngineConfig};
use strata_core::graph::{self, DependencyGraph};
use strata_core::probe::{ProbePolicy, ReadinessSignal};
use strata_core::provider::ProviderRegistry;
use strata_core::simulator::{SimulatedCloud, SimulatorConfig};
use strata_core::state::MemoryStateStore;
use strata_core::types::{NodeKey, ResourceKind};

/// One second budget, 10ms polls
pub fn fast_policy() -> ProbePolicy {
    ProbePolicy::new(Duration::from_secs(1), Duration::from_millis(10))
}

pub fn key(name: &str) -> NodeKey {
    NodeKey::new(ResourceKind::GenericManifest, name)
}

/// Generic manifest descriptor with a fast status-ready probe
pub fn manifest(name: &str) -> DescriptorBuilder {
    ResourceDescriptor::builder(ResourceKind::GenericManifest, name)
        .input("manifest", json!({ "kind": "ConfigMap", "metadata": { "name": name } }))
        .readiness(ReadinessSignal::status_ready(fast_policy()))
}

/// `names[i]` explicitly depends on `names[i - 1]`
pub fn chain(names: &[&str]) -> Vec<ResourceDescriptor> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let builder = manifest(name);
            let builder = match i {
                0 => builder,
                _ => builder.depends_on(key(names[i - 1])),
            };
            builder.build().expect("valid chain descriptor")
        })
        .collect()
}

/// `names[i]` consumes the `uid` output of `names[i - 1]`
pub fn data_chain(names: &[&str]) -> Vec<ResourceDescriptor> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let builder = manifest(name);
            let builder = match i {
                0 => builder,
                _ => builder.input_ref("upstream_uid", key(names[i - 1]).output("uid")),
            };
            builder.build().expect("valid chain descriptor")
        })
        .collect()
}

/// Network -> cluster -> gateway, as a real topology would declare them
pub fn network_cluster_gateway() -> Vec<ResourceDescriptor> {
    let network = ResourceDescriptor::builder(ResourceKind::Network, "vpc")
        .input("cidr_block", "10.0.0.0/16")
        .readiness(ReadinessSignal::status_ready(fast_policy()))
        .build()
        .expect("valid network");
    let cluster = ResourceDescriptor::builder(ResourceKind::Cluster, "main")
        .input("version", "1.31")
        .input_ref("vpc_id", network.key.output("vpc_id"))
        .input_ref("subnet_ids", network.key.output("private_subnet_ids"))
        .depends_on(network.key.clone())
        .readiness(ReadinessSignal::status_ready(fast_policy()))
        .build()
        .expect("valid cluster");
    let gateway = ResourceDescriptor::builder(ResourceKind::Gateway, "kong")
        .input("chart", "kong")
        .input_ref("kubeconfig", cluster.key.output("kubeconfig"))
        .depends_on(cluster.key.clone())
        .readiness(ReadinessSignal::output_present("service_endpoint", fast_policy()))
        .build()
        .expect("valid gateway");
    vec![network, cluster, gateway]
}

/// Engine, simulated cloud and in-memory store sharing one graph
pub struct Harness {
    pub graph: Arc<DependencyGraph>,
    pub cloud: Arc<SimulatedCloud>,
    pub store: Arc<MemoryStateStore>,
    pub engine: ConvergenceEngine,
}

impl Harness {
    pub fn new(descriptors: Vec<ResourceDescriptor>) -> Self {
        Self::with_cloud(descriptors, SimulatedCloud::new())
    }

    pub fn with_cloud(descriptors: Vec<ResourceDescriptor>, cloud: SimulatedCloud) -> Self {
        Self::assemble(descriptors, Arc::new(cloud), Arc::new(MemoryStateStore::new()))
    }

    pub fn slow(descriptors: Vec<ResourceDescriptor>, settle_after_polls: u32) -> Self {
        Self::with_cloud(
            descriptors,
            SimulatedCloud::with_config(SimulatorConfig {
                settle_after_polls,
                ..Default::default()
            }),
        )
    }

    /// New topology against the same cloud and store, e.g. after an edit.
    pub fn redeploy(&self, descriptors: Vec<ResourceDescriptor>) -> Self {
        Self::assemble(descriptors, Arc::clone(&self.cloud), Arc::clone(&self.store))
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.engine = self.engine.with_config(config);
        self
    }

    fn assemble(
        descriptors: Vec<ResourceDescriptor>,
        cloud: Arc<SimulatedCloud>,
        store: Arc<MemoryStateStore>,
    ) -> Self {
        let graph = Arc::new(graph::build(descriptors).expect("valid test topology"));
        let engine = ConvergenceEngine::new(
            Arc::clone(&graph),
            store.clone(),
            ProviderRegistry::uniform(cloud.clone()),
        );
        Self {
            graph,
            cloud,
            store,
            engine,
        }
    }
}
