//! Simulated cloud
//!
//! An in-process [`Provider`] standing in for the cloud, cluster and Helm
//! APIs. Resources get stable synthetic identifiers derived from their node
//! key, become ready after a configurable number of polls, and can be made to
//! misbehave through fault injection. State can optionally be persisted to a
//! JSON file so that separate CLI invocations see the same "cloud".

use crate::error::ProviderError;
use crate::provider::{
    Acknowledgment, ApplyRequest, Condition, Observation, ObservedStatus, Provider,
};
use crate::types::{Action, NodeKey, ResourceKind, ValueMap};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Observations answered with `Pending` after each apply
    pub settle_after_polls: u32,
    /// Artificial latency of every apply call
    pub apply_latency: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            settle_after_polls: 0,
            apply_latency: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimResource {
    fingerprint: String,
    inputs: ValueMap,
    outputs: ValueMap,
    conditions: Vec<Condition>,
    generation: u64,
    #[serde(default)]
    polls: u32,
}

/// Every call the simulator received, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    Apply(NodeKey, Action),
    Observe(NodeKey),
    Destroy(NodeKey),
}

#[derive(Debug, Default)]
struct Faults {
    fail_apply: HashMap<NodeKey, String>,
    fail_status: HashMap<NodeKey, String>,
    never_ready: HashSet<NodeKey>,
    transient_observes: HashMap<NodeKey, u32>,
    fail_destroy: HashMap<NodeKey, String>,
    apply_delay: HashMap<NodeKey, Duration>,
}

#[derive(Debug, Default)]
pub struct SimulatedCloud {
    config: SimulatorConfig,
    resources: Mutex<BTreeMap<NodeKey, SimResource>>,
    faults: Mutex<Faults>,
    calls: Mutex<Vec<SimCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    path: Option<PathBuf>,
}

impl SimulatedCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SimulatorConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Simulator backed by a JSON file; missing files start empty.
    pub async fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let resources = match tokio::fs::read_to_string(&path).await {
            Ok(content) => decode(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            resources: Mutex::new(resources),
            path: Some(path),
            ..Self::default()
        })
    }

    /// Write resources back to the file given to [`Self::open`].
    pub async fn save(&self) -> std::io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = encode(&self.resources.lock())?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // Fault injection

    pub fn fail_apply(&self, key: &NodeKey, reason: impl Into<String>) {
        self.faults.lock().fail_apply.insert(key.clone(), reason.into());
    }

    /// Report an explicit failure status on every observe.
    pub fn fail_status(&self, key: &NodeKey, reason: impl Into<String>) {
        self.faults.lock().fail_status.insert(key.clone(), reason.into());
    }

    pub fn never_ready(&self, key: &NodeKey) {
        self.faults.lock().never_ready.insert(key.clone());
    }

    /// The next `count` observes fail with a transient error.
    pub fn transient_observes(&self, key: &NodeKey, count: u32) {
        self.faults
            .lock()
            .transient_observes
            .insert(key.clone(), count);
    }

    pub fn fail_destroy(&self, key: &NodeKey, reason: impl Into<String>) {
        self.faults.lock().fail_destroy.insert(key.clone(), reason.into());
    }

    pub fn delay_apply(&self, key: &NodeKey, delay: Duration) {
        self.faults.lock().apply_delay.insert(key.clone(), delay);
    }

    pub fn clear_faults(&self, key: &NodeKey) {
        let mut faults = self.faults.lock();
        faults.fail_apply.remove(key);
        faults.fail_status.remove(key);
        faults.never_ready.remove(key);
        faults.transient_observes.remove(key);
        faults.fail_destroy.remove(key);
        faults.apply_delay.remove(key);
    }

    // Out-of-band changes

    /// Delete a resource behind the orchestrator's back.
    pub fn remove_out_of_band(&self, key: &NodeKey) -> bool {
        self.resources.lock().remove(key).is_some()
    }

    /// Change an observed output behind the orchestrator's back.
    pub fn set_output(&self, key: &NodeKey, name: impl Into<String>, value: Value) {
        if let Some(resource) = self.resources.lock().get_mut(key) {
            resource.outputs.insert(name.into(), value);
        }
    }

    // Inspection

    pub fn exists_now(&self, key: &NodeKey) -> bool {
        self.resources.lock().contains_key(key)
    }

    pub fn outputs(&self, key: &NodeKey) -> Option<ValueMap> {
        self.resources.lock().get(key).map(|r| r.outputs.clone())
    }

    pub fn inputs(&self, key: &NodeKey) -> Option<ValueMap> {
        self.resources.lock().get(key).map(|r| r.inputs.clone())
    }

    pub fn resource_keys(&self) -> Vec<NodeKey> {
        self.resources.lock().keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.calls.lock().clone()
    }

    /// Applies received for `key`, of any action
    pub fn apply_count(&self, key: &NodeKey) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, SimCall::Apply(k, _) if k == key))
            .count()
    }

    pub fn destroy_order(&self) -> Vec<NodeKey> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                SimCall::Destroy(k) => Some(k.clone()),
                _ => None,
            })
            .collect()
    }

    /// Highest number of applies observed in flight at once
    pub fn max_concurrent_applies(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: SimCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl Provider for SimulatedCloud {
    async fn apply(&self, request: &ApplyRequest) -> Result<Acknowledgment, ProviderError> {
        let key = &request.key;
        self.record(SimCall::Apply(key.clone(), request.action));

        let (rejection, delay) = {
            let faults = self.faults.lock();
            (
                faults.fail_apply.get(key).cloned(),
                faults.apply_delay.get(key).copied(),
            )
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let latency = delay.unwrap_or(self.config.apply_latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(reason) = rejection {
            tracing::debug!(node = %key, %reason, "simulated apply rejected");
            return Err(ProviderError::Rejected {
                key: key.clone(),
                reason,
            });
        }

        let mut resources = self.resources.lock();
        let generation = resources.get(key).map_or(1, |r| r.generation + 1);
        let outputs = synthesize_outputs(key, &request.inputs, generation);
        let conditions = synthesize_conditions(key, &request.inputs);
        resources.insert(
            key.clone(),
            SimResource {
                fingerprint: request.fingerprint.to_string(),
                inputs: request.inputs.clone(),
                outputs: outputs.clone(),
                conditions,
                generation,
                polls: 0,
            },
        );
        Ok(Acknowledgment { outputs })
    }

    async fn observe(&self, key: &NodeKey) -> Result<Observation, ProviderError> {
        self.record(SimCall::Observe(key.clone()));
        let mut faults = self.faults.lock();
        if let Some(remaining) = faults.transient_observes.get_mut(key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ProviderError::Transient {
                    key: key.clone(),
                    reason: "simulated throttling".into(),
                });
            }
        }

        let mut resources = self.resources.lock();
        let Some(resource) = resources.get_mut(key) else {
            return Ok(Observation::missing());
        };
        resource.polls = resource.polls.saturating_add(1);

        let status = if let Some(reason) = faults.fail_status.get(key) {
            ObservedStatus::Failed(reason.clone())
        } else if faults.never_ready.contains(key)
            || resource.polls <= self.config.settle_after_polls
        {
            ObservedStatus::Pending
        } else {
            ObservedStatus::Ready
        };
        let conditions = if status == ObservedStatus::Ready {
            resource.conditions.clone()
        } else {
            Vec::new()
        };
        Ok(Observation {
            status,
            outputs: resource.outputs.clone(),
            conditions,
        })
    }

    async fn exists(&self, key: &NodeKey, _outputs: &ValueMap) -> Result<bool, ProviderError> {
        Ok(self.exists_now(key))
    }

    async fn destroy(&self, key: &NodeKey) -> Result<(), ProviderError> {
        self.record(SimCall::Destroy(key.clone()));
        if let Some(reason) = self.faults.lock().fail_destroy.get(key).cloned() {
            return Err(ProviderError::Rejected {
                key: key.clone(),
                reason,
            });
        }
        match self.resources.lock().remove(key) {
            Some(_) => Ok(()),
            None => Err(ProviderError::NotFound(key.clone())),
        }
    }
}

fn encode(resources: &BTreeMap<NodeKey, SimResource>) -> std::io::Result<String> {
    let entries: Vec<(String, &SimResource)> = resources
        .iter()
        .map(|(k, r)| (k.to_string(), r))
        .collect();
    serde_json::to_string_pretty(&entries).map_err(std::io::Error::other)
}

fn decode(content: &str) -> std::io::Result<BTreeMap<NodeKey, SimResource>> {
    let entries: Vec<(String, SimResource)> =
        serde_json::from_str(content).map_err(std::io::Error::other)?;
    entries
        .into_iter()
        .map(|(k, r)| {
            k.parse::<NodeKey>()
                .map(|key| (key, r))
                .map_err(std::io::Error::other)
        })
        .collect()
}

/// Stable short identifier for a node
fn short_id(key: &NodeKey, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.to_string().as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

fn input_str<'a>(inputs: &'a ValueMap, name: &str) -> Option<&'a str> {
    inputs.get(name).and_then(Value::as_str)
}

fn synthesize_outputs(key: &NodeKey, inputs: &ValueMap, generation: u64) -> ValueMap {
    let name = key.name.as_str();
    let mut out = ValueMap::new();
    match key.kind {
        ResourceKind::Network => {
            out.insert("vpc_id".into(), json!(format!("vpc-{}", short_id(key, ""))));
            if let Some(cidr) = inputs.get("cidr_block") {
                out.insert("vpc_cidr_block".into(), cidr.clone());
            }
            let azs = inputs
                .get("availability_zones")
                .and_then(Value::as_array)
                .map_or(3, Vec::len);
            let subnets = |tier: &str| -> Value {
                (0..azs)
                    .map(|i| json!(format!("subnet-{}", short_id(key, &format!("{tier}{i}")))))
                    .collect()
            };
            out.insert("public_subnet_ids".into(), subnets("public"));
            out.insert("private_subnet_ids".into(), subnets("private"));
            out.insert(
                "nat_gateway_id".into(),
                json!(format!("nat-{}", short_id(key, "nat"))),
            );
        }
        ResourceKind::Cluster => {
            let cluster = input_str(inputs, "cluster_name").unwrap_or(name);
            let id = short_id(key, "");
            out.insert("cluster_name".into(), json!(cluster));
            out.insert(
                "cluster_endpoint".into(),
                json!(format!("https://{}.gr7.eks.amazonaws.com", id.to_uppercase())),
            );
            out.insert(
                "certificate_authority".into(),
                json!(hex::encode(short_id(key, "ca"))),
            );
            out.insert(
                "cluster_security_group_id".into(),
                json!(format!("sg-{}", short_id(key, "sg"))),
            );
            let oidc = format!("oidc.eks.amazonaws.com/id/{}", id.to_uppercase());
            out.insert(
                "oidc_provider_arn".into(),
                json!(format!("arn:aws:iam::000000000000:oidc-provider/{oidc}")),
            );
            out.insert("oidc_provider_url".into(), json!(format!("https://{oidc}")));
            out.insert(
                "kubeconfig".into(),
                json!(format!("apiVersion: v1\nkind: Config\ncurrent-context: {cluster}\n")),
            );
            if let Some(version) = inputs.get("version") {
                out.insert("version".into(), version.clone());
            }
        }
        ResourceKind::Nodegroup => {
            out.insert("node_group_name".into(), json!(name));
            out.insert(
                "node_group_arn".into(),
                json!(format!("arn:aws:eks:::nodegroup/{name}/{}", short_id(key, ""))),
            );
        }
        ResourceKind::GenericManifest => {
            out.insert("name".into(), json!(name));
            out.insert("uid".into(), json!(short_id(key, "uid")));
        }
        _ => {
            let namespace = input_str(inputs, "namespace").unwrap_or("default");
            out.insert("release_name".into(), json!(name));
            out.insert("namespace".into(), json!(namespace));
            out.insert("status".into(), json!("deployed"));
            out.insert("revision".into(), json!(generation));
            out.insert(
                "service_endpoint".into(),
                json!(format!("{name}.{namespace}.svc.cluster.local")),
            );
            if key.kind == ResourceKind::Gateway {
                out.insert(
                    "load_balancer_hostname".into(),
                    json!(format!("{}.elb.amazonaws.com", short_id(key, "lb"))),
                );
            }
        }
    }
    out
}

fn synthesize_conditions(key: &NodeKey, inputs: &ValueMap) -> Vec<Condition> {
    match key.kind {
        ResourceKind::Nodegroup => {
            let nodes = inputs
                .get("desired_size")
                .and_then(Value::as_u64)
                .unwrap_or(1);
            (0..nodes).map(|_| Condition::new("Ready", true)).collect()
        }
        ResourceKind::Network | ResourceKind::Cluster => vec![Condition::new("Available", true)],
        ResourceKind::GenericManifest => vec![Condition::new("Established", true)],
        _ => vec![Condition::new("Deployed", true)],
    }
}
