//! Stack exports
//!
//! The values operators need after an apply, read from committed state
//! records. Exports whose producer has not settled yet are left out.

use crate::config::PlatformConfig;
use crate::topology;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use strata_core::state::StateRecord;
use strata_core::NodeKey;

/// Rendered as `<sensitive>` in text output
const SENSITIVE: &[&str] = &["kubeconfig"];

/// `(export, producer, output)`
fn recorded_exports() -> [(&'static str, NodeKey, &'static str); 9] {
    let network = topology::network();
    let cluster = topology::cluster();
    [
        ("vpc_id", network.clone(), "vpc_id"),
        ("public_subnet_ids", network.clone(), "public_subnet_ids"),
        ("private_subnet_ids", network, "private_subnet_ids"),
        ("cluster_name", cluster.clone(), "cluster_name"),
        ("cluster_endpoint", cluster.clone(), "cluster_endpoint"),
        ("cluster_security_group_id", cluster.clone(), "cluster_security_group_id"),
        ("kubeconfig", cluster.clone(), "kubeconfig"),
        ("oidc_provider_arn", cluster.clone(), "oidc_provider_arn"),
        ("oidc_provider_url", cluster, "oidc_provider_url"),
    ]
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct StackExports(BTreeMap<String, Value>);

impl StackExports {
    pub fn collect(config: &PlatformConfig, records: &BTreeMap<NodeKey, StateRecord>) -> Self {
        let mut exports = BTreeMap::new();
        exports.insert("aws_region".to_string(), Value::from(config.region.as_str()));
        exports.insert("vpc_cidr".to_string(), Value::from(config.vpc_cidr.as_str()));

        for (name, producer, output) in recorded_exports() {
            match records.get(&producer).and_then(|r| r.outputs.get(output)) {
                Some(value) => {
                    exports.insert(name.to_string(), value.clone());
                }
                None => tracing::debug!(export = name, node = %producer, "export not available"),
            }
        }
        Self(exports)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Recorded exports with no value yet
    pub fn missing(&self) -> Vec<&'static str> {
        recorded_exports()
            .into_iter()
            .map(|(name, _, _)| name)
            .filter(|name| !self.0.contains_key(*name))
            .collect()
    }

    pub fn render_text(&self) -> String {
        let width = self.0.keys().map(String::len).max().unwrap_or(0);
        let mut out = String::new();
        for (name, value) in &self.0 {
            let shown = if SENSITIVE.contains(&name.as_str()) {
                "<sensitive>".to_string()
            } else {
                display(value)
            };
            out.push_str(&format!("{name:<width$}  {shown}\n"));
        }
        for name in self.missing() {
            out.push_str(&format!("{name:<width$}  (not yet available)\n"));
        }
        out
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(display).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}
