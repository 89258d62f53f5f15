//! Resource descriptors
//!
//! A descriptor declares one provisionable unit: its kind and name, its
//! inputs (literals or references to another node's outputs), explicit
//! ordering dependencies and the readiness signal that proves it usable.
//! Inputs are validated per kind when the descriptor is built, so malformed
//! topologies never reach the engine.

use crate::error::ConfigurationError;
use crate::probe::ReadinessSignal;
use crate::types::{NodeKey, ResourceKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Reference to a named output of another node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutputRef {
    pub node: NodeKey,
    pub output: String,
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.output)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    Literal(Value),
    Ref(OutputRef),
}

impl InputValue {
    pub fn as_ref_target(&self) -> Option<&OutputRef> {
        match self {
            InputValue::Ref(r) => Some(r),
            InputValue::Literal(_) => None,
        }
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            InputValue::Literal(v) => Some(v),
            InputValue::Ref(_) => None,
        }
    }
}

/// Helm chart coordinates, flattened into literal inputs
#[derive(Debug, Clone, PartialEq)]
pub struct HelmRelease {
    pub chart: String,
    pub version: String,
    pub repository: String,
    pub values: Value,
}

impl HelmRelease {
    pub fn new(
        chart: impl Into<String>,
        version: impl Into<String>,
        repository: impl Into<String>,
    ) -> Self {
        Self {
            chart: chart.into(),
            version: version.into(),
            repository: repository.into(),
            values: Value::Object(Default::default()),
        }
    }

    pub fn with_values(mut self, values: Value) -> Self {
        self.values = values;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    pub key: NodeKey,
    pub inputs: BTreeMap<String, InputValue>,
    pub depends_on: BTreeSet<NodeKey>,
    pub readiness: ReadinessSignal,
    /// A failure here does not skip dependents that only declared ordering
    /// on this node; consumers of its outputs are still skipped.
    pub fault_tolerant: bool,
}

impl ResourceDescriptor {
    pub fn builder(kind: ResourceKind, name: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder::new(NodeKey::new(kind, name))
    }

    pub fn kind(&self) -> ResourceKind {
        self.key.kind
    }

    /// Output references found in the declared inputs
    pub fn references(&self) -> impl Iterator<Item = &OutputRef> + '_ {
        self.inputs.values().filter_map(InputValue::as_ref_target)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |reason: String| ConfigurationError::InvalidDescriptor {
            key: self.key.clone(),
            reason,
        };

        if !valid_name(&self.key.name) {
            return Err(invalid(format!(
                "name `{}` must be non-empty and use only [A-Za-z0-9_-]",
                self.key.name
            )));
        }

        for rule in input_rules(self.key.kind) {
            match rule {
                InputRule::Required(name) => {
                    if !self.inputs.contains_key(*name) {
                        return Err(invalid(format!("missing required input `{name}`")));
                    }
                }
                InputRule::OneOf(names) => {
                    if !names.iter().any(|n| self.inputs.contains_key(*n)) {
                        return Err(invalid(format!(
                            "one of the inputs {names:?} is required"
                        )));
                    }
                }
            }
        }

        if self.key.kind == ResourceKind::Nodegroup {
            self.validate_node_bounds().map_err(invalid)?;
        }

        self.readiness.validate().map_err(invalid)
    }

    fn validate_node_bounds(&self) -> Result<(), String> {
        let literal_u64 = |name: &str| {
            self.inputs
                .get(name)
                .and_then(InputValue::as_literal)
                .and_then(Value::as_u64)
        };
        if let (Some(min), Some(desired), Some(max)) = (
            literal_u64("min_size"),
            literal_u64("desired_size"),
            literal_u64("max_size"),
        ) {
            if !(min <= desired && desired <= max) {
                return Err(format!(
                    "node counts must satisfy min <= desired <= max (got {min}/{desired}/{max})"
                ));
            }
        }
        Ok(())
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

enum InputRule {
    Required(&'static str),
    OneOf(&'static [&'static str]),
}

fn input_rules(kind: ResourceKind) -> &'static [InputRule] {
    use InputRule::*;
    match kind {
        ResourceKind::Network => &[Required("cidr_block")],
        ResourceKind::Cluster => &[Required("version")],
        ResourceKind::Nodegroup => &[
            Required("instance_type"),
            Required("desired_size"),
            Required("min_size"),
            Required("max_size"),
        ],
        ResourceKind::GenericManifest => &[Required("manifest")],
        ResourceKind::MeshControlPlane
        | ResourceKind::Gateway
        | ResourceKind::CertificateAuthority
        | ResourceKind::LogPipeline
        | ResourceKind::TracingBackend
        | ResourceKind::MetricsStack
        | ResourceKind::GitopsController => &[OneOf(&["chart", "manifest"])],
    }
}

/// Builder for [`ResourceDescriptor`]
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    key: NodeKey,
    inputs: BTreeMap<String, InputValue>,
    depends_on: BTreeSet<NodeKey>,
    readiness: ReadinessSignal,
    fault_tolerant: bool,
}

impl DescriptorBuilder {
    pub fn new(key: NodeKey) -> Self {
        Self {
            key,
            inputs: BTreeMap::new(),
            depends_on: BTreeSet::new(),
            readiness: ReadinessSignal::default(),
            fault_tolerant: false,
        }
    }

    pub fn input(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs
            .insert(name.into(), InputValue::Literal(value.into()));
        self
    }

    pub fn input_ref(mut self, name: impl Into<String>, reference: OutputRef) -> Self {
        self.inputs.insert(name.into(), InputValue::Ref(reference));
        self
    }

    pub fn depends_on(mut self, key: NodeKey) -> Self {
        self.depends_on.insert(key);
        self
    }

    pub fn readiness(mut self, signal: ReadinessSignal) -> Self {
        self.readiness = signal;
        self
    }

    pub fn fault_tolerant(mut self) -> Self {
        self.fault_tolerant = true;
        self
    }

    pub fn helm_release(self, release: HelmRelease) -> Self {
        self.input("chart", release.chart)
            .input("chart_version", release.version)
            .input("repository", release.repository)
            .input("values", release.values)
    }

    pub fn build(self) -> Result<ResourceDescriptor, ConfigurationError> {
        let descriptor = ResourceDescriptor {
            key: self.key,
            inputs: self.inputs,
            depends_on: self.depends_on,
            readiness: self.readiness,
            fault_tolerant: self.fault_tolerant,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}
