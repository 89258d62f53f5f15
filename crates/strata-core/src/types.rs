use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Named JSON values: resolved inputs and observed outputs.
pub type ValueMap = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Network,
    Cluster,
    Nodegroup,
    MeshControlPlane,
    Gateway,
    CertificateAuthority,
    LogPipeline,
    TracingBackend,
    MetricsStack,
    GitopsController,
    GenericManifest,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 11] = [
        ResourceKind::Network,
        ResourceKind::Cluster,
        ResourceKind::Nodegroup,
        ResourceKind::MeshControlPlane,
        ResourceKind::Gateway,
        ResourceKind::CertificateAuthority,
        ResourceKind::LogPipeline,
        ResourceKind::TracingBackend,
        ResourceKind::MetricsStack,
        ResourceKind::GitopsController,
        ResourceKind::GenericManifest,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Network => "network",
            ResourceKind::Cluster => "cluster",
            ResourceKind::Nodegroup => "nodegroup",
            ResourceKind::MeshControlPlane => "mesh-control-plane",
            ResourceKind::Gateway => "gateway",
            ResourceKind::CertificateAuthority => "certificate-authority",
            ResourceKind::LogPipeline => "log-pipeline",
            ResourceKind::TracingBackend => "tracing-backend",
            ResourceKind::MetricsStack => "metrics-stack",
            ResourceKind::GitopsController => "gitops-controller",
            ResourceKind::GenericManifest => "generic-manifest",
        }
    }

    /// Kinds installed into a running cluster (Helm release or manifest).
    pub fn is_in_cluster(self) -> bool {
        !matches!(
            self,
            ResourceKind::Network | ResourceKind::Cluster | ResourceKind::Nodegroup
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownKind(pub String);

impl fmt::Display for UnknownKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown resource kind `{}`", self.0)
    }
}

impl std::error::Error for UnknownKind {}

impl FromStr for ResourceKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// Stable node identity: kind plus name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeKey {
    pub kind: ResourceKind,
    pub name: String,
}

impl NodeKey {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// Reference to one of this node's outputs.
    pub fn output(&self, name: impl Into<String>) -> crate::descriptor::OutputRef {
        crate::descriptor::OutputRef {
            node: self.clone(),
            output: name.into(),
        }
    }

    /// File stem used by the file-backed state store.
    pub fn file_stem(&self) -> String {
        format!("{}.{}", self.kind, self.name)
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

impl FromStr for NodeKey {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = s.split_once('/').ok_or_else(|| UnknownKind(s.to_string()))?;
        Ok(NodeKey::new(kind.parse()?, name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Lifecycle {
    Pending,
    Blocked,
    Running,
    Settling,
    Settled,
    Failed,
    Skipped,
}

impl Lifecycle {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Lifecycle::Settled | Lifecycle::Failed | Lifecycle::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Pending => "pending",
            Lifecycle::Blocked => "blocked",
            Lifecycle::Running => "running",
            Lifecycle::Settling => "settling",
            Lifecycle::Settled => "settled",
            Lifecycle::Failed => "failed",
            Lifecycle::Skipped => "skipped",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Create,
    Update,
    NoOp,
    Destroy,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::NoOp => "no-op",
            Action::Destroy => "destroy",
        }
    }

    pub fn is_change(self) -> bool {
        !matches!(self, Action::NoOp)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Command {
    Preview,
    Apply,
    Destroy,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Command::Preview => "preview",
            Command::Apply => "apply",
            Command::Destroy => "destroy",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SHA-256 over a node key and its resolved inputs, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(key: &NodeKey, inputs: &ValueMap) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(key.kind.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(key.name.as_bytes());
        hasher.update([0]);
        // ValueMap and serde_json objects are both ordered maps, so the
        // encoding is canonical.
        for (name, value) in inputs {
            hasher.update(name.as_bytes());
            hasher.update([0]);
            hasher.update(value.to_string().as_bytes());
            hasher.update([0]);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First twelve hex digits, for summaries.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_round_trips_through_display() {
        for kind in ResourceKind::ALL {
            assert_eq!(kind.as_str().parse::<ResourceKind>().unwrap(), kind);
        }
        assert!("database".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn node_key_parses_kind_and_name() {
        let key: NodeKey = "mesh-control-plane/istiod".parse().unwrap();
        assert_eq!(key.kind, ResourceKind::MeshControlPlane);
        assert_eq!(key.name, "istiod");
        assert_eq!(key.to_string(), "mesh-control-plane/istiod");
        assert_eq!(key.file_stem(), "mesh-control-plane.istiod");
    }

    #[test]
    fn fingerprint_is_stable_and_input_sensitive() {
        let key = NodeKey::new(ResourceKind::Cluster, "main");
        let mut inputs = ValueMap::new();
        inputs.insert("version".into(), json!("1.31"));

        let a = Fingerprint::compute(&key, &inputs);
        let b = Fingerprint::compute(&key, &inputs);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);

        inputs.insert("version".into(), json!("1.32"));
        assert_ne!(a, Fingerprint::compute(&key, &inputs));

        let other = NodeKey::new(ResourceKind::Cluster, "other");
        assert_ne!(b, Fingerprint::compute(&other, &ValueMap::new()));
    }

    #[test]
    fn terminal_states() {
        assert!(Lifecycle::Settled.is_terminal());
        assert!(Lifecycle::Failed.is_terminal());
        assert!(Lifecycle::Skipped.is_terminal());
        assert!(!Lifecycle::Settling.is_terminal());
    }
}
