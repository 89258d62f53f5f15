//! Provider seam
//!
//! Providers are the external collaborators that actually create cloud
//! resources, Helm releases and manifests. The engine and the readiness
//! prober are their only callers.

use crate::error::ProviderError;
use crate::types::{Action, Fingerprint, NodeKey, ResourceKind, ValueMap};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Desired state handed to a provider
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub key: NodeKey,
    pub action: Action,
    /// Inputs with every output reference already resolved
    pub inputs: ValueMap,
    pub fingerprint: Fingerprint,
}

/// Provider acknowledgment of an apply; says nothing about readiness
#[derive(Debug, Clone, Default)]
pub struct Acknowledgment {
    pub outputs: ValueMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "kebab-case")]
pub enum ObservedStatus {
    Pending,
    Ready,
    Failed(String),
    Missing,
}

impl fmt::Display for ObservedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObservedStatus::Pending => f.write_str("pending"),
            ObservedStatus::Ready => f.write_str("ready"),
            ObservedStatus::Failed(reason) => write!(f, "failed ({reason})"),
            ObservedStatus::Missing => f.write_str("missing"),
        }
    }
}

/// A status condition as reported by the underlying system, e.g. a CRD's
/// `Established` or a node's `Ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub kind: String,
    pub status: bool,
}

impl Condition {
    pub fn new(kind: impl Into<String>, status: bool) -> Self {
        Self {
            kind: kind.into(),
            status,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub status: ObservedStatus,
    pub outputs: ValueMap,
    pub conditions: Vec<Condition>,
}

impl Observation {
    pub fn missing() -> Self {
        Self {
            status: ObservedStatus::Missing,
            outputs: ValueMap::new(),
            conditions: Vec::new(),
        }
    }

    /// Number of conditions of `kind` currently true
    pub fn true_conditions(&self, kind: &str) -> usize {
        self.conditions
            .iter()
            .filter(|c| c.kind == kind && c.status)
            .count()
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Submit desired state; returns once the request is acknowledged.
    async fn apply(&self, request: &ApplyRequest) -> Result<Acknowledgment, ProviderError>;

    /// Current status and outputs of a resource.
    async fn observe(&self, key: &NodeKey) -> Result<Observation, ProviderError>;

    /// Lightweight check that recorded outputs still describe a live resource.
    async fn exists(&self, key: &NodeKey, _outputs: &ValueMap) -> Result<bool, ProviderError> {
        let observation = self.observe(key).await?;
        Ok(observation.status != ObservedStatus::Missing)
    }

    /// Request deletion; completion is observed through `observe`.
    async fn destroy(&self, key: &NodeKey) -> Result<(), ProviderError>;
}

/// Maps resource kinds to providers
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    by_kind: HashMap<ResourceKind, Arc<dyn Provider>>,
    fallback: Option<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that routes every kind to one provider
    pub fn uniform(provider: Arc<dyn Provider>) -> Self {
        Self {
            by_kind: HashMap::new(),
            fallback: Some(provider),
        }
    }

    pub fn register(mut self, kind: ResourceKind, provider: Arc<dyn Provider>) -> Self {
        self.by_kind.insert(kind, provider);
        self
    }

    pub fn with_fallback(mut self, provider: Arc<dyn Provider>) -> Self {
        self.fallback = Some(provider);
        self
    }

    pub fn get(&self, kind: ResourceKind) -> Result<Arc<dyn Provider>, ProviderError> {
        self.by_kind
            .get(&kind)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or(ProviderError::NoProvider(kind))
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.by_kind.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("ProviderRegistry")
            .field("kinds", &kinds)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}
