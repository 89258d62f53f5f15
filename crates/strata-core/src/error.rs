//! Error types for Strata Core
//!
//! Each component owns a small error enum; [`StrataError`] folds them into
//! the run-level taxonomy:
//! - configuration errors abort before any side effect
//! - provider and readiness errors are contained to their subgraph
//! - state conflicts abort the run without mutating state
//! - ordering violations are engine bugs and always fatal

use crate::types::{Lifecycle, NodeKey, ResourceKind, RunId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn render_path(path: &[NodeKey]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Invalid topology, detected before convergence starts
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("dependency cycle: {}", render_path(.path))]
    Cycle { path: Vec<NodeKey> },

    #[error("unresolved reference `{reference}` declared by {from}")]
    UnresolvedReference { from: NodeKey, reference: String },

    #[error("duplicate node {0}")]
    DuplicateNode(NodeKey),

    #[error("invalid descriptor {key}: {reason}")]
    InvalidDescriptor { key: NodeKey, reason: String },

    #[error("{0}")]
    Invalid(String),
}

/// Errors reported by an external provider
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("{key}: request rejected: {reason}")]
    Rejected { key: NodeKey, reason: String },

    #[error("{key}: transient failure: {reason}")]
    Transient { key: NodeKey, reason: String },

    #[error("{0} not found")]
    NotFound(NodeKey),

    #[error("no provider registered for kind {0}")]
    NoProvider(ResourceKind),
}

impl ProviderError {
    /// Worth retrying within the same readiness budget
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::NotFound(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("readiness timed out after {elapsed_ms}ms (last error: {})", .last_error.as_deref().unwrap_or("none"))]
    Timeout {
        elapsed_ms: u64,
        last_error: Option<String>,
    },

    #[error("resource reported failure: {0}")]
    Negative(String),

    #[error("readiness probe cancelled")]
    Cancelled,

    #[error("invalid readiness signal: {0}")]
    InvalidSignal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("version conflict on {key}: expected {expected:?}, found {found:?}")]
    Conflict {
        key: NodeKey,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("{key} is leased by run {holder}")]
    Locked { key: NodeKey, holder: RunId },

    /// Another process holds the lock file; remove it if no run is active.
    #[error("{key} is locked by another process ({})", .path.display())]
    LockedOnDisk { key: NodeKey, path: PathBuf },

    #[error("state i/o on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt state record {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StateError {
    #[inline]
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::Locked { .. } | Self::LockedOnDisk { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WiringError {
    #[error("{reference} read before {producer} settled")]
    OrderingViolation { producer: NodeKey, reference: String },

    #[error("{producer} settled without output `{output}`")]
    MissingOutput { producer: NodeKey, output: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition for {key}: {from} -> {to}")]
pub struct TransitionError {
    pub key: NodeKey,
    pub from: Lifecycle,
    pub to: Lifecycle,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JournalError {
    #[error("journal integrity violation at entry {seq}")]
    IntegrityViolation { seq: u64 },
}

/// Run-level error classification, reported per node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    Configuration,
    ProviderAction,
    ReadinessTimeout,
    StateConflict,
    OrderingViolation,
    Cancelled,
}

/// Main Strata error type
#[derive(Debug, thiserror::Error)]
pub enum StrataError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("provider action failed: {0}")]
    ProviderAction(#[from] ProviderError),

    #[error("readiness failed: {0}")]
    Readiness(#[from] ProbeError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("output wiring: {0}")]
    Wiring(#[from] WiringError),

    #[error("internal error: {0}")]
    Transition(#[from] TransitionError),

    #[error("run cancelled")]
    Cancelled,
}

impl StrataError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Configuration(_) => ErrorClass::Configuration,
            Self::ProviderAction(_) => ErrorClass::ProviderAction,
            Self::Readiness(ProbeError::Cancelled) | Self::Cancelled => ErrorClass::Cancelled,
            Self::Readiness(ProbeError::Negative(_)) => ErrorClass::ProviderAction,
            Self::Readiness(_) => ErrorClass::ReadinessTimeout,
            Self::State(e) if e.is_conflict() => ErrorClass::StateConflict,
            Self::State(_) => ErrorClass::ProviderAction,
            Self::Wiring(WiringError::MissingOutput { .. }) => ErrorClass::ProviderAction,
            Self::Wiring(WiringError::OrderingViolation { .. }) | Self::Transition(_) => {
                ErrorClass::OrderingViolation
            }
        }
    }

    /// Re-running `apply` after this error cannot corrupt state.
    ///
    /// Configuration errors need an input fix first and ordering violations
    /// are engine bugs; everything else converges on the next run.
    #[inline]
    #[must_use]
    pub fn is_retry_safe(&self) -> bool {
        !matches!(
            self.class(),
            ErrorClass::Configuration | ErrorClass::OrderingViolation
        )
    }

    /// Aborts the whole run rather than a single subgraph
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::StateConflict | ErrorClass::OrderingViolation
        )
    }
}
