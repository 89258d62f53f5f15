//! Strata Core - layered provisioning orchestrator
//!
//! Converges a declarative topology of provisionable resources in
//! dependency order:
//! 1. **Construction**: descriptors are validated and assembled into an
//!    immutable [`DependencyGraph`] (cycles and dangling references are
//!    rejected before any external call).
//! 2. **Convergence**: the [`ConvergenceEngine`] diffs desired against
//!    recorded state, drives providers, waits for readiness and commits
//!    settled state.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use strata_core::prelude::*;
//!
//! let network = ResourceDescriptor::builder(ResourceKind::Network, "vpc")
//!     .input("cidr_block", "10.0.0.0/16")
//!     .build()?;
//! let cluster = ResourceDescriptor::builder(ResourceKind::Cluster, "main")
//!     .input("version", "1.31")
//!     .input_ref("vpc_id", network.key.output("vpc_id"))
//!     .build()?;
//!
//! let graph = Arc::new(graph::build([network, cluster])?);
//! let engine = ConvergenceEngine::new(graph, store, providers);
//! let report = engine.apply(CancellationToken::new()).await?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod descriptor;
pub mod engine;
pub mod error;
pub mod graph;
pub mod journal;
pub mod plan;
pub mod probe;
pub mod provider;
pub mod report;
pub mod simulator;
pub mod state;
pub mod state_machine;
pub mod teardown;
pub mod types;
pub mod wiring;

pub use descriptor::{DescriptorBuilder, HelmRelease, InputValue, OutputRef, ResourceDescriptor};
pub use engine::{ConvergenceEngine, EngineConfig};
pub use error::{
    ConfigurationError, ErrorClass, JournalError, ProbeError, ProviderError, StateError,
    StrataError, TransitionError, WiringError,
};
pub use graph::{DependencyGraph, EdgeOrigin, GraphBuilder};
pub use plan::{ConvergencePlan, PlannedStep};
pub use report::{NodeOutcome, RunReport};
pub use types::{
    Action, Command, Fingerprint, Lifecycle, NodeKey, ResourceKind, RunId, ValueMap,
};

/// Common imports for building and converging topologies
pub mod prelude {
    pub use crate::descriptor::{HelmRelease, InputValue, OutputRef, ResourceDescriptor};
    pub use crate::engine::{ConvergenceEngine, EngineConfig};
    pub use crate::error::{ErrorClass, StrataError};
    pub use crate::graph::{self, DependencyGraph};
    pub use crate::probe::{CallbackHub, ProbePolicy, ReadinessSignal, ReadyPredicate};
    pub use crate::provider::{Provider, ProviderRegistry};
    pub use crate::report::RunReport;
    pub use crate::state::{FileStateStore, MemoryStateStore, StateRecord, StateStore};
    pub use crate::types::{Action, Lifecycle, NodeKey, ResourceKind};
    pub use std::sync::Arc;
    pub use tokio_util::sync::CancellationToken;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
