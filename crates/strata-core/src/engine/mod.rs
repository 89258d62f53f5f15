//! Convergence Engine
//!
//! Walks the dependency graph, diffs desired against recorded state, drives
//! providers and waits for readiness before committing state and releasing
//! dependents.
//!
//! # Guarantees
//!
//! - A node enters `Running` only after every dependency is `Settled`
//! - Outputs are read only from settled producers
//! - State is committed only after both the action and the probe succeed
//! - Independent branches run concurrently, bounded by
//!   [`EngineConfig::max_parallel`]

mod destroy;
mod diff;
mod run;

use crate::error::{StrataError, TransitionError};
use crate::graph::DependencyGraph;
use crate::journal::Journal;
use crate::plan::ConvergencePlan;
use crate::probe::{CallbackHub, ReadinessProber};
use crate::provider::ProviderRegistry;
use crate::report::RunReport;
use crate::state::StateStore;
use crate::state_machine::validate_transition;
use crate::types::{Lifecycle, NodeKey, RunId};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use diff::decide;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on nodes in `Running` or `Settling` at once
    pub max_parallel: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_parallel: 8 }
    }
}

#[derive(Debug, Clone)]
pub struct ConvergenceEngine {
    graph: Arc<DependencyGraph>,
    store: Arc<dyn StateStore>,
    providers: ProviderRegistry,
    prober: Arc<ReadinessProber>,
    config: EngineConfig,
}

impl ConvergenceEngine {
    pub fn new(
        graph: Arc<DependencyGraph>,
        store: Arc<dyn StateStore>,
        providers: ProviderRegistry,
    ) -> Self {
        Self {
            graph,
            store,
            providers,
            prober: Arc::new(ReadinessProber::default()),
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a callback hub with whatever receives readiness webhooks.
    pub fn with_callbacks(mut self, callbacks: Arc<CallbackHub>) -> Self {
        self.prober = Arc::new(ReadinessProber::new(callbacks));
        self
    }

    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn callbacks(&self) -> &Arc<CallbackHub> {
        self.prober.callbacks()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Compute the plan without side effects.
    ///
    /// References are resolved against recorded producer outputs; a consumer
    /// of a producer that will change is reported as changing too.
    pub async fn preview(&self) -> Result<ConvergencePlan, StrataError> {
        let records = self.store.records().await?;
        diff::compute_plan(&self.graph, &records, &self.providers).await
    }

    /// Converge every node. Node failures are reported in the [`RunReport`];
    /// state conflicts and ordering violations abort the run with an error.
    pub async fn apply(&self, cancel: CancellationToken) -> Result<RunReport, StrataError> {
        run::apply(self, cancel).await
    }

    /// Destroy every recorded node, dependents first.
    pub async fn destroy(&self, cancel: CancellationToken) -> Result<RunReport, StrataError> {
        destroy::destroy(self, &BTreeSet::new(), cancel).await
    }

    /// Like [`Self::destroy`], also visiting nodes that failed in `previous`.
    pub async fn destroy_after(
        &self,
        previous: &RunReport,
        cancel: CancellationToken,
    ) -> Result<RunReport, StrataError> {
        let failed: BTreeSet<NodeKey> = previous.failed().map(|o| o.key.clone()).collect();
        destroy::destroy(self, &failed, cancel).await
    }
}

/// Current lifecycle of every node in a run; every change is validated and
/// journaled under one lock so the journal order matches the state order.
#[derive(Debug)]
pub(crate) struct Tracker {
    states: Mutex<HashMap<NodeKey, Lifecycle>>,
    journal: Journal,
}

impl Tracker {
    pub(crate) fn new(run_id: RunId, keys: impl IntoIterator<Item = NodeKey>) -> Self {
        Self {
            states: Mutex::new(keys.into_iter().map(|k| (k, Lifecycle::Pending)).collect()),
            journal: Journal::new(run_id),
        }
    }

    pub(crate) fn state(&self, key: &NodeKey) -> Lifecycle {
        self.states
            .lock()
            .get(key)
            .copied()
            .unwrap_or(Lifecycle::Pending)
    }

    pub(crate) fn transition(
        &self,
        key: &NodeKey,
        to: Lifecycle,
        detail: impl Into<String>,
    ) -> Result<(), TransitionError> {
        let mut states = self.states.lock();
        let from = states.get(key).copied().unwrap_or(Lifecycle::Pending);
        validate_transition(key, from, to)?;
        let detail = detail.into();
        match to {
            Lifecycle::Failed => tracing::error!(node = %key, %from, %detail, "node failed"),
            Lifecycle::Skipped => tracing::warn!(node = %key, %from, %detail, "node skipped"),
            _ => tracing::info!(node = %key, %from, %to, %detail, "transition"),
        }
        self.journal.append(key, from, to, detail);
        states.insert(key.clone(), to);
        Ok(())
    }

    pub(crate) fn journal(&self) -> &Journal {
        &self.journal
    }
}
