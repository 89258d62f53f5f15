use super::{diff, ConvergenceEngine, Tracker};
use crate::descriptor::ResourceDescriptor;
use crate::error::{ErrorClass, StrataError};
use crate::graph::{DependencyGraph, EdgeOrigin};
use crate::probe::{ReadinessProber, ReadinessSignal};
use crate::provider::{ApplyRequest, ProviderRegistry};
use crate::report::{NodeOutcome, RunReport};
use crate::state::{StateRecord, StateStore};
use crate::types::{Action, Command, Fingerprint, Lifecycle, NodeKey, RunId};
use crate::wiring::OutputWiring;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Shared, read-mostly context handed to every node task
struct RunContext {
    store: Arc<dyn StateStore>,
    providers: ProviderRegistry,
    prober: Arc<ReadinessProber>,
    wiring: OutputWiring,
    tracker: Tracker,
}

/// A node task's failure: the action it got to, if any, and the cause
struct NodeFailure {
    action: Option<Action>,
    error: StrataError,
}

/// Failure before an action was chosen
fn early(error: impl Into<StrataError>) -> NodeFailure {
    NodeFailure {
        action: None,
        error: error.into(),
    }
}

struct Scheduler<'g> {
    graph: &'g DependencyGraph,
    /// Unsettled dependencies per waiting node
    waiting_on: HashMap<NodeKey, usize>,
    ready: VecDeque<NodeKey>,
    outcomes: HashMap<NodeKey, NodeOutcome>,
}

impl<'g> Scheduler<'g> {
    fn new(graph: &'g DependencyGraph, tracker: &Tracker) -> Result<Self, StrataError> {
        let mut waiting_on = HashMap::new();
        let mut ready = VecDeque::new();
        for key in graph.topological_order() {
            let deps = graph.dependencies(&key).len();
            if deps == 0 {
                ready.push_back(key);
            } else {
                tracker.transition(&key, Lifecycle::Blocked, format!("waiting on {deps} dependencies"))?;
                waiting_on.insert(key, deps);
            }
        }
        Ok(Self {
            graph,
            waiting_on,
            ready,
            outcomes: HashMap::new(),
        })
    }

    /// One dependency of `key` no longer holds it back.
    fn release(&mut self, key: &NodeKey, tracker: &Tracker) {
        if let Some(count) = self.waiting_on.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.waiting_on.remove(key);
                if !tracker.state(key).is_terminal() {
                    self.ready.push_back(key.clone());
                }
            }
        }
    }

    fn on_settled(&mut self, key: &NodeKey, tracker: &Tracker) {
        for (dependent, _) in self.graph.dependents(key) {
            self.release(&dependent, tracker);
        }
    }

    /// Skip what can no longer run because `key` failed.
    fn on_failed(&mut self, key: &NodeKey, tracker: &Tracker) -> Result<(), StrataError> {
        let fault_tolerant = self
            .graph
            .descriptor(key)
            .is_some_and(|d| d.fault_tolerant);

        let mut doomed = Vec::new();
        for (dependent, origin) in self.graph.dependents(key) {
            if fault_tolerant && origin == EdgeOrigin::Explicit {
                tracing::warn!(node = %dependent, failed = %key, "continuing past fault-tolerant failure");
                self.release(&dependent, tracker);
            } else {
                doomed.push(dependent);
            }
        }

        let reason = format!("upstream {key} failed");
        for root in doomed {
            let mut affected = self.graph.descendants(&root);
            affected.insert(root);
            for node in affected {
                if matches!(tracker.state(&node), Lifecycle::Pending | Lifecycle::Blocked) {
                    tracker.transition(&node, Lifecycle::Skipped, reason.clone())?;
                    self.waiting_on.remove(&node);
                    self.outcomes
                        .insert(node.clone(), NodeOutcome::skipped(node, reason.clone()));
                }
            }
        }
        self.ready.retain(|k| !tracker.state(k).is_terminal());
        Ok(())
    }
}

pub(super) async fn apply(
    engine: &ConvergenceEngine,
    cancel: CancellationToken,
) -> Result<RunReport, StrataError> {
    let run_id = RunId::new();
    let started_at = Utc::now();
    let graph = engine.graph.as_ref();
    let keys = graph.topological_order();

    let _lease = engine.store.leases().acquire(run_id, &keys)?;
    let records = engine.store.records().await?;
    let plan = diff::compute_plan(graph, &records, &engine.providers).await?;
    tracing::info!(
        %run_id,
        nodes = graph.len(),
        changes = plan.steps().iter().filter(|s| s.action.is_change()).count(),
        orphans = plan.orphans().len(),
        "apply started"
    );

    let ctx = Arc::new(RunContext {
        store: Arc::clone(&engine.store),
        providers: engine.providers.clone(),
        prober: Arc::clone(&engine.prober),
        wiring: OutputWiring::new(),
        tracker: Tracker::new(run_id, keys.iter().cloned()),
    });

    // Fatal errors stop every in-flight task, not just scheduling.
    let abort = cancel.child_token();
    let mut scheduler = Scheduler::new(graph, &ctx.tracker)?;
    let mut tasks: JoinSet<(NodeKey, Result<NodeOutcome, NodeFailure>)> = JoinSet::new();
    let mut fatal: Option<StrataError> = None;
    let max_parallel = engine.config.max_parallel.max(1);

    loop {
        let stopped = cancel.is_cancelled() || fatal.is_some();
        while !stopped && tasks.len() < max_parallel {
            let Some(key) = scheduler.ready.pop_front() else {
                break;
            };
            let Some(descriptor) = graph.descriptor(&key).cloned() else {
                continue;
            };
            let planned = plan.action(&key).map_or("-", |a| a.as_str());
            ctx.tracker
                .transition(&key, Lifecycle::Running, format!("planned {planned}"))?;
            let ctx = Arc::clone(&ctx);
            let token = abort.clone();
            tasks.spawn(async move {
                let result = converge_node(&ctx, &descriptor, &token).await;
                (descriptor.key, result)
            });
        }

        if tasks.is_empty() {
            break;
        }

        let joined = tokio::select! {
            joined = tasks.join_next() => joined,
            _ = cancel.cancelled(), if !stopped => continue,
        };
        let Some(joined) = joined else { break };
        let (key, result) = match joined {
            Ok(done) => done,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => {
                tracing::error!(error = %e, "node task aborted");
                continue;
            }
        };

        match result {
            Ok(outcome) => {
                scheduler.outcomes.insert(key.clone(), outcome);
                scheduler.on_settled(&key, &ctx.tracker);
            }
            Err(NodeFailure { action, error }) => {
                ctx.tracker
                    .transition(&key, Lifecycle::Failed, error.to_string())?;
                scheduler
                    .outcomes
                    .insert(key.clone(), NodeOutcome::failed(key.clone(), action, &error));
                if error.is_fatal() {
                    tracing::error!(node = %key, error = %error, "fatal error, aborting run");
                    abort.cancel();
                    fatal.get_or_insert(error);
                } else if error.class() != ErrorClass::Cancelled {
                    scheduler.on_failed(&key, &ctx.tracker)?;
                }
            }
        }
    }

    if let Some(error) = fatal {
        return Err(error);
    }

    // Anything still waiting never started.
    for key in &keys {
        if !ctx.tracker.state(key).is_terminal() {
            ctx.tracker.transition(key, Lifecycle::Skipped, "cancelled")?;
            scheduler
                .outcomes
                .insert(key.clone(), NodeOutcome::cancelled(key.clone()));
        }
    }

    let mut outcomes = scheduler.outcomes;
    let report = RunReport {
        run_id,
        command: Command::Apply,
        started_at,
        finished_at: Utc::now(),
        outcomes: keys.iter().filter_map(|k| outcomes.remove(k)).collect(),
        orphans: plan.orphans().to_vec(),
        journal: ctx.tracker.journal().entries(),
    };
    tracing::info!(
        %run_id,
        success = report.success(),
        settled = report.count(Lifecycle::Settled),
        failed = report.count(Lifecycle::Failed),
        skipped = report.count(Lifecycle::Skipped),
        "apply finished"
    );
    Ok(report)
}

/// Running -> Settling -> Settled for one node. The caller records the
/// `Failed` transition on error.
async fn converge_node(
    ctx: &RunContext,
    descriptor: &ResourceDescriptor,
    cancel: &CancellationToken,
) -> Result<NodeOutcome, NodeFailure> {
    let key = &descriptor.key;
    let inputs = ctx.wiring.materialize(&descriptor.inputs).map_err(early)?;
    let fingerprint = Fingerprint::compute(key, &inputs);
    let provider = ctx.providers.get(key.kind).map_err(early)?;
    let prior = ctx.store.load(key).await.map_err(early)?;
    let (action, reason) = diff::decide(key, &fingerprint, prior.as_ref(), provider.as_ref())
        .await
        .map_err(early)?;
    let fail = |error: StrataError| NodeFailure {
        action: Some(action),
        error,
    };

    let mut outputs = match (action, &prior) {
        (Action::NoOp, Some(prior)) => {
            ctx.tracker
                .transition(key, Lifecycle::Settling, reason)
                .map_err(|e| fail(e.into()))?;
            prior.outputs.clone()
        }
        _ => {
            tracing::info!(node = %key, %action, fingerprint = fingerprint.short(), reason, "applying");
            let request = ApplyRequest {
                key: key.clone(),
                action,
                inputs,
                fingerprint: fingerprint.clone(),
            };
            let ack = provider
                .apply(&request)
                .await
                .map_err(|e| fail(e.into()))?;
            ctx.tracker
                .transition(key, Lifecycle::Settling, format!("{action} acknowledged"))
                .map_err(|e| fail(e.into()))?;
            ack.outputs
        }
    };

    // Event-driven signals fired once already when the node was created.
    let revalidate = !matches!(
        descriptor.readiness,
        ReadinessSignal::Callback { .. } | ReadinessSignal::FixedDelay { .. }
    );
    if action.is_change() || revalidate {
        let observed = ctx
            .prober
            .probe(key, &descriptor.readiness, provider.as_ref(), cancel)
            .await
            .map_err(|e| fail(e.into()))?;
        outputs.extend(observed);
    }

    // Readiness passed. The record is written while the journal still says
    // Settling: Settled is terminal, so a failed commit must still be able to
    // fail the node, and nothing is published before the commit lands.
    let settled_at = Utc::now();
    let unchanged = prior.as_ref().is_some_and(|p| p.outputs == outputs);
    if action == Action::NoOp && unchanged {
        tracing::debug!(node = %key, "outputs unchanged, commit skipped");
    } else {
        let expected = prior.as_ref().map(|p| p.version);
        let mut record = StateRecord::new(key.clone(), fingerprint, outputs.clone());
        record.settled_at = settled_at;
        ctx.store
            .commit(record, expected)
            .await
            .map_err(|e| fail(e.into()))?;
    }

    ctx.wiring.publish(key.clone(), outputs);
    ctx.tracker
        .transition(key, Lifecycle::Settled, format!("{action} settled"))
        .map_err(|e| fail(e.into()))?;
    Ok(NodeOutcome::settled(key.clone(), action, settled_at))
}
