use super::{ConvergenceEngine, Tracker};
use crate::error::{ProviderError, StrataError};
use crate::plan::PlannedStep;
use crate::report::{NodeOutcome, RunReport};
use crate::state::StateRecord;
use crate::teardown::plan_destroy_with_failed;
use crate::types::{Action, Command, Lifecycle, NodeKey, RunId, ValueMap};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use tokio_util::sync::CancellationToken;

/// Execute a destroy plan one step at a time, dependents first. A failed
/// step keeps its record and does not stop later steps.
pub(super) async fn destroy(
    engine: &ConvergenceEngine,
    failed: &BTreeSet<NodeKey>,
    cancel: CancellationToken,
) -> Result<RunReport, StrataError> {
    let run_id = RunId::new();
    let started_at = Utc::now();
    let records = engine.store.records().await?;
    let mut unrecorded = failed.clone();
    unrecorded.extend(discover_unrecorded(engine, &records).await);
    let plan = plan_destroy_with_failed(&engine.graph, &records, &unrecorded);
    let keys = plan.keys();
    let _lease = engine.store.leases().acquire(run_id, &keys)?;
    tracing::info!(%run_id, steps = keys.len(), orphans = plan.orphans().len(), "destroy started");

    let tracker = Tracker::new(run_id, keys.iter().cloned());
    let mut outcomes = Vec::with_capacity(keys.len());

    for step in plan.steps() {
        if cancel.is_cancelled() {
            tracker.transition(&step.key, Lifecycle::Skipped, "cancelled")?;
            outcomes.push(NodeOutcome::cancelled(step.key.clone()));
            continue;
        }
        tracker.transition(&step.key, Lifecycle::Running, step.reason.clone())?;
        match destroy_step(engine, &tracker, step, &cancel).await {
            Ok(()) => {
                tracker.transition(&step.key, Lifecycle::Settled, "destroyed")?;
                outcomes.push(NodeOutcome::settled(step.key.clone(), Action::Destroy, Utc::now()));
            }
            Err(error) if error.is_fatal() => {
                tracing::error!(node = %step.key, %error, "fatal error, aborting destroy");
                return Err(error);
            }
            Err(error) => {
                tracker.transition(&step.key, Lifecycle::Failed, error.to_string())?;
                outcomes.push(NodeOutcome::failed(step.key.clone(), Some(Action::Destroy), &error));
            }
        }
    }

    let report = RunReport {
        run_id,
        command: Command::Destroy,
        started_at,
        finished_at: Utc::now(),
        outcomes,
        orphans: plan.orphans().to_vec(),
        journal: tracker.journal().entries(),
    };
    tracing::info!(%run_id, success = report.success(), "destroy finished");
    Ok(report)
}

/// Graph nodes without a record that the provider still reports. A create
/// that failed readiness leaves one behind, and later runs may have skipped
/// the node, so no single earlier report names it.
async fn discover_unrecorded(
    engine: &ConvergenceEngine,
    records: &BTreeMap<NodeKey, StateRecord>,
) -> BTreeSet<NodeKey> {
    let mut found = BTreeSet::new();
    for key in engine.graph.topological_order() {
        if records.contains_key(&key) {
            continue;
        }
        let present = match engine.providers.get(key.kind) {
            Ok(provider) => provider.exists(&key, &ValueMap::new()).await,
            Err(e) => {
                tracing::warn!(node = %key, error = %e, "no provider to check for leftovers");
                continue;
            }
        };
        match present {
            Ok(false) => {}
            Ok(true) => {
                tracing::info!(node = %key, "resource present without a record");
                found.insert(key);
            }
            // Deleting is harmless if it turns out to be gone.
            Err(e) => {
                tracing::warn!(node = %key, error = %e, "existence check failed, scheduling destroy");
                found.insert(key);
            }
        }
    }
    found
}

async fn destroy_step(
    engine: &ConvergenceEngine,
    tracker: &Tracker,
    step: &PlannedStep,
    cancel: &CancellationToken,
) -> Result<(), StrataError> {
    let key = &step.key;
    let provider = engine.providers.get(key.kind)?;
    match provider.destroy(key).await {
        Ok(()) | Err(ProviderError::NotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }
    tracker.transition(key, Lifecycle::Settling, "deletion requested")?;

    // Orphans have no descriptor left; fall back to the default budget.
    let policy = engine
        .graph
        .descriptor(key)
        .map(|d| d.readiness.policy().clone())
        .unwrap_or_default();
    engine
        .prober
        .wait_absent(key, &policy, provider.as_ref(), cancel)
        .await?;

    if let Some(record) = engine.store.load(key).await? {
        engine.store.remove(key, record.version).await?;
    }
    Ok(())
}
