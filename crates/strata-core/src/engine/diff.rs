use crate::error::StrataError;
use crate::graph::{DependencyGraph, EdgeOrigin};
use crate::plan::{ConvergencePlan, PlannedStep};
use crate::provider::{Provider, ProviderRegistry};
use crate::state::StateRecord;
use crate::types::{Action, Fingerprint, NodeKey};
use crate::wiring::resolve_with;
use std::collections::{BTreeMap, HashSet};

/// Action for a node whose resolved inputs hash to `fingerprint`.
///
/// A matching fingerprint is only a no-op if the provider still finds the
/// recorded resource; otherwise the node is re-applied to repair drift.
pub async fn decide(
    key: &NodeKey,
    fingerprint: &Fingerprint,
    prior: Option<&StateRecord>,
    provider: &dyn Provider,
) -> Result<(Action, &'static str), StrataError> {
    let Some(prior) = prior else {
        return Ok((Action::Create, "no record"));
    };
    if &prior.fingerprint != fingerprint {
        return Ok((Action::Update, "inputs changed"));
    }
    if provider.exists(key, &prior.outputs).await? {
        Ok((Action::NoOp, "up to date"))
    } else {
        tracing::warn!(node = %key, "recorded resource no longer exists");
        Ok((Action::Update, "drift: resource missing"))
    }
}

/// One pass over the graph in topological order against a records snapshot.
pub(crate) async fn compute_plan(
    graph: &DependencyGraph,
    records: &BTreeMap<NodeKey, StateRecord>,
    providers: &ProviderRegistry,
) -> Result<ConvergencePlan, StrataError> {
    let mut changing: HashSet<NodeKey> = HashSet::new();
    let mut steps = Vec::with_capacity(graph.len());

    for key in graph.topological_order() {
        let Some(descriptor) = graph.descriptor(&key) else {
            continue;
        };
        let prior = records.get(&key);
        let fallback = if prior.is_some() {
            Action::Update
        } else {
            Action::Create
        };

        let upstream_changes = graph
            .dependencies(&key)
            .iter()
            .any(|(dep, origin)| *origin == EdgeOrigin::Data && changing.contains(dep));

        let (action, reason) = if upstream_changes {
            (fallback, "upstream changes pending")
        } else {
            match resolve_with(&descriptor.inputs, |k| records.get(k).map(|r| &r.outputs)) {
                Some(inputs) => {
                    let fingerprint = Fingerprint::compute(&key, &inputs);
                    let provider = providers.get(key.kind)?;
                    decide(&key, &fingerprint, prior, provider.as_ref()).await?
                }
                // A recorded producer lacks the referenced output.
                None => (fallback, "upstream outputs unavailable"),
            }
        };

        if action.is_change() {
            changing.insert(key.clone());
        }
        steps.push(PlannedStep::new(key, action, reason));
    }

    let orphans = records
        .keys()
        .filter(|k| !graph.contains(k))
        .cloned()
        .collect();
    Ok(ConvergencePlan::new(steps, orphans))
}
