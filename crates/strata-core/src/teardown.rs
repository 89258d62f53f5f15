//! Teardown planning
//!
//! Destroy plans visit dependents before their dependencies: the strict
//! reverse of the graph's topological order, restricted to nodes that hold
//! a state record. Orphaned records come first; nothing in the current
//! topology can depend on them.

use crate::graph::DependencyGraph;
use crate::plan::{ConvergencePlan, PlannedStep};
use crate::state::StateRecord;
use crate::types::{Action, NodeKey};
use std::collections::{BTreeMap, BTreeSet};

pub fn plan_destroy(
    graph: &DependencyGraph,
    records: &BTreeMap<NodeKey, StateRecord>,
) -> ConvergencePlan {
    plan_destroy_with_failed(graph, records, &BTreeSet::new())
}

/// Also destroys the `unrecorded` nodes: a failed create may leave a partial
/// resource behind without a record, in an earlier run or in any run before.
pub fn plan_destroy_with_failed(
    graph: &DependencyGraph,
    records: &BTreeMap<NodeKey, StateRecord>,
    failed: &BTreeSet<NodeKey>,
) -> ConvergencePlan {
    let orphans: Vec<NodeKey> = records
        .keys()
        .filter(|k| !graph.contains(k))
        .cloned()
        .collect();

    let mut steps: Vec<PlannedStep> = orphans
        .iter()
        .map(|k| PlannedStep::new(k.clone(), Action::Destroy, "orphaned record"))
        .collect();

    for key in graph.topological_order().into_iter().rev() {
        if records.contains_key(&key) {
            steps.push(PlannedStep::new(key, Action::Destroy, "recorded"));
        } else if failed.contains(&key) {
            steps.push(PlannedStep::new(key, Action::Destroy, "present without a record"));
        }
    }

    ConvergencePlan::new(steps, orphans)
}
