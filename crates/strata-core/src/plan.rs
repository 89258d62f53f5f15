//! Convergence plans
//!
//! A plan is computed once per run from a single traversal and then shared
//! read-only; execution never mutates it.

use crate::types::{Action, NodeKey};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub key: NodeKey,
    pub action: Action,
    pub reason: String,
}

impl PlannedStep {
    pub fn new(key: NodeKey, action: Action, reason: impl Into<String>) -> Self {
        Self {
            key,
            action,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergencePlan {
    steps: Arc<[PlannedStep]>,
    orphans: Arc<[NodeKey]>,
}

impl ConvergencePlan {
    pub fn new(steps: Vec<PlannedStep>, orphans: Vec<NodeKey>) -> Self {
        Self {
            steps: steps.into(),
            orphans: orphans.into(),
        }
    }

    pub fn steps(&self) -> &[PlannedStep] {
        &self.steps
    }

    /// Recorded nodes no longer present in the topology
    pub fn orphans(&self) -> &[NodeKey] {
        &self.orphans
    }

    pub fn step(&self, key: &NodeKey) -> Option<&PlannedStep> {
        self.steps.iter().find(|s| &s.key == key)
    }

    pub fn action(&self, key: &NodeKey) -> Option<Action> {
        self.step(key).map(|s| s.action)
    }

    /// `(key, action)` pairs in plan order
    pub fn actions(&self) -> Vec<(NodeKey, Action)> {
        self.steps
            .iter()
            .map(|s| (s.key.clone(), s.action))
            .collect()
    }

    pub fn keys(&self) -> Vec<NodeKey> {
        self.steps.iter().map(|s| s.key.clone()).collect()
    }

    pub fn count(&self, action: Action) -> usize {
        self.steps.iter().filter(|s| s.action == action).count()
    }

    pub fn has_changes(&self) -> bool {
        self.steps.iter().any(|s| s.action.is_change())
    }

    pub fn render_text(&self) -> String {
        let width = self
            .steps
            .iter()
            .map(|s| s.key.to_string().len())
            .max()
            .unwrap_or(4)
            .max(4);
        let mut out = String::new();
        let _ = writeln!(out, "{:<width$}  {:<8}  REASON", "NODE", "ACTION");
        for step in self.steps.iter() {
            let _ = writeln!(
                out,
                "{:<width$}  {:<8}  {}",
                step.key.to_string(),
                step.action.as_str(),
                step.reason
            );
        }
        for orphan in self.orphans.iter() {
            let _ = writeln!(out, "{:<width$}  {:<8}  orphaned record", orphan.to_string(), "-");
        }
        let _ = write!(
            out,
            "{} to create, {} to update, {} unchanged, {} to destroy",
            self.count(Action::Create),
            self.count(Action::Update),
            self.count(Action::NoOp),
            self.count(Action::Destroy)
        );
        out
    }
}

impl Serialize for ConvergencePlan {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("ConvergencePlan", 2)?;
        s.serialize_field("steps", &*self.steps)?;
        s.serialize_field("orphans", &*self.orphans)?;
        s.end()
    }
}
