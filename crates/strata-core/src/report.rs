//! Run reports
//!
//! Per-node outcome of a `preview`, `apply` or `destroy` run, renderable as a
//! text table or JSON.

use crate::error::{ErrorClass, StrataError};
use crate::journal::JournalEntry;
use crate::types::{Action, Command, Lifecycle, NodeKey, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutcome {
    pub key: NodeKey,
    pub state: Lifecycle,
    /// Action actually executed; `None` if the node never ran
    pub action: Option<Action>,
    pub error: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub retry_safe: bool,
    pub settled_at: Option<DateTime<Utc>>,
}

impl NodeOutcome {
    pub fn settled(key: NodeKey, action: Action, settled_at: DateTime<Utc>) -> Self {
        Self {
            key,
            state: Lifecycle::Settled,
            action: Some(action),
            error: None,
            error_class: None,
            retry_safe: true,
            settled_at: Some(settled_at),
        }
    }

    pub fn failed(key: NodeKey, action: Option<Action>, error: &StrataError) -> Self {
        Self {
            key,
            state: Lifecycle::Failed,
            action,
            error: Some(error.to_string()),
            error_class: Some(error.class()),
            retry_safe: error.is_retry_safe(),
            settled_at: None,
        }
    }

    pub fn skipped(key: NodeKey, reason: impl Into<String>) -> Self {
        Self {
            key,
            state: Lifecycle::Skipped,
            action: None,
            error: Some(reason.into()),
            error_class: None,
            retry_safe: true,
            settled_at: None,
        }
    }

    /// Marks a skip caused by cancellation rather than an upstream failure.
    pub fn cancelled(key: NodeKey) -> Self {
        Self {
            error_class: Some(ErrorClass::Cancelled),
            ..Self::skipped(key, "cancelled")
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub command: Command,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// In plan order
    pub outcomes: Vec<NodeOutcome>,
    pub orphans: Vec<NodeKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub journal: Vec<JournalEntry>,
}

impl RunReport {
    /// Every node settled
    pub fn success(&self) -> bool {
        self.outcomes.iter().all(|o| o.state == Lifecycle::Settled)
    }

    pub fn outcome(&self, key: &NodeKey) -> Option<&NodeOutcome> {
        self.outcomes.iter().find(|o| &o.key == key)
    }

    pub fn state_of(&self, key: &NodeKey) -> Option<Lifecycle> {
        self.outcome(key).map(|o| o.state)
    }

    pub fn count(&self, state: Lifecycle) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &NodeOutcome> + '_ {
        self.outcomes
            .iter()
            .filter(|o| o.state == Lifecycle::Failed)
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    pub fn generate_text(&self) -> String {
        let width = self
            .outcomes
            .iter()
            .map(|o| o.key.to_string().len())
            .max()
            .unwrap_or(4)
            .max(4);

        let mut out = String::new();
        let _ = writeln!(out, "{} run {}", self.command, self.run_id);
        let _ = writeln!(out, "{:<width$}  {:<8}  {:<7}  DETAIL", "NODE", "STATE", "ACTION");
        for o in &self.outcomes {
            let detail = match (&o.error, o.error_class) {
                (Some(err), Some(class)) if class != ErrorClass::Cancelled => {
                    let retry = if o.retry_safe { "retry-safe" } else { "fix required" };
                    format!("[{}] {err} ({retry})", class_label(class))
                }
                (Some(err), _) => err.clone(),
                (None, _) => String::new(),
            };
            let _ = writeln!(
                out,
                "{:<width$}  {:<8}  {:<7}  {}",
                o.key.to_string(),
                o.state.as_str(),
                o.action.map(Action::as_str).unwrap_or("-"),
                detail
            );
        }
        for orphan in &self.orphans {
            let _ = writeln!(out, "{:<width$}  {:<8}  {:<7}  orphaned record", orphan.to_string(), "-", "-");
        }
        let _ = write!(
            out,
            "{}: {} settled, {} failed, {} skipped in {}ms",
            if self.success() { "SUCCESS" } else { "FAILED" },
            self.count(Lifecycle::Settled),
            self.count(Lifecycle::Failed),
            self.count(Lifecycle::Skipped),
            self.duration().num_milliseconds()
        );
        out
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn class_label(class: ErrorClass) -> &'static str {
    match class {
        ErrorClass::Configuration => "configuration",
        ErrorClass::ProviderAction => "provider",
        ErrorClass::ReadinessTimeout => "readiness-timeout",
        ErrorClass::StateConflict => "state-conflict",
        ErrorClass::OrderingViolation => "ordering",
        ErrorClass::Cancelled => "cancelled",
    }
}
