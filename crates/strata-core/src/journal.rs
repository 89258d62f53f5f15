//! Run journal
//!
//! Append-only, hash-chained record of every lifecycle transition in a run.
//! Sequence numbers give a total order across concurrently running nodes.

use crate::error::JournalError;
use crate::types::{Lifecycle, NodeKey, RunId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub run_id: RunId,
    pub node: NodeKey,
    pub from: Lifecycle,
    pub to: Lifecycle,
    pub detail: String,
    pub prev_hash: [u8; 32],
    pub hash: [u8; 32],
}

#[derive(Debug)]
pub struct Journal {
    run_id: RunId,
    inner: Mutex<Vec<JournalEntry>>,
}

impl Journal {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            inner: Mutex::new(Vec::new()),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn append(
        &self,
        node: &NodeKey,
        from: Lifecycle,
        to: Lifecycle,
        detail: impl Into<String>,
    ) -> u64 {
        let mut guard = self.inner.lock();
        let prev_hash = guard.last().map(|e| e.hash).unwrap_or([0u8; 32]);
        let mut entry = JournalEntry {
            seq: guard.len() as u64,
            timestamp: Utc::now(),
            run_id: self.run_id,
            node: node.clone(),
            from,
            to,
            detail: detail.into(),
            prev_hash,
            hash: [0u8; 32],
        };
        entry.hash = compute_hash(&entry);
        let seq = entry.seq;
        guard.push(entry);
        seq
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.inner.lock().clone()
    }

    /// First entry moving `node` into `state`
    pub fn first_transition(&self, node: &NodeKey, state: Lifecycle) -> Option<JournalEntry> {
        self.inner
            .lock()
            .iter()
            .find(|e| &e.node == node && e.to == state)
            .cloned()
    }

    pub fn verify_integrity(&self) -> Result<(), JournalError> {
        verify_chain(&self.inner.lock())
    }
}

/// Verify a chain of entries, e.g. one loaded from a serialized report.
pub fn verify_chain(entries: &[JournalEntry]) -> Result<(), JournalError> {
    let mut prev = [0u8; 32];
    for e in entries {
        if e.prev_hash != prev || e.hash != compute_hash(e) {
            return Err(JournalError::IntegrityViolation { seq: e.seq });
        }
        prev = e.hash;
    }
    Ok(())
}

fn compute_hash(entry: &JournalEntry) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(entry.seq.to_le_bytes());
    hasher.update(entry.timestamp.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    hasher.update(entry.run_id.0.as_bytes());
    hasher.update(entry.node.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(entry.from.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(entry.to.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(entry.detail.as_bytes());
    hasher.update([0]);
    hasher.update(entry.prev_hash);
    hasher.finalize().into()
}
