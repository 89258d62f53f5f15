//! State Store
//!
//! Durable record of the last applied fingerprint and observed outputs per
//! node. The store is the only shared mutable resource of a run; every write
//! goes through [`StateStore::commit`] with the version the writer last saw.

mod file;
mod memory;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;

use crate::error::StateError;
use crate::types::{Fingerprint, NodeKey, RunId, ValueMap};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub key: NodeKey,
    pub fingerprint: Fingerprint,
    pub outputs: ValueMap,
    pub settled_at: DateTime<Utc>,
    /// Optimistic concurrency token; 1 after the first commit
    #[serde(default)]
    pub version: u64,
}

impl StateRecord {
    pub fn new(key: NodeKey, fingerprint: Fingerprint, outputs: ValueMap) -> Self {
        Self {
            key,
            fingerprint,
            outputs,
            settled_at: Utc::now(),
            version: 0,
        }
    }
}

#[async_trait]
pub trait StateStore: Send + Sync + std::fmt::Debug {
    async fn load(&self, key: &NodeKey) -> Result<Option<StateRecord>, StateError>;

    /// Write `record` if the stored version equals `expected_version`
    /// (`None`: no record may exist). Returns the new version.
    async fn commit(
        &self,
        record: StateRecord,
        expected_version: Option<u64>,
    ) -> Result<u64, StateError>;

    /// Delete the record for `key` if it is still at `expected_version`.
    async fn remove(&self, key: &NodeKey, expected_version: u64) -> Result<(), StateError>;

    /// Snapshot of every record
    async fn records(&self) -> Result<BTreeMap<NodeKey, StateRecord>, StateError>;

    fn leases(&self) -> &LeaseTable;
}

/// Compare-and-set check shared by the store implementations
pub(crate) fn check_version(
    key: &NodeKey,
    current: Option<u64>,
    expected: Option<u64>,
) -> Result<(), StateError> {
    if current == expected {
        Ok(())
    } else {
        tracing::warn!(node = %key, ?expected, found = ?current, "state version conflict");
        Err(StateError::Conflict {
            key: key.clone(),
            expected,
            found: current,
        })
    }
}

/// Per-run exclusive claims on node keys.
///
/// A table made with [`LeaseTable::on_disk`] also claims one lock file per
/// key, so runs in other processes sharing the directory are excluded too.
#[derive(Debug, Default, Clone)]
pub struct LeaseTable {
    held: Arc<Mutex<HashMap<NodeKey, RunId>>>,
    lock_dir: Option<Arc<PathBuf>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_disk(dir: impl Into<PathBuf>) -> Self {
        Self {
            held: Arc::default(),
            lock_dir: Some(Arc::new(dir.into())),
        }
    }

    /// Claim every key for `run`, or none of them.
    pub fn acquire<'k>(
        &self,
        run: RunId,
        keys: impl IntoIterator<Item = &'k NodeKey>,
    ) -> Result<Lease, StateError> {
        let keys: Vec<NodeKey> = keys.into_iter().cloned().collect();
        let mut held = self.held.lock();
        if let Some((key, holder)) = keys
            .iter()
            .find_map(|k| held.get(k).filter(|h| **h != run).map(|h| (k, *h)))
        {
            return Err(StateError::Locked {
                key: key.clone(),
                holder,
            });
        }

        let mut files = Vec::new();
        if let Some(dir) = &self.lock_dir {
            for key in keys.iter().filter(|k| !held.contains_key(*k)) {
                match claim_lock_file(dir, key, run) {
                    Ok(path) => files.push(path),
                    Err(e) => {
                        release_lock_files(&files);
                        return Err(e);
                    }
                }
            }
        }

        for key in &keys {
            held.insert(key.clone(), run);
        }
        Ok(Lease {
            table: Arc::clone(&self.held),
            run,
            keys,
            files,
        })
    }

    pub fn holder(&self, key: &NodeKey) -> Option<RunId> {
        self.held.lock().get(key).copied()
    }
}

pub(crate) fn lock_path(dir: &Path, key: &NodeKey) -> PathBuf {
    dir.join(format!("{}.lock", key.file_stem()))
}

fn claim_lock_file(dir: &Path, key: &NodeKey, run: RunId) -> Result<PathBuf, StateError> {
    let path = lock_path(dir, key);
    match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(mut file) => {
            writeln!(file, "{run}").map_err(|source| StateError::Io {
                path: path.clone(),
                source,
            })?;
            Ok(path)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            tracing::warn!(node = %key, path = %path.display(), "lease held by another process");
            Err(StateError::LockedOnDisk {
                key: key.clone(),
                path,
            })
        }
        Err(source) => Err(StateError::Io { path, source }),
    }
}

fn release_lock_files(files: &[PathBuf]) {
    for path in files {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "could not remove lock file");
        }
    }
}

/// Released on drop
#[derive(Debug)]
pub struct Lease {
    table: Arc<Mutex<HashMap<NodeKey, RunId>>>,
    run: RunId,
    keys: Vec<NodeKey>,
    files: Vec<PathBuf>,
}

impl Lease {
    pub fn run_id(&self) -> RunId {
        self.run
    }

    pub fn keys(&self) -> &[NodeKey] {
        &self.keys
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut held = self.table.lock();
        for key in &self.keys {
            if held.get(key) == Some(&self.run) {
                held.remove(key);
            }
        }
        release_lock_files(&self.files);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceKind;

    fn key(name: &str) -> NodeKey {
        NodeKey::new(ResourceKind::Network, name)
    }

    #[test]
    fn lease_is_all_or_nothing_and_released_on_drop() {
        let table = LeaseTable::new();
        let first = RunId::new();
        let second = RunId::new();

        let lease = table.acquire(first, &[key("a"), key("b")]).unwrap();
        assert_eq!(lease.keys().len(), 2);

        let err = table.acquire(second, &[key("c"), key("b")]).unwrap_err();
        assert!(matches!(err, StateError::Locked { ref key, holder } if key.name == "b" && holder == first));
        assert_eq!(table.holder(&key("c")), None);

        drop(lease);
        assert!(table.acquire(second, &[key("a"), key("b"), key("c")]).is_ok());
    }

    #[test]
    fn on_disk_leases_exclude_other_tables() {
        let dir = tempfile::tempdir().unwrap();
        let mine = LeaseTable::on_disk(dir.path());
        let theirs = LeaseTable::on_disk(dir.path());

        let lease = mine.acquire(RunId::new(), &[key("a")]).unwrap();
        assert!(lock_path(dir.path(), &key("a")).exists());

        let err = theirs.acquire(RunId::new(), &[key("b"), key("a")]).unwrap_err();
        assert!(matches!(err, StateError::LockedOnDisk { ref key, .. } if key.name == "a"));
        assert!(err.is_conflict());
        // The partial claim on `b` was rolled back.
        assert!(!lock_path(dir.path(), &key("b")).exists());

        drop(lease);
        assert!(!lock_path(dir.path(), &key("a")).exists());
        assert!(theirs.acquire(RunId::new(), &[key("a"), key("b")]).is_ok());
    }
}
