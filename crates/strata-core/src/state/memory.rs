use super::{check_version, LeaseTable, StateRecord, StateStore};
use crate::error::StateError;
use crate::types::NodeKey;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// In-process store, used by tests and previews
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: RwLock<BTreeMap<NodeKey, StateRecord>>,
    leases: LeaseTable,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with records as-is, versions included.
    pub fn with_records(records: impl IntoIterator<Item = StateRecord>) -> Self {
        let store = Self::new();
        {
            let mut guard = store.records.write();
            for record in records {
                guard.insert(record.key.clone(), record);
            }
        }
        store
    }

    /// Write bypassing version checks, as an external writer would.
    pub fn overwrite(&self, record: StateRecord) {
        self.records.write().insert(record.key.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, key: &NodeKey) -> Result<Option<StateRecord>, StateError> {
        Ok(self.records.read().get(key).cloned())
    }

    async fn commit(
        &self,
        mut record: StateRecord,
        expected_version: Option<u64>,
    ) -> Result<u64, StateError> {
        let mut records = self.records.write();
        let current = records.get(&record.key).map(|r| r.version);
        check_version(&record.key, current, expected_version)?;
        record.version = current.unwrap_or(0) + 1;
        let version = record.version;
        records.insert(record.key.clone(), record);
        Ok(version)
    }

    async fn remove(&self, key: &NodeKey, expected_version: u64) -> Result<(), StateError> {
        let mut records = self.records.write();
        let current = records.get(key).map(|r| r.version);
        check_version(key, current, Some(expected_version))?;
        records.remove(key);
        Ok(())
    }

    async fn records(&self) -> Result<BTreeMap<NodeKey, StateRecord>, StateError> {
        Ok(self.records.read().clone())
    }

    fn leases(&self) -> &LeaseTable {
        &self.leases
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Fingerprint, ResourceKind, ValueMap};

    fn record(name: &str) -> StateRecord {
        let key = NodeKey::new(ResourceKind::Network, name);
        let fingerprint = Fingerprint::compute(&key, &ValueMap::new());
        StateRecord::new(key, fingerprint, ValueMap::new())
    }

    #[tokio::test]
    async fn versions_start_at_one_and_increment() {
        let store = MemoryStateStore::new();
        assert_eq!(store.commit(record("vpc"), None).await.unwrap(), 1);
        assert_eq!(store.commit(record("vpc"), Some(1)).await.unwrap(), 2);
        let loaded = store.load(&record("vpc").key).await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
    }

    #[tokio::test]
    async fn stale_writer_is_rejected() {
        let store = MemoryStateStore::new();
        store.commit(record("vpc"), None).await.unwrap();

        let err = store.commit(record("vpc"), None).await.unwrap_err();
        assert!(matches!(
            err,
            StateError::Conflict {
                expected: None,
                found: Some(1),
                ..
            }
        ));
        assert!(store.remove(&record("vpc").key, 7).await.is_err());
        store.remove(&record("vpc").key, 1).await.unwrap();
        assert!(store.is_empty());
    }
}
