use super::{check_version, LeaseTable, StateRecord, StateStore};
use crate::error::StateError;
use crate::types::NodeKey;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;

const WRITE_LOCK_FILE: &str = "write.lock";
const WRITE_LOCK_WAIT: Duration = Duration::from_secs(5);
const WRITE_LOCK_RETRY: Duration = Duration::from_millis(10);

/// One pretty-printed JSON record per node, `<kind>.<name>.json`.
///
/// Writes land in a temp file that is renamed into place, so readers never
/// observe a partial record. Check-and-write runs under an in-process mutex
/// and a `write.lock` file, which serializes it across processes sharing the
/// directory. Leases are lock files next to the records.
#[derive(Debug)]
pub struct FileStateStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
    leases: LeaseTable,
}

impl FileStateStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StateError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StateError::Io {
                path: dir.clone(),
                source,
            })?;
        Ok(Self {
            leases: LeaseTable::on_disk(&dir),
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &NodeKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.file_stem()))
    }

    /// Exclusive `write.lock` for one check-and-write, removed on drop.
    async fn lock_writes(&self, key: &NodeKey) -> Result<WriteLock, StateError> {
        let path = self.dir.join(WRITE_LOCK_FILE);
        let deadline = tokio::time::Instant::now() + WRITE_LOCK_WAIT;
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(WriteLock { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(StateError::LockedOnDisk {
                            key: key.clone(),
                            path,
                        });
                    }
                    tokio::time::sleep(WRITE_LOCK_RETRY).await;
                }
                Err(source) => return Err(StateError::Io { path, source }),
            }
        }
    }

    async fn read_record(path: &Path) -> Result<Option<StateRecord>, StateError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StateError::Corrupt {
                path: path.to_path_buf(),
                source,
            })
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, key: &NodeKey) -> Result<Option<StateRecord>, StateError> {
        Self::read_record(&self.path_for(key)).await
    }

    async fn commit(
        &self,
        mut record: StateRecord,
        expected_version: Option<u64>,
    ) -> Result<u64, StateError> {
        let _guard = self.write_lock.lock().await;
        let _file_lock = self.lock_writes(&record.key).await?;
        let path = self.path_for(&record.key);
        let current = Self::read_record(&path).await?.map(|r| r.version);
        check_version(&record.key, current, expected_version)?;
        record.version = current.unwrap_or(0) + 1;

        let json = serde_json::to_string_pretty(&record).map_err(|source| StateError::Corrupt {
            path: path.clone(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StateError::Io { path, source }
        };
        tokio::fs::write(&tmp, json).await.map_err(io_err(&tmp))?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err(&path))?;

        tracing::debug!(node = %record.key, version = record.version, "state committed");
        Ok(record.version)
    }

    async fn remove(&self, key: &NodeKey, expected_version: u64) -> Result<(), StateError> {
        let _guard = self.write_lock.lock().await;
        let _file_lock = self.lock_writes(key).await?;
        let path = self.path_for(key);
        let current = Self::read_record(&path).await?.map(|r| r.version);
        check_version(key, current, Some(expected_version))?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|source| StateError::Io { path, source })
    }

    async fn records(&self) -> Result<BTreeMap<NodeKey, StateRecord>, StateError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|source| StateError::Io {
                path: self.dir.clone(),
                source,
            })?;
        let mut records = BTreeMap::new();
        loop {
            let entry = entries.next_entry().await.map_err(|source| StateError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let Some(entry) = entry else { break };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = Self::read_record(&path).await? {
                records.insert(record.key.clone(), record);
            }
        }
        Ok(records)
    }

    fn leases(&self) -> &LeaseTable {
        &self.leases
    }
}

#[derive(Debug)]
struct WriteLock {
    path: PathBuf,
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "could not remove write lock");
        }
    }
}
