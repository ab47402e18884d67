//! JSON snapshot record store.
//!
//! The whole record set is kept in memory and rewritten to disk on every
//! upsert (write to a sibling temp file, then rename), so a crash leaves
//! either the previous or the new snapshot, never a torn one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::RecordStore;
use super::memory::sorted;
use crate::error::IndexError;
use crate::record::{ContainerRecord, OwnerId};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    records: Vec<ContainerRecord>,
}

/// Durable [`RecordStore`] backed by a single JSON file.
pub struct JsonFileRecordStore {
    path: PathBuf,
    records: RwLock<HashMap<Uuid, ContainerRecord>>,
}

impl JsonFileRecordStore {
    /// Open the store, loading an existing snapshot if present.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, IndexError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_error("create state directory", parent, e))?;
        }

        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes).map_err(|e| {
                    IndexError::Storage(format!("corrupt snapshot {}: {}", path.display(), e))
                })?;
                if snapshot.version != SNAPSHOT_VERSION {
                    return Err(IndexError::Storage(format!(
                        "unsupported snapshot version {} in {}",
                        snapshot.version,
                        path.display()
                    )));
                }
                snapshot
                    .records
                    .into_iter()
                    .map(|r| (r.record_id, r))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(storage_error("read snapshot", &path, e)),
        };

        tracing::debug!(path = %path.display(), records = records.len(), "Opened record store");
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, records: &HashMap<Uuid, ContainerRecord>) -> Result<(), IndexError> {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            records: sorted(records.values().cloned().collect()),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| IndexError::Storage(format!("serialize snapshot: {}", e)))?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| storage_error("write snapshot", &tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| storage_error("replace snapshot", &self.path, e))?;
        Ok(())
    }
}

fn storage_error(what: &str, path: &Path, err: std::io::Error) -> IndexError {
    IndexError::Storage(format!("{} {}: {}", what, path.display(), err))
}

#[async_trait]
impl RecordStore for JsonFileRecordStore {
    async fn get(&self, record_id: Uuid) -> Result<Option<ContainerRecord>, IndexError> {
        Ok(self.records.read().await.get(&record_id).cloned())
    }

    async fn upsert(&self, record: &ContainerRecord) -> Result<(), IndexError> {
        // Held across the write so snapshots land in commit order.
        let mut records = self.records.write().await;
        let previous = records.insert(record.record_id, record.clone());
        if let Err(e) = self.persist(&records).await {
            match previous {
                Some(prev) => records.insert(record.record_id, prev),
                None => records.remove(&record.record_id),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<ContainerRecord>, IndexError> {
        let records = self.records.read().await;
        Ok(sorted(
            records
                .values()
                .filter(|r| r.is_owned_by(owner))
                .cloned()
                .collect(),
        ))
    }

    async fn list_all(&self) -> Result<Vec<ContainerRecord>, IndexError> {
        Ok(sorted(self.records.read().await.values().cloned().collect()))
    }
}
