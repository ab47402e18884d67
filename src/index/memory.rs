//! In-memory record store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::RecordStore;
use crate::error::IndexError;
use crate::record::{ContainerRecord, OwnerId};

/// Volatile [`RecordStore`]; records are lost on restart.
#[derive(Default)]
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<Uuid, ContainerRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

pub(crate) fn sorted(mut records: Vec<ContainerRecord>) -> Vec<ContainerRecord> {
    records.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.record_id.cmp(&b.record_id))
    });
    records
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get(&self, record_id: Uuid) -> Result<Option<ContainerRecord>, IndexError> {
        Ok(self.records.read().await.get(&record_id).cloned())
    }

    async fn upsert(&self, record: &ContainerRecord) -> Result<(), IndexError> {
        self.records
            .write()
            .await
            .insert(record.record_id, record.clone());
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
