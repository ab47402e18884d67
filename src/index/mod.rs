//! Ownership index: who owns which container record.
//!
//! The index is the single shared mutable resource between the orchestrator
//! and the reconciler. It enforces three rules on every commit:
//!
//! - a record's owner never changes,
//! - a `DELETED` record never changes again,
//! - no two live records claim the same engine container id.
//!
//! Callers hold the record's [`RecordGuard`] for the whole
//! read → daemon call → commit sequence.

mod file;
mod locks;
mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::IndexError;
use crate::record::{ContainerRecord, OwnerId};

pub use file::JsonFileRecordStore;
pub use locks::{RecordGuard, RecordLocks};
pub use memory::InMemoryRecordStore;

/// Durable storage for container records.
///
/// Stores are plain maps; ownership and uniqueness rules live in
/// [`OwnershipIndex`].
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, record_id: Uuid) -> Result<Option<ContainerRecord>, IndexError>;

    async fn upsert(&self, record: &ContainerRecord) -> Result<(), IndexError>;

    async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<ContainerRecord>, IndexError>;

    async fn list_all(&self) -> Result<Vec<ContainerRecord>, IndexError>;
}

/// Owner-scoped view over a [`RecordStore`] with per-record locking.
pub struct OwnershipIndex {
    store: Arc<dyn RecordStore>,
    locks: RecordLocks,
    /// engine container id -> record currently holding it
    claims: Mutex<HashMap<String, Uuid>>,
}

impl OwnershipIndex {
    /// Build the index over `store`, rebuilding engine-id claims from the
    /// persisted records.
    pub async fn load(store: Arc<dyn RecordStore>) -> Result<Self, IndexError> {
        let mut claims = HashMap::new();
        for record in store.list_all().await? {
            if record.is_deleted() {
                continue;
            }
            if let Some(engine_id) = record.engine_container_id.clone() {
                if let Some(holder) = claims.insert(engine_id.clone(), record.record_id) {
                    return Err(IndexError::DuplicateEngineId {
                        container_id: engine_id,
                        holder,
                    });
                }
            }
        }
        Ok(Self {
            store,
            locks: RecordLocks::new(),
            claims: Mutex::new(claims),
        })
    }

    /// Enter the exclusive section for `record_id`.
    pub async fn lock(&self, record_id: Uuid) -> RecordGuard {
        self.locks.acquire(record_id).await
    }

    /// Fetch a record on behalf of `owner`.
    ///
    /// Fails with `NotOwned` for another owner's record; callers at the user
    /// boundary report that exactly like `NotFound`.
    pub async fn get(&self, record_id: Uuid, owner: &OwnerId) -> Result<ContainerRecord, IndexError> {
        let record = self
            .store
            .get(record_id)
            .await?
            .ok_or(IndexError::NotFound { record_id })?;
        if !record.is_owned_by(owner) {
            return Err(IndexError::NotOwned { record_id });
        }
        Ok(record)
    }

    /// Fetch a record without an ownership check. Reconciler use only.
    pub(crate) async fn get_any(&self, record_id: Uuid) -> Result<Option<ContainerRecord>, IndexError> {
        self.store.get(record_id).await
    }

    pub async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<ContainerRecord>, IndexError> {
        let records = self.store.list_by_owner(owner).await?;
        // The store is trusted for filtering, but a leak here would cross users.
        Ok(records.into_iter().filter(|r| r.is_owned_by(owner)).collect())
    }

    /// Every record of every owner. Reconciler and port allocation only.
    pub(crate) async fn list_all(&self) -> Result<Vec<ContainerRecord>, IndexError> {
        self.store.list_all().await
    }

    /// Insert a brand new record.
    pub async fn insert(&self, record: &ContainerRecord) -> Result<(), IndexError> {
        if self.store.get(record.record_id).await?.is_some() {
            return Err(IndexError::AlreadyExists {
                record_id: record.record_id,
            });
        }
        let mut claims = self.claims.lock().await;
        if let Some(engine_id) = &record.engine_container_id {
            check_claim(&claims, engine_id, record.record_id)?;
        }
        self.store.upsert(record).await?;
        if let Some(engine_id) = &record.engine_container_id {
            claims.insert(engine_id.clone(), record.record_id);
        }
        Ok(())
    }

    /// Persist a new version of an existing record.
    ///
    /// `guard` must be the exclusive section of this record.
    pub async fn commit(&self, guard: &RecordGuard, record: &ContainerRecord) -> Result<(), IndexError> {
        if guard.record_id() != record.record_id {
            return Err(IndexError::Storage(format!(
                "commit of {} attempted under the lock of {}",
                record.record_id,
                guard.record_id()
            )));
        }

        let previous = self
            .store
            .get(record.record_id)
            .await?
            .ok_or(IndexError::NotFound {
                record_id: record.record_id,
            })?;
        if previous.owner_id != record.owner_id {
            return Err(IndexError::OwnerChanged {
                record_id: record.record_id,
            });
        }
        if previous.is_deleted() {
            if previous == *record {
                return Ok(());
            }
            return Err(IndexError::Immutable {
                record_id: record.record_id,
            });
        }

        let live_engine_id = if record.is_deleted() {
            None
        } else {
            record.engine_container_id.as_ref()
        };

        let mut claims = self.claims.lock().await;
        if let Some(engine_id) = live_engine_id {
            check_claim(&claims, engine_id, record.record_id)?;
        }
        self.store.upsert(record).await?;

        if let Some(old) = &previous.engine_container_id
            && Some(old) != live_engine_id
            && claims.get(old) == Some(&record.record_id)
        {
            claims.remove(old);
        }
        if let Some(engine_id) = live_engine_id {
            claims.insert(engine_id.clone(), record.record_id);
        }
        Ok(())
    }

    /// Record currently claiming `engine_id`, if any.
    pub async fn holder_of(&self, engine_id: &str) -> Option<Uuid> {
        self.claims.lock().await.get(engine_id).copied()
    }

    /// Forget lock entries nobody is using.
    pub fn prune_locks(&self) -> usize {
        self.locks.prune()
    }
}

fn check_claim(claims: &HashMap<String, Uuid>, engine_id: &str, record_id: Uuid) -> Result<(), IndexError> {
    match claims.get(engine_id) {
        Some(holder) if *holder != record_id => Err(IndexError::DuplicateEngineId {
            container_id: engine_id.to_string(),
            holder: *holder,
        }),
        _ => Ok(()),
    }
}
