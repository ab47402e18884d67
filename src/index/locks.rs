//! Per-record exclusive sections.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Guard for one record's exclusive section. Dropping it releases the record.
#[derive(Debug)]
pub struct RecordGuard {
    record_id: Uuid,
    _guard: OwnedMutexGuard<()>,
}

impl RecordGuard {
    pub fn record_id(&self) -> Uuid {
        self.record_id
    }
}

/// Lock table keyed by record id.
///
/// The table itself is only locked long enough to find or insert an entry;
/// waiting happens on the per-record mutex, so different records never
/// contend.
#[derive(Default)]
pub struct RecordLocks {
    table: std::sync::Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `record_id`.
    pub async fn acquire(&self, record_id: Uuid) -> RecordGuard {
        let lock = {
            let mut table = self
                .table
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            table.entry(record_id).or_default().clone()
        };
        RecordGuard {
            record_id,
            _guard: lock.lock_owned().await,
        }
    }

    /// Drop entries nobody holds or waits on. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut table = self
            .table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = table.len();
        table.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - table.len()
    }

    pub fn len(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_record_is_serialized() {
        let locks = Arc::new(RecordLocks::new());
        let id = Uuid::new_v4();

        let guard = locks.acquire(id).await;
        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.acquire(id).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn different_records_do_not_contend() {
        let locks = RecordLocks::new();
        let _a = locks.acquire(Uuid::new_v4()).await;
        tokio::time::timeout(Duration::from_millis(100), locks.acquire(Uuid::new_v4()))
            .await
            .expect("second record must not wait on the first");
    }

    #[tokio::test]
    async fn prune_keeps_held_entries() {
        let locks = RecordLocks::new();
        let held = locks.acquire(Uuid::new_v4()).await;
        drop(locks.acquire(Uuid::new_v4()).await);
        assert_eq!(locks.len(), 2);
        assert_eq!(locks.prune(), 1);
        assert_eq!(locks.len(), 1);
        drop(held);
        assert_eq!(locks.prune(), 1);
        assert!(locks.is_empty());
    }
}
