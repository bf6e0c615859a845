//! In-process state storage backend.
//!
//! Used for dry runs, simulations and tests. Nothing survives the process.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{ConvergeError, Result, StateError};
use crate::model::Address;

use super::lock::LockInfo;
use super::store::StateStore;
use super::types::{push_bounded, RunHistoryEntry, StateRecord, StateSnapshot};

/// State store backed by in-memory maps.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: RwLock<StateSnapshot>,
    lock: RwLock<Option<LockInfo>>,
    history: RwLock<Vec<RunHistoryEntry>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with records.
    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = StateRecord>) -> Self {
        let snapshot = records
            .into_iter()
            .map(|r| (r.address.clone(), r))
            .collect();
        Self {
            records: RwLock::new(snapshot),
            ..Self::default()
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<StateSnapshot> {
        Ok(self.records.read().await.clone())
    }

    async fn save(&self, address: &Address, record: &StateRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(address.clone(), record.clone());
        Ok(())
    }

    async fn remove(&self, address: &Address) -> Result<()> {
        self.records.write().await.remove(address);
        Ok(())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let mut lock = self.lock.write().await;
        if let Some(existing) = lock.as_ref().filter(|l| !l.is_expired()) {
            return Err(ConvergeError::State(StateError::LockedByOther {
                holder: existing.holder.clone(),
                since: existing.acquired_at.to_rfc3339(),
            }));
        }
        let info = LockInfo::new(holder, operation);
        *lock = Some(info.clone());
        Ok(info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut lock = self.lock.write().await;
        if lock.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            *lock = None;
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        *self.lock.write().await = None;
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock.read().await.clone())
    }

    async fn append_history(&self, entry: RunHistoryEntry) -> Result<()> {
        push_bounded(&mut *self.history.write().await, entry);
        Ok(())
    }

    async fn load_history(&self) -> Result<Vec<RunHistoryEntry>> {
        Ok(self.history.read().await.clone())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AttrMap;

    #[tokio::test]
    async fn test_save_load_remove() {
        let store = MemoryStateStore::new();
        let record = StateRecord::new(
            Address::new("role", "worker"),
            "memory",
            "r-1",
            AttrMap::new(),
            AttrMap::new(),
            vec![],
        );

        store.save(&record.address, &record).await.expect("save");
        assert_eq!(store.load().await.expect("load").len(), 1);

        store.remove(&record.address).await.expect("remove");
        assert!(store.load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let store = MemoryStateStore::new();
        let lock = store.acquire_lock("a", "apply").await.expect("lock");
        assert!(store.acquire_lock("b", "apply").await.is_err());

        store.release_lock(&lock.lock_id).await.expect("release");
        assert!(!store.is_locked().await.expect("is_locked"));
    }
}
