//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.
//! Every mutating call is atomic for the record it touches.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::Address;

use super::lock::LockInfo;
use super::types::{RunHistoryEntry, StateRecord, StateSnapshot};

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads every recorded resource.
    ///
    /// Returns an empty snapshot if no state exists yet.
    async fn load(&self) -> Result<StateSnapshot>;

    /// Saves the record for one address.
    async fn save(&self, address: &Address, record: &StateRecord) -> Result<()>;

    /// Removes the record for one address. Removing a missing record is a no-op.
    async fn remove(&self, address: &Address) -> Result<()>;

    /// Acquires a lock on the state.
    ///
    /// Returns lock information if successful.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Releases a lock on the state.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes any lock regardless of holder.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    /// Appends a run history entry.
    async fn append_history(&self, entry: RunHistoryEntry) -> Result<()>;

    /// Loads the run history, oldest first.
    async fn load_history(&self) -> Result<Vec<RunHistoryEntry>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self) -> Result<StateSnapshot> {
        (**self).load().await
    }

    async fn save(&self, address: &Address, record: &StateRecord) -> Result<()> {
        (**self).save(address, record).await
    }

    async fn remove(&self, address: &Address) -> Result<()> {
        (**self).remove(address).await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder, operation).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn force_unlock(&self) -> Result<()> {
        (**self).force_unlock().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    async fn append_history(&self, entry: RunHistoryEntry) -> Result<()> {
        (**self).append_history(entry).await
    }

    async fn load_history(&self) -> Result<Vec<RunHistoryEntry>> {
        (**self).load_history().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
