//! State store contract.
//!
//! A store is bound to one stack at construction and holds two things for
//! it: the [`StackState`] table and an advisory lock. The table is written
//! as a unit: [`save`](StateStore::save) replaces every resource entry, the
//! exports and the history in one step, and [`load`](StateStore::load)
//! returns either the previous table or the new one, never a mix. The engine
//! takes the lock before loading and releases it after saving, so two
//! apply runs on the same stack cannot interleave their writes.

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::StackState;
use crate::error::Result;

/// Persistence for one stack's resource table and lock.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Reads the stack's table. `None` means the stack was never applied.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Corrupted` if the stored table cannot be parsed.
    async fn load(&self) -> Result<Option<StackState>>;

    /// Replaces the stack's table with `state`.
    ///
    /// # Errors
    ///
    /// Returns a state error if the table cannot be written; the previous
    /// table is then still in place.
    async fn save(&self, state: &StackState) -> Result<()>;

    /// Removes the table and any lock.
    ///
    /// # Errors
    ///
    /// Returns a state error if the backend refuses the delete.
    async fn delete(&self) -> Result<()>;

    /// Returns true once a table has been saved.
    ///
    /// # Errors
    ///
    /// Returns a state error if the backend cannot be queried.
    async fn exists(&self) -> Result<bool>;

    /// Takes the stack lock for `holder`. An expired lock is taken over.
    ///
    /// # Errors
    ///
    /// Returns `StateError::LockedByOther` while another live lock exists.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Drops the lock if `lock_id` still owns it; a lock taken over by
    /// someone else is left alone.
    ///
    /// # Errors
    ///
    /// Returns a state error if the lock cannot be read or removed.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Current lock, expired or not.
    ///
    /// # Errors
    ///
    /// Returns a state error if the lock cannot be read.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Returns true while a live (unexpired) lock exists.
    ///
    /// # Errors
    ///
    /// Returns a state error if the lock cannot be read.
    async fn is_locked(&self) -> Result<bool>;

    /// Backend name for logs (`local`, `s3`).
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self) -> Result<Option<StackState>> {
        (**self).load().await
    }

    async fn save(&self, state: &StackState) -> Result<()> {
        (**self).save(state).await
    }

    async fn delete(&self) -> Result<()> {
        (**self).delete().await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
