//! Per-room lock table.
//!
//! Lifecycle operations on one room are serialized through a lazily
//! created async mutex; unrelated rooms never contend. The entry is
//! dropped when the room is removed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use roomforge_protocol::RoomId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub(crate) type RoomGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
pub(crate) struct LockTable {
    locks: Mutex<HashMap<RoomId, Arc<AsyncMutex<()>>>>,
}

impl LockTable {
    fn table(&self) -> MutexGuard<'_, HashMap<RoomId, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, id: RoomId) -> Arc<AsyncMutex<()>> {
        self.table().entry(id).or_default().clone()
    }

    /// Waits for exclusive access to `id`.
    pub(crate) async fn lock(&self, id: RoomId) -> RoomGuard {
        self.handle(id).lock_owned().await
    }

    /// Takes the lock only if nobody holds it.
    pub(crate) fn try_lock(&self, id: RoomId) -> Option<RoomGuard> {
        self.handle(id).try_lock_owned().ok()
    }

    /// Drops the entry for a room that no longer exists.
    pub(crate) fn forget(&self, id: RoomId) {
        self.table().remove(&id);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.table().len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_same_room_is_serialized() {
        let table = Arc::new(LockTable::default());
        let id = RoomId::new();
        let guard = table.lock(id).await;
        assert!(table.try_lock(id).is_none());

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move {
                let _g = table.lock(id).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_unrelated_rooms_do_not_contend() {
        let table = LockTable::default();
        let _a = table.lock(RoomId::new()).await;
        assert!(table.try_lock(RoomId::new()).is_some());
    }

    #[tokio::test]
    async fn test_forget_drops_entry() {
        let table = LockTable::default();
        let id = RoomId::new();
        drop(table.lock(id).await);
        assert_eq!(table.len(), 1);
        table.forget(id);
        assert_eq!(table.len(), 0);
    }
}
