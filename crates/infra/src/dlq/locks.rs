//! Per-record async locks.
//!
//! Two sweeps (or a sweep and a manual retry) must not run handlers for the
//! same record at the same time. Entries are created on demand and dropped
//! once nobody holds or waits for them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use uno_core::RecordId;

type LockMap = HashMap<RecordId, Arc<AsyncMutex<()>>>;

#[derive(Debug, Default, Clone)]
pub(crate) struct RecordLocks {
    inner: Arc<Mutex<LockMap>>,
}

impl RecordLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`.
    pub(crate) async fn acquire(&self, id: RecordId) -> RecordLease {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            map.entry(id).or_default().clone()
        };

        RecordLease {
            guard: Some(lock.lock_owned().await),
            locks: self.inner.clone(),
            id,
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// Exclusive access to one record, released on drop.
#[derive(Debug)]
pub(crate) struct RecordLease {
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<Mutex<LockMap>>,
    id: RecordId,
}

impl Drop for RecordLease {
    fn drop(&mut self) {
        self.guard.take();

        let mut map = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        // Only the map itself still references the lock: nobody is waiting.
        if map
            .get(&self.id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(&self.id);
        }
    }
}
