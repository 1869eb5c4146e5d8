use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-resource exclusive locks. Waiters queue in FIFO order; entries are
/// removed once nobody holds or waits for them.
#[derive(Clone, Default)]
pub struct ResourceLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, resource: &str) -> ResourceGuard {
        let lock = {
            let mut map = self.locks.lock();
            Arc::clone(
                map.entry(resource.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        let guard = Arc::clone(&lock).lock_owned().await;
        ResourceGuard {
            locks: self.clone(),
            resource: resource.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    /// Resources with a live lock entry.
    pub fn active(&self) -> usize {
        self.locks.lock().len()
    }
}

pub struct ResourceGuard {
    locks: ResourceLocks,
    resource: String,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ResourceGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self.locks.locks.lock();
        if let Some(existing) = map.get(&self.resource) {
            // One reference in the map, one here: no waiters remain.
            if Arc::ptr_eq(existing, &self.lock) && Arc::strong_count(&self.lock) == 2 {
                map.remove(&self.resource);
            }
        }
    }
}
