use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A VM's mutex and the number of holders plus waiters referencing it.
struct Slot {
    lock: Arc<AsyncMutex<()>>,
    users: usize,
}

type LockMap = HashMap<String, Slot>;

/// Per-VM mutual exclusion for mutating operations.
///
/// Locks are created on first use and removed from the map once the last
/// holder or waiter lets go, so the map only ever holds names with activity.
#[derive(Clone, Default)]
pub struct VmLocks {
    map: Arc<Mutex<LockMap>>,
}

/// Held for the duration of one mutating operation. Dropping it releases the
/// VM.
pub struct VmLockGuard {
    // Field order matters: the mutex is released before the slot is let go.
    _guard: OwnedMutexGuard<()>,
    _user: SlotUser,
}

/// Counts as one user of a slot from registration until drop, whether the
/// owner ends up holding the lock or gives up waiting.
struct SlotUser {
    name: String,
    map: Arc<Mutex<LockMap>>,
}

impl VmLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `name`. Waiters are served in FIFO order.
    pub async fn lock(&self, name: &str) -> VmLockGuard {
        let (user, lock) = {
            let mut map = self.map.lock();
            let slot = map.entry(name.to_string()).or_insert_with(|| Slot {
                lock: Arc::default(),
                users: 0,
            });
            slot.users += 1;
            let user = SlotUser {
                name: name.to_string(),
                map: Arc::clone(&self.map),
            };
            (user, Arc::clone(&slot.lock))
        };
        // Cancelling here drops `user`, which releases the slot even if the
        // mutex had already been handed to us.
        let guard = lock.lock_owned().await;
        VmLockGuard {
            _guard: guard,
            _user: user,
        }
    }

    /// Number of VM names with a lock currently held or awaited.
    pub fn active(&self) -> usize {
        self.map.lock().len()
    }
}

impl Drop for SlotUser {
    fn drop(&mut self) {
        let mut map = self.map.lock();
        if let Some(slot) = map.get_mut(&self.name) {
            slot.users -= 1;
            if slot.users == 0 {
                map.remove(&self.name);
            }
        }
    }
}
