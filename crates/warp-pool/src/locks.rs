//! Per-account exclusivity locks
//!
//! Keyed by account id. A lock is held for the duration of one upstream
//! send or one refresh; the guard travels with the work (including into a
//! returned stream) and releases on drop. Non-reentrant.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// In-memory map of per-account locks.
///
/// Entries are created on first use and live for the process; the map
/// grows with the account pool, not with request volume.
#[derive(Default)]
pub struct AccountLocks {
    inner: StdMutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, id: i64) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().expect("account lock map poisoned");
        Arc::clone(map.entry(id).or_default())
    }

    /// Non-blocking acquire; `None` when the account is busy.
    pub fn try_acquire(&self, id: i64) -> Option<OwnedMutexGuard<()>> {
        self.handle(id).try_lock_owned().ok()
    }

    /// Blocking acquire with a deadline; `None` on timeout.
    pub async fn acquire_timeout(&self, id: i64, wait: Duration) -> Option<OwnedMutexGuard<()>> {
        tokio::time::timeout(wait, self.handle(id).lock_owned())
            .await
            .ok()
    }

    /// Lock handle for building wait-for-any futures.
    pub(crate) fn waiter(&self, id: i64) -> Arc<Mutex<()>> {
        self.handle(id)
    }
}
