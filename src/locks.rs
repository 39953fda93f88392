//! Per-asset lock table.
//!
//! Every state mutation for an asset happens under that asset's lock, so
//! quote handling, trade updates, and reconciliation sweeps never race on
//! one cycle. The quote path uses the non-blocking acquire and skips on
//! contention; trade updates and workers block with a deadline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{timeout, Duration};

#[derive(Default)]
pub struct LockTable {
    inner: StdMutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, asset_id: i64) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(asset_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Non-blocking acquire; None when another task holds the asset.
    pub fn try_acquire(&self, asset_id: i64) -> Option<OwnedMutexGuard<()>> {
        self.entry(asset_id).try_lock_owned().ok()
    }

    /// Blocking acquire with a deadline; None on timeout.
    pub async fn acquire(&self, asset_id: i64, wait: Duration) -> Option<OwnedMutexGuard<()>> {
        timeout(wait, self.entry(asset_id).lock_owned()).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_acquire_skips_on_contention() {
        let table = LockTable::new();
        let held = table.try_acquire(1).expect("first acquire");
        assert!(table.try_acquire(1).is_none());
        drop(held);
        assert!(table.try_acquire(1).is_some());
    }

    #[tokio::test]
    async fn assets_lock_independently() {
        let table = LockTable::new();
        let _a = table.try_acquire(1).expect("asset 1");
        assert!(table.try_acquire(2).is_some());
    }

    #[tokio::test]
    async fn blocking_acquire_times_out() {
        let table = LockTable::new();
        let _held = table.try_acquire(1).expect("first acquire");
        let waited = table.acquire(1, Duration::from_millis(20)).await;
        assert!(waited.is_none());
    }

    #[tokio::test]
    async fn blocking_acquire_succeeds_after_release() {
        let table = Arc::new(LockTable::new());
        let held = table.try_acquire(1).expect("first acquire");
        let table2 = table.clone();
        let waiter = tokio::spawn(async move {
            table2.acquire(1, Duration::from_secs(1)).await.is_some()
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);
        assert!(waiter.await.unwrap());
    }
}
