//! In-process serialization of operations per topology.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// One mutex per topology key, created on first use.
#[derive(Clone, Debug, Default)]
pub struct LockRegistry {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`; released when the guard drops.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        debug!(key, "acquiring topology lock");
        lock.lock_owned().await
    }

    /// Non-blocking variant, `None` when another operation holds `key`.
    pub fn try_acquire(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.try_lock_owned().ok()
    }
}

pub fn cluster_key(name: &str) -> String {
    format!("cluster/{}", name)
}

pub fn replica_set_key(name: &str) -> String {
    format!("replicaset/{}", name)
}

pub fn cluster_set_key(domain: &str) -> String {
    format!("clusterset/{}", domain)
}
