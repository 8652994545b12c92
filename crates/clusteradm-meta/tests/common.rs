//! Common fixtures for metadata integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use clusteradm_meta::{
    InstanceAddress, InstanceRecord, MemoryKvStore, MetadataStore, NewCluster, TopologyMode,
    Version,
};
use uuid::Uuid;

/// A store with the current schema installed, plus the KV it lives in.
pub fn installed_store() -> (Arc<MemoryKvStore>, MetadataStore) {
    let kv = Arc::new(MemoryKvStore::new());
    let store = MetadataStore::new(kv.clone());
    store.install().expect("install schema");
    (kv, store)
}

/// Instance `dbN:3306` with server ID `n` and a fresh UUID.
pub fn instance(n: u32) -> InstanceRecord {
    InstanceRecord::new(
        InstanceAddress::new(format!("db{}", n), 3306),
        Uuid::new_v4(),
        n,
        Version::new(8, 0, 30),
    )
}

pub fn new_cluster(name: &str, seed: InstanceRecord) -> NewCluster {
    NewCluster {
        name: name.to_string(),
        group_name: Uuid::new_v4(),
        topology_mode: TopologyMode::SinglePrimary,
        seed,
        attributes: BTreeMap::new(),
    }
}
