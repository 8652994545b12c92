//! Metadata lifecycle across several handles and layouts.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use clusteradm_meta::migration::legacy::{
    LegacyCluster, LegacyInstance, LegacyReplicaSet, LegacySnapshot,
};
use clusteradm_meta::{
    migrate, ClusterRole, MemoryKvStore, MetaError, MetadataStore, Owner, TopologyMode,
    CURRENT_SCHEMA_VERSION,
};
use common::{installed_store, instance, new_cluster};
use uuid::Uuid;

#[test]
fn test_handles_on_one_kv_share_state() {
    let (kv, writer) = installed_store();
    let reader = MetadataStore::new(kv.clone());

    let seed = instance(1);
    let created = writer.create_cluster(new_cluster("dev", seed.clone())).unwrap();
    let loaded = reader.cluster_by_name("dev").unwrap().unwrap();
    assert_eq!(loaded, created);
    assert_eq!(
        reader.owner_of(&seed.server_uuid).unwrap(),
        Some(Owner::Cluster(created.id))
    );
}

#[test]
fn test_snapshot_diverges_from_source() {
    let (kv, store) = installed_store();
    let record = store.create_cluster(new_cluster("dev", instance(1))).unwrap();

    let detached = MetadataStore::new(Arc::new(kv.snapshot().unwrap()));
    store.delete_cluster(&record.id).unwrap();

    assert!(store.cluster_by_name("dev").unwrap().is_none());
    assert_eq!(detached.cluster_by_name("dev").unwrap(), Some(record));
}

#[test]
fn test_concurrent_writers_detect_each_other() {
    let (kv, first) = installed_store();
    let second = MetadataStore::new(kv);
    let record = first.create_cluster(new_cluster("dev", instance(1))).unwrap();

    let mut a = record.clone();
    a.instances.push(instance(2));
    let mut b = record;
    b.instances.push(instance(3));

    first.update_cluster(&a).unwrap();
    let err = second.update_cluster(&b).unwrap_err();
    assert!(matches!(
        err,
        MetaError::VersionConflict {
            expected: 1,
            found: 2,
            ..
        }
    ));
    let stored = second.cluster_by_name("dev").unwrap().unwrap();
    assert_eq!(stored.instances.len(), 2);
    assert_eq!(stored.instances[1].server_id, 2);
}

#[test]
fn test_cluster_set_switch_keeps_one_primary() {
    let (_, store) = installed_store();
    let east = store.create_cluster(new_cluster("east", instance(1))).unwrap();
    let (set, _) = store.create_cluster_set("global", &east).unwrap();
    let (set, west) = store
        .register_replica_cluster(&set, new_cluster("west", instance(2)), "clusterset_replication")
        .unwrap();
    assert_eq!(set.primary_count(), 1);

    let mut switched = set.clone();
    for member in &mut switched.members {
        member.role = if member.cluster_id == west.id {
            ClusterRole::Primary
        } else {
            ClusterRole::Replica
        };
    }
    let switched = store.update_cluster_set(&switched).unwrap();
    assert_eq!(switched.primary_count(), 1);
    assert_eq!(switched.primary().unwrap().cluster_name, "west");
    assert!(store.update_cluster_set(&set).is_err());

    let set = store.deregister_cluster(&switched, &store.cluster(&east.id).unwrap()).unwrap();
    assert_eq!(set.members.len(), 1);
    assert!(store.cluster_by_name("east").unwrap().is_none());
}

#[test]
fn test_upgraded_store_accepts_new_members() {
    let kv = Arc::new(MemoryKvStore::new());
    let group = Uuid::new_v4();
    let legacy_uuid = Uuid::new_v4();
    LegacySnapshot {
        clusters: vec![LegacyCluster {
            cluster_id: 1,
            cluster_name: "prod".to_string(),
            options: BTreeMap::new(),
        }],
        replicasets: vec![LegacyReplicaSet {
            replicaset_id: 7,
            cluster_id: 1,
            topology_type: "mm".to_string(),
            group_replication_group_name: group.to_string(),
        }],
        instances: vec![LegacyInstance {
            instance_id: 1,
            replicaset_id: 7,
            mysql_server_uuid: legacy_uuid.to_string(),
            instance_name: "db1:3306".to_string(),
            address: "db1:3306".to_string(),
            server_id: None,
            version: None,
        }],
    }
    .write_to(kv.as_ref())
    .unwrap();

    let store = MetadataStore::new(kv);
    assert!(matches!(
        store.clusters(),
        Err(MetaError::SchemaOutdated { .. })
    ));

    let report = migrate(&store).unwrap();
    assert!(report.upgraded);
    assert_eq!(report.to, CURRENT_SCHEMA_VERSION);
    assert_eq!((report.clusters, report.instances), (1, 1));

    let mut prod = store.cluster_by_name("prod").unwrap().unwrap();
    assert_eq!(prod.group_name, group);
    assert_eq!(prod.topology_mode, TopologyMode::MultiPrimary);
    assert_eq!(prod.instances[0].server_uuid, legacy_uuid);
    assert_eq!(prod.instances[0].server_id, 0);

    prod.instances.push(instance(2));
    let prod = store.update_cluster(&prod).unwrap();
    assert_eq!(prod.instances.len(), 2);
    assert!(!migrate(&store).unwrap().upgraded);
}

#[test]
fn test_dropped_schema_can_be_reinstalled() {
    let (_, store) = installed_store();
    let seed = instance(1);
    store.create_cluster(new_cluster("dev", seed.clone())).unwrap();
    assert!(store.drop_schema().unwrap() > 0);
    assert!(matches!(store.drop_schema(), Err(MetaError::SchemaNotInstalled)));

    store.install().unwrap();
    assert!(store.clusters().unwrap().is_empty());
    assert_eq!(store.owner_of(&seed.server_uuid).unwrap(), None);
    store.create_cluster(new_cluster("dev", seed)).unwrap();
}
