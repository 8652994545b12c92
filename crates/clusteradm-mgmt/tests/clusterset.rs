//! Cluster set lifecycle across several clusters of one simulated fleet.

mod common;

use clusteradm_meta::ClusterRole;
use clusteradm_mgmt::options::{
    CreateReplicaClusterOptions, ForcePrimaryClusterOptions, RemoveClusterOptions, StatusOptions,
};
use clusteradm_mgmt::{
    ClusterSetHealth, ClusterSetManager, GlobalStatus, ManagementSession, StatusReporter,
};
use common::TestFleet;

/// "east" on db1..db3 as primary cluster, "west" on db4 and "south" on db5.
async fn global(fleet: &TestFleet) -> ManagementSession {
    let session = fleet.cluster("east", &[1, 2, 3]).await;
    let sets = ClusterSetManager::new(&session);
    sets.create_cluster_set("east", "global").await.unwrap();
    for (name, n) in [("west", 4), ("south", 5)] {
        sets.create_replica_cluster(
            "global",
            name,
            fleet.addr(n),
            &CreateReplicaClusterOptions::default(),
        )
        .await
        .unwrap();
    }
    session
}

async fn primary_count(session: &ManagementSession) -> usize {
    session
        .read_metadata()
        .await
        .unwrap()
        .cluster_set_by_name("global")
        .unwrap()
        .unwrap()
        .primary_count()
}

#[tokio::test]
async fn test_replica_clusters_are_fenced() {
    let fleet = TestFleet::new(5);
    let session = global(&fleet).await;

    fleet.sim.write_transactions(fleet.addr(1), 5).unwrap();
    for n in [4, 5] {
        let err = fleet.sim.write_transactions(fleet.addr(n), 1).unwrap_err();
        assert_eq!(err.code(), "read-only");
        assert_eq!(fleet.sim.gtid_executed(fleet.addr(n)).unwrap().count(), 5);
    }

    let west = fleet.session(4).await;
    let status = StatusReporter::new(&west)
        .status("west", &StatusOptions::default())
        .await
        .unwrap();
    assert_eq!(status.cluster_set_role, Some(ClusterRole::Replica));
    assert_eq!(primary_count(&session).await, 1);

    let sets = ClusterSetManager::new(&session);
    let status = sets.status("global").await.unwrap();
    assert_eq!(status.status, ClusterSetHealth::Healthy);
    assert_eq!(status.clusters.len(), 3);
    assert!(status
        .clusters
        .iter()
        .all(|c| c.global_status == GlobalStatus::Ok));
}

#[tokio::test]
async fn test_cluster_set_creation_rejections() {
    let fleet = TestFleet::new(6);
    let session = global(&fleet).await;
    let sets = ClusterSetManager::new(&session);

    let again = sets.create_cluster_set("east", "other").await.unwrap_err();
    assert_eq!(again.code(), "state");

    let taken = sets
        .create_replica_cluster(
            "global",
            "west",
            fleet.addr(6),
            &CreateReplicaClusterOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(taken.code(), "duplicate-name");

    let member = sets
        .create_replica_cluster(
            "global",
            "north",
            fleet.addr(2),
            &CreateReplicaClusterOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(member.code(), "state");
    assert!(fleet.sim.group_members(fleet.addr(6)).is_empty());
    assert_eq!(sets.describe("global").await.unwrap().clusters.len(), 3);
}

#[tokio::test]
async fn test_switchover_keeps_a_single_primary() {
    let fleet = TestFleet::new(5);
    let session = global(&fleet).await;
    let sets = ClusterSetManager::new(&session);

    sets.set_primary_cluster("global", "west").await.unwrap();
    assert_eq!(primary_count(&session).await, 1);
    fleet.sim.write_transactions(fleet.addr(4), 2).unwrap();
    assert_eq!(
        fleet.sim.write_transactions(fleet.addr(1), 1).unwrap_err().code(),
        "read-only"
    );
    for n in [1, 5] {
        assert_eq!(fleet.sim.gtid_executed(fleet.addr(n)).unwrap().count(), 2);
    }

    let status = sets.status("global").await.unwrap();
    assert_eq!(status.primary_cluster.as_deref(), Some("west"));
    assert_eq!(status.cluster("east").unwrap().role, ClusterRole::Replica);
    assert_eq!(status.cluster("south").unwrap().global_status, GlobalStatus::Ok);

    let current = sets.set_primary_cluster("global", "west").await.unwrap_err();
    assert_eq!(current.code(), "state");
}

#[tokio::test]
async fn test_forced_failover_with_unreachable_replica() {
    let fleet = TestFleet::new(5);
    global(&fleet).await;
    for n in [1, 2, 3, 5] {
        fleet.sim.set_reachable(fleet.addr(n), false).unwrap();
    }
    let west = fleet.session(4).await;
    let sets = ClusterSetManager::new(&west);

    let unlisted = sets
        .force_primary_cluster("global", "west", &ForcePrimaryClusterOptions::default())
        .await
        .unwrap_err();
    assert_eq!(unlisted.code(), "state");

    let report = sets
        .force_primary_cluster(
            "global",
            "west",
            &ForcePrimaryClusterOptions {
                invalidate_replica_clusters: vec!["south".to_string()],
            },
        )
        .await
        .unwrap();
    assert!(report.data_loss_possible);
    assert_eq!(primary_count(&west).await, 1);
    fleet.sim.write_transactions(fleet.addr(4), 1).unwrap();

    let description = sets.describe("global").await.unwrap();
    for name in ["east", "south"] {
        let cluster = description
            .clusters
            .iter()
            .find(|c| c.cluster_name == name)
            .unwrap();
        assert!(cluster.invalidated, "{} should be invalidated", name);
    }
    let status = sets.status("global").await.unwrap();
    assert_eq!(status.primary_cluster.as_deref(), Some("west"));
    assert_eq!(status.status, ClusterSetHealth::Available);
}

#[tokio::test]
async fn test_remove_and_dissolve_replica_cluster() {
    let fleet = TestFleet::new(5);
    let session = global(&fleet).await;
    let sets = ClusterSetManager::new(&session);

    sets.remove_cluster("global", "south", &RemoveClusterOptions::default())
        .await
        .unwrap();
    assert!(fleet.sim.group_members(fleet.addr(5)).is_empty());
    let missing = sets
        .remove_cluster("global", "south", &RemoveClusterOptions::default())
        .await
        .unwrap_err();
    assert_eq!(missing.code(), "not-member");

    let description = sets.describe("global").await.unwrap();
    assert_eq!(description.clusters.len(), 2);
    assert_eq!(primary_count(&session).await, 1);
}
