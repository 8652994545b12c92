//! End-to-end membership scenarios against the simulated fleet.

mod common;

use clusteradm_meta::MemberRole;
use clusteradm_mgmt::options::{
    AddInstanceOptions, CreateClusterOptions, DissolveOptions, DropMetadataSchemaOptions,
    ExitStateAction, RemoveInstanceOptions, RescanOptions, SessionOptions, StatusOptions,
    UnreachablePolicy,
};
use clusteradm_mgmt::status::MemberStatus;
use clusteradm_mgmt::{ClusterHealth, Fault, MembershipCoordinator, SimInstanceSpec, StatusReporter};
use common::TestFleet;

#[tokio::test]
async fn test_dev_scenario() {
    let fleet = TestFleet::new(2);
    let session = fleet.session(1).await;
    let coordinator = MembershipCoordinator::new(&session);
    coordinator
        .create_cluster("dev", &CreateClusterOptions::default())
        .await
        .unwrap();
    coordinator
        .add_instance(
            "dev",
            fleet.addr(2),
            &AddInstanceOptions {
                exit_state_action: Some(ExitStateAction::ReadOnly),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let status = StatusReporter::new(&session)
        .status("dev", &StatusOptions::default())
        .await
        .unwrap();
    assert_eq!(status.members.len(), 2);
    assert!(status.members.iter().all(|m| m.status == MemberStatus::Online));
    let primaries = status
        .members
        .iter()
        .filter(|m| m.role == Some(MemberRole::Primary))
        .count();
    let secondaries = status
        .members
        .iter()
        .filter(|m| m.role == Some(MemberRole::Secondary))
        .count();
    assert_eq!((primaries, secondaries), (1, 1));
    assert_eq!(status.primary.as_ref(), Some(fleet.addr(1)));
    assert_eq!(status.member(fleet.addr(2)).unwrap().mode, Some("R/O"));
}

#[tokio::test]
async fn test_rescan_after_add_reports_no_drift() {
    let fleet = TestFleet::new(3);
    let session = fleet.cluster("dev", &[1, 2, 3]).await;
    let report = MembershipCoordinator::new(&session)
        .rescan("dev", &RescanOptions::default())
        .await
        .unwrap();
    assert!(report.is_clean(), "{:?}", report);
    assert!(report.applied.is_empty());
}

#[tokio::test]
async fn test_duplicate_server_id_leaves_membership_unchanged() {
    let mut fleet = TestFleet::new(2);
    let clone = fleet.provision(SimInstanceSpec::new("db9:3306", 2));
    let session = fleet.cluster("dev", &[1, 2]).await;
    let coordinator = MembershipCoordinator::new(&session);

    let err = coordinator
        .add_instance("dev", &clone, &AddInstanceOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "duplicate-identity");
    assert_eq!(err.reason_code(), Some("duplicate-server-id"));

    assert_eq!(fleet.sim.group_members(fleet.addr(1)).len(), 2);
    assert!(fleet.sim.group_members(&clone).is_empty());
    let description = StatusReporter::new(&session).describe("dev").await.unwrap();
    assert_eq!(description.instances.len(), 2);
}

#[tokio::test]
async fn test_other_cluster_and_unmanaged_group_rejected_with_distinct_reasons() {
    let fleet = TestFleet::new(5);
    let session = fleet.cluster("dev", &[1, 2]).await;
    fleet.cluster("other", &[3]).await;
    fleet.unmanaged_group(4).await;
    let coordinator = MembershipCoordinator::new(&session);

    let managed = coordinator
        .add_instance("dev", fleet.addr(3), &AddInstanceOptions::default())
        .await
        .unwrap_err();
    assert_eq!(managed.code(), "duplicate-identity");
    assert_eq!(managed.reason_code(), Some("member-of-another-cluster"));

    let unmanaged = coordinator
        .add_instance("dev", fleet.addr(4), &AddInstanceOptions::default())
        .await
        .unwrap_err();
    assert_eq!(unmanaged.code(), "duplicate-identity");
    assert_eq!(unmanaged.reason_code(), Some("member-of-another-group"));

    let again = coordinator
        .add_instance("dev", fleet.addr(2), &AddInstanceOptions::default())
        .await
        .unwrap_err();
    assert_eq!(again.code(), "already-member");

    coordinator
        .add_instance("dev", fleet.addr(5), &AddInstanceOptions::default())
        .await
        .unwrap();
    assert_eq!(fleet.sim.group_members(fleet.addr(1)).len(), 3);
}

#[tokio::test]
async fn test_quorum_protection_on_two_member_cluster() {
    let fleet = TestFleet::new(2);
    let session = fleet.cluster("dev", &[1, 2]).await;
    let coordinator = MembershipCoordinator::new(&session);

    let err = coordinator
        .remove_instance("dev", fleet.addr(2), &RemoveInstanceOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "quorum");
    assert_eq!(fleet.sim.group_members(fleet.addr(1)).len(), 2);

    coordinator
        .remove_instance(
            "dev",
            fleet.addr(2),
            &RemoveInstanceOptions {
                force: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(fleet.sim.group_members(fleet.addr(1)), vec![fleet.addr(1).clone()]);
    let status = StatusReporter::new(&session)
        .status("dev", &StatusOptions::default())
        .await
        .unwrap();
    assert_eq!(status.members.len(), 1);
    assert_eq!(status.status, ClusterHealth::OkNoTolerance);
}

#[tokio::test]
async fn test_read_only_session_without_primary() {
    let fleet = TestFleet::new(4);
    fleet.cluster("dev", &[1, 2, 3]).await;
    fleet.sim.set_reachable(fleet.addr(1), false).unwrap();
    fleet.sim.set_reachable(fleet.addr(3), false).unwrap();

    let session = fleet
        .session_with(
            2,
            SessionOptions {
                connect_to_primary: false,
            },
        )
        .await;
    let coordinator = MembershipCoordinator::new(&session);

    let add = coordinator
        .add_instance("dev", fleet.addr(4), &AddInstanceOptions::default())
        .await
        .unwrap_err();
    assert_eq!(add.code(), "read-only");
    let remove = coordinator
        .remove_instance("dev", fleet.addr(3), &RemoveInstanceOptions::default())
        .await
        .unwrap_err();
    assert_eq!(remove.code(), "read-only");
    let dissolve = coordinator
        .dissolve("dev", &DissolveOptions::default())
        .await
        .unwrap_err();
    assert_eq!(dissolve.code(), "read-only");

    let reporter = StatusReporter::new(&session);
    let status = reporter.status("dev", &StatusOptions::default()).await.unwrap();
    assert_eq!(status.status, ClusterHealth::NoQuorum);
    assert_eq!(
        status.member(fleet.addr(1)).unwrap().status,
        MemberStatus::Unreachable
    );
    assert_eq!(reporter.describe("dev").await.unwrap().instances.len(), 3);
}

#[tokio::test]
async fn test_dissolve_and_drop_schema_are_not_repeatable() {
    let fleet = TestFleet::new(4);
    let session = fleet.cluster("dev", &[1, 2, 3]).await;
    let coordinator = MembershipCoordinator::new(&session);

    let report = coordinator
        .dissolve("dev", &DissolveOptions::default())
        .await
        .unwrap();
    assert!(!report.degraded);
    assert!(fleet.sim.group_members(fleet.addr(1)).is_empty());
    let again = coordinator
        .dissolve("dev", &DissolveOptions::default())
        .await
        .unwrap_err();
    assert_eq!(again.code(), "state");

    // Leaving the group fenced db1.
    let force = DropMetadataSchemaOptions {
        force: true,
        clear_read_only: true,
    };
    session.drop_metadata_schema(&force).await.unwrap();
    let again = session.drop_metadata_schema(&force).await.unwrap_err();
    assert_eq!(again.code(), "state");

    let fresh = fleet.session(4).await;
    let none = fresh.drop_metadata_schema(&force).await.unwrap_err();
    assert_eq!(none.code(), "state");
}

#[tokio::test]
async fn test_unreachable_member_removal_follows_policy() {
    let fleet = TestFleet::new(3);
    let session = fleet.cluster("dev", &[1, 2, 3]).await;
    fleet.sim.set_reachable(fleet.addr(3), false).unwrap();
    let coordinator = MembershipCoordinator::new(&session);

    let err = coordinator
        .remove_instance(
            "dev",
            fleet.addr(3),
            &RemoveInstanceOptions {
                unreachable_policy: Some(UnreachablePolicy::Reject),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "connection");

    let report = coordinator
        .remove_instance("dev", fleet.addr(3), &RemoveInstanceOptions::default())
        .await
        .unwrap();
    assert!(report.degraded);
    assert!(!report.warnings.is_empty());
    let description = StatusReporter::new(&session).describe("dev").await.unwrap();
    assert_eq!(description.instances.len(), 2);
}

#[tokio::test]
async fn test_concurrent_view_change_unwinds_add() {
    let fleet = TestFleet::new(3);
    let session = fleet.cluster("dev", &[1, 2]).await;
    fleet
        .sim
        .inject(fleet.addr(1), Fault::DriftOnCreateAccount)
        .unwrap();
    let coordinator = MembershipCoordinator::new(&session);

    let err = coordinator
        .add_instance("dev", fleet.addr(3), &AddInstanceOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "conflict");
    assert!(!fleet.sim.has_account(fleet.addr(1), "clusteradm_recovery_3").unwrap());
    assert!(fleet.sim.group_members(fleet.addr(3)).is_empty());

    coordinator
        .add_instance("dev", fleet.addr(3), &AddInstanceOptions::default())
        .await
        .unwrap();
    assert_eq!(fleet.sim.group_members(fleet.addr(1)).len(), 3);
}

#[tokio::test]
async fn test_expelled_member_rejoins() {
    let fleet = TestFleet::new(3);
    let session = fleet.cluster("dev", &[1, 2, 3]).await;
    fleet.sim.expel(fleet.addr(3)).unwrap();
    let reporter = StatusReporter::new(&session);
    let status = reporter.status("dev", &StatusOptions::default()).await.unwrap();
    assert_ne!(
        status.member(fleet.addr(3)).unwrap().status,
        MemberStatus::Online
    );

    MembershipCoordinator::new(&session)
        .rejoin_instance("dev", fleet.addr(3), &Default::default())
        .await
        .unwrap();
    let status = reporter.status("dev", &StatusOptions::default()).await.unwrap();
    assert_eq!(status.status, ClusterHealth::Ok);
    assert_eq!(
        status.member(fleet.addr(3)).unwrap().status,
        MemberStatus::Online
    );
}

#[tokio::test]
async fn test_failed_dissolve_puts_members_back() {
    let fleet = TestFleet::new(3);
    let session = fleet.cluster("dev", &[1, 2, 3]).await;
    fleet.sim.inject(fleet.addr(1), Fault::FailLeave).unwrap();
    let coordinator = MembershipCoordinator::new(&session);

    let err = coordinator
        .dissolve("dev", &DissolveOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "state");
    assert_eq!(fleet.sim.group_members(fleet.addr(1)).len(), 3);
    for user in ["clusteradm_recovery_2", "clusteradm_recovery_3"] {
        assert!(fleet.sim.has_account(fleet.addr(1), user).unwrap());
    }
    let reporter = StatusReporter::new(&session);
    assert_eq!(reporter.describe("dev").await.unwrap().instances.len(), 3);
    let status = reporter.status("dev", &StatusOptions::default()).await.unwrap();
    assert_eq!(status.status, ClusterHealth::Ok);

    coordinator
        .dissolve("dev", &DissolveOptions::default())
        .await
        .unwrap();
    for n in 1..=3 {
        assert!(fleet.sim.group_members(fleet.addr(n)).is_empty());
        assert!(!fleet.sim.has_account(fleet.addr(n), "clusteradm_recovery_2").unwrap());
    }
}

#[tokio::test]
async fn test_metadata_failure_after_leave_rejoins_member() {
    let fleet = TestFleet::new(3);
    let session = fleet.cluster("dev", &[1, 2, 3]).await;
    fleet.sim.inject(fleet.addr(1), Fault::FailMetadataWrite).unwrap();
    let coordinator = MembershipCoordinator::new(&session);

    let err = coordinator
        .remove_instance("dev", fleet.addr(3), &RemoveInstanceOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "metadata");
    assert_eq!(fleet.sim.group_members(fleet.addr(1)).len(), 3);
    let status = StatusReporter::new(&session)
        .status("dev", &StatusOptions::default())
        .await
        .unwrap();
    assert_eq!(status.status, ClusterHealth::Ok);
    assert_eq!(
        status.member(fleet.addr(3)).unwrap().status,
        MemberStatus::Online
    );

    coordinator
        .remove_instance("dev", fleet.addr(3), &RemoveInstanceOptions::default())
        .await
        .unwrap();
    assert_eq!(fleet.sim.group_members(fleet.addr(1)).len(), 2);
}
