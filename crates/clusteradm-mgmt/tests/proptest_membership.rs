//! Property-based tests for membership changes.
//!
//! Random add and remove sequences run against a simulated fleet where
//! db5 clones the server_id of db2. After every operation, successful or
//! not, metadata and the live group must agree.

mod common;

use clusteradm_mgmt::options::{AddInstanceOptions, RemoveInstanceOptions};
use clusteradm_mgmt::{MembershipCoordinator, SimInstanceSpec, StatusReporter};
use common::TestFleet;
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Change {
    Add(usize),
    Remove(usize),
}

fn any_change() -> impl Strategy<Value = Change> {
    prop_oneof![
        (2usize..=5).prop_map(Change::Add),
        (2usize..=5).prop_map(Change::Remove),
    ]
}

async fn replay(changes: Vec<Change>) -> std::result::Result<(), TestCaseError> {
    let mut fleet = TestFleet::new(4);
    fleet.provision(SimInstanceSpec::new("db5:3306", 2));
    let session = fleet.cluster("dev", &[1]).await;
    let coordinator = MembershipCoordinator::new(&session);
    let reporter = StatusReporter::new(&session);

    for change in changes {
        let _ = match change {
            Change::Add(n) => {
                coordinator
                    .add_instance("dev", fleet.addr(n), &AddInstanceOptions::default())
                    .await
            }
            Change::Remove(n) => {
                coordinator
                    .remove_instance("dev", fleet.addr(n), &RemoveInstanceOptions::default())
                    .await
            }
        };

        let mut live = fleet.sim.group_members(fleet.addr(1));
        live.sort();
        let mut registered: Vec<_> = reporter
            .describe("dev")
            .await
            .map_err(|e| TestCaseError::fail(e.to_string()))?
            .instances
            .into_iter()
            .map(|i| i.address)
            .collect();
        registered.sort();
        prop_assert_eq!(&live, &registered);
        prop_assert!(
            !(live.contains(fleet.addr(2)) && live.contains(fleet.addr(5))),
            "duplicate server_id admitted: {:?}",
            live
        );
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Metadata and group membership never diverge, and a clone never
    /// joins next to its original.
    #[test]
    fn test_membership_matches_metadata(changes in proptest::collection::vec(any_change(), 1..8)) {
        tokio_test::block_on(replay(changes))?;
    }
}
