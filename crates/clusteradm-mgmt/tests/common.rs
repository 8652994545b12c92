//! Shared fixtures for the management integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use clusteradm_meta::{InstanceAddress, TopologyMode};
use clusteradm_mgmt::options::{
    AddInstanceOptions, ConsistencyLevel, CreateClusterOptions, MemberSslMode,
};
use clusteradm_mgmt::rpc::{GroupSettings, MemberSettings};
use clusteradm_mgmt::{
    AdminConfig, InstanceAdmin, LockRegistry, ManagementSession, MembershipCoordinator,
    SessionOptions, SimFleet, SimInstanceSpec,
};
use uuid::Uuid;

/// A simulated fleet of `db1:3306` .. `dbN:3306` with server IDs 1..N.
pub struct TestFleet {
    pub sim: SimFleet,
    addrs: Vec<InstanceAddress>,
    locks: LockRegistry,
}

impl TestFleet {
    pub fn new(instances: u32) -> Self {
        let sim = SimFleet::new();
        let addrs = (1..=instances)
            .map(|n| {
                sim.provision_default(&format!("db{}:3306", n), n)
                    .expect("provision instance")
            })
            .collect();
        Self {
            sim,
            addrs,
            locks: LockRegistry::new(),
        }
    }

    /// Provisions one more instance and returns its address.
    pub fn provision(&mut self, spec: SimInstanceSpec) -> InstanceAddress {
        let address = self.sim.provision(spec).expect("provision instance");
        self.addrs.push(address.clone());
        address
    }

    /// Address of instance `n`, counting from 1.
    pub fn addr(&self, n: usize) -> &InstanceAddress {
        &self.addrs[n - 1]
    }

    pub async fn session(&self, n: usize) -> ManagementSession {
        self.session_with(n, SessionOptions::default()).await
    }

    pub async fn session_with(&self, n: usize, options: SessionOptions) -> ManagementSession {
        ManagementSession::open(
            Arc::new(self.sim.clone()),
            self.addr(n).clone(),
            options,
            AdminConfig::fast(),
        )
        .await
        .expect("open session")
        .with_locks(self.locks.clone())
    }

    /// Creates cluster `name` seeded on the first listed instance and adds
    /// the others; returns a session on the seed.
    pub async fn cluster(&self, name: &str, members: &[usize]) -> ManagementSession {
        let session = self.session(members[0]).await;
        let coordinator = MembershipCoordinator::new(&session);
        coordinator
            .create_cluster(name, &CreateClusterOptions::default())
            .await
            .expect("create cluster");
        for &n in &members[1..] {
            coordinator
                .add_instance(name, self.addr(n), &AddInstanceOptions::default())
                .await
                .expect("add instance");
        }
        session
    }

    /// Starts a replication group on instance `n` without registering it
    /// anywhere.
    pub async fn unmanaged_group(&self, n: usize) -> Uuid {
        let group = Uuid::new_v4();
        let settings = GroupSettings {
            group_name: group,
            mode: TopologyMode::SinglePrimary,
            ssl_mode: MemberSslMode::Auto,
            consistency: ConsistencyLevel::Eventual,
            expel_timeout: 5,
            member: MemberSettings::default(),
        };
        self.sim
            .bootstrap_group(self.addr(n), &settings)
            .await
            .expect("bootstrap unmanaged group");
        group
    }
}
