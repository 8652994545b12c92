//! Explicit context passed to every administrative operation.
//!
//! A session is bound to one target instance. It owns the retry policy,
//! the probe, the cancellation token and the lock registry shared by the
//! operations issued through it, and decides where metadata is read from
//! and written to.

use std::sync::Arc;

use clusteradm_meta::{ClusterRecord, ClusterRole, ClusterSetId, InstanceAddress, MetadataStore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::AdminConfig;
use crate::error::{AdminError, Result};
use crate::locks::LockRegistry;
use crate::options::{SessionOptions, Validate};
use crate::probe::InstanceProbe;
use crate::retry::RetryExecutor;
use crate::rpc::{GroupMemberState, GroupView, InstanceAdmin};
use crate::saga::Saga;

/// Handle bound to one target instance.
pub struct ManagementSession {
    admin: Arc<dyn InstanceAdmin>,
    target: InstanceAddress,
    options: SessionOptions,
    config: AdminConfig,
    retry: RetryExecutor,
    probe: InstanceProbe,
    cancel: CancellationToken,
    locks: LockRegistry,
}

impl ManagementSession {
    /// Connects to `target`. Fails with `Connection` when it cannot be reached.
    pub async fn open(
        admin: Arc<dyn InstanceAdmin>,
        target: InstanceAddress,
        options: SessionOptions,
        config: AdminConfig,
    ) -> Result<Self> {
        options.validate()?;
        let retry = RetryExecutor::new(config.retry_config());
        let probe = InstanceProbe::new(admin.clone(), retry.clone());
        let facts = probe.facts(&target).await?;
        info!(
            target = %target,
            version = %facts.version,
            connect_to_primary = options.connect_to_primary,
            "session opened"
        );
        Ok(Self {
            admin,
            target,
            options,
            config,
            retry,
            probe,
            cancel: CancellationToken::new(),
            locks: LockRegistry::new(),
        })
    }

    /// Shares a lock registry with other sessions of the same process.
    pub fn with_locks(mut self, locks: LockRegistry) -> Self {
        self.locks = locks;
        self
    }

    pub fn admin(&self) -> &Arc<dyn InstanceAdmin> {
        &self.admin
    }

    pub fn target(&self) -> &InstanceAddress {
        &self.target
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn config(&self) -> &AdminConfig {
        &self.config
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    pub fn probe(&self) -> &InstanceProbe {
        &self.probe
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    /// Token observed by every saga started from this session.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Requests cancellation; running operations unwind at their next step.
    pub fn cancel(&self) {
        info!(target = %self.target, "session cancelled");
        self.cancel.cancel();
    }

    pub fn saga(&self, operation: &'static str, target: impl Into<String>) -> Saga {
        Saga::new(
            operation,
            target,
            self.admin.clone(),
            self.retry.clone(),
            self.cancel.clone(),
        )
    }

    /// Metadata schema held by `address`.
    pub async fn metadata_at(&self, address: &InstanceAddress) -> Result<MetadataStore> {
        let admin = &self.admin;
        let kv = self
            .retry
            .run("open metadata", move || admin.metadata_store(address))
            .await?;
        Ok(MetadataStore::new(kv))
    }

    /// Live view of the target's group, `None` when it is standalone.
    pub async fn target_view(&self) -> Result<Option<GroupView>> {
        self.probe.view(&self.target).await
    }

    /// Instance metadata is read from: the primary when `connect_to_primary`
    /// is set and one is reachable, the target otherwise.
    pub async fn read_source(&self) -> InstanceAddress {
        if self.options.connect_to_primary {
            if let Ok(Some(view)) = self.target_view().await {
                if let Some(primary) = view.primary() {
                    return primary.address.clone();
                }
            }
        }
        self.target.clone()
    }

    pub async fn read_metadata(&self) -> Result<MetadataStore> {
        let source = self.read_source().await;
        debug!(source = %source, "reading metadata");
        self.metadata_at(&source).await
    }

    /// Instance mutations go through: the ONLINE primary of the target's
    /// group, or the target itself when it is a writable standalone server.
    ///
    /// Fails with `ReadOnly` when neither exists.
    pub async fn require_primary(&self) -> Result<InstanceAddress> {
        match self.target_view().await? {
            Some(view) => {
                let own = view.member_by_address(&self.target).map(|m| m.state);
                if own == Some(GroupMemberState::Error) {
                    return Err(AdminError::ReadOnly(format!(
                        "{} is in ERROR state and cannot reach the PRIMARY",
                        self.target
                    )));
                }
                view.primary().map(|p| p.address.clone()).ok_or_else(|| {
                    AdminError::ReadOnly(format!(
                        "no reachable PRIMARY in the group of {}",
                        self.target
                    ))
                })
            }
            None => {
                let facts = self.probe.facts(&self.target).await?;
                if facts.super_read_only {
                    Err(AdminError::ReadOnly(format!(
                        "{} is a standalone server running with super_read_only",
                        self.target
                    )))
                } else {
                    Ok(self.target.clone())
                }
            }
        }
    }

    /// Live view of a registered cluster, asking its members in turn and
    /// preferring a view that has a primary.
    pub async fn cluster_view(&self, record: &ClusterRecord) -> Result<Option<GroupView>> {
        let mut fallback = None;
        for instance in &record.instances {
            let view = match self.probe.view(&instance.address).await {
                Ok(Some(view)) => view,
                Ok(None) => continue,
                Err(e) => {
                    debug!(address = %instance.address, error = %e, "member view unavailable");
                    continue;
                }
            };
            if view.group_name != record.group_name {
                continue;
            }
            let own = view.member(&instance.server_uuid).map(|m| m.state);
            if own == Some(GroupMemberState::Error) {
                continue;
            }
            if view.primary().is_some() {
                return Ok(Some(view));
            }
            fallback.get_or_insert(view);
        }
        Ok(fallback)
    }

    /// Primary instance of the primary cluster of a cluster set, where
    /// metadata writes of every member cluster go.
    pub async fn cluster_set_primary(
        &self,
        store: &MetadataStore,
        set_id: &ClusterSetId,
    ) -> Result<InstanceAddress> {
        let set = store.cluster_set(set_id)?;
        let member = set.primary().ok_or_else(|| {
            AdminError::State(format!(
                "cluster set '{}' has no PRIMARY cluster",
                set.domain_name
            ))
        })?;
        let cluster = store.cluster(&member.cluster_id)?;
        let view = self.cluster_view(&cluster).await?;
        view.as_ref()
            .and_then(|v| v.primary())
            .map(|p| p.address.clone())
            .ok_or_else(|| {
                AdminError::ReadOnly(format!(
                    "PRIMARY cluster '{}' of cluster set '{}' has no reachable primary",
                    cluster.name, set.domain_name
                ))
            })
    }

    /// Waits until `replica` has applied every transaction `source` has
    /// executed so far. Fails with `Timeout` after the sync timeout.
    pub async fn wait_for_sync(
        &self,
        replica: &InstanceAddress,
        source: &InstanceAddress,
    ) -> Result<()> {
        let wanted = self.probe.facts(source).await?.gtid_executed;
        let timeout = self.config.sync_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            let applied = self.probe.facts(replica).await?.gtid_executed;
            if wanted.is_subset_of(&applied) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(AdminError::Timeout {
                    operation: format!("waiting for {} to catch up with {}", replica, source),
                    after_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// Store that accepts metadata writes for `record`, given the primary of
    /// its own group. Replica clusters write through the cluster set's
    /// global primary.
    pub async fn metadata_writer(
        &self,
        record: &ClusterRecord,
        local_primary: &InstanceAddress,
        local: &MetadataStore,
    ) -> Result<(InstanceAddress, MetadataStore)> {
        match &record.cluster_set {
            Some(link) if link.role == ClusterRole::Replica => {
                let global = self.cluster_set_primary(local, &link.cluster_set_id).await?;
                let store = self.metadata_at(&global).await?;
                Ok((global, store))
            }
            _ => Ok((local_primary.clone(), local.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimFleet;

    async fn session(fleet: &SimFleet, target: &InstanceAddress) -> Result<ManagementSession> {
        ManagementSession::open(
            Arc::new(fleet.clone()),
            target.clone(),
            SessionOptions::default(),
            AdminConfig::fast(),
        )
        .await
    }

    #[tokio::test]
    async fn test_open_unreachable_target_fails() {
        let fleet = SimFleet::new();
        let a = fleet.provision_default("db1:3306", 1).unwrap();
        fleet.set_reachable(&a, false).unwrap();
        let err = session(&fleet, &a).await.err().unwrap();
        assert_eq!(err.code(), "connection");
    }

    #[tokio::test]
    async fn test_standalone_writable_target_is_its_own_primary() {
        let fleet = SimFleet::new();
        let a = fleet.provision_default("db1:3306", 1).unwrap();
        let s = session(&fleet, &a).await.unwrap();
        assert_eq!(s.require_primary().await.unwrap(), a);
        assert_eq!(s.read_source().await, a);
    }

    #[tokio::test]
    async fn test_read_only_standalone_has_no_primary() {
        let fleet = SimFleet::new();
        let a = fleet.provision_default("db1:3306", 1).unwrap();
        fleet.set_super_read_only(&a, true).await.unwrap();
        let s = session(&fleet, &a).await.unwrap();
        assert_eq!(s.require_primary().await.unwrap_err().code(), "read-only");
    }

    #[tokio::test]
    async fn test_cancel_reaches_sagas() {
        let fleet = SimFleet::new();
        let a = fleet.provision_default("db1:3306", 1).unwrap();
        let s = session(&fleet, &a).await.unwrap();
        let mut saga = s.saga("test", "db1");
        saga.checkpoint("first").unwrap();
        s.cancel();
        assert_eq!(saga.checkpoint("second").unwrap_err().code(), "cancelled");
    }
}
