//! Cluster sets: one writable primary cluster and fenced replica clusters.
//!
//! Each replica cluster's primary runs the `clusterset_replication` channel
//! from the primary cluster's primary. Metadata lives in the primary
//! cluster and reaches the replicas through that channel, so every write
//! goes through the global primary.

use clusteradm_meta::{
    ClusterRecord, ClusterRole, ClusterSetMember, ClusterSetRecord, InstanceAddress,
    InstanceRecord, MetadataStore, NewCluster, TopologyMode,
};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coordinator::MembershipCoordinator;
use crate::error::{AdminError, Result};
use crate::locks::{cluster_key, cluster_set_key};
use crate::options::{
    validate_name, CreateReplicaClusterOptions, ForcePrimaryClusterOptions, RemoveClusterOptions,
    Validate,
};
use crate::rpc::{
    ChannelSpec, ChannelStatus, GroupMemberState, GroupSettings, InstanceFacts, MemberSettings,
    ReplicationAccount, CLUSTERSET_CHANNEL,
};
use crate::saga::{Compensation, OperationReport, Saga};
use crate::session::ManagementSession;
use crate::status::{cluster_health, ClusterHealth};
use crate::validator::RejectReason;

/// Replication state of one member cluster as seen from the set.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GlobalStatus {
    Ok,
    /// Reachable, but the inbound channel is stopped or failing
    NotOk,
    Invalidated,
    /// No member answered
    Unknown,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterSetHealth {
    Healthy,
    /// The primary cluster is available but some replica is not
    Available,
    Unavailable,
}

#[derive(Clone, Debug, Serialize)]
pub struct MemberClusterStatus {
    pub cluster_name: String,
    pub role: ClusterRole,
    pub global_status: GlobalStatus,
    pub health: ClusterHealth,
    pub primary: Option<InstanceAddress>,
    pub channel: Option<ChannelStatus>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ClusterSetStatus {
    pub domain_name: String,
    pub primary_cluster: Option<String>,
    pub status: ClusterSetHealth,
    pub clusters: Vec<MemberClusterStatus>,
}

impl ClusterSetStatus {
    pub fn cluster(&self, name: &str) -> Option<&MemberClusterStatus> {
        self.clusters.iter().find(|c| c.cluster_name == name)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct MemberClusterDescription {
    pub cluster_name: String,
    pub role: ClusterRole,
    pub invalidated: bool,
    pub instances: Vec<InstanceAddress>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ClusterSetDescription {
    pub domain_name: String,
    pub clusters: Vec<MemberClusterDescription>,
}

/// A member cluster resolved to its live primary.
struct LiveCluster {
    record: ClusterRecord,
    primary: InstanceAddress,
}

impl LiveCluster {
    /// Replication user the cluster's primary authenticates with.
    fn channel_user(&self) -> Result<String> {
        self.record
            .instance_by_address(&self.primary)
            .and_then(|i| i.recovery_account.clone())
            .ok_or_else(|| {
                AdminError::State(format!(
                    "primary {} of cluster '{}' has no replication account registered",
                    self.primary, self.record.name
                ))
            })
    }
}

fn cluster_set_named(store: &MetadataStore, domain: &str) -> Result<ClusterSetRecord> {
    store
        .cluster_set_by_name(domain)?
        .ok_or_else(|| AdminError::State(format!("cluster set '{}' does not exist", domain)))
}

fn member_named<'r>(set: &'r ClusterSetRecord, name: &str) -> Result<&'r ClusterSetMember> {
    set.member_by_name(name).ok_or_else(|| AdminError::NotMember {
        address: name.to_string(),
        topology: format!("cluster set '{}'", set.domain_name),
    })
}

fn channel_spec(source: &InstanceAddress, user: String) -> ChannelSpec {
    ChannelSpec {
        name: CLUSTERSET_CHANNEL.to_string(),
        source: source.clone(),
        user,
    }
}

/// Multi-cluster topology operations through one session.
pub struct ClusterSetManager<'a> {
    session: &'a ManagementSession,
    coordinator: MembershipCoordinator<'a>,
}

impl<'a> ClusterSetManager<'a> {
    pub fn new(session: &'a ManagementSession) -> Self {
        Self {
            session,
            coordinator: MembershipCoordinator::new(session),
        }
    }

    async fn live(&self, record: ClusterRecord) -> Result<Option<LiveCluster>> {
        let view = self.session.cluster_view(&record).await?;
        Ok(view.and_then(|view| {
            let primary = view.primary()?.address.clone();
            Some(LiveCluster { record, primary })
        }))
    }

    async fn require_live(&self, record: ClusterRecord) -> Result<LiveCluster> {
        let name = record.name.clone();
        self.live(record).await?.ok_or_else(|| {
            AdminError::State(format!("cluster '{}' has no reachable PRIMARY", name))
        })
    }

    /// Global primary and its store, with the set reloaded from it.
    async fn global(&self, domain: &str) -> Result<(InstanceAddress, MetadataStore, ClusterSetRecord)> {
        let local = self.session.read_metadata().await?;
        let set = cluster_set_named(&local, domain)?;
        let primary = self.session.cluster_set_primary(&local, &set.id).await?;
        let store = self.session.metadata_at(&primary).await?;
        let set = store.cluster_set(&set.id)?;
        Ok((primary, store, set))
    }

    /// Turns `cluster` into the primary of a new cluster set.
    pub async fn create_cluster_set(&self, cluster: &str, domain: &str) -> Result<OperationReport> {
        validate_name("cluster set", domain)?;
        let _set_guard = self.session.locks().acquire(&cluster_set_key(domain)).await;
        let _guard = self.session.locks().acquire(&cluster_key(cluster)).await;

        let ctx = self.coordinator.writable(cluster).await?;
        if ctx.record.in_cluster_set() {
            return Err(AdminError::State(format!(
                "cluster '{}' already belongs to a cluster set",
                cluster
            )));
        }
        if ctx.store.cluster_set_by_name(domain)?.is_some() {
            return Err(AdminError::DuplicateName {
                kind: "cluster set",
                name: domain.to_string(),
            });
        }
        if !ctx.view.has_quorum() {
            return Err(AdminError::Quorum(format!(
                "cluster '{}' has no quorum",
                cluster
            )));
        }
        if let Some(m) = ctx
            .view
            .members
            .iter()
            .find(|m| m.state == GroupMemberState::Recovering)
        {
            return Err(AdminError::State(format!(
                "{} is still RECOVERING, wait for it to come ONLINE",
                m.address
            )));
        }
        let primary_gtids = self.session.probe().facts(&ctx.primary).await?.gtid_executed;
        for member in ctx.view.online() {
            let facts = self.session.probe().facts(&member.address).await?;
            let errant = facts.gtid_executed.difference(&primary_gtids);
            if !errant.is_empty() {
                return Err(AdminError::State(format!(
                    "{} has errant transactions: {}",
                    member.address, errant
                )));
            }
        }

        let mut saga = self.session.saga("create_cluster_set", domain);
        saga.checkpoint("register cluster set")?;
        ctx.store.create_cluster_set(domain, &ctx.record)?;
        info!(domain, primary_cluster = cluster, "cluster set created");
        Ok(saga.commit())
    }

    /// Bootstraps a new replica cluster on the standalone `seed`.
    pub async fn create_replica_cluster(
        &self,
        domain: &str,
        name: &str,
        seed: &InstanceAddress,
        options: &CreateReplicaClusterOptions,
    ) -> Result<OperationReport> {
        options.validate()?;
        validate_name("cluster", name)?;
        let _set_guard = self.session.locks().acquire(&cluster_set_key(domain)).await;
        let _guard = self.session.locks().acquire(&cluster_key(name)).await;

        let (global, store, set) = self.global(domain).await?;
        if store.cluster_by_name(name)?.is_some() {
            return Err(AdminError::DuplicateName {
                kind: "cluster",
                name: name.to_string(),
            });
        }

        let report = self.session.probe().probe(seed).await?;
        let warnings = report.ensure_admissible()?;
        if !report.is_standalone() {
            return Err(AdminError::State(format!(
                "{} is already running group replication",
                seed
            )));
        }
        if let Some(owner) = store.owner_of(&report.facts.server_uuid)? {
            return Err(RejectReason::MemberOfAnotherCluster {
                owner: owner.to_string(),
            }
            .into_error(seed));
        }
        for record in store.clusters()? {
            if let Some(holder) = record
                .instances
                .iter()
                .find(|i| i.server_id == report.facts.server_id)
            {
                return Err(RejectReason::DuplicateServerId {
                    server_id: report.facts.server_id,
                    holder: holder.address.clone(),
                }
                .into_error(seed));
            }
        }
        let global_gtids = self.session.probe().facts(&global).await?.gtid_executed;
        let errant = report.facts.gtid_executed.difference(&global_gtids);
        if !errant.is_empty() {
            return Err(AdminError::State(format!(
                "{} has transactions the cluster set does not: {}",
                seed, errant
            )));
        }

        let mut saga = self.session.saga("create_replica_cluster", format!("{}/{}", domain, name));
        saga.warn_all(warnings);
        let result = self
            .replica_cluster_steps(&mut saga, &global, &store, &set, name, &report.facts, options)
            .await;
        match result {
            Ok(()) => Ok(saga.commit()),
            Err(e) => Err(saga.abort(e).await),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn replica_cluster_steps(
        &self,
        saga: &mut Saga,
        global: &InstanceAddress,
        store: &MetadataStore,
        set: &ClusterSetRecord,
        name: &str,
        facts: &InstanceFacts,
        options: &CreateReplicaClusterOptions,
    ) -> Result<()> {
        let admin = self.session.admin();
        let retry = self.session.retry();
        let seed = &facts.address;

        if facts.super_read_only {
            saga.checkpoint("disable super_read_only")?;
            retry
                .run("set super_read_only", move || {
                    admin.set_super_read_only(seed, false)
                })
                .await?;
            saga.record(Compensation::SetSuperReadOnly {
                address: seed.clone(),
                enabled: true,
            });
        }

        saga.checkpoint("create replication account")?;
        let account = ReplicationAccount::generate(
            &self.session.config().recovery_account_prefix,
            facts.server_id,
        );
        let acct = &account;
        retry
            .run("create account", move || admin.create_account(global, acct))
            .await?;
        saga.record(Compensation::DropAccount {
            address: global.clone(),
            user: account.user.clone(),
        });

        saga.checkpoint("bootstrap group")?;
        let cluster_options = options.cluster_options();
        let group_name = Uuid::new_v4();
        let settings = GroupSettings {
            group_name,
            mode: TopologyMode::SinglePrimary,
            ssl_mode: cluster_options.member_ssl_mode,
            consistency: cluster_options.consistency,
            expel_timeout: cluster_options.expel_timeout,
            member: MemberSettings {
                exit_state_action: cluster_options.exit_state_action,
                member_weight: cluster_options.member_weight,
                auto_rejoin_tries: cluster_options.auto_rejoin_tries,
                local_address: cluster_options.local_address.clone(),
            },
        };
        retry
            .once("bootstrap group", admin.bootstrap_group(seed, &settings))
            .await?;
        saga.record(Compensation::SetSuperReadOnly {
            address: seed.clone(),
            enabled: false,
        });
        saga.record(Compensation::LeaveGroup {
            address: seed.clone(),
        });
        self.coordinator.wait_online(seed, seed).await?;

        saga.checkpoint("start cluster set channel")?;
        let spec = channel_spec(global, account.user.clone());
        let channel = &spec;
        retry
            .once("start channel", admin.start_channel(seed, channel))
            .await?;
        saga.record(Compensation::StopChannel {
            address: seed.clone(),
            channel: CLUSTERSET_CHANNEL.to_string(),
        });

        saga.checkpoint("fence replica cluster")?;
        retry
            .run("fence group", move || admin.set_group_fenced(seed, true))
            .await?;
        saga.record(Compensation::SetGroupFenced {
            address: seed.clone(),
            fenced: false,
        });

        saga.checkpoint("wait for catch-up")?;
        self.session.wait_for_sync(seed, global).await?;

        saga.checkpoint("register replica cluster")?;
        let mut instance =
            InstanceRecord::new(seed.clone(), facts.server_uuid, facts.server_id, facts.version);
        instance.recovery_account = Some(account.user.clone());
        store.register_replica_cluster(
            set,
            NewCluster {
                name: name.to_string(),
                group_name,
                topology_mode: TopologyMode::SinglePrimary,
                seed: instance,
                attributes: cluster_options.to_attributes(),
            },
            CLUSTERSET_CHANNEL,
        )?;
        info!(domain = %set.domain_name, cluster = name, seed = %seed, "replica cluster created");
        Ok(())
    }

    /// Detaches a replica cluster from the set.
    ///
    /// Waits for the channel to drain unless forced, then stops it and
    /// deregisters the cluster. With `dissolve` the cluster is dissolved as
    /// well; otherwise it stays up as an independent, unfenced cluster.
    pub async fn remove_cluster(
        &self,
        domain: &str,
        name: &str,
        options: &RemoveClusterOptions,
    ) -> Result<OperationReport> {
        options.validate()?;
        let _set_guard = self.session.locks().acquire(&cluster_set_key(domain)).await;
        let _guard = self.session.locks().acquire(&cluster_key(name)).await;

        let (global, store, set) = self.global(domain).await?;
        let member = member_named(&set, name)?;
        if member.role == ClusterRole::Primary {
            return Err(AdminError::State(format!(
                "cluster '{}' is the PRIMARY of cluster set '{}', promote another cluster first",
                name, domain
            )));
        }
        let record = store.cluster(&member.cluster_id)?;
        let view = self.session.cluster_view(&record).await?;
        let primary = view
            .as_ref()
            .and_then(|v| v.primary())
            .map(|p| p.address.clone());
        if primary.is_none() && !options.force {
            return Err(AdminError::State(format!(
                "cluster '{}' has no reachable PRIMARY, use force to remove it from metadata only",
                name
            )));
        }
        if let (Some(primary), false) = (&primary, options.force) {
            self.session.wait_for_sync(primary, &global).await?;
        }

        let mut saga = self.session.saga("remove_cluster", format!("{}/{}", domain, name));
        let result = async {
            if let Some(primary) = &primary {
                self.detach(&mut saga, &record, primary, &global).await?;
            } else {
                saga.degrade(format!(
                    "cluster '{}' is unreachable, its channel and fencing were left in place",
                    name
                ));
            }

            saga.checkpoint("deregister cluster")?;
            store.deregister_cluster(&set, &record)?;

            match (&primary, options.dissolve) {
                (Some(_), true) => {
                    self.coordinator
                        .dissolve_steps(&mut saga, &record, view.as_ref(), options.force)
                        .await?;
                }
                (Some(primary), false) => {
                    self.unlink(&record, primary, &set).await?;
                    saga.warn(format!(
                        "cluster '{}' keeps running as an independent cluster",
                        name
                    ));
                }
                (None, _) => {}
            }
            Ok::<(), AdminError>(())
        }
        .await;
        match result {
            Ok(()) => {
                info!(domain, cluster = name, dissolved = options.dissolve, "cluster removed from set");
                Ok(saga.commit())
            }
            Err(e) => Err(saga.abort(e).await),
        }
    }

    /// Stops the inbound channel and lifts fencing on a replica cluster.
    async fn detach(
        &self,
        saga: &mut Saga,
        record: &ClusterRecord,
        primary: &InstanceAddress,
        global: &InstanceAddress,
    ) -> Result<()> {
        let admin = self.session.admin();
        let retry = self.session.retry();
        saga.checkpoint("stop cluster set channel")?;
        retry
            .run("stop channel", move || {
                admin.stop_channel(primary, CLUSTERSET_CHANNEL)
            })
            .await?;
        if let Some(user) = record
            .instance_by_address(primary)
            .and_then(|i| i.recovery_account.clone())
        {
            saga.record(Compensation::StartChannel {
                address: primary.clone(),
                spec: channel_spec(global, user),
            });
        }
        saga.checkpoint("unfence cluster")?;
        retry
            .run("fence group", move || admin.set_group_fenced(primary, false))
            .await?;
        saga.record(Compensation::SetGroupFenced {
            address: primary.clone(),
            fenced: true,
        });
        Ok(())
    }

    /// Clears the set from a detached cluster's own metadata copy: the other
    /// member clusters and the set record go, the cluster itself stays.
    async fn unlink(
        &self,
        record: &ClusterRecord,
        primary: &InstanceAddress,
        set: &ClusterSetRecord,
    ) -> Result<()> {
        let own = self.session.metadata_at(primary).await?;
        for mut cluster in own.clusters()? {
            let linked = cluster
                .cluster_set
                .as_ref()
                .is_some_and(|l| l.cluster_set_id == set.id);
            if !linked {
                continue;
            }
            if cluster.id == record.id {
                cluster.cluster_set = None;
                own.update_cluster(&cluster)?;
            } else {
                own.delete_cluster(&cluster.id)?;
            }
        }
        if own.cluster_set_by_name(&set.domain_name)?.is_some() {
            own.delete_cluster_set(&set.id)?;
        }
        Ok(())
    }

    /// Planned switchover of the primary role to cluster `name`.
    pub async fn set_primary_cluster(&self, domain: &str, name: &str) -> Result<OperationReport> {
        let _set_guard = self.session.locks().acquire(&cluster_set_key(domain)).await;
        let (_, store, set) = self.global(domain).await?;
        let target = member_named(&set, name)?;
        if target.role == ClusterRole::Primary {
            return Err(AdminError::State(format!(
                "cluster '{}' is already the PRIMARY of cluster set '{}'",
                name, domain
            )));
        }
        if target.invalidated {
            return Err(AdminError::State(format!(
                "cluster '{}' was invalidated and must be removed from the set",
                name
            )));
        }

        let mut members = Vec::new();
        for member in set.members.iter().filter(|m| !m.invalidated) {
            let record = store.cluster(&member.cluster_id)?;
            let live = self.live(record).await?.ok_or_else(|| {
                AdminError::State(format!(
                    "cluster '{}' is not reachable, a switchover needs every cluster available",
                    member.cluster_name
                ))
            })?;
            members.push((member.role, live));
        }
        let old = members
            .iter()
            .position(|(role, _)| *role == ClusterRole::Primary)
            .ok_or_else(|| AdminError::State(format!("cluster set '{}' has no PRIMARY", domain)))?;
        let new = members
            .iter()
            .position(|(_, l)| l.record.name == name)
            .ok_or_else(|| AdminError::State(format!("cluster '{}' is not reachable", name)))?;
        let lives: Vec<LiveCluster> = members.into_iter().map(|(_, l)| l).collect();

        let mut saga = self.session.saga("set_primary_cluster", format!("{}/{}", domain, name));
        match self.switchover_steps(&mut saga, &set, &lives, old, new).await {
            Ok(()) => Ok(saga.commit()),
            Err(e) => Err(saga.abort(e).await),
        }
    }

    async fn switchover_steps(
        &self,
        saga: &mut Saga,
        set: &ClusterSetRecord,
        clusters: &[LiveCluster],
        old: usize,
        new: usize,
    ) -> Result<()> {
        let admin = self.session.admin();
        let retry = self.session.retry();
        let old_primary = &clusters[old].primary;
        let new_primary = &clusters[new].primary;

        saga.checkpoint("fence PRIMARY cluster")?;
        retry
            .run("fence group", move || admin.set_group_fenced(old_primary, true))
            .await?;
        saga.record(Compensation::SetGroupFenced {
            address: old_primary.clone(),
            fenced: false,
        });

        saga.checkpoint("wait for catch-up")?;
        self.session.wait_for_sync(new_primary, old_primary).await?;

        self.detach(saga, &clusters[new].record, new_primary, old_primary)
            .await?;

        for (i, cluster) in clusters.iter().enumerate().filter(|(i, _)| *i != new) {
            let previous = (i != old).then_some(old_primary);
            self.repoint(saga, cluster, new_primary, previous).await?;
        }

        saga.checkpoint("update metadata")?;
        let store = self.session.metadata_at(new_primary).await?;
        self.swap_roles(&store, set, &clusters[new].record.name, &[])?;
        info!(domain = %set.domain_name, primary_cluster = %clusters[new].record.name, "cluster set switchover complete");
        Ok(())
    }

    /// Points a cluster's inbound channel at `source` and fences it.
    async fn repoint(
        &self,
        saga: &mut Saga,
        cluster: &LiveCluster,
        source: &InstanceAddress,
        previous: Option<&InstanceAddress>,
    ) -> Result<()> {
        let admin = self.session.admin();
        let retry = self.session.retry();
        let primary = &cluster.primary;
        let user = cluster.channel_user()?;
        saga.checkpoint(&format!("repoint cluster '{}'", cluster.record.name))?;
        retry
            .run("stop channel", move || {
                admin.stop_channel(primary, CLUSTERSET_CHANNEL)
            })
            .await?;
        if let Some(previous) = previous {
            saga.record(Compensation::StartChannel {
                address: primary.clone(),
                spec: channel_spec(previous, user.clone()),
            });
        }
        let spec = channel_spec(source, user);
        let channel = &spec;
        retry
            .once("start channel", admin.start_channel(primary, channel))
            .await?;
        saga.record(Compensation::StopChannel {
            address: primary.clone(),
            channel: CLUSTERSET_CHANNEL.to_string(),
        });
        retry
            .run("fence group", move || admin.set_group_fenced(primary, true))
            .await?;
        Ok(())
    }

    /// Writes the new role assignment into `store`.
    fn swap_roles(
        &self,
        store: &MetadataStore,
        set: &ClusterSetRecord,
        new_primary: &str,
        invalidate: &[String],
    ) -> Result<()> {
        let mut next = store.cluster_set(&set.id)?;
        for member in next.members.iter_mut() {
            let promoted = member.cluster_name == new_primary;
            member.role = if promoted {
                ClusterRole::Primary
            } else {
                ClusterRole::Replica
            };
            member.channel = (!promoted).then(|| CLUSTERSET_CHANNEL.to_string());
            if invalidate.contains(&member.cluster_name) {
                member.invalidated = true;
            }
        }
        store.update_cluster_set(&next)?;
        for member in &next.members {
            let mut record = store.cluster(&member.cluster_id)?;
            if let Some(link) = record.cluster_set.as_mut() {
                if link.role != member.role {
                    link.role = member.role;
                    store.update_cluster(&record)?;
                }
            }
        }
        debug!(domain = %set.domain_name, primary_cluster = new_primary, "cluster set roles written");
        Ok(())
    }

    /// Unplanned failover to cluster `name` while the primary cluster is
    /// unavailable. The old primary cluster is invalidated; unreachable
    /// replica clusters must be listed in `invalidate_replica_clusters`.
    pub async fn force_primary_cluster(
        &self,
        domain: &str,
        name: &str,
        options: &ForcePrimaryClusterOptions,
    ) -> Result<OperationReport> {
        options.validate()?;
        let _set_guard = self.session.locks().acquire(&cluster_set_key(domain)).await;
        let local = self.session.read_metadata().await?;
        let set = cluster_set_named(&local, domain)?;
        let target = member_named(&set, name)?;
        if target.role == ClusterRole::Primary {
            return Err(AdminError::State(format!(
                "cluster '{}' is already the PRIMARY of cluster set '{}'",
                name, domain
            )));
        }
        if target.invalidated {
            return Err(AdminError::State(format!("cluster '{}' was invalidated", name)));
        }
        let old = set
            .primary()
            .ok_or_else(|| AdminError::State(format!("cluster set '{}' has no PRIMARY", domain)))?;
        let old_record = local.cluster(&old.cluster_id)?;
        if self.live(old_record).await?.is_some() {
            return Err(AdminError::State(format!(
                "PRIMARY cluster '{}' is available, use set_primary_cluster",
                old.cluster_name
            )));
        }
        let promoted = self
            .require_live(local.cluster(&target.cluster_id)?)
            .await?;

        let mut invalidate = vec![old.cluster_name.clone()];
        let mut followers = Vec::new();
        for member in set.replicas().filter(|m| m.cluster_name != name && !m.invalidated) {
            let record = local.cluster(&member.cluster_id)?;
            match self.live(record).await? {
                Some(live) => followers.push(live),
                None if options.invalidate_replica_clusters.contains(&member.cluster_name) => {
                    invalidate.push(member.cluster_name.clone())
                }
                None => {
                    return Err(AdminError::State(format!(
                        "cluster '{}' is unreachable, list it in invalidate_replica_clusters",
                        member.cluster_name
                    )))
                }
            }
        }

        let mut saga = self.session.saga("force_primary_cluster", format!("{}/{}", domain, name));
        let result = async {
            let admin = self.session.admin();
            let retry = self.session.retry();
            let primary = &promoted.primary;
            saga.checkpoint("stop cluster set channel")?;
            retry
                .run("stop channel", move || {
                    admin.stop_channel(primary, CLUSTERSET_CHANNEL)
                })
                .await?;
            saga.checkpoint("unfence cluster")?;
            retry
                .run("fence group", move || admin.set_group_fenced(primary, false))
                .await?;
            saga.record(Compensation::SetGroupFenced {
                address: primary.clone(),
                fenced: true,
            });
            for follower in &followers {
                self.repoint(&mut saga, follower, primary, None).await?;
            }
            saga.checkpoint("update metadata")?;
            let store = self.session.metadata_at(primary).await?;
            self.swap_roles(&store, &set, name, &invalidate)?;
            Ok::<(), AdminError>(())
        }
        .await;
        match result {
            Ok(()) => {
                saga.data_loss(format!(
                    "transactions of PRIMARY cluster '{}' not replicated before the failover are lost",
                    old.cluster_name
                ));
                warn!(domain, primary_cluster = name, invalidated = ?invalidate, "forced cluster set failover");
                Ok(saga.commit())
            }
            Err(e) => Err(saga.abort(e).await),
        }
    }

    /// Role, health and channel state of every member cluster.
    pub async fn status(&self, domain: &str) -> Result<ClusterSetStatus> {
        let store = self.session.read_metadata().await?;
        let set = cluster_set_named(&store, domain)?;
        let records = set
            .members
            .iter()
            .map(|m| store.cluster(&m.cluster_id))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let clusters = join_all(
            set.members
                .iter()
                .zip(records)
                .map(|(member, record)| self.member_status(member, record)),
        )
        .await;

        let primary_ok = clusters
            .iter()
            .any(|c| c.role == ClusterRole::Primary && c.global_status == GlobalStatus::Ok);
        let all_ok = clusters.iter().all(|c| c.global_status == GlobalStatus::Ok);
        let status = match (primary_ok, all_ok) {
            (true, true) => ClusterSetHealth::Healthy,
            (true, false) => ClusterSetHealth::Available,
            (false, _) => ClusterSetHealth::Unavailable,
        };
        Ok(ClusterSetStatus {
            domain_name: set.domain_name.clone(),
            primary_cluster: set.primary().map(|p| p.cluster_name.clone()),
            status,
            clusters,
        })
    }

    async fn member_status(
        &self,
        member: &ClusterSetMember,
        record: ClusterRecord,
    ) -> MemberClusterStatus {
        let view = self.session.cluster_view(&record).await.ok().flatten();
        let health = cluster_health(&record, view.as_ref());
        let primary = view
            .as_ref()
            .and_then(|v| v.primary())
            .map(|p| p.address.clone());
        let mut status = MemberClusterStatus {
            cluster_name: member.cluster_name.clone(),
            role: member.role,
            global_status: GlobalStatus::Unknown,
            health,
            primary: primary.clone(),
            channel: None,
        };
        if member.invalidated {
            status.global_status = GlobalStatus::Invalidated;
            return status;
        }
        let Some(primary) = primary else {
            return status;
        };
        status.global_status = match member.role {
            ClusterRole::Primary => GlobalStatus::Ok,
            ClusterRole::Replica => {
                let admin = self.session.admin();
                let address = &primary;
                status.channel = self
                    .session
                    .retry()
                    .run("channel status", move || {
                        admin.channel_status(address, CLUSTERSET_CHANNEL)
                    })
                    .await
                    .ok()
                    .flatten();
                match &status.channel {
                    Some(c) if c.running && c.last_error.is_none() => GlobalStatus::Ok,
                    _ => GlobalStatus::NotOk,
                }
            }
        };
        status
    }

    /// Stored definition of the set; no member cluster is probed.
    pub async fn describe(&self, domain: &str) -> Result<ClusterSetDescription> {
        let store = self.session.read_metadata().await?;
        let set = cluster_set_named(&store, domain)?;
        let mut clusters = Vec::with_capacity(set.members.len());
        for member in &set.members {
            let record = store.cluster(&member.cluster_id)?;
            clusters.push(MemberClusterDescription {
                cluster_name: member.cluster_name.clone(),
                role: member.role,
                invalidated: member.invalidated,
                instances: record.instances.iter().map(|i| i.address.clone()).collect(),
            });
        }
        Ok(ClusterSetDescription {
            domain_name: set.domain_name,
            clusters,
        })
    }
}
