//! Replica sets: one primary feeding secondaries over asynchronous channels.
//!
//! Secondaries run with `super_read_only` and replicate from the primary on
//! the default channel. Metadata is written on the primary and reaches the
//! secondaries through the same channel.

use clusteradm_meta::{
    InstanceAddress, InstanceRecord, MemberRole, MetadataStore, ReplicaSetRecord, Version,
};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{AdminError, Result};
use crate::locks::replica_set_key;
use crate::options::{validate_name, ReplicaSetAddOptions, ReplicaSetRemoveOptions, Validate};
use crate::probe::ProbeReport;
use crate::rpc::{ChannelSpec, ChannelStatus, ReplicationAccount, REPLICASET_CHANNEL};
use crate::saga::{Compensation, OperationReport, Saga};
use crate::session::ManagementSession;
use crate::validator::{RejectReason, Target, TopologyValidator};

/// Observed state of one replica set member.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaMemberState {
    Online,
    /// Replication channel stopped or failing
    Error,
    Unreachable,
    /// Left behind by a forced failover
    Invalidated,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaSetHealth {
    Available,
    /// Writable, but some secondary is not replicating
    AvailablePartial,
    Unavailable,
}

#[derive(Clone, Debug, Serialize)]
pub struct ReplicaSetMemberStatus {
    pub address: InstanceAddress,
    pub label: String,
    pub role: MemberRole,
    pub state: ReplicaMemberState,
    pub version: Option<Version>,
    pub channel: Option<ChannelStatus>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ReplicaSetStatus {
    pub name: String,
    pub primary: InstanceAddress,
    pub health: ReplicaSetHealth,
    pub members: Vec<ReplicaSetMemberStatus>,
}

struct WritableReplicaSet {
    record: ReplicaSetRecord,
    primary: InstanceAddress,
    store: MetadataStore,
}

fn replica_set_named(store: &MetadataStore, name: &str) -> Result<ReplicaSetRecord> {
    store
        .replica_set_by_name(name)?
        .ok_or_else(|| AdminError::State(format!("replica set '{}' does not exist", name)))
}

fn primary_address(record: &ReplicaSetRecord) -> Result<InstanceAddress> {
    record
        .primary_instance()
        .map(|i| i.address.clone())
        .ok_or_else(|| {
            AdminError::State(format!("replica set '{}' has no registered PRIMARY", record.name))
        })
}

fn not_member(name: &str, address: &InstanceAddress) -> AdminError {
    AdminError::NotMember {
        address: address.to_string(),
        topology: format!("replica set '{}'", name),
    }
}

/// Manages asynchronous replica sets through one session.
pub struct ReplicaSetManager<'a> {
    session: &'a ManagementSession,
}

impl<'a> ReplicaSetManager<'a> {
    pub fn new(session: &'a ManagementSession) -> Self {
        Self { session }
    }

    async fn writable(&self, name: &str) -> Result<WritableReplicaSet> {
        let local = self.session.read_metadata().await?;
        let record = replica_set_named(&local, name)?;
        let primary = primary_address(&record)?;
        let facts = match self.session.probe().facts(&primary).await {
            Ok(facts) => facts,
            Err(e) if e.is_unreachable() => {
                return Err(AdminError::ReadOnly(format!(
                    "PRIMARY {} of replica set '{}' is unreachable",
                    primary, name
                )))
            }
            Err(e) => return Err(e),
        };
        if facts.super_read_only {
            return Err(AdminError::ReadOnly(format!(
                "PRIMARY {} of replica set '{}' is running with super_read_only",
                primary, name
            )));
        }
        let store = self.session.metadata_at(&primary).await?;
        let record = replica_set_named(&store, name)?;
        Ok(WritableReplicaSet {
            record,
            primary,
            store,
        })
    }

    fn account(&self, server_id: u32) -> ReplicationAccount {
        ReplicationAccount::generate(&self.session.config().recovery_account_prefix, server_id)
    }

    /// Creates a replica set with the session target as its primary.
    pub async fn create_replica_set(&self, name: &str) -> Result<OperationReport> {
        validate_name("replica set", name)?;
        let _guard = self.session.locks().acquire(&replica_set_key(name)).await;

        let target = self.session.target().clone();
        let report = self.session.probe().probe(&target).await?;
        let warnings = report.ensure_admissible()?;
        if !report.is_standalone() {
            return Err(AdminError::State(format!(
                "{} is running group replication and cannot host a replica set",
                target
            )));
        }

        let store = self.session.metadata_at(&target).await?;
        let installed = store.is_installed()?;
        if installed {
            store.require_current()?;
            if store.replica_set_by_name(name)?.is_some() {
                return Err(AdminError::DuplicateName {
                    kind: "replica set",
                    name: name.to_string(),
                });
            }
            if let Some(owner) = store.owner_of(&report.facts.server_uuid)? {
                return Err(RejectReason::MemberOfAnotherCluster {
                    owner: owner.to_string(),
                }
                .into_error(&target));
            }
        }

        let mut saga = self.session.saga("create_replica_set", name);
        saga.warn_all(warnings);
        let result = async {
            let admin = self.session.admin();
            if report.facts.super_read_only {
                saga.checkpoint("disable super_read_only")?;
                let address = &target;
                self.session
                    .retry()
                    .run("set super_read_only", move || {
                        admin.set_super_read_only(address, false)
                    })
                    .await?;
                saga.record(Compensation::SetSuperReadOnly {
                    address: target.clone(),
                    enabled: true,
                });
            }
            if !installed {
                saga.checkpoint("install metadata schema")?;
                store.install()?;
                saga.record(Compensation::DropSchema {
                    store: store.clone(),
                });
            }
            saga.checkpoint("register replica set")?;
            let facts = &report.facts;
            store.create_replica_set(
                name,
                InstanceRecord::new(target.clone(), facts.server_uuid, facts.server_id, facts.version),
            )?;
            Ok::<(), AdminError>(())
        }
        .await;
        match result {
            Ok(()) => {
                info!(replicaset = name, primary = %target, "replica set created");
                Ok(saga.commit())
            }
            Err(e) => Err(saga.abort(e).await),
        }
    }

    /// Adds `address` as a read-only secondary replicating from the primary.
    pub async fn add_instance(
        &self,
        name: &str,
        address: &InstanceAddress,
        options: &ReplicaSetAddOptions,
    ) -> Result<OperationReport> {
        options.validate()?;
        let _guard = self.session.locks().acquire(&replica_set_key(name)).await;
        let ctx = self.writable(name).await?;

        let report = self.session.probe().probe(address).await?;
        let warnings = report.ensure_admissible()?;
        TopologyValidator::load(&ctx.store)?
            .validate_addition(&Target::replica_set(&ctx.record), &report, None)
            .into_result(address)?;
        let primary_gtids = self.session.probe().facts(&ctx.primary).await?.gtid_executed;
        let errant = report.facts.gtid_executed.difference(&primary_gtids);
        if !errant.is_empty() {
            return Err(AdminError::State(format!(
                "{} has errant transactions not present on the PRIMARY: {}",
                address, errant
            )));
        }
        debug!(address = %address, method = %options.recovery_method, "provisioning secondary");

        let mut saga = self.session.saga("replicaset_add_instance", format!("{}/{}", name, address));
        saga.warn_all(warnings);
        match self.add_steps(&mut saga, &ctx, &report, options).await {
            Ok(()) => Ok(saga.commit()),
            Err(e) => Err(saga.abort(e).await),
        }
    }

    async fn add_steps(
        &self,
        saga: &mut Saga,
        ctx: &WritableReplicaSet,
        report: &ProbeReport,
        options: &ReplicaSetAddOptions,
    ) -> Result<()> {
        let admin = self.session.admin();
        let retry = self.session.retry();
        let address = report.address();
        let primary = &ctx.primary;

        saga.checkpoint("create replication account")?;
        let account = self.account(report.facts.server_id);
        let acct = &account;
        retry
            .run("create account", move || admin.create_account(primary, acct))
            .await?;
        saga.record(Compensation::DropAccount {
            address: primary.clone(),
            user: account.user.clone(),
        });

        if !report.facts.super_read_only {
            saga.checkpoint("enable super_read_only")?;
            retry
                .run("set super_read_only", move || {
                    admin.set_super_read_only(address, true)
                })
                .await?;
            saga.record(Compensation::SetSuperReadOnly {
                address: address.clone(),
                enabled: false,
            });
        }

        saga.checkpoint("start replication channel")?;
        let spec = ChannelSpec {
            name: REPLICASET_CHANNEL.to_string(),
            source: primary.clone(),
            user: account.user.clone(),
        };
        let channel = &spec;
        retry
            .once("start channel", admin.start_channel(address, channel))
            .await?;
        saga.record(Compensation::StopChannel {
            address: address.clone(),
            channel: REPLICASET_CHANNEL.to_string(),
        });

        saga.checkpoint("wait for catch-up")?;
        self.session.wait_for_sync(address, primary).await?;

        saga.checkpoint("register instance")?;
        let facts = &report.facts;
        let mut instance =
            InstanceRecord::new(address.clone(), facts.server_uuid, facts.server_id, facts.version);
        if let Some(label) = &options.label {
            instance.label = label.clone();
        }
        instance.recovery_account = Some(account.user.clone());
        let mut next = ctx.record.clone();
        next.instances.push(instance);
        ctx.store.update_replica_set(&next)?;
        info!(replicaset = %ctx.record.name, address = %address, "secondary added");
        Ok(())
    }

    /// Stops replication on a secondary and deregisters it.
    pub async fn remove_instance(
        &self,
        name: &str,
        address: &InstanceAddress,
        options: &ReplicaSetRemoveOptions,
    ) -> Result<OperationReport> {
        options.validate()?;
        let _guard = self.session.locks().acquire(&replica_set_key(name)).await;
        let ctx = self.writable(name).await?;
        let member = ctx
            .record
            .instance_by_address(address)
            .cloned()
            .ok_or_else(|| not_member(name, address))?;
        if member.server_uuid == ctx.record.primary {
            return Err(AdminError::State(format!(
                "{} is the PRIMARY of replica set '{}', switch the primary first",
                address, name
            )));
        }
        let reachable = match self.session.probe().facts(address).await {
            Ok(_) => true,
            Err(e) if e.is_unreachable() && options.force => false,
            Err(e) => return Err(e),
        };

        let admin = self.session.admin();
        let retry = self.session.retry();
        let mut saga = self.session.saga("replicaset_remove_instance", format!("{}/{}", name, address));
        let result = async {
            if reachable {
                saga.checkpoint("stop replication channel")?;
                retry
                    .run("stop channel", move || {
                        admin.stop_channel(address, REPLICASET_CHANNEL)
                    })
                    .await?;
            } else {
                saga.degrade(format!(
                    "{} is unreachable, it was removed from metadata only and may still replicate",
                    address
                ));
            }
            saga.checkpoint("deregister instance")?;
            let mut next = ctx.record.clone();
            next.instances.retain(|i| i.server_uuid != member.server_uuid);
            next.invalidated.retain(|u| u != &member.server_uuid);
            ctx.store.update_replica_set(&next)?;
            if let Some(user) = &member.recovery_account {
                let primary = &ctx.primary;
                if let Err(e) = retry
                    .run("drop account", move || admin.drop_account(primary, user))
                    .await
                {
                    saga.warn(format!("replication account {} was not dropped: {}", user, e));
                }
            }
            Ok::<(), AdminError>(())
        }
        .await;
        match result {
            Ok(()) => {
                info!(replicaset = name, address = %address, reachable, "secondary removed");
                Ok(saga.commit())
            }
            Err(e) => Err(saga.abort(e).await),
        }
    }

    /// Planned switchover to the secondary at `address`.
    ///
    /// Every member must be reachable. The old primary is fenced first and
    /// the candidate must apply everything it executed before it is promoted.
    pub async fn set_primary_instance(
        &self,
        name: &str,
        address: &InstanceAddress,
    ) -> Result<OperationReport> {
        let _guard = self.session.locks().acquire(&replica_set_key(name)).await;
        let ctx = self.writable(name).await?;
        let candidate = ctx
            .record
            .instance_by_address(address)
            .cloned()
            .ok_or_else(|| not_member(name, address))?;
        if candidate.server_uuid == ctx.record.primary {
            return Err(AdminError::State(format!(
                "{} is already the PRIMARY of replica set '{}'",
                address, name
            )));
        }
        if ctx.record.invalidated.contains(&candidate.server_uuid) {
            return Err(AdminError::State(format!(
                "{} was invalidated and must be removed and added again",
                address
            )));
        }
        let active = self.active_members(&ctx.record);
        for member in &active {
            self.session.probe().facts(&member.address).await.map_err(|e| {
                if e.is_unreachable() {
                    AdminError::State(format!(
                        "{} is unreachable, a switchover needs every member reachable",
                        member.address
                    ))
                } else {
                    e
                }
            })?;
        }

        let mut saga = self.session.saga("set_primary_instance", format!("{}/{}", name, address));
        match self
            .switchover_steps(&mut saga, &ctx, &candidate, &active)
            .await
        {
            Ok(()) => Ok(saga.commit()),
            Err(e) => Err(saga.abort(e).await),
        }
    }

    fn active_members(&self, record: &ReplicaSetRecord) -> Vec<InstanceRecord> {
        record
            .instances
            .iter()
            .filter(|i| !record.invalidated.contains(&i.server_uuid))
            .cloned()
            .collect()
    }

    async fn switchover_steps(
        &self,
        saga: &mut Saga,
        ctx: &WritableReplicaSet,
        candidate: &InstanceRecord,
        active: &[InstanceRecord],
    ) -> Result<()> {
        let admin = self.session.admin();
        let retry = self.session.retry();
        let old = ctx
            .record
            .primary_instance()
            .cloned()
            .ok_or_else(|| AdminError::State("replica set has no PRIMARY".to_string()))?;
        let old_primary = &old.address;
        let new_primary = &candidate.address;

        // The demoted primary needs an account on the new one to replicate.
        saga.checkpoint("create replication account for the old PRIMARY")?;
        let account = self.account(old.server_id);
        let acct = &account;
        retry
            .run("create account", move || admin.create_account(old_primary, acct))
            .await?;
        saga.record(Compensation::DropAccount {
            address: old_primary.clone(),
            user: account.user.clone(),
        });

        saga.checkpoint("fence old PRIMARY")?;
        retry
            .run("set super_read_only", move || {
                admin.set_super_read_only(old_primary, true)
            })
            .await?;
        saga.record(Compensation::SetSuperReadOnly {
            address: old_primary.clone(),
            enabled: false,
        });

        saga.checkpoint("wait for candidate catch-up")?;
        self.session.wait_for_sync(new_primary, old_primary).await?;

        saga.checkpoint("promote candidate")?;
        self.promote(saga, candidate, old_primary).await?;

        for member in active
            .iter()
            .filter(|m| m.server_uuid != candidate.server_uuid)
        {
            let user = if member.server_uuid == old.server_uuid {
                Some(account.user.clone())
            } else {
                member.recovery_account.clone()
            };
            self.repoint(saga, member, user, new_primary, Some(old_primary))
                .await?;
        }

        saga.checkpoint("update metadata")?;
        let store = self.session.metadata_at(new_primary).await?;
        let mut next = replica_set_named(&store, &ctx.record.name)?;
        next.primary = candidate.server_uuid;
        if let Some(entry) = next
            .instances
            .iter_mut()
            .find(|i| i.server_uuid == old.server_uuid)
        {
            entry.recovery_account = Some(account.user.clone());
        }
        store.update_replica_set(&next)?;
        info!(replicaset = %ctx.record.name, primary = %new_primary, "switchover complete");
        Ok(())
    }

    /// Stops the candidate's channel and makes it writable.
    async fn promote(
        &self,
        saga: &mut Saga,
        candidate: &InstanceRecord,
        previous_source: &InstanceAddress,
    ) -> Result<()> {
        let admin = self.session.admin();
        let retry = self.session.retry();
        let address = &candidate.address;
        retry
            .run("stop channel", move || admin.stop_channel(address, REPLICASET_CHANNEL))
            .await?;
        if let Some(user) = &candidate.recovery_account {
            saga.record(Compensation::StartChannel {
                address: address.clone(),
                spec: ChannelSpec {
                    name: REPLICASET_CHANNEL.to_string(),
                    source: previous_source.clone(),
                    user: user.clone(),
                },
            });
        }
        retry
            .run("set super_read_only", move || {
                admin.set_super_read_only(address, false)
            })
            .await?;
        saga.record(Compensation::SetSuperReadOnly {
            address: address.clone(),
            enabled: true,
        });
        Ok(())
    }

    /// Points `member`'s channel at `source`.
    async fn repoint(
        &self,
        saga: &mut Saga,
        member: &InstanceRecord,
        user: Option<String>,
        source: &InstanceAddress,
        previous_source: Option<&InstanceAddress>,
    ) -> Result<()> {
        let admin = self.session.admin();
        let retry = self.session.retry();
        let address = &member.address;
        let user = user.ok_or_else(|| {
            AdminError::State(format!("{} has no replication account registered", address))
        })?;
        saga.checkpoint(&format!("repoint {}", address))?;
        retry
            .run("stop channel", move || admin.stop_channel(address, REPLICASET_CHANNEL))
            .await?;
        if let (Some(previous), Some(old_user)) = (previous_source, &member.recovery_account) {
            if previous != address {
                saga.record(Compensation::StartChannel {
                    address: address.clone(),
                    spec: ChannelSpec {
                        name: REPLICASET_CHANNEL.to_string(),
                        source: previous.clone(),
                        user: old_user.clone(),
                    },
                });
            }
        }
        let spec = ChannelSpec {
            name: REPLICASET_CHANNEL.to_string(),
            source: source.clone(),
            user,
        };
        let channel = &spec;
        retry
            .run("set super_read_only", move || {
                admin.set_super_read_only(address, true)
            })
            .await?;
        retry
            .once("start channel", admin.start_channel(address, channel))
            .await?;
        saga.record(Compensation::StopChannel {
            address: address.clone(),
            channel: REPLICASET_CHANNEL.to_string(),
        });
        Ok(())
    }

    /// Unplanned failover to `address` while the primary is unreachable.
    ///
    /// Members that cannot follow the new primary, including the old one,
    /// are invalidated. Transactions the old primary never shipped are lost.
    pub async fn force_primary_instance(
        &self,
        name: &str,
        address: &InstanceAddress,
    ) -> Result<OperationReport> {
        let _guard = self.session.locks().acquire(&replica_set_key(name)).await;
        let local = self.session.read_metadata().await?;
        let record = replica_set_named(&local, name)?;
        let old_primary = primary_address(&record)?;
        match self.session.probe().facts(&old_primary).await {
            Ok(_) => {
                return Err(AdminError::State(format!(
                    "PRIMARY {} of replica set '{}' is reachable, use set_primary_instance",
                    old_primary, name
                )))
            }
            Err(e) if e.is_unreachable() => {}
            Err(e) => return Err(e),
        }
        let candidate = record
            .instance_by_address(address)
            .cloned()
            .ok_or_else(|| not_member(name, address))?;
        if record.invalidated.contains(&candidate.server_uuid) {
            return Err(AdminError::State(format!(
                "{} was invalidated and cannot be promoted",
                address
            )));
        }
        let candidate_gtids = self.session.probe().facts(address).await?.gtid_executed;

        let mut followers = Vec::new();
        let mut invalidated = vec![record.primary];
        for member in self.active_members(&record).into_iter().filter(|m| {
            m.server_uuid != candidate.server_uuid && m.server_uuid != record.primary
        }) {
            match self.session.probe().facts(&member.address).await {
                Ok(facts) => {
                    if !facts.gtid_executed.is_subset_of(&candidate_gtids) {
                        return Err(AdminError::State(format!(
                            "{} has transactions {} does not, promote the most up to date secondary",
                            member.address, address
                        )));
                    }
                    followers.push(member);
                }
                Err(e) if e.is_unreachable() => invalidated.push(member.server_uuid),
                Err(e) => return Err(e),
            }
        }

        let mut saga = self.session.saga("force_primary_instance", format!("{}/{}", name, address));
        let result = async {
            saga.checkpoint("promote candidate")?;
            self.promote(&mut saga, &candidate, &old_primary).await?;
            for member in &followers {
                self.repoint(&mut saga, member, member.recovery_account.clone(), address, None)
                    .await?;
            }
            saga.checkpoint("update metadata")?;
            let store = self.session.metadata_at(address).await?;
            let mut next = replica_set_named(&store, name)?;
            next.primary = candidate.server_uuid;
            for uuid in &invalidated {
                if !next.invalidated.contains(uuid) {
                    next.invalidated.push(*uuid);
                }
            }
            store.update_replica_set(&next)?;
            Ok::<(), AdminError>(())
        }
        .await;
        match result {
            Ok(()) => {
                saga.data_loss(format!(
                    "transactions of {} not replicated before the failover are lost",
                    old_primary
                ));
                if invalidated.len() > 1 {
                    saga.warn(format!(
                        "{} unreachable secondaries were invalidated",
                        invalidated.len() - 1
                    ));
                }
                warn!(replicaset = name, primary = %address, "forced failover complete");
                Ok(saga.commit())
            }
            Err(e) => Err(saga.abort(e).await),
        }
    }

    /// Live state of every member.
    pub async fn status(&self, name: &str) -> Result<ReplicaSetStatus> {
        let store = self.session.read_metadata().await?;
        let record = replica_set_named(&store, name)?;
        let primary = primary_address(&record)?;
        let members = join_all(
            record
                .instances
                .iter()
                .map(|i| self.member_status(&record, i)),
        )
        .await;

        let primary_up = members
            .iter()
            .any(|m| m.role == MemberRole::Primary && m.state == ReplicaMemberState::Online);
        let all_up = members
            .iter()
            .all(|m| m.state == ReplicaMemberState::Online);
        let health = match (primary_up, all_up) {
            (false, _) => ReplicaSetHealth::Unavailable,
            (true, true) => ReplicaSetHealth::Available,
            (true, false) => ReplicaSetHealth::AvailablePartial,
        };
        Ok(ReplicaSetStatus {
            name: record.name.clone(),
            primary,
            health,
            members,
        })
    }

    async fn member_status(
        &self,
        record: &ReplicaSetRecord,
        instance: &InstanceRecord,
    ) -> ReplicaSetMemberStatus {
        let role = if instance.server_uuid == record.primary {
            MemberRole::Primary
        } else {
            MemberRole::Secondary
        };
        let mut status = ReplicaSetMemberStatus {
            address: instance.address.clone(),
            label: instance.label.clone(),
            role,
            state: ReplicaMemberState::Online,
            version: None,
            channel: None,
        };
        if record.invalidated.contains(&instance.server_uuid) {
            status.state = ReplicaMemberState::Invalidated;
            return status;
        }
        match self.session.probe().facts(&instance.address).await {
            Ok(facts) => status.version = Some(facts.version),
            Err(_) => {
                status.state = ReplicaMemberState::Unreachable;
                return status;
            }
        }
        if role == MemberRole::Secondary {
            let admin = self.session.admin();
            let address = &instance.address;
            status.channel = self
                .session
                .retry()
                .run("channel status", move || {
                    admin.channel_status(address, REPLICASET_CHANNEL)
                })
                .await
                .ok()
                .flatten();
            let replicating = status
                .channel
                .as_ref()
                .map(|c| c.running && c.last_error.is_none())
                .unwrap_or(false);
            if !replicating {
                status.state = ReplicaMemberState::Error;
            }
        }
        status
    }
}
