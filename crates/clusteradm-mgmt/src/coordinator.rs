//! Cluster membership changes.
//!
//! Every operation follows the same shape: validate options, take the
//! cluster lock, probe, validate admissibility, then run the live steps and
//! the metadata commit inside a [`Saga`] so that a failure unwinds whatever
//! was already done to the group.

use clusteradm_meta::{
    ClusterRecord, InstanceAddress, InstanceRecord, MetadataStore, NewCluster, Owner,
    TopologyMode, Version,
};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AdminError, Result};
use crate::locks::cluster_key;
use crate::options::{
    validate_name, AddInstanceOptions, CreateClusterOptions, DissolveOptions, ExitStateAction,
    RecoveryMethod, RejoinInstanceOptions, RemoveInstanceOptions, RescanOptions, UnreachablePolicy,
    Validate,
};
use crate::probe::ProbeReport;
use crate::rpc::{
    GroupMemberState, GroupSettings, GroupView, JoinRequest, MemberSettings, ReplicationAccount,
};
use crate::saga::{Compensation, OperationReport, Saga};
use crate::session::ManagementSession;
use crate::validator::{RegisteredInstance, RejectReason, Target, TopologyValidator};

/// A cluster resolved for mutation.
pub(crate) struct WritableCluster {
    pub record: ClusterRecord,
    pub view: GroupView,
    /// ONLINE primary of the cluster's own group
    pub primary: InstanceAddress,
    /// Where accounts are created and metadata is written
    pub writer: InstanceAddress,
    pub store: MetadataStore,
}

/// Live member that metadata does not know about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnmanagedMember {
    pub address: InstanceAddress,
    pub server_uuid: Uuid,
    pub state: GroupMemberState,
}

/// Stored topology mode differs from the live one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TopologyModeDrift {
    pub stored: TopologyMode,
    pub live: TopologyMode,
}

/// The group could use a newer communication protocol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProtocolUpgrade {
    pub current: Version,
    pub available: Version,
}

/// Drift between metadata and the live group.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RescanReport {
    pub cluster: String,
    /// Live members absent from metadata
    pub unmanaged: Vec<UnmanagedMember>,
    /// Registered members absent from the group
    pub missing: Vec<InstanceAddress>,
    pub topology_mode: Option<TopologyModeDrift>,
    pub protocol_upgrade: Option<ProtocolUpgrade>,
    /// Corrections that were applied
    pub applied: Vec<String>,
    pub warnings: Vec<String>,
}

impl RescanReport {
    /// Number of drift findings.
    pub fn drift_count(&self) -> usize {
        self.unmanaged.len()
            + self.missing.len()
            + usize::from(self.topology_mode.is_some())
            + usize::from(self.protocol_upgrade.is_some())
    }

    pub fn is_clean(&self) -> bool {
        self.drift_count() == 0
    }
}

/// Loads a cluster by name; a missing cluster is a state error.
pub(crate) fn cluster_named(store: &MetadataStore, name: &str) -> Result<ClusterRecord> {
    store
        .cluster_by_name(name)?
        .ok_or_else(|| AdminError::State(format!("cluster '{}' does not exist", name)))
}

/// Member settings derived from cluster attributes and per-member overrides.
fn member_settings(
    record: &ClusterRecord,
    exit_state_action: Option<ExitStateAction>,
    member_weight: Option<u8>,
    local_address: Option<String>,
) -> MemberSettings {
    let defaults = MemberSettings::default();
    let stored_action = record
        .attributes
        .get("exitStateAction")
        .and_then(|v| v.parse().ok());
    let auto_rejoin_tries = record
        .attributes
        .get("autoRejoinTries")
        .and_then(|v| v.parse().ok())
        .unwrap_or(defaults.auto_rejoin_tries);
    MemberSettings {
        exit_state_action: exit_state_action
            .or(stored_action)
            .unwrap_or(defaults.exit_state_action),
        member_weight: member_weight.unwrap_or(defaults.member_weight),
        auto_rejoin_tries,
        local_address,
    }
}

/// Join request that puts a departed member back into the cluster group.
fn rejoin_request(record: &ClusterRecord, seed: &InstanceAddress, recovery_user: &str) -> JoinRequest {
    JoinRequest {
        group_name: record.group_name,
        seed: seed.clone(),
        member: member_settings(record, None, None, None),
        recovery_user: recovery_user.to_string(),
        recovery_method: RecoveryMethod::Incremental,
    }
}

/// Drives membership changes of clusters through one session.
pub struct MembershipCoordinator<'a> {
    session: &'a ManagementSession,
}

impl<'a> MembershipCoordinator<'a> {
    pub fn new(session: &'a ManagementSession) -> Self {
        Self { session }
    }

    /// Resolves `name` for mutation through the primary of the session's group.
    pub(crate) async fn writable(&self, name: &str) -> Result<WritableCluster> {
        let primary = self.session.require_primary().await?;
        let view = self.session.probe().view(&primary).await?.ok_or_else(|| {
            AdminError::State(format!(
                "{} is not running group replication",
                primary
            ))
        })?;
        let local = self.session.metadata_at(&primary).await?;
        let record = cluster_named(&local, name)?;
        if record.group_name != view.group_name {
            return Err(AdminError::State(format!(
                "session target {} is not a member of cluster '{}'",
                self.session.target(),
                name
            )));
        }
        let (writer, store) = self
            .session
            .metadata_writer(&record, &primary, &local)
            .await?;
        Ok(WritableCluster {
            record,
            view,
            primary,
            writer,
            store,
        })
    }

    /// Polls `observer`'s view until `member` is ONLINE.
    ///
    /// Fails with `State` when the member ends up in ERROR and with
    /// `Timeout` after the configured join wait.
    pub(crate) async fn wait_online(
        &self,
        member: &InstanceAddress,
        observer: &InstanceAddress,
    ) -> Result<()> {
        let timeout = self.session.config().join_wait_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            let state = self
                .session
                .probe()
                .view(observer)
                .await?
                .and_then(|v| v.member_by_address(member).map(|m| m.state));
            match state {
                Some(GroupMemberState::Online) => return Ok(()),
                Some(GroupMemberState::Error) => {
                    return Err(AdminError::State(format!(
                        "{} entered ERROR state during distributed recovery",
                        member
                    )))
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(AdminError::Timeout {
                    operation: format!("waiting for {} to become ONLINE", member),
                    after_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.session.config().poll_interval()).await;
        }
    }

    /// Registrations found in the candidate's own metadata for the group it
    /// is running in.
    async fn candidate_registrations(&self, candidate: &ProbeReport) -> Vec<RegisteredInstance> {
        let Some(view) = &candidate.view else {
            return Vec::new();
        };
        let uuid = candidate.facts.server_uuid;
        let store = match self.session.metadata_at(candidate.address()).await {
            Ok(store) => store,
            Err(_) => return Vec::new(),
        };
        let clusters = match store.clusters() {
            Ok(clusters) => clusters,
            Err(e) => {
                debug!(address = %candidate.address(), error = %e, "candidate holds no usable metadata");
                return Vec::new();
            }
        };
        clusters
            .into_iter()
            .filter(|c| c.group_name == view.group_name)
            .flat_map(|c| {
                let owner_name = format!("cluster '{}'", c.name);
                let owner = Owner::Cluster(c.id);
                c.instances
                    .into_iter()
                    .filter(move |i| i.server_uuid == uuid)
                    .map(move |instance| RegisteredInstance {
                        owner,
                        owner_name: owner_name.clone(),
                        instance,
                    })
            })
            .collect()
    }

    /// Fails when the candidate executed transactions the group never saw.
    async fn ensure_no_errant(&self, candidate: &ProbeReport, primary: &InstanceAddress) -> Result<()> {
        let facts = self.session.probe().facts(primary).await?;
        let errant = candidate
            .facts
            .gtid_executed
            .difference(&facts.gtid_executed);
        if !errant.is_empty() {
            return Err(AdminError::State(format!(
                "{} has errant transactions not present in the group: {}",
                candidate.address(),
                errant
            )));
        }
        Ok(())
    }

    // ---- create ----

    /// Bootstraps a new cluster on the session target.
    pub async fn create_cluster(
        &self,
        name: &str,
        options: &CreateClusterOptions,
    ) -> Result<OperationReport> {
        options.validate()?;
        validate_name("cluster", name)?;
        let _guard = self.session.locks().acquire(&cluster_key(name)).await;

        let target = self.session.target().clone();
        let report = self.session.probe().probe(&target).await?;
        let warnings = report.ensure_admissible()?;
        if !report.is_standalone() {
            return Err(AdminError::State(format!(
                "{} is already running group replication",
                target
            )));
        }

        let store = self.session.metadata_at(&target).await?;
        let installed = store.is_installed()?;
        if installed {
            store.require_current()?;
            if store.cluster_by_name(name)?.is_some() {
                return Err(AdminError::DuplicateName {
                    kind: "cluster",
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

        let mut saga = self.session.saga("create_cluster", name);
        saga.warn_all(warnings);
        match self
            .create_steps(&mut saga, name, options, &report, &store, installed)
            .await
        {
            Ok(()) => Ok(saga.commit()),
            Err(e) => Err(saga.abort(e).await),
        }
    }

    async fn create_steps(
        &self,
        saga: &mut Saga,
        name: &str,
        options: &CreateClusterOptions,
        report: &ProbeReport,
        store: &MetadataStore,
        installed: bool,
    ) -> Result<()> {
        let admin = self.session.admin();
        let retry = self.session.retry();
        let target = report.address();

        if report.facts.super_read_only {
            saga.checkpoint("disable super_read_only")?;
            retry
                .run("set super_read_only", move || {
                    admin.set_super_read_only(target, false)
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

        saga.checkpoint("create recovery account")?;
        let account = ReplicationAccount::generate(
            &self.session.config().recovery_account_prefix,
            report.facts.server_id,
        );
        let acct = &account;
        retry
            .run("create account", move || admin.create_account(target, acct))
            .await?;
        saga.record(Compensation::DropAccount {
            address: target.clone(),
            user: account.user.clone(),
        });

        saga.checkpoint("bootstrap group")?;
        let group_name = options.group_name.unwrap_or_else(Uuid::new_v4);
        let mode = if options.multi_primary {
            TopologyMode::MultiPrimary
        } else {
            TopologyMode::SinglePrimary
        };
        let settings = GroupSettings {
            group_name,
            mode,
            ssl_mode: options.member_ssl_mode,
            consistency: options.consistency,
            expel_timeout: options.expel_timeout,
            member: MemberSettings {
                exit_state_action: options.exit_state_action,
                member_weight: options.member_weight,
                auto_rejoin_tries: options.auto_rejoin_tries,
                local_address: options.local_address.clone(),
            },
        };
        retry
            .once("bootstrap group", admin.bootstrap_group(target, &settings))
            .await?;
        saga.record(Compensation::SetSuperReadOnly {
            address: target.clone(),
            enabled: false,
        });
        saga.record(Compensation::LeaveGroup {
            address: target.clone(),
        });

        saga.checkpoint("wait for ONLINE")?;
        self.wait_online(target, target).await?;

        saga.checkpoint("register cluster")?;
        let facts = &report.facts;
        let mut seed = InstanceRecord::new(
            target.clone(),
            facts.server_uuid,
            facts.server_id,
            facts.version,
        );
        seed.recovery_account = Some(account.user.clone());
        store.create_cluster(NewCluster {
            name: name.to_string(),
            group_name,
            topology_mode: mode,
            seed,
            attributes: options.to_attributes(),
        })?;
        info!(cluster = name, seed = %target, group = %group_name, "cluster created");
        Ok(())
    }

    // ---- add ----

    /// Adds `address` to cluster `name`.
    pub async fn add_instance(
        &self,
        name: &str,
        address: &InstanceAddress,
        options: &AddInstanceOptions,
    ) -> Result<OperationReport> {
        options.validate()?;
        let _guard = self.session.locks().acquire(&cluster_key(name)).await;
        let ctx = self.writable(name).await?;

        let report = self.session.probe().probe(address).await?;
        let warnings = report.ensure_admissible()?;
        let mut validator = TopologyValidator::load(&ctx.store)?;
        validator.extend(self.candidate_registrations(&report).await);
        validator
            .validate_addition(
                &Target::cluster(&ctx.record, Some(&ctx.view)),
                &report,
                options.local_address.as_deref(),
            )
            .into_result(address)?;
        self.ensure_no_errant(&report, &ctx.primary).await?;

        let mut saga = self.session.saga("add_instance", format!("{}/{}", name, address));
        saga.warn_all(warnings);
        match self.add_steps(&mut saga, &ctx, &report, options).await {
            Ok(()) => Ok(saga.commit()),
            Err(e) => Err(saga.abort(e).await),
        }
    }

    async fn add_steps(
        &self,
        saga: &mut Saga,
        ctx: &WritableCluster,
        report: &ProbeReport,
        options: &AddInstanceOptions,
    ) -> Result<()> {
        let admin = self.session.admin();
        let retry = self.session.retry();
        let address = report.address();
        let writer = &ctx.writer;

        saga.checkpoint("create recovery account")?;
        let account = ReplicationAccount::generate(
            &self.session.config().recovery_account_prefix,
            report.facts.server_id,
        );
        let acct = &account;
        retry
            .run("create account", move || admin.create_account(writer, acct))
            .await?;
        saga.record(Compensation::DropAccount {
            address: writer.clone(),
            user: account.user.clone(),
        });

        saga.checkpoint("verify group view")?;
        let current = self.session.probe().view(&ctx.primary).await?;
        let current_id = current.as_ref().map(|v| v.view_id);
        if current_id != Some(ctx.view.view_id) {
            return Err(AdminError::Conflict(format!(
                "group view of cluster '{}' changed from {} to {}",
                ctx.record.name,
                ctx.view.view_id,
                current_id.map(|id| id.to_string()).unwrap_or_else(|| "none".to_string())
            )));
        }

        saga.checkpoint("join group")?;
        let request = JoinRequest {
            group_name: ctx.record.group_name,
            seed: ctx.primary.clone(),
            member: member_settings(
                &ctx.record,
                options.exit_state_action,
                options.member_weight,
                options.local_address.clone(),
            ),
            recovery_user: account.user.clone(),
            recovery_method: options.recovery_method,
        };
        retry
            .once("join group", admin.join_group(address, &request))
            .await?;
        saga.record(Compensation::LeaveGroup {
            address: address.clone(),
        });

        saga.checkpoint("wait for recovery")?;
        self.wait_online(address, &ctx.primary).await?;

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
        ctx.store.update_cluster(&next)?;
        info!(cluster = %ctx.record.name, address = %address, "instance added");
        Ok(())
    }

    // ---- remove ----

    /// Removes `address` from cluster `name`.
    pub async fn remove_instance(
        &self,
        name: &str,
        address: &InstanceAddress,
        options: &RemoveInstanceOptions,
    ) -> Result<OperationReport> {
        options.validate()?;
        let _guard = self.session.locks().acquire(&cluster_key(name)).await;
        let ctx = self.writable(name).await?;

        let member = ctx
            .record
            .instance_by_address(address)
            .cloned()
            .ok_or_else(|| AdminError::NotMember {
                address: address.to_string(),
                topology: format!("cluster '{}'", name),
            })?;
        if ctx.record.instances.len() == 1 {
            return Err(AdminError::State(format!(
                "{} is the last member of cluster '{}', dissolve the cluster instead",
                address, name
            )));
        }
        TopologyValidator::default()
            .validate_removal(
                &Target::cluster(&ctx.record, Some(&ctx.view)),
                &member.server_uuid,
                options.force,
            )
            .into_result(address)?;

        let reachable = match self.session.probe().facts(address).await {
            Ok(_) => true,
            Err(e) if e.is_unreachable() => false,
            Err(e) => return Err(e),
        };
        let policy = options
            .unreachable_policy
            .unwrap_or(self.session.config().unreachable_policy);
        if !reachable && policy == UnreachablePolicy::Reject && !options.force {
            return Err(AdminError::unreachable(
                address,
                "instance is unreachable and the unreachable policy is 'reject', use force to remove it from metadata",
            ));
        }

        let mut saga = self.session.saga("remove_instance", format!("{}/{}", name, address));
        match self.remove_steps(&mut saga, ctx, &member, reachable).await {
            Ok(()) => Ok(saga.commit()),
            Err(e) => Err(saga.abort(e).await),
        }
    }

    async fn remove_steps(
        &self,
        saga: &mut Saga,
        mut ctx: WritableCluster,
        member: &InstanceRecord,
        reachable: bool,
    ) -> Result<()> {
        let admin = self.session.admin();
        let retry = self.session.retry();
        let address = &member.address;

        if reachable {
            saga.checkpoint("leave group")?;
            let seed = ctx
                .view
                .members
                .iter()
                .find(|m| &m.address != address && m.state == GroupMemberState::Online)
                .map(|m| m.address.clone());
            retry
                .run("leave group", move || admin.leave_group(address))
                .await?;
            if let (Some(seed), Some(user)) = (seed, &member.recovery_account) {
                saga.record(Compensation::RejoinGroup {
                    address: address.clone(),
                    request: rejoin_request(&ctx.record, &seed, user),
                });
            }
            if &ctx.writer == address {
                ctx = self.reresolve_writer(ctx, address).await?;
            }
        } else {
            saga.degrade(format!(
                "{} is unreachable, it was removed from metadata only and may still run group replication",
                address
            ));
        }

        saga.checkpoint("deregister instance")?;
        let mut next = ctx.record.clone();
        next.instances.retain(|i| i.server_uuid != member.server_uuid);
        ctx.store.update_cluster(&next)?;

        if let Some(user) = &member.recovery_account {
            let writer = &ctx.writer;
            let dropped = retry
                .run("drop account", move || admin.drop_account(writer, user))
                .await;
            if let Err(e) = dropped {
                saga.warn(format!("recovery account {} was not dropped: {}", user, e));
            }
        }
        info!(cluster = %ctx.record.name, address = %address, reachable, "instance removed");
        Ok(())
    }

    /// Finds the new primary after the one metadata was written through left.
    async fn reresolve_writer(
        &self,
        ctx: WritableCluster,
        departed: &InstanceAddress,
    ) -> Result<WritableCluster> {
        let mut remaining = ctx.record.clone();
        remaining.instances.retain(|i| &i.address != departed);
        let deadline = Instant::now() + self.session.config().join_wait_timeout();
        loop {
            let view = self.session.cluster_view(&remaining).await?;
            if let Some(primary) = view.as_ref().and_then(|v| v.primary()) {
                let primary = primary.address.clone();
                let store = self.session.metadata_at(&primary).await?;
                debug!(primary = %primary, "metadata writer moved");
                return Ok(WritableCluster {
                    record: ctx.record,
                    view: view.unwrap_or(ctx.view),
                    writer: primary.clone(),
                    primary,
                    store,
                });
            }
            if Instant::now() >= deadline {
                return Err(AdminError::ReadOnly(format!(
                    "cluster '{}' has no PRIMARY after {} left",
                    ctx.record.name, departed
                )));
            }
            tokio::time::sleep(self.session.config().poll_interval()).await;
        }
    }

    // ---- rejoin ----

    /// Brings a registered member that is MISSING or in ERROR back online.
    pub async fn rejoin_instance(
        &self,
        name: &str,
        address: &InstanceAddress,
        options: &RejoinInstanceOptions,
    ) -> Result<OperationReport> {
        options.validate()?;
        let _guard = self.session.locks().acquire(&cluster_key(name)).await;
        let ctx = self.writable(name).await?;

        let member = ctx
            .record
            .instance_by_address(address)
            .cloned()
            .ok_or_else(|| AdminError::NotMember {
                address: address.to_string(),
                topology: format!("cluster '{}'", name),
            })?;
        let live = ctx.view.member(&member.server_uuid).map(|m| m.state);
        if matches!(
            live,
            Some(GroupMemberState::Online) | Some(GroupMemberState::Recovering)
        ) {
            return Err(AdminError::State(format!(
                "{} is already {} in cluster '{}'",
                address,
                live.map(|s| s.to_string()).unwrap_or_default(),
                name
            )));
        }

        let report = self.session.probe().probe(address).await?;
        let warnings = report.ensure_admissible()?;
        let mut validator = TopologyValidator::load(&ctx.store)?;
        validator.extend(self.candidate_registrations(&report).await);
        validator
            .validate_rejoin(
                &Target::cluster(&ctx.record, Some(&ctx.view)),
                &report,
                options.local_address.as_deref(),
            )
            .into_result(address)?;
        self.ensure_no_errant(&report, &ctx.primary).await?;

        let mut saga = self.session.saga("rejoin_instance", format!("{}/{}", name, address));
        saga.warn_all(warnings);
        match self.rejoin_steps(&mut saga, &ctx, &member, &report, options).await {
            Ok(()) => Ok(saga.commit()),
            Err(e) => Err(saga.abort(e).await),
        }
    }

    async fn rejoin_steps(
        &self,
        saga: &mut Saga,
        ctx: &WritableCluster,
        member: &InstanceRecord,
        report: &ProbeReport,
        options: &RejoinInstanceOptions,
    ) -> Result<()> {
        let admin = self.session.admin();
        let retry = self.session.retry();
        let address = &member.address;
        let writer = &ctx.writer;

        if report.view.is_some() {
            saga.checkpoint("stop group replication")?;
            retry
                .run("leave group", move || admin.leave_group(address))
                .await?;
        }

        saga.checkpoint("create recovery account")?;
        let account = ReplicationAccount::generate(
            &self.session.config().recovery_account_prefix,
            report.facts.server_id,
        );
        let acct = &account;
        retry
            .run("create account", move || admin.create_account(writer, acct))
            .await?;
        saga.record(Compensation::DropAccount {
            address: writer.clone(),
            user: account.user.clone(),
        });

        saga.checkpoint("verify group view")?;
        let current = self.session.probe().view(&ctx.primary).await?;
        if current.as_ref().map(|v| v.view_id) != Some(ctx.view.view_id) {
            return Err(AdminError::Conflict(format!(
                "group view of cluster '{}' changed during rejoin",
                ctx.record.name
            )));
        }

        saga.checkpoint("join group")?;
        let request = JoinRequest {
            group_name: ctx.record.group_name,
            seed: ctx.primary.clone(),
            member: member_settings(&ctx.record, None, None, options.local_address.clone()),
            recovery_user: account.user.clone(),
            recovery_method: options.recovery_method,
        };
        retry
            .once("join group", admin.join_group(address, &request))
            .await?;
        saga.record(Compensation::LeaveGroup {
            address: address.clone(),
        });

        saga.checkpoint("wait for recovery")?;
        self.wait_online(address, &ctx.primary).await?;

        saga.checkpoint("update instance")?;
        let mut next = ctx.record.clone();
        if let Some(entry) = next
            .instances
            .iter_mut()
            .find(|i| i.server_uuid == member.server_uuid)
        {
            entry.recovery_account = Some(account.user.clone());
            entry.version = report.facts.version;
        }
        ctx.store.update_cluster(&next)?;
        info!(cluster = %ctx.record.name, address = %address, "instance rejoined");
        Ok(())
    }

    // ---- dissolve ----

    /// Takes every member out of the group and deletes the cluster.
    pub async fn dissolve(&self, name: &str, options: &DissolveOptions) -> Result<OperationReport> {
        options.validate()?;
        let _guard = self.session.locks().acquire(&cluster_key(name)).await;

        let store = self.session.read_metadata().await?;
        let record = cluster_named(&store, name)?;
        if record.in_cluster_set() {
            return Err(AdminError::State(format!(
                "cluster '{}' belongs to a cluster set, remove it from the set first",
                name
            )));
        }
        let view = if options.force {
            self.session.cluster_view(&record).await?
        } else {
            Some(self.writable(name).await?.view)
        };

        let mut saga = self.session.saga("dissolve", name);
        match self.dissolve_steps(&mut saga, &record, view.as_ref(), options.force).await {
            Ok(()) => Ok(saga.commit()),
            Err(e) => Err(saga.abort(e).await),
        }
    }

    /// Leave order and record deletion shared with cluster-set removal.
    ///
    /// Until the primary has left, every departed secondary can be put back
    /// through it, so a failed leave unwinds to the original group. Recovery
    /// accounts are kept until nobody needs them to rejoin.
    pub(crate) async fn dissolve_steps(
        &self,
        saga: &mut Saga,
        record: &ClusterRecord,
        view: Option<&GroupView>,
        force: bool,
    ) -> Result<()> {
        let admin = self.session.admin();
        let retry = self.session.retry();
        let primary = view.and_then(|v| v.primary()).map(|p| p.address.clone());

        let mut order: Vec<&InstanceRecord> = record
            .instances
            .iter()
            .filter(|i| Some(&i.address) != primary.as_ref())
            .collect();
        order.extend(
            record
                .instances
                .iter()
                .filter(|i| Some(&i.address) == primary.as_ref()),
        );

        let mut left = Vec::new();
        for instance in order {
            let address = &instance.address;
            saga.checkpoint(&format!("leave {}", address))?;
            match retry
                .run("leave group", move || admin.leave_group(address))
                .await
            {
                Ok(()) => {
                    match (&primary, &instance.recovery_account) {
                        (Some(seed), Some(user)) if seed != address => {
                            saga.record(Compensation::RejoinGroup {
                                address: address.clone(),
                                request: rejoin_request(record, seed, user),
                            });
                        }
                        _ => {}
                    }
                    left.push(address.clone());
                }
                Err(e) if e.is_unreachable() => saga.degrade(format!(
                    "{} is unreachable, it was dropped from the cluster without leaving the group: {}",
                    address, e
                )),
                Err(e) if force => saga.degrade(format!("{} did not leave the group: {}", address, e)),
                Err(e) => return Err(e),
            }
        }
        // Past the last leave only best-effort cleanup remains.
        saga.settle();

        saga.note("delete cluster metadata");
        for address in &left {
            if let Err(e) = self.clean_former_member(saga, address, record).await {
                saga.warn(format!("metadata of cluster '{}' kept on {}: {}", record.name, address, e));
            }
        }
        info!(cluster = %record.name, left = left.len(), "cluster dissolved");
        Ok(())
    }

    /// Drops the recovery accounts and deletes the cluster record on a
    /// former member, lifting super_read_only for the duration.
    async fn clean_former_member(
        &self,
        saga: &mut Saga,
        address: &InstanceAddress,
        record: &ClusterRecord,
    ) -> Result<()> {
        let admin = self.session.admin();
        let retry = self.session.retry();
        let facts = self.session.probe().facts(address).await?;
        if facts.super_read_only {
            retry
                .run("set super_read_only", move || {
                    admin.set_super_read_only(address, false)
                })
                .await?;
        }
        for user in record.instances.iter().filter_map(|i| i.recovery_account.as_ref()) {
            let dropped = retry
                .run("drop account", move || admin.drop_account(address, user))
                .await;
            if let Err(e) = dropped {
                saga.warn(format!("recovery account {} was not dropped on {}: {}", user, address, e));
            }
        }
        let store = self.session.metadata_at(address).await?;
        let result = match store.cluster_by_name(&record.name) {
            Ok(Some(stored)) if stored.id == record.id => {
                store.delete_cluster(&stored.id).map_err(AdminError::from)
            }
            Ok(_) => Ok(()),
            Err(e) => Err(e.into()),
        };
        if facts.super_read_only {
            let restored = retry
                .run("set super_read_only", move || {
                    admin.set_super_read_only(address, true)
                })
                .await;
            if let Err(e) = restored {
                warn!(address = %address, error = %e, "super_read_only not restored");
            }
        }
        result
    }

    // ---- rescan ----

    /// Compares metadata with the live group and applies the corrections
    /// enabled in `options`.
    pub async fn rescan(&self, name: &str, options: &RescanOptions) -> Result<RescanReport> {
        options.validate()?;
        let _guard = self.session.locks().acquire(&cluster_key(name)).await;
        let applying = options.add_instances
            || options.remove_instances
            || options.upgrade_comm_protocol
            || options.update_topology_mode;

        let (record, view, writable) = if applying {
            let ctx = self.writable(name).await?;
            (ctx.record.clone(), Some(ctx.view.clone()), Some(ctx))
        } else {
            let store = self.session.read_metadata().await?;
            let record = cluster_named(&store, name)?;
            let view = self.session.cluster_view(&record).await?;
            (record, view, None)
        };

        let mut report = RescanReport {
            cluster: name.to_string(),
            ..RescanReport::default()
        };
        let Some(view) = view else {
            report
                .warnings
                .push(format!("no member of cluster '{}' is reachable", name));
            return Ok(report);
        };

        report.unmanaged = view
            .members
            .iter()
            .filter(|m| {
                matches!(m.state, GroupMemberState::Online | GroupMemberState::Recovering)
                    && record.instance(&m.server_uuid).is_none()
            })
            .map(|m| UnmanagedMember {
                address: m.address.clone(),
                server_uuid: m.server_uuid,
                state: m.state,
            })
            .collect();
        report.missing = record
            .instances
            .iter()
            .filter(|i| view.member(&i.server_uuid).is_none())
            .map(|i| i.address.clone())
            .collect();
        if view.mode != record.topology_mode {
            report.topology_mode = Some(TopologyModeDrift {
                stored: record.topology_mode,
                live: view.mode,
            });
        }
        if let Some(lowest) = view.lowest_version() {
            if lowest > view.protocol_version {
                report.protocol_upgrade = Some(ProtocolUpgrade {
                    current: view.protocol_version,
                    available: lowest,
                });
            }
        }
        debug!(cluster = name, drift = report.drift_count(), "rescan complete");

        if let Some(ctx) = writable {
            self.apply_rescan(&ctx, options, &mut report).await?;
        }
        Ok(report)
    }

    async fn apply_rescan(
        &self,
        ctx: &WritableCluster,
        options: &RescanOptions,
        report: &mut RescanReport,
    ) -> Result<()> {
        let mut next = ctx.record.clone();
        let mut changed = false;

        if options.add_instances {
            for member in &report.unmanaged {
                let facts = match self.session.probe().facts(&member.address).await {
                    Ok(facts) => facts,
                    Err(e) => {
                        report
                            .warnings
                            .push(format!("{} not adopted: {}", member.address, e));
                        continue;
                    }
                };
                next.instances.push(InstanceRecord::new(
                    member.address.clone(),
                    facts.server_uuid,
                    facts.server_id,
                    facts.version,
                ));
                report.applied.push(format!("adopted {}", member.address));
                changed = true;
            }
        }
        if options.remove_instances && !report.missing.is_empty() {
            next.instances
                .retain(|i| !report.missing.contains(&i.address));
            for address in &report.missing {
                report.applied.push(format!("removed {}", address));
            }
            changed = true;
        }
        if options.update_topology_mode {
            if let Some(drift) = &report.topology_mode {
                next.topology_mode = drift.live;
                report
                    .applied
                    .push(format!("topology mode set to {}", drift.live));
                changed = true;
            }
        }
        if changed {
            ctx.store.update_cluster(&next)?;
        }

        if options.upgrade_comm_protocol {
            if let Some(upgrade) = &report.protocol_upgrade {
                let admin = self.session.admin();
                let primary = &ctx.primary;
                let version = &upgrade.available;
                self.session
                    .retry()
                    .run("set protocol version", move || {
                        admin.set_protocol_version(primary, version)
                    })
                    .await?;
                report
                    .applied
                    .push(format!("protocol upgraded to {}", upgrade.available));
            }
        }
        if !report.applied.is_empty() {
            info!(cluster = %ctx.record.name, applied = ?report.applied, "rescan applied");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdminConfig;
    use crate::options::SessionOptions;
    use crate::rpc::InstanceAdmin;
    use crate::sim::{Fault, SimFleet};
    use std::sync::Arc;

    async fn session(fleet: &SimFleet, target: &InstanceAddress) -> ManagementSession {
        ManagementSession::open(
            Arc::new(fleet.clone()),
            target.clone(),
            SessionOptions::default(),
            AdminConfig::fast(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_then_add() {
        let fleet = SimFleet::new();
        let a = fleet.provision_default("db1:3306", 1).unwrap();
        let b = fleet.provision_default("db2:3306", 2).unwrap();
        let s = session(&fleet, &a).await;
        let coord = MembershipCoordinator::new(&s);
        coord
            .create_cluster("dev", &CreateClusterOptions::default())
            .await
            .unwrap();
        coord
            .add_instance("dev", &b, &AddInstanceOptions::default())
            .await
            .unwrap();
        assert_eq!(fleet.group_members(&a), vec![a.clone(), b.clone()]);
        let store = s.read_metadata().await.unwrap();
        let record = cluster_named(&store, "dev").unwrap();
        assert_eq!(record.instances.len(), 2);
        assert_eq!(record.generation, 2);
    }

    #[tokio::test]
    async fn test_failed_create_restores_instance() {
        let fleet = SimFleet::new();
        let a = fleet.provision_default("db1:3306", 1).unwrap();
        fleet.set_super_read_only(&a, true).await.unwrap();
        let s = session(&fleet, &a).await;
        fleet.inject(&a, Fault::FailCreateAccount).unwrap();
        let err = MembershipCoordinator::new(&s)
            .create_cluster("dev", &CreateClusterOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "state");
        assert!(fleet.super_read_only(&a).unwrap());
        let store = s.metadata_at(&a).await.unwrap();
        assert!(!store.is_installed().unwrap());
    }

    #[tokio::test]
    async fn test_join_failure_rolls_back_account() {
        let fleet = SimFleet::new();
        let a = fleet.provision_default("db1:3306", 1).unwrap();
        let b = fleet.provision_default("db2:3306", 2).unwrap();
        let s = session(&fleet, &a).await;
        let coord = MembershipCoordinator::new(&s);
        coord
            .create_cluster("dev", &CreateClusterOptions::default())
            .await
            .unwrap();
        fleet.inject(&b, Fault::FailJoin).unwrap();
        let err = coord
            .add_instance("dev", &b, &AddInstanceOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "state");
        assert!(!fleet.has_account(&a, "clusteradm_recovery_2").unwrap());
        assert_eq!(fleet.group_members(&a), vec![a.clone()]);
    }

    #[tokio::test]
    async fn test_stalled_recovery_times_out_and_leaves() {
        let fleet = SimFleet::new();
        let a = fleet.provision_default("db1:3306", 1).unwrap();
        let b = fleet.provision_default("db2:3306", 2).unwrap();
        let s = session(&fleet, &a).await;
        let coord = MembershipCoordinator::new(&s);
        coord
            .create_cluster("dev", &CreateClusterOptions::default())
            .await
            .unwrap();
        fleet.inject(&b, Fault::StallRecovery).unwrap();
        let err = coord
            .add_instance("dev", &b, &AddInstanceOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "timeout");
        assert_eq!(fleet.group_members(&a), vec![a.clone()]);
        let record = cluster_named(&s.read_metadata().await.unwrap(), "dev").unwrap();
        assert_eq!(record.instances.len(), 1);
    }

    #[test]
    fn test_member_settings_fall_back_to_cluster_attributes() {
        let mut record = ClusterRecord {
            id: clusteradm_meta::ClusterId::generate(),
            name: "dev".to_string(),
            group_name: Uuid::nil(),
            topology_mode: TopologyMode::SinglePrimary,
            instances: Vec::new(),
            attributes: Default::default(),
            cluster_set: None,
            created_at: 0,
            generation: 1,
        };
        record
            .attributes
            .insert("exitStateAction".to_string(), "ABORT_SERVER".to_string());
        record
            .attributes
            .insert("autoRejoinTries".to_string(), "7".to_string());
        let settings = member_settings(&record, None, Some(80), None);
        assert_eq!(settings.exit_state_action, ExitStateAction::AbortServer);
        assert_eq!(settings.auto_rejoin_tries, 7);
        assert_eq!(settings.member_weight, 80);
        let settings = member_settings(&record, Some(ExitStateAction::OfflineMode), None, None);
        assert_eq!(settings.exit_state_action, ExitStateAction::OfflineMode);
    }
}
