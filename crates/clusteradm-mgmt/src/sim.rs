//! In-process simulated fleet implementing [`InstanceAdmin`].
//!
//! Models standalone instances, replication groups with single-primary
//! election, write fencing, GTID propagation over groups and asynchronous
//! channels, the metadata schema each instance holds, and injectable faults.
//! Group members share one metadata store; a running channel makes the
//! receiver share the source's store, which stands in for replication of
//! the schema.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use clusteradm_meta::{
    BatchOp, InstanceAddress, KvStore, MemberRole, MemoryKvStore, MetaError, TopologyMode,
    Version,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AdminError, Result};
use crate::gtid::GtidSet;
use crate::rpc::{
    ChannelSpec, ChannelStatus, GroupMember, GroupMemberState, GroupSettings, GroupView,
    InstanceAdmin, InstanceFacts, JoinRequest, MemberSettings, ReplicationAccount,
    GR_APPLIER_CHANNEL,
};

/// Fault injected on one instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fault {
    /// Next `join_group` fails
    FailJoin,
    /// Next `leave_group` fails
    FailLeave,
    /// Next `create_account` fails
    FailCreateAccount,
    /// Next `start_channel` fails
    FailStartChannel,
    /// Joining members stay RECOVERING
    StallRecovery,
    /// The next `n` calls fail with a transient connection error
    Transient(u32),
    /// Creating an account bumps the view of the instance's group
    DriftOnCreateAccount,
    /// Next metadata write through the instance fails
    FailMetadataWrite,
}

/// Definition of a simulated instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SimInstanceSpec {
    pub address: String,
    pub server_id: u32,
    pub server_uuid: Option<Uuid>,
    pub version: String,
    pub report_host: Option<String>,
    /// Overrides of the default server variables
    pub variables: BTreeMap<String, String>,
}

impl Default for SimInstanceSpec {
    fn default() -> Self {
        Self {
            address: String::new(),
            server_id: 0,
            server_uuid: None,
            version: "8.0.30".to_string(),
            report_host: None,
            variables: BTreeMap::new(),
        }
    }
}

impl SimInstanceSpec {
    pub fn new(address: &str, server_id: u32) -> Self {
        Self {
            address: address.to_string(),
            server_id,
            ..Self::default()
        }
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn uuid(mut self, uuid: Uuid) -> Self {
        self.server_uuid = Some(uuid);
        self
    }

    pub fn variable(mut self, name: &str, value: &str) -> Self {
        self.variables.insert(name.to_string(), value.to_string());
        self
    }
}

fn default_variables() -> BTreeMap<String, String> {
    [
        ("gtid_mode", "ON"),
        ("enforce_gtid_consistency", "ON"),
        ("log_bin", "ON"),
        ("innodb_page_size", "16384"),
        ("bind_address", "*"),
        ("disabled_storage_engines", "MyISAM,BLACKHOLE,FEDERATED,ARCHIVE,MEMORY"),
        ("binlog_checksum", "NONE"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[derive(Debug)]
struct SimChannel {
    source: InstanceAddress,
    running: bool,
}

#[derive(Debug)]
struct SimInstance {
    address: InstanceAddress,
    server_id: u32,
    server_uuid: Uuid,
    version: Version,
    report_host: Option<String>,
    variables: BTreeMap<String, String>,
    super_read_only: bool,
    gtid_executed: GtidSet,
    reachable: bool,
    group: Option<Uuid>,
    state: GroupMemberState,
    member: MemberSettings,
    accounts: BTreeSet<String>,
    channels: BTreeMap<String, SimChannel>,
    kv: Arc<MemoryKvStore>,
    applier_lag_ms: u64,
    faults: Vec<Fault>,
}

impl SimInstance {
    fn take_fault(&mut self, fault: &Fault) -> bool {
        match self.faults.iter().position(|f| f == fault) {
            Some(i) => {
                self.faults.remove(i);
                true
            }
            None => false,
        }
    }

    fn has_fault(&self, fault: &Fault) -> bool {
        self.faults.contains(fault)
    }
}

#[derive(Debug)]
struct SimGroup {
    name: Uuid,
    mode: TopologyMode,
    protocol_version: Version,
    view_id: u64,
    members: Vec<InstanceAddress>,
    primary: Option<InstanceAddress>,
    fenced: bool,
    settings: GroupSettings,
    kv: Arc<MemoryKvStore>,
}

#[derive(Debug, Default)]
struct FleetState {
    instances: BTreeMap<InstanceAddress, SimInstance>,
    groups: BTreeMap<Uuid, SimGroup>,
}

impl FleetState {
    fn instance(&self, address: &InstanceAddress) -> Result<&SimInstance> {
        self.instances
            .get(address)
            .ok_or_else(|| AdminError::unreachable(address, "unknown host"))
    }

    fn instance_mut(&mut self, address: &InstanceAddress) -> Result<&mut SimInstance> {
        self.instances
            .get_mut(address)
            .ok_or_else(|| AdminError::unreachable(address, "unknown host"))
    }

    /// Connection check every RPC goes through.
    fn connect(&mut self, address: &InstanceAddress) -> Result<&mut SimInstance> {
        let inst = self.instance_mut(address)?;
        if !inst.reachable {
            return Err(AdminError::unreachable(address, "no route to host"));
        }
        if let Some(pos) = inst
            .faults
            .iter()
            .position(|f| matches!(f, Fault::Transient(_)))
        {
            if let Fault::Transient(n) = &mut inst.faults[pos] {
                if *n > 0 {
                    *n -= 1;
                    return Err(AdminError::Connection {
                        address: address.to_string(),
                        message: "server is starting".to_string(),
                        transient: true,
                    });
                }
            }
            inst.faults.remove(pos);
        }
        Ok(inst)
    }

    /// Group the instance is an active member of.
    fn active_group(&self, address: &InstanceAddress) -> Option<&SimGroup> {
        let inst = self.instances.get(address)?;
        let group = self.groups.get(&inst.group?)?;
        group.members.contains(address).then_some(group)
    }

    fn effective_kv(&self, address: &InstanceAddress) -> Option<Arc<MemoryKvStore>> {
        if let Some(group) = self.active_group(address) {
            return Some(group.kv.clone());
        }
        self.instances.get(address).map(|i| i.kv.clone())
    }

    fn set_effective_kv(&mut self, address: &InstanceAddress, kv: Arc<MemoryKvStore>) {
        let group = self.active_group(address).map(|g| g.name);
        match group.and_then(|g| self.groups.get_mut(&g)) {
            Some(group) => group.kv = kv,
            None => {
                if let Some(inst) = self.instances.get_mut(address) {
                    inst.kv = kv;
                }
            }
        }
    }

    fn detach_kv(&mut self, address: &InstanceAddress) -> Result<()> {
        if let Some(kv) = self.effective_kv(address) {
            let copy = kv.snapshot().map_err(AdminError::from)?;
            self.set_effective_kv(address, Arc::new(copy));
        }
        Ok(())
    }

    /// Gives a departing member a private copy of what it last saw.
    fn detach_member_kv(&mut self, address: &InstanceAddress) -> Result<()> {
        if let Some(kv) = self.effective_kv(address) {
            let copy = kv.snapshot().map_err(AdminError::from)?;
            if let Some(inst) = self.instances.get_mut(address) {
                inst.kv = Arc::new(copy);
            }
        }
        Ok(())
    }

    /// Recomputes read-only flags of every member of `group`.
    fn apply_roles(&mut self, group: &Uuid) {
        let Some(g) = self.groups.get(group) else {
            return;
        };
        let members = g.members.clone();
        let primary = g.primary.clone();
        let fenced = g.fenced;
        let multi = g.mode == TopologyMode::MultiPrimary;
        for address in members {
            if let Some(inst) = self.instances.get_mut(&address) {
                let writable = multi || primary.as_ref() == Some(&address);
                inst.super_read_only = fenced || !writable;
            }
        }
    }

    /// Picks a new primary among reachable ONLINE members when the current
    /// one is gone and a majority remains.
    fn elect(&mut self, group: &Uuid) {
        let Some(g) = self.groups.get(group) else {
            return;
        };
        if g.mode == TopologyMode::MultiPrimary {
            return;
        }
        let current_ok = g
            .primary
            .as_ref()
            .and_then(|p| self.instances.get(p))
            .map(|i| i.reachable && i.state == GroupMemberState::Online && g.members.contains(&i.address))
            .unwrap_or(false);
        if current_ok {
            return;
        }
        let candidates: Vec<&SimInstance> = g
            .members
            .iter()
            .filter_map(|a| self.instances.get(a))
            .filter(|i| i.reachable && i.state == GroupMemberState::Online)
            .collect();
        let primary = if candidates.len() * 2 > g.members.len() {
            candidates
                .iter()
                .max_by(|a, b| {
                    a.member
                        .member_weight
                        .cmp(&b.member.member_weight)
                        .then_with(|| b.server_uuid.cmp(&a.server_uuid))
                })
                .map(|i| i.address.clone())
        } else {
            None
        };
        if let Some(g) = self.groups.get_mut(group) {
            if g.primary != primary {
                g.view_id += 1;
                info!(group = %g.name, primary = ?primary.as_ref().map(|p| p.to_string()), "primary elected");
            }
            g.primary = primary;
        }
        self.apply_roles(group);
    }

    fn remove_member(&mut self, address: &InstanceAddress) {
        let Some(group) = self.instances.get(address).and_then(|i| i.group) else {
            return;
        };
        if let Some(g) = self.groups.get_mut(&group) {
            if !g.members.contains(address) {
                // Expelled earlier; the view already excludes it.
                return;
            }
            g.members.retain(|a| a != address);
            g.view_id += 1;
            if g.primary.as_ref() == Some(address) {
                g.primary = None;
            }
            if g.members.is_empty() {
                self.groups.remove(&group);
            }
        }
        self.elect(&group);
    }

    /// Spreads transactions over groups and running channels until stable.
    fn propagate(&mut self) {
        loop {
            let mut changed = false;
            let groups: Vec<Vec<InstanceAddress>> =
                self.groups.values().map(|g| g.members.clone()).collect();
            for members in groups {
                let live: Vec<InstanceAddress> = members
                    .into_iter()
                    .filter(|a| {
                        self.instances
                            .get(a)
                            .map(|i| i.reachable && i.state != GroupMemberState::Error)
                            .unwrap_or(false)
                    })
                    .collect();
                let mut union = GtidSet::new();
                let mut accounts = BTreeSet::new();
                for a in &live {
                    if let Some(i) = self.instances.get(a) {
                        union = union.union(&i.gtid_executed);
                        accounts.extend(i.accounts.iter().cloned());
                    }
                }
                for a in &live {
                    if let Some(i) = self.instances.get_mut(a) {
                        if i.gtid_executed != union || i.accounts != accounts {
                            i.gtid_executed = union.clone();
                            i.accounts = accounts.clone();
                            changed = true;
                        }
                    }
                }
            }

            let links: Vec<(InstanceAddress, InstanceAddress)> = self
                .instances
                .values()
                .filter(|i| i.reachable)
                .flat_map(|i| {
                    i.channels
                        .values()
                        .filter(|c| c.running)
                        .map(move |c| (c.source.clone(), i.address.clone()))
                })
                .collect();
            for (source, receiver) in links {
                let Some(src) = self.instances.get(&source).filter(|s| s.reachable) else {
                    continue;
                };
                let incoming = src.gtid_executed.clone();
                let users = src.accounts.clone();
                if let Some(r) = self.instances.get_mut(&receiver) {
                    if !incoming.is_subset_of(&r.gtid_executed) || !users.is_subset(&r.accounts) {
                        r.gtid_executed = r.gtid_executed.union(&incoming);
                        r.accounts.extend(users);
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn view_for(&self, address: &InstanceAddress) -> Option<GroupView> {
        let inst = self.instances.get(address)?;
        let group = self.groups.get(&inst.group?)?;
        let member = |i: &SimInstance, state: GroupMemberState| GroupMember {
            server_uuid: i.server_uuid,
            address: i.address.clone(),
            role: if group.mode == TopologyMode::MultiPrimary
                || group.primary.as_ref() == Some(&i.address)
            {
                MemberRole::Primary
            } else {
                MemberRole::Secondary
            },
            state,
            version: i.version,
            local_address: i.member.local_address.clone(),
        };
        if !group.members.contains(address) {
            // Expelled: the member only sees itself.
            return Some(GroupView {
                group_name: group.name,
                view_id: group.view_id,
                mode: group.mode,
                protocol_version: group.protocol_version,
                members: vec![member(inst, GroupMemberState::Error)],
            });
        }
        let members = group
            .members
            .iter()
            .filter_map(|a| self.instances.get(a))
            .map(|i| {
                let state = if i.reachable { i.state } else { GroupMemberState::Unreachable };
                member(i, state)
            })
            .collect();
        Some(GroupView {
            group_name: group.name,
            view_id: group.view_id,
            mode: group.mode,
            protocol_version: group.protocol_version,
            members,
        })
    }

    fn apply_member_settings(inst: &mut SimInstance, group: &Uuid, settings: &MemberSettings) {
        inst.member = settings.clone();
        inst.variables
            .insert("group_replication_group_name".into(), group.to_string());
        inst.variables.insert(
            "group_replication_exit_state_action".into(),
            settings.exit_state_action.to_string(),
        );
        inst.variables.insert(
            "group_replication_member_weight".into(),
            settings.member_weight.to_string(),
        );
        inst.variables.insert(
            "group_replication_autorejoin_tries".into(),
            settings.auto_rejoin_tries.to_string(),
        );
        inst.variables.insert(
            "group_replication_local_address".into(),
            settings.local_address.clone().unwrap_or_default(),
        );
    }
}

fn lock(state: &Mutex<FleetState>) -> MutexGuard<'_, FleetState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle to a simulated fleet. Clones share the same fleet.
#[derive(Clone, Debug, Default)]
pub struct SimFleet {
    state: Arc<Mutex<FleetState>>,
}

impl SimFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a standalone, writable instance.
    pub fn provision(&self, spec: SimInstanceSpec) -> Result<InstanceAddress> {
        let address: InstanceAddress = spec.address.parse()?;
        let version: Version = spec.version.parse()?;
        let mut variables = default_variables();
        variables.extend(spec.variables);
        let mut state = lock(&self.state);
        if state.instances.contains_key(&address) {
            return Err(AdminError::InvalidOption(format!(
                "instance {} already provisioned",
                address
            )));
        }
        let inst = SimInstance {
            address: address.clone(),
            server_id: spec.server_id,
            server_uuid: spec.server_uuid.unwrap_or_else(Uuid::new_v4),
            version,
            report_host: spec.report_host,
            variables,
            super_read_only: false,
            gtid_executed: GtidSet::new(),
            reachable: true,
            group: None,
            state: GroupMemberState::Offline,
            member: MemberSettings::default(),
            accounts: BTreeSet::new(),
            channels: BTreeMap::new(),
            kv: Arc::new(MemoryKvStore::new()),
            applier_lag_ms: 0,
            faults: Vec::new(),
        };
        debug!(address = %address, server_id = inst.server_id, "instance provisioned");
        state.instances.insert(address.clone(), inst);
        Ok(address)
    }

    /// Shorthand for a default 8.0.30 instance.
    pub fn provision_default(&self, address: &str, server_id: u32) -> Result<InstanceAddress> {
        self.provision(SimInstanceSpec::new(address, server_id))
    }

    pub fn inject(&self, address: &InstanceAddress, fault: Fault) -> Result<()> {
        let mut state = lock(&self.state);
        state.instance_mut(address)?.faults.push(fault);
        Ok(())
    }

    pub fn clear_faults(&self, address: &InstanceAddress) -> Result<()> {
        let mut state = lock(&self.state);
        state.instance_mut(address)?.faults.clear();
        Ok(())
    }

    /// Makes an instance unreachable or reachable again. A lost primary is
    /// replaced when the remaining members keep a majority.
    pub fn set_reachable(&self, address: &InstanceAddress, reachable: bool) -> Result<()> {
        let mut state = lock(&self.state);
        let group = {
            let inst = state.instance_mut(address)?;
            inst.reachable = reachable;
            inst.group
        };
        if let Some(group) = group {
            if let Some(g) = state.groups.get_mut(&group) {
                g.view_id += 1;
            }
            state.elect(&group);
        }
        state.propagate();
        info!(address = %address, reachable, "reachability changed");
        Ok(())
    }

    /// Stops the server: the group drops it and it comes back standalone on
    /// `restart`.
    pub fn crash(&self, address: &InstanceAddress) -> Result<()> {
        let mut state = lock(&self.state);
        state.detach_member_kv(address)?;
        state.remove_member(address);
        let inst = state.instance_mut(address)?;
        inst.group = None;
        inst.state = GroupMemberState::Offline;
        inst.reachable = false;
        inst.channels.values_mut().for_each(|c| c.running = false);
        info!(address = %address, "instance crashed");
        Ok(())
    }

    pub fn restart(&self, address: &InstanceAddress) -> Result<()> {
        let mut state = lock(&self.state);
        let inst = state.instance_mut(address)?;
        inst.reachable = true;
        inst.super_read_only = true;
        info!(address = %address, "instance restarted");
        Ok(())
    }

    /// Expels a member: the group drops it and it stays in ERROR.
    pub fn expel(&self, address: &InstanceAddress) -> Result<()> {
        let mut state = lock(&self.state);
        state.detach_member_kv(address)?;
        state.remove_member(address);
        let inst = state.instance_mut(address)?;
        inst.state = GroupMemberState::Error;
        inst.super_read_only = true;
        info!(address = %address, "member expelled");
        Ok(())
    }

    /// Client writes; refused under super_read_only.
    pub fn write_transactions(&self, address: &InstanceAddress, count: u64) -> Result<()> {
        let mut state = lock(&self.state);
        let source = state.active_group(address).map(|g| g.name.to_string());
        let inst = state.connect(address)?;
        if inst.super_read_only {
            return Err(AdminError::ReadOnly(format!(
                "{} is running with super_read_only",
                address
            )));
        }
        let source = source.unwrap_or_else(|| inst.server_uuid.to_string());
        inst.gtid_executed.append(&source, count);
        state.propagate();
        Ok(())
    }

    /// Writes that bypass read-only protection, producing errant transactions.
    pub fn write_errant(&self, address: &InstanceAddress, count: u64) -> Result<()> {
        let mut state = lock(&self.state);
        let inst = state.connect(address)?;
        let source = inst.server_uuid.to_string();
        inst.gtid_executed.append(&source, count);
        Ok(())
    }

    pub fn set_applier_lag(&self, address: &InstanceAddress, lag_ms: u64) -> Result<()> {
        let mut state = lock(&self.state);
        state.instance_mut(address)?.applier_lag_ms = lag_ms;
        Ok(())
    }

    /// Lets stalled members finish recovery.
    pub fn finish_recovery(&self, address: &InstanceAddress) -> Result<()> {
        let mut state = lock(&self.state);
        let inst = state.instance_mut(address)?;
        inst.faults.retain(|f| f != &Fault::StallRecovery);
        if inst.state == GroupMemberState::Recovering {
            inst.state = GroupMemberState::Online;
        }
        if let Some(group) = inst.group {
            state.elect(&group);
        }
        Ok(())
    }

    pub fn super_read_only(&self, address: &InstanceAddress) -> Result<bool> {
        Ok(lock(&self.state).instance(address)?.super_read_only)
    }

    pub fn gtid_executed(&self, address: &InstanceAddress) -> Result<GtidSet> {
        Ok(lock(&self.state).instance(address)?.gtid_executed.clone())
    }

    pub fn has_account(&self, address: &InstanceAddress, user: &str) -> Result<bool> {
        Ok(lock(&self.state).instance(address)?.accounts.contains(user))
    }

    /// Addresses of the members of the instance's group, in join order.
    pub fn group_members(&self, address: &InstanceAddress) -> Vec<InstanceAddress> {
        lock(&self.state)
            .active_group(address)
            .map(|g| g.members.clone())
            .unwrap_or_default()
    }

    pub fn instances(&self) -> Vec<InstanceAddress> {
        lock(&self.state).instances.keys().cloned().collect()
    }

    fn guarded(&self, address: &InstanceAddress) -> Arc<dyn KvStore> {
        Arc::new(GuardedKv {
            state: self.state.clone(),
            address: address.clone(),
        })
    }
}

#[async_trait]
impl InstanceAdmin for SimFleet {
    async fn fetch_facts(&self, address: &InstanceAddress) -> Result<InstanceFacts> {
        let mut state = lock(&self.state);
        let inst = state.connect(address)?;
        Ok(InstanceFacts {
            address: inst.address.clone(),
            server_id: inst.server_id,
            server_uuid: inst.server_uuid,
            version: inst.version,
            hostname: inst.address.host().to_string(),
            report_host: inst.report_host.clone(),
            super_read_only: inst.super_read_only,
            gtid_executed: inst.gtid_executed.clone(),
            variables: inst.variables.clone(),
        })
    }

    async fn group_view(&self, address: &InstanceAddress) -> Result<Option<GroupView>> {
        let mut state = lock(&self.state);
        state.connect(address)?;
        Ok(state.view_for(address))
    }

    async fn bootstrap_group(
        &self,
        address: &InstanceAddress,
        settings: &GroupSettings,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        if state.groups.contains_key(&settings.group_name) {
            return Err(AdminError::State(format!(
                "group {} already exists",
                settings.group_name
            )));
        }
        let inst = state.connect(address)?;
        if inst.group.is_some() {
            return Err(AdminError::State(format!(
                "{} is already running group replication",
                address
            )));
        }
        inst.group = Some(settings.group_name);
        inst.state = GroupMemberState::Online;
        FleetState::apply_member_settings(inst, &settings.group_name, &settings.member);
        inst.variables.insert(
            "group_replication_single_primary_mode".into(),
            if settings.mode == TopologyMode::SinglePrimary { "ON" } else { "OFF" }.into(),
        );
        inst.variables.insert(
            "group_replication_consistency".into(),
            settings.consistency.to_string(),
        );
        inst.variables
            .insert("group_replication_ssl_mode".into(), settings.ssl_mode.to_string());
        inst.variables.insert(
            "group_replication_member_expel_timeout".into(),
            settings.expel_timeout.to_string(),
        );
        let group = SimGroup {
            name: settings.group_name,
            mode: settings.mode,
            protocol_version: inst.version,
            view_id: 1,
            members: vec![address.clone()],
            primary: Some(address.clone()),
            fenced: false,
            settings: settings.clone(),
            kv: inst.kv.clone(),
        };
        state.groups.insert(settings.group_name, group);
        state.apply_roles(&settings.group_name);
        info!(address = %address, group = %settings.group_name, "group bootstrapped");
        Ok(())
    }

    async fn join_group(&self, address: &InstanceAddress, request: &JoinRequest) -> Result<()> {
        let mut state = lock(&self.state);
        {
            let seed = state.connect(&request.seed)?;
            if seed.group != Some(request.group_name) {
                return Err(AdminError::State(format!(
                    "{} is not a member of group {}",
                    request.seed, request.group_name
                )));
            }
        }
        let (group_gtids, primary, settings) = {
            let group = state.groups.get(&request.group_name).ok_or_else(|| {
                AdminError::State(format!("group {} does not exist", request.group_name))
            })?;
            let mut gtids = GtidSet::new();
            for a in &group.members {
                if let Some(i) = state.instances.get(a) {
                    gtids = gtids.union(&i.gtid_executed);
                }
            }
            (gtids, group.primary.clone(), group.settings.clone())
        };
        let recovery_ok = primary
            .as_ref()
            .and_then(|p| state.instances.get(p))
            .map(|p| p.accounts.contains(&request.recovery_user))
            .unwrap_or(false);

        let inst = state.connect(address)?;
        if inst.take_fault(&Fault::FailJoin) {
            return Err(AdminError::State(format!(
                "group replication failed to start on {}",
                address
            )));
        }
        if inst.group.is_some() {
            return Err(AdminError::State(format!(
                "{} is already running group replication",
                address
            )));
        }
        if !inst.gtid_executed.is_subset_of(&group_gtids) {
            return Err(AdminError::State(format!(
                "{} has transactions not present in the group: {}",
                address,
                inst.gtid_executed.difference(&group_gtids)
            )));
        }
        inst.group = Some(request.group_name);
        inst.state = if !recovery_ok {
            GroupMemberState::Error
        } else if inst.has_fault(&Fault::StallRecovery) {
            GroupMemberState::Recovering
        } else {
            GroupMemberState::Online
        };
        FleetState::apply_member_settings(inst, &request.group_name, &request.member);
        inst.variables.insert(
            "group_replication_single_primary_mode".into(),
            if settings.mode == TopologyMode::SinglePrimary { "ON" } else { "OFF" }.into(),
        );
        inst.variables.insert(
            "group_replication_consistency".into(),
            settings.consistency.to_string(),
        );
        if let Some(group) = state.groups.get_mut(&request.group_name) {
            group.members.push(address.clone());
            group.view_id += 1;
        }
        let accounts: BTreeSet<String> = primary
            .as_ref()
            .and_then(|p| state.instances.get(p))
            .map(|p| p.accounts.clone())
            .unwrap_or_default();
        if let Some(inst) = state.instances.get_mut(address) {
            inst.accounts.extend(accounts);
        }
        state.apply_roles(&request.group_name);
        state.elect(&request.group_name);
        state.propagate();
        info!(address = %address, group = %request.group_name, "member joined");
        Ok(())
    }

    async fn leave_group(&self, address: &InstanceAddress) -> Result<()> {
        let mut state = lock(&self.state);
        let inst = state.connect(address)?;
        if inst.take_fault(&Fault::FailLeave) {
            return Err(AdminError::State(format!(
                "group replication failed to stop on {}",
                address
            )));
        }
        if inst.group.is_none() {
            return Ok(());
        }
        state.detach_member_kv(address)?;
        state.remove_member(address);
        let inst = state.instance_mut(address)?;
        inst.group = None;
        inst.state = GroupMemberState::Offline;
        inst.super_read_only = true;
        info!(address = %address, "member left group");
        Ok(())
    }

    async fn set_protocol_version(
        &self,
        address: &InstanceAddress,
        version: &Version,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        state.connect(address)?;
        let group = state
            .active_group(address)
            .map(|g| g.name)
            .ok_or_else(|| AdminError::State(format!("{} is not in a group", address)))?;
        let lowest = state.view_for(address).and_then(|v| v.lowest_version());
        if lowest.map(|l| *version > l).unwrap_or(true) {
            return Err(AdminError::State(format!(
                "protocol {} is newer than the oldest member",
                version
            )));
        }
        if let Some(g) = state.groups.get_mut(&group) {
            g.protocol_version = *version;
        }
        Ok(())
    }

    async fn set_group_fenced(&self, address: &InstanceAddress, fenced: bool) -> Result<()> {
        let mut state = lock(&self.state);
        state.connect(address)?;
        let group = state
            .active_group(address)
            .map(|g| g.name)
            .ok_or_else(|| AdminError::State(format!("{} is not in a group", address)))?;
        if let Some(g) = state.groups.get_mut(&group) {
            g.fenced = fenced;
        }
        state.apply_roles(&group);
        info!(address = %address, fenced, "group fencing changed");
        Ok(())
    }

    async fn set_super_read_only(&self, address: &InstanceAddress, enabled: bool) -> Result<()> {
        let mut state = lock(&self.state);
        state.connect(address)?.super_read_only = enabled;
        Ok(())
    }

    async fn create_account(
        &self,
        address: &InstanceAddress,
        account: &ReplicationAccount,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        let inst = state.connect(address)?;
        if inst.take_fault(&Fault::FailCreateAccount) {
            return Err(AdminError::State(format!(
                "CREATE USER {} failed on {}",
                account.user, address
            )));
        }
        if inst.super_read_only {
            return Err(AdminError::ReadOnly(format!(
                "{} is running with super_read_only",
                address
            )));
        }
        let drift = inst.take_fault(&Fault::DriftOnCreateAccount);
        let members = state
            .active_group(address)
            .map(|g| g.members.clone())
            .unwrap_or_else(|| vec![address.clone()]);
        for a in &members {
            if let Some(i) = state.instances.get_mut(a) {
                i.accounts.insert(account.user.clone());
            }
        }
        if drift {
            if let Some(group) = state.active_group(address).map(|g| g.name) {
                if let Some(g) = state.groups.get_mut(&group) {
                    g.view_id += 1;
                }
            }
        }
        state.propagate();
        Ok(())
    }

    async fn drop_account(&self, address: &InstanceAddress, user: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.connect(address)?;
        let members = state
            .active_group(address)
            .map(|g| g.members.clone())
            .unwrap_or_else(|| vec![address.clone()]);
        for a in &members {
            if let Some(i) = state.instances.get_mut(a) {
                i.accounts.remove(user);
            }
        }
        Ok(())
    }

    async fn start_channel(&self, address: &InstanceAddress, spec: &ChannelSpec) -> Result<()> {
        let mut state = lock(&self.state);
        {
            let inst = state.connect(address)?;
            if inst.take_fault(&Fault::FailStartChannel) {
                return Err(AdminError::State(format!(
                    "START REPLICA FOR CHANNEL '{}' failed on {}",
                    spec.name, address
                )));
            }
        }
        let source_kv = {
            let source = state.connect(&spec.source)?;
            if !source.accounts.contains(&spec.user) {
                return Err(AdminError::State(format!(
                    "access denied for replication user '{}' on {}",
                    spec.user, spec.source
                )));
            }
            state.effective_kv(&spec.source)
        };
        let inst = state.instance_mut(address)?;
        inst.channels.insert(
            spec.name.clone(),
            SimChannel {
                source: spec.source.clone(),
                running: true,
            },
        );
        if let Some(kv) = source_kv {
            state.set_effective_kv(address, kv);
        }
        state.propagate();
        info!(address = %address, channel = %spec.name, source = %spec.source, "channel started");
        Ok(())
    }

    async fn stop_channel(&self, address: &InstanceAddress, channel: &str) -> Result<()> {
        let mut state = lock(&self.state);
        let inst = state.connect(address)?;
        if inst.channels.remove(channel).is_some() {
            state.detach_kv(address)?;
            info!(address = %address, channel, "channel stopped");
        }
        Ok(())
    }

    async fn channel_status(
        &self,
        address: &InstanceAddress,
        channel: &str,
    ) -> Result<Option<ChannelStatus>> {
        let mut state = lock(&self.state);
        state.connect(address)?;
        let inst = state.instance(address)?;
        if channel == GR_APPLIER_CHANNEL {
            if state.active_group(address).is_none() {
                return Ok(None);
            }
            return Ok(Some(ChannelStatus {
                name: channel.to_string(),
                source: None,
                running: inst.state == GroupMemberState::Online,
                lag_ms: Some(inst.applier_lag_ms),
                last_error: None,
            }));
        }
        Ok(inst.channels.get(channel).map(|c| {
            let source_up = state
                .instances
                .get(&c.source)
                .map(|s| s.reachable)
                .unwrap_or(false);
            ChannelStatus {
                name: channel.to_string(),
                source: Some(c.source.clone()),
                running: c.running && source_up,
                lag_ms: source_up.then_some(inst.applier_lag_ms),
                last_error: (!source_up).then(|| format!("error connecting to source {}", c.source)),
            }
        }))
    }

    async fn metadata_store(&self, address: &InstanceAddress) -> Result<Arc<dyn KvStore>> {
        lock(&self.state).connect(address)?;
        Ok(self.guarded(address))
    }
}

/// Metadata access through one instance: fails when the instance is down
/// and refuses writes under super_read_only.
struct GuardedKv {
    state: Arc<Mutex<FleetState>>,
    address: InstanceAddress,
}

impl GuardedKv {
    fn resolve(&self, write: bool) -> std::result::Result<Arc<MemoryKvStore>, MetaError> {
        let mut state = lock(&self.state);
        let inst = state
            .instances
            .get_mut(&self.address)
            .ok_or_else(|| MetaError::KvError(format!("unknown instance {}", self.address)))?;
        if !inst.reachable {
            return Err(MetaError::KvError(format!("lost connection to {}", self.address)));
        }
        if write && inst.super_read_only {
            return Err(MetaError::ReadOnly);
        }
        if write && inst.take_fault(&Fault::FailMetadataWrite) {
            return Err(MetaError::KvError(format!("metadata write failed on {}", self.address)));
        }
        state
            .effective_kv(&self.address)
            .ok_or_else(|| MetaError::KvError(format!("unknown instance {}", self.address)))
    }
}

impl KvStore for GuardedKv {
    fn get(&self, key: &[u8]) -> std::result::Result<Option<Vec<u8>>, MetaError> {
        self.resolve(false)?.get(key)
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> std::result::Result<(), MetaError> {
        self.resolve(true)?.put(key, value)
    }

    fn delete(&self, key: &[u8]) -> std::result::Result<(), MetaError> {
        self.resolve(true)?.delete(key)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> std::result::Result<Vec<(Vec<u8>, Vec<u8>)>, MetaError> {
        self.resolve(false)?.scan_prefix(prefix)
    }

    fn contains_key(&self, key: &[u8]) -> std::result::Result<bool, MetaError> {
        self.resolve(false)?.contains_key(key)
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> std::result::Result<(), MetaError> {
        self.resolve(true)?.write_batch(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{ConsistencyLevel, MemberSslMode, RecoveryMethod};

    fn settings(group: Uuid) -> GroupSettings {
        GroupSettings {
            group_name: group,
            mode: TopologyMode::SinglePrimary,
            ssl_mode: MemberSslMode::Auto,
            consistency: ConsistencyLevel::Eventual,
            expel_timeout: 5,
            member: MemberSettings::default(),
        }
    }

    fn join(group: Uuid, seed: &InstanceAddress) -> JoinRequest {
        JoinRequest {
            group_name: group,
            seed: seed.clone(),
            member: MemberSettings::default(),
            recovery_user: "rec".to_string(),
            recovery_method: RecoveryMethod::Auto,
        }
    }

    async fn three_member_group(fleet: &SimFleet) -> (Uuid, Vec<InstanceAddress>) {
        let group = Uuid::new_v4();
        let addrs: Vec<InstanceAddress> = (1..=3)
            .map(|n| fleet.provision_default(&format!("db{}:3306", n), n).unwrap())
            .collect();
        fleet.bootstrap_group(&addrs[0], &settings(group)).await.unwrap();
        let account = ReplicationAccount {
            user: "rec".to_string(),
            password: "pw".to_string(),
            host: "%".to_string(),
        };
        fleet.create_account(&addrs[0], &account).await.unwrap();
        for a in &addrs[1..] {
            fleet.join_group(a, &join(group, &addrs[0])).await.unwrap();
        }
        (group, addrs)
    }

    #[tokio::test]
    async fn test_group_roles_and_read_only() {
        let fleet = SimFleet::new();
        let (_, addrs) = three_member_group(&fleet).await;
        let view = fleet.group_view(&addrs[1]).await.unwrap().unwrap();
        assert_eq!(view.members.len(), 3);
        assert_eq!(view.primary().unwrap().address, addrs[0]);
        assert!(!fleet.super_read_only(&addrs[0]).unwrap());
        assert!(fleet.super_read_only(&addrs[1]).unwrap());
        assert!(fleet.write_transactions(&addrs[1], 1).is_err());
    }

    #[tokio::test]
    async fn test_writes_propagate_through_group() {
        let fleet = SimFleet::new();
        let (_, addrs) = three_member_group(&fleet).await;
        fleet.write_transactions(&addrs[0], 5).unwrap();
        assert_eq!(fleet.gtid_executed(&addrs[2]).unwrap().count(), 5);
    }

    #[tokio::test]
    async fn test_primary_failover_on_unreachable() {
        let fleet = SimFleet::new();
        let (_, addrs) = three_member_group(&fleet).await;
        fleet.set_reachable(&addrs[0], false).unwrap();
        let view = fleet.group_view(&addrs[1]).await.unwrap().unwrap();
        let primary = view.primary().unwrap();
        assert_ne!(primary.address, addrs[0]);
        assert!(!fleet.super_read_only(&primary.address).unwrap());
        assert_eq!(
            view.member_by_address(&addrs[0]).unwrap().state,
            GroupMemberState::Unreachable
        );
    }

    #[tokio::test]
    async fn test_no_primary_without_majority() {
        let fleet = SimFleet::new();
        let (_, addrs) = three_member_group(&fleet).await;
        fleet.set_reachable(&addrs[0], false).unwrap();
        fleet.set_reachable(&addrs[1], false).unwrap();
        let view = fleet.group_view(&addrs[2]).await.unwrap().unwrap();
        assert!(view.primary().is_none());
        assert!(!view.has_quorum());
    }

    #[tokio::test]
    async fn test_join_without_recovery_account_errors() {
        let fleet = SimFleet::new();
        let group = Uuid::new_v4();
        let a = fleet.provision_default("db1:3306", 1).unwrap();
        let b = fleet.provision_default("db2:3306", 2).unwrap();
        fleet.bootstrap_group(&a, &settings(group)).await.unwrap();
        fleet.join_group(&b, &join(group, &a)).await.unwrap();
        let view = fleet.group_view(&a).await.unwrap().unwrap();
        assert_eq!(view.member_by_address(&b).unwrap().state, GroupMemberState::Error);
    }

    #[tokio::test]
    async fn test_errant_transactions_block_join() {
        let fleet = SimFleet::new();
        let (group, addrs) = three_member_group(&fleet).await;
        let d = fleet.provision_default("db4:3306", 4).unwrap();
        fleet.write_errant(&d, 2).unwrap();
        assert!(fleet.join_group(&d, &join(group, &addrs[0])).await.is_err());
    }

    #[tokio::test]
    async fn test_members_share_metadata_until_they_leave() {
        let fleet = SimFleet::new();
        let (_, addrs) = three_member_group(&fleet).await;
        let primary_kv = fleet.metadata_store(&addrs[0]).await.unwrap();
        primary_kv.put(b"k".to_vec(), b"v1".to_vec()).unwrap();
        let secondary_kv = fleet.metadata_store(&addrs[1]).await.unwrap();
        assert_eq!(secondary_kv.get(b"k").unwrap(), Some(b"v1".to_vec()));
        assert!(matches!(
            secondary_kv.put(b"k".to_vec(), b"x".to_vec()),
            Err(MetaError::ReadOnly)
        ));

        fleet.leave_group(&addrs[1]).await.unwrap();
        primary_kv.put(b"k".to_vec(), b"v2".to_vec()).unwrap();
        assert_eq!(secondary_kv.get(b"k").unwrap(), Some(b"v1".to_vec()));
    }

    #[tokio::test]
    async fn test_channel_replicates_transactions_and_metadata() {
        let fleet = SimFleet::new();
        let (_, addrs) = three_member_group(&fleet).await;
        let replica = fleet.provision_default("dr1:3306", 11).unwrap();
        let spec = ChannelSpec {
            name: "clusterset_replication".to_string(),
            source: addrs[0].clone(),
            user: "rec".to_string(),
        };
        fleet.start_channel(&replica, &spec).await.unwrap();
        fleet.write_transactions(&addrs[0], 3).unwrap();
        assert_eq!(fleet.gtid_executed(&replica).unwrap().count(), 3);

        let status = fleet
            .channel_status(&replica, "clusterset_replication")
            .await
            .unwrap()
            .unwrap();
        assert!(status.running);

        fleet.set_reachable(&addrs[0], false).unwrap();
        let status = fleet
            .channel_status(&replica, "clusterset_replication")
            .await
            .unwrap()
            .unwrap();
        assert!(!status.running);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn test_transient_fault_counts_down() {
        let fleet = SimFleet::new();
        let a = fleet.provision_default("db1:3306", 1).unwrap();
        fleet.inject(&a, Fault::Transient(2)).unwrap();
        assert!(fleet.fetch_facts(&a).await.unwrap_err().is_transient());
        assert!(fleet.fetch_facts(&a).await.unwrap_err().is_transient());
        assert!(fleet.fetch_facts(&a).await.is_ok());
    }

    #[tokio::test]
    async fn test_expelled_member_sees_error_state() {
        let fleet = SimFleet::new();
        let (group, addrs) = three_member_group(&fleet).await;
        fleet.expel(&addrs[2]).unwrap();
        let own = fleet.group_view(&addrs[2]).await.unwrap().unwrap();
        assert_eq!(own.group_name, group);
        assert_eq!(own.members[0].state, GroupMemberState::Error);
        let view = fleet.group_view(&addrs[0]).await.unwrap().unwrap();
        assert_eq!(view.members.len(), 2);
    }
}
