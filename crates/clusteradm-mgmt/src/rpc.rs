//! Administrative RPC surface of a managed database instance.
//!
//! The management core never talks to a server directly; everything goes
//! through [`InstanceAdmin`]. A production binding would issue SQL over a
//! client connection, [`crate::sim::SimFleet`] implements it in-process.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use clusteradm_meta::{InstanceAddress, KvStore, MemberRole, TopologyMode, Version};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::gtid::GtidSet;
use crate::options::{ConsistencyLevel, ExitStateAction, MemberSslMode, RecoveryMethod};

/// Applier channel of group replication, used for lag reporting.
pub const GR_APPLIER_CHANNEL: &str = "group_replication_applier";
/// Channel from a cluster set's primary cluster into a replica cluster.
pub const CLUSTERSET_CHANNEL: &str = "clusterset_replication";
/// Default channel used by replica sets.
pub const REPLICASET_CHANNEL: &str = "";

/// Static and dynamic facts reported by an instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceFacts {
    pub address: InstanceAddress,
    pub server_id: u32,
    pub server_uuid: Uuid,
    pub version: Version,
    pub hostname: String,
    /// Explicit `report_host`, when configured
    pub report_host: Option<String>,
    pub super_read_only: bool,
    pub gtid_executed: GtidSet,
    /// Server variables relevant to replication, lower-case names
    pub variables: BTreeMap<String, String>,
}

impl InstanceFacts {
    /// Host other members use to reach this instance.
    pub fn reported_host(&self) -> &str {
        self.report_host.as_deref().unwrap_or(&self.hostname)
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    /// Group communication endpoint, when configured.
    pub fn local_address(&self) -> Option<&str> {
        self.variable("group_replication_local_address")
            .filter(|v| !v.is_empty())
    }
}

/// Membership state of a member as seen by the group.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupMemberState {
    Online,
    Recovering,
    Unreachable,
    Error,
    Offline,
}

impl fmt::Display for GroupMemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GroupMemberState::Online => "ONLINE",
            GroupMemberState::Recovering => "RECOVERING",
            GroupMemberState::Unreachable => "UNREACHABLE",
            GroupMemberState::Error => "ERROR",
            GroupMemberState::Offline => "OFFLINE",
        };
        f.write_str(s)
    }
}

/// One entry of a group view.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
    pub server_uuid: Uuid,
    pub address: InstanceAddress,
    pub role: MemberRole,
    pub state: GroupMemberState,
    pub version: Version,
    pub local_address: Option<String>,
}

/// Live membership of a replication group as seen from one member.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupView {
    pub group_name: Uuid,
    /// Changes on every membership change
    pub view_id: u64,
    pub mode: TopologyMode,
    /// Communication protocol version in use
    pub protocol_version: Version,
    pub members: Vec<GroupMember>,
}

impl GroupView {
    pub fn member(&self, server_uuid: &Uuid) -> Option<&GroupMember> {
        self.members.iter().find(|m| &m.server_uuid == server_uuid)
    }

    pub fn member_by_address(&self, address: &InstanceAddress) -> Option<&GroupMember> {
        self.members.iter().find(|m| &m.address == address)
    }

    /// The ONLINE primary in single-primary mode.
    pub fn primary(&self) -> Option<&GroupMember> {
        self.members
            .iter()
            .find(|m| m.role == MemberRole::Primary && m.state == GroupMemberState::Online)
    }

    pub fn online(&self) -> impl Iterator<Item = &GroupMember> {
        self.members
            .iter()
            .filter(|m| m.state == GroupMemberState::Online)
    }

    /// True when ONLINE members are a strict majority of the view.
    pub fn has_quorum(&self) -> bool {
        self.online().count() * 2 > self.members.len()
    }

    /// Lowest server version among members.
    pub fn lowest_version(&self) -> Option<Version> {
        self.members.iter().map(|m| m.version).min()
    }
}

/// Per-member group replication settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemberSettings {
    pub exit_state_action: ExitStateAction,
    pub member_weight: u8,
    pub auto_rejoin_tries: u32,
    pub local_address: Option<String>,
}

impl Default for MemberSettings {
    fn default() -> Self {
        Self {
            exit_state_action: ExitStateAction::ReadOnly,
            member_weight: 50,
            auto_rejoin_tries: 3,
            local_address: None,
        }
    }
}

/// Settings used to bootstrap a new group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupSettings {
    pub group_name: Uuid,
    pub mode: TopologyMode,
    pub ssl_mode: MemberSslMode,
    pub consistency: ConsistencyLevel,
    pub expel_timeout: u32,
    pub member: MemberSettings,
}

/// Request for an instance to join an existing group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub group_name: Uuid,
    /// Member contacted to enter the group
    pub seed: InstanceAddress,
    pub member: MemberSettings,
    pub recovery_user: String,
    pub recovery_method: RecoveryMethod,
}

/// Replication user created for recovery or channels.
#[derive(Clone, Serialize, Deserialize)]
pub struct ReplicationAccount {
    pub user: String,
    pub password: String,
    pub host: String,
}

impl fmt::Debug for ReplicationAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationAccount")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .finish()
    }
}

impl ReplicationAccount {
    /// Account named after the server ID with a random 32 character password.
    pub fn generate(prefix: &str, server_id: u32) -> Self {
        let password: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        Self {
            user: format!("{}{}", prefix, server_id),
            password,
            host: "%".to_string(),
        }
    }
}

/// Asynchronous replication channel definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub name: String,
    pub source: InstanceAddress,
    pub user: String,
}

/// Observed state of a replication channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub name: String,
    pub source: Option<InstanceAddress>,
    pub running: bool,
    /// Applier delay behind the source, when known
    pub lag_ms: Option<u64>,
    pub last_error: Option<String>,
}

/// Administrative commands a managed instance accepts.
///
/// Every call may fail with `AdminError::Connection` when the instance is
/// unreachable; transient variants mark instances that are still starting.
#[async_trait]
pub trait InstanceAdmin: Send + Sync {
    /// Version, identity, configuration and replication position.
    async fn fetch_facts(&self, address: &InstanceAddress) -> Result<InstanceFacts>;

    /// Group view seen by the instance, `None` when it is standalone.
    async fn group_view(&self, address: &InstanceAddress) -> Result<Option<GroupView>>;

    /// Starts a new group with the instance as its only member.
    async fn bootstrap_group(&self, address: &InstanceAddress, settings: &GroupSettings)
        -> Result<()>;

    /// Starts group replication on the instance against an existing group.
    async fn join_group(&self, address: &InstanceAddress, request: &JoinRequest) -> Result<()>;

    /// Stops group replication on the instance.
    async fn leave_group(&self, address: &InstanceAddress) -> Result<()>;

    /// Changes the communication protocol of the group the instance belongs to.
    async fn set_protocol_version(&self, address: &InstanceAddress, version: &Version)
        -> Result<()>;

    /// Fences or unfences every member of the instance's group against writes.
    async fn set_group_fenced(&self, address: &InstanceAddress, fenced: bool) -> Result<()>;

    async fn set_super_read_only(&self, address: &InstanceAddress, enabled: bool) -> Result<()>;

    async fn create_account(
        &self,
        address: &InstanceAddress,
        account: &ReplicationAccount,
    ) -> Result<()>;

    async fn drop_account(&self, address: &InstanceAddress, user: &str) -> Result<()>;

    /// Configures and starts an asynchronous channel on the instance.
    async fn start_channel(&self, address: &InstanceAddress, spec: &ChannelSpec) -> Result<()>;

    /// Stops and removes a channel. Missing channels are not an error.
    async fn stop_channel(&self, address: &InstanceAddress, channel: &str) -> Result<()>;

    async fn channel_status(
        &self,
        address: &InstanceAddress,
        channel: &str,
    ) -> Result<Option<ChannelStatus>>;

    /// Metadata schema stored on the instance.
    async fn metadata_store(&self, address: &InstanceAddress) -> Result<Arc<dyn KvStore>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(n: u8, role: MemberRole, state: GroupMemberState) -> GroupMember {
        GroupMember {
            server_uuid: Uuid::from_bytes([n; 16]),
            address: InstanceAddress::new(format!("db{}", n), 3306),
            role,
            state,
            version: Version::new(8, 0, n as u32 + 20),
            local_address: None,
        }
    }

    fn view(members: Vec<GroupMember>) -> GroupView {
        GroupView {
            group_name: Uuid::nil(),
            view_id: 1,
            mode: TopologyMode::SinglePrimary,
            protocol_version: Version::new(8, 0, 16),
            members,
        }
    }

    #[test]
    fn test_primary_must_be_online() {
        let v = view(vec![
            member(1, MemberRole::Primary, GroupMemberState::Unreachable),
            member(2, MemberRole::Secondary, GroupMemberState::Online),
        ]);
        assert!(v.primary().is_none());
        assert!(!v.has_quorum());
    }

    #[test]
    fn test_quorum_majority() {
        let v = view(vec![
            member(1, MemberRole::Primary, GroupMemberState::Online),
            member(2, MemberRole::Secondary, GroupMemberState::Online),
            member(3, MemberRole::Secondary, GroupMemberState::Unreachable),
        ]);
        assert!(v.has_quorum());
        assert_eq!(v.lowest_version(), Some(Version::new(8, 0, 21)));
    }

    #[test]
    fn test_generated_account() {
        let account = ReplicationAccount::generate("rec_", 42);
        assert_eq!(account.user, "rec_42");
        assert_eq!(account.password.len(), 32);
        assert!(!format!("{:?}", account).contains(&account.password));
    }

    #[test]
    fn test_reported_host_falls_back_to_hostname() {
        let mut facts = InstanceFacts {
            address: InstanceAddress::new("db1", 3306),
            server_id: 1,
            server_uuid: Uuid::nil(),
            version: Version::new(8, 0, 30),
            hostname: "db1.internal".to_string(),
            report_host: None,
            super_read_only: false,
            gtid_executed: GtidSet::new(),
            variables: BTreeMap::new(),
        };
        assert_eq!(facts.reported_host(), "db1.internal");
        facts.report_host = Some("db1.example.com".to_string());
        assert_eq!(facts.reported_host(), "db1.example.com");
    }
}
