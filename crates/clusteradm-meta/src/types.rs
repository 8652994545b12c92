use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier of a managed cluster.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(Uuid);

impl ClusterId {
    /// Creates a fresh random cluster ID
    pub fn generate() -> Self {
        ClusterId(Uuid::new_v4())
    }

    /// Wraps an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        ClusterId(id)
    }

    /// Returns the underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of a managed replica set.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaSetId(Uuid);

impl ReplicaSetId {
    /// Creates a fresh random replica set ID
    pub fn generate() -> Self {
        ReplicaSetId(Uuid::new_v4())
    }

    /// Returns the underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ReplicaSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of a cluster set.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterSetId(Uuid);

impl ClusterSetId {
    /// Creates a fresh random cluster set ID
    pub fn generate() -> Self {
        ClusterSetId(Uuid::new_v4())
    }

    /// Returns the underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ClusterSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network endpoint of a database instance (`host:port`, IPv6 hosts bracketed).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceAddress {
    host: String,
    port: u16,
}

impl InstanceAddress {
    /// Creates an address from its parts
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Host part without brackets
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port part
    pub fn port(&self) -> u16 {
        self.port
    }

    /// True when the host is an IPv6 literal
    pub fn is_ipv6(&self) -> bool {
        self.host.parse::<Ipv6Addr>().is_ok()
    }

    /// True for `localhost` and loopback IP literals
    pub fn is_loopback(&self) -> bool {
        if self.host.eq_ignore_ascii_case("localhost") {
            return true;
        }
        self.host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
    }
}

impl fmt::Display for InstanceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for InstanceAddress {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| MetaError::InvalidAddress(s.to_string()))?;
        let host = match host.strip_prefix('[') {
            Some(inner) => inner
                .strip_suffix(']')
                .ok_or_else(|| MetaError::InvalidAddress(s.to_string()))?,
            None if host.contains(':') => return Err(MetaError::InvalidAddress(s.to_string())),
            None => host,
        };
        if host.is_empty() {
            return Err(MetaError::InvalidAddress(s.to_string()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| MetaError::InvalidAddress(s.to_string()))?;
        if port == 0 {
            return Err(MetaError::InvalidAddress(s.to_string()));
        }
        Ok(InstanceAddress::new(host, port))
    }
}

impl TryFrom<String> for InstanceAddress {
    type Error = MetaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<InstanceAddress> for String {
    fn from(addr: InstanceAddress) -> Self {
        addr.to_string()
    }
}

/// A `major.minor.patch` version, used both for server releases and schema layouts.
///
/// Parsing ignores a trailing build suffix such as `-log` or `-commercial`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    /// Major component
    pub major: u32,
    /// Minor component
    pub minor: u32,
    /// Patch component
    pub patch: u32,
}

impl Version {
    /// Creates a version from its components
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// True when both versions belong to the same `major.minor` series
    pub fn same_series(&self, other: &Version) -> bool {
        self.major == other.major && self.minor == other.minor
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let core = s.split(['-', '+']).next().unwrap_or_default();
        let mut parts = core.split('.');
        let mut next = || -> Result<u32, MetaError> {
            parts
                .next()
                .and_then(|p| p.trim().parse().ok())
                .ok_or_else(|| MetaError::InvalidVersion(s.to_string()))
        };
        let version = Version::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(MetaError::InvalidVersion(s.to_string()));
        }
        Ok(version)
    }
}

impl TryFrom<String> for Version {
    type Error = MetaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}

/// Replication topology mode of a cluster.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TopologyMode {
    /// One writable primary, all others read-only
    #[default]
    SinglePrimary,
    /// Every ONLINE member accepts writes
    MultiPrimary,
}

impl fmt::Display for TopologyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyMode::SinglePrimary => write!(f, "Single-Primary"),
            TopologyMode::MultiPrimary => write!(f, "Multi-Primary"),
        }
    }
}

/// Role of an instance inside its topology.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberRole {
    /// Accepts writes
    Primary,
    /// Replicates from the primary
    Secondary,
    /// Asynchronous read-only follower of a cluster
    ReadReplica,
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberRole::Primary => write!(f, "PRIMARY"),
            MemberRole::Secondary => write!(f, "SECONDARY"),
            MemberRole::ReadReplica => write!(f, "READ_REPLICA"),
        }
    }
}

/// Role of a cluster inside a cluster set.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterRole {
    /// The single writable cluster of the set
    Primary,
    /// Read-only copy fed by the primary cluster
    Replica,
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterRole::Primary => write!(f, "PRIMARY"),
            ClusterRole::Replica => write!(f, "REPLICA"),
        }
    }
}

/// Registered instance of a cluster or replica set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Endpoint used to manage the instance
    pub address: InstanceAddress,
    /// Server UUID, globally unique across managed topologies
    pub server_uuid: Uuid,
    /// Numeric server ID, unique within a topology
    pub server_id: u32,
    /// Human label, defaults to the address
    pub label: String,
    /// Server version observed at registration
    pub version: Version,
    /// Replication account used by the instance for recovery
    pub recovery_account: Option<String>,
}

impl InstanceRecord {
    /// Creates a record labelled with its address
    pub fn new(address: InstanceAddress, server_uuid: Uuid, server_id: u32, version: Version) -> Self {
        Self {
            label: address.to_string(),
            address,
            server_uuid,
            server_id,
            version,
            recovery_account: None,
        }
    }
}

/// Link of a cluster into a cluster set, stored on the cluster record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSetMembership {
    /// Owning cluster set
    pub cluster_set_id: ClusterSetId,
    /// Current role of this cluster
    pub role: ClusterRole,
}

/// Stored definition of a group-replication cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecord {
    /// Cluster identifier
    pub id: ClusterId,
    /// Unique cluster name
    pub name: String,
    /// Replication group identifier all members agree on
    pub group_name: Uuid,
    /// Single or multi primary
    pub topology_mode: TopologyMode,
    /// Registered members in registration order
    pub instances: Vec<InstanceRecord>,
    /// Cluster-wide options as string attributes
    pub attributes: BTreeMap<String, String>,
    /// Cluster set link, if any
    pub cluster_set: Option<ClusterSetMembership>,
    /// Creation time in seconds since the epoch
    pub created_at: u64,
    /// Optimistic concurrency generation, bumped on every update
    pub generation: u64,
}

impl ClusterRecord {
    /// Looks up a member by server UUID
    pub fn instance(&self, server_uuid: &Uuid) -> Option<&InstanceRecord> {
        self.instances.iter().find(|i| &i.server_uuid == server_uuid)
    }

    /// Looks up a member by address
    pub fn instance_by_address(&self, address: &InstanceAddress) -> Option<&InstanceRecord> {
        self.instances.iter().find(|i| &i.address == address)
    }

    /// True if this cluster belongs to a cluster set
    pub fn in_cluster_set(&self) -> bool {
        self.cluster_set.is_some()
    }
}

/// Stored definition of an asynchronous replica set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSetRecord {
    /// Replica set identifier
    pub id: ReplicaSetId,
    /// Unique replica set name
    pub name: String,
    /// Server UUID of the current primary
    pub primary: Uuid,
    /// Registered members including the primary
    pub instances: Vec<InstanceRecord>,
    /// Members fenced off by a forced failover
    pub invalidated: Vec<Uuid>,
    /// Creation time in seconds since the epoch
    pub created_at: u64,
    /// Optimistic concurrency generation
    pub generation: u64,
}

impl ReplicaSetRecord {
    /// Looks up a member by server UUID
    pub fn instance(&self, server_uuid: &Uuid) -> Option<&InstanceRecord> {
        self.instances.iter().find(|i| &i.server_uuid == server_uuid)
    }

    /// Looks up a member by address
    pub fn instance_by_address(&self, address: &InstanceAddress) -> Option<&InstanceRecord> {
        self.instances.iter().find(|i| &i.address == address)
    }

    /// Record of the current primary
    pub fn primary_instance(&self) -> Option<&InstanceRecord> {
        self.instance(&self.primary)
    }
}

/// One cluster inside a cluster set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSetMember {
    /// Member cluster
    pub cluster_id: ClusterId,
    /// Member cluster name
    pub cluster_name: String,
    /// Role in the set
    pub role: ClusterRole,
    /// Inbound replication channel name for replicas
    pub channel: Option<String>,
    /// Set when a forced failover left this cluster behind
    pub invalidated: bool,
}

/// Stored definition of a cluster set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSetRecord {
    /// Cluster set identifier
    pub id: ClusterSetId,
    /// Unique domain name
    pub domain_name: String,
    /// Member clusters
    pub members: Vec<ClusterSetMember>,
    /// Creation time in seconds since the epoch
    pub created_at: u64,
    /// Optimistic concurrency generation
    pub generation: u64,
}

impl ClusterSetRecord {
    /// The member currently holding the primary role
    pub fn primary(&self) -> Option<&ClusterSetMember> {
        self.members.iter().find(|m| m.role == ClusterRole::Primary)
    }

    /// Number of members claiming the primary role; 1 in a consistent record
    pub fn primary_count(&self) -> usize {
        self.members
            .iter()
            .filter(|m| m.role == ClusterRole::Primary)
            .count()
    }

    /// Finds a member by cluster name
    pub fn member_by_name(&self, name: &str) -> Option<&ClusterSetMember> {
        self.members.iter().find(|m| m.cluster_name == name)
    }

    /// Replica members, in registration order
    pub fn replicas(&self) -> impl Iterator<Item = &ClusterSetMember> {
        self.members.iter().filter(|m| m.role == ClusterRole::Replica)
    }
}

/// Topology that owns a managed instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Owner {
    /// Member of a cluster
    Cluster(ClusterId),
    /// Member of a replica set
    ReplicaSet(ReplicaSetId),
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Cluster(id) => write!(f, "cluster {}", id),
            Owner::ReplicaSet(id) => write!(f, "replica set {}", id),
        }
    }
}

/// Errors from the metadata subsystem.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// No metadata schema exists on the instance.
    #[error("metadata schema is not installed")]
    SchemaNotInstalled,

    /// A schema already exists.
    #[error("metadata schema {0} is already installed")]
    SchemaAlreadyInstalled(Version),

    /// The stored layout is not one this build understands.
    #[error("unsupported metadata schema version '{0}'")]
    UnsupportedSchemaVersion(String),

    /// The stored layout must be upgraded before use.
    #[error("metadata schema {found} is outdated, {required} required")]
    SchemaOutdated {
        /// Version found in the store
        found: Version,
        /// Version this build requires
        required: Version,
    },

    /// A topology with this name already exists.
    #[error("a {kind} named '{name}' already exists")]
    DuplicateName {
        /// Kind of topology
        kind: &'static str,
        /// Conflicting name
        name: String,
    },

    /// No cluster with this name or ID.
    #[error("cluster '{0}' not found")]
    ClusterNotFound(String),

    /// No replica set with this name or ID.
    #[error("replica set '{0}' not found")]
    ReplicaSetNotFound(String),

    /// No cluster set with this name or ID.
    #[error("cluster set '{0}' not found")]
    ClusterSetNotFound(String),

    /// The instance is registered in another topology.
    #[error("instance {server_uuid} is already managed by {owner}")]
    InstanceAlreadyManaged {
        /// Server UUID of the instance
        server_uuid: Uuid,
        /// Current owner
        owner: Owner,
    },

    /// The record changed since it was read.
    #[error("{entity} changed concurrently: expected generation {expected}, found {found}")]
    VersionConflict {
        /// Record description
        entity: String,
        /// Generation the caller read
        expected: u64,
        /// Generation currently stored
        found: u64,
    },

    /// The hosting instance rejects writes.
    #[error("metadata store is read-only (super_read_only enabled)")]
    ReadOnly,

    /// Stored data does not decode.
    #[error("corrupt metadata: {0}")]
    Corrupt(String),

    /// Failure in the underlying KV store.
    #[error("kv store error: {0}")]
    KvError(String),

    /// JSON encoding failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed `host:port`.
    #[error("invalid instance address '{0}'")]
    InvalidAddress(String),

    /// Malformed version string.
    #[error("invalid version '{0}'")]
    InvalidVersion(String),
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
