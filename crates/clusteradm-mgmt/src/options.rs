//! Typed option sets for every client-facing operation.
//!
//! Options arrive as JSON/TOML dictionaries with camelCase keys. Unknown keys
//! are rejected at the boundary and every value is range-checked by
//! [`Validate::validate`] before an operation touches any instance.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AdminError, Result};

/// Implemented by every option set.
pub trait Validate {
    /// Checks ranges and formats.
    fn validate(&self) -> Result<()>;
}

/// Parses an option dictionary, rejecting unknown keys and invalid values.
pub fn parse_options<T>(value: serde_json::Value) -> Result<T>
where
    T: DeserializeOwned + Validate,
{
    let options: T =
        serde_json::from_value(value).map_err(|e| AdminError::InvalidOption(e.to_string()))?;
    options.validate()?;
    Ok(options)
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Canonical upper-case spelling.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = AdminError;

            fn from_str(s: &str) -> Result<Self> {
                match s.to_ascii_uppercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(AdminError::InvalidOption(format!(
                        "invalid value '{}' for {}, expected one of: {}",
                        s,
                        stringify!($name),
                        [$($text),+].join(", ")
                    ))),
                }
            }
        }
    };
}

/// What a member does after it is expelled or fails to rejoin.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitStateAction {
    /// Shut the server down
    AbortServer,
    /// Stay up with super_read_only
    #[default]
    ReadOnly,
    /// Stay up but refuse client connections
    OfflineMode,
}

string_enum!(ExitStateAction {
    AbortServer => "ABORT_SERVER",
    ReadOnly => "READ_ONLY",
    OfflineMode => "OFFLINE_MODE",
});

/// TLS requirement for group communication.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberSslMode {
    /// Required when the server supports TLS
    #[default]
    Auto,
    /// Plain text
    Disabled,
    /// TLS without certificate verification
    Required,
    /// TLS with CA verification
    VerifyCa,
    /// TLS with CA and host name verification
    VerifyIdentity,
}

string_enum!(MemberSslMode {
    Auto => "AUTO",
    Disabled => "DISABLED",
    Required => "REQUIRED",
    VerifyCa => "VERIFY_CA",
    VerifyIdentity => "VERIFY_IDENTITY",
});

/// Transaction consistency guarantee of the group.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsistencyLevel {
    #[default]
    Eventual,
    BeforeOnPrimaryFailover,
    Before,
    After,
    BeforeAndAfter,
}

string_enum!(ConsistencyLevel {
    Eventual => "EVENTUAL",
    BeforeOnPrimaryFailover => "BEFORE_ON_PRIMARY_FAILOVER",
    Before => "BEFORE",
    After => "AFTER",
    BeforeAndAfter => "BEFORE_AND_AFTER",
});

/// How a joining instance obtains the data it is missing.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryMethod {
    /// Incremental when possible, clone otherwise
    #[default]
    Auto,
    /// Replay binary logs from a donor
    Incremental,
    /// Full physical snapshot from a donor
    Clone,
}

string_enum!(RecoveryMethod {
    Auto => "AUTO",
    Incremental => "INCREMENTAL",
    Clone => "CLONE",
});

/// What `remove_instance` does when the target cannot be reached.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum UnreachablePolicy {
    /// Remove it from metadata anyway and report warnings
    #[default]
    DegradedSuccess,
    /// Fail unless `force` is set
    Reject,
}

const LABEL_MAX_LEN: usize = 256;

fn validate_label(label: &str) -> Result<()> {
    let ok_chars = label
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'));
    if label.is_empty() || label.len() > LABEL_MAX_LEN || !ok_chars {
        return Err(AdminError::InvalidOption(format!(
            "label '{}' must be 1-{} characters of [A-Za-z0-9_.:-]",
            label, LABEL_MAX_LEN
        )));
    }
    Ok(())
}

const NAME_MAX_LEN: usize = 63;

/// Checks a cluster, replica set or cluster set name.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    let ok_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    let starts_ok = name
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !starts_ok || !ok_chars || name.len() > NAME_MAX_LEN {
        return Err(AdminError::InvalidOption(format!(
            "{} name '{}' must start with a letter or '_' and have at most {} characters of [A-Za-z0-9_.-]",
            kind, name, NAME_MAX_LEN
        )));
    }
    Ok(())
}

fn validate_local_address(value: &str) -> Result<()> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| AdminError::InvalidOption(format!("localAddress '{}' needs a port", value)))?;
    let port_ok = port.parse::<u16>().map(|p| p > 0).unwrap_or(false);
    if !port_ok {
        return Err(AdminError::InvalidOption(format!(
            "localAddress '{}' has an invalid port",
            value
        )));
    }
    if host.is_empty() {
        return Err(AdminError::InvalidOption(format!(
            "localAddress '{}' has an empty host",
            value
        )));
    }
    Ok(())
}

fn validate_weight(weight: u8) -> Result<()> {
    if weight > 100 {
        return Err(AdminError::InvalidOption(format!(
            "memberWeight {} must be between 0 and 100",
            weight
        )));
    }
    Ok(())
}

/// Options of `create_cluster`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct CreateClusterOptions {
    /// Every member writable
    pub multi_primary: bool,
    pub member_ssl_mode: MemberSslMode,
    pub exit_state_action: ExitStateAction,
    pub consistency: ConsistencyLevel,
    /// Seconds before a suspected member is expelled (0-3600)
    pub expel_timeout: u32,
    /// Election weight of the seed (0-100)
    pub member_weight: u8,
    /// Automatic rejoin attempts (0-2016)
    pub auto_rejoin_tries: u32,
    /// Group communication endpoint of the seed
    pub local_address: Option<String>,
    /// Explicit group identifier, generated when absent
    pub group_name: Option<Uuid>,
    /// Allow-list for group communication connections
    pub ip_allowlist: Option<String>,
}

impl Default for CreateClusterOptions {
    fn default() -> Self {
        Self {
            multi_primary: false,
            member_ssl_mode: MemberSslMode::Auto,
            exit_state_action: ExitStateAction::ReadOnly,
            consistency: ConsistencyLevel::Eventual,
            expel_timeout: 5,
            member_weight: 50,
            auto_rejoin_tries: 3,
            local_address: None,
            group_name: None,
            ip_allowlist: None,
        }
    }
}

impl Validate for CreateClusterOptions {
    fn validate(&self) -> Result<()> {
        if self.expel_timeout > 3600 {
            return Err(AdminError::InvalidOption(format!(
                "expelTimeout {} must be between 0 and 3600",
                self.expel_timeout
            )));
        }
        if self.auto_rejoin_tries > 2016 {
            return Err(AdminError::InvalidOption(format!(
                "autoRejoinTries {} must be between 0 and 2016",
                self.auto_rejoin_tries
            )));
        }
        validate_weight(self.member_weight)?;
        if let Some(addr) = &self.local_address {
            validate_local_address(addr)?;
        }
        if let Some(list) = &self.ip_allowlist {
            if list.trim().is_empty() {
                return Err(AdminError::InvalidOption(
                    "ipAllowlist cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl CreateClusterOptions {
    /// Cluster-wide settings persisted as metadata attributes.
    pub fn to_attributes(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        attrs.insert("memberSslMode".to_string(), self.member_ssl_mode.to_string());
        attrs.insert("exitStateAction".to_string(), self.exit_state_action.to_string());
        attrs.insert("consistency".to_string(), self.consistency.to_string());
        attrs.insert("expelTimeout".to_string(), self.expel_timeout.to_string());
        attrs.insert("autoRejoinTries".to_string(), self.auto_rejoin_tries.to_string());
        if let Some(list) = &self.ip_allowlist {
            attrs.insert("ipAllowlist".to_string(), list.clone());
        }
        attrs
    }
}

/// Options of `add_instance`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct AddInstanceOptions {
    pub label: Option<String>,
    /// Overrides the cluster-wide action for this member
    pub exit_state_action: Option<ExitStateAction>,
    pub member_weight: Option<u8>,
    pub recovery_method: RecoveryMethod,
    pub local_address: Option<String>,
}

impl Validate for AddInstanceOptions {
    fn validate(&self) -> Result<()> {
        if let Some(label) = &self.label {
            validate_label(label)?;
        }
        if let Some(weight) = self.member_weight {
            validate_weight(weight)?;
        }
        if let Some(addr) = &self.local_address {
            validate_local_address(addr)?;
        }
        Ok(())
    }
}

/// Options of `rejoin_instance`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RejoinInstanceOptions {
    pub recovery_method: RecoveryMethod,
    pub local_address: Option<String>,
}

impl Validate for RejoinInstanceOptions {
    fn validate(&self) -> Result<()> {
        if let Some(addr) = &self.local_address {
            validate_local_address(addr)?;
        }
        Ok(())
    }
}

/// Options of `remove_instance`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RemoveInstanceOptions {
    /// Skip quorum checks and accept unreachable targets
    pub force: bool,
    /// Overrides the configured policy for unreachable targets
    pub unreachable_policy: Option<UnreachablePolicy>,
}

impl Validate for RemoveInstanceOptions {
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Options of `dissolve`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct DissolveOptions {
    /// Dissolve even without group quorum
    pub force: bool,
}

impl Validate for DissolveOptions {
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Options of `rescan`. Without any flag set, rescan only reports.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RescanOptions {
    pub add_instances: bool,
    pub remove_instances: bool,
    pub upgrade_comm_protocol: bool,
    pub update_topology_mode: bool,
}

impl Validate for RescanOptions {
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Options of `status`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct StatusOptions {
    /// Verbosity 0-3
    pub extended: u8,
}

impl Validate for StatusOptions {
    fn validate(&self) -> Result<()> {
        if self.extended > 3 {
            return Err(AdminError::InvalidOption(format!(
                "extended {} must be between 0 and 3",
                self.extended
            )));
        }
        Ok(())
    }
}

/// Options of `drop_metadata_schema`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct DropMetadataSchemaOptions {
    /// Drop even while a healthy cluster uses the schema
    pub force: bool,
    /// Temporarily lift super_read_only on the target
    pub clear_read_only: bool,
}

impl Validate for DropMetadataSchemaOptions {
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Options of `ManagementSession::open`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct SessionOptions {
    /// Read metadata from the primary when it is reachable
    pub connect_to_primary: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_to_primary: true,
        }
    }
}

impl Validate for SessionOptions {
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Options of replica-set `add_instance`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ReplicaSetAddOptions {
    pub label: Option<String>,
    pub recovery_method: RecoveryMethod,
}

impl Validate for ReplicaSetAddOptions {
    fn validate(&self) -> Result<()> {
        if let Some(label) = &self.label {
            validate_label(label)?;
        }
        Ok(())
    }
}

/// Options of replica-set `remove_instance`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ReplicaSetRemoveOptions {
    pub force: bool,
}

impl Validate for ReplicaSetRemoveOptions {
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Options of `create_replica_cluster`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct CreateReplicaClusterOptions {
    pub recovery_method: RecoveryMethod,
    pub member_ssl_mode: MemberSslMode,
    pub exit_state_action: ExitStateAction,
    pub consistency: ConsistencyLevel,
    pub local_address: Option<String>,
}

impl Validate for CreateReplicaClusterOptions {
    fn validate(&self) -> Result<()> {
        if let Some(addr) = &self.local_address {
            validate_local_address(addr)?;
        }
        Ok(())
    }
}

impl CreateReplicaClusterOptions {
    /// Cluster options used to bootstrap the replica cluster.
    pub fn cluster_options(&self) -> CreateClusterOptions {
        CreateClusterOptions {
            member_ssl_mode: self.member_ssl_mode,
            exit_state_action: self.exit_state_action,
            consistency: self.consistency,
            local_address: self.local_address.clone(),
            ..CreateClusterOptions::default()
        }
    }
}

/// Options of `remove_cluster`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RemoveClusterOptions {
    /// Skip the drain wait and tolerate unreachable members
    pub force: bool,
    /// Dissolve the removed cluster afterwards
    pub dissolve: bool,
}

impl Default for RemoveClusterOptions {
    fn default() -> Self {
        Self {
            force: false,
            dissolve: true,
        }
    }
}

impl Validate for RemoveClusterOptions {
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Options of `force_primary_cluster`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ForcePrimaryClusterOptions {
    /// Replica clusters to invalidate instead of repointing
    pub invalidate_replica_clusters: Vec<String>,
}

impl Validate for ForcePrimaryClusterOptions {
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}
