//! Read-only views of a cluster: live status, stored description, options.
//!
//! Nothing here needs a primary. Metadata comes from the session's read
//! source and live state from whichever members answer.

use std::collections::BTreeMap;

use clusteradm_meta::{
    ClusterRecord, ClusterRole, InstanceAddress, InstanceRecord, MemberRole, TopologyMode,
    Version,
};
use futures::future::join_all;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::coordinator::cluster_named;
use crate::error::Result;
use crate::options::{StatusOptions, Validate};
use crate::rpc::{GroupMemberState, GroupView, GR_APPLIER_CHANNEL};
use crate::session::ManagementSession;

/// Availability of a cluster derived from its live view.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterHealth {
    /// Every registered member ONLINE and at least one failure tolerated
    Ok,
    /// Some members are not ONLINE, one failure still tolerated
    OkPartial,
    /// Writable, but the next failure loses quorum
    OkNoTolerance,
    /// The reachable members have no majority
    NoQuorum,
    /// No member answered
    Unreachable,
}

impl ClusterHealth {
    pub fn is_available(&self) -> bool {
        matches!(
            self,
            ClusterHealth::Ok | ClusterHealth::OkPartial | ClusterHealth::OkNoTolerance
        )
    }

    fn describe(&self, online: usize) -> String {
        match self {
            ClusterHealth::Ok => format!(
                "cluster is ONLINE and can tolerate up to {} failure(s)",
                (online - 1) / 2
            ),
            ClusterHealth::OkPartial => format!(
                "cluster is ONLINE and can tolerate up to {} failure(s), some members are not active",
                (online - 1) / 2
            ),
            ClusterHealth::OkNoTolerance => {
                "cluster is NOT tolerant to any failures".to_string()
            }
            ClusterHealth::NoQuorum => {
                "cluster has no quorum as visible from the reachable members".to_string()
            }
            ClusterHealth::Unreachable => "no member of the cluster is reachable".to_string(),
        }
    }
}

/// Health of `record` given the view of its group.
pub fn cluster_health(record: &ClusterRecord, view: Option<&GroupView>) -> ClusterHealth {
    let Some(view) = view else {
        return ClusterHealth::Unreachable;
    };
    let has_writer = match view.mode {
        TopologyMode::SinglePrimary => view.primary().is_some(),
        TopologyMode::MultiPrimary => view.online().next().is_some(),
    };
    if !view.has_quorum() || !has_writer {
        return ClusterHealth::NoQuorum;
    }
    let online = view.online().count();
    if online < 3 {
        ClusterHealth::OkNoTolerance
    } else if online < record.instances.len() {
        ClusterHealth::OkPartial
    } else {
        ClusterHealth::Ok
    }
}

/// Membership status of a registered instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberStatus {
    Online,
    Recovering,
    Unreachable,
    Error,
    Offline,
    /// Registered, reachable, but not part of the group
    Missing,
}

impl From<GroupMemberState> for MemberStatus {
    fn from(state: GroupMemberState) -> Self {
        match state {
            GroupMemberState::Online => MemberStatus::Online,
            GroupMemberState::Recovering => MemberStatus::Recovering,
            GroupMemberState::Unreachable => MemberStatus::Unreachable,
            GroupMemberState::Error => MemberStatus::Error,
            GroupMemberState::Offline => MemberStatus::Offline,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct MemberReport {
    pub address: InstanceAddress,
    pub label: String,
    pub role: Option<MemberRole>,
    /// `R/W` or `R/O`, when the member is in the group
    pub mode: Option<&'static str>,
    pub status: MemberStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applier_lag_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transactions: Option<u64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ClusterStatus {
    pub cluster_name: String,
    pub topology_mode: TopologyMode,
    pub status: ClusterHealth,
    pub status_text: String,
    pub primary: Option<InstanceAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_set_role: Option<ClusterRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<Version>,
    pub members: Vec<MemberReport>,
    /// Live members metadata does not know about
    pub unmanaged: Vec<InstanceAddress>,
}

impl ClusterStatus {
    pub fn member(&self, address: &InstanceAddress) -> Option<&MemberReport> {
        self.members.iter().find(|m| &m.address == address)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct InstanceDescription {
    pub address: InstanceAddress,
    pub label: String,
    pub server_uuid: Uuid,
    pub server_id: u32,
    pub version: Version,
}

impl From<&InstanceRecord> for InstanceDescription {
    fn from(i: &InstanceRecord) -> Self {
        Self {
            address: i.address.clone(),
            label: i.label.clone(),
            server_uuid: i.server_uuid,
            server_id: i.server_id,
            version: i.version,
        }
    }
}

/// Stored definition of a cluster.
#[derive(Clone, Debug, Serialize)]
pub struct ClusterDescription {
    pub cluster_name: String,
    pub topology_mode: TopologyMode,
    pub group_name: Uuid,
    pub cluster_set_role: Option<ClusterRole>,
    pub instances: Vec<InstanceDescription>,
}

#[derive(Clone, Debug, Serialize)]
pub struct MemberOptions {
    pub address: InstanceAddress,
    /// Live `group_replication_*` settings, empty when unreachable
    pub settings: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ClusterOptions {
    pub cluster_name: String,
    /// Cluster-wide options stored in metadata
    pub attributes: BTreeMap<String, String>,
    pub members: Vec<MemberOptions>,
}

/// Read-only reporting through one session.
pub struct StatusReporter<'a> {
    session: &'a ManagementSession,
}

impl<'a> StatusReporter<'a> {
    pub fn new(session: &'a ManagementSession) -> Self {
        Self { session }
    }

    /// Metadata composed with the live group.
    pub async fn status(&self, name: &str, options: &StatusOptions) -> Result<ClusterStatus> {
        options.validate()?;
        let store = self.session.read_metadata().await?;
        let record = cluster_named(&store, name)?;
        let view = self.session.cluster_view(&record).await?;
        let health = cluster_health(&record, view.as_ref());
        let online = view.as_ref().map(|v| v.online().count()).unwrap_or(0);

        let members = join_all(
            record
                .instances
                .iter()
                .map(|i| self.member_report(i, view.as_ref(), options.extended)),
        )
        .await;
        let unmanaged = view
            .as_ref()
            .map(|v| {
                v.members
                    .iter()
                    .filter(|m| record.instance(&m.server_uuid).is_none())
                    .map(|m| m.address.clone())
                    .collect()
            })
            .unwrap_or_default();
        debug!(cluster = name, status = ?health, "status composed");

        let extended = options.extended >= 1;
        Ok(ClusterStatus {
            cluster_name: record.name.clone(),
            topology_mode: record.topology_mode,
            status: health,
            status_text: health.describe(online.max(1)),
            primary: view
                .as_ref()
                .and_then(|v| v.primary())
                .map(|p| p.address.clone()),
            cluster_set_role: record.cluster_set.as_ref().map(|c| c.role),
            group_name: extended.then_some(record.group_name),
            protocol_version: if extended {
                view.as_ref().map(|v| v.protocol_version)
            } else {
                None
            },
            members,
            unmanaged,
        })
    }

    async fn member_report(
        &self,
        instance: &InstanceRecord,
        view: Option<&GroupView>,
        extended: u8,
    ) -> MemberReport {
        let mut report = MemberReport {
            address: instance.address.clone(),
            label: instance.label.clone(),
            role: None,
            mode: None,
            status: MemberStatus::Missing,
            version: None,
            applier_lag_ms: None,
            recovery_account: (extended >= 3)
                .then(|| instance.recovery_account.clone())
                .flatten(),
            transactions: None,
        };

        if let Some(member) = view.and_then(|v| v.member(&instance.server_uuid)) {
            report.role = Some(member.role);
            report.status = member.state.into();
            if member.state == GroupMemberState::Online {
                let writable = member.role == MemberRole::Primary;
                report.mode = Some(if writable { "R/W" } else { "R/O" });
            }
            if extended >= 1 {
                report.version = Some(member.version);
            }
        }

        if report.status == MemberStatus::Unreachable {
            return report;
        }
        let facts = match self.session.probe().facts(&instance.address).await {
            Ok(facts) => facts,
            Err(_) => {
                report.status = MemberStatus::Unreachable;
                report.mode = None;
                return report;
            }
        };
        if report.role.is_none() {
            // Not in the healthy view; an expelled member still reports ERROR.
            let own = self
                .session
                .probe()
                .view(&instance.address)
                .await
                .ok()
                .flatten()
                .and_then(|v| v.member(&instance.server_uuid).map(|m| m.state));
            if own == Some(GroupMemberState::Error) {
                report.status = MemberStatus::Error;
            }
            if extended >= 1 {
                report.version = Some(facts.version);
            }
        }
        if extended >= 2 && report.status == MemberStatus::Online {
            let admin = self.session.admin();
            let address = &instance.address;
            report.applier_lag_ms = self
                .session
                .retry()
                .run("channel status", move || {
                    admin.channel_status(address, GR_APPLIER_CHANNEL)
                })
                .await
                .ok()
                .flatten()
                .and_then(|c| c.lag_ms);
        }
        if extended >= 3 {
            report.transactions = Some(facts.gtid_executed.count());
        }
        report
    }

    /// Stored definition only; no instance is contacted beyond the read source.
    pub async fn describe(&self, name: &str) -> Result<ClusterDescription> {
        let store = self.session.read_metadata().await?;
        let record = cluster_named(&store, name)?;
        Ok(ClusterDescription {
            cluster_name: record.name.clone(),
            topology_mode: record.topology_mode,
            group_name: record.group_name,
            cluster_set_role: record.cluster_set.as_ref().map(|c| c.role),
            instances: record.instances.iter().map(InstanceDescription::from).collect(),
        })
    }

    /// Stored cluster options plus the live group settings of every member.
    pub async fn options(&self, name: &str) -> Result<ClusterOptions> {
        let store = self.session.read_metadata().await?;
        let record = cluster_named(&store, name)?;
        let facts = join_all(
            record
                .instances
                .iter()
                .map(|i| self.session.probe().facts(&i.address)),
        )
        .await;
        let members = record
            .instances
            .iter()
            .zip(facts)
            .map(|(instance, facts)| match facts {
                Ok(facts) => MemberOptions {
                    address: instance.address.clone(),
                    settings: facts
                        .variables
                        .into_iter()
                        .filter(|(k, _)| k.starts_with("group_replication_"))
                        .collect(),
                    error: None,
                },
                Err(e) => MemberOptions {
                    address: instance.address.clone(),
                    settings: BTreeMap::new(),
                    error: Some(e.to_string()),
                },
            })
            .collect();
        Ok(ClusterOptions {
            cluster_name: record.name,
            attributes: record.attributes,
            members,
        })
    }
}
