//! Admissibility checks for membership changes.
//!
//! The validator is pure: it looks at metadata, probe reports and live views
//! gathered beforehand and never touches an instance.

use std::fmt;

use clusteradm_meta::{
    ClusterRecord, InstanceAddress, InstanceRecord, MetadataStore, Owner, ReplicaSetRecord,
    Version,
};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{AdminError, Result};
use crate::probe::ProbeReport;
use crate::rpc::{GroupMemberState, GroupView};

/// First release accepting IPv6 group communication addresses.
pub const IPV6_LOCAL_ADDRESS_VERSION: Version = Version::new(8, 0, 14);

/// Why a membership change was refused.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "kebab-case")]
pub enum RejectReason {
    DuplicateServerId {
        server_id: u32,
        holder: InstanceAddress,
    },
    DuplicateServerUuid {
        server_uuid: Uuid,
        holder: InstanceAddress,
    },
    AlreadyMember {
        topology: String,
    },
    MemberOfAnotherCluster {
        owner: String,
    },
    MemberOfAnotherGroup {
        group_name: Uuid,
    },
    IncompatibleProtocol {
        candidate: Version,
        required: Version,
    },
    IncompatibleAddressFamily {
        detail: String,
    },
    Quorum {
        remaining: usize,
        registered: usize,
    },
}

impl RejectReason {
    /// Stable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::DuplicateServerId { .. } => "duplicate-server-id",
            RejectReason::DuplicateServerUuid { .. } => "duplicate-server-uuid",
            RejectReason::AlreadyMember { .. } => "already-member",
            RejectReason::MemberOfAnotherCluster { .. } => "member-of-another-cluster",
            RejectReason::MemberOfAnotherGroup { .. } => "member-of-another-group",
            RejectReason::IncompatibleProtocol { .. } => "incompatible-protocol",
            RejectReason::IncompatibleAddressFamily { .. } => "incompatible-address-family",
            RejectReason::Quorum { .. } => "quorum",
        }
    }

    /// Typed error for a rejected `address`.
    pub fn into_error(self, address: &InstanceAddress) -> AdminError {
        let address = address.to_string();
        match self {
            RejectReason::AlreadyMember { topology } => AdminError::AlreadyMember { address, topology },
            RejectReason::IncompatibleProtocol { .. } | RejectReason::IncompatibleAddressFamily { .. } => {
                AdminError::ProtocolIncompatibility {
                    address,
                    reason: self,
                }
            }
            RejectReason::Quorum { .. } => AdminError::Quorum(format!("removing {}: {}", address, self)),
            _ => AdminError::DuplicateIdentity {
                address,
                reason: self,
            },
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::DuplicateServerId { server_id, holder } => {
                write!(f, "server_id {} is already used by {}", server_id, holder)
            }
            RejectReason::DuplicateServerUuid { server_uuid, holder } => {
                write!(f, "server_uuid {} is already used by {}", server_uuid, holder)
            }
            RejectReason::AlreadyMember { topology } => {
                write!(f, "already a member of {}", topology)
            }
            RejectReason::MemberOfAnotherCluster { owner } => {
                write!(f, "already part of another managed topology ({})", owner)
            }
            RejectReason::MemberOfAnotherGroup { group_name } => {
                write!(f, "already part of another replication group ({})", group_name)
            }
            RejectReason::IncompatibleProtocol { candidate, required } => write!(
                f,
                "version {} cannot join a group requiring {} or a compatible series",
                candidate, required
            ),
            RejectReason::IncompatibleAddressFamily { detail } => f.write_str(detail),
            RejectReason::Quorum {
                remaining,
                registered,
            } => write!(
                f,
                "only {} reachable ONLINE members would remain out of {} registered, no majority",
                remaining, registered
            ),
        }
    }
}

/// Outcome of a validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(RejectReason),
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }

    /// Converts a rejection into the matching error.
    pub fn into_result(self, address: &InstanceAddress) -> Result<()> {
        match self {
            Verdict::Accept => Ok(()),
            Verdict::Reject(reason) => Err(reason.into_error(address)),
        }
    }
}

/// An instance registered anywhere in the metadata store.
#[derive(Clone, Debug)]
pub struct RegisteredInstance {
    pub owner: Owner,
    pub owner_name: String,
    pub instance: InstanceRecord,
}

/// Membership change target: a cluster with its live view, or a replica set.
#[derive(Clone, Copy, Debug)]
pub struct Target<'a> {
    pub owner: Owner,
    pub name: &'a str,
    pub members: &'a [InstanceRecord],
    pub view: Option<&'a GroupView>,
    pub group_name: Option<Uuid>,
}

impl<'a> Target<'a> {
    pub fn cluster(record: &'a ClusterRecord, view: Option<&'a GroupView>) -> Self {
        Self {
            owner: Owner::Cluster(record.id),
            name: &record.name,
            members: &record.instances,
            view,
            group_name: Some(record.group_name),
        }
    }

    pub fn replica_set(record: &'a ReplicaSetRecord) -> Self {
        Self {
            owner: Owner::ReplicaSet(record.id),
            name: &record.name,
            members: &record.instances,
            view: None,
            group_name: None,
        }
    }

    fn label(&self) -> String {
        match self.owner {
            Owner::Cluster(_) => format!("cluster '{}'", self.name),
            Owner::ReplicaSet(_) => format!("replica set '{}'", self.name),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum Mode {
    Addition,
    Rejoin,
}

/// Checks proposed membership changes against every managed topology.
#[derive(Clone, Debug, Default)]
pub struct TopologyValidator {
    registry: Vec<RegisteredInstance>,
}

impl TopologyValidator {
    /// Loads every registered instance from the store.
    pub fn load(store: &MetadataStore) -> Result<Self> {
        let mut registry = Vec::new();
        for cluster in store.clusters()? {
            for instance in &cluster.instances {
                registry.push(RegisteredInstance {
                    owner: Owner::Cluster(cluster.id),
                    owner_name: format!("cluster '{}'", cluster.name),
                    instance: instance.clone(),
                });
            }
        }
        for rs in store.replica_sets()? {
            for instance in &rs.instances {
                registry.push(RegisteredInstance {
                    owner: Owner::ReplicaSet(rs.id),
                    owner_name: format!("replica set '{}'", rs.name),
                    instance: instance.clone(),
                });
            }
        }
        Ok(Self { registry })
    }

    pub fn from_registry(registry: Vec<RegisteredInstance>) -> Self {
        Self { registry }
    }

    /// Adds registrations learned elsewhere, such as the metadata held by
    /// the candidate itself. Entries already known are skipped.
    pub fn extend(&mut self, entries: impl IntoIterator<Item = RegisteredInstance>) {
        for entry in entries {
            let known = self.registry.iter().any(|e| {
                e.owner == entry.owner && e.instance.server_uuid == entry.instance.server_uuid
            });
            if !known {
                self.registry.push(entry);
            }
        }
    }

    /// Checks whether `candidate` may be added to `target`.
    ///
    /// `local_address` is the group communication endpoint the candidate
    /// would use.
    pub fn validate_addition(
        &self,
        target: &Target<'_>,
        candidate: &ProbeReport,
        local_address: Option<&str>,
    ) -> Verdict {
        match self.check(target, candidate, local_address, Mode::Addition) {
            Ok(()) => Verdict::Accept,
            Err(reason) => Verdict::Reject(reason),
        }
    }

    /// Same checks as an addition, except that registration in `target`
    /// itself is expected.
    pub fn validate_rejoin(
        &self,
        target: &Target<'_>,
        candidate: &ProbeReport,
        local_address: Option<&str>,
    ) -> Verdict {
        match self.check(target, candidate, local_address, Mode::Rejoin) {
            Ok(()) => Verdict::Accept,
            Err(reason) => Verdict::Reject(reason),
        }
    }

    /// Rejects removals that leave no strict majority of the registered
    /// members reachable and ONLINE, unless forced.
    pub fn validate_removal(&self, target: &Target<'_>, server_uuid: &Uuid, force: bool) -> Verdict {
        if force {
            return Verdict::Accept;
        }
        let registered = target.members.len();
        let remaining = target
            .view
            .map(|view| {
                view.online()
                    .filter(|m| &m.server_uuid != server_uuid)
                    .filter(|m| target.members.iter().any(|i| i.server_uuid == m.server_uuid))
                    .count()
            })
            .unwrap_or(0);
        if remaining * 2 > registered {
            Verdict::Accept
        } else {
            Verdict::Reject(RejectReason::Quorum {
                remaining,
                registered,
            })
        }
    }

    fn check(
        &self,
        target: &Target<'_>,
        candidate: &ProbeReport,
        local_address: Option<&str>,
        mode: Mode,
    ) -> std::result::Result<(), RejectReason> {
        let facts = &candidate.facts;
        let already = || RejectReason::AlreadyMember {
            topology: target.label(),
        };

        // Registration in the target itself.
        for member in target.members {
            let same_uuid = member.server_uuid == facts.server_uuid;
            let same_address = member.address == facts.address;
            match (same_uuid, same_address, mode) {
                (true, true, Mode::Addition) => return Err(already()),
                (true, false, _) => {
                    return Err(RejectReason::DuplicateServerUuid {
                        server_uuid: facts.server_uuid,
                        holder: member.address.clone(),
                    })
                }
                (false, true, _) => return Err(already()),
                _ => {}
            }
        }

        if mode == Mode::Addition {
            if let Some(view) = target.view {
                if view.member(&facts.server_uuid).is_some() {
                    return Err(already());
                }
            }
        }

        // Registration in any other managed topology.
        for entry in self.registry.iter().filter(|e| e.owner != target.owner) {
            if entry.instance.server_uuid == facts.server_uuid {
                if entry.instance.address == facts.address {
                    return Err(RejectReason::MemberOfAnotherCluster {
                        owner: entry.owner_name.clone(),
                    });
                }
                return Err(RejectReason::DuplicateServerUuid {
                    server_uuid: facts.server_uuid,
                    holder: entry.instance.address.clone(),
                });
            }
        }

        // Live membership of the candidate.
        if let Some(view) = &candidate.view {
            if Some(view.group_name) != target.group_name {
                return Err(RejectReason::MemberOfAnotherGroup {
                    group_name: view.group_name,
                });
            }
            let state = candidate.member_state();
            let active = matches!(
                state,
                Some(GroupMemberState::Online) | Some(GroupMemberState::Recovering)
            );
            if mode == Mode::Addition || active {
                return Err(already());
            }
        }

        // server_id uniqueness across every managed topology; 0 means unknown.
        if facts.server_id != 0 {
            let holder = target
                .members
                .iter()
                .chain(self.registry.iter().map(|e| &e.instance))
                .find(|i| i.server_id == facts.server_id && i.server_uuid != facts.server_uuid);
            if let Some(holder) = holder {
                return Err(RejectReason::DuplicateServerId {
                    server_id: facts.server_id,
                    holder: holder.address.clone(),
                });
            }
        }

        if let Some(view) = target.view {
            let others: Vec<_> = view
                .members
                .iter()
                .filter(|m| m.server_uuid != facts.server_uuid)
                .collect();
            if let Some(lowest) = others.iter().map(|m| m.version).min() {
                if facts.version < view.protocol_version || facts.version.major != lowest.major {
                    return Err(RejectReason::IncompatibleProtocol {
                        candidate: facts.version,
                        required: view.protocol_version.max(lowest),
                    });
                }

                let candidate_v6 = local_address.map(is_ipv6_endpoint).unwrap_or(false);
                if candidate_v6 && lowest < IPV6_LOCAL_ADDRESS_VERSION {
                    return Err(RejectReason::IncompatibleAddressFamily {
                        detail: format!(
                            "IPv6 local address {} needs every member at {} or newer, lowest is {}",
                            local_address.unwrap_or_default(),
                            IPV6_LOCAL_ADDRESS_VERSION,
                            lowest
                        ),
                    });
                }
                let group_v6 = others
                    .iter()
                    .filter_map(|m| m.local_address.as_deref())
                    .any(is_ipv6_endpoint);
                if (group_v6 || candidate_v6) && facts.version < IPV6_LOCAL_ADDRESS_VERSION {
                    return Err(RejectReason::IncompatibleAddressFamily {
                        detail: format!(
                            "the group uses IPv6 local addresses, which {} does not support",
                            facts.version
                        ),
                    });
                }
            }
        }

        Ok(())
    }
}

/// True when a `host:port` endpoint has an IPv6 host.
pub fn is_ipv6_endpoint(endpoint: &str) -> bool {
    endpoint
        .parse::<InstanceAddress>()
        .map(|a| a.is_ipv6())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtid::GtidSet;
    use crate::rpc::{GroupMember, InstanceFacts};
    use clusteradm_meta::{ClusterId, MemberRole, TopologyMode};
    use std::collections::BTreeMap;

    fn uuid(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    fn record(n: u8) -> InstanceRecord {
        InstanceRecord::new(
            InstanceAddress::new(format!("db{}", n), 3306),
            uuid(n),
            n as u32,
            Version::new(8, 0, 30),
        )
    }

    fn cluster(members: &[u8]) -> ClusterRecord {
        ClusterRecord {
            id: ClusterId::generate(),
            name: "dev".to_string(),
            group_name: uuid(200),
            topology_mode: TopologyMode::SinglePrimary,
            instances: members.iter().map(|n| record(*n)).collect(),
            attributes: BTreeMap::new(),
            cluster_set: None,
            created_at: 0,
            generation: 1,
        }
    }

    fn view_of(cluster: &ClusterRecord, online: &[u8]) -> GroupView {
        GroupView {
            group_name: cluster.group_name,
            view_id: 7,
            mode: TopologyMode::SinglePrimary,
            protocol_version: Version::new(8, 0, 16),
            members: cluster
                .instances
                .iter()
                .enumerate()
                .map(|(i, r)| GroupMember {
                    server_uuid: r.server_uuid,
                    address: r.address.clone(),
                    role: if i == 0 { MemberRole::Primary } else { MemberRole::Secondary },
                    state: if online.contains(&(r.server_id as u8)) {
                        GroupMemberState::Online
                    } else {
                        GroupMemberState::Unreachable
                    },
                    version: r.version,
                    local_address: None,
                })
                .collect(),
        }
    }

    fn candidate(n: u8, server_id: u32) -> ProbeReport {
        ProbeReport {
            facts: InstanceFacts {
                address: InstanceAddress::new(format!("db{}", n), 3306),
                server_id,
                server_uuid: uuid(n),
                version: Version::new(8, 0, 30),
                hostname: format!("db{}", n),
                report_host: None,
                super_read_only: true,
                gtid_executed: GtidSet::new(),
                variables: BTreeMap::new(),
            },
            view: None,
            issues: Vec::new(),
        }
    }

    fn reason(verdict: Verdict) -> &'static str {
        match verdict {
            Verdict::Accept => "accept",
            Verdict::Reject(r) => r.code(),
        }
    }

    #[test]
    fn test_clean_candidate_accepted() {
        let c = cluster(&[1]);
        let view = view_of(&c, &[1]);
        let v = TopologyValidator::default();
        assert!(v
            .validate_addition(&Target::cluster(&c, Some(&view)), &candidate(2, 2), None)
            .is_accept());
    }

    #[test]
    fn test_distinct_reasons() {
        let a = cluster(&[1]);
        let b = cluster(&[5]);
        let view = view_of(&a, &[1]);
        let registry = TopologyValidator::load_from(&[&a, &b]);
        let target = Target::cluster(&a, Some(&view));

        assert_eq!(reason(registry.validate_addition(&target, &candidate(1, 1), None)), "already-member");
        assert_eq!(
            reason(registry.validate_addition(&target, &candidate(5, 5), None)),
            "member-of-another-cluster"
        );
        assert_eq!(
            reason(registry.validate_addition(&target, &candidate(3, 1), None)),
            "duplicate-server-id"
        );

        let mut foreign = candidate(4, 4);
        foreign.view = Some(GroupView {
            group_name: uuid(99),
            ..view.clone()
        });
        assert_eq!(
            reason(registry.validate_addition(&target, &foreign, None)),
            "member-of-another-group"
        );

        let mut cloned = candidate(6, 6);
        cloned.facts.server_uuid = uuid(1);
        assert_eq!(
            reason(registry.validate_addition(&target, &cloned, None)),
            "duplicate-server-uuid"
        );
    }

    #[test]
    fn test_protocol_and_address_family() {
        let mut c = cluster(&[1]);
        c.instances[0].version = Version::new(8, 0, 12);
        let mut view = view_of(&c, &[1]);
        view.protocol_version = Version::new(8, 0, 12);
        let v = TopologyValidator::default();
        let target = Target::cluster(&c, Some(&view));

        let mut old = candidate(2, 2);
        old.facts.version = Version::new(5, 7, 30);
        assert_eq!(reason(v.validate_addition(&target, &old, None)), "incompatible-protocol");

        assert_eq!(
            reason(v.validate_addition(&target, &candidate(2, 2), Some("[fd00::2]:33061"))),
            "incompatible-address-family"
        );
        assert!(v
            .validate_addition(&target, &candidate(2, 2), Some("db2:33061"))
            .is_accept());
    }

    #[test]
    fn test_ipv6_group_rejects_old_candidate() {
        let c = cluster(&[1]);
        let mut view = view_of(&c, &[1]);
        view.members[0].local_address = Some("[fd00::1]:33061".to_string());
        view.protocol_version = Version::new(8, 0, 0);
        let target = Target::cluster(&c, Some(&view));
        let mut old = candidate(2, 2);
        old.facts.version = Version::new(8, 0, 13);
        assert_eq!(
            reason(TopologyValidator::default().validate_addition(&target, &old, None)),
            "incompatible-address-family"
        );
    }

    #[test]
    fn test_removal_quorum() {
        let v = TopologyValidator::default();
        let two = cluster(&[1, 2]);
        let view = view_of(&two, &[1, 2]);
        let target = Target::cluster(&two, Some(&view));
        assert_eq!(reason(v.validate_removal(&target, &uuid(2), false)), "quorum");
        assert!(v.validate_removal(&target, &uuid(2), true).is_accept());

        let three = cluster(&[1, 2, 3]);
        let view = view_of(&three, &[1, 2, 3]);
        let target = Target::cluster(&three, Some(&view));
        assert!(v.validate_removal(&target, &uuid(3), false).is_accept());

        let degraded = view_of(&three, &[1, 3]);
        let target = Target::cluster(&three, Some(&degraded));
        assert_eq!(reason(v.validate_removal(&target, &uuid(3), false)), "quorum");
    }

    #[test]
    fn test_rejoin_allows_own_registration() {
        let c = cluster(&[1, 2]);
        let view = view_of(&c, &[1]);
        let target = Target::cluster(&c, Some(&view));
        let v = TopologyValidator::load_from(&[&c]);
        assert!(v.validate_rejoin(&target, &candidate(2, 2), None).is_accept());

        let mut active = candidate(2, 2);
        let mut own = view.clone();
        own.members[1].state = GroupMemberState::Online;
        active.view = Some(own);
        assert_eq!(reason(v.validate_rejoin(&target, &active, None)), "already-member");
    }

    #[test]
    fn test_reason_to_error_mapping() {
        let addr = InstanceAddress::new("db9", 3306);
        let err = RejectReason::MemberOfAnotherGroup { group_name: uuid(1) }.into_error(&addr);
        assert_eq!(err.code(), "duplicate-identity");
        assert_eq!(err.reason_code(), Some("member-of-another-group"));
        let err = RejectReason::IncompatibleProtocol {
            candidate: Version::new(5, 7, 30),
            required: Version::new(8, 0, 16),
        }
        .into_error(&addr);
        assert_eq!(err.code(), "protocol-incompatibility");
        let err = RejectReason::Quorum {
            remaining: 1,
            registered: 2,
        }
        .into_error(&addr);
        assert_eq!(err.code(), "quorum");
    }

    impl TopologyValidator {
        fn load_from(clusters: &[&ClusterRecord]) -> Self {
            let registry = clusters
                .iter()
                .flat_map(|c| {
                    c.instances.iter().map(move |i| RegisteredInstance {
                        owner: Owner::Cluster(c.id),
                        owner_name: format!("cluster '{}'", c.name),
                        instance: i.clone(),
                    })
                })
                .collect();
            Self::from_registry(registry)
        }
    }
}
