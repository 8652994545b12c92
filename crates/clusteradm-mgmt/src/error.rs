//! Error types for the management subsystem.

use clusteradm_meta::MetaError;
use thiserror::Error;

use crate::probe::ConfigIssue;
use crate::validator::RejectReason;

/// Result alias used across the management crate.
pub type Result<T> = std::result::Result<T, AdminError>;

/// Errors returned by administrative operations.
#[derive(Debug, Error)]
pub enum AdminError {
    /// The instance could not be reached.
    #[error("cannot connect to {address}: {message}")]
    Connection {
        /// Target address
        address: String,
        /// Driver message
        message: String,
        /// True when a retry may succeed (instance still coming up)
        transient: bool,
    },

    /// Fatal configuration problems on an instance.
    #[error("instance {address} has incompatible configuration: {}", describe_issues(.issues))]
    Configuration {
        /// Target address
        address: String,
        /// Fatal issues only; advisory ones are reported as warnings
        issues: Vec<ConfigIssue>,
    },

    /// Server ID or UUID collision, or membership in another topology.
    #[error("instance {address} rejected: {reason}")]
    DuplicateIdentity {
        /// Candidate address
        address: String,
        /// Detailed rejection
        reason: RejectReason,
    },

    /// The instance is already part of the target topology.
    #[error("instance {address} is already a member of {topology}")]
    AlreadyMember {
        /// Instance address
        address: String,
        /// Topology name
        topology: String,
    },

    /// The instance is not part of the target topology.
    #[error("instance {address} does not belong to {topology}")]
    NotMember {
        /// Instance address
        address: String,
        /// Topology name
        topology: String,
    },

    /// The operation would break quorum or needs quorum restored first.
    #[error("quorum error: {0}")]
    Quorum(String),

    /// A mutation was attempted without access to a primary.
    #[error("read-only: {0}")]
    ReadOnly(String),

    /// Version or address-family mismatch with the group.
    #[error("instance {address} is incompatible with the group: {reason}")]
    ProtocolIncompatibility {
        /// Candidate address
        address: String,
        /// Detailed rejection
        reason: RejectReason,
    },

    /// The operation is not valid in the current state.
    #[error("invalid state: {0}")]
    State(String),

    /// The live topology changed since it was probed.
    #[error("topology changed concurrently: {0}")]
    Conflict(String),

    /// A topology with this name already exists.
    #[error("a {kind} named '{name}' already exists")]
    DuplicateName {
        /// Kind of topology
        kind: &'static str,
        /// Conflicting name
        name: String,
    },

    /// An option failed validation.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// An RPC or wait exceeded its deadline.
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout {
        /// What was being waited for
        operation: String,
        /// Deadline in milliseconds
        after_ms: u64,
    },

    /// The operation was cancelled between steps.
    #[error("operation {0} cancelled")]
    Cancelled(String),

    /// Metadata store failure.
    #[error("metadata error: {0}")]
    Metadata(MetaError),

    /// The operation failed and its compensations did not all succeed.
    #[error("{error} (cleanup incomplete: {})", .cleanup_failures.join("; "))]
    DegradedCleanup {
        /// Original failure
        error: Box<AdminError>,
        /// Compensations that failed
        cleanup_failures: Vec<String>,
    },
}

fn describe_issues(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl AdminError {
    /// Stable code for the error class.
    pub fn code(&self) -> &'static str {
        match self {
            AdminError::Connection { .. } => "connection",
            AdminError::Configuration { .. } => "configuration",
            AdminError::DuplicateIdentity { .. } => "duplicate-identity",
            AdminError::AlreadyMember { .. } => "already-member",
            AdminError::NotMember { .. } => "not-member",
            AdminError::Quorum(_) => "quorum",
            AdminError::ReadOnly(_) => "read-only",
            AdminError::ProtocolIncompatibility { .. } => "protocol-incompatibility",
            AdminError::State(_) => "state",
            AdminError::Conflict(_) => "conflict",
            AdminError::DuplicateName { .. } => "duplicate-name",
            AdminError::InvalidOption(_) => "invalid-option",
            AdminError::Timeout { .. } => "timeout",
            AdminError::Cancelled(_) => "cancelled",
            AdminError::Metadata(_) => "metadata",
            AdminError::DegradedCleanup { error, .. } => error.code(),
        }
    }

    /// Validator reason code for rejections, if this is one.
    pub fn reason_code(&self) -> Option<&'static str> {
        match self.root() {
            AdminError::DuplicateIdentity { reason, .. }
            | AdminError::ProtocolIncompatibility { reason, .. } => Some(reason.code()),
            AdminError::AlreadyMember { .. } => Some("already-member"),
            _ => None,
        }
    }

    /// The original error, looking through cleanup wrappers.
    pub fn root(&self) -> &AdminError {
        match self {
            AdminError::DegradedCleanup { error, .. } => error.root(),
            other => other,
        }
    }

    /// True when retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdminError::Connection {
                transient: true,
                ..
            } | AdminError::Timeout { .. }
        )
    }

    /// True when the instance itself could not be reached.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self.root(),
            AdminError::Connection { .. } | AdminError::Timeout { .. }
        )
    }

    /// Attaches failed compensations; a no-op when there are none.
    pub fn with_cleanup_failures(self, failures: Vec<String>) -> Self {
        if failures.is_empty() {
            self
        } else {
            AdminError::DegradedCleanup {
                error: Box::new(self),
                cleanup_failures: failures,
            }
        }
    }

    /// Shorthand for a non-transient connection failure.
    pub fn unreachable(address: impl ToString, message: impl Into<String>) -> Self {
        AdminError::Connection {
            address: address.to_string(),
            message: message.into(),
            transient: false,
        }
    }
}

impl From<MetaError> for AdminError {
    fn from(err: MetaError) -> Self {
        match err {
            MetaError::VersionConflict { .. } => AdminError::Conflict(err.to_string()),
            MetaError::ReadOnly => AdminError::ReadOnly(err.to_string()),
            MetaError::DuplicateName { kind, name } => AdminError::DuplicateName { kind, name },
            MetaError::SchemaNotInstalled
            | MetaError::SchemaOutdated { .. }
            | MetaError::ClusterNotFound(_)
            | MetaError::ReplicaSetNotFound(_)
            | MetaError::ClusterSetNotFound(_) => AdminError::State(err.to_string()),
            MetaError::InvalidAddress(_) | MetaError::InvalidVersion(_) => {
                AdminError::InvalidOption(err.to_string())
            }
            other => AdminError::Metadata(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_conflict_maps_to_conflict() {
        let err: AdminError = MetaError::VersionConflict {
            entity: "cluster 'dev'".to_string(),
            expected: 1,
            found: 2,
        }
        .into();
        assert_eq!(err.code(), "conflict");
    }

    #[test]
    fn test_missing_schema_maps_to_state() {
        let err: AdminError = MetaError::SchemaNotInstalled.into();
        assert_eq!(err.code(), "state");
    }

    #[test]
    fn test_cleanup_failures_wrap_but_keep_code() {
        let err = AdminError::Quorum("no majority".to_string())
            .with_cleanup_failures(vec!["leave db2:3306: unreachable".to_string()]);
        assert_eq!(err.code(), "quorum");
        assert!(matches!(err.root(), AdminError::Quorum(_)));
        assert!(err.to_string().contains("cleanup incomplete"));
    }

    #[test]
    fn test_no_cleanup_failures_is_identity() {
        let err = AdminError::State("x".to_string()).with_cleanup_failures(Vec::new());
        assert!(matches!(err, AdminError::State(_)));
    }

    #[test]
    fn test_transient_classification() {
        let transient = AdminError::Connection {
            address: "db:3306".to_string(),
            message: "starting".to_string(),
            transient: true,
        };
        assert!(transient.is_transient());
        assert!(!AdminError::unreachable("db:3306", "gone").is_transient());
        assert!(AdminError::unreachable("db:3306", "gone").is_unreachable());
    }
}
