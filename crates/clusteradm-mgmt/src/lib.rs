#![warn(missing_docs)]

//! clusteradm management subsystem: membership coordination for clusters,
//! replica sets and cluster sets, status reporting, runbook CLI

pub mod cli;
pub mod clusterset;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gtid;
pub mod locks;
pub mod options;
pub mod probe;
pub mod replicaset;
pub mod retry;
pub mod rpc;
pub mod runbook;
pub mod saga;
pub mod schema;
pub mod session;
pub mod sim;
pub mod status;
pub mod validator;

pub use clusterset::{ClusterSetHealth, ClusterSetManager, ClusterSetStatus, GlobalStatus};
pub use config::AdminConfig;
pub use coordinator::{MembershipCoordinator, RescanReport};
pub use error::{AdminError, Result};
pub use gtid::GtidSet;
pub use locks::LockRegistry;
pub use options::{SessionOptions, UnreachablePolicy, Validate};
pub use probe::{InstanceProbe, ProbeReport};
pub use replicaset::{ReplicaSetManager, ReplicaSetStatus};
pub use retry::{RetryConfig, RetryExecutor};
pub use rpc::InstanceAdmin;
pub use runbook::{Runbook, RunbookReport};
pub use saga::{Compensation, OperationReport, Saga};
pub use session::ManagementSession;
pub use sim::{Fault, SimFleet, SimInstanceSpec};
pub use status::{ClusterHealth, ClusterStatus, StatusReporter};
pub use validator::{RejectReason, TopologyValidator, Verdict};
