//! Runbooks: a simulated fleet plus a scripted sequence of operations.
//!
//! ```toml
//! [[instances]]
//! address = "db1:3306"
//! server_id = 1
//!
//! [[steps]]
//! op = "create_cluster"
//! target = "db1:3306"
//! name = "dev"
//!
//! [[steps]]
//! op = "add_instance"
//! cluster = "dev"
//! instance = "db2:3306"
//! expect_error = "duplicate-identity"
//! ```
//!
//! Every step opens its own session on `target` (the first declared
//! instance by default). Sessions share one lock registry.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clusteradm_meta::InstanceAddress;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::clusterset::ClusterSetManager;
use crate::config::AdminConfig;
use crate::coordinator::MembershipCoordinator;
use crate::error::{AdminError, Result};
use crate::locks::LockRegistry;
use crate::options::{
    validate_name, AddInstanceOptions, CreateClusterOptions, CreateReplicaClusterOptions,
    DissolveOptions, DropMetadataSchemaOptions, ForcePrimaryClusterOptions, RejoinInstanceOptions,
    RemoveClusterOptions, RemoveInstanceOptions, ReplicaSetAddOptions, ReplicaSetRemoveOptions,
    RescanOptions, SessionOptions, StatusOptions, Validate,
};
use crate::replicaset::ReplicaSetManager;
use crate::session::ManagementSession;
use crate::sim::{Fault, SimFleet, SimInstanceSpec};
use crate::status::StatusReporter;

/// One scripted action.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    CreateCluster {
        name: String,
        #[serde(default)]
        options: CreateClusterOptions,
    },
    AddInstance {
        cluster: String,
        instance: String,
        #[serde(default)]
        options: AddInstanceOptions,
    },
    RemoveInstance {
        cluster: String,
        instance: String,
        #[serde(default)]
        options: RemoveInstanceOptions,
    },
    RejoinInstance {
        cluster: String,
        instance: String,
        #[serde(default)]
        options: RejoinInstanceOptions,
    },
    Dissolve {
        cluster: String,
        #[serde(default)]
        options: DissolveOptions,
    },
    Rescan {
        cluster: String,
        #[serde(default)]
        options: RescanOptions,
    },
    Status {
        cluster: String,
        #[serde(default)]
        options: StatusOptions,
    },
    Describe {
        cluster: String,
    },
    Options {
        cluster: String,
    },
    DropMetadataSchema {
        #[serde(default)]
        options: DropMetadataSchemaOptions,
    },
    UpgradeMetadata,
    CreateReplicaSet {
        name: String,
    },
    ReplicaSetAddInstance {
        replica_set: String,
        instance: String,
        #[serde(default)]
        options: ReplicaSetAddOptions,
    },
    ReplicaSetRemoveInstance {
        replica_set: String,
        instance: String,
        #[serde(default)]
        options: ReplicaSetRemoveOptions,
    },
    SetPrimaryInstance {
        replica_set: String,
        instance: String,
    },
    ForcePrimaryInstance {
        replica_set: String,
        instance: String,
    },
    ReplicaSetStatus {
        replica_set: String,
    },
    CreateClusterSet {
        cluster: String,
        domain: String,
    },
    CreateReplicaCluster {
        domain: String,
        name: String,
        seed: String,
        #[serde(default)]
        options: CreateReplicaClusterOptions,
    },
    RemoveCluster {
        domain: String,
        cluster: String,
        #[serde(default)]
        options: RemoveClusterOptions,
    },
    SetPrimaryCluster {
        domain: String,
        cluster: String,
    },
    ForcePrimaryCluster {
        domain: String,
        cluster: String,
        #[serde(default)]
        options: ForcePrimaryClusterOptions,
    },
    ClusterSetStatus {
        domain: String,
    },
    DescribeClusterSet {
        domain: String,
    },
    // Fleet manipulation, no session involved.
    Inject {
        instance: String,
        fault: Fault,
    },
    SetReachable {
        instance: String,
        reachable: bool,
    },
    Crash {
        instance: String,
    },
    Restart {
        instance: String,
    },
    Expel {
        instance: String,
    },
    WriteTransactions {
        instance: String,
        count: u64,
    },
    FinishRecovery {
        instance: String,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::CreateCluster { .. } => "create_cluster",
            Operation::AddInstance { .. } => "add_instance",
            Operation::RemoveInstance { .. } => "remove_instance",
            Operation::RejoinInstance { .. } => "rejoin_instance",
            Operation::Dissolve { .. } => "dissolve",
            Operation::Rescan { .. } => "rescan",
            Operation::Status { .. } => "status",
            Operation::Describe { .. } => "describe",
            Operation::Options { .. } => "options",
            Operation::DropMetadataSchema { .. } => "drop_metadata_schema",
            Operation::UpgradeMetadata => "upgrade_metadata",
            Operation::CreateReplicaSet { .. } => "create_replica_set",
            Operation::ReplicaSetAddInstance { .. } => "replica_set_add_instance",
            Operation::ReplicaSetRemoveInstance { .. } => "replica_set_remove_instance",
            Operation::SetPrimaryInstance { .. } => "set_primary_instance",
            Operation::ForcePrimaryInstance { .. } => "force_primary_instance",
            Operation::ReplicaSetStatus { .. } => "replica_set_status",
            Operation::CreateClusterSet { .. } => "create_cluster_set",
            Operation::CreateReplicaCluster { .. } => "create_replica_cluster",
            Operation::RemoveCluster { .. } => "remove_cluster",
            Operation::SetPrimaryCluster { .. } => "set_primary_cluster",
            Operation::ForcePrimaryCluster { .. } => "force_primary_cluster",
            Operation::ClusterSetStatus { .. } => "cluster_set_status",
            Operation::DescribeClusterSet { .. } => "describe_cluster_set",
            Operation::Inject { .. } => "inject",
            Operation::SetReachable { .. } => "set_reachable",
            Operation::Crash { .. } => "crash",
            Operation::Restart { .. } => "restart",
            Operation::Expel { .. } => "expel",
            Operation::WriteTransactions { .. } => "write_transactions",
            Operation::FinishRecovery { .. } => "finish_recovery",
        }
    }

    /// Instance addresses the operation names.
    fn addresses(&self) -> Vec<&str> {
        match self {
            Operation::AddInstance { instance, .. }
            | Operation::RemoveInstance { instance, .. }
            | Operation::RejoinInstance { instance, .. }
            | Operation::ReplicaSetAddInstance { instance, .. }
            | Operation::ReplicaSetRemoveInstance { instance, .. }
            | Operation::SetPrimaryInstance { instance, .. }
            | Operation::ForcePrimaryInstance { instance, .. }
            | Operation::Inject { instance, .. }
            | Operation::SetReachable { instance, .. }
            | Operation::Crash { instance }
            | Operation::Restart { instance }
            | Operation::Expel { instance }
            | Operation::WriteTransactions { instance, .. }
            | Operation::FinishRecovery { instance } => vec![instance.as_str()],
            Operation::CreateReplicaCluster { seed, .. } => vec![seed.as_str()],
            _ => Vec::new(),
        }
    }

    /// Option and name checks that need no fleet.
    fn validate(&self) -> Result<()> {
        match self {
            Operation::CreateCluster { name, options } => {
                validate_name("cluster", name)?;
                options.validate()
            }
            Operation::AddInstance { options, .. } => options.validate(),
            Operation::RemoveInstance { options, .. } => options.validate(),
            Operation::RejoinInstance { options, .. } => options.validate(),
            Operation::Dissolve { options, .. } => options.validate(),
            Operation::Rescan { options, .. } => options.validate(),
            Operation::Status { options, .. } => options.validate(),
            Operation::DropMetadataSchema { options } => options.validate(),
            Operation::CreateReplicaSet { name } => validate_name("replica set", name),
            Operation::ReplicaSetAddInstance { options, .. } => options.validate(),
            Operation::ReplicaSetRemoveInstance { options, .. } => options.validate(),
            Operation::CreateClusterSet { domain, .. } => validate_name("cluster set", domain),
            Operation::CreateReplicaCluster { name, options, .. } => {
                validate_name("cluster", name)?;
                options.validate()
            }
            Operation::RemoveCluster { options, .. } => options.validate(),
            Operation::ForcePrimaryCluster { options, .. } => options.validate(),
            _ => Ok(()),
        }
    }

    fn is_fleet_action(&self) -> bool {
        matches!(
            self,
            Operation::Inject { .. }
                | Operation::SetReachable { .. }
                | Operation::Crash { .. }
                | Operation::Restart { .. }
                | Operation::Expel { .. }
                | Operation::WriteTransactions { .. }
                | Operation::FinishRecovery { .. }
        )
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Step {
    /// Session target, the first declared instance when absent
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub session: SessionOptions,
    /// Error code the step must fail with
    #[serde(default)]
    pub expect_error: Option<String>,
    #[serde(flatten)]
    pub op: Operation,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Runbook {
    #[serde(default = "AdminConfig::fast")]
    pub config: AdminConfig,
    /// Continue after a failed step
    #[serde(default)]
    pub keep_going: bool,
    pub instances: Vec<SimInstanceSpec>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Ok,
    ExpectedError,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct StepError {
    pub code: String,
    pub message: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct StepOutcome {
    pub index: usize,
    pub op: &'static str,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunbookReport {
    pub passed: bool,
    pub steps: Vec<StepOutcome>,
}

impl RunbookReport {
    pub fn failed(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .count()
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| AdminError::Metadata(e.into()))
}

fn address(raw: &str) -> Result<InstanceAddress> {
    raw.parse().map_err(AdminError::from)
}

impl Runbook {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading runbook {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported runbook file extension: {}", ext),
        }
    }

    /// Problems found without running anything; empty when the runbook is
    /// well formed.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.instances.is_empty() {
            problems.push("no instances declared".to_string());
        }
        let mut declared = BTreeSet::new();
        for spec in &self.instances {
            match spec.address.parse::<InstanceAddress>() {
                Ok(a) => {
                    if !declared.insert(a) {
                        problems.push(format!("instance {} declared twice", spec.address));
                    }
                }
                Err(e) => problems.push(format!("instance {}: {}", spec.address, e)),
            }
        }
        for (i, step) in self.steps.iter().enumerate() {
            let op = step.op.name();
            let mut named: Vec<&str> = step.op.addresses();
            named.extend(step.target.as_deref());
            for raw in named {
                match raw.parse::<InstanceAddress>() {
                    Ok(a) if declared.contains(&a) => {}
                    Ok(_) => problems.push(format!("step {} ({}): unknown instance {}", i, op, raw)),
                    Err(e) => problems.push(format!("step {} ({}): {}", i, op, e)),
                }
            }
            if let Err(e) = step.op.validate() {
                problems.push(format!("step {} ({}): {}", i, op, e));
            }
            if let Err(e) = step.session.validate() {
                problems.push(format!("step {} ({}): {}", i, op, e));
            }
        }
        problems
    }

    /// Provisions the fleet and runs every step in order.
    pub async fn run(&self) -> anyhow::Result<RunbookReport> {
        let problems = self.problems();
        if !problems.is_empty() {
            anyhow::bail!("runbook is invalid: {}", problems.join("; "));
        }
        let fleet = SimFleet::new();
        for spec in &self.instances {
            fleet
                .provision(spec.clone())
                .with_context(|| format!("provisioning {}", spec.address))?;
        }
        let default_target = self
            .instances
            .first()
            .map(|s| s.address.clone())
            .context("no instances declared")?;
        let locks = LockRegistry::new();

        let mut outcomes = Vec::with_capacity(self.steps.len());
        for (index, step) in self.steps.iter().enumerate() {
            let op = step.op.name();
            let target = step.target.as_deref().unwrap_or(&default_target);
            let result = self.execute(&fleet, &locks, target, step).await;
            let outcome = match (result, &step.expect_error) {
                (Ok(value), None) => StepOutcome {
                    index,
                    op,
                    status: StepStatus::Ok,
                    result: Some(value),
                    error: None,
                },
                (Ok(value), Some(expected)) => StepOutcome {
                    index,
                    op,
                    status: StepStatus::Failed,
                    result: Some(value),
                    error: Some(StepError {
                        code: "unexpected-success".to_string(),
                        message: format!("expected error '{}'", expected),
                    }),
                },
                (Err(e), expected) => {
                    let status = if expected.as_deref() == Some(e.code()) {
                        StepStatus::ExpectedError
                    } else {
                        StepStatus::Failed
                    };
                    StepOutcome {
                        index,
                        op,
                        status,
                        result: None,
                        error: Some(StepError {
                            code: e.code().to_string(),
                            message: e.to_string(),
                        }),
                    }
                }
            };
            let failed = outcome.status == StepStatus::Failed;
            if failed {
                warn!(step = index, op, target, "runbook step failed");
            } else {
                info!(step = index, op, target, "runbook step done");
            }
            outcomes.push(outcome);
            if failed && !self.keep_going {
                break;
            }
        }
        let passed = outcomes.len() == self.steps.len()
            && outcomes.iter().all(|o| o.status != StepStatus::Failed);
        Ok(RunbookReport {
            passed,
            steps: outcomes,
        })
    }

    async fn execute(
        &self,
        fleet: &SimFleet,
        locks: &LockRegistry,
        target: &str,
        step: &Step,
    ) -> Result<Value> {
        if step.op.is_fleet_action() {
            return fleet_action(fleet, &step.op);
        }
        let session = ManagementSession::open(
            Arc::new(fleet.clone()),
            address(target)?,
            step.session.clone(),
            self.config.clone(),
        )
        .await?
        .with_locks(locks.clone());
        let coordinator = MembershipCoordinator::new(&session);
        let replica_sets = ReplicaSetManager::new(&session);
        let cluster_sets = ClusterSetManager::new(&session);
        let reporter = StatusReporter::new(&session);

        match &step.op {
            Operation::CreateCluster { name, options } => {
                to_json(&coordinator.create_cluster(name, options).await?)
            }
            Operation::AddInstance {
                cluster,
                instance,
                options,
            } => to_json(
                &coordinator
                    .add_instance(cluster, &address(instance)?, options)
                    .await?,
            ),
            Operation::RemoveInstance {
                cluster,
                instance,
                options,
            } => to_json(
                &coordinator
                    .remove_instance(cluster, &address(instance)?, options)
                    .await?,
            ),
            Operation::RejoinInstance {
                cluster,
                instance,
                options,
            } => to_json(
                &coordinator
                    .rejoin_instance(cluster, &address(instance)?, options)
                    .await?,
            ),
            Operation::Dissolve { cluster, options } => {
                to_json(&coordinator.dissolve(cluster, options).await?)
            }
            Operation::Rescan { cluster, options } => {
                to_json(&coordinator.rescan(cluster, options).await?)
            }
            Operation::Status { cluster, options } => {
                to_json(&reporter.status(cluster, options).await?)
            }
            Operation::Describe { cluster } => to_json(&reporter.describe(cluster).await?),
            Operation::Options { cluster } => to_json(&reporter.options(cluster).await?),
            Operation::DropMetadataSchema { options } => {
                to_json(&session.drop_metadata_schema(options).await?)
            }
            Operation::UpgradeMetadata => to_json(&session.upgrade_metadata().await?),
            Operation::CreateReplicaSet { name } => {
                to_json(&replica_sets.create_replica_set(name).await?)
            }
            Operation::ReplicaSetAddInstance {
                replica_set,
                instance,
                options,
            } => to_json(
                &replica_sets
                    .add_instance(replica_set, &address(instance)?, options)
                    .await?,
            ),
            Operation::ReplicaSetRemoveInstance {
                replica_set,
                instance,
                options,
            } => to_json(
                &replica_sets
                    .remove_instance(replica_set, &address(instance)?, options)
                    .await?,
            ),
            Operation::SetPrimaryInstance {
                replica_set,
                instance,
            } => to_json(
                &replica_sets
                    .set_primary_instance(replica_set, &address(instance)?)
                    .await?,
            ),
            Operation::ForcePrimaryInstance {
                replica_set,
                instance,
            } => to_json(
                &replica_sets
                    .force_primary_instance(replica_set, &address(instance)?)
                    .await?,
            ),
            Operation::ReplicaSetStatus { replica_set } => {
                to_json(&replica_sets.status(replica_set).await?)
            }
            Operation::CreateClusterSet { cluster, domain } => {
                to_json(&cluster_sets.create_cluster_set(cluster, domain).await?)
            }
            Operation::CreateReplicaCluster {
                domain,
                name,
                seed,
                options,
            } => to_json(
                &cluster_sets
                    .create_replica_cluster(domain, name, &address(seed)?, options)
                    .await?,
            ),
            Operation::RemoveCluster {
                domain,
                cluster,
                options,
            } => to_json(&cluster_sets.remove_cluster(domain, cluster, options).await?),
            Operation::SetPrimaryCluster { domain, cluster } => {
                to_json(&cluster_sets.set_primary_cluster(domain, cluster).await?)
            }
            Operation::ForcePrimaryCluster {
                domain,
                cluster,
                options,
            } => to_json(
                &cluster_sets
                    .force_primary_cluster(domain, cluster, options)
                    .await?,
            ),
            Operation::ClusterSetStatus { domain } => to_json(&cluster_sets.status(domain).await?),
            Operation::DescribeClusterSet { domain } => {
                to_json(&cluster_sets.describe(domain).await?)
            }
            other => fleet_action(fleet, other),
        }
    }
}

fn fleet_action(fleet: &SimFleet, op: &Operation) -> Result<Value> {
    match op {
        Operation::Inject { instance, fault } => fleet.inject(&address(instance)?, fault.clone())?,
        Operation::SetReachable {
            instance,
            reachable,
        } => fleet.set_reachable(&address(instance)?, *reachable)?,
        Operation::Crash { instance } => fleet.crash(&address(instance)?)?,
        Operation::Restart { instance } => fleet.restart(&address(instance)?)?,
        Operation::Expel { instance } => fleet.expel(&address(instance)?)?,
        Operation::WriteTransactions { instance, count } => {
            fleet.write_transactions(&address(instance)?, *count)?
        }
        Operation::FinishRecovery { instance } => fleet.finish_recovery(&address(instance)?)?,
        other => {
            return Err(AdminError::InvalidOption(format!(
                "{} is not a fleet action",
                other.name()
            )))
        }
    }
    Ok(Value::Null)
}
