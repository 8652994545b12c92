//! Metadata schema lifecycle: explicit drop and layout upgrade.

use clusteradm_meta::{migrate, MigrationReport};
use tracing::{debug, info};

use crate::error::{AdminError, Result};
use crate::options::{DropMetadataSchemaOptions, Validate};
use crate::saga::{Compensation, OperationReport};
use crate::session::ManagementSession;

const SCHEMA_LOCK: &str = "metadata-schema";

impl ManagementSession {
    /// Drops the metadata schema held by the session target.
    ///
    /// Without `force` the drop is refused while a registered cluster is
    /// still healthy or a replica set primary still accepts writes. A `super_read_only` target is refused unless
    /// `clear_read_only` is set, in which case read-only is lifted for the
    /// drop and restored afterwards, also when the drop fails.
    pub async fn drop_metadata_schema(
        &self,
        options: &DropMetadataSchemaOptions,
    ) -> Result<OperationReport> {
        options.validate()?;
        let _guard = self.locks().acquire(SCHEMA_LOCK).await;
        let target = self.target().clone();

        let store = self.metadata_at(&target).await?;
        if !store.is_installed()? {
            return Err(AdminError::State(format!(
                "{} holds no metadata schema",
                target
            )));
        }

        if !options.force {
            // An outdated layout cannot be read; only a force drop removes it.
            let clusters = store.clusters()?;
            for cluster in &clusters {
                let view = self.cluster_view(cluster).await?;
                if view.map(|v| v.primary().is_some() && v.has_quorum()).unwrap_or(false) {
                    return Err(AdminError::State(format!(
                        "cluster '{}' is still ONLINE and uses this metadata, use force to drop it anyway",
                        cluster.name
                    )));
                }
            }
            for replica_set in store.replica_sets()? {
                let primary = match replica_set.primary_instance() {
                    Some(primary) => primary.address.clone(),
                    None => continue,
                };
                match self.probe().facts(&primary).await {
                    Ok(facts) if !facts.super_read_only => {
                        return Err(AdminError::State(format!(
                            "replica set '{}' still uses this metadata through its writable primary {}, use force to drop it anyway",
                            replica_set.name, primary
                        )));
                    }
                    Ok(_) => {}
                    Err(e) if e.is_unreachable() => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let facts = self.probe().facts(&target).await?;
        if facts.super_read_only && !options.clear_read_only {
            return Err(AdminError::ReadOnly(format!(
                "{} is running with super_read_only, set clear_read_only to drop the schema",
                target
            )));
        }

        let admin = self.admin();
        let retry = self.retry();
        let mut saga = self.saga("drop_metadata_schema", target.to_string());
        let result = async {
            if facts.super_read_only {
                saga.checkpoint("disable super_read_only")?;
                let address = &target;
                retry
                    .run("set super_read_only", move || {
                        admin.set_super_read_only(address, false)
                    })
                    .await?;
                saga.record(Compensation::SetSuperReadOnly {
                    address: target.clone(),
                    enabled: true,
                });
            }
            saga.checkpoint("drop schema")?;
            let keys = store.drop_schema()?;
            debug!(address = %target, keys, "schema keys removed");
            if facts.super_read_only {
                saga.checkpoint("restore super_read_only")?;
                let address = &target;
                retry
                    .run("set super_read_only", move || {
                        admin.set_super_read_only(address, true)
                    })
                    .await?;
            }
            Ok::<(), AdminError>(())
        }
        .await;

        match result {
            Ok(()) => {
                info!(address = %target, forced = options.force, "metadata schema dropped");
                Ok(saga.commit())
            }
            Err(e) => Err(saga.abort(e).await),
        }
    }

    /// Upgrades the metadata layout through the writable primary.
    pub async fn upgrade_metadata(&self) -> Result<MigrationReport> {
        let _guard = self.locks().acquire(SCHEMA_LOCK).await;
        let primary = self.require_primary().await?;
        let store = self.metadata_at(&primary).await?;
        let report = migrate(&store)?;
        if report.upgraded {
            info!(
                address = %primary,
                from = %report.from,
                to = %report.to,
                clusters = report.clusters,
                "metadata upgraded"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdminConfig;
    use crate::coordinator::MembershipCoordinator;
    use crate::options::{CreateClusterOptions, ReplicaSetAddOptions, SessionOptions};
    use crate::replicaset::ReplicaSetManager;
    use crate::rpc::InstanceAdmin;
    use crate::sim::SimFleet;
    use clusteradm_meta::migration::legacy::{
        LegacyCluster, LegacyInstance, LegacyReplicaSet, LegacySnapshot,
    };
    use clusteradm_meta::{InstanceAddress, CURRENT_SCHEMA_VERSION};
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

    fn force() -> DropMetadataSchemaOptions {
        DropMetadataSchemaOptions {
            force: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_drop_without_schema_is_state_error() {
        let fleet = SimFleet::new();
        let a = fleet.provision_default("db1:3306", 1).unwrap();
        let s = session(&fleet, &a).await;
        let err = s.drop_metadata_schema(&force()).await.unwrap_err();
        assert_eq!(err.code(), "state");
    }

    #[tokio::test]
    async fn test_drop_refused_while_cluster_is_healthy() {
        let fleet = SimFleet::new();
        let a = fleet.provision_default("db1:3306", 1).unwrap();
        let s = session(&fleet, &a).await;
        MembershipCoordinator::new(&s)
            .create_cluster("dev", &CreateClusterOptions::default())
            .await
            .unwrap();
        let err = s
            .drop_metadata_schema(&DropMetadataSchemaOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "state");

        s.drop_metadata_schema(&force()).await.unwrap();
        let err = s.drop_metadata_schema(&force()).await.unwrap_err();
        assert_eq!(err.code(), "state");
    }

    #[tokio::test]
    async fn test_drop_refused_while_replica_set_primary_is_writable() {
        let fleet = SimFleet::new();
        let a = fleet.provision_default("db1:3306", 1).unwrap();
        let b = fleet.provision_default("db2:3306", 2).unwrap();
        let s = session(&fleet, &a).await;
        let rs = ReplicaSetManager::new(&s);
        rs.create_replica_set("rs").await.unwrap();
        rs.add_instance("rs", &b, &ReplicaSetAddOptions::default())
            .await
            .unwrap();

        let keep = DropMetadataSchemaOptions {
            force: false,
            clear_read_only: true,
        };
        let err = s.drop_metadata_schema(&keep).await.unwrap_err();
        assert_eq!(err.code(), "state");
        assert!(rs.status("rs").await.is_ok());

        // A fenced primary no longer serves the replica set.
        fleet.set_super_read_only(&a, true).await.unwrap();
        s.drop_metadata_schema(&keep).await.unwrap();
        assert!(!s.metadata_at(&a).await.unwrap().is_installed().unwrap());
        assert!(fleet.super_read_only(&a).unwrap());
    }

    #[tokio::test]
    async fn test_read_only_target_requires_clear_read_only() {
        let fleet = SimFleet::new();
        let a = fleet.provision_default("db1:3306", 1).unwrap();
        let s = session(&fleet, &a).await;
        s.metadata_at(&a).await.unwrap().install().unwrap();
        fleet.set_super_read_only(&a, true).await.unwrap();

        let err = s.drop_metadata_schema(&force()).await.unwrap_err();
        assert_eq!(err.code(), "read-only");

        let report = s
            .drop_metadata_schema(&DropMetadataSchemaOptions {
                force: true,
                clear_read_only: true,
            })
            .await
            .unwrap();
        assert!(report.steps.iter().any(|s| s == "restore super_read_only"));
        assert!(fleet.super_read_only(&a).unwrap());
        assert!(!s.metadata_at(&a).await.unwrap().is_installed().unwrap());
    }

    #[tokio::test]
    async fn test_upgrade_legacy_layout() {
        let fleet = SimFleet::new();
        let a = fleet.provision_default("db1:3306", 1).unwrap();
        let s = session(&fleet, &a).await;
        let group = uuid::Uuid::new_v4();
        let member = uuid::Uuid::new_v4();
        let snapshot = LegacySnapshot {
            clusters: vec![LegacyCluster {
                cluster_id: 1,
                cluster_name: "legacy".to_string(),
                options: Default::default(),
            }],
            replicasets: vec![LegacyReplicaSet {
                replicaset_id: 10,
                cluster_id: 1,
                topology_type: "pm".to_string(),
                group_replication_group_name: group.to_string(),
            }],
            instances: vec![LegacyInstance {
                instance_id: 100,
                replicaset_id: 10,
                mysql_server_uuid: member.to_string(),
                instance_name: "db9:3306".to_string(),
                address: "db9:3306".to_string(),
                server_id: Some(9),
                version: None,
            }],
        };
        let store = s.metadata_at(&a).await.unwrap();
        snapshot.write_to(store.kv().as_ref()).unwrap();

        let report = s.upgrade_metadata().await.unwrap();
        assert!(report.upgraded);
        assert_eq!(report.to, CURRENT_SCHEMA_VERSION);
        let record = store.cluster_by_name("legacy").unwrap().unwrap();
        assert_eq!(record.group_name, group);
        assert_eq!(record.instances[0].server_uuid, member);

        assert!(!s.upgrade_metadata().await.unwrap().upgraded);
    }
}
