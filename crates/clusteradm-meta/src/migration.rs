//! Metadata layout upgrades.
//!
//! Layout 1.0.1 kept clusters, their replication group ("replicaset") and
//! instances as three relational-style row sets under `v1/`. Layout 2.0.0
//! folds them into one document per cluster. The upgrade is a single batch:
//! either every row is converted or nothing changes.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::kvstore::BatchOp;
use crate::store::{cluster_insert_ops, MetadataStore, CURRENT_SCHEMA_VERSION, LEGACY_PREFIX, SCHEMA_KEY};
use crate::types::*;

/// Layout version of the legacy row format.
pub const LEGACY_SCHEMA_VERSION: Version = Version::new(1, 0, 1);

/// Row types of the 1.0.1 layout.
pub mod legacy {
    use super::*;
    use crate::kvstore::KvStore;

    /// `v1/clusters/<cluster_id>`
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct LegacyCluster {
        /// Numeric row ID
        pub cluster_id: u64,
        /// Cluster name
        pub cluster_name: String,
        /// Free-form options
        #[serde(default)]
        pub options: BTreeMap<String, String>,
    }

    /// `v1/replicasets/<replicaset_id>`: the replication group of a cluster.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct LegacyReplicaSet {
        /// Numeric row ID
        pub replicaset_id: u64,
        /// Owning cluster row
        pub cluster_id: u64,
        /// `pm` (primary/master) or `mm` (multi-master)
        pub topology_type: String,
        /// Group replication group name, a UUID string
        pub group_replication_group_name: String,
    }

    /// `v1/instances/<instance_id>`
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct LegacyInstance {
        /// Numeric row ID
        pub instance_id: u64,
        /// Owning replication group row
        pub replicaset_id: u64,
        /// Server UUID
        pub mysql_server_uuid: String,
        /// Display name
        pub instance_name: String,
        /// Classic protocol endpoint
        pub address: String,
        /// Numeric server ID when it was recorded
        #[serde(default)]
        pub server_id: Option<u32>,
        /// Server version when it was recorded
        #[serde(default)]
        pub version: Option<String>,
    }

    /// Complete legacy layout.
    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    pub struct LegacySnapshot {
        /// Cluster rows
        pub clusters: Vec<LegacyCluster>,
        /// Replication group rows
        pub replicasets: Vec<LegacyReplicaSet>,
        /// Instance rows
        pub instances: Vec<LegacyInstance>,
    }

    impl LegacySnapshot {
        /// Writes the rows plus a `1.0.1` schema marker into `kv`.
        pub fn write_to(&self, kv: &dyn KvStore) -> Result<(), MetaError> {
            let mut ops = vec![BatchOp::Put {
                key: SCHEMA_KEY.to_vec(),
                value: LEGACY_SCHEMA_VERSION.to_string().into_bytes(),
            }];
            for c in &self.clusters {
                ops.push(put_row("clusters", c.cluster_id, c)?);
            }
            for r in &self.replicasets {
                ops.push(put_row("replicasets", r.replicaset_id, r)?);
            }
            for i in &self.instances {
                ops.push(put_row("instances", i.instance_id, i)?);
            }
            kv.write_batch(ops)
        }

        /// Reads every legacy row from `kv`.
        pub fn read_from(kv: &dyn KvStore) -> Result<Self, MetaError> {
            Ok(Self {
                clusters: read_rows(kv, "clusters")?,
                replicasets: read_rows(kv, "replicasets")?,
                instances: read_rows(kv, "instances")?,
            })
        }
    }

    fn put_row<T: Serialize>(table: &str, id: u64, row: &T) -> Result<BatchOp, MetaError> {
        Ok(BatchOp::Put {
            key: format!("{}{}/{}", LEGACY_PREFIX, table, id).into_bytes(),
            value: serde_json::to_vec(row)?,
        })
    }

    fn read_rows<T: serde::de::DeserializeOwned>(
        kv: &dyn KvStore,
        table: &str,
    ) -> Result<Vec<T>, MetaError> {
        kv.scan_prefix(format!("{}{}/", LEGACY_PREFIX, table).as_bytes())?
            .into_iter()
            .map(|(_, v)| serde_json::from_slice(&v).map_err(MetaError::from))
            .collect()
    }
}

use legacy::*;

/// Outcome of a layout upgrade.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Layout found before the upgrade
    pub from: Version,
    /// Layout after the upgrade
    pub to: Version,
    /// False when the store was already current
    pub upgraded: bool,
    /// Clusters converted
    pub clusters: usize,
    /// Instances converted
    pub instances: usize,
}

/// Upgrades the store to [`CURRENT_SCHEMA_VERSION`].
///
/// Instance UUIDs and group names are carried over verbatim. A store that is
/// already current is left untouched.
pub fn migrate(store: &MetadataStore) -> Result<MigrationReport, MetaError> {
    let raw = store
        .raw_schema_version()?
        .ok_or(MetaError::SchemaNotInstalled)?;
    let found: Version = raw
        .parse()
        .map_err(|_| MetaError::UnsupportedSchemaVersion(raw.clone()))?;

    if found == CURRENT_SCHEMA_VERSION {
        return Ok(MigrationReport {
            from: found,
            to: found,
            upgraded: false,
            clusters: 0,
            instances: 0,
        });
    }
    if !found.same_series(&LEGACY_SCHEMA_VERSION) {
        return Err(MetaError::UnsupportedSchemaVersion(raw));
    }

    let kv = store.kv();
    let snapshot = LegacySnapshot::read_from(kv.as_ref())?;
    let records = convert(&snapshot)?;

    let mut ops = Vec::new();
    for (key, _) in kv.scan_prefix(LEGACY_PREFIX.as_bytes())? {
        ops.push(BatchOp::Delete { key });
    }
    let mut instances = 0;
    for record in &records {
        instances += record.instances.len();
        ops.extend(cluster_insert_ops(record)?);
    }
    ops.push(BatchOp::Put {
        key: SCHEMA_KEY.to_vec(),
        value: CURRENT_SCHEMA_VERSION.to_string().into_bytes(),
    });
    kv.write_batch(ops)?;

    tracing::info!(
        from = %found,
        to = %CURRENT_SCHEMA_VERSION,
        clusters = records.len(),
        instances,
        "metadata schema upgraded"
    );

    Ok(MigrationReport {
        from: found,
        to: CURRENT_SCHEMA_VERSION,
        upgraded: true,
        clusters: records.len(),
        instances,
    })
}

fn convert(snapshot: &LegacySnapshot) -> Result<Vec<ClusterRecord>, MetaError> {
    let mut seen_uuids = HashSet::new();
    let mut seen_names = HashSet::new();
    let mut records = Vec::with_capacity(snapshot.clusters.len());

    for cluster in &snapshot.clusters {
        if !seen_names.insert(cluster.cluster_name.clone()) {
            return Err(MetaError::Corrupt(format!(
                "cluster name '{}' appears twice",
                cluster.cluster_name
            )));
        }
        let group = snapshot
            .replicasets
            .iter()
            .find(|r| r.cluster_id == cluster.cluster_id)
            .ok_or_else(|| {
                MetaError::Corrupt(format!(
                    "cluster '{}' has no replication group row",
                    cluster.cluster_name
                ))
            })?;
        let group_name = Uuid::parse_str(&group.group_replication_group_name).map_err(|_| {
            MetaError::Corrupt(format!(
                "invalid group name '{}'",
                group.group_replication_group_name
            ))
        })?;
        let topology_mode = match group.topology_type.as_str() {
            "pm" => TopologyMode::SinglePrimary,
            "mm" => TopologyMode::MultiPrimary,
            other => {
                return Err(MetaError::Corrupt(format!(
                    "unknown topology type '{}'",
                    other
                )))
            }
        };

        let mut instances = Vec::new();
        for row in snapshot
            .instances
            .iter()
            .filter(|i| i.replicaset_id == group.replicaset_id)
        {
            let server_uuid = Uuid::parse_str(&row.mysql_server_uuid).map_err(|_| {
                MetaError::Corrupt(format!("invalid server uuid '{}'", row.mysql_server_uuid))
            })?;
            if !seen_uuids.insert(server_uuid) {
                return Err(MetaError::Corrupt(format!(
                    "server uuid {} registered twice",
                    server_uuid
                )));
            }
            if row.server_id.is_none() {
                tracing::warn!(instance = %row.instance_name, "legacy row has no server_id");
            }
            let version = match &row.version {
                Some(v) => v.parse()?,
                None => Version::new(0, 0, 0),
            };
            instances.push(InstanceRecord {
                address: row.address.parse()?,
                server_uuid,
                server_id: row.server_id.unwrap_or(0),
                label: row.instance_name.clone(),
                version,
                recovery_account: None,
            });
        }

        let mut attributes = cluster.options.clone();
        attributes.insert("migratedFrom".to_string(), LEGACY_SCHEMA_VERSION.to_string());

        records.push(ClusterRecord {
            id: ClusterId::generate(),
            name: cluster.cluster_name.clone(),
            group_name,
            topology_mode,
            instances,
            attributes,
            cluster_set: None,
            created_at: now_secs(),
            generation: 1,
        });
    }
    Ok(records)
}
