//! Versioned metadata store for managed topologies.
//!
//! Records are JSON documents keyed under fixed prefixes. Every record carries
//! a generation; updates must present the generation they read, otherwise the
//! write is refused with `VersionConflict`. A secondary index maps each
//! `server_uuid` to its owning topology so an instance can never be
//! registered twice.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::kvstore::{BatchOp, KvStore};
use crate::types::*;

/// Layout version written by this build.
pub const CURRENT_SCHEMA_VERSION: Version = Version::new(2, 0, 0);

pub(crate) const SCHEMA_KEY: &[u8] = b"mdschema/version";
const INSTANCE_PREFIX: &str = "instances/";
const NAME_PREFIX: &str = "names/";
pub(crate) const LEGACY_PREFIX: &str = "v1/";

/// Record types persisted by the store.
trait Stored: Serialize + DeserializeOwned {
    const KIND: &'static str;
    const INDEX: &'static str;
    const PREFIX: &'static str;

    fn record_id(&self) -> String;
    fn record_name(&self) -> &str;
    fn generation(&self) -> u64;
    fn set_generation(&mut self, generation: u64);
    fn owner(&self) -> Option<Owner>;
    fn member_uuids(&self) -> Vec<Uuid>;
}

impl Stored for ClusterRecord {
    const KIND: &'static str = "cluster";
    const INDEX: &'static str = "cluster";
    const PREFIX: &'static str = "clusters/";

    fn record_id(&self) -> String {
        self.id.to_string()
    }
    fn record_name(&self) -> &str {
        &self.name
    }
    fn generation(&self) -> u64 {
        self.generation
    }
    fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }
    fn owner(&self) -> Option<Owner> {
        Some(Owner::Cluster(self.id))
    }
    fn member_uuids(&self) -> Vec<Uuid> {
        self.instances.iter().map(|i| i.server_uuid).collect()
    }
}

impl Stored for ReplicaSetRecord {
    const KIND: &'static str = "replica set";
    const INDEX: &'static str = "replicaset";
    const PREFIX: &'static str = "replicasets/";

    fn record_id(&self) -> String {
        self.id.to_string()
    }
    fn record_name(&self) -> &str {
        &self.name
    }
    fn generation(&self) -> u64 {
        self.generation
    }
    fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }
    fn owner(&self) -> Option<Owner> {
        Some(Owner::ReplicaSet(self.id))
    }
    fn member_uuids(&self) -> Vec<Uuid> {
        self.instances.iter().map(|i| i.server_uuid).collect()
    }
}

impl Stored for ClusterSetRecord {
    const KIND: &'static str = "cluster set";
    const INDEX: &'static str = "clusterset";
    const PREFIX: &'static str = "clustersets/";

    fn record_id(&self) -> String {
        self.id.to_string()
    }
    fn record_name(&self) -> &str {
        &self.domain_name
    }
    fn generation(&self) -> u64 {
        self.generation
    }
    fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }
    fn owner(&self) -> Option<Owner> {
        None
    }
    fn member_uuids(&self) -> Vec<Uuid> {
        Vec::new()
    }
}

fn record_key<T: Stored>(id: &str) -> Vec<u8> {
    format!("{}{}", T::PREFIX, id).into_bytes()
}

fn name_key<T: Stored>(name: &str) -> Vec<u8> {
    format!("{}{}/{}", NAME_PREFIX, T::INDEX, name).into_bytes()
}

fn instance_key(server_uuid: &Uuid) -> Vec<u8> {
    format!("{}{}", INSTANCE_PREFIX, server_uuid).into_bytes()
}

/// Batch operations that register a cluster record with its indexes.
pub(crate) fn cluster_insert_ops(record: &ClusterRecord) -> Result<Vec<BatchOp>, MetaError> {
    let mut ops = vec![
        BatchOp::Put {
            key: record_key::<ClusterRecord>(&record.record_id()),
            value: serde_json::to_vec(record)?,
        },
        BatchOp::Put {
            key: name_key::<ClusterRecord>(&record.name),
            value: serde_json::to_vec(&record.record_id())?,
        },
    ];
    for uuid in record.member_uuids() {
        ops.push(BatchOp::Put {
            key: instance_key(&uuid),
            value: serde_json::to_vec(&Owner::Cluster(record.id))?,
        });
    }
    Ok(ops)
}

/// Parameters for registering a new cluster.
#[derive(Clone, Debug)]
pub struct NewCluster {
    /// Unique name
    pub name: String,
    /// Replication group identifier
    pub group_name: Uuid,
    /// Single or multi primary
    pub topology_mode: TopologyMode,
    /// Bootstrap member
    pub seed: InstanceRecord,
    /// Cluster options
    pub attributes: std::collections::BTreeMap<String, String>,
}

/// Handle over the metadata schema held by one instance (or replication group).
#[derive(Clone)]
pub struct MetadataStore {
    kv: Arc<dyn KvStore>,
}

impl MetadataStore {
    /// Wraps a KV store.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Underlying KV store, used by the migration code.
    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    /// Raw schema version string, if a schema exists.
    pub(crate) fn raw_schema_version(&self) -> Result<Option<String>, MetaError> {
        match self.kv.get(SCHEMA_KEY)? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| MetaError::Corrupt(e.to_string())),
            None => Ok(None),
        }
    }

    /// Installed schema version, if any.
    pub fn schema_version(&self) -> Result<Option<Version>, MetaError> {
        match self.raw_schema_version()? {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| MetaError::UnsupportedSchemaVersion(raw)),
            None => Ok(None),
        }
    }

    /// True when any schema version is present.
    pub fn is_installed(&self) -> Result<bool, MetaError> {
        self.kv.contains_key(SCHEMA_KEY)
    }

    /// Creates an empty schema at the current layout version.
    pub fn install(&self) -> Result<(), MetaError> {
        if let Some(version) = self.schema_version()? {
            return Err(MetaError::SchemaAlreadyInstalled(version));
        }
        self.kv.put(
            SCHEMA_KEY.to_vec(),
            CURRENT_SCHEMA_VERSION.to_string().into_bytes(),
        )?;
        tracing::info!(version = %CURRENT_SCHEMA_VERSION, "metadata schema installed");
        Ok(())
    }

    /// Fails unless the schema exists at exactly the current layout version.
    pub fn require_current(&self) -> Result<(), MetaError> {
        let raw = self
            .raw_schema_version()?
            .ok_or(MetaError::SchemaNotInstalled)?;
        let version: Version = raw
            .parse()
            .map_err(|_| MetaError::UnsupportedSchemaVersion(raw.clone()))?;
        if version < CURRENT_SCHEMA_VERSION {
            return Err(MetaError::SchemaOutdated {
                found: version,
                required: CURRENT_SCHEMA_VERSION,
            });
        }
        if version > CURRENT_SCHEMA_VERSION {
            return Err(MetaError::UnsupportedSchemaVersion(raw));
        }
        Ok(())
    }

    /// Removes every metadata key. Returns the number of keys deleted.
    pub fn drop_schema(&self) -> Result<usize, MetaError> {
        if !self.is_installed()? {
            return Err(MetaError::SchemaNotInstalled);
        }
        let mut ops = Vec::new();
        for prefix in [
            ClusterRecord::PREFIX,
            ReplicaSetRecord::PREFIX,
            ClusterSetRecord::PREFIX,
            INSTANCE_PREFIX,
            NAME_PREFIX,
            LEGACY_PREFIX,
        ] {
            for (key, _) in self.kv.scan_prefix(prefix.as_bytes())? {
                ops.push(BatchOp::Delete { key });
            }
        }
        ops.push(BatchOp::Delete {
            key: SCHEMA_KEY.to_vec(),
        });
        let count = ops.len();
        self.kv.write_batch(ops)?;
        tracing::info!(keys = count, "metadata schema dropped");
        Ok(count)
    }

    /// Topology owning the instance, if registered.
    pub fn owner_of(&self, server_uuid: &Uuid) -> Result<Option<Owner>, MetaError> {
        self.require_current()?;
        self.get_json(&instance_key(server_uuid))
    }

    // ---- clusters ----

    /// Registers a new cluster with its seed instance.
    pub fn create_cluster(&self, spec: NewCluster) -> Result<ClusterRecord, MetaError> {
        let record = ClusterRecord {
            id: ClusterId::generate(),
            name: spec.name,
            group_name: spec.group_name,
            topology_mode: spec.topology_mode,
            instances: vec![spec.seed],
            attributes: spec.attributes,
            cluster_set: None,
            created_at: now_secs(),
            generation: 1,
        };
        self.insert_new(&record)?;
        tracing::info!(cluster = %record.name, id = %record.id, "cluster registered");
        Ok(record)
    }

    /// Loads a cluster by ID.
    pub fn cluster(&self, id: &ClusterId) -> Result<ClusterRecord, MetaError> {
        self.load::<ClusterRecord>(&id.to_string())?
            .ok_or_else(|| MetaError::ClusterNotFound(id.to_string()))
    }

    /// Loads a cluster by name.
    pub fn cluster_by_name(&self, name: &str) -> Result<Option<ClusterRecord>, MetaError> {
        self.load_by_name(name)
    }

    /// All registered clusters.
    pub fn clusters(&self) -> Result<Vec<ClusterRecord>, MetaError> {
        self.list()
    }

    /// Replaces a cluster record. `record.generation` must match the stored one.
    pub fn update_cluster(&self, record: &ClusterRecord) -> Result<ClusterRecord, MetaError> {
        let stored = self.cluster(&record.id)?;
        self.replace(&stored, record)
    }

    /// Deletes a cluster and its ownership entries.
    pub fn delete_cluster(&self, id: &ClusterId) -> Result<(), MetaError> {
        let stored = self.cluster(id)?;
        self.remove(&stored)?;
        tracing::info!(cluster = %stored.name, "cluster deregistered");
        Ok(())
    }

    // ---- replica sets ----

    /// Registers a new replica set with its primary.
    pub fn create_replica_set(
        &self,
        name: &str,
        primary: InstanceRecord,
    ) -> Result<ReplicaSetRecord, MetaError> {
        let record = ReplicaSetRecord {
            id: ReplicaSetId::generate(),
            name: name.to_string(),
            primary: primary.server_uuid,
            instances: vec![primary],
            invalidated: Vec::new(),
            created_at: now_secs(),
            generation: 1,
        };
        self.insert_new(&record)?;
        tracing::info!(replicaset = %record.name, "replica set registered");
        Ok(record)
    }

    /// Loads a replica set by ID.
    pub fn replica_set(&self, id: &ReplicaSetId) -> Result<ReplicaSetRecord, MetaError> {
        self.load::<ReplicaSetRecord>(&id.to_string())?
            .ok_or_else(|| MetaError::ReplicaSetNotFound(id.to_string()))
    }

    /// Loads a replica set by name.
    pub fn replica_set_by_name(&self, name: &str) -> Result<Option<ReplicaSetRecord>, MetaError> {
        self.load_by_name(name)
    }

    /// All registered replica sets.
    pub fn replica_sets(&self) -> Result<Vec<ReplicaSetRecord>, MetaError> {
        self.list()
    }

    /// Replaces a replica set record with generation check.
    pub fn update_replica_set(
        &self,
        record: &ReplicaSetRecord,
    ) -> Result<ReplicaSetRecord, MetaError> {
        let stored = self.replica_set(&record.id)?;
        self.replace(&stored, record)
    }

    /// Deletes a replica set.
    pub fn delete_replica_set(&self, id: &ReplicaSetId) -> Result<(), MetaError> {
        let stored = self.replica_set(id)?;
        self.remove(&stored)
    }

    // ---- cluster sets ----

    /// Registers a cluster set whose only member is `primary` in the PRIMARY
    /// role and links the cluster to it, in one batch.
    pub fn create_cluster_set(
        &self,
        domain_name: &str,
        primary: &ClusterRecord,
    ) -> Result<(ClusterSetRecord, ClusterRecord), MetaError> {
        let stored = self.cluster(&primary.id)?;
        if stored.cluster_set.is_some() {
            return Err(MetaError::Corrupt(format!(
                "cluster '{}' already belongs to a cluster set",
                stored.name
            )));
        }
        let set = ClusterSetRecord {
            id: ClusterSetId::generate(),
            domain_name: domain_name.to_string(),
            members: vec![ClusterSetMember {
                cluster_id: primary.id,
                cluster_name: primary.name.clone(),
                role: ClusterRole::Primary,
                channel: None,
                invalidated: false,
            }],
            created_at: now_secs(),
            generation: 1,
        };
        let mut linked = primary.clone();
        linked.cluster_set = Some(ClusterSetMembership {
            cluster_set_id: set.id,
            role: ClusterRole::Primary,
        });

        let mut ops = self.insert_ops(&set)?;
        let (cluster_ops, linked) = self.replace_ops(&stored, &linked)?;
        ops.extend(cluster_ops);
        self.kv.write_batch(ops)?;
        tracing::info!(domain = %set.domain_name, primary = %linked.name, "cluster set registered");
        Ok((set, linked))
    }

    /// Registers a new REPLICA cluster and adds it to `set`, in one batch.
    pub fn register_replica_cluster(
        &self,
        set: &ClusterSetRecord,
        spec: NewCluster,
        channel: &str,
    ) -> Result<(ClusterSetRecord, ClusterRecord), MetaError> {
        let stored_set = self.cluster_set(&set.id)?;
        let cluster = ClusterRecord {
            id: ClusterId::generate(),
            name: spec.name,
            group_name: spec.group_name,
            topology_mode: spec.topology_mode,
            instances: vec![spec.seed],
            attributes: spec.attributes,
            cluster_set: Some(ClusterSetMembership {
                cluster_set_id: set.id,
                role: ClusterRole::Replica,
            }),
            created_at: now_secs(),
            generation: 1,
        };
        let mut next_set = set.clone();
        next_set.members.push(ClusterSetMember {
            cluster_id: cluster.id,
            cluster_name: cluster.name.clone(),
            role: ClusterRole::Replica,
            channel: Some(channel.to_string()),
            invalidated: false,
        });

        let mut ops = self.insert_ops(&cluster)?;
        let (set_ops, next_set) = self.replace_ops(&stored_set, &next_set)?;
        ops.extend(set_ops);
        self.kv.write_batch(ops)?;
        tracing::info!(domain = %next_set.domain_name, cluster = %cluster.name, "replica cluster registered");
        Ok((next_set, cluster))
    }

    /// Removes `cluster` from `set` and deletes its record, in one batch.
    pub fn deregister_cluster(
        &self,
        set: &ClusterSetRecord,
        cluster: &ClusterRecord,
    ) -> Result<ClusterSetRecord, MetaError> {
        let stored_set = self.cluster_set(&set.id)?;
        let stored_cluster = self.cluster(&cluster.id)?;
        if stored_cluster.generation != cluster.generation {
            return Err(MetaError::VersionConflict {
                entity: format!("cluster '{}'", cluster.name),
                expected: cluster.generation,
                found: stored_cluster.generation,
            });
        }
        let mut next_set = set.clone();
        next_set.members.retain(|m| m.cluster_id != cluster.id);

        let (mut ops, next_set) = self.replace_ops(&stored_set, &next_set)?;
        ops.extend(self.remove_ops(&stored_cluster));
        self.kv.write_batch(ops)?;
        tracing::info!(domain = %next_set.domain_name, cluster = %cluster.name, "cluster deregistered from cluster set");
        Ok(next_set)
    }

    /// Loads a cluster set by ID.
    pub fn cluster_set(&self, id: &ClusterSetId) -> Result<ClusterSetRecord, MetaError> {
        self.load::<ClusterSetRecord>(&id.to_string())?
            .ok_or_else(|| MetaError::ClusterSetNotFound(id.to_string()))
    }

    /// Loads a cluster set by domain name.
    pub fn cluster_set_by_name(&self, domain: &str) -> Result<Option<ClusterSetRecord>, MetaError> {
        self.load_by_name(domain)
    }

    /// Replaces a cluster set record with generation check.
    pub fn update_cluster_set(
        &self,
        record: &ClusterSetRecord,
    ) -> Result<ClusterSetRecord, MetaError> {
        let stored = self.cluster_set(&record.id)?;
        self.replace(&stored, record)
    }

    /// Deletes a cluster set.
    pub fn delete_cluster_set(&self, id: &ClusterSetId) -> Result<(), MetaError> {
        let stored = self.cluster_set(id)?;
        self.remove(&stored)
    }

    // ---- generic record plumbing ----

    fn get_json<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, MetaError> {
        match self.kv.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load<T: Stored>(&self, id: &str) -> Result<Option<T>, MetaError> {
        self.require_current()?;
        self.get_json(&record_key::<T>(id))
    }

    fn load_by_name<T: Stored>(&self, name: &str) -> Result<Option<T>, MetaError> {
        self.require_current()?;
        let id: Option<String> = self.get_json(&name_key::<T>(name))?;
        match id {
            Some(id) => self.get_json(&record_key::<T>(&id)),
            None => Ok(None),
        }
    }

    fn list<T: Stored>(&self) -> Result<Vec<T>, MetaError> {
        self.require_current()?;
        self.kv
            .scan_prefix(T::PREFIX.as_bytes())?
            .into_iter()
            .map(|(_, v)| serde_json::from_slice(&v).map_err(MetaError::from))
            .collect()
    }

    fn check_ownership(&self, owner: Option<Owner>, uuids: &[Uuid]) -> Result<(), MetaError> {
        let Some(owner) = owner else {
            return Ok(());
        };
        for uuid in uuids {
            let current: Option<Owner> = self.get_json(&instance_key(uuid))?;
            if let Some(current) = current {
                if current != owner {
                    return Err(MetaError::InstanceAlreadyManaged {
                        server_uuid: *uuid,
                        owner: current,
                    });
                }
            }
        }
        Ok(())
    }

    fn insert_ops<T: Stored>(&self, record: &T) -> Result<Vec<BatchOp>, MetaError> {
        self.require_current()?;
        let name = name_key::<T>(record.record_name());
        if self.kv.contains_key(&name)? {
            return Err(MetaError::DuplicateName {
                kind: T::KIND,
                name: record.record_name().to_string(),
            });
        }
        let uuids = record.member_uuids();
        self.check_ownership(record.owner(), &uuids)?;

        let mut ops = vec![
            BatchOp::Put {
                key: record_key::<T>(&record.record_id()),
                value: serde_json::to_vec(record)?,
            },
            BatchOp::Put {
                key: name,
                value: serde_json::to_vec(&record.record_id())?,
            },
        ];
        if let Some(owner) = record.owner() {
            for uuid in &uuids {
                ops.push(BatchOp::Put {
                    key: instance_key(uuid),
                    value: serde_json::to_vec(&owner)?,
                });
            }
        }
        Ok(ops)
    }

    fn insert_new<T: Stored>(&self, record: &T) -> Result<(), MetaError> {
        let ops = self.insert_ops(record)?;
        self.kv.write_batch(ops)
    }

    fn replace_ops<T: Stored + Clone>(
        &self,
        stored: &T,
        record: &T,
    ) -> Result<(Vec<BatchOp>, T), MetaError> {
        if stored.generation() != record.generation() {
            return Err(MetaError::VersionConflict {
                entity: format!("{} '{}'", T::KIND, stored.record_name()),
                expected: record.generation(),
                found: stored.generation(),
            });
        }

        let old_uuids = stored.member_uuids();
        let new_uuids = record.member_uuids();
        let added: Vec<Uuid> = new_uuids
            .iter()
            .filter(|u| !old_uuids.contains(u))
            .copied()
            .collect();
        self.check_ownership(record.owner(), &added)?;

        let mut ops = Vec::new();
        if stored.record_name() != record.record_name() {
            let new_name = name_key::<T>(record.record_name());
            if self.kv.contains_key(&new_name)? {
                return Err(MetaError::DuplicateName {
                    kind: T::KIND,
                    name: record.record_name().to_string(),
                });
            }
            ops.push(BatchOp::Delete {
                key: name_key::<T>(stored.record_name()),
            });
            ops.push(BatchOp::Put {
                key: new_name,
                value: serde_json::to_vec(&record.record_id())?,
            });
        }

        let mut next = record.clone();
        next.set_generation(stored.generation() + 1);
        ops.push(BatchOp::Put {
            key: record_key::<T>(&next.record_id()),
            value: serde_json::to_vec(&next)?,
        });
        for uuid in old_uuids.iter().filter(|u| !new_uuids.contains(u)) {
            ops.push(BatchOp::Delete {
                key: instance_key(uuid),
            });
        }
        if let Some(owner) = record.owner() {
            for uuid in &added {
                ops.push(BatchOp::Put {
                    key: instance_key(uuid),
                    value: serde_json::to_vec(&owner)?,
                });
            }
        }
        Ok((ops, next))
    }

    fn replace<T: Stored + Clone>(&self, stored: &T, record: &T) -> Result<T, MetaError> {
        let (ops, next) = self.replace_ops(stored, record)?;
        self.kv.write_batch(ops)?;
        tracing::debug!(
            kind = T::KIND,
            name = %next.record_name(),
            generation = next.generation(),
            "metadata record updated"
        );
        Ok(next)
    }

    fn remove_ops<T: Stored>(&self, stored: &T) -> Vec<BatchOp> {
        let mut ops = vec![
            BatchOp::Delete {
                key: record_key::<T>(&stored.record_id()),
            },
            BatchOp::Delete {
                key: name_key::<T>(stored.record_name()),
            },
        ];
        for uuid in stored.member_uuids() {
            ops.push(BatchOp::Delete {
                key: instance_key(&uuid),
            });
        }
        ops
    }

    fn remove<T: Stored>(&self, stored: &T) -> Result<(), MetaError> {
        self.kv.write_batch(self.remove_ops(stored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::MemoryKvStore;
    use std::collections::BTreeMap;

    fn store() -> MetadataStore {
        let store = MetadataStore::new(Arc::new(MemoryKvStore::new()));
        store.install().unwrap();
        store
    }

    fn instance(port: u16, server_id: u32) -> InstanceRecord {
        InstanceRecord::new(
            InstanceAddress::new("db", port),
            Uuid::new_v4(),
            server_id,
            Version::new(8, 0, 27),
        )
    }

    fn new_cluster(name: &str, seed: InstanceRecord) -> NewCluster {
        NewCluster {
            name: name.to_string(),
            group_name: Uuid::new_v4(),
            topology_mode: TopologyMode::SinglePrimary,
            seed,
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn test_operations_require_schema() {
        let store = MetadataStore::new(Arc::new(MemoryKvStore::new()));
        assert!(matches!(
            store.clusters(),
            Err(MetaError::SchemaNotInstalled)
        ));
        assert!(matches!(
            store.drop_schema(),
            Err(MetaError::SchemaNotInstalled)
        ));
    }

    #[test]
    fn test_install_twice_fails() {
        let store = store();
        assert!(matches!(
            store.install(),
            Err(MetaError::SchemaAlreadyInstalled(v)) if v == CURRENT_SCHEMA_VERSION
        ));
    }

    #[test]
    fn test_create_cluster_duplicate_name() {
        let store = store();
        store.create_cluster(new_cluster("dev", instance(3306, 1))).unwrap();
        let err = store
            .create_cluster(new_cluster("dev", instance(3307, 2)))
            .unwrap_err();
        assert!(matches!(err, MetaError::DuplicateName { kind: "cluster", .. }));
    }

    #[test]
    fn test_instance_cannot_belong_to_two_clusters() {
        let store = store();
        let seed = instance(3306, 1);
        store.create_cluster(new_cluster("a", seed.clone())).unwrap();
        let err = store.create_cluster(new_cluster("b", seed)).unwrap_err();
        assert!(matches!(err, MetaError::InstanceAlreadyManaged { .. }));
        assert!(store.cluster_by_name("b").unwrap().is_none());
    }

    #[test]
    fn test_update_bumps_generation_and_indexes_members() {
        let store = store();
        let mut record = store.create_cluster(new_cluster("dev", instance(3306, 1))).unwrap();
        let joiner = instance(3307, 2);
        record.instances.push(joiner.clone());
        let updated = store.update_cluster(&record).unwrap();
        assert_eq!(updated.generation, 2);
        assert_eq!(
            store.owner_of(&joiner.server_uuid).unwrap(),
            Some(Owner::Cluster(record.id))
        );
    }

    #[test]
    fn test_stale_update_is_rejected() {
        let store = store();
        let record = store.create_cluster(new_cluster("dev", instance(3306, 1))).unwrap();
        let mut first = record.clone();
        first.attributes.insert("k".into(), "v".into());
        store.update_cluster(&first).unwrap();

        let mut stale = record;
        stale.instances.push(instance(3307, 2));
        let err = store.update_cluster(&stale).unwrap_err();
        assert!(matches!(
            err,
            MetaError::VersionConflict {
                expected: 1,
                found: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_removing_member_frees_ownership() {
        let store = store();
        let mut record = store.create_cluster(new_cluster("dev", instance(3306, 1))).unwrap();
        let joiner = instance(3307, 2);
        record.instances.push(joiner.clone());
        let mut record = store.update_cluster(&record).unwrap();
        record.instances.retain(|i| i.server_uuid != joiner.server_uuid);
        store.update_cluster(&record).unwrap();
        assert_eq!(store.owner_of(&joiner.server_uuid).unwrap(), None);
    }

    #[test]
    fn test_delete_cluster_clears_name_and_owners() {
        let store = store();
        let seed = instance(3306, 1);
        let record = store.create_cluster(new_cluster("dev", seed.clone())).unwrap();
        store.delete_cluster(&record.id).unwrap();
        assert!(store.cluster_by_name("dev").unwrap().is_none());
        assert_eq!(store.owner_of(&seed.server_uuid).unwrap(), None);
        assert!(matches!(
            store.delete_cluster(&record.id),
            Err(MetaError::ClusterNotFound(_))
        ));
    }

    #[test]
    fn test_replica_set_and_cluster_share_ownership_index() {
        let store = store();
        let seed = instance(3306, 1);
        store.create_cluster(new_cluster("c", seed.clone())).unwrap();
        let err = store.create_replica_set("rs", seed).unwrap_err();
        assert!(matches!(
            err,
            MetaError::InstanceAlreadyManaged {
                owner: Owner::Cluster(_),
                ..
            }
        ));
    }

    #[test]
    fn test_cluster_set_lifecycle() {
        let store = store();
        let cluster = store.create_cluster(new_cluster("c1", instance(3306, 1))).unwrap();
        let (set, cluster) = store.create_cluster_set("dom", &cluster).unwrap();
        assert_eq!(set.primary().unwrap().cluster_id, cluster.id);
        assert!(cluster.in_cluster_set());
        assert_eq!(store.cluster(&cluster.id).unwrap().generation, 2);
        assert!(store.cluster_set_by_name("dom").unwrap().is_some());

        let other = store.create_cluster(new_cluster("c2", instance(3307, 2))).unwrap();
        assert!(matches!(
            store.create_cluster_set("dom", &other),
            Err(MetaError::DuplicateName { .. })
        ));
        assert!(!store.cluster(&other.id).unwrap().in_cluster_set());

        let (set, replica) = store
            .register_replica_cluster(&set, new_cluster("c3", instance(3308, 3)), "clusterset_replication")
            .unwrap();
        assert_eq!(set.members.len(), 2);
        assert_eq!(set.primary_count(), 1);
        assert_eq!(replica.cluster_set.as_ref().unwrap().role, ClusterRole::Replica);

        let set = store.deregister_cluster(&set, &replica).unwrap();
        assert_eq!(set.members.len(), 1);
        assert!(store.cluster_by_name("c3").unwrap().is_none());
        assert!(store.owner_of(&replica.instances[0].server_uuid).unwrap().is_none());

        store.delete_cluster_set(&set.id).unwrap();
        assert!(store.cluster_set_by_name("dom").unwrap().is_none());
    }

    #[test]
    fn test_replica_registration_is_atomic() {
        let store = store();
        let c1 = store.create_cluster(new_cluster("c1", instance(3306, 1))).unwrap();
        let (set, _) = store.create_cluster_set("dom", &c1).unwrap();
        let taken = store.create_cluster(new_cluster("c2", instance(3307, 2))).unwrap();
        let result = store.register_replica_cluster(
            &set,
            new_cluster("c3", taken.instances[0].clone()),
            "clusterset_replication",
        );
        assert!(matches!(result, Err(MetaError::InstanceAlreadyManaged { .. })));
        assert!(store.cluster_by_name("c3").unwrap().is_none());
        assert_eq!(store.cluster_set(&set.id).unwrap().members.len(), 1);
    }

    #[test]
    fn test_drop_schema_removes_everything() {
        let store = store();
        store.create_cluster(new_cluster("dev", instance(3306, 1))).unwrap();
        let removed = store.drop_schema().unwrap();
        assert!(removed >= 4);
        assert!(!store.is_installed().unwrap());
    }

    #[test]
    fn test_outdated_schema_is_refused() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.put(SCHEMA_KEY.to_vec(), b"1.0.1".to_vec()).unwrap();
        let store = MetadataStore::new(kv);
        assert!(matches!(
            store.clusters(),
            Err(MetaError::SchemaOutdated { .. })
        ));
    }
}
