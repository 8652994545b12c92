#![warn(missing_docs)]

//! clusteradm metadata subsystem: versioned records of clusters, replica sets,
//! cluster sets and their instances, persisted in the managed database.

pub mod kvstore;
pub mod migration;
pub mod store;
pub mod types;

pub use kvstore::{BatchOp, KvStore, MemoryKvStore};
pub use migration::{migrate, MigrationReport};
pub use store::{MetadataStore, NewCluster, CURRENT_SCHEMA_VERSION};
pub use types::*;
