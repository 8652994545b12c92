//! Key-value abstraction over the metadata schema of a managed instance.
//!
//! Metadata rows live inside the managed database itself, under textual keys
//! such as `clusters/<id>` or `owners/<server_uuid>`. `KvStore` is the narrow
//! surface `MetadataStore` needs from that schema; `MemoryKvStore` backs the
//! simulated fleet and tests.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::MetaError;

/// One metadata row as stored: encoded key and serialized record.
pub type Row = (Vec<u8>, Vec<u8>);

/// Access to the metadata rows of one instance.
///
/// Implementations fail with `MetaError::ReadOnly` when the instance refuses
/// writes and with `MetaError::KvError` when it cannot be reached.
pub trait KvStore: Send + Sync {
    /// Reads one row.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MetaError>;

    /// Inserts or replaces one row.
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), MetaError>;

    /// Removes one row; absent rows are not an error.
    fn delete(&self, key: &[u8]) -> Result<(), MetaError>;

    /// Rows whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<Row>, MetaError>;

    /// True when the row exists.
    fn contains_key(&self, key: &[u8]) -> Result<bool, MetaError> {
        Ok(self.get(key)?.is_some())
    }

    /// Applies a record change and its index rows as one transaction.
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), MetaError>;
}

/// Row change inside a metadata transaction.
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Write a record or index row
    Put {
        /// Encoded key
        key: Vec<u8>,
        /// Serialized record
        value: Vec<u8>,
    },
    /// Remove a record or index row
    Delete {
        /// Encoded key
        key: Vec<u8>,
    },
}

impl BatchOp {
    fn apply(self, rows: &mut BTreeMap<Vec<u8>, Vec<u8>>) {
        match self {
            BatchOp::Put { key, value } => {
                rows.insert(key, value);
            }
            BatchOp::Delete { key } => {
                rows.remove(&key);
            }
        }
    }
}

/// Metadata schema kept in process memory.
///
/// Handles are shared through `Arc`; `snapshot` forks an independent copy,
/// the way a member keeps its own schema after leaving a group.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    rows: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKvStore {
    /// Creates a store without any schema rows.
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> Result<RwLockReadGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>>, MetaError> {
        self.rows
            .read()
            .map_err(|_| MetaError::KvError("metadata rows lock poisoned".to_string()))
    }

    fn rows_mut(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>>, MetaError> {
        self.rows
            .write()
            .map_err(|_| MetaError::KvError("metadata rows lock poisoned".to_string()))
    }

    /// Independent copy of every row.
    pub fn snapshot(&self) -> Result<MemoryKvStore, MetaError> {
        let rows = self.rows()?.clone();
        Ok(Self {
            rows: RwLock::new(rows),
        })
    }

    /// Number of rows, zero when the lock is poisoned.
    pub fn len(&self) -> usize {
        self.rows().map(|r| r.len()).unwrap_or(0)
    }

    /// True when no schema rows exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MetaError> {
        Ok(self.rows()?.get(key).cloned())
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), MetaError> {
        BatchOp::Put { key, value }.apply(&mut *self.rows_mut()?);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), MetaError> {
        self.rows_mut()?.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<Row>, MetaError> {
        let rows = self.rows()?;
        Ok(rows
            .range::<Vec<u8>, _>(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool, MetaError> {
        Ok(self.rows()?.contains_key(key))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), MetaError> {
        let mut rows = self.rows_mut()?;
        for op in ops {
            op.apply(&mut rows);
        }
        Ok(())
    }
}
