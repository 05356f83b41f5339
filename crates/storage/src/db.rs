//! RocksDB wrapper with namespaced column families and a batched write
//! executor.

use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Error type for storage operations.
///
/// `Corruption` is reserved for states that break a consensus-safety
/// invariant (missing blocks on a recorded chain, absent view bundle);
/// callers treat it as fatal.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("corrupt store: {0}")]
    Corruption(String),
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// The byte-tagged namespaces of the store. Readers and writers agree on
/// this set statically; each maps to one column family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Block,
    BlockToParent,
    BlockToChildren,
    State,
    StateMeta,
    ViewState,
}

impl Namespace {
    pub const ALL: [Namespace; 6] = [
        Namespace::Block,
        Namespace::BlockToParent,
        Namespace::BlockToChildren,
        Namespace::State,
        Namespace::StateMeta,
        Namespace::ViewState,
    ];

    fn cf_name(self) -> &'static str {
        match self {
            Namespace::Block => "block",
            Namespace::BlockToParent => "block_to_parent",
            Namespace::BlockToChildren => "block_to_children",
            Namespace::State => "state",
            Namespace::StateMeta => "state_meta",
            Namespace::ViewState => "view_state",
        }
    }
}

/// One mutation destined for the shared write batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Put {
        ns: Namespace,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        ns: Namespace,
        key: Vec<u8>,
    },
}

impl WriteOp {
    pub fn put(ns: Namespace, key: impl Into<Vec<u8>>, value: Vec<u8>) -> Self {
        WriteOp::Put {
            ns,
            key: key.into(),
            value,
        }
    }

    pub fn delete(ns: Namespace, key: impl Into<Vec<u8>>) -> Self {
        WriteOp::Delete { ns, key: key.into() }
    }
}

/// A RocksDB database with one column family per [`Namespace`].
///
/// All mutations go through [`write_ops`](Self::write_ops); RocksDB's
/// internally synchronized `WriteBatch` makes each call atomic.
pub struct Database {
    db: DB,
}

impl Database {
    /// Open or create the database at `path` with all namespaces.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = Namespace::ALL
            .iter()
            .map(|ns| ColumnFamilyDescriptor::new(ns.cf_name(), Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)?;
        Ok(Database { db })
    }

    fn cf(&self, ns: Namespace) -> Result<&ColumnFamily, StorageError> {
        self.db.cf_handle(ns.cf_name()).ok_or_else(|| {
            StorageError::Database(format!("column family {} not found", ns.cf_name()))
        })
    }

    pub fn get(&self, ns: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get_cf(self.cf(ns)?, key)?)
    }

    pub fn contains(&self, ns: Namespace, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.get(ns, key)?.is_some())
    }

    /// Commit a set of mutations in one atomic batch.
    pub fn write_ops(&self, ops: Vec<WriteOp>) -> Result<(), StorageError> {
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                WriteOp::Put { ns, key, value } => batch.put_cf(self.cf(ns)?, key, value),
                WriteOp::Delete { ns, key } => batch.delete_cf(self.cf(ns)?, key),
            }
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// All keys currently present in a namespace.
    pub fn keys(&self, ns: Namespace) -> Result<Vec<Vec<u8>>, StorageError> {
        let iter = self.db.iterator_cf(self.cf(ns)?, rocksdb::IteratorMode::Start);
        let mut keys = Vec::new();
        for item in iter {
            let (key, _) = item?;
            keys.push(key.to_vec());
        }
        Ok(keys)
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(|e| StorageError::Codec(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    bincode::deserialize(bytes).map_err(|e| StorageError::Codec(e.to_string()))
}
