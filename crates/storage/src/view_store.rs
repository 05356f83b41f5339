//! The durable view state bundle.

use crate::db::{decode, encode, Database, Namespace, StorageError, WriteOp};
use gridbot_types::{Hash, Phase, QuorumCertificate, ViewStateBundle};
use std::sync::Arc;

const KEY_VIEW_NUMBER: &[u8] = b"view_number";
const KEY_PREPARE_QC: &[u8] = b"prepare_qc";
const KEY_LOCKED_QC: &[u8] = b"locked_qc";
const KEY_COMMIT_QC: &[u8] = b"commit_qc";
const KEY_ROOT: &[u8] = b"root_block_hash";
const KEY_LAST_EXECUTED: &[u8] = b"last_executed_block_hash";

/// Persists the node's single [`ViewStateBundle`].
///
/// Each field lives under its own key so every updater is one atomic
/// single-key write; the consensus runner and the pruner can update
/// disjoint fields without clobbering each other. The genesis seed writes
/// all fields in one batch.
pub struct ViewStateStore {
    db: Arc<Database>,
}

impl ViewStateStore {
    pub fn new(db: Arc<Database>) -> Self {
        ViewStateStore { db }
    }

    /// Seed the genesis bundle unless one is already persisted.
    pub fn init_genesis(&self, genesis_hash: Hash) -> Result<(), StorageError> {
        if self.db.contains(Namespace::ViewState, KEY_VIEW_NUMBER)? {
            return Ok(());
        }
        let bundle = ViewStateBundle::genesis(genesis_hash);
        self.db.write_ops(vec![
            put(KEY_VIEW_NUMBER, &bundle.view_number)?,
            put(KEY_PREPARE_QC, &bundle.prepare_qc)?,
            put(KEY_LOCKED_QC, &bundle.locked_qc)?,
            put(KEY_COMMIT_QC, &bundle.commit_qc)?,
            put(KEY_ROOT, &bundle.root_block_hash)?,
            put(KEY_LAST_EXECUTED, &bundle.last_executed_block_hash)?,
        ])
    }

    /// The persisted bundle. Any missing field on a seeded store
    /// indicates corruption.
    pub fn bundle(&self) -> Result<ViewStateBundle, StorageError> {
        Ok(ViewStateBundle {
            view_number: self.read(KEY_VIEW_NUMBER)?,
            prepare_qc: self.read(KEY_PREPARE_QC)?,
            locked_qc: self.read(KEY_LOCKED_QC)?,
            commit_qc: self.read(KEY_COMMIT_QC)?,
            root_block_hash: self.read(KEY_ROOT)?,
            last_executed_block_hash: self.read(KEY_LAST_EXECUTED)?,
        })
    }

    pub fn set_view_number(&self, view_number: u64) -> Result<(), StorageError> {
        self.db.write_ops(vec![put(KEY_VIEW_NUMBER, &view_number)?])
    }

    pub fn set_root_block_hash(&self, hash: Hash) -> Result<(), StorageError> {
        self.db.write_ops(vec![self.set_root_op(hash)?])
    }

    pub fn set_last_executed_block_hash(&self, hash: Hash) -> Result<(), StorageError> {
        self.db.write_ops(vec![put(KEY_LAST_EXECUTED, &hash)?])
    }

    /// Store a certificate into the slot matching its phase.
    pub fn set_qc(&self, qc: &QuorumCertificate) -> Result<(), StorageError> {
        let key = match qc.phase {
            Phase::Prepare => KEY_PREPARE_QC,
            Phase::PreCommit => KEY_LOCKED_QC,
            Phase::Commit => KEY_COMMIT_QC,
            Phase::Decide => {
                return Err(StorageError::Corruption(
                    "decide certificates are not persisted".into(),
                ))
            }
        };
        self.db.write_ops(vec![put(key, qc)?])
    }

    /// The mutation updating only the root hash, for composition into the
    /// pruner's atomic batch.
    pub fn set_root_op(&self, hash: Hash) -> Result<WriteOp, StorageError> {
        put(KEY_ROOT, &hash)
    }

    fn read<T: serde::de::DeserializeOwned>(&self, key: &[u8]) -> Result<T, StorageError> {
        match self.db.get(Namespace::ViewState, key)? {
            Some(bytes) => decode(&bytes),
            None => Err(StorageError::Corruption(format!(
                "view state field {} missing",
                String::from_utf8_lossy(key)
            ))),
        }
    }
}

fn put<T: serde::Serialize>(key: &[u8], value: &T) -> Result<WriteOp, StorageError> {
    Ok(WriteOp::put(Namespace::ViewState, key.to_vec(), encode(value)?))
}
