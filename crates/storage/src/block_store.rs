//! Content-addressed block storage.

use crate::db::{decode, encode, Database, Namespace, StorageError, WriteOp};
use gridbot_types::{Block, Hash};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// The block DAG: `Block` maps hash to block, with `BlockToParent` and
/// `BlockToChildren` as mutually consistent navigation indices.
///
/// Stored blocks form a forest rooted at the recorded root. Pruning keeps
/// exactly the descendant closure of the new root, so a block still
/// reachable from the last executed decision is never deleted.
pub struct BlockStore {
    db: Arc<Database>,
}

impl BlockStore {
    pub fn new(db: Arc<Database>) -> Self {
        BlockStore { db }
    }

    /// Store a block and maintain both indices. Idempotent: re-putting an
    /// existing block leaves the store unchanged.
    pub fn put(&self, block: &Block) -> Result<(), StorageError> {
        let hash = block.hash();
        if self.contains(&hash)? {
            return Ok(());
        }

        let mut children = self.children_of(&block.parent)?;
        children.insert(hash);

        self.db.write_ops(vec![
            WriteOp::put(Namespace::Block, hash.as_bytes().to_vec(), encode(block)?),
            WriteOp::put(
                Namespace::BlockToParent,
                hash.as_bytes().to_vec(),
                encode(&block.parent)?,
            ),
            WriteOp::put(
                Namespace::BlockToChildren,
                block.parent.as_bytes().to_vec(),
                encode(&children)?,
            ),
        ])
    }

    pub fn get(&self, hash: &Hash) -> Result<Option<Block>, StorageError> {
        match self.db.get(Namespace::Block, hash.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, hash: &Hash) -> Result<bool, StorageError> {
        self.db.contains(Namespace::Block, hash.as_bytes())
    }

    /// The recorded parent link of a block, absent for the current root.
    pub fn parent_of(&self, hash: &Hash) -> Result<Option<Hash>, StorageError> {
        match self.db.get(Namespace::BlockToParent, hash.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The recorded children of a block, empty when it has none.
    pub fn children_of(&self, hash: &Hash) -> Result<BTreeSet<Hash>, StorageError> {
        match self.db.get(Namespace::BlockToChildren, hash.as_bytes())? {
            Some(bytes) => Ok(decode(&bytes)?),
            None => Ok(BTreeSet::new()),
        }
    }

    /// Walk parent links from `hash` to the root and return the path in
    /// root-to-`hash` order. Fails with `Corruption` if any link points at
    /// a missing block.
    pub fn path_from_root(&self, hash: &Hash) -> Result<Vec<Hash>, StorageError> {
        if !self.contains(hash)? {
            return Err(StorageError::Corruption(format!(
                "block {hash} not found while walking to root"
            )));
        }

        let mut path = vec![*hash];
        let mut current = *hash;
        loop {
            match self.parent_of(&current)? {
                None => break,
                Some(parent) if parent == Hash::ZERO => break,
                Some(parent) => {
                    if !self.contains(&parent)? {
                        return Err(StorageError::Corruption(format!(
                            "parent chain broken at {parent}"
                        )));
                    }
                    path.push(parent);
                    current = parent;
                }
            }
        }
        path.reverse();
        Ok(path)
    }

    /// All blocks reachable from `root` through child links, `root`
    /// included.
    pub fn descendant_closure(&self, root: &Hash) -> Result<BTreeSet<Hash>, StorageError> {
        let mut closure = BTreeSet::new();
        let mut frontier = vec![*root];
        while let Some(hash) = frontier.pop() {
            if closure.insert(hash) {
                frontier.extend(self.children_of(&hash)?);
            }
        }
        Ok(closure)
    }

    /// Build the mutations that re-root the forest at `new_root`: every
    /// entry outside the descendant closure is deleted across all three
    /// namespaces, the closure's link to the old tree is severed
    /// (`new_root` loses its parent link, the old parent loses its child
    /// set).
    ///
    /// Exposed separately from [`prune_non_descendants`] so the pruner can
    /// commit these ops and the root-hash update in one atomic batch.
    ///
    /// [`prune_non_descendants`]: Self::prune_non_descendants
    pub fn prune_ops(&self, new_root: &Hash) -> Result<Vec<WriteOp>, StorageError> {
        let root_block = self.get(new_root)?.ok_or_else(|| {
            StorageError::Corruption(format!("new root {new_root} not found"))
        })?;
        let closure = self.descendant_closure(new_root)?;

        let mut ops = Vec::new();
        for ns in [
            Namespace::Block,
            Namespace::BlockToParent,
            Namespace::BlockToChildren,
        ] {
            for key in self.db.keys(ns)? {
                let hash = hash_from_key(&key)?;
                if !closure.contains(&hash) {
                    ops.push(WriteOp::delete(ns, key));
                }
            }
        }

        ops.push(WriteOp::delete(
            Namespace::BlockToChildren,
            root_block.parent.as_bytes().to_vec(),
        ));
        ops.push(WriteOp::delete(
            Namespace::BlockToParent,
            new_root.as_bytes().to_vec(),
        ));
        Ok(ops)
    }

    /// Delete everything outside the descendant closure of `new_root`.
    /// Afterwards the remaining forest is exactly the subtree rooted at
    /// `new_root`.
    pub fn prune_non_descendants(&self, new_root: &Hash) -> Result<(), StorageError> {
        let ops = self.prune_ops(new_root)?;
        debug!(new_root = %new_root, deletions = ops.len(), "pruning block store");
        self.db.write_ops(ops)
    }
}

fn hash_from_key(key: &[u8]) -> Result<Hash, StorageError> {
    let bytes: [u8; 32] = key
        .try_into()
        .map_err(|_| StorageError::Corruption(format!("malformed hash key of {} bytes", key.len())))?;
    Ok(Hash::from_bytes(bytes))
}
