//! Bounded ring of application-state snapshots.

use crate::db::{decode, encode, Database, Namespace, StorageError, WriteOp};
use gridbot_types::{Hash, RobotState};
use std::collections::VecDeque;
use std::sync::Arc;

const RING_KEY: &[u8] = b"ring";

/// Fixed-capacity FIFO over `State` snapshots keyed by block hash.
///
/// The insertion order lives in `StateMeta`; exceeding capacity evicts the
/// strictly oldest entry. The genesis snapshot is written directly to the
/// `State` namespace, bypassing the ring, so it is never evicted.
pub struct StateRing {
    db: Arc<Database>,
    capacity: usize,
}

impl StateRing {
    pub fn new(db: Arc<Database>, capacity: usize) -> Self {
        StateRing { db, capacity }
    }

    /// Insert a snapshot, evicting the oldest entry once the ring is over
    /// capacity. Re-inserting a hash already in the ring only refreshes
    /// its snapshot.
    pub fn put(&self, hash: Hash, snapshot: &RobotState) -> Result<(), StorageError> {
        let mut ring = self.ring()?;
        let mut ops = vec![WriteOp::put(
            Namespace::State,
            hash.as_bytes().to_vec(),
            encode(snapshot)?,
        )];

        if !ring.contains(&hash) {
            ring.push_back(hash);
        }
        while ring.len() > self.capacity {
            // Unwrap is fine: the loop condition guarantees an element.
            let evicted = ring.pop_front().expect("ring is non-empty");
            ops.push(WriteOp::delete(Namespace::State, evicted.as_bytes().to_vec()));
        }

        ops.push(WriteOp::put(
            Namespace::StateMeta,
            RING_KEY.to_vec(),
            encode(&ring)?,
        ));
        self.db.write_ops(ops)
    }

    pub fn get(&self, hash: &Hash) -> Result<Option<RobotState>, StorageError> {
        match self.db.get(Namespace::State, hash.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write the genesis snapshot outside the ring.
    pub fn put_genesis(&self, hash: Hash, snapshot: &RobotState) -> Result<(), StorageError> {
        self.db.write_ops(vec![WriteOp::put(
            Namespace::State,
            hash.as_bytes().to_vec(),
            encode(snapshot)?,
        )])
    }

    fn ring(&self) -> Result<VecDeque<Hash>, StorageError> {
        match self.db.get(Namespace::StateMeta, RING_KEY)? {
            Some(bytes) => decode(&bytes),
            None => Ok(VecDeque::new()),
        }
    }
}
