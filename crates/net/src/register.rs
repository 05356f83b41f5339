//! The connections register.

use crate::provider::Connection;
use gridbot_types::PeerKey;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

/// In-memory map of peer key to live connection.
///
/// The register holds at most one entry per key. It is the only state
/// shared between the dialer, acceptor, and multiplexer loops; both
/// operations below are atomic and non-suspending.
#[derive(Default)]
pub struct ConnectionsRegister {
    inner: Mutex<HashMap<PeerKey, Arc<Connection>>>,
}

impl ConnectionsRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `conn` keyed by its remote key unless an entry already
    /// exists; returns the incumbent on conflict. The caller must close
    /// the newly arrived connection when a conflict is reported.
    pub fn register_if_absent(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let mut map = self.inner.lock();
        match map.entry(*conn.remote_key()) {
            Entry::Occupied(existing) => Some(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(conn);
                None
            }
        }
    }

    /// Remove the entry for `conn`'s key, but only if the registered
    /// connection is identity-equal to `conn`.
    pub fn deregister(&self, conn: &Arc<Connection>) {
        let mut map = self.inner.lock();
        if let Some(current) = map.get(conn.remote_key()) {
            if Arc::ptr_eq(current, conn) {
                map.remove(conn.remote_key());
            }
        }
    }

    pub fn get(&self, key: &PeerKey) -> Option<Arc<Connection>> {
        self.inner.lock().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<PeerKey> {
        self.inner.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
