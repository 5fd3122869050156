//! In-memory backing store.
//!
//! Requests are treated as keys. A query is answered one poll later with the
//! record stored under its key, or an empty reply when there is none.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tessera_env::{EnvError, NodeId, QueryId, Storage};
use tracing::trace;

#[derive(Debug, Default)]
struct Records {
    by_key: HashMap<Vec<u8>, Vec<u8>>,
    writes: u64,
}

/// Per-node handle on a store shared by the whole world.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    node: NodeId,
    next: u64,
    records: Arc<Mutex<Records>>,
    /// Outstanding queries and the key they asked for
    open: BTreeMap<QueryId, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            next: 1,
            records: Arc::new(Mutex::new(Records::default())),
            open: BTreeMap::new(),
        }
    }

    /// A handle for `node` over the same records.
    pub fn for_node(&self, node: NodeId) -> Self {
        Self {
            node,
            next: 1,
            records: self.records.clone(),
            open: BTreeMap::new(),
        }
    }

    fn records(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn put(&self, key: &[u8], value: &[u8]) {
        let mut records = self.records();
        records.by_key.insert(key.to_vec(), value.to_vec());
        records.writes += 1;
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.records().by_key.get(key).cloned()
    }

    pub fn writes(&self) -> u64 {
        self.records().writes
    }
}

impl Storage for MemoryStorage {
    fn query(&mut self, request: &[u8]) -> QueryId {
        let query = QueryId((self.node.as_u64() << 16) + self.next);
        self.next += 1;
        trace!("{} queries storage ({} bytes) as {}", self.node, request.len(), query);
        self.open.insert(query, request.to_vec());
        query
    }

    fn respond(&mut self, query: QueryId, reply: &[u8]) -> Result<(), EnvError> {
        let key = match self.open.get(&query) {
            Some(key) => key.clone(),
            None => return Err(EnvError::storage(format!("no open query {}", query))),
        };
        self.put(&key, reply);
        Ok(())
    }

    fn poll_replies(&mut self) -> Vec<(QueryId, Vec<u8>)> {
        std::mem::take(&mut self.open)
            .into_iter()
            .map(|(id, key)| {
                let reply = self.get(&key).unwrap_or_default();
                (id, reply)
            })
            .collect()
    }
}
