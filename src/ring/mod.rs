//! Consistent-Hash Ring
//!
//! Maps keys to node identifiers for partition routing hints. Each physical
//! node is hashed onto the ring `virtual_nodes` times to smooth the
//! distribution; a key is owned by the first entry whose hash is >= the
//! key's hash, wrapping around to the smallest entry.
//!
//! The hash is CRC32, which is stable across processes and platforms, so
//! every node computes the same ownership independently.

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

/// Default virtual-node factor. Low factors produce large gaps and
/// pronounced skew between nodes.
pub const DEFAULT_VIRTUAL_NODES: usize = 100;

struct RingState {
    /// (hash, node id) pairs sorted by hash.
    entries: Vec<(u32, String)>,
    nodes: HashSet<String>,
}

/// Thread-safe consistent-hash ring with virtual-node replication.
pub struct HashRing {
    state: RwLock<RingState>,
    virtual_nodes: usize,
}

impl HashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            state: RwLock::new(RingState {
                entries: Vec::new(),
                nodes: HashSet::new(),
            }),
            virtual_nodes: virtual_nodes.max(1),
        }
    }

    /// Adds physical nodes to the ring. Re-adding a known node is a no-op.
    pub fn add<I, S>(&self, nodes: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        for node in nodes {
            let node = node.as_ref();
            if !state.nodes.insert(node.to_string()) {
                continue;
            }
            for v in 0..self.virtual_nodes {
                let hash = crc32fast::hash(format!("{}{}", v, node).as_bytes());
                state.entries.push((hash, node.to_string()));
            }
        }
        state.entries.sort_unstable();
    }

    /// Removes a node and all of its virtual entries.
    pub fn remove(&self, node: &str) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if !state.nodes.remove(node) {
            return;
        }
        state.entries.retain(|(_, owner)| owner != node);
    }

    /// Returns the node that owns `key`, or `None` when the ring is empty.
    pub fn get(&self, key: &str) -> Option<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if state.entries.is_empty() {
            return None;
        }

        let hash = crc32fast::hash(key.as_bytes());
        let idx = state.entries.partition_point(|(h, _)| *h < hash);
        let idx = if idx == state.entries.len() { 0 } else { idx };
        Some(state.entries[idx].1.clone())
    }

    /// Physical nodes currently on the ring.
    pub fn nodes(&self) -> Vec<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.nodes.iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes
            .is_empty()
    }
}
