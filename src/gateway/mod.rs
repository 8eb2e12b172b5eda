//! Request Gateway
//!
//! Orchestrates the storage (read) and consensus (write) layers behind one
//! service surface shared by the HTTP and binary RPC translators.
//!
//! - **Writes** encode a command and submit it to consensus; commit precedes
//!   return, so writes are strongly consistent.
//! - **Reads** are tunable: strong mode verifies leadership first (a
//!   partitioned zombie leader fails verification rather than serving stale
//!   data), eventual mode reads local state immediately.
//! - **Coalescing**: concurrent reads of the same key collapse into one
//!   store lookup, defeating thundering herds on hot keys.

pub mod single_flight;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::consensus::{node_raft_id, Command, RaftHandle};
use crate::error::{CacheError, Result};
use crate::metrics::Metrics;
use crate::ring::HashRing;
use crate::store::Store;
use self::single_flight::SingleFlight;

/// Read-path consistency level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyMode {
    /// Verify leadership before serving (linearizable).
    Strong,
    /// Serve local state immediately; any node may answer, reads may lag.
    Eventual,
}

impl ConsistencyMode {
    /// Parses the configured mode, defaulting to strong on unknown input.
    pub fn parse(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "strong" => ConsistencyMode::Strong,
            "eventual" => ConsistencyMode::Eventual,
            other => {
                tracing::warn!("Unknown consistency mode '{}', defaulting to strong", other);
                ConsistencyMode::Strong
            }
        }
    }
}

/// Local data access as the gateway sees it.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str, ttl: Duration);
    fn delete(&self, key: &str);
}

impl Storage for Store {
    fn get(&self, key: &str) -> Option<String> {
        Store::get(self, key)
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) {
        Store::set(self, key, value, ttl)
    }

    fn delete(&self, key: &str) {
        Store::delete(self, key)
    }
}

/// Distributed agreement as the gateway sees it.
#[async_trait]
pub trait Consensus: Send + Sync {
    async fn submit(&self, data: Vec<u8>) -> Result<()>;
    async fn verify_leader(&self) -> Result<()>;
    async fn add_voter(&self, node_id: &str, addr: &str) -> Result<()>;
    async fn is_leader(&self) -> bool;
}

#[async_trait]
impl Consensus for RaftHandle {
    async fn submit(&self, data: Vec<u8>) -> Result<()> {
        RaftHandle::submit(self, data).await
    }

    async fn verify_leader(&self) -> Result<()> {
        RaftHandle::verify_leader(self).await
    }

    async fn add_voter(&self, node_id: &str, addr: &str) -> Result<()> {
        RaftHandle::add_voter(self, node_raft_id(node_id), addr).await
    }

    async fn is_leader(&self) -> bool {
        RaftHandle::is_leader(self).await
    }
}

pub struct Gateway {
    storage: Arc<dyn Storage>,
    consensus: Arc<dyn Consensus>,
    ring: Arc<HashRing>,
    metrics: Arc<Metrics>,
    flights: SingleFlight<Option<String>>,
    consistency: ConsistencyMode,
}

impl Gateway {
    pub fn new(
        storage: Arc<dyn Storage>,
        consensus: Arc<dyn Consensus>,
        ring: Arc<HashRing>,
        metrics: Arc<Metrics>,
        consistency: ConsistencyMode,
    ) -> Self {
        Self {
            storage,
            consensus,
            ring,
            metrics,
            flights: SingleFlight::new(),
            consistency,
        }
    }

    /// Reads `key` at the configured consistency level.
    ///
    /// Strong mode surfaces a verification failure as [`CacheError::Consistency`],
    /// distinct from not-found. Concurrent reads for the same key coalesce
    /// into a single store lookup whose outcome (value or not-found) is
    /// shared by every waiter.
    pub async fn get(&self, key: &str) -> Result<String> {
        let start = Instant::now();

        if self.consistency == ConsistencyMode::Strong {
            if let Err(e) = self.consensus.verify_leader().await {
                self.metrics.record_get_error();
                self.metrics.get_latency.observe(start.elapsed());
                return Err(CacheError::Consistency(e.to_string()));
            }
        }

        let storage = self.storage.clone();
        let owned_key = key.to_string();
        let outcome = self
            .flights
            .run(key, || async move { storage.get(&owned_key) })
            .await;
        self.metrics.get_latency.observe(start.elapsed());

        match outcome {
            Some(value) => {
                self.metrics.record_get_hit();
                Ok(value)
            }
            None => {
                self.metrics.record_get_miss();
                Err(CacheError::NotFound)
            }
        }
    }

    /// Replicates a set through consensus. Submit errors propagate unchanged
    /// so callers can decide between redirect, retry and failure.
    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let start = Instant::now();
        let result = async {
            let data = Command::set(key, value, ttl).encode()?;
            self.consensus.submit(data).await
        }
        .await;
        self.metrics.set_latency.observe(start.elapsed());
        self.metrics.record_set(result.is_ok());
        result
    }

    /// Replicates a delete through consensus.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let start = Instant::now();
        let result = async {
            let data = Command::delete(key).encode()?;
            self.consensus.submit(data).await
        }
        .await;
        self.metrics.delete_latency.observe(start.elapsed());
        self.metrics.record_delete(result.is_ok());
        result
    }

    /// Admits a node to the cluster and records it on the routing ring.
    pub async fn join(&self, node_id: &str, addr: &str) -> Result<()> {
        self.consensus.add_voter(node_id, addr).await?;
        self.ring.add([node_id]);
        tracing::info!("Node {} joined via {}", node_id, addr);
        Ok(())
    }

    /// Routing hint: which node the ring assigns `key` to.
    pub fn locate(&self, key: &str) -> Option<String> {
        self.ring.get(key)
    }
}
