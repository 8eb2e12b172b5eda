//! Node configuration.
//!
//! All knobs come in as CLI flags. `validate` catches the combinations that
//! must fail fast: the process exits non-zero on any of them instead of
//! limping into a half-configured cluster.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;

use crate::consensus::node_raft_id;
use crate::gateway::ConsistencyMode;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "distributed-cache",
    about = "Raft-replicated in-memory key-value cache node"
)]
pub struct Config {
    /// Cluster-unique node identifier.
    #[arg(long, default_value = "node1")]
    pub node_id: String,

    /// HTTP API address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub http_addr: String,

    /// Binary RPC address.
    #[arg(long, default_value = "127.0.0.1:50051")]
    pub rpc_addr: String,

    /// Raft communication bind address.
    #[arg(long, default_value = "127.0.0.1:11000")]
    pub raft_addr: String,

    /// Raft address advertised to peers (defaults to the bind address).
    #[arg(long)]
    pub raft_advertise: Option<String>,

    /// Root directory for the consensus journal and snapshots.
    #[arg(long, default_value = "raft_data")]
    pub data_dir: PathBuf,

    /// Form a new cluster with only this node.
    #[arg(long, default_value_t = false)]
    pub bootstrap: bool,

    /// HTTP address of an existing leader to join.
    #[arg(long)]
    pub join: Option<String>,

    /// Maximum number of items in the cache (0 = unbounded).
    #[arg(long, default_value_t = 0)]
    pub max_items: usize,

    /// Eviction policy: lru, fifo, lfu, random, none.
    #[arg(long, default_value = "lru")]
    pub eviction_policy: String,

    /// Virtual nodes per physical node on the routing ring.
    #[arg(long, default_value_t = 100)]
    pub virtual_nodes: usize,

    /// Read consistency mode: strong, eventual.
    #[arg(long, default_value = "strong")]
    pub consistency: String,

    /// Seconds between expiration sweeps.
    #[arg(long, default_value_t = 1)]
    pub sweep_interval_secs: u64,

    /// Applied entries between state machine snapshots.
    #[arg(long, default_value_t = 1024)]
    pub snapshot_threshold: u64,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bootstrap && self.join.is_some() {
            bail!("--bootstrap and --join are mutually exclusive");
        }
        if self.node_id.is_empty() {
            bail!("--node-id must not be empty");
        }
        self.http_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid http_addr '{}'", self.http_addr))?;
        self.rpc_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid rpc_addr '{}'", self.rpc_addr))?;
        self.raft_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid raft_addr '{}'", self.raft_addr))?;
        if let Some(advertise) = &self.raft_advertise {
            advertise
                .parse::<SocketAddr>()
                .with_context(|| format!("invalid raft_advertise '{}'", advertise))?;
        }
        Ok(())
    }

    /// Numeric raft id derived from the node name.
    pub fn raft_id(&self) -> u64 {
        node_raft_id(&self.node_id)
    }

    /// The raft address peers should dial.
    pub fn advertise_addr(&self) -> String {
        self.raft_advertise
            .clone()
            .unwrap_or_else(|| self.raft_addr.clone())
    }

    pub fn consistency_mode(&self) -> ConsistencyMode {
        ConsistencyMode::parse(&self.consistency)
    }
}
