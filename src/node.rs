//! Node assembly.
//!
//! Wires every subsystem together in dependency order: store (+ policy),
//! FSM, consensus runtime behind the demultiplexing listener, gateway, ring
//! and the two API servers. `main` and the integration tests both go
//! through [`launch`], so a test node is the real thing on ephemeral ports.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::api;
use crate::config::Config;
use crate::consensus::{self, CacheFsm, PeerRegistry, RaftConfig, RaftHandle};
use crate::gateway::{Consensus, Gateway, Storage};
use crate::metrics::Metrics;
use crate::ring::HashRing;
use crate::rpc;
use crate::store::{policy, spawn_sweeper, Store};

/// A running cache node.
pub struct Node {
    pub config: Config,
    pub store: Arc<Store>,
    pub gateway: Arc<Gateway>,
    pub raft: RaftHandle,
    pub metrics: Arc<Metrics>,
    /// Actual bound addresses (useful when configured with port 0).
    pub http_addr: SocketAddr,
    pub rpc_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Stops background tasks and the consensus runtime.
    pub async fn shutdown(self) {
        self.raft.shutdown().await;
        for task in self.tasks {
            task.abort();
        }
        info!("Node {} shut down", self.config.node_id);
    }
}

/// Builds and starts a node from its configuration.
pub async fn launch(config: Config) -> anyhow::Result<Node> {
    config.validate()?;

    // 1. Store and eviction policy. The policy only matters once a capacity
    //    bound exists.
    let mut store = Store::new().with_capacity(config.max_items);
    if config.max_items > 0 {
        if let Some(p) = policy::build(&config.eviction_policy) {
            store = store.with_policy(p);
        }
    }
    let store = Arc::new(store);
    let fsm = CacheFsm::new(store.clone());

    // 2. Consensus: demux listener in front of the runtime.
    let peers: PeerRegistry = Arc::new(DashMap::new());
    let raft_listener = TcpListener::bind(&config.raft_addr)
        .await
        .with_context(|| format!("failed to bind raft address {}", config.raft_addr))?;
    let (msg_tx, msg_rx) = mpsc::channel(1024);
    let mut tasks = Vec::new();
    tasks.push(crate::transport::spawn_listener(
        raft_listener,
        msg_tx,
        peers.clone(),
    ));

    let raft = consensus::spawn(
        RaftConfig {
            id: config.raft_id(),
            advertise_addr: config.advertise_addr(),
            data_dir: config.data_dir.clone(),
            bootstrap: config.bootstrap,
            snapshot_threshold: config.snapshot_threshold,
            verify_timeout: consensus::runtime::VERIFY_TIMEOUT,
        },
        fsm,
        peers,
        msg_rx,
    )?;

    // 3. Routing ring, metrics, gateway.
    let ring = Arc::new(HashRing::new(config.virtual_nodes));
    ring.add([config.node_id.clone()]);
    let metrics = Arc::new(Metrics::new());
    let storage: Arc<dyn Storage> = store.clone();
    let consensus: Arc<dyn Consensus> = Arc::new(raft.clone());
    let gateway = Arc::new(Gateway::new(
        storage,
        consensus,
        ring,
        metrics.clone(),
        config.consistency_mode(),
    ));

    // 4. Background sweep.
    tasks.push(spawn_sweeper(
        store.clone(),
        Duration::from_secs(config.sweep_interval_secs.max(1)),
    ));

    // 5. HTTP API.
    let http_listener = TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind http address {}", config.http_addr))?;
    let http_addr = http_listener.local_addr()?;
    let app = api::router(gateway.clone(), metrics.clone());
    tasks.push(tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, app).await {
            tracing::error!("HTTP server stopped: {}", e);
        }
    }));

    // 6. Binary RPC.
    let rpc_listener = TcpListener::bind(&config.rpc_addr)
        .await
        .with_context(|| format!("failed to bind rpc address {}", config.rpc_addr))?;
    let rpc_addr = rpc_listener.local_addr()?;
    tasks.push(rpc::spawn_server(rpc_listener, gateway.clone()));

    info!(
        "Node {} up (http {}, rpc {}, raft {})",
        config.node_id,
        http_addr,
        rpc_addr,
        config.raft_addr
    );

    // 7. Join an existing cluster if asked to.
    if let Some(join_addr) = &config.join {
        join_cluster(join_addr, &config.node_id, &config.advertise_addr()).await?;
    }

    Ok(Node {
        config,
        store,
        gateway,
        raft,
        metrics,
        http_addr,
        rpc_addr,
        tasks,
    })
}

/// Asks the leader at `join_addr` to admit this node as a voter.
///
/// Retries a few times because the target cluster may still be electing.
async fn join_cluster(join_addr: &str, node_id: &str, raft_addr: &str) -> anyhow::Result<()> {
    let url = format!(
        "http://{}/join?node_id={}&addr={}",
        join_addr, node_id, raft_addr
    );
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;

    let mut last_error = None;
    for attempt in 1..=5 {
        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                info!("Joined cluster via {}", join_addr);
                return Ok(());
            }
            Ok(response) => {
                last_error = Some(anyhow::anyhow!("join rejected: {}", response.status()));
            }
            Err(e) => {
                last_error = Some(e.into());
            }
        }
        tracing::warn!("Join attempt {} failed, retrying", attempt);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("join failed")))
}
