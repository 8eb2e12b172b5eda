//! Shared fixtures for the end-to-end tests.

use std::path::Path;
use std::time::Duration;

use distributed_cache::{Config, Node};

/// Reserves an ephemeral loopback address.
///
/// Binds port 0, records the assigned port and releases it; the window
/// between release and reuse is small enough for test purposes.
pub fn free_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    addr.to_string()
}

pub fn node_config(node_id: &str, data_dir: &Path) -> Config {
    use clap::Parser;
    let mut config = Config::parse_from(["distributed-cache"]);
    config.node_id = node_id.to_string();
    config.http_addr = free_addr();
    config.rpc_addr = free_addr();
    config.raft_addr = free_addr();
    config.data_dir = data_dir.to_path_buf();
    config
}

/// Polls until the node reports leadership.
pub async fn wait_for_leadership(node: &Node) {
    for _ in 0..200 {
        if node.raft.is_leader().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("node {} never became leader", node.config.node_id);
}
