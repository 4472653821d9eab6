//! Reference wiring for a single cluster node. Reads a small TOML config, starts
//! a `Node`, and exercises a handful of `KvService` operations.
//!
//! ```text
//! cargo run --example node -- ./demos/node1.toml
//! ```

use paxos_kv::config::Configuration;
use paxos_kv::kv::{KeyValueStore, KvService};
use paxos_kv::node::Node;
use paxos_kv::statemachine::StateMachine;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Deserialize)]
struct TomlConfig {
    node_id: u32,
    listen_addr: SocketAddr,
    peers: HashMap<String, SocketAddr>,
    #[serde(default = "default_group_count")]
    group_count: usize,
}

fn default_group_count() -> usize {
    1
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "./demos/node1.toml".to_string());
    let raw = std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("can't read {}: {}", path, e));
    let toml_cfg: TomlConfig = toml::from_str(&raw).unwrap_or_else(|e| panic!("invalid config {}: {}", path, e));

    let peers = toml_cfg.peers.into_iter().map(|(id, addr)| (id.parse().expect("peer id must be numeric"), addr)).collect();
    let config = Configuration::new(toml_cfg.node_id, toml_cfg.listen_addr, peers, toml_cfg.group_count);

    let store = Arc::new(KeyValueStore::new());
    let node = Node::start(&config, store.clone() as Arc<dyn StateMachine>)
        .await
        .unwrap_or_else(|e| panic!("failed to start node: {}", e));

    let service = KvService::new(node.groups().to_vec(), store);

    match service.set("hello", "world", 0).await {
        Ok((value, version)) => log::info!("Set hello -> ({}, {})", value, version),
        Err(e) => log::warn!("Set failed: {}", e),
    }

    match service.get_global("hello").await {
        Ok((value, version)) => log::info!("GetGlobal hello -> ({}, {})", value, version),
        Err(e) => log::warn!("GetGlobal failed: {}", e),
    }

    log::info!("node {} serving {} group(s); GetLocal hello -> {:?}", node.node_id(), node.group_count(), service.get_local("hello"));

    // keep the process alive so peers can keep dialing us.
    std::future::pending::<()>().await;
}
