//! In-process cluster configuration. Deliberately not tied to any file format —
//! the XML loader named out of scope in spec.md §1 lived at this boundary in the
//! original and stays out here too; callers build a `Configuration` however they
//! like (`demos/node.rs` reads a small TOML file; tests build one by hand).

use crate::NodeId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct Configuration {
    pub node_id: NodeId,
    pub listen_addr: SocketAddr,
    pub peers: HashMap<NodeId, SocketAddr>,
    pub group_count: usize,
    pub commit_timeout: Duration,
}

impl Configuration {
    pub fn new(node_id: NodeId, listen_addr: SocketAddr, peers: HashMap<NodeId, SocketAddr>, group_count: usize) -> Configuration {
        Configuration { node_id, listen_addr, peers, group_count, commit_timeout: DEFAULT_COMMIT_TIMEOUT }
    }

    pub fn with_commit_timeout(mut self, timeout: Duration) -> Configuration {
        self.commit_timeout = timeout;
        self
    }

    pub fn node_count(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn quorum_size(&self) -> usize {
        self.node_count() / 2 + 1
    }

    /// Each `InstanceGroup` runs its own `TcpTransport`, since the wire frame
    /// carries no group identifier (see SPEC_FULL.md's routing note). Per-group
    /// listen and peer addresses are derived by offsetting the configured port by
    /// group index.
    pub fn group_listen_addr(&self, group_id: usize) -> SocketAddr {
        offset_port(self.listen_addr, group_id)
    }

    pub fn group_peer_addrs(&self, group_id: usize) -> HashMap<NodeId, SocketAddr> {
        self.peers.iter().map(|(&id, &addr)| (id, offset_port(addr, group_id))).collect()
    }
}

fn offset_port(addr: SocketAddr, group_id: usize) -> SocketAddr {
    let mut addr = addr;
    addr.set_port(addr.port() + group_id as u16);
    addr
}
