//! A node hosting one or more instance groups, ported from `node.go`.

use crate::config::Configuration;
use crate::error::PaxosError;
use crate::group::{GroupHandle, InstanceGroup};
use crate::statemachine::StateMachine;
use crate::transport::TcpTransport;
use crate::NodeId;
use std::sync::Arc;

pub struct Node {
    node_id: NodeId,
    groups: Vec<GroupHandle>,
}

impl Node {
    /// Binds a `TcpTransport` per group (see `Configuration::group_listen_addr`),
    /// spawns each group's event loop, and returns once every listener is bound.
    /// `sm` is cloned once per shard's `InstanceGroup`, matching `kv_service.go`'s
    /// single `storage` map shared across all `instanceGroups`: every shard's
    /// learner applies into the *same* underlying `StateMachine`, which is what
    /// lets `KvService::get_local`/`get_global` see every shard's writes. Taking
    /// the `Arc` directly (rather than a per-group factory closure) makes that
    /// sharing structural instead of a caller convention to get right.
    pub async fn start(config: &Configuration, sm: Arc<dyn StateMachine>) -> Result<Node, PaxosError> {
        let mut groups = Vec::with_capacity(config.group_count);
        for group_id in 0..config.group_count {
            let listen_addr = config.group_listen_addr(group_id);
            let peer_addrs = config.group_peer_addrs(group_id);
            let transport = TcpTransport::bind(config.node_id, listen_addr, peer_addrs).await?;
            let (group, handle) = InstanceGroup::new(transport, config.node_count(), sm.clone(), config.commit_timeout);
            tokio::spawn(group.run());
            groups.push(handle);
        }

        Ok(Node { node_id: config.node_id, groups })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn group(&self, group_id: usize) -> &GroupHandle {
        &self.groups[group_id]
    }

    pub fn groups(&self) -> &[GroupHandle] {
        &self.groups
    }
}
