//! The acceptor half of a Paxos instance, ported from `acceptor.go`.

use crate::message::{Kind, Message};
use crate::{Ballot, InstanceId, NodeId};
use log::{debug, trace};
use std::collections::HashMap;

/// Promise/accept state for a single instance id, owned by an [`Acceptor`].
///
/// Invariant: `accept_ballot <= promised_ballot`.
#[derive(Debug, Default)]
pub struct AcceptorInstance {
    pub instance_id: InstanceId,
    pub promised_ballot: Ballot,
    pub accept_ballot: Ballot,
    pub accept_value: bytes::Bytes,
}

pub struct Acceptor {
    node_id: NodeId,
    instances: HashMap<InstanceId, AcceptorInstance>,
}

impl Acceptor {
    pub fn new(node_id: NodeId) -> Acceptor {
        Acceptor { node_id, instances: HashMap::new() }
    }

    #[cfg(test)]
    pub fn instance(&self, instance_id: InstanceId) -> Option<&AcceptorInstance> {
        self.instances.get(&instance_id)
    }

    /// Handles a `Prepare` message, replying with a passing or rejecting `Promised`.
    pub fn on_prepare(&mut self, msg: &Message) -> Message {
        let inst = self
            .instances
            .entry(msg.instance_id)
            .or_insert_with(|| AcceptorInstance { instance_id: msg.instance_id, ..Default::default() });

        let mut reply = Message {
            kind: Kind::Promised,
            from: self.node_id,
            instance_id: msg.instance_id,
            proposal_ballot: msg.proposal_ballot,
            reject_ballot: Ballot::NONE,
            accept_ballot: inst.accept_ballot,
            accept_value: inst.accept_value.clone(),
        };

        if msg.proposal_ballot > inst.promised_ballot {
            debug!(
                "acceptor {}: pass prepare from {} instance {} proposal {:?} promised {:?}",
                self.node_id, msg.from, msg.instance_id, msg.proposal_ballot, inst.promised_ballot
            );
            inst.promised_ballot = msg.proposal_ballot;
        } else {
            debug!(
                "acceptor {}: reject prepare from {} instance {} proposal {:?} promised {:?}",
                self.node_id, msg.from, msg.instance_id, msg.proposal_ballot, inst.promised_ballot
            );
            reply.reject_ballot = inst.promised_ballot;
        }

        reply
    }

    /// Handles a `Propose` message. Returns `None` if this acceptor has never seen
    /// the instance (a proposer must run Prepare first, modulo leader retention
    /// pre-creating the next instance on a passing Accept — see spec.md §9).
    pub fn on_accept(&mut self, msg: &Message) -> Option<Message> {
        let inst = self.instances.get_mut(&msg.instance_id)?;

        let mut reply = Message {
            kind: Kind::Accepted,
            from: self.node_id,
            instance_id: msg.instance_id,
            proposal_ballot: msg.proposal_ballot,
            reject_ballot: Ballot::NONE,
            accept_ballot: Ballot::NONE,
            accept_value: bytes::Bytes::new(),
        };

        if msg.proposal_ballot >= inst.promised_ballot {
            debug!(
                "acceptor {}: pass accept from {} instance {} proposal {:?} old {:?} new value",
                self.node_id, msg.from, msg.instance_id, msg.proposal_ballot, inst.accept_ballot
            );
            inst.accept_value = msg.accept_value.clone();
            inst.accept_ballot = msg.proposal_ballot;
            inst.promised_ballot = msg.proposal_ballot;

            reply.accept_ballot = inst.accept_ballot;
            reply.accept_value = inst.accept_value.clone();

            // Leader retention: pre-create instance+1 so a steady-state leader can
            // skip Prepare on its next round.
            let next_id = msg.instance_id + 1;
            self.instances.entry(next_id).or_insert_with(|| AcceptorInstance {
                instance_id: next_id,
                promised_ballot: msg.proposal_ballot,
                ..Default::default()
            });
        } else {
            trace!(
                "acceptor {}: reject accept from {} instance {} proposal {:?} promised {:?}",
                self.node_id, msg.from, msg.instance_id, msg.proposal_ballot, inst.promised_ballot
            );
            reply.reject_ballot = inst.promised_ballot;
        }

        Some(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn prepare(instance_id: InstanceId, ballot: Ballot) -> Message {
        Message {
            kind: Kind::Prepare,
            from: 9,
            instance_id,
            proposal_ballot: ballot,
            reject_ballot: Ballot::NONE,
            accept_ballot: Ballot::NONE,
            accept_value: Bytes::new(),
        }
    }

    fn propose(instance_id: InstanceId, ballot: Ballot, value: &'static str) -> Message {
        Message {
            kind: Kind::Propose,
            from: 9,
            instance_id,
            proposal_ballot: ballot,
            reject_ballot: Ballot::NONE,
            accept_ballot: Ballot::NONE,
            accept_value: Bytes::from_static(value.as_bytes()),
        }
    }

    #[test]
    fn prepare_uses_strict_greater_than() {
        let mut a = Acceptor::new(1);
        let reply = a.on_prepare(&prepare(1, Ballot::new(1, 9)));
        assert_eq!(reply.reject_ballot, Ballot::NONE);

        // equal ballot is rejected on Prepare (strict >)
        let reply2 = a.on_prepare(&prepare(1, Ballot::new(1, 9)));
        assert_eq!(reply2.reject_ballot, Ballot::new(1, 9));
    }

    #[test]
    fn accept_uses_greater_or_equal() {
        let mut a = Acceptor::new(1);
        a.on_prepare(&prepare(1, Ballot::new(1, 9)));

        // equal ballot is accepted on Accept (>=)
        let reply = a.on_accept(&propose(1, Ballot::new(1, 9), "v1")).unwrap();
        assert_eq!(reply.reject_ballot, Ballot::NONE);
        assert_eq!(reply.accept_value, Bytes::from_static(b"v1"));
    }

    #[test]
    fn accept_without_prior_prepare_is_dropped() {
        let mut a = Acceptor::new(1);
        assert!(a.on_accept(&propose(5, Ballot::new(1, 9), "v1")).is_none());
    }

    #[test]
    fn leader_retention_preactivates_the_next_instance() {
        let mut a = Acceptor::new(1);
        a.on_prepare(&prepare(1, Ballot::new(1, 9)));
        a.on_accept(&propose(1, Ballot::new(1, 9), "v1")).unwrap();

        let next = a.instance(2).expect("instance 2 pre-created");
        assert_eq!(next.promised_ballot, Ballot::new(1, 9));

        // the acceptor can now accept instance 2 without a Prepare first
        let reply = a.on_accept(&propose(2, Ballot::new(1, 9), "v2")).unwrap();
        assert_eq!(reply.reject_ballot, Ballot::NONE);
    }

    #[test]
    fn lower_ballot_is_rejected_and_carries_promised_ballot() {
        let mut a = Acceptor::new(1);
        a.on_prepare(&prepare(1, Ballot::new(5, 9)));
        let reply = a.on_prepare(&prepare(1, Ballot::new(2, 9)));
        assert_eq!(reply.reject_ballot, Ballot::new(5, 9));
    }
}
