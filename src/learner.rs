//! The learner half of a Paxos instance, ported from `learner.go`.
//!
//! Owns `next_instance_id`: the one contiguous-prefix cursor the rest of the group
//! reads (`Proposer::update`) but only the learner ever advances.

use crate::message::{Kind, Message};
use crate::statemachine::StateMachine;
use crate::{InstanceId, NodeId};
use bytes::Bytes;
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;

pub struct LearnerInstance {
    pub instance_id: InstanceId,
    pub accept_value: Bytes,
}

pub struct Learner {
    node_id: NodeId,
    instances: HashMap<InstanceId, LearnerInstance>,
    next_instance_id: InstanceId,
    sm: Arc<dyn StateMachine>,
}

impl Learner {
    pub fn new(node_id: NodeId, sm: Arc<dyn StateMachine>) -> Learner {
        Learner { node_id, instances: HashMap::new(), next_instance_id: 1, sm }
    }

    pub fn next_instance_id(&self) -> InstanceId {
        self.next_instance_id
    }

    /// Builds the `PushLearn` to broadcast (to peers, not self) and applies the
    /// value locally, returning the state machine's output for the waiting
    /// submitter. If this node's own cursor has somehow drifted past or behind
    /// `instance_id` the local apply is skipped and an empty result is returned —
    /// this mirrors `leanValue`'s gap handling in the Go original.
    pub fn on_value_closed(&mut self, instance_id: InstanceId, value: Bytes) -> (Message, Vec<u8>) {
        let push = Message {
            kind: Kind::PushLearn,
            from: self.node_id,
            instance_id,
            proposal_ballot: crate::Ballot::NONE,
            reject_ballot: crate::Ballot::NONE,
            accept_ballot: crate::Ballot::NONE,
            accept_value: value.clone(),
        };
        let result = self.lean_value(&push).unwrap_or_default();
        (push, result)
    }

    /// Applies `m.accept_value` for `m.instance_id` if it extends the learned
    /// prefix by exactly one; otherwise drops it as a gap or duplicate.
    pub fn lean_value(&mut self, m: &Message) -> Option<Vec<u8>> {
        if self.next_instance_id != m.instance_id {
            return None;
        }

        self.next_instance_id += 1;
        self.instances.insert(m.instance_id, LearnerInstance { instance_id: m.instance_id, accept_value: m.accept_value.clone() });

        let result = self.sm.apply(&m.accept_value);
        debug!("learner {}: learned instance {} value_len {}", self.node_id, m.instance_id, m.accept_value.len());
        Some(result)
    }

    pub fn on_pull_learn_request(&self, msg: &Message) -> Option<Message> {
        if self.next_instance_id <= msg.instance_id {
            return None;
        }
        let inst = self.instances.get(&msg.instance_id)?;
        Some(Message {
            kind: Kind::PullLearnResponse,
            from: self.node_id,
            instance_id: inst.instance_id,
            proposal_ballot: crate::Ballot::NONE,
            reject_ballot: crate::Ballot::NONE,
            accept_ballot: crate::Ballot::NONE,
            accept_value: inst.accept_value.clone(),
        })
    }

    pub fn on_pull_learn_response(&mut self, msg: &Message) {
        self.lean_value(msg);
    }

    /// The periodic catch-up tick: ask peers for whatever this node is missing next.
    pub fn check_learn(&self) -> Message {
        Message {
            kind: Kind::PullLearnRequest,
            from: self.node_id,
            instance_id: self.next_instance_id,
            proposal_ballot: crate::Ballot::NONE,
            reject_ballot: crate::Ballot::NONE,
            accept_ballot: crate::Ballot::NONE,
            accept_value: Bytes::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct EchoSm(Mutex<Vec<Vec<u8>>>);
    impl StateMachine for EchoSm {
        fn apply(&self, blob: &[u8]) -> Vec<u8> {
            self.0.lock().unwrap().push(blob.to_vec());
            blob.to_vec()
        }
    }

    fn push(instance_id: InstanceId, value: &'static str) -> Message {
        Message {
            kind: Kind::PushLearn,
            from: 2,
            instance_id,
            proposal_ballot: crate::Ballot::NONE,
            reject_ballot: crate::Ballot::NONE,
            accept_ballot: crate::Ballot::NONE,
            accept_value: Bytes::from_static(value.as_bytes()),
        }
    }

    #[test]
    fn learns_contiguous_values_in_order() {
        let sm = Arc::new(EchoSm(Mutex::new(Vec::new())));
        let mut l = Learner::new(1, sm);
        assert_eq!(l.lean_value(&push(1, "a")).unwrap(), b"a");
        assert_eq!(l.next_instance_id(), 2);
        assert_eq!(l.lean_value(&push(2, "b")).unwrap(), b"b");
        assert_eq!(l.next_instance_id(), 3);
    }

    #[test]
    fn drops_gaps_and_duplicates() {
        let sm = Arc::new(EchoSm(Mutex::new(Vec::new())));
        let mut l = Learner::new(1, sm);
        assert!(l.lean_value(&push(2, "b")).is_none(), "gap: instance 1 not yet learned");
        assert!(l.lean_value(&push(1, "a")).is_some());
        assert!(l.lean_value(&push(1, "a")).is_none(), "duplicate");
    }

    #[test]
    fn pull_request_answered_only_when_we_know_more_than_the_requester() {
        let sm = Arc::new(EchoSm(Mutex::new(Vec::new())));
        let mut l = Learner::new(1, sm);
        l.lean_value(&push(1, "a"));

        // requester lacks instance 1, which we have recorded: answer it.
        let req_behind = Message { kind: Kind::PullLearnRequest, instance_id: 1, ..push(0, "") };
        let reply = l.on_pull_learn_request(&req_behind).expect("we know instance 1");
        assert_eq!(reply.accept_value, Bytes::from_static(b"a"));

        // requester asks for something in the future: nothing to send.
        let req_future = Message { kind: Kind::PullLearnRequest, instance_id: 5, ..push(0, "") };
        assert!(l.on_pull_learn_request(&req_future).is_none());
    }

    #[test]
    fn on_value_closed_broadcasts_and_applies_locally() {
        let sm = Arc::new(EchoSm(Mutex::new(Vec::new())));
        let mut l = Learner::new(1, sm);
        let (msg, result) = l.on_value_closed(1, Bytes::from_static(b"v1"));
        assert_eq!(msg.kind, Kind::PushLearn);
        assert_eq!(result, b"v1");
        assert_eq!(l.next_instance_id(), 2);
    }
}
