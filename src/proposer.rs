//! The proposer half of a Paxos instance, ported from `proposer.go`.
//!
//! The Go original shares `commitValue`/`hasNewCommitValue`/`resultChan` between a
//! `commit()` caller and the event-loop goroutine via two mutexes. Here that becomes a
//! single-slot `oneshot::Sender` filled by [`Proposer::submit`] (invoked by the event
//! loop after it dequeues a [`crate::group::ProposeRequest`]) and drained by
//! [`Proposer::on_accepted`] once this node's own value is chosen. The FIFO ordering
//! of concurrent submitters is enforced by the caller (`GroupHandle::commit`'s
//! `tokio::sync::Mutex`), not by this type.

use crate::counter::Counter;
use crate::message::{Kind, Message};
use crate::timer::TimerId;
use crate::{Ballot, InstanceId, NodeId};
use bytes::Bytes;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProposerState {
    None,
    Preparing,
    Accepting,
    Chosen,
}

pub struct ProposerInstance {
    pub instance_id: InstanceId,
    pub state: ProposerState,
    pub proposal_ballot: Ballot,
    pub accept_value: Bytes,
    pub accept_ballot: Ballot,
    pub counter: Counter,
}

/// Side effects a proposer transition wants carried out: a value to broadcast
/// (including to self, per spec.md §4.3) and timers to arm/cancel.
#[derive(Default)]
pub struct Effects {
    pub broadcast: Option<Message>,
    pub arm: Vec<(TimerId, Duration)>,
    pub cancel: Vec<TimerId>,
}

pub enum AcceptedOutcome {
    Unresolved(Effects),
    /// The instance reached `Chosen`. The caller must hand `value` to the learner
    /// (`Learner::on_value_closed`) and, if `own_value`, deliver the learner's apply
    /// result to the waiting submitter via [`Proposer::deliver_result`] and call
    /// [`Proposer::retain_leadership`]; otherwise call [`Proposer::clear_leadership`]
    /// and re-run [`Proposer::update`] with `init=false`.
    Chosen { instance_id: InstanceId, value: Bytes, own_value: bool, proposal_ballot: Ballot },
}

pub struct Timeouts {
    pub promised: Duration,
    pub accepted: Duration,
}

impl Default for Timeouts {
    fn default() -> Timeouts {
        Timeouts { promised: Duration::from_secs(2), accepted: Duration::from_secs(2) }
    }
}

pub struct Proposer {
    node_id: NodeId,
    node_count: usize,
    sequence: u16,
    multi_proposal_ballot: Ballot,
    commit_value: Bytes,
    has_new_commit_value: bool,
    pending_result: Option<oneshot::Sender<Bytes>>,
    work_instance_id: InstanceId,
    instances: HashMap<InstanceId, ProposerInstance>,
    timeouts: Timeouts,
}

impl Proposer {
    pub fn new(node_id: NodeId, node_count: usize) -> Proposer {
        Proposer::with_timeouts(node_id, node_count, Timeouts::default())
    }

    pub fn with_timeouts(node_id: NodeId, node_count: usize, timeouts: Timeouts) -> Proposer {
        Proposer {
            node_id,
            node_count,
            sequence: 0,
            multi_proposal_ballot: Ballot::NONE,
            commit_value: Bytes::new(),
            has_new_commit_value: false,
            pending_result: None,
            work_instance_id: 0,
            instances: HashMap::new(),
            timeouts,
        }
    }

    pub fn is_leader(&self) -> bool {
        !self.multi_proposal_ballot.is_none()
    }

    /// Publishes a client value for the next round. Called by the event loop after
    /// it pulls a commit request off its queue. Overwrites any previous unconsumed
    /// submission; this is only safe because `GroupHandle::commit` holds its FIFO
    /// permit until the round it started actually resolves (not merely until its
    /// own `commit_timeout` elapses), so a still-unresolved round's `pending_result`
    /// is never silently clobbered by the next submitter.
    pub fn submit(&mut self, value: Bytes, reply: oneshot::Sender<Bytes>) {
        self.commit_value = value;
        self.has_new_commit_value = true;
        self.pending_result = Some(reply);
    }

    fn deliver_result(&mut self, value: Bytes) {
        if let Some(reply) = self.pending_result.take() {
            let _ = reply.send(value);
        }
    }

    pub fn retain_leadership(&mut self, ballot: Ballot) {
        self.multi_proposal_ballot = ballot;
    }

    pub fn clear_leadership(&mut self) {
        self.multi_proposal_ballot = Ballot::NONE;
    }

    pub fn deliver_chosen_result(&mut self, value: Bytes) {
        self.deliver_result(value);
    }

    /// Starts a new round for `next_instance_id` if a client value is pending (or
    /// unconditionally when `init` is false, i.e. called recursively after a round
    /// resolved to someone else's value). Mirrors `proposer.update`.
    pub fn update(&mut self, init: bool, next_instance_id: InstanceId) -> Option<Effects> {
        if init {
            if !self.has_new_commit_value {
                return None;
            }
            self.has_new_commit_value = false;
        }

        let mut inst = ProposerInstance {
            instance_id: next_instance_id,
            state: ProposerState::None,
            proposal_ballot: Ballot::new(1, self.node_id),
            accept_value: Bytes::new(),
            accept_ballot: Ballot::NONE,
            counter: Counter::new(self.node_count),
        };
        self.work_instance_id = next_instance_id;

        let effects = if !self.multi_proposal_ballot.is_none() {
            inst.proposal_ballot = self.multi_proposal_ballot;
            inst.accept_value = self.commit_value.clone();
            self.instances.insert(next_instance_id, inst);
            self.accept(next_instance_id)
        } else {
            self.instances.insert(next_instance_id, inst);
            self.prepare(next_instance_id)
        };

        Some(effects)
    }

    fn gen_proposal_id(&mut self, max_reject_ballot: Ballot) -> Ballot {
        let mut sequence = max_reject_ballot.sequence();
        if sequence < self.sequence {
            sequence = self.sequence;
        }
        sequence += 1;
        self.sequence = sequence;
        Ballot::new(self.sequence, self.node_id)
    }

    pub fn prepare(&mut self, instance_id: InstanceId) -> Effects {
        let max_reject = {
            let inst = self.instances.get(&instance_id).expect("prepare on unknown instance");
            inst.counter.max_reject_ballot()
        };
        let proposal_ballot = self.gen_proposal_id(max_reject);

        let inst = self.instances.get_mut(&instance_id).expect("prepare on unknown instance");
        inst.counter.start_new_round();
        inst.accept_ballot = Ballot::NONE;
        inst.proposal_ballot = proposal_ballot;
        inst.state = ProposerState::Preparing;

        info!("proposer {}: start prepare instance {} proposal {:?}", self.node_id, instance_id, proposal_ballot);

        Effects {
            broadcast: Some(Message {
                kind: Kind::Prepare,
                from: self.node_id,
                instance_id,
                proposal_ballot,
                reject_ballot: Ballot::NONE,
                accept_ballot: Ballot::NONE,
                accept_value: Bytes::new(),
            }),
            arm: vec![(TimerId::PromisedTimeout, self.timeouts.promised)],
            cancel: vec![TimerId::AcceptedTimeout],
        }
    }

    fn accept(&mut self, instance_id: InstanceId) -> Effects {
        let inst = self.instances.get_mut(&instance_id).expect("accept on unknown instance");
        inst.counter.start_new_round();
        inst.state = ProposerState::Accepting;

        info!(
            "proposer {}: start accept instance {} proposal {:?} value_len {}",
            self.node_id,
            instance_id,
            inst.proposal_ballot,
            inst.accept_value.len()
        );

        Effects {
            broadcast: Some(Message {
                kind: Kind::Propose,
                from: self.node_id,
                instance_id,
                proposal_ballot: inst.proposal_ballot,
                reject_ballot: Ballot::NONE,
                accept_ballot: Ballot::NONE,
                accept_value: inst.accept_value.clone(),
            }),
            arm: vec![(TimerId::AcceptedTimeout, self.timeouts.accepted)],
            cancel: vec![TimerId::PromisedTimeout],
        }
    }

    /// Re-runs `prepare` for the instance currently being worked on, e.g. when the
    /// `PromisedTimeout` fires.
    pub fn retry_prepare(&mut self) -> Effects {
        self.prepare(self.work_instance_id)
    }

    /// Re-runs `prepare` for the instance currently being worked on, e.g. when the
    /// `AcceptedTimeout` fires.
    pub fn retry_accept_timeout(&mut self) -> Effects {
        self.prepare(self.work_instance_id)
    }

    pub fn on_promised(&mut self, msg: &Message) -> Option<Effects> {
        let inst = self.instances.get_mut(&msg.instance_id)?;
        if inst.state != ProposerState::Preparing || inst.proposal_ballot != msg.proposal_ballot {
            return None;
        }

        if msg.reject_ballot.is_none() {
            inst.counter.add_pass(msg.from);
            if msg.accept_ballot > inst.accept_ballot {
                inst.accept_ballot = msg.accept_ballot;
                inst.accept_value = msg.accept_value.clone();
            }
        } else {
            warn!(
                "proposer {}: reject promise from {} instance {} reject_ballot {:?}",
                self.node_id, msg.from, msg.instance_id, msg.reject_ballot
            );
            inst.counter.add_reject(msg.from, msg.reject_ballot);
        }

        if inst.counter.passed() {
            if inst.accept_ballot.is_none() {
                inst.accept_value = self.commit_value.clone();
            }
            Some(self.accept(msg.instance_id))
        } else if inst.counter.rejected() || inst.counter.all_received() {
            Some(self.prepare(msg.instance_id))
        } else {
            None
        }
    }

    pub fn on_accepted(&mut self, msg: &Message) -> Option<AcceptedOutcome> {
        let inst = self.instances.get_mut(&msg.instance_id)?;
        if inst.state != ProposerState::Accepting || inst.proposal_ballot != msg.proposal_ballot {
            return None;
        }

        if msg.reject_ballot.is_none() {
            inst.counter.add_pass(msg.from);
            debug!("proposer {}: pass accepted from {} instance {}", self.node_id, msg.from, msg.instance_id);
        } else {
            inst.counter.add_reject(msg.from, msg.reject_ballot);
            debug!("proposer {}: reject accepted from {} instance {}", self.node_id, msg.from, msg.instance_id);
        }

        if inst.counter.passed() {
            inst.state = ProposerState::Chosen;
            let own_value = inst.accept_ballot.is_none();
            let value = inst.accept_value.clone();
            let proposal_ballot = inst.proposal_ballot;
            Some(AcceptedOutcome::Chosen { instance_id: msg.instance_id, value, own_value, proposal_ballot })
        } else if inst.counter.rejected() || inst.counter.all_received() {
            Some(AcceptedOutcome::Unresolved(self.prepare(msg.instance_id)))
        } else {
            None
        }
    }
}
