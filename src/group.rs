//! Wires acceptor, proposer, learner and timers into the single-task event loop
//! described in spec.md §4.1, ported from `instance_group.go`'s `run`.

use crate::acceptor::Acceptor;
use crate::error::PaxosError;
use crate::learner::Learner;
use crate::message::{Kind, Message};
use crate::proposer::{AcceptedOutcome, Effects, Proposer, Timeouts};
use crate::statemachine::StateMachine;
use crate::timer::{TimerId, TimerManager};
use crate::transport::Transport;
use bytes::Bytes;
use log::warn;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};

const RECV_POLL_INTERVAL: Duration = Duration::from_millis(10);
const PULL_LEARN_INTERVAL: Duration = Duration::from_millis(200);

struct ProposeRequest {
    value: Bytes,
    reply: oneshot::Sender<Bytes>,
}

/// Client-facing submission handle for one instance group. Serializes concurrent
/// submitters with a FIFO mutex, matching spec.md §5's "group-level FIFO mutex
/// around commit": the proposer carries a single `commit_value`/`pending_result`
/// slot, so at most one submission may be in flight at the proposer at a time, for
/// as long as that round actually takes to resolve — not merely for
/// `commit_timeout`. A contested round can still be unresolved at the proposer
/// after a caller's own `commit_timeout` elapses, so the permit is held in the
/// background past that point; see `commit`'s timeout branch.
#[derive(Clone)]
pub struct GroupHandle {
    commit_tx: mpsc::Sender<ProposeRequest>,
    fifo: Arc<Mutex<()>>,
    commit_timeout: Duration,
}

impl GroupHandle {
    pub async fn commit(&self, value: Bytes) -> Result<Bytes, PaxosError> {
        let permit = self.fifo.clone().lock_owned().await;
        let (reply_tx, mut reply_rx) = oneshot::channel();
        self.commit_tx.send(ProposeRequest { value, reply: reply_tx }).await.map_err(|_| PaxosError::GroupClosed)?;

        tokio::select! {
            res = &mut reply_rx => {
                drop(permit);
                res.map_err(|_| PaxosError::GroupClosed)
            }
            _ = tokio::time::sleep(self.commit_timeout) => {
                // This submission's round may still be live at the proposer (a
                // contested instance can take several retries past our own
                // timeout). Releasing the permit now would let the very next
                // submitter's `submit()` overwrite that round's still-active
                // `pending_result`/`ProposerInstance` out from under it. Instead,
                // keep holding it in the background until the round actually
                // resolves, and report the timeout to this caller now.
                tokio::spawn(async move {
                    let _ = reply_rx.await;
                    drop(permit);
                });
                Err(PaxosError::CommitTimeout)
            }
        }
    }
}

pub struct InstanceGroup<T: Transport> {
    transport: T,
    acceptor: Acceptor,
    proposer: Proposer,
    learner: Learner,
    timers: TimerManager,
    commit_rx: mpsc::Receiver<ProposeRequest>,
}

impl<T: Transport> InstanceGroup<T> {
    /// Builds a group and its client-facing handle. `transport` is expected to
    /// already be bound/connected (or, for `LocalTransport`, registered) for this
    /// group's own channel — see `Configuration::group_listen_addr`.
    pub fn new(transport: T, node_count: usize, sm: Arc<dyn StateMachine>, commit_timeout: Duration) -> (InstanceGroup<T>, GroupHandle) {
        let node_id = transport.node_id();
        let (commit_tx, commit_rx) = mpsc::channel(1);
        let mut timers = TimerManager::new();
        timers.arm(TimerId::PullLearnTimeout, PULL_LEARN_INTERVAL);

        let group = InstanceGroup {
            transport,
            acceptor: Acceptor::new(node_id),
            proposer: Proposer::with_timeouts(node_id, node_count, Timeouts::default()),
            learner: Learner::new(node_id, sm),
            timers,
            commit_rx,
        };
        let handle = GroupHandle { commit_tx, fifo: Arc::new(Mutex::new(())), commit_timeout };
        (group, handle)
    }

    /// Runs the event loop forever. Intended to be handed to `tokio::spawn`.
    pub async fn run(mut self) {
        loop {
            if let Ok(req) = self.commit_rx.try_recv() {
                self.proposer.submit(req.value, req.reply);
            }

            if let Some(msg) = self.transport.recv(RECV_POLL_INTERVAL).await {
                self.dispatch(msg).await;
            }

            self.poll_timers().await;

            if let Some(effects) = self.proposer.update(true, self.learner.next_instance_id()) {
                self.apply_effects(effects).await;
            }
        }
    }

    async fn dispatch(&mut self, msg: Message) {
        match msg.kind {
            Kind::Prepare => {
                let reply = self.acceptor.on_prepare(&msg);
                self.transport.send_response(msg.from, reply).await;
            }
            Kind::Propose => {
                if let Some(reply) = self.acceptor.on_accept(&msg) {
                    self.transport.send_response(msg.from, reply).await;
                }
            }
            Kind::Promised => {
                if let Some(effects) = self.proposer.on_promised(&msg) {
                    self.apply_effects(effects).await;
                }
            }
            Kind::Accepted => {
                if let Some(outcome) = self.proposer.on_accepted(&msg) {
                    self.apply_accepted_outcome(outcome).await;
                }
            }
            Kind::PushLearn => {
                self.learner.lean_value(&msg);
            }
            Kind::PullLearnRequest => {
                if let Some(reply) = self.learner.on_pull_learn_request(&msg) {
                    self.transport.send_response(msg.from, reply).await;
                }
            }
            Kind::PullLearnResponse => {
                self.learner.on_pull_learn_response(&msg);
            }
            // Never observed here: `Closed` is a connection-teardown sentinel a
            // reader injects into its own writer's send queue (`transport::reader_loop`)
            // and is never encoded onto the wire or delivered to this group's
            // recv queue. Matched only because `Kind` must be handled exhaustively.
            Kind::Closed => {}
        }
    }

    async fn poll_timers(&mut self) {
        for id in self.timers.poll_fired() {
            match id {
                TimerId::PromisedTimeout => {
                    let effects = self.proposer.retry_prepare();
                    self.apply_effects(effects).await;
                }
                TimerId::AcceptedTimeout => {
                    let effects = self.proposer.retry_accept_timeout();
                    self.apply_effects(effects).await;
                }
                TimerId::PullLearnTimeout => {
                    let req = self.learner.check_learn();
                    self.broadcast_request(req, false).await;
                    self.timers.arm(TimerId::PullLearnTimeout, PULL_LEARN_INTERVAL);
                }
            }
        }
    }

    async fn apply_effects(&mut self, effects: Effects) {
        if let Some(msg) = effects.broadcast {
            self.broadcast_request(msg, true).await;
        }
        for id in effects.cancel {
            self.timers.cancel(id);
        }
        for (id, dur) in effects.arm {
            self.timers.arm(id, dur);
        }
    }

    async fn apply_accepted_outcome(&mut self, outcome: AcceptedOutcome) {
        match outcome {
            AcceptedOutcome::Unresolved(effects) => self.apply_effects(effects).await,
            AcceptedOutcome::Chosen { instance_id, value, own_value, proposal_ballot } => {
                self.timers.cancel(TimerId::AcceptedTimeout);
                let (push, result) = self.learner.on_value_closed(instance_id, value);
                self.broadcast_request(push, false).await;

                if own_value {
                    self.proposer.deliver_chosen_result(Bytes::from(result));
                    self.proposer.retain_leadership(proposal_ballot);
                } else {
                    self.proposer.clear_leadership();
                    if let Some(effects) = self.proposer.update(false, self.learner.next_instance_id()) {
                        self.apply_effects(effects).await;
                    }
                }
            }
        }
    }

    async fn broadcast_request(&self, msg: Message, include_self: bool) {
        if include_self {
            self.transport.loopback(msg.clone());
        }
        for peer in self.transport.peer_ids() {
            self.transport.send_request(peer, msg.clone()).await;
        }
    }
}
