//! Per-round quorum bookkeeping, ported from `counter.go`.

use crate::{Ballot, NodeId};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct Counter {
    node_count: usize,
    passes: HashSet<NodeId>,
    rejects: HashMap<NodeId, Ballot>,
}

impl Counter {
    pub fn new(node_count: usize) -> Counter {
        Counter { node_count, passes: HashSet::new(), rejects: HashMap::new() }
    }

    pub fn add_pass(&mut self, node: NodeId) {
        self.passes.insert(node);
    }

    /// Stores the rejecter's `promised_ballot` bit-for-bit; `genProposalID` later
    /// right-shifts it by 16 to recover a sequence. See spec.md §9.
    pub fn add_reject(&mut self, node: NodeId, rejecter_promised_ballot: Ballot) {
        self.rejects.insert(node, rejecter_promised_ballot);
    }

    pub fn max_reject_ballot(&self) -> Ballot {
        self.rejects.values().copied().max().unwrap_or(Ballot::NONE)
    }

    fn quorum(&self) -> usize {
        self.node_count / 2 + 1
    }

    pub fn passed(&self) -> bool {
        self.passes.len() >= self.quorum()
    }

    pub fn rejected(&self) -> bool {
        self.rejects.len() >= self.quorum()
    }

    pub fn all_received(&self) -> bool {
        self.passes.len() + self.rejects.len() == self.node_count
    }

    /// Resets bookkeeping at the start of a new Prepare or Accept phase.
    pub fn start_new_round(&mut self) {
        self.passes.clear();
        self.rejects.clear();
    }
}
