//! A replicated, strongly-consistent key-value store built on Multi-Paxos.
//!
//! A [`node::Node`] hosts one or more [`group::InstanceGroup`] shards. Each group
//! independently runs the classical Paxos trio (`acceptor`, `proposer`, `learner`)
//! plus a [`timer::TimerManager`], driven by a single event-loop task per
//! [`group::InstanceGroup::run`]. Clients submit values through a
//! [`group::GroupHandle`]; [`kv::KvService`] is the reference application built on
//! top, routing keys to groups by [`kv::djb2`] hash.

pub mod acceptor;
pub mod config;
pub mod counter;
pub mod error;
pub mod group;
pub mod kv;
pub mod learner;
pub mod message;
pub mod node;
pub mod proposer;
pub mod statemachine;
pub mod timer;
pub mod transport;

mod ballot;

pub use ballot::Ballot;
pub use error::PaxosError;
pub use message::{Kind, Message};

/// Wire field is 4 bytes; the low 16 bits participate in a [`Ballot`].
pub type NodeId = u32;

/// Wire field is 4 bytes, 1-based.
pub type InstanceId = u32;
