//! The opaque state-machine collaborator applied by a [`crate::learner::Learner`].

/// Applies a decided instance's bytes and returns the output handed back to the
/// originating client. Implementations must be deterministic and thread-safe: a
/// single `apply` call always runs on the owning group's event-loop task, but
/// local, non-consensus reads may run concurrently from arbitrary client-handling
/// tasks (spec.md §5).
pub trait StateMachine: Send + Sync {
    fn apply(&self, blob: &[u8]) -> Vec<u8>;
}
