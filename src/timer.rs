//! Timer scheduling, ported from `timer.go`.
//!
//! Only one timer per [`TimerId`] exists at a time; re-arming replaces it. Arms and
//! cancellations issued while firing timers are buffered and applied after the fired
//! batch has been handed back to the caller, so a fired timer's callback can safely
//! re-arm itself without disturbing the in-flight iteration.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TimerId {
    PromisedTimeout,
    AcceptedTimeout,
    PullLearnTimeout,
}

pub struct TimerManager {
    armed: HashMap<TimerId, Instant>,
    updating: bool,
    pending_add: Vec<(TimerId, Instant)>,
    pending_del: Vec<TimerId>,
}

impl Default for TimerManager {
    fn default() -> TimerManager {
        TimerManager {
            armed: HashMap::new(),
            updating: false,
            pending_add: Vec::new(),
            pending_del: Vec::new(),
        }
    }
}

impl TimerManager {
    pub fn new() -> TimerManager {
        TimerManager::default()
    }

    pub fn arm(&mut self, id: TimerId, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        if !self.updating {
            self.armed.insert(id, deadline);
        } else {
            self.pending_add.push((id, deadline));
        }
    }

    pub fn cancel(&mut self, id: TimerId) {
        if !self.updating {
            self.armed.remove(&id);
        } else {
            self.pending_del.push(id);
        }
    }

    /// Returns the timer ids whose deadline has passed, removing them. Call sites are
    /// expected to dispatch each fired id to the right component; any `arm`/`cancel`
    /// calls made while doing so are deferred until this call returns.
    pub fn poll_fired(&mut self) -> Vec<TimerId> {
        let now = Instant::now();
        self.updating = true;
        let fired: Vec<TimerId> =
            self.armed.iter().filter(|(_, deadline)| now >= **deadline).map(|(id, _)| *id).collect();
        for id in &fired {
            self.armed.remove(id);
        }
        self.updating = false;

        for id in self.pending_del.drain(..) {
            self.armed.remove(&id);
        }
        for (id, deadline) in self.pending_add.drain(..) {
            self.armed.insert(id, deadline);
        }

        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_after_timeout_elapses() {
        let mut tm = TimerManager::new();
        tm.arm(TimerId::PromisedTimeout, Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(1));
        assert_eq!(tm.poll_fired(), vec![TimerId::PromisedTimeout]);
        // fired timers are removed, not refired
        assert!(tm.poll_fired().is_empty());
    }

    #[test]
    fn rearming_replaces_the_existing_timer() {
        let mut tm = TimerManager::new();
        tm.arm(TimerId::AcceptedTimeout, Duration::from_secs(10));
        tm.arm(TimerId::AcceptedTimeout, Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(1));
        assert_eq!(tm.poll_fired(), vec![TimerId::AcceptedTimeout]);
    }

    #[test]
    fn cancel_before_fire_is_honored() {
        let mut tm = TimerManager::new();
        tm.arm(TimerId::PullLearnTimeout, Duration::from_millis(0));
        tm.cancel(TimerId::PullLearnTimeout);
        std::thread::sleep(Duration::from_millis(1));
        assert!(tm.poll_fired().is_empty());
    }
}
