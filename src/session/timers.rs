//! Deadline bookkeeping for the session event loop.
//!
//! Timers are plain deadlines polled by the controller's `select!` loop, so
//! cancelling one is just forgetting it.

use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKind {
    /// Hard ceiling on one capture session.
    MaxDuration,
    /// Fixed-delay reconnect after an unexpected drop.
    Reconnect,
    /// Grace period between drained playback and teardown.
    CloseGrace,
}

#[derive(Debug, Default)]
pub struct SessionTimers {
    deadlines: BTreeMap<TimerKind, Instant>,
}

impl SessionTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `kind` to fire `after` from now, replacing any previous deadline.
    pub fn arm(&mut self, kind: TimerKind, after: Duration) {
        self.deadlines.insert(kind, Instant::now() + after);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        self.deadlines.remove(&kind);
    }

    pub fn cancel_all(&mut self) {
        self.deadlines.clear();
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines.contains_key(&kind)
    }

    pub fn armed_count(&self) -> usize {
        self.deadlines.len()
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Disarm and return every timer due at `now`, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut due: Vec<(Instant, TimerKind)> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(kind, at)| (*at, *kind))
            .collect();
        due.sort();
        for (_, kind) in &due {
            self.deadlines.remove(kind);
        }
        due.into_iter().map(|(_, kind)| kind).collect()
    }
}
