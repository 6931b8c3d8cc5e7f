//! Bookkeeping for authoritative snapshot fetches.
//!
//! At most one fetch is in flight and at most one follow-up is queued behind
//! it. Event-driven refreshes go through a single debounce deadline that is
//! pushed back on each request instead of stacking timers. Results from an
//! older epoch (a previous run or a disconnected session) are discarded.

use std::time::Duration;

use runsync_protocol::{ConnectionState, SnapshotRecord};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshDecision {
    /// Caller must start a fetch now.
    Start,
    /// A fetch is running; one follow-up will run after it.
    Queued,
}

#[derive(Debug, Clone)]
pub struct SnapshotReconciler {
    debounce: Duration,
    epoch: u64,
    in_flight: bool,
    queued: bool,
    debounce_deadline: Option<Instant>,
    latest: Option<SnapshotRecord>,
    fetches_started: u64,
}

impl SnapshotReconciler {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            epoch: 0,
            in_flight: false,
            queued: false,
            debounce_deadline: None,
            latest: None,
            fetches_started: 0,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn is_queued(&self) -> bool {
        self.queued
    }

    pub fn fetches_started(&self) -> u64 {
        self.fetches_started
    }

    pub fn latest(&self) -> Option<&SnapshotRecord> {
        self.latest.as_ref()
    }

    pub fn request(&mut self) -> RefreshDecision {
        if self.in_flight {
            if !self.queued {
                debug!(epoch = self.epoch, "snapshot refresh queued behind in-flight fetch");
            }
            self.queued = true;
            return RefreshDecision::Queued;
        }
        self.in_flight = true;
        self.fetches_started += 1;
        RefreshDecision::Start
    }

    /// Mark the in-flight fetch of `epoch` finished.
    ///
    /// Returns `None` when the result belongs to an older epoch and must be
    /// ignored, otherwise whether a queued follow-up fetch must start now.
    pub fn complete(&mut self, epoch: u64) -> Option<bool> {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "discarding stale snapshot result");
            return None;
        }
        if self.queued {
            self.queued = false;
            self.fetches_started += 1;
            return Some(true);
        }
        self.in_flight = false;
        Some(false)
    }

    /// Keep `record` unless a fresher one is already held.
    pub fn accept(&mut self, record: SnapshotRecord) -> bool {
        if self
            .latest
            .as_ref()
            .is_some_and(|current| !record.is_fresher_than(current))
        {
            debug!("ignoring snapshot older than the current one");
            return false;
        }
        self.latest = Some(record);
        true
    }

    /// Push the debounce deadline to `now + debounce` and return it.
    pub fn defer(&mut self, now: Instant) -> Instant {
        let deadline = now + self.debounce;
        self.debounce_deadline = Some(deadline);
        deadline
    }

    pub fn debounce_deadline(&self) -> Option<Instant> {
        self.debounce_deadline
    }

    /// `true` once when the debounce deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.debounce_deadline {
            Some(deadline) if now >= deadline => {
                self.debounce_deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Start a new epoch: forget pending work and the held snapshot.
    pub fn reset(&mut self) {
        self.epoch += 1;
        self.in_flight = false;
        self.queued = false;
        self.debounce_deadline = None;
        self.latest = None;
    }

    /// Drop pending work but keep the held snapshot.
    pub fn suspend(&mut self) {
        self.epoch += 1;
        self.in_flight = false;
        self.queued = false;
        self.debounce_deadline = None;
    }
}

/// Whether the periodic snapshot poll should run in `state`.
pub fn polls_in(state: ConnectionState) -> bool {
    matches!(
        state,
        ConnectionState::Connecting | ConnectionState::Reconnecting | ConnectionState::Offline
    )
}
