use runsync_protocol::{IdentityProfile, RunEvent, SyncConfig};
use tracing::debug;

use crate::fingerprint::{EventIdentity, identity_of};
use crate::window::BoundedWindow;

/// Result of running one event through the [`IdentityFilter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    New,
    DuplicateSequence(u64),
    DuplicateContent,
}

impl Admission {
    pub fn is_new(&self) -> bool {
        matches!(self, Self::New)
    }
}

/// Drops events that were already delivered.
///
/// Sequenced events are keyed by `seq` alone: two events with the same
/// sequence but different payloads are duplicates. Legacy events fall back to
/// a content fingerprint kept in a separate window. Both windows are FIFO
/// bounded by the dedup limit.
///
/// When the buffer trims, only the trimmed sequences are forgotten. A trimmed
/// sequence sorts below everything retained, so a redelivery is trimmed again
/// on arrival. Legacy events would be anchored after the newest sequence
/// instead, so their fingerprints stay until they age out of the window.
#[derive(Debug, Clone)]
pub struct IdentityFilter {
    sequences: BoundedWindow<u64>,
    fingerprints: BoundedWindow<String>,
    profile: IdentityProfile,
}

impl IdentityFilter {
    pub fn new(limit: usize, profile: IdentityProfile) -> Self {
        Self {
            sequences: BoundedWindow::new(limit),
            fingerprints: BoundedWindow::new(limit),
            profile,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.dedup_limit, config.identity.clone())
    }

    pub fn check(&mut self, event: &RunEvent) -> Admission {
        match identity_of(event, &self.profile) {
            EventIdentity::Sequence(sequence) => {
                if self.sequences.insert(sequence) {
                    Admission::New
                } else {
                    debug!(sequence, kind = %event.kind, "duplicate sequence dropped");
                    Admission::DuplicateSequence(sequence)
                }
            }
            EventIdentity::Content(hash) => {
                if self.fingerprints.insert(hash) {
                    Admission::New
                } else {
                    debug!(kind = %event.kind, "duplicate legacy event dropped");
                    Admission::DuplicateContent
                }
            }
        }
    }

    /// `true` when the event is new and should propagate.
    pub fn admit(&mut self, event: &RunEvent) -> bool {
        self.check(event).is_new()
    }

    /// Drop sequences that left the buffer.
    pub fn forget_sequences<'a, I>(&mut self, sequences: I)
    where
        I: IntoIterator<Item = &'a u64>,
    {
        for sequence in sequences {
            self.sequences.remove(sequence);
        }
    }

    pub fn reset(&mut self) {
        self.sequences.clear();
        self.fingerprints.clear();
    }

    pub fn profile(&self) -> &IdentityProfile {
        &self.profile
    }

    /// `(sequence window size, fingerprint window size)`.
    pub fn window_sizes(&self) -> (usize, usize) {
        (self.sequences.len(), self.fingerprints.len())
    }
}
