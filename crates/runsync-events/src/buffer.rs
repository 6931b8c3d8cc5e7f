//! Ordered, capacity-bounded log of admitted events.
//!
//! Sequenced events sort by `seq`. Legacy events have no sequence, so they are
//! anchored to the highest sequence the buffer had seen when they arrived and
//! placed after it; several legacy events sharing an anchor keep arrival
//! order. Trimming keeps the most recent `limit` entries; the duplicate
//! indices drop the trimmed keys so they only cover what is left.

use std::collections::HashSet;

use runsync_protocol::{IdentityProfile, RunEvent};
use tracing::debug;

use crate::fingerprint::{EventIdentity, identity_of};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    anchor: u64,
    legacy: bool,
    arrival: u64,
}

#[derive(Debug, Clone)]
struct Slot {
    key: OrderKey,
    identity: EventIdentity,
    event: RunEvent,
}

/// What a single [`OrderedEventBuffer::merge`] did.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MergeOutcome {
    /// New events that are still in the buffer after trimming.
    pub accepted: usize,
    /// Entries dropped from the front to respect the limit.
    pub trimmed: usize,
    /// Sequences of the trimmed entries.
    pub evicted_sequences: Vec<u64>,
    /// Highest sequence ever accepted. This is the resume cursor.
    pub highest_sequence: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct OrderedEventBuffer {
    slots: Vec<Slot>,
    limit: usize,
    profile: IdentityProfile,
    sequence_index: HashSet<u64>,
    content_index: HashSet<String>,
    highest_sequence: Option<u64>,
    next_arrival: u64,
}

impl OrderedEventBuffer {
    pub fn new(limit: usize, profile: IdentityProfile) -> Self {
        Self {
            slots: Vec::new(),
            limit: limit.max(1),
            profile,
            sequence_index: HashSet::new(),
            content_index: HashSet::new(),
            highest_sequence: None,
            next_arrival: 0,
        }
    }

    pub fn merge<I>(&mut self, incoming: I) -> MergeOutcome
    where
        I: IntoIterator<Item = RunEvent>,
    {
        let first_arrival = self.next_arrival;
        let mut added = 0_usize;
        let mut needs_sort = false;

        for event in incoming {
            let identity = identity_of(&event, &self.profile);
            let fresh = match &identity {
                EventIdentity::Sequence(sequence) => self.sequence_index.insert(*sequence),
                EventIdentity::Content(hash) => self.content_index.insert(hash.clone()),
            };
            if !fresh {
                debug!(kind = %event.kind, sequence = ?event.sequence, "event already buffered");
                continue;
            }

            let key = match &identity {
                EventIdentity::Sequence(sequence) => {
                    let sequence = *sequence;
                    self.highest_sequence = Some(self.highest_sequence.map_or(sequence, |h| h.max(sequence)));
                    OrderKey {
                        anchor: sequence,
                        legacy: false,
                        arrival: self.next_arrival,
                    }
                }
                EventIdentity::Content(_) => OrderKey {
                    anchor: self.highest_sequence.unwrap_or(0),
                    legacy: true,
                    arrival: self.next_arrival,
                },
            };
            self.next_arrival += 1;

            if self.slots.last().is_some_and(|last| last.key > key) {
                needs_sort = true;
            }
            self.slots.push(Slot { key, identity, event });
            added += 1;
        }

        if needs_sort {
            self.slots.sort_by_key(|slot| slot.key);
        }

        let mut outcome = MergeOutcome {
            accepted: added,
            highest_sequence: self.highest_sequence,
            ..MergeOutcome::default()
        };
        if self.slots.len() > self.limit {
            let excess = self.slots.len() - self.limit;
            for slot in self.slots.drain(..excess) {
                if slot.key.arrival >= first_arrival {
                    outcome.accepted -= 1;
                }
                match slot.identity {
                    EventIdentity::Sequence(sequence) => {
                        self.sequence_index.remove(&sequence);
                        outcome.evicted_sequences.push(sequence);
                    }
                    EventIdentity::Content(hash) => {
                        self.content_index.remove(&hash);
                    }
                }
            }
            outcome.trimmed = excess;
            debug!(trimmed = excess, retained = self.slots.len(), "event buffer trimmed");
        }
        outcome
    }

    /// Merge a single event. Returns `true` when it is in the buffer afterwards.
    pub fn push(&mut self, event: RunEvent) -> bool {
        self.merge(std::iter::once(event)).accepted == 1
    }

    pub fn events(&self) -> impl Iterator<Item = &RunEvent> + '_ {
        self.slots.iter().map(|slot| &slot.event)
    }

    pub fn to_vec(&self) -> Vec<RunEvent> {
        self.events().cloned().collect()
    }

    pub fn highest_sequence(&self) -> Option<u64> {
        self.highest_sequence
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop all events and forget the resume cursor.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.sequence_index.clear();
        self.content_index.clear();
        self.highest_sequence = None;
        self.next_arrival = 0;
    }
}

/// Merge `incoming` into an already ordered `existing` list.
///
/// Returns the merged, trimmed list and the highest sequence seen across both
/// inputs.
pub fn merge_events(
    existing: &[RunEvent],
    incoming: &[RunEvent],
    limit: usize,
    profile: &IdentityProfile,
) -> (Vec<RunEvent>, Option<u64>) {
    let mut buffer = OrderedEventBuffer::new(limit, profile.clone());
    buffer.merge(existing.iter().cloned());
    let outcome = buffer.merge(incoming.iter().cloned());
    (buffer.to_vec(), outcome.highest_sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use runsync_protocol::RunId;
    use serde_json::json;

    fn seq(sequence: u64) -> RunEvent {
        RunEvent::new(RunId::from_string("r1"), "task_progress").with_sequence(sequence)
    }

    fn legacy(id: &str) -> RunEvent {
        RunEvent::new(RunId::from_string("r1"), "log").with_payload(json!({"id": id}))
    }

    fn sequences(buffer: &OrderedEventBuffer) -> Vec<Option<u64>> {
        buffer.events().map(|e| e.sequence).collect()
    }

    fn buffer(limit: usize) -> OrderedEventBuffer {
        OrderedEventBuffer::new(limit, IdentityProfile::default())
    }

    #[test]
    fn out_of_order_delivery_ends_sorted() {
        let mut buffer = buffer(10);
        for sequence in [1, 3, 2] {
            assert!(buffer.push(seq(sequence)));
        }
        assert_eq!(sequences(&buffer), vec![Some(1), Some(2), Some(3)]);
        assert_eq!(buffer.highest_sequence(), Some(3));
    }

    #[test]
    fn repeated_sequence_appears_once() {
        let mut buffer = buffer(10);
        let outcome = buffer.merge([seq(1), seq(2), seq(2), seq(3)]);
        assert_eq!(outcome.accepted, 3);
        assert!(!buffer.push(seq(2)));
        assert_eq!(sequences(&buffer), vec![Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn trims_to_the_highest_sequences() {
        let mut buffer = buffer(5);
        // Deliver 1..=12 shuffled.
        let order = [7, 2, 11, 1, 9, 4, 12, 3, 10, 6, 8, 5];
        for sequence in order {
            buffer.push(seq(sequence));
        }
        assert_eq!(buffer.len(), 5);
        assert_eq!(
            sequences(&buffer),
            (8..=12).map(Some).collect::<Vec<_>>()
        );
        assert_eq!(buffer.highest_sequence(), Some(12));
    }

    #[test]
    fn trimmed_new_events_are_not_counted_as_accepted() {
        let mut buffer = buffer(3);
        buffer.merge([seq(10), seq(11), seq(12)]);
        let outcome = buffer.merge([seq(1), seq(13)]);
        assert_eq!(outcome.trimmed, 2);
        assert_eq!(outcome.accepted, 1);
        assert_eq!(outcome.evicted_sequences, vec![1, 10]);
        assert_eq!(sequences(&buffer), vec![Some(11), Some(12), Some(13)]);
    }

    #[test]
    fn trimmed_keys_leave_the_indices() {
        let mut buffer = buffer(2);
        buffer.merge([seq(1), seq(2), seq(3)]);
        // 1 was trimmed, so it is no longer indexed; it lands at the front and
        // is immediately trimmed again.
        let outcome = buffer.merge([seq(1)]);
        assert_eq!(outcome.accepted, 0);
        assert_eq!(sequences(&buffer), vec![Some(2), Some(3)]);
    }

    #[test]
    fn trimmed_legacy_event_leaves_the_content_index() {
        let mut buffer = buffer(2);
        buffer.merge([legacy("a"), seq(1), seq(2)]);
        assert_eq!(sequences(&buffer), vec![Some(1), Some(2)]);
        assert!(buffer.content_index.is_empty());
        assert_eq!(buffer.sequence_index.len(), 2);
    }

    #[test]
    fn legacy_events_anchor_after_latest_sequence() {
        let mut buffer = buffer(10);
        buffer.push(seq(1));
        buffer.push(seq(2));
        buffer.push(legacy("a"));
        buffer.push(seq(4));
        buffer.push(seq(3));
        buffer.push(legacy("b"));
        let order: Vec<String> = buffer
            .events()
            .map(|e| match e.sequence {
                Some(s) => s.to_string(),
                None => e.payload["id"].as_str().unwrap_or_default().to_owned(),
            })
            .collect();
        assert_eq!(order, vec!["1", "2", "a", "3", "4", "b"]);
    }

    #[test]
    fn legacy_duplicates_are_dropped_by_content() {
        let mut buffer = buffer(10);
        assert!(buffer.push(legacy("a")));
        assert!(!buffer.push(legacy("a")));
        assert!(buffer.push(legacy("b")));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn merge_events_dedupes_and_sorts() {
        let profile = IdentityProfile::default();
        let existing = vec![seq(1), seq(2)];
        let incoming = vec![seq(2), seq(3)];
        let (merged, last) = merge_events(&existing, &incoming, 10, &profile);
        let got: Vec<_> = merged.iter().map(|e| e.sequence).collect();
        assert_eq!(got, vec![Some(1), Some(2), Some(3)]);
        assert_eq!(last, Some(3));
    }

    #[test]
    fn merge_events_trims_to_limit() {
        let profile = IdentityProfile::default();
        let (merged, last) = merge_events(&[seq(1)], &[seq(2), seq(3)], 2, &profile);
        let got: Vec<_> = merged.iter().map(|e| e.sequence).collect();
        assert_eq!(got, vec![Some(2), Some(3)]);
        assert_eq!(last, Some(3));
    }

    #[test]
    fn clear_resets_cursor() {
        let mut buffer = buffer(4);
        buffer.merge([seq(5), seq(6)]);
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.highest_sequence(), None);
        assert!(buffer.push(seq(5)));
    }
}
