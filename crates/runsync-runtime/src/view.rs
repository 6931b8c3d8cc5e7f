use std::sync::Arc;

use parking_lot::RwLock;
use runsync_protocol::{RunEvent, RunId, SnapshotRecord};

#[derive(Debug, Default)]
struct ViewState {
    run_id: Option<RunId>,
    snapshot: Option<SnapshotRecord>,
    events: Vec<RunEvent>,
    highest_sequence: Option<u64>,
}

/// Read side of the engine: the latest snapshot plus the ordered event tail.
///
/// Only the engine task writes; clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct RunView {
    inner: Arc<RwLock<ViewState>>,
}

impl RunView {
    pub fn run_id(&self) -> Option<RunId> {
        self.inner.read().run_id.clone()
    }

    pub fn snapshot(&self) -> Option<SnapshotRecord> {
        self.inner.read().snapshot.clone()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.inner.read().events.clone()
    }

    pub fn sequences(&self) -> Vec<Option<u64>> {
        self.inner.read().events.iter().map(|e| e.sequence).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().events.is_empty()
    }

    /// Resume cursor the next reconnect will send.
    pub fn highest_sequence(&self) -> Option<u64> {
        self.inner.read().highest_sequence
    }

    pub(crate) fn reset(&self, run_id: RunId) {
        let mut state = self.inner.write();
        *state = ViewState {
            run_id: Some(run_id),
            ..ViewState::default()
        };
    }

    pub(crate) fn publish_events(&self, events: Vec<RunEvent>, highest_sequence: Option<u64>) {
        let mut state = self.inner.write();
        state.events = events;
        state.highest_sequence = highest_sequence;
    }

    pub(crate) fn publish_snapshot(&self, record: SnapshotRecord) {
        self.inner.write().snapshot = Some(record);
    }
}
