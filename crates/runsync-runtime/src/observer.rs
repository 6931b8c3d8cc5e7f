use runsync_protocol::{ConnectionState, RunEvent, SnapshotRecord, SyncError};
use tokio::sync::mpsc;

/// Consumer callbacks. All methods default to no-ops and are invoked from the
/// engine task, so implementations must not block.
pub trait SyncObserver: Send + Sync {
    /// A new event passed the identity filter and is in the buffer.
    fn on_event(&self, _event: &RunEvent) {}
    fn on_state_change(&self, _state: ConnectionState) {}
    /// Advisory errors as well as terminal ones; terminal failures are also
    /// visible as an `offline` state.
    fn on_error(&self, _error: &SyncError) {}
    fn on_reconnected(&self) {}
    fn on_snapshot(&self, _record: &SnapshotRecord) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SyncObserver for NoopObserver {}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotice {
    Event(RunEvent),
    State(ConnectionState),
    Error(SyncError),
    Reconnected,
    Snapshot(Box<SnapshotRecord>),
}

/// Forwards every callback as a [`SyncNotice`] over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<SyncNotice>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SyncNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, notice: SyncNotice) {
        // Receiver gone means nobody is listening anymore.
        let _ = self.tx.send(notice);
    }
}

impl SyncObserver for ChannelObserver {
    fn on_event(&self, event: &RunEvent) {
        self.send(SyncNotice::Event(event.clone()));
    }

    fn on_state_change(&self, state: ConnectionState) {
        self.send(SyncNotice::State(state));
    }

    fn on_error(&self, error: &SyncError) {
        self.send(SyncNotice::Error(error.clone()));
    }

    fn on_reconnected(&self) {
        self.send(SyncNotice::Reconnected);
    }

    fn on_snapshot(&self, record: &SnapshotRecord) {
        self.send(SyncNotice::Snapshot(Box::new(record.clone())));
    }
}
