//! Boundary ports between the sync engine and the outside world.
//!
//! The engine never opens sockets itself. It talks to a [`StreamTransport`]
//! (preflight probe + push channel) and a [`SnapshotSource`] (authoritative
//! full-state fetch). The HTTP implementations live in `runsync-client`;
//! tests plug in scripted fakes.
//!
//! Object-safety note:
//! - Traits use `async-trait` for async dyn-dispatch.
//! - Channels are boxed streams (`ChannelStream`) so dropping one closes it.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::SyncResult;
use crate::event::EventFrame;
use crate::ids::RunId;
use crate::snapshot::RunSnapshot;

/// What to subscribe to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub run_id: RunId,
    pub token: Option<String>,
    /// Resume cursor: the server replays only events after this sequence.
    pub resume_from: Option<u64>,
}

impl StreamRequest {
    pub fn new(run_id: impl Into<RunId>) -> Self {
        Self {
            run_id: run_id.into(),
            token: None,
            resume_from: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn resume_from(mut self, sequence: u64) -> Self {
        self.resume_from = Some(sequence);
        self
    }
}

/// Signals produced by an open push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSignal {
    Opened,
    Frame(EventFrame),
    /// Transport error. The channel is dead after this signal.
    Failed(String),
}

/// A live push channel. Ending the stream without `Failed` also means the
/// channel is gone.
pub type ChannelStream = BoxStream<'static, ChannelSignal>;

#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// One-shot probe of the stream URL that returns without holding the
    /// stream open. Maps HTTP status to `SyncError` (401/403 auth, 404 not found).
    async fn probe(&self, request: &StreamRequest) -> SyncResult<()>;

    /// Open the push channel for `request`.
    fn open(&self, request: &StreamRequest) -> ChannelStream;
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, run_id: &RunId) -> SyncResult<RunSnapshot>;
}
