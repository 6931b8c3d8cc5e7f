//! # runsync-protocol: run sync contract
//!
//! Shared types and trait interfaces for keeping a local view of a
//! server-executed run in step with the server's event stream.
//!
//! Dependency-light on purpose (no tokio, no HTTP client) so transports and
//! the engine can depend on it without pulling each other in.
//!
//! ## Module Overview
//!
//! - [`ids`]: Typed ID wrappers (RunId, EventId, ProjectId)
//! - [`event`]: RunEvent + EventFrame (raw channel frame)
//! - [`snapshot`]: RunSnapshot, SnapshotRecord
//! - [`state`]: ConnectionState and its transition table
//! - [`config`]: SyncConfig, BackoffConfig, IdentityProfile, RefreshTriggers
//! - [`ports`]: StreamTransport, SnapshotSource
//! - [`error`]: SyncError, ErrorCategory, SyncResult

pub mod config;
pub mod error;
pub mod event;
pub mod ids;
pub mod ports;
pub mod snapshot;
pub mod state;

pub use config::{BackoffConfig, IdentityProfile, RefreshTriggers, SyncConfig};
pub use error::{ErrorCategory, SyncError, SyncResult};
pub use event::{EventFrame, KEEPALIVE_EVENT, RunEvent};
pub use ids::{EventId, ProjectId, RunId};
pub use ports::{ChannelSignal, ChannelStream, SnapshotSource, StreamRequest, StreamTransport};
pub use snapshot::{RunSnapshot, SnapshotRecord};
pub use state::ConnectionState;
