//! # runsync-runtime
//!
//! Drives a run subscription: preflight, channel lifecycle, heartbeat,
//! reconnect backoff and snapshot reconciliation.
//!
//! - [`backoff`]: reconnect delay policy
//! - [`machine`]: sans-IO connection state machine
//! - [`reconciler`]: snapshot fetch coalescing and debounce
//! - [`engine`]: the `RunSync` actor that runs the above on tokio
//! - [`observer`]: consumer callbacks
//! - [`view`]: shared read side (snapshot + ordered events)

pub mod backoff;
pub mod engine;
pub mod machine;
pub mod observer;
pub mod reconciler;
pub mod view;

pub use backoff::BackoffPolicy;
pub use engine::RunSync;
pub use machine::{ConnectionMachine, Effect, Input};
pub use observer::{ChannelObserver, NoopObserver, SyncNotice, SyncObserver};
pub use reconciler::{RefreshDecision, SnapshotReconciler, polls_in};
pub use view::RunView;
