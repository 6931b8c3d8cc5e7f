//! Duplicate suppression and ordering for run events.
//!
//! Everything here is synchronous and owned by one caller; the engine drives
//! it from its actor task.

pub mod buffer;
pub mod fingerprint;
pub mod identity;
pub mod window;

pub use buffer::{MergeOutcome, OrderedEventBuffer, merge_events};
pub use fingerprint::{EventIdentity, fingerprint, identity_of};
pub use identity::{Admission, IdentityFilter};
pub use window::BoundedWindow;
