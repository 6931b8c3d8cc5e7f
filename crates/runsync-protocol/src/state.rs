//! Connection state reported to the consumer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of the push-channel connection for one run.
///
/// ```text
/// idle -> connecting -> open -> reconnecting <-> connecting
/// any  -> offline   (attempts exhausted or terminal preflight failure)
/// any  -> closed    (explicit disconnect)
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Offline,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Offline => "offline",
            Self::Closed => "closed",
        }
    }

    /// Transition table. Self-transitions are not transitions and are rejected.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        if self == next {
            return false;
        }
        match (self, next) {
            (_, Offline) | (_, Closed) => true,
            (Idle | Offline | Closed | Open | Reconnecting, Connecting) => true,
            (Connecting, Open) => true,
            (Connecting | Open, Reconnecting) => true,
            _ => false,
        }
    }

    /// States that only an explicit consumer call can leave.
    pub fn requires_consumer_action(self) -> bool {
        matches!(self, Self::Offline | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
