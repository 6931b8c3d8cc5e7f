//! Authoritative full-state snapshots of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::RunEvent;

/// Full state object returned by `GET /runs/{run_id}/snapshot`.
///
/// A snapshot replaces the consumer's notion of current state wholesale.
/// Its `last_events` tail is replayed through the identity filter so events
/// that raced the fetch are neither lost nor applied twice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSnapshot {
    pub run: Value,
    pub plan: Vec<Value>,
    pub tasks: Vec<Value>,
    pub sources: Vec<Value>,
    pub facts: Vec<Value>,
    pub conflicts: Vec<Value>,
    pub artifacts: Vec<Value>,
    pub approvals: Vec<Value>,
    pub metrics: Value,
    /// Bounded tail of recent events, in server order.
    pub last_events: Vec<RunEvent>,
}

impl RunSnapshot {
    /// Run status string, when the embedded run object carries one.
    pub fn run_status(&self) -> Option<&str> {
        self.run.get("status").and_then(Value::as_str)
    }

    /// Highest sequence in the embedded event tail.
    pub fn highest_sequence(&self) -> Option<u64> {
        self.last_events.iter().filter_map(|e| e.sequence).max()
    }
}

/// A snapshot together with the time window that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub snapshot: RunSnapshot,
    /// When the fetch was issued. The snapshot is at least this fresh.
    pub requested_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl SnapshotRecord {
    pub fn new(snapshot: RunSnapshot, requested_at: DateTime<Utc>) -> Self {
        Self {
            snapshot,
            requested_at,
            received_at: Utc::now(),
        }
    }

    pub fn is_fresher_than(&self, other: &SnapshotRecord) -> bool {
        self.requested_at >= other.requested_at
    }
}
