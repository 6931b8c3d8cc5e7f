//! Run events and the raw frames they arrive in.
//!
//! The sync core never interprets payloads. It only needs a stable identity
//! (`seq`, or a fingerprint for legacy events without one), an ordering key,
//! and the owning run. Payloads stay opaque `serde_json::Value`s.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::ids::{EventId, RunId};

/// Frame name servers use for liveness pings.
pub const KEEPALIVE_EVENT: &str = "keep-alive";

/// One event emitted by the server for a run.
///
/// Wire shape: `{"id", "seq", "type", "ts", "run_id", "task_id", "message", "payload"}`.
/// Once admitted with a given `seq`, an event is immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EventId>,
    /// Monotonic per-run sequence. Absent only for legacy/best-effort events.
    #[serde(rename = "seq", default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(rename = "type")]
    pub kind: String,
    /// Server timestamp (seconds or millis, whatever the server emits).
    #[serde(rename = "ts", default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl RunEvent {
    pub fn new(run_id: RunId, kind: impl Into<String>) -> Self {
        Self {
            id: None,
            sequence: None,
            kind: kind.into(),
            timestamp: None,
            run_id,
            task_id: None,
            message: None,
            payload: Value::Null,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_id(mut self, id: impl Into<EventId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// A named frame as delivered by the push channel, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFrame {
    /// SSE `event:` name. Empty for unnamed `message` frames.
    pub name: String,
    pub data: String,
    /// SSE `id:` field, when the server sets one.
    pub last_event_id: Option<String>,
}

impl EventFrame {
    pub fn new(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            last_event_id: None,
        }
    }

    /// Liveness-only frame: the keep-alive name or no data at all.
    pub fn is_keepalive(&self) -> bool {
        self.name == KEEPALIVE_EVENT || self.data.trim().is_empty()
    }

    /// Decode the frame body into a [`RunEvent`].
    ///
    /// Events that omit `run_id` inherit the run the stream was opened for;
    /// frames with no `type` inherit the frame name.
    pub fn decode(&self, run_id: &RunId) -> SyncResult<RunEvent> {
        let mut value: Value = serde_json::from_str(&self.data).map_err(|error| {
            SyncError::Protocol(format!("malformed `{}` frame: {error}", self.name))
        })?;
        let Some(object) = value.as_object_mut() else {
            return Err(SyncError::Protocol(format!(
                "`{}` frame is not a JSON object",
                self.name
            )));
        };
        if !object.contains_key("run_id") {
            object.insert("run_id".to_owned(), Value::String(run_id.to_string()));
        }
        if !object.contains_key("type") && !self.name.is_empty() {
            object.insert("type".to_owned(), Value::String(self.name.clone()));
        }
        serde_json::from_value(value).map_err(|error| {
            SyncError::Protocol(format!("invalid `{}` event: {error}", self.name))
        })
    }
}
