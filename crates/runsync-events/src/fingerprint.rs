//! Identity of an event: its sequence, or a content fingerprint for legacy
//! events that carry none.

use runsync_protocol::{IdentityProfile, RunEvent};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventIdentity {
    Sequence(u64),
    /// Hex SHA-256 over kind, timestamp, run, event id and the profile's
    /// payload subset.
    Content(String),
}

pub fn identity_of(event: &RunEvent, profile: &IdentityProfile) -> EventIdentity {
    match event.sequence {
        Some(sequence) => EventIdentity::Sequence(sequence),
        None => EventIdentity::Content(fingerprint(event, profile)),
    }
}

/// Stable content hash of a sequence-less event.
///
/// Two deliveries of the same legacy event hash identically as long as the
/// identifying fields agree; unrelated payload noise is ignored.
pub fn fingerprint(event: &RunEvent, profile: &IdentityProfile) -> String {
    let mut subset = Map::new();
    for field in profile.fields_for(&event.kind) {
        let value = lookup(&event.payload, field).cloned().unwrap_or(Value::Null);
        subset.insert(field.clone(), value);
    }

    let timestamp = event.timestamp.map(|ts| ts.to_string()).unwrap_or_default();
    let event_id = event.id.as_ref().map(|id| id.as_str()).unwrap_or_default();
    let canonical = format!(
        "{}|{}|{}|{}|{}",
        event.kind,
        timestamp,
        event.run_id,
        event_id,
        Value::Object(subset)
    );
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(payload, |value, segment| value.get(segment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use runsync_protocol::RunId;
    use serde_json::json;

    fn legacy(kind: &str, payload: Value) -> RunEvent {
        RunEvent::new(RunId::from_string("r1"), kind)
            .with_timestamp(10.0)
            .with_payload(payload)
    }

    #[test]
    fn sequence_wins_over_content() {
        let profile = IdentityProfile::default();
        let event = legacy("task_done", json!({})).with_sequence(5);
        assert_eq!(identity_of(&event, &profile), EventIdentity::Sequence(5));
    }

    #[test]
    fn ignores_fields_outside_the_profile() {
        let profile = IdentityProfile::default();
        let a = legacy("task_done", json!({"task_id": "t1", "status": "done", "note": "x"}));
        let b = legacy("task_done", json!({"task_id": "t1", "status": "done", "note": "y"}));
        assert_eq!(fingerprint(&a, &profile), fingerprint(&b, &profile));
    }

    #[test]
    fn identifying_fields_change_the_hash() {
        let profile = IdentityProfile::default();
        let a = legacy("task_done", json!({"task_id": "t1", "status": "done"}));
        let b = legacy("task_done", json!({"task_id": "t1", "status": "failed"}));
        let c = legacy("task_started", json!({"task_id": "t1", "status": "done"}));
        assert_ne!(fingerprint(&a, &profile), fingerprint(&b, &profile));
        assert_ne!(fingerprint(&a, &profile), fingerprint(&c, &profile));
    }

    #[test]
    fn per_kind_profile_reads_nested_paths() {
        let profile = IdentityProfile::default().with_kind("approval_requested", ["approval.id"]);
        let a = legacy("approval_requested", json!({"approval": {"id": "ap1", "at": 1}}));
        let b = legacy("approval_requested", json!({"approval": {"id": "ap1", "at": 2}}));
        let c = legacy("approval_requested", json!({"approval": {"id": "ap2", "at": 1}}));
        assert_eq!(fingerprint(&a, &profile), fingerprint(&b, &profile));
        assert_ne!(fingerprint(&a, &profile), fingerprint(&c, &profile));
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let hash = fingerprint(&legacy("log", Value::Null), &IdentityProfile::default());
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
