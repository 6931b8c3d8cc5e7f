//! In-memory runs with an append-only event log per run.

use std::sync::Arc;

use chrono::Utc;
use indexmap::IndexMap;
use runsync_protocol::{EventId, ProjectId, RunEvent, RunId, RunSnapshot};
use serde_json::{Value, json};
use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

/// Events kept in the snapshot's `last_events` tail.
pub const SNAPSHOT_TAIL: usize = 50;
const LIVE_CAPACITY: usize = 256;
const PLAN_STEPS: [&str; 3] = ["Gather context", "Draft answer", "Review findings"];

struct RunEntry {
    run: Value,
    plan: Vec<Value>,
    tasks: Vec<Value>,
    events: Vec<RunEvent>,
    live: broadcast::Sender<RunEvent>,
}

impl RunEntry {
    fn status(&self) -> &str {
        self.run
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    fn append(&mut self, run_id: &RunId, kind: &str, payload: Value) -> RunEvent {
        let sequence = self.events.len() as u64 + 1;
        let event = RunEvent::new(run_id.clone(), kind)
            .with_id(EventId::from_string(format!("{run_id}-{sequence}")))
            .with_sequence(sequence)
            .with_timestamp(Utc::now().timestamp_millis() as f64 / 1000.0)
            .with_payload(payload);
        self.events.push(event.clone());
        // No live subscribers is fine; replay covers late joiners.
        let _ = self.live.send(event.clone());
        event
    }
}

/// Outcome of a status change request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Applied,
    Rejected { current: String },
    UnknownRun,
}

#[derive(Clone, Default)]
pub struct RunStore {
    runs: Arc<RwLock<IndexMap<RunId, RunEntry>>>,
}

impl RunStore {
    pub async fn create(
        &self,
        project_id: &ProjectId,
        query_text: &str,
        mode: &str,
        parent_run_id: Option<String>,
        purpose: Option<String>,
    ) -> Value {
        let run_id = RunId::from_string(Uuid::new_v4().to_string());
        let run = json!({
            "id": run_id,
            "project_id": project_id,
            "query_text": query_text,
            "mode": mode,
            "status": "created",
            "parent_run_id": parent_run_id,
            "purpose": purpose,
            "created_at": Utc::now().to_rfc3339(),
        });
        let plan: Vec<Value> = PLAN_STEPS
            .iter()
            .enumerate()
            .map(|(index, title)| json!({ "id": format!("step-{}", index + 1), "title": title }))
            .collect();
        let tasks = (1..=PLAN_STEPS.len())
            .map(|index| {
                json!({
                    "id": format!("task-{index}"),
                    "step_id": format!("step-{index}"),
                    "status": "pending",
                })
            })
            .collect();
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        let mut entry = RunEntry {
            run: run.clone(),
            plan,
            tasks,
            events: Vec::new(),
            live,
        };
        entry.append(&run_id, "run_created", json!({ "status": "created" }));
        self.runs.write().await.insert(run_id, entry);
        run
    }

    pub async fn contains(&self, run_id: &RunId) -> bool {
        self.runs.read().await.contains_key(run_id)
    }

    pub async fn plan(&self, run_id: &RunId) -> Option<Vec<Value>> {
        self.runs.read().await.get(run_id).map(|entry| entry.plan.clone())
    }

    /// Append an event with the next sequence and fan it out to live streams.
    pub async fn append(&self, run_id: &RunId, kind: &str, payload: Value) -> Option<RunEvent> {
        let mut runs = self.runs.write().await;
        let entry = runs.get_mut(run_id)?;
        Some(entry.append(run_id, kind, payload))
    }

    /// Move the run to `to` when its status is one of `from`, recording a
    /// `kind` event.
    pub async fn transition(
        &self,
        run_id: &RunId,
        from: &[&str],
        to: &str,
        kind: &str,
    ) -> Transition {
        let mut runs = self.runs.write().await;
        let Some(entry) = runs.get_mut(run_id) else {
            return Transition::UnknownRun;
        };
        if !from.contains(&entry.status()) {
            return Transition::Rejected {
                current: entry.status().to_owned(),
            };
        }
        entry.run["status"] = Value::from(to);
        entry.append(run_id, kind, json!({ "status": to }));
        Transition::Applied
    }

    pub async fn status(&self, run_id: &RunId) -> Option<String> {
        self.runs
            .read()
            .await
            .get(run_id)
            .map(|entry| entry.status().to_owned())
    }

    pub async fn set_task_status(&self, run_id: &RunId, task_id: &str, status: &str) {
        let mut runs = self.runs.write().await;
        let Some(entry) = runs.get_mut(run_id) else {
            return;
        };
        if let Some(task) = entry
            .tasks
            .iter_mut()
            .find(|task| task.get("id").and_then(Value::as_str) == Some(task_id))
        {
            task["status"] = Value::from(status);
        }
    }

    pub async fn snapshot(&self, run_id: &RunId) -> Option<RunSnapshot> {
        let runs = self.runs.read().await;
        let entry = runs.get(run_id)?;
        let tail_start = entry.events.len().saturating_sub(SNAPSHOT_TAIL);
        Some(RunSnapshot {
            run: entry.run.clone(),
            plan: entry.plan.clone(),
            tasks: entry.tasks.clone(),
            metrics: json!({ "event_count": entry.events.len() }),
            last_events: entry.events[tail_start..].to_vec(),
            ..RunSnapshot::default()
        })
    }

    /// Events after `after` plus a live receiver, taken under one lock so
    /// nothing falls between replay and subscription.
    pub async fn subscribe(
        &self,
        run_id: &RunId,
        after: u64,
    ) -> Option<(Vec<RunEvent>, broadcast::Receiver<RunEvent>)> {
        let runs = self.runs.read().await;
        let entry = runs.get(run_id)?;
        let replay = entry
            .events
            .iter()
            .filter(|event| event.sequence.is_some_and(|sequence| sequence > after))
            .cloned()
            .collect();
        Some((replay, entry.live.subscribe()))
    }

    pub async fn last_sequence(&self, run_id: &RunId) -> Option<u64> {
        let runs = self.runs.read().await;
        let entry = runs.get(run_id)?;
        Some(entry.events.len() as u64)
    }

    /// End every open event stream for `run_id`. Subscribers see the stream
    /// close and have to reconnect.
    pub async fn drop_streams(&self, run_id: &RunId) -> bool {
        let mut runs = self.runs.write().await;
        let Some(entry) = runs.get_mut(run_id) else {
            return false;
        };
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        entry.live = live;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> (RunStore, RunId) {
        let store = RunStore::default();
        let run = store
            .create(&ProjectId::from_string("p1"), "summarize", "research", None, None)
            .await;
        let run_id = RunId::from_string(run["id"].as_str().unwrap());
        (store, run_id)
    }

    #[tokio::test]
    async fn sequences_are_dense_from_one() {
        let (store, run_id) = seeded().await;
        store.append(&run_id, "task_started", json!({})).await.unwrap();
        let event = store.append(&run_id, "task_done", json!({})).await.unwrap();
        assert_eq!(event.sequence, Some(3));
        assert_eq!(store.last_sequence(&run_id).await, Some(3));
    }

    #[tokio::test]
    async fn replay_starts_after_the_cursor() {
        let (store, run_id) = seeded().await;
        for _ in 0..4 {
            store.append(&run_id, "task_progress", json!({})).await;
        }
        let (replay, _live) = store.subscribe(&run_id, 3).await.unwrap();
        let sequences: Vec<_> = replay.iter().filter_map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![4, 5]);
    }

    #[tokio::test]
    async fn transitions_respect_the_current_status() {
        let (store, run_id) = seeded().await;
        assert_eq!(
            store
                .transition(&run_id, &["created"], "running", "run_started")
                .await,
            Transition::Applied
        );
        assert_eq!(
            store
                .transition(&run_id, &["created"], "running", "run_started")
                .await,
            Transition::Rejected {
                current: "running".to_owned()
            }
        );
        let snapshot = store.snapshot(&run_id).await.unwrap();
        assert_eq!(snapshot.run_status(), Some("running"));
        assert_eq!(snapshot.last_events.last().unwrap().kind, "run_started");
        assert_eq!(
            store
                .transition(&RunId::from_string("nope"), &["created"], "running", "run_started")
                .await,
            Transition::UnknownRun
        );
    }

    #[tokio::test]
    async fn dropping_streams_closes_live_receivers() {
        let (store, run_id) = seeded().await;
        let (_, mut live) = store.subscribe(&run_id, 0).await.unwrap();
        assert!(store.drop_streams(&run_id).await);
        assert!(matches!(
            live.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn snapshot_tail_is_bounded() {
        let (store, run_id) = seeded().await;
        for _ in 0..(SNAPSHOT_TAIL + 10) {
            store.append(&run_id, "task_progress", json!({})).await;
        }
        let snapshot = store.snapshot(&run_id).await.unwrap();
        assert_eq!(snapshot.last_events.len(), SNAPSHOT_TAIL);
        assert_eq!(snapshot.highest_sequence(), Some(SNAPSHOT_TAIL as u64 + 11));
    }
}
