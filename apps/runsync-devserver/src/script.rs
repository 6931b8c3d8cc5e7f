use std::time::Duration;

use runsync_protocol::RunId;
use serde_json::json;
use tracing::{debug, info};

use crate::store::RunStore;

const TASK_IDS: [&str; 3] = ["task-1", "task-2", "task-3"];

/// Walk a started run through its tasks, one event per `interval`, and
/// complete it. Stops early once the run leaves `running`.
pub(crate) async fn drive(store: RunStore, run_id: RunId, interval: Duration) {
    for (index, task_id) in TASK_IDS.iter().enumerate() {
        let step_id = format!("step-{}", index + 1);
        for (kind, status) in [
            ("task_started", "running"),
            ("task_progress", "running"),
            ("task_done", "done"),
        ] {
            tokio::time::sleep(interval).await;
            if store.status(&run_id).await.as_deref() != Some("running") {
                debug!(run_id = %run_id, "script stopped");
                return;
            }
            store.set_task_status(&run_id, task_id, status).await;
            store
                .append(
                    &run_id,
                    kind,
                    json!({ "task_id": task_id, "step_id": step_id, "status": status }),
                )
                .await;
        }
    }
    tokio::time::sleep(interval).await;
    store
        .transition(&run_id, &["running"], "completed", "run_completed")
        .await;
    info!(run_id = %run_id, "scripted run completed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use runsync_protocol::ProjectId;

    #[tokio::test(start_paused = true)]
    async fn scripted_run_completes_with_every_task_done() {
        let store = RunStore::default();
        let run = store
            .create(&ProjectId::from_string("p"), "q", "research", None, None)
            .await;
        let run_id = RunId::from_string(run["id"].as_str().unwrap());
        store
            .transition(&run_id, &["created"], "running", "run_started")
            .await;

        drive(store.clone(), run_id.clone(), Duration::from_millis(10)).await;

        let snapshot = store.snapshot(&run_id).await.unwrap();
        assert_eq!(snapshot.run_status(), Some("completed"));
        assert!(snapshot.tasks.iter().all(|task| task["status"] == "done"));
        assert_eq!(snapshot.highest_sequence(), Some(2 + 9 + 1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_stops_the_script() {
        let store = RunStore::default();
        let run = store
            .create(&ProjectId::from_string("p"), "q", "research", None, None)
            .await;
        let run_id = RunId::from_string(run["id"].as_str().unwrap());
        store
            .transition(&run_id, &["created"], "running", "run_started")
            .await;
        store
            .transition(&run_id, &["running"], "cancelled", "run_cancelled")
            .await;

        drive(store.clone(), run_id.clone(), Duration::from_millis(10)).await;
        assert_eq!(store.last_sequence(&run_id).await, Some(3));
    }
}
