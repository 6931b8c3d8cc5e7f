//! In-memory stand-in for the run API.
//!
//! Serves the same routes the client uses under `/api/v1`: run create, start
//! and cancel, the snapshot, and the per-run SSE stream with `last_event_id`
//! replay and the `once=1` preflight.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::extract::{Path, Query, State};
use axum::http::header::{AUTHORIZATION, CACHE_CONTROL};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use runsync_protocol::{KEEPALIVE_EVENT, ProjectId, RunEvent, RunId, RunSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

mod script;
pub mod store;

pub use store::{RunStore, Transition};

pub const API_PREFIX: &str = "/api/v1";
pub const ALLOWED_MODES: [&str; 4] = [
    "plan_only",
    "research",
    "execute_confirm",
    "autopilot_safe",
];

#[derive(Debug, Clone)]
pub struct DevServerConfig {
    /// Required on every request when set: bearer header for REST calls,
    /// `?token=` on the event stream.
    pub token: Option<String>,
    /// Delay between scripted events once a run is started. `None` leaves
    /// started runs idle so tests can append events themselves.
    pub step_interval: Option<Duration>,
    pub keep_alive: Duration,
}

impl Default for DevServerConfig {
    fn default() -> Self {
        Self {
            token: None,
            step_interval: None,
            keep_alive: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
pub struct DevServer {
    store: RunStore,
    config: Arc<DevServerConfig>,
}

impl DevServer {
    pub fn new(config: DevServerConfig) -> Self {
        Self {
            store: RunStore::default(),
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub fn router(&self) -> Router {
        let api = Router::new()
            .route("/projects/{project_id}/runs", post(create_run))
            .route("/runs/{run_id}/start", post(start_run))
            .route("/runs/{run_id}/cancel", post(cancel_run))
            .route("/runs/{run_id}/snapshot", get(get_snapshot))
            .route("/runs/{run_id}/events", get(stream_events));
        Router::new()
            .route("/healthz", get(healthz))
            .nest(API_PREFIX, api)
            .with_state(self.clone())
    }
}

#[derive(Debug, Deserialize)]
struct CreateRunBody {
    query_text: String,
    mode: String,
    parent_run_id: Option<String>,
    purpose: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    status: String,
}

#[derive(Debug, Deserialize, Default)]
struct EventStreamQuery {
    token: Option<String>,
    last_event_id: Option<u64>,
    once: Option<String>,
}

#[derive(Debug)]
struct DevError {
    status: StatusCode,
    detail: String,
}

impl DevError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "invalid token")
    }

    fn run_not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "run not found")
    }
}

impl IntoResponse for DevError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

type DevResult<T> = Result<T, DevError>;

async fn healthz() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "runsync-devserver"
    }))
}

fn authorize_bearer(config: &DevServerConfig, headers: &HeaderMap) -> DevResult<()> {
    let Some(expected) = config.token.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if presented == Some(expected) {
        Ok(())
    } else {
        Err(DevError::unauthorized())
    }
}

fn authorize_query(config: &DevServerConfig, token: Option<&str>) -> DevResult<()> {
    match config.token.as_deref() {
        Some(expected) if token != Some(expected) => Err(DevError::unauthorized()),
        _ => Ok(()),
    }
}

async fn create_run(
    Path(project_id): Path<String>,
    State(server): State<DevServer>,
    headers: HeaderMap,
    Json(body): Json<CreateRunBody>,
) -> DevResult<Json<Value>> {
    authorize_bearer(&server.config, &headers)?;
    let query_text = body.query_text.trim();
    if query_text.is_empty() {
        return Err(DevError::bad_request("query_text must not be empty"));
    }
    if !ALLOWED_MODES.contains(&body.mode.as_str()) {
        return Err(DevError::bad_request(format!(
            "mode must be one of {}",
            ALLOWED_MODES.join(", ")
        )));
    }

    let project_id = ProjectId::from_string(project_id);
    let run = server
        .store
        .create(
            &project_id,
            query_text,
            &body.mode,
            body.parent_run_id,
            body.purpose.clone(),
        )
        .await;
    let plan = match run["id"].as_str() {
        Some(id) => server.store.plan(&RunId::from_string(id)).await,
        None => None,
    };
    info!(project_id = %project_id, run_id = %run["id"], "run created");

    Ok(Json(json!({
        "kind": "act",
        "intent": {
            "query_text": query_text,
            "mode": body.mode,
            "purpose": body.purpose,
        },
        "run": run,
        "plan": plan,
    })))
}

async fn start_run(
    Path(run_id): Path<String>,
    State(server): State<DevServer>,
    headers: HeaderMap,
) -> DevResult<Json<StatusBody>> {
    authorize_bearer(&server.config, &headers)?;
    let run_id = RunId::from_string(run_id);
    transition(&server.store, &run_id, &["created"], "running", "run_started").await?;
    if let Some(interval) = server.config.step_interval {
        tokio::spawn(script::drive(server.store.clone(), run_id.clone(), interval));
    }
    info!(run_id = %run_id, "run started");
    Ok(Json(StatusBody {
        status: "running".to_owned(),
    }))
}

async fn cancel_run(
    Path(run_id): Path<String>,
    State(server): State<DevServer>,
    headers: HeaderMap,
) -> DevResult<Json<StatusBody>> {
    authorize_bearer(&server.config, &headers)?;
    let run_id = RunId::from_string(run_id);
    transition(
        &server.store,
        &run_id,
        &["created", "running"],
        "cancelled",
        "run_cancelled",
    )
    .await?;
    info!(run_id = %run_id, "run cancelled");
    Ok(Json(StatusBody {
        status: "cancelled".to_owned(),
    }))
}

async fn transition(
    store: &RunStore,
    run_id: &RunId,
    from: &[&str],
    to: &str,
    kind: &str,
) -> DevResult<()> {
    match store.transition(run_id, from, to, kind).await {
        Transition::Applied => Ok(()),
        Transition::Rejected { current } => Err(DevError::new(
            StatusCode::CONFLICT,
            format!("run is {current}"),
        )),
        Transition::UnknownRun => Err(DevError::run_not_found()),
    }
}

async fn get_snapshot(
    Path(run_id): Path<String>,
    State(server): State<DevServer>,
    headers: HeaderMap,
) -> DevResult<Json<RunSnapshot>> {
    authorize_bearer(&server.config, &headers)?;
    server
        .store
        .snapshot(&RunId::from_string(run_id))
        .await
        .map(Json)
        .ok_or_else(DevError::run_not_found)
}

async fn stream_events(
    Path(run_id): Path<String>,
    Query(query): Query<EventStreamQuery>,
    State(server): State<DevServer>,
) -> DevResult<Response> {
    authorize_query(&server.config, query.token.as_deref())?;
    let run_id = RunId::from_string(run_id);

    if query.once.as_deref() == Some("1") {
        let last_sequence = server
            .store
            .last_sequence(&run_id)
            .await
            .ok_or_else(DevError::run_not_found)?;
        return Ok(Json(json!({ "status": "ok", "last_seq": last_sequence })).into_response());
    }

    let after = query.last_event_id.unwrap_or(0);
    let (replay, mut live) = server
        .store
        .subscribe(&run_id, after)
        .await
        .ok_or_else(DevError::run_not_found)?;
    info!(run_id = %run_id, after, replay = replay.len(), "event stream opened");

    let stream = stream! {
        let mut next_sequence = after.saturating_add(1);
        for event in replay {
            next_sequence = event.sequence.map_or(next_sequence, |s| s.saturating_add(1));
            yield Ok::<Event, Infallible>(as_sse_event(&event));
        }

        loop {
            match live.recv().await {
                Ok(event) => {
                    let Some(sequence) = event.sequence else { continue };
                    if sequence < next_sequence {
                        continue;
                    }
                    next_sequence = sequence.saturating_add(1);
                    yield Ok(as_sse_event(&event));
                }
                // End the stream; the client resumes from its cursor.
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged");
                    break;
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(server.config.keep_alive)
            .event(Event::default().event(KEEPALIVE_EVENT).data("{}")),
    );
    let mut response = sse.into_response();
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(response)
}

fn as_sse_event(event: &RunEvent) -> Event {
    let payload = serde_json::to_string(event)
        .unwrap_or_else(|error| json!({ "error": error.to_string() }).to_string());
    let sse = Event::default().event(event.kind.as_str()).data(payload);
    match event.sequence {
        Some(sequence) => sse.id(sequence.to_string()),
        None => sse,
    }
}
