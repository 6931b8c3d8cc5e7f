use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use runsync_protocol::{
    ChannelStream, ProjectId, RunId, RunSnapshot, SnapshotSource, StreamRequest, StreamTransport,
    SyncError, SyncResult,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::config::ClientConfig;
use crate::error::{ApiError, error_detail};
use crate::models::{CreateRunRequest, RunIntentResponse, StatusResponse};
use crate::sse;

/// reqwest client for the run API.
///
/// Implements both engine ports: the preflight probe and SSE channel
/// ([`StreamTransport`]) and the snapshot fetch ([`SnapshotSource`]).
#[derive(Debug, Clone)]
pub struct HttpRunApi {
    base: Url,
    origin: String,
    token: Option<String>,
    config: ClientConfig,
    http: reqwest::Client,
}

impl HttpRunApi {
    pub fn new(config: ClientConfig) -> Result<Self, ApiError> {
        let trimmed = config.base_url.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(ApiError::InvalidUrl("base url is empty".to_owned()));
        }
        let base = Url::parse(trimmed)
            .map_err(|error| ApiError::InvalidUrl(format!("{trimmed}: {error}")))?;
        if base.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(format!("{trimmed}: not a base url")));
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(|error| ApiError::InvalidUrl(error.to_string()))?;
        Ok(Self {
            origin: base.origin().ascii_serialization(),
            token: config.token.clone(),
            base,
            config,
            http,
        })
    }

    pub fn from_env() -> Result<Self, ApiError> {
        Self::new(ClientConfig::from_env())
    }

    /// Scheme, host and port of the API, for diagnostics.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| ApiError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// `GET /runs/{id}/events` with the token and resume cursor as query
    /// parameters. A zero cursor is omitted.
    pub fn events_url(&self, request: &StreamRequest) -> Result<Url, ApiError> {
        let mut url = self.endpoint(&["runs", request.run_id.as_str(), "events"])?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(token) = request.token.as_deref().or(self.token.as_deref()) {
                query.append_pair("token", token);
            }
            if let Some(sequence) = request.resume_from.filter(|sequence| *sequence > 0) {
                query.append_pair("last_event_id", &sequence.to_string());
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }

    /// The events URL plus the one-shot `once=1` marker.
    pub fn probe_url(&self, request: &StreamRequest) -> Result<Url, ApiError> {
        let mut url = self.events_url(request)?;
        url.query_pairs_mut().append_pair("once", "1");
        Ok(url)
    }

    #[instrument(skip(self, request), fields(project_id = %project_id))]
    pub async fn create_run(
        &self,
        project_id: &ProjectId,
        request: &CreateRunRequest,
    ) -> Result<RunIntentResponse, ApiError> {
        let url = self.endpoint(&["projects", project_id.as_str(), "runs"])?;
        self.send_json(Method::POST, url, Some(request)).await
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn start_run(&self, run_id: &RunId) -> Result<StatusResponse, ApiError> {
        let url = self.endpoint(&["runs", run_id.as_str(), "start"])?;
        self.send_json::<(), _>(Method::POST, url, None).await
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn cancel_run(&self, run_id: &RunId) -> Result<StatusResponse, ApiError> {
        let url = self.endpoint(&["runs", run_id.as_str(), "cancel"])?;
        self.send_json::<(), _>(Method::POST, url, None).await
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn get_snapshot(&self, run_id: &RunId) -> Result<RunSnapshot, ApiError> {
        let url = self.endpoint(&["runs", run_id.as_str(), "snapshot"])?;
        self.send_json::<(), _>(Method::GET, url, None).await
    }

    async fn send_json<Req, Res>(
        &self,
        method: Method,
        url: Url,
        body: Option<&Req>,
    ) -> Result<Res, ApiError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        debug!(%method, path = url.path(), "api request");
        let mut request = self
            .http
            .request(method, url)
            .timeout(self.config.request_timeout);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|error| self.network(error))?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(|error| self.network(error))?;
        if !status.is_success() {
            return Err(ApiError::from_response(
                status.as_u16(),
                error_detail(&bytes, status.canonical_reason()),
            ));
        }
        serde_json::from_slice(&bytes).map_err(|error| ApiError::Decode(error.to_string()))
    }

    fn network(&self, error: reqwest::Error) -> ApiError {
        ApiError::Network {
            origin: self.origin.clone(),
            message: error.to_string(),
        }
    }

    fn preflight_error(&self, status: StatusCode) -> SyncError {
        let code = status.as_u16();
        let reason = match code {
            401 | 403 => format!("{code} (token required or invalid)"),
            404 => "run not found (404)".to_owned(),
            _ => format!("HTTP {code}"),
        };
        SyncError::from_status(
            code,
            format!("stream unavailable: {reason}. URL: {}", self.origin),
        )
    }
}

#[async_trait]
impl StreamTransport for HttpRunApi {
    #[instrument(skip(self, request), fields(run_id = %request.run_id))]
    async fn probe(&self, request: &StreamRequest) -> SyncResult<()> {
        let url = self.probe_url(request)?;
        let response = self
            .http
            .get(url)
            .header(reqwest::header::CACHE_CONTROL, "no-store")
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|error| {
                SyncError::Network(format!(
                    "stream unavailable: API unreachable ({}): {error}",
                    self.origin
                ))
            })?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let error = self.preflight_error(status);
        warn!(status = status.as_u16(), error = %error, "stream preflight rejected");
        Err(error)
    }

    fn open(&self, request: &StreamRequest) -> ChannelStream {
        match self.events_url(request) {
            Ok(url) => sse::open_channel(self.http.get(url), self.origin.clone()),
            Err(error) => sse::failed(error.to_string()),
        }
    }
}

#[async_trait]
impl SnapshotSource for HttpRunApi {
    async fn fetch_snapshot(&self, run_id: &RunId) -> SyncResult<RunSnapshot> {
        self.get_snapshot(run_id).await.map_err(SyncError::from)
    }
}
