//! # runsync
//!
//! Keeps a local view of a server-executed run consistent with the server's
//! event stream across disconnects, duplicates and out-of-order delivery.
//!
//! ```no_run
//! # async fn demo() -> runsync::SyncResult<()> {
//! use runsync::{ClientConfig, RunId, RunSyncBuilder};
//!
//! let client = RunSyncBuilder::new(ClientConfig::from_env()).build()?;
//! client.follow(RunId::from_string("run-1"))?;
//! client.sync().wait_for_state(runsync::ConnectionState::Open).await?;
//! println!("{} events", client.sync().view().len());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tracing::instrument;

pub use runsync_client::{
    ApiError, ApiErrorCode, ClientConfig, CreateRunRequest, DEFAULT_API_BASE_URL, HttpRunApi,
    RunIntentResponse, StatusResponse,
};
pub use runsync_events::{OrderedEventBuffer, merge_events};
pub use runsync_protocol::{
    BackoffConfig, ConnectionState, ErrorCategory, EventFrame, IdentityProfile, ProjectId,
    RefreshTriggers, RunEvent, RunId, RunSnapshot, SnapshotRecord, SnapshotSource, StreamRequest,
    StreamTransport, SyncConfig, SyncError, SyncResult,
};
pub use runsync_runtime::{ChannelObserver, NoopObserver, RunSync, RunView, SyncNotice, SyncObserver};

/// Wires the HTTP client into a running sync engine.
#[derive(Clone)]
pub struct RunSyncBuilder {
    client: ClientConfig,
    config: SyncConfig,
    observer: Arc<dyn SyncObserver>,
}

impl RunSyncBuilder {
    pub fn new(client: ClientConfig) -> Self {
        Self {
            client,
            config: SyncConfig::default(),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn from_env() -> Self {
        Self::new(ClientConfig::from_env())
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Spawns the engine, so this must run inside a tokio runtime.
    pub fn build(self) -> SyncResult<RunSyncClient> {
        let api = Arc::new(HttpRunApi::new(self.client)?);
        let sync = RunSync::spawn(self.config, api.clone(), api.clone(), self.observer)?;
        Ok(RunSyncClient { api, sync })
    }
}

/// The run API plus the engine following one run at a time.
#[derive(Debug, Clone)]
pub struct RunSyncClient {
    api: Arc<HttpRunApi>,
    sync: RunSync,
}

impl RunSyncClient {
    pub fn api(&self) -> &HttpRunApi {
        &self.api
    }

    pub fn sync(&self) -> &RunSync {
        &self.sync
    }

    /// Start following `run_id`; the configured token is sent on the stream.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub fn follow(&self, run_id: RunId) -> SyncResult<()> {
        self.sync.connect(StreamRequest::new(run_id))
    }

    /// Create a run in `project_id` and follow it when the server planned one.
    #[instrument(skip(self, request), fields(project_id = %project_id))]
    pub async fn create_and_follow(
        &self,
        project_id: &ProjectId,
        request: &CreateRunRequest,
    ) -> SyncResult<RunIntentResponse> {
        let response = self.api.create_run(project_id, request).await?;
        if let Some(run_id) = response.run_id() {
            self.follow(RunId::from_string(run_id))?;
        }
        Ok(response)
    }

    pub async fn shutdown(&self) -> SyncResult<()> {
        self.sync.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn invalid_base_url_is_a_config_error() {
        let result = RunSyncBuilder::new(ClientConfig::new("not a url")).build();
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn invalid_engine_config_is_rejected() {
        let config = SyncConfig {
            buffer_limit: 0,
            ..SyncConfig::default()
        };
        let result = RunSyncBuilder::new(ClientConfig::default())
            .config(config)
            .build();
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn unreachable_api_schedules_a_reconnect() -> anyhow::Result<()> {
        let (observer, mut notices) = ChannelObserver::new();
        let client = RunSyncBuilder::new(ClientConfig::new("http://127.0.0.1:9/api/v1"))
            .observer(Arc::new(observer))
            .build()?;
        client.follow(RunId::from_string("run-1"))?;

        tokio::time::timeout(
            Duration::from_secs(10),
            client.sync().wait_for_state(ConnectionState::Reconnecting),
        )
        .await??;

        let mut saw_network_error = false;
        while let Ok(notice) = notices.try_recv() {
            if let SyncNotice::Error(error) = notice {
                saw_network_error |= error.category() == ErrorCategory::Network;
            }
        }
        assert!(saw_network_error);
        client.shutdown().await?;
        Ok(())
    }
}
