use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use runsync::{
    ChannelObserver, ClientConfig, CreateRunRequest, ProjectId, RefreshTriggers,
    RunId, RunSyncBuilder, SnapshotRecord, SyncConfig, SyncNotice,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const FINISHED_STATUSES: [&str; 3] = ["completed", "cancelled", "failed"];

#[derive(Debug, Parser)]
#[command(name = "runsync-watch")]
#[command(about = "Follow a run and print its events and connection state")]
struct Cli {
    /// Run to follow. Omit it and pass --project and --query to create one.
    #[arg(required_unless_present = "query", conflicts_with = "query")]
    run_id: Option<String>,
    #[arg(long, env = "RUNSYNC_API_BASE_URL", default_value = runsync::DEFAULT_API_BASE_URL)]
    base_url: String,
    #[arg(long, env = "RUNSYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,
    #[arg(long, requires = "query")]
    project: Option<String>,
    #[arg(long, requires = "project")]
    query: Option<String>,
    #[arg(long, default_value = "plan_only")]
    mode: String,
    /// Start the run right after creating it.
    #[arg(long)]
    start: bool,
    /// Only accept these event types (repeatable). Default: every type.
    #[arg(long = "event-type")]
    event_types: Vec<String>,
    /// Only these event types trigger a snapshot refresh (repeatable).
    #[arg(long = "refresh-on")]
    refresh_on: Vec<String>,
    #[arg(long, default_value_t = 25)]
    heartbeat_timeout_secs: u64,
    #[arg(long, default_value_t = 6)]
    max_attempts: u32,
    #[arg(long, default_value_t = 5)]
    poll_secs: u64,
    /// Exit once a snapshot reports the run finished.
    #[arg(long)]
    exit_on_finish: bool,
}

impl Cli {
    fn sync_config(&self) -> SyncConfig {
        let mut config = SyncConfig {
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            poll_interval: Duration::from_secs(self.poll_secs.max(1)),
            event_types: self.event_types.iter().cloned().collect(),
            ..SyncConfig::default()
        };
        config.heartbeat_check = config.heartbeat_check.min(config.heartbeat_timeout);
        config.backoff.max_attempts = self.max_attempts;
        if !self.refresh_on.is_empty() {
            config.refresh_triggers = RefreshTriggers::kinds(self.refresh_on.iter().cloned());
        }
        config
    }

    fn client_config(&self) -> ClientConfig {
        let config = ClientConfig::new(self.base_url.clone());
        match &self.token {
            Some(token) => config.with_token(token.clone()),
            None => config,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();

    let cli = Cli::parse();
    let (observer, mut notices) = ChannelObserver::new();
    let client = RunSyncBuilder::new(cli.client_config())
        .config(cli.sync_config())
        .observer(Arc::new(observer))
        .build()
        .context("failed to start run sync")?;

    let run_id = match (&cli.run_id, &cli.project, &cli.query) {
        (Some(run_id), _, _) => {
            let run_id = RunId::from_string(run_id.clone());
            client.follow(run_id.clone())?;
            run_id
        }
        (None, Some(project), Some(query)) => {
            let response = client
                .create_and_follow(
                    &ProjectId::from_string(project.clone()),
                    &CreateRunRequest::new(query.clone(), cli.mode.clone()),
                )
                .await
                .context("failed to create run")?;
            info!(kind = %response.kind, "run created");
            if let Some(answer) = &response.chat_response {
                info!(answer = %answer, "chat response");
            }
            for question in response.questions.iter().flatten() {
                info!(question = %question, "clarification needed");
            }
            let Some(run_id) = response.run_id() else {
                bail!("server did not return a run id");
            };
            RunId::from_string(run_id)
        }
        _ => bail!("pass a run id, or --project and --query"),
    };

    if cli.start {
        let status = client
            .api()
            .start_run(&run_id)
            .await
            .context("failed to start run")?;
        info!(run_id = %run_id, status = %status.status, "run start requested");
    }

    let outcome = loop {
        tokio::select! {
            notice = notices.recv() => {
                let Some(notice) = notice else {
                    break Ok(());
                };
                match notice {
                    SyncNotice::Event(event) => {
                        info!(
                            seq = ?event.sequence,
                            kind = %event.kind,
                            task_id = ?event.task_id,
                            message = ?event.message,
                            "event"
                        );
                    }
                    SyncNotice::State(state) => {
                        info!(%state, "connection");
                        if state.requires_consumer_action() {
                            break Err(anyhow::anyhow!(
                                "stream {state}; check the run id, token and API ({})",
                                client.api().origin()
                            ));
                        }
                    }
                    SyncNotice::Error(error) => {
                        warn!(category = %error.category(), %error, "sync error");
                    }
                    SyncNotice::Reconnected => info!("reconnected"),
                    SyncNotice::Snapshot(record) => {
                        log_snapshot(&record);
                        if cli.exit_on_finish && is_finished(&record) {
                            break Ok(());
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break Ok(()),
        }
    };

    client.shutdown().await?;
    outcome
}

fn log_snapshot(record: &SnapshotRecord) {
    let snapshot = &record.snapshot;
    info!(
        status = snapshot.run_status().unwrap_or("unknown"),
        tasks = snapshot.tasks.len(),
        tail = snapshot.last_events.len(),
        latency_ms = (record.received_at - record.requested_at).num_milliseconds(),
        "snapshot"
    );
}

fn is_finished(record: &SnapshotRecord) -> bool {
    record
        .snapshot
        .run_status()
        .is_some_and(|status| FINISHED_STATUSES.contains(&status))
}
