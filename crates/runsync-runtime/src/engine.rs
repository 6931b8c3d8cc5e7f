//! The `RunSync` actor.
//!
//! One tokio task owns the connection machine, identity filter, event buffer
//! and reconciler, so every mutation happens in a single serialized context.
//! I/O and timers run in helper tasks that post nonce- or epoch-tagged
//! messages back to the actor and are aborted when their owner is torn down.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use runsync_events::{IdentityFilter, OrderedEventBuffer};
use runsync_protocol::{
    ChannelSignal, ConnectionState, EventFrame, RunEvent, RunSnapshot, SnapshotRecord,
    SnapshotSource, StreamRequest, StreamTransport, SyncConfig, SyncError, SyncResult,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, instrument, warn};

use crate::backoff::BackoffPolicy;
use crate::machine::{ConnectionMachine, Effect, Input};
use crate::observer::SyncObserver;
use crate::reconciler::{RefreshDecision, SnapshotReconciler, polls_in};
use crate::view::RunView;

#[derive(Debug)]
enum Command {
    Connect(StreamRequest),
    Disconnect,
    Retry,
    Refresh,
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug)]
enum Message {
    Machine(Input),
    Frame {
        nonce: u64,
        frame: EventFrame,
    },
    SnapshotFetched {
        epoch: u64,
        requested_at: DateTime<Utc>,
        result: SyncResult<RunSnapshot>,
    },
    DebounceElapsed {
        epoch: u64,
    },
    PollTick {
        epoch: u64,
    },
}

/// Handle to a running sync engine. Cheap to clone; the engine stops when
/// [`shutdown`](Self::shutdown) is called or every handle is dropped.
#[derive(Debug, Clone)]
pub struct RunSync {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    view: RunView,
}

impl RunSync {
    /// Validate `config` and start the engine task on the current runtime.
    pub fn spawn(
        config: SyncConfig,
        transport: Arc<dyn StreamTransport>,
        snapshots: Arc<dyn SnapshotSource>,
        observer: Arc<dyn SyncObserver>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let view = RunView::default();

        let actor = Actor {
            machine: ConnectionMachine::new(&config),
            filter: IdentityFilter::from_config(&config),
            buffer: OrderedEventBuffer::new(config.buffer_limit, config.identity.clone()),
            reconciler: SnapshotReconciler::new(config.refresh_debounce),
            backoff: BackoffPolicy::new(config.backoff.clone()),
            config,
            transport,
            snapshots,
            observer,
            view: view.clone(),
            state_tx,
            messages: messages_tx,
            tasks: Tasks::default(),
            debounce_armed: false,
        };
        tokio::spawn(actor.run(commands_rx, messages_rx));

        Ok(Self {
            commands: commands_tx,
            state: state_rx,
            view,
        })
    }

    /// Follow `request.run_id`. Reconnecting to the same run keeps the
    /// buffered events and resumes after the highest buffered sequence.
    pub fn connect(&self, request: StreamRequest) -> SyncResult<()> {
        self.send(Command::Connect(request))
    }

    pub fn disconnect(&self) -> SyncResult<()> {
        self.send(Command::Disconnect)
    }

    /// Reconnect to the last requested run with a fresh attempt budget.
    pub fn retry(&self) -> SyncResult<()> {
        self.send(Command::Retry)
    }

    /// Request an authoritative snapshot now.
    pub fn refresh(&self) -> SyncResult<()> {
        self.send(Command::Refresh)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Resolve once the engine reports `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> SyncResult<()> {
        let mut rx = self.state.clone();
        rx.wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| SyncError::Closed)
    }

    pub fn view(&self) -> RunView {
        self.view.clone()
    }

    /// Disconnect, cancel every helper task and stop the engine.
    pub async fn shutdown(&self) -> SyncResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(Command::Shutdown(ack_tx))?;
        ack_rx.await.map_err(|_| SyncError::Closed)
    }

    fn send(&self, command: Command) -> SyncResult<()> {
        self.commands.send(command).map_err(|_| SyncError::Closed)
    }
}

#[derive(Default)]
struct Tasks {
    probe: Option<JoinHandle<()>>,
    channel: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    poll: Option<JoinHandle<()>>,
    debounce: Option<JoinHandle<()>>,
    fetch: Option<JoinHandle<()>>,
}

fn abort(slot: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = slot.take() {
        handle.abort();
    }
}

impl Tasks {
    fn abort_all(&mut self) {
        for slot in [
            &mut self.probe,
            &mut self.channel,
            &mut self.reconnect,
            &mut self.heartbeat,
            &mut self.poll,
            &mut self.debounce,
            &mut self.fetch,
        ] {
            abort(slot);
        }
    }
}

struct Actor {
    config: SyncConfig,
    machine: ConnectionMachine,
    filter: IdentityFilter,
    buffer: OrderedEventBuffer,
    reconciler: SnapshotReconciler,
    backoff: BackoffPolicy,
    transport: Arc<dyn StreamTransport>,
    snapshots: Arc<dyn SnapshotSource>,
    observer: Arc<dyn SyncObserver>,
    view: RunView,
    state_tx: watch::Sender<ConnectionState>,
    messages: mpsc::UnboundedSender<Message>,
    tasks: Tasks,
    debounce_armed: bool,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut messages: mpsc::UnboundedReceiver<Message>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(ack)) => {
                        commands.close();
                        self.stop();
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        self.stop();
                        break;
                    }
                },
                Some(message) = messages.recv() => self.on_message(message),
            }
        }
        debug!("run sync engine stopped");
    }

    fn stop(&mut self) {
        self.apply(Input::Disconnect);
        self.tasks.abort_all();
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect(request) => self.connect(request),
            Command::Disconnect => {
                self.reconciler.suspend();
                abort(&mut self.tasks.probe);
                abort(&mut self.tasks.fetch);
                abort(&mut self.tasks.debounce);
                self.debounce_armed = false;
                self.apply(Input::Disconnect);
            }
            Command::Retry => self.apply(Input::Retry),
            Command::Refresh => self.request_refresh(),
            Command::Shutdown(_) => {}
        }
    }

    #[instrument(skip(self, request), fields(run_id = %request.run_id))]
    fn connect(&mut self, request: StreamRequest) {
        let same_run = self
            .machine
            .request()
            .is_some_and(|current| current.run_id == request.run_id);
        if !same_run {
            info!("following new run");
            self.buffer.clear();
            self.filter.reset();
            self.reconciler.reset();
            abort(&mut self.tasks.fetch);
            abort(&mut self.tasks.debounce);
            abort(&mut self.tasks.poll);
            self.debounce_armed = false;
            self.view.reset(request.run_id.clone());
        }
        self.apply(Input::Connect(request));
        self.update_poll(self.machine.state());
    }

    fn on_message(&mut self, message: Message) {
        match message {
            Message::Machine(input) => self.apply(input),
            Message::Frame { nonce, frame } => self.on_frame(nonce, frame),
            Message::SnapshotFetched {
                epoch,
                requested_at,
                result,
            } => self.on_snapshot(epoch, requested_at, result),
            Message::DebounceElapsed { epoch } => {
                self.debounce_armed = false;
                if epoch != self.reconciler.epoch() {
                    return;
                }
                if self.reconciler.take_due(Instant::now()) {
                    self.request_refresh();
                } else if let Some(deadline) = self.reconciler.debounce_deadline() {
                    self.arm_debounce(deadline);
                }
            }
            Message::PollTick { epoch } => {
                if epoch == self.reconciler.epoch() && self.polls() {
                    debug!("snapshot poll");
                    self.request_refresh();
                }
            }
        }
    }

    fn apply(&mut self, input: Input) {
        let effects = self.machine.handle(input, Instant::now());
        for effect in effects {
            self.execute(effect);
        }
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::State(state) => {
                self.state_tx.send_replace(state);
                self.observer.on_state_change(state);
                self.update_poll(state);
            }
            Effect::Error(error) => self.observer.on_error(&error),
            Effect::StartProbe { nonce, request } => {
                let request = self.with_resume_cursor(request);
                let transport = Arc::clone(&self.transport);
                let messages = self.messages.clone();
                let limit = self.config.preflight_timeout;
                abort(&mut self.tasks.probe);
                self.tasks.probe = Some(tokio::spawn(async move {
                    let result = match time::timeout(limit, transport.probe(&request)).await {
                        Ok(result) => result,
                        Err(_) => Err(SyncError::Network(format!(
                            "preflight timed out after {}ms",
                            limit.as_millis()
                        ))),
                    };
                    let _ = messages.send(Message::Machine(Input::ProbeFinished { nonce, result }));
                }));
            }
            Effect::OpenChannel { nonce, request } => {
                let request = self.with_resume_cursor(request);
                debug!(nonce, resume_from = ?request.resume_from, "opening event channel");
                let mut stream = self.transport.open(&request);
                let messages = self.messages.clone();
                abort(&mut self.tasks.channel);
                self.tasks.channel = Some(tokio::spawn(async move {
                    while let Some(signal) = stream.next().await {
                        let message = match signal {
                            ChannelSignal::Opened => Message::Machine(Input::ChannelOpened { nonce }),
                            ChannelSignal::Frame(frame) => Message::Frame { nonce, frame },
                            ChannelSignal::Failed(reason) => {
                                let _ = messages
                                    .send(Message::Machine(Input::ChannelFailed { nonce, reason }));
                                return;
                            }
                        };
                        if messages.send(message).is_err() {
                            return;
                        }
                    }
                    let _ = messages.send(Message::Machine(Input::ChannelFailed {
                        nonce,
                        reason: "event stream ended".to_owned(),
                    }));
                }));
            }
            Effect::CloseChannel => abort(&mut self.tasks.channel),
            Effect::ScheduleReconnect { nonce, attempt } => {
                let delay = self.backoff.next_delay(attempt);
                info!(
                    nonce,
                    attempt,
                    max_attempts = self.backoff.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "reconnect scheduled"
                );
                let messages = self.messages.clone();
                abort(&mut self.tasks.reconnect);
                self.tasks.reconnect = Some(tokio::spawn(async move {
                    time::sleep(delay).await;
                    let _ = messages.send(Message::Machine(Input::ReconnectDue { nonce }));
                }));
            }
            Effect::CancelReconnect => abort(&mut self.tasks.reconnect),
            Effect::StartHeartbeat { nonce } => {
                let period = self.config.heartbeat_check;
                let messages = self.messages.clone();
                abort(&mut self.tasks.heartbeat);
                self.tasks.heartbeat = Some(tokio::spawn(async move {
                    let mut ticker = time::interval_at(Instant::now() + period, period);
                    loop {
                        ticker.tick().await;
                        if messages
                            .send(Message::Machine(Input::HeartbeatCheck { nonce }))
                            .is_err()
                        {
                            return;
                        }
                    }
                }));
            }
            Effect::StopHeartbeat => abort(&mut self.tasks.heartbeat),
            Effect::Reconnected => {
                info!("event stream recovered");
                self.observer.on_reconnected();
                if self.config.refresh_on_reconnect {
                    self.request_refresh();
                }
            }
        }
    }

    /// Resume after the highest buffered sequence when there is one.
    fn with_resume_cursor(&self, mut request: StreamRequest) -> StreamRequest {
        if let Some(sequence) = self.buffer.highest_sequence() {
            request.resume_from = Some(sequence);
        }
        request
    }

    fn on_frame(&mut self, nonce: u64, frame: EventFrame) {
        if nonce != self.machine.nonce() {
            debug!(nonce, "dropping frame from superseded channel");
            return;
        }
        self.apply(Input::ChannelFrame { nonce });
        if frame.is_keepalive() {
            return;
        }
        if !self.config.accepts_frame(&frame.name) {
            debug!(name = %frame.name, "ignoring unsubscribed frame");
            return;
        }
        let Some(run_id) = self.machine.request().map(|r| r.run_id.clone()) else {
            return;
        };
        let event = match frame.decode(&run_id) {
            Ok(event) => event,
            Err(error) => {
                warn!(error = %error, "dropping malformed frame");
                self.observer.on_error(&error);
                return;
            }
        };
        if event.run_id != run_id {
            debug!(other = %event.run_id, "dropping event for another run");
            return;
        }
        let kind = event.kind.clone();
        if self.ingest(event) {
            self.publish();
            if self.config.refresh_triggers.triggers(&kind) {
                let deadline = self.reconciler.defer(Instant::now());
                if !self.debounce_armed {
                    self.arm_debounce(deadline);
                }
            }
        }
    }

    /// Run one event through the filter and into the buffer. Returns `true`
    /// when the event is new and retained.
    fn ingest(&mut self, event: RunEvent) -> bool {
        if !self.filter.admit(&event) {
            return false;
        }
        let outcome = self.buffer.merge(std::iter::once(event.clone()));
        self.filter.forget_sequences(&outcome.evicted_sequences);
        if outcome.accepted == 0 {
            return false;
        }
        debug!(sequence = ?event.sequence, kind = %event.kind, "event admitted");
        self.observer.on_event(&event);
        true
    }

    fn publish(&self) {
        self.view
            .publish_events(self.buffer.to_vec(), self.buffer.highest_sequence());
    }

    fn request_refresh(&mut self) {
        if self.machine.request().is_none() {
            debug!("refresh requested with no run");
            return;
        }
        if self.machine.is_terminal() {
            debug!("refresh skipped, server refused the run");
            return;
        }
        if self.reconciler.request() == RefreshDecision::Start {
            self.spawn_fetch();
        }
    }

    fn spawn_fetch(&mut self) {
        let Some(run_id) = self.machine.request().map(|r| r.run_id.clone()) else {
            return;
        };
        let snapshots = Arc::clone(&self.snapshots);
        let messages = self.messages.clone();
        let epoch = self.reconciler.epoch();
        let requested_at = Utc::now();
        debug!(run_id = %run_id, epoch, "fetching snapshot");
        self.tasks.fetch = Some(tokio::spawn(async move {
            let result = snapshots.fetch_snapshot(&run_id).await;
            let _ = messages.send(Message::SnapshotFetched {
                epoch,
                requested_at,
                result,
            });
        }));
    }

    fn on_snapshot(
        &mut self,
        epoch: u64,
        requested_at: DateTime<Utc>,
        result: SyncResult<RunSnapshot>,
    ) {
        let Some(follow_up) = self.reconciler.complete(epoch) else {
            return;
        };
        match result {
            Ok(snapshot) => {
                let record = SnapshotRecord::new(snapshot, requested_at);
                let run_id = self.machine.request().map(|r| r.run_id.clone());
                let mut replayed = 0;
                for event in record.snapshot.last_events.iter().cloned() {
                    if run_id.as_ref() != Some(&event.run_id) {
                        debug!(other = %event.run_id, "dropping snapshot event for another run");
                        continue;
                    }
                    if self.ingest(event) {
                        replayed += 1;
                    }
                }
                if replayed > 0 {
                    debug!(replayed, "snapshot tail filled missed events");
                }
                self.publish();
                if self.reconciler.accept(record.clone()) {
                    self.view.publish_snapshot(record.clone());
                    self.observer.on_snapshot(&record);
                }
            }
            Err(error) => {
                warn!(error = %error, "snapshot fetch failed");
                self.observer.on_error(&error);
            }
        }
        if follow_up {
            self.spawn_fetch();
        }
    }

    fn arm_debounce(&mut self, deadline: Instant) {
        let messages = self.messages.clone();
        let epoch = self.reconciler.epoch();
        self.debounce_armed = true;
        self.tasks.debounce = Some(tokio::spawn(async move {
            time::sleep_until(deadline).await;
            let _ = messages.send(Message::DebounceElapsed { epoch });
        }));
    }

    /// Polling stands in for the push channel while it is down, unless the
    /// server refused the run outright.
    fn polls(&self) -> bool {
        polls_in(self.machine.state()) && !self.machine.is_terminal()
    }

    fn update_poll(&mut self, state: ConnectionState) {
        if !polls_in(state) || self.machine.is_terminal() {
            abort(&mut self.tasks.poll);
            return;
        }
        if self.tasks.poll.is_some() {
            return;
        }
        let period = self.config.poll_interval;
        let messages = self.messages.clone();
        let epoch = self.reconciler.epoch();
        self.tasks.poll = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if messages.send(Message::PollTick { epoch }).is_err() {
                    return;
                }
            }
        }));
    }
}
