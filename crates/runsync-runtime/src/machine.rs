//! Connection lifecycle as a pure state machine.
//!
//! The machine owns no timers and no sockets. It consumes [`Input`]s and
//! returns the [`Effect`]s the driver must carry out. Every asynchronous
//! result is tagged with the nonce of the attempt that started it; inputs
//! carrying an old nonce are dropped without effect.

use std::time::Duration;

use runsync_protocol::{ConnectionState, StreamRequest, SyncConfig, SyncError, SyncResult};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// Consumer asked to follow a run. Resets the attempt counter.
    Connect(StreamRequest),
    /// Manual retry of the last requested run.
    Retry,
    Disconnect,
    ProbeFinished { nonce: u64, result: SyncResult<()> },
    ChannelOpened { nonce: u64 },
    /// Any frame, accepted or not. Only refreshes liveness.
    ChannelFrame { nonce: u64 },
    ChannelFailed { nonce: u64, reason: String },
    HeartbeatCheck { nonce: u64 },
    ReconnectDue { nonce: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    State(ConnectionState),
    Error(SyncError),
    StartProbe { nonce: u64, request: StreamRequest },
    OpenChannel { nonce: u64, request: StreamRequest },
    CloseChannel,
    /// Arm the single reconnect timer. The driver picks the delay.
    ScheduleReconnect { nonce: u64, attempt: u32 },
    CancelReconnect,
    StartHeartbeat { nonce: u64 },
    StopHeartbeat,
    /// The channel is open again after a reconnect; events may have been missed.
    Reconnected,
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    nonce: u64,
    attempt: u32,
    max_attempts: u32,
    heartbeat_timeout: Duration,
    request: Option<StreamRequest>,
    last_activity: Option<Instant>,
    reconnect_pending: bool,
    channel_active: bool,
    heartbeat_active: bool,
    recovering: bool,
    /// Offline because the server refused the run, not because attempts ran out.
    terminal: bool,
}

impl ConnectionMachine {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            state: ConnectionState::Idle,
            nonce: 0,
            attempt: 0,
            max_attempts: config.backoff.max_attempts,
            heartbeat_timeout: config.heartbeat_timeout,
            request: None,
            last_activity: None,
            reconnect_pending: false,
            channel_active: false,
            heartbeat_active: false,
            recovering: false,
            terminal: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn request(&self) -> Option<&StreamRequest> {
        self.request.as_ref()
    }

    pub fn is_reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    /// `true` while offline after an auth or not-found preflight failure.
    /// Nothing should be sent to the server for this run until a new connect.
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn handle(&mut self, input: Input, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        match input {
            Input::Connect(request) => {
                self.attempt = 0;
                self.recovering = false;
                self.request = Some(request);
                self.begin_attempt(&mut effects);
            }
            Input::Retry => match self.request {
                Some(_) => {
                    self.attempt = 0;
                    self.recovering = false;
                    self.begin_attempt(&mut effects);
                }
                None => effects.push(Effect::Error(SyncError::Config(
                    "retry requested before any connect".to_owned(),
                ))),
            },
            Input::Disconnect => self.disconnect(&mut effects),
            Input::ProbeFinished { nonce, result } => {
                if self.is_stale(nonce, "probe result") || self.state != ConnectionState::Connecting {
                    return effects;
                }
                match result {
                    Ok(()) => {
                        if let Some(request) = self.request.clone() {
                            self.channel_active = true;
                            effects.push(Effect::OpenChannel { nonce, request });
                        }
                    }
                    Err(error) if error.is_retryable() => {
                        warn!(nonce, error = %error, "preflight failed, will retry");
                        effects.push(Effect::Error(error));
                        self.schedule_reconnect(&mut effects);
                    }
                    Err(error) => {
                        warn!(nonce, error = %error, "preflight failed permanently");
                        self.recovering = false;
                        self.terminal = true;
                        self.transition(ConnectionState::Offline, &mut effects);
                        effects.push(Effect::Error(error));
                    }
                }
            }
            Input::ChannelOpened { nonce } => {
                if self.is_stale(nonce, "channel open") || self.state != ConnectionState::Connecting {
                    return effects;
                }
                self.last_activity = Some(now);
                self.attempt = 0;
                self.transition(ConnectionState::Open, &mut effects);
                self.heartbeat_active = true;
                effects.push(Effect::StartHeartbeat { nonce });
                if self.recovering {
                    self.recovering = false;
                    effects.push(Effect::Reconnected);
                }
            }
            Input::ChannelFrame { nonce } => {
                if nonce == self.nonce {
                    self.last_activity = Some(now);
                }
            }
            Input::ChannelFailed { nonce, reason } => {
                if self.is_stale(nonce, "channel failure") || !self.channel_active {
                    return effects;
                }
                self.fail_channel(SyncError::Network(reason), &mut effects);
            }
            Input::HeartbeatCheck { nonce } => {
                if self.is_stale(nonce, "heartbeat") || self.state != ConnectionState::Open {
                    return effects;
                }
                let silent_for = self
                    .last_activity
                    .map_or(Duration::MAX, |at| now.saturating_duration_since(at));
                if silent_for > self.heartbeat_timeout {
                    warn!(nonce, silent_ms = silent_for.as_millis() as u64, "event stream went silent");
                    self.fail_channel(
                        SyncError::Network(format!(
                            "no events for {}s",
                            self.heartbeat_timeout.as_secs()
                        )),
                        &mut effects,
                    );
                }
            }
            Input::ReconnectDue { nonce } => {
                if self.is_stale(nonce, "reconnect timer") || !self.reconnect_pending {
                    return effects;
                }
                self.reconnect_pending = false;
                self.recovering = true;
                self.begin_attempt(&mut effects);
            }
        }
        effects
    }

    fn begin_attempt(&mut self, effects: &mut Vec<Effect>) {
        self.teardown(effects);
        self.terminal = false;
        self.nonce += 1;
        let Some(request) = self.request.clone() else {
            return;
        };
        info!(run_id = %request.run_id, nonce = self.nonce, attempt = self.attempt, "connecting");
        self.transition(ConnectionState::Connecting, effects);
        effects.push(Effect::StartProbe {
            nonce: self.nonce,
            request,
        });
    }

    fn fail_channel(&mut self, error: SyncError, effects: &mut Vec<Effect>) {
        if self.channel_active {
            self.channel_active = false;
            effects.push(Effect::CloseChannel);
        }
        if self.heartbeat_active {
            self.heartbeat_active = false;
            effects.push(Effect::StopHeartbeat);
        }
        effects.push(Effect::Error(error));
        // A stall right after a fresh open still counts as a recovery.
        self.recovering = true;
        self.schedule_reconnect(effects);
    }

    /// At most one reconnect timer is outstanding; re-entrant calls are no-ops.
    fn schedule_reconnect(&mut self, effects: &mut Vec<Effect>) {
        if self.reconnect_pending {
            return;
        }
        self.attempt += 1;
        if self.attempt > self.max_attempts {
            warn!(attempts = self.max_attempts, "reconnect attempts exhausted");
            self.recovering = false;
            self.transition(ConnectionState::Offline, effects);
            effects.push(Effect::Error(SyncError::Exhausted {
                attempts: self.max_attempts,
            }));
            return;
        }
        self.transition(ConnectionState::Reconnecting, effects);
        self.reconnect_pending = true;
        effects.push(Effect::ScheduleReconnect {
            nonce: self.nonce,
            attempt: self.attempt,
        });
    }

    fn disconnect(&mut self, effects: &mut Vec<Effect>) {
        self.nonce += 1;
        self.teardown(effects);
        self.attempt = 0;
        self.recovering = false;
        self.terminal = false;
        self.last_activity = None;
        self.transition(ConnectionState::Closed, effects);
    }

    fn teardown(&mut self, effects: &mut Vec<Effect>) {
        if self.reconnect_pending {
            self.reconnect_pending = false;
            effects.push(Effect::CancelReconnect);
        }
        if self.channel_active {
            self.channel_active = false;
            effects.push(Effect::CloseChannel);
        }
        if self.heartbeat_active {
            self.heartbeat_active = false;
            effects.push(Effect::StopHeartbeat);
        }
    }

    fn transition(&mut self, next: ConnectionState, effects: &mut Vec<Effect>) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "rejected connection state transition");
            return;
        }
        info!(from = %self.state, to = %next, "connection state changed");
        self.state = next;
        effects.push(Effect::State(next));
    }

    fn is_stale(&self, nonce: u64, what: &str) -> bool {
        if nonce == self.nonce {
            return false;
        }
        debug!(nonce, current = self.nonce, what, "discarding stale input");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runsync_protocol::RunId;

    fn machine() -> ConnectionMachine {
        ConnectionMachine::new(&SyncConfig::default())
    }

    fn request() -> StreamRequest {
        StreamRequest::new(RunId::from_string("run-1"))
    }

    fn states(effects: &[Effect]) -> Vec<ConnectionState> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::State(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    fn open(machine: &mut ConnectionMachine, now: Instant) -> u64 {
        machine.handle(Input::Connect(request()), now);
        let nonce = machine.nonce();
        machine.handle(Input::ProbeFinished { nonce, result: Ok(()) }, now);
        machine.handle(Input::ChannelOpened { nonce }, now);
        nonce
    }

    #[test]
    fn happy_path_reaches_open() {
        let mut machine = machine();
        let now = Instant::now();
        let effects = machine.handle(Input::Connect(request()), now);
        assert_eq!(states(&effects), vec![ConnectionState::Connecting]);
        assert!(matches!(effects.last(), Some(Effect::StartProbe { nonce: 1, .. })));

        let effects = machine.handle(Input::ProbeFinished { nonce: 1, result: Ok(()) }, now);
        assert!(matches!(effects.as_slice(), [Effect::OpenChannel { nonce: 1, .. }]));

        let effects = machine.handle(Input::ChannelOpened { nonce: 1 }, now);
        assert_eq!(
            effects,
            vec![
                Effect::State(ConnectionState::Open),
                Effect::StartHeartbeat { nonce: 1 }
            ]
        );
        assert_eq!(machine.attempt(), 0);
    }

    #[test]
    fn not_found_probe_goes_offline_without_timer() {
        let mut machine = machine();
        let now = Instant::now();
        machine.handle(Input::Connect(request()), now);
        let effects = machine.handle(
            Input::ProbeFinished {
                nonce: 1,
                result: Err(SyncError::from_status(404, "run not found")),
            },
            now,
        );
        assert_eq!(states(&effects), vec![ConnectionState::Offline]);
        assert!(effects.iter().any(|e| matches!(e, Effect::Error(SyncError::NotFound(_)))));
        assert!(!effects.iter().any(|e| matches!(e, Effect::ScheduleReconnect { .. })));
        assert!(!machine.is_reconnect_pending());
    }

    #[test]
    fn auth_probe_is_terminal() {
        let mut machine = machine();
        let now = Instant::now();
        machine.handle(Input::Connect(request()), now);
        let effects = machine.handle(
            Input::ProbeFinished {
                nonce: 1,
                result: Err(SyncError::from_status(401, "token required")),
            },
            now,
        );
        assert_eq!(states(&effects), vec![ConnectionState::Offline]);
        assert!(!machine.is_reconnect_pending());
        assert!(machine.is_terminal());

        machine.handle(Input::Retry, now);
        assert!(!machine.is_terminal());
    }

    #[test]
    fn network_probe_failure_schedules_one_reconnect() {
        let mut machine = machine();
        let now = Instant::now();
        machine.handle(Input::Connect(request()), now);
        let effects = machine.handle(
            Input::ProbeFinished {
                nonce: 1,
                result: Err(SyncError::Network("connection refused".into())),
            },
            now,
        );
        assert_eq!(states(&effects), vec![ConnectionState::Reconnecting]);
        assert!(effects.contains(&Effect::ScheduleReconnect { nonce: 1, attempt: 1 }));

        // A late channel failure for the same attempt must not arm a second timer.
        let effects = machine.handle(
            Input::ChannelFailed {
                nonce: 1,
                reason: "late".into(),
            },
            now,
        );
        assert!(effects.is_empty());
    }

    #[test]
    fn heartbeat_timeout_moves_open_to_reconnecting() {
        let mut machine = machine();
        let start = Instant::now();
        let nonce = open(&mut machine, start);

        let quiet = machine.handle(Input::HeartbeatCheck { nonce }, start + Duration::from_secs(20));
        assert!(quiet.is_empty());

        let effects = machine.handle(Input::HeartbeatCheck { nonce }, start + Duration::from_secs(26));
        assert_eq!(states(&effects), vec![ConnectionState::Reconnecting]);
        assert!(effects.contains(&Effect::CloseChannel));
        assert!(effects.contains(&Effect::StopHeartbeat));
        assert!(effects.contains(&Effect::ScheduleReconnect { nonce, attempt: 1 }));
    }

    #[test]
    fn frames_keep_the_channel_alive() {
        let mut machine = machine();
        let start = Instant::now();
        let nonce = open(&mut machine, start);
        machine.handle(Input::ChannelFrame { nonce }, start + Duration::from_secs(20));
        let effects = machine.handle(Input::HeartbeatCheck { nonce }, start + Duration::from_secs(30));
        assert!(effects.is_empty());
    }

    #[test]
    fn reconnect_passes_through_connecting_and_reports_recovery_once() {
        let mut machine = machine();
        let start = Instant::now();
        let nonce = open(&mut machine, start);
        machine.handle(
            Input::ChannelFailed {
                nonce,
                reason: "reset".into(),
            },
            start,
        );

        let effects = machine.handle(Input::ReconnectDue { nonce }, start);
        assert_eq!(states(&effects), vec![ConnectionState::Connecting]);
        let retry = machine.nonce();
        assert!(retry > nonce);

        machine.handle(Input::ProbeFinished { nonce: retry, result: Ok(()) }, start);
        let effects = machine.handle(Input::ChannelOpened { nonce: retry }, start);
        assert_eq!(states(&effects), vec![ConnectionState::Open]);
        assert_eq!(effects.iter().filter(|e| **e == Effect::Reconnected).count(), 1);
        assert_eq!(machine.attempt(), 0);
    }

    #[test]
    fn attempts_exhaust_to_offline() {
        let mut machine = machine();
        let now = Instant::now();
        machine.handle(Input::Connect(request()), now);
        let mut last = Vec::new();
        for _ in 0..=SyncConfig::default().backoff.max_attempts {
            let nonce = machine.nonce();
            last = machine.handle(
                Input::ProbeFinished {
                    nonce,
                    result: Err(SyncError::Network("down".into())),
                },
                now,
            );
            if machine.is_reconnect_pending() {
                machine.handle(Input::ReconnectDue { nonce }, now);
            }
        }
        assert_eq!(machine.state(), ConnectionState::Offline);
        assert!(last.contains(&Effect::Error(SyncError::Exhausted { attempts: 6 })));
        assert!(!machine.is_reconnect_pending());
        assert!(!machine.is_terminal());

        // Offline is left only by an explicit call.
        let effects = machine.handle(Input::Retry, now);
        assert_eq!(states(&effects), vec![ConnectionState::Connecting]);
        assert_eq!(machine.attempt(), 0);
    }

    #[test]
    fn disconnect_cancels_timer_and_ignores_its_deadline() {
        let mut machine = machine();
        let now = Instant::now();
        machine.handle(Input::Connect(request()), now);
        machine.handle(
            Input::ProbeFinished {
                nonce: 1,
                result: Err(SyncError::Network("down".into())),
            },
            now,
        );
        assert!(machine.is_reconnect_pending());

        let effects = machine.handle(Input::Disconnect, now);
        assert!(effects.contains(&Effect::CancelReconnect));
        assert_eq!(states(&effects), vec![ConnectionState::Closed]);

        let effects = machine.handle(Input::ReconnectDue { nonce: 1 }, now + Duration::from_secs(60));
        assert!(effects.is_empty());
        assert_eq!(machine.state(), ConnectionState::Closed);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut machine = machine();
        let now = Instant::now();
        open(&mut machine, now);
        assert_eq!(states(&machine.handle(Input::Disconnect, now)), vec![ConnectionState::Closed]);
        assert!(machine.handle(Input::Disconnect, now).is_empty());
    }

    #[test]
    fn superseded_probe_result_is_discarded() {
        let mut machine = machine();
        let now = Instant::now();
        machine.handle(Input::Connect(request()), now);
        machine.handle(Input::Connect(request()), now);
        let effects = machine.handle(Input::ProbeFinished { nonce: 1, result: Ok(()) }, now);
        assert!(effects.is_empty());
        let effects = machine.handle(Input::ProbeFinished { nonce: 2, result: Ok(()) }, now);
        assert!(matches!(effects.as_slice(), [Effect::OpenChannel { nonce: 2, .. }]));
    }

    #[test]
    fn connect_while_open_tears_down_first() {
        let mut machine = machine();
        let now = Instant::now();
        open(&mut machine, now);
        let effects = machine.handle(Input::Connect(request()), now);
        assert_eq!(effects[0], Effect::CloseChannel);
        assert_eq!(effects[1], Effect::StopHeartbeat);
        assert_eq!(states(&effects), vec![ConnectionState::Connecting]);
    }

    #[test]
    fn retry_without_request_reports_error() {
        let mut machine = machine();
        let effects = machine.handle(Input::Retry, Instant::now());
        assert!(matches!(effects.as_slice(), [Effect::Error(SyncError::Config(_))]));
        assert_eq!(machine.state(), ConnectionState::Idle);
    }
}
