//! Tunables for the sync engine.
//!
//! Defaults: a 25 s silence window checked every
//! 4 s, 800 ms → 20 s exponential backoff with 25% jitter, six attempts, and a
//! 2400-entry dedup window.

use std::time::Duration;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(25);
pub const DEFAULT_HEARTBEAT_CHECK: Duration = Duration::from_secs(4);
pub const DEFAULT_PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(4);
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_millis(800);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(20);
pub const DEFAULT_JITTER_FRACTION: f64 = 0.25;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 6;
pub const DEFAULT_DEDUP_LIMIT: usize = 2400;
pub const DEFAULT_BUFFER_LIMIT: usize = 1000;
pub const DEFAULT_REFRESH_DEBOUNCE: Duration = Duration::from_millis(250);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Reconnect backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub cap: Duration,
    /// Upper bound of the uniform jitter, as a fraction of the base delay.
    pub jitter_fraction: f64,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: DEFAULT_BACKOFF_INITIAL,
            cap: DEFAULT_BACKOFF_CAP,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// Which incoming events schedule a debounced snapshot refresh.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RefreshTriggers {
    /// Every admitted event.
    #[default]
    Every,
    /// Never; snapshots are fetched only on reconnect, poll, or request.
    Never,
    /// Only events whose kind is listed.
    Kinds(IndexSet<String>),
}

impl RefreshTriggers {
    pub fn kinds<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Kinds(kinds.into_iter().map(Into::into).collect())
    }

    pub fn triggers(&self, kind: &str) -> bool {
        match self {
            Self::Every => true,
            Self::Never => false,
            Self::Kinds(kinds) => kinds.contains(kind),
        }
    }
}

/// Payload fields that identify a sequence-less event for content hashing.
///
/// Paths are dotted (`approval.id`) and resolve into nested objects. Kinds
/// without an override use `default_fields`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProfile {
    pub default_fields: Vec<String>,
    #[serde(default)]
    pub per_kind: IndexMap<String, Vec<String>>,
}

impl Default for IdentityProfile {
    fn default() -> Self {
        Self {
            default_fields: ["id", "step_id", "task_id", "status"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            per_kind: IndexMap::new(),
        }
    }
}

impl IdentityProfile {
    pub fn with_kind<I, S>(mut self, kind: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.per_kind
            .insert(kind.into(), fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn fields_for(&self, kind: &str) -> &[String] {
        self.per_kind
            .get(kind)
            .map_or(self.default_fields.as_slice(), Vec::as_slice)
    }
}

/// Configuration for one run subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Silence longer than this while open is treated as a dead channel.
    pub heartbeat_timeout: Duration,
    pub heartbeat_check: Duration,
    pub preflight_timeout: Duration,
    pub backoff: BackoffConfig,
    pub dedup_limit: usize,
    pub buffer_limit: usize,
    pub refresh_debounce: Duration,
    /// Snapshot poll period used only while the channel is not open.
    pub poll_interval: Duration,
    pub refresh_on_reconnect: bool,
    /// Frame names to accept. Empty accepts every named frame.
    pub event_types: IndexSet<String>,
    pub refresh_triggers: RefreshTriggers,
    pub identity: IdentityProfile,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            heartbeat_check: DEFAULT_HEARTBEAT_CHECK,
            preflight_timeout: DEFAULT_PREFLIGHT_TIMEOUT,
            backoff: BackoffConfig::default(),
            dedup_limit: DEFAULT_DEDUP_LIMIT,
            buffer_limit: DEFAULT_BUFFER_LIMIT,
            refresh_debounce: DEFAULT_REFRESH_DEBOUNCE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            refresh_on_reconnect: true,
            event_types: IndexSet::new(),
            refresh_triggers: RefreshTriggers::default(),
            identity: IdentityProfile::default(),
        }
    }
}

impl SyncConfig {
    pub fn accepts_frame(&self, name: &str) -> bool {
        self.event_types.is_empty() || self.event_types.contains(name)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.dedup_limit == 0 || self.buffer_limit == 0 {
            return Err(SyncError::Config(
                "dedup_limit and buffer_limit must be positive".to_owned(),
            ));
        }
        if self.heartbeat_check.is_zero() || self.heartbeat_check > self.heartbeat_timeout {
            return Err(SyncError::Config(format!(
                "heartbeat_check ({:?}) must be non-zero and <= heartbeat_timeout ({:?})",
                self.heartbeat_check, self.heartbeat_timeout
            )));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter_fraction) {
            return Err(SyncError::Config(format!(
                "jitter_fraction must be within [0, 1], got {}",
                self.backoff.jitter_fraction
            )));
        }
        if self.backoff.initial.is_zero() || self.backoff.cap < self.backoff.initial {
            return Err(SyncError::Config(
                "backoff initial must be non-zero and <= cap".to_owned(),
            ));
        }
        if self.poll_interval.is_zero() || self.preflight_timeout.is_zero() {
            return Err(SyncError::Config(
                "poll_interval and preflight_timeout must be non-zero".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        SyncConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_check_longer_than_timeout() {
        let config = SyncConfig {
            heartbeat_check: Duration::from_secs(30),
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn rejects_out_of_range_jitter() {
        let mut config = SyncConfig::default();
        config.backoff.jitter_fraction = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_allow_list_accepts_everything() {
        let mut config = SyncConfig::default();
        assert!(config.accepts_frame("anything"));
        config.event_types.insert("task_done".to_owned());
        assert!(config.accepts_frame("task_done"));
        assert!(!config.accepts_frame("keep-alive"));
    }

    #[test]
    fn identity_profile_overrides_per_kind() {
        let profile = IdentityProfile::default().with_kind("approval_requested", ["approval.id"]);
        assert_eq!(profile.fields_for("approval_requested"), ["approval.id"]);
        assert_eq!(profile.fields_for("task_done").len(), 4);
    }

    #[test]
    fn refresh_triggers_filter_by_kind() {
        let triggers = RefreshTriggers::kinds(["plan_created", "task_done"]);
        assert!(triggers.triggers("task_done"));
        assert!(!triggers.triggers("llm_token"));
        assert!(RefreshTriggers::Every.triggers("llm_token"));
        assert!(!RefreshTriggers::Never.triggers("task_done"));
    }
}
