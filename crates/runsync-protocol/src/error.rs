//! Error types for run synchronization.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Coarse category surfaced to consumers so they can pick a UI treatment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transport or connect failure. Retried per backoff.
    Network,
    /// 401/403 or invalid token. Terminal until the consumer re-authenticates.
    Auth,
    /// The run does not exist. Terminal.
    NotFound,
    /// A single malformed frame. Dropped; the stream continues.
    Protocol,
    /// Reconnect attempts capped. Requires an explicit reconnect.
    Exhausted,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Network => "network",
            Self::Auth => "auth",
            Self::NotFound => "not_found",
            Self::Protocol => "protocol",
            Self::Exhausted => "exhausted",
        })
    }
}

/// Errors produced by the sync engine and its transports.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("network error: {0}")]
    Network(String),
    #[error("unauthorized ({}): {message}", status_label(.status))]
    Auth { status: Option<u16>, message: String },
    #[error("run not found: {0}")]
    NotFound(String),
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("reconnect attempts exhausted after {attempts} tries")]
    Exhausted { attempts: u32 },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("sync engine closed")]
    Closed,
}

impl SyncError {
    /// Classify an HTTP status returned by the stream preflight or API.
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match status {
            401 | 403 => Self::Auth {
                status: Some(status),
                message: detail,
            },
            404 => Self::NotFound(detail),
            _ => Self::Http {
                status,
                body: detail,
            },
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Auth { .. } => ErrorCategory::Auth,
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::Protocol(_) => ErrorCategory::Protocol,
            Self::Exhausted { .. } => ErrorCategory::Exhausted,
            Self::Network(_) | Self::Http { .. } | Self::Config(_) | Self::Closed => {
                ErrorCategory::Network
            }
        }
    }

    /// Whether the connection manager may retry after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Http { .. })
    }
}

fn status_label(status: &Option<u16>) -> String {
    status.map_or_else(|| "token".to_owned(), |status| status.to_string())
}

/// Convenience result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
