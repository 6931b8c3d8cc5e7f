//! # runsync-client: HTTP transport for run sync
//!
//! [`HttpRunApi`] speaks the run API over reqwest:
//!
//! - run commands: create, start, cancel, snapshot
//! - the stream preflight (`GET /runs/{id}/events?once=1`)
//! - the SSE push channel, via `reqwest-eventsource` with retries disabled
//!
//! It implements the `StreamTransport` and `SnapshotSource` ports from
//! `runsync-protocol`, so the engine can be pointed straight at it.

pub mod config;
pub mod error;
pub mod http;
pub mod models;
mod sse;

pub use config::{BASE_URL_ENV, ClientConfig, DEFAULT_API_BASE_URL, TOKEN_ENV};
pub use error::{ApiError, ApiErrorCode, error_detail};
pub use http::HttpRunApi;
pub use models::{CreateRunRequest, RunIntentResponse, StatusResponse};
