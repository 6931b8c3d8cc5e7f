use runsync_protocol::SyncError;
use thiserror::Error;

/// Coarse classes the UI layer branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorCode {
    Network,
    Auth,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("api unreachable ({origin}): {message}")]
    Network { origin: String, message: String },
    #[error("unauthorized ({status}): {detail}")]
    Auth { status: u16, detail: String },
    #[error("http {status}: {detail}")]
    Server { status: u16, detail: String },
    #[error("invalid api url: {0}")]
    InvalidUrl(String),
    #[error("malformed response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Classify a non-success response. A 401/403, or a body whose detail is
    /// the server's invalid-token marker, is an auth failure.
    pub fn from_response(status: u16, detail: String) -> Self {
        if matches!(status, 401 | 403) || detail.eq_ignore_ascii_case("invalid token") {
            Self::Auth { status, detail }
        } else {
            Self::Server { status, detail }
        }
    }

    pub fn code(&self) -> ApiErrorCode {
        match self {
            Self::Network { .. } => ApiErrorCode::Network,
            Self::Auth { .. } => ApiErrorCode::Auth,
            Self::Server { .. } | Self::InvalidUrl(_) | Self::Decode(_) => ApiErrorCode::Server,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Auth { status, .. } | Self::Server { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<ApiError> for SyncError {
    fn from(error: ApiError) -> Self {
        match error {
            ApiError::Network { origin, message } => {
                SyncError::Network(format!("{message} ({origin})"))
            }
            ApiError::Auth { status, detail } => SyncError::Auth {
                status: Some(status),
                message: detail,
            },
            ApiError::Server { status, detail } => SyncError::from_status(status, detail),
            ApiError::InvalidUrl(message) => SyncError::Config(message),
            ApiError::Decode(message) => SyncError::Protocol(message),
        }
    }
}

/// Pull `detail` out of a JSON error body, falling back to the raw text and
/// then to the status reason.
pub fn error_detail(body: &[u8], reason: Option<&str>) -> String {
    let raw = String::from_utf8_lossy(body);
    let raw = raw.trim();
    if raw.is_empty() {
        return reason.unwrap_or("request failed").to_owned();
    }
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|value| value.get("detail")?.as_str().map(str::to_owned))
        .filter(|detail| !detail.is_empty())
        .unwrap_or_else(|| raw.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_token_detail_is_auth_even_on_400() {
        let error = ApiError::from_response(400, "Invalid token".to_owned());
        assert_eq!(error.code(), ApiErrorCode::Auth);
        let error = ApiError::from_response(403, "forbidden".to_owned());
        assert_eq!(error.code(), ApiErrorCode::Auth);
        let error = ApiError::from_response(500, "boom".to_owned());
        assert_eq!(error.code(), ApiErrorCode::Server);
    }

    #[test]
    fn detail_extraction_prefers_json_detail() {
        assert_eq!(error_detail(br#"{"detail": "run not found"}"#, None), "run not found");
        assert_eq!(error_detail(b" plain failure ", None), "plain failure");
        assert_eq!(error_detail(b"", Some("Bad Gateway")), "Bad Gateway");
    }

    #[test]
    fn maps_onto_sync_errors() {
        let not_found: SyncError = ApiError::from_response(404, "missing".to_owned()).into();
        assert!(matches!(not_found, SyncError::NotFound(_)));
        let auth: SyncError = ApiError::from_response(401, "token required".to_owned()).into();
        assert!(!auth.is_retryable());
        let server: SyncError = ApiError::from_response(502, "upstream".to_owned()).into();
        assert!(server.is_retryable());
    }
}
