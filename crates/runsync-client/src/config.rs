use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8055/api/v1";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const BASE_URL_ENV: &str = "RUNSYNC_API_BASE_URL";
pub const TOKEN_ENV: &str = "RUNSYNC_TOKEN";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub base_url: String,
    /// Bearer token for REST calls; also sent as `?token=` on the stream URL.
    pub token: Option<String>,
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = non_empty(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// `RUNSYNC_API_BASE_URL` (default local API) and optional `RUNSYNC_TOKEN`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let base_url = lookup(BASE_URL_ENV)
            .and_then(non_empty)
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_owned());
        Self {
            base_url,
            token: lookup(TOKEN_ENV).and_then(non_empty),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_API_BASE_URL)
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_local_api() {
        let config = ClientConfig::from_lookup(|_| None);
        assert_eq!(config.base_url, DEFAULT_API_BASE_URL);
        assert_eq!(config.token, None);
    }

    #[test]
    fn reads_values_and_ignores_blank_token() {
        let config = ClientConfig::from_lookup(|key| match key {
            BASE_URL_ENV => Some("https://runs.example.com/api/v1".to_owned()),
            TOKEN_ENV => Some("   ".to_owned()),
            _ => None,
        });
        assert_eq!(config.base_url, "https://runs.example.com/api/v1");
        assert_eq!(config.token, None);

        let config = ClientConfig::new("http://x").with_token(" secret ");
        assert_eq!(config.token.as_deref(), Some("secret"));
    }
}
