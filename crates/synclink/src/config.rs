//! Client configuration.

use std::time::Duration;

use url::Url;

use crate::{
    error::{ClientError, ClientResult},
    reconnect::BackoffConfig,
};

/// Path of the sync protocol endpoint on a deployment.
const SYNC_PATH: &str = "/api/sync";

/// Configuration for a [`SyncClient`](crate::SyncClient).
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Deployment base URL (`https://...` or `wss://...`).
    pub deployment_url: String,

    // Reconnection settings
    /// Initial delay before the first reconnection attempt.
    pub reconnect_initial_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub reconnect_max_delay: Duration,
    /// Backoff multiplier for reconnection delays.
    pub reconnect_backoff_factor: f64,
    /// Maximum number of consecutive failed dials before giving up
    /// (None = never give up).
    pub reconnect_max_attempts: Option<u32>,
    /// Random jitter factor (0.0-1.0) for reconnection delays.
    pub reconnect_jitter: f64,

    // Request handling
    /// Default timeout for query/mutation/action calls.
    pub request_timeout: Duration,
    /// Maximum number of pending one-shot requests.
    pub max_pending_requests: usize,
    /// Interval for sweeping stale pending requests.
    pub pending_cleanup_interval: Duration,

    // Connection
    /// Timeout for one socket dial.
    pub connect_timeout: Duration,
    /// Capacity of the command channel into the connection task.
    pub command_channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            deployment_url: String::new(),
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(32),
            reconnect_backoff_factor: 2.0,
            reconnect_max_attempts: Some(16),
            reconnect_jitter: 0.1,
            request_timeout: Duration::from_secs(30),
            max_pending_requests: 1024,
            pending_cleanup_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            command_channel_capacity: 64,
        }
    }
}

impl ClientConfig {
    /// Create a new configuration for the given deployment URL.
    pub fn new(deployment_url: impl Into<String>) -> Self {
        Self {
            deployment_url: deployment_url.into(),
            ..Default::default()
        }
    }

    /// Set the initial reconnection delay.
    #[must_use]
    pub fn reconnect_initial_delay(mut self, delay: Duration) -> Self {
        self.reconnect_initial_delay = delay;
        self
    }

    /// Set the maximum reconnection delay.
    #[must_use]
    pub fn reconnect_max_delay(mut self, delay: Duration) -> Self {
        self.reconnect_max_delay = delay;
        self
    }

    /// Set the reconnection backoff factor.
    #[must_use]
    pub fn reconnect_backoff_factor(mut self, factor: f64) -> Self {
        self.reconnect_backoff_factor = factor;
        self
    }

    /// Set the maximum consecutive failed reconnection attempts.
    #[must_use]
    pub fn reconnect_max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.reconnect_max_attempts = attempts;
        self
    }

    /// Set the reconnection jitter factor.
    #[must_use]
    pub fn reconnect_jitter(mut self, jitter: f64) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    /// Set the default request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the maximum pending requests.
    #[must_use]
    pub fn max_pending_requests(mut self, max: usize) -> Self {
        self.max_pending_requests = max;
        self
    }

    /// Set the stale-request sweep interval.
    #[must_use]
    pub fn pending_cleanup_interval(mut self, interval: Duration) -> Self {
        self.pending_cleanup_interval = interval;
        self
    }

    /// Set the socket dial timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the command channel capacity.
    #[must_use]
    pub fn command_channel_capacity(mut self, capacity: usize) -> Self {
        self.command_channel_capacity = capacity;
        self
    }

    pub(crate) fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: self.reconnect_initial_delay,
            max_delay: self.reconnect_max_delay,
            factor: self.reconnect_backoff_factor,
            jitter: self.reconnect_jitter,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.deployment_url.is_empty() {
            return Err("Deployment URL cannot be empty".to_string());
        }
        Url::parse(&self.deployment_url).map_err(|e| format!("Invalid deployment URL: {e}"))?;
        self.backoff().validate()?;
        if self.request_timeout.is_zero() {
            return Err("Request timeout must be > 0".to_string());
        }
        if self.pending_cleanup_interval.is_zero() {
            return Err("Pending cleanup interval must be > 0".to_string());
        }
        if self.connect_timeout.is_zero() {
            return Err("Connect timeout must be > 0".to_string());
        }
        if self.max_pending_requests == 0 {
            return Err("Max pending requests must be > 0".to_string());
        }
        if self.command_channel_capacity == 0 {
            return Err("Command channel capacity must be > 0".to_string());
        }
        Ok(())
    }

    /// Derive the WebSocket endpoint from the deployment URL.
    ///
    /// Rewrites `http(s)` to `ws(s)` and pins the path to `/api/sync`.
    pub(crate) fn sync_url(&self) -> ClientResult<Url> {
        let mut url = Url::parse(&self.deployment_url)
            .map_err(|e| ClientError::config(format!("Invalid deployment URL: {e}")))?;

        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => {
                return Err(ClientError::config(format!(
                    "Unsupported URL scheme: {other}"
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| ClientError::config("Cannot set URL scheme"))?;
        url.set_path(SYNC_PATH);
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert!(config.deployment_url.is_empty());
        assert_eq!(config.reconnect_initial_delay, Duration::from_secs(1));
        assert_eq!(config.reconnect_max_delay, Duration::from_secs(32));
        assert_eq!(config.reconnect_backoff_factor, 2.0);
        assert_eq!(config.reconnect_max_attempts, Some(16));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_pending_requests, 1024);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_builder_pattern() {
        let config = ClientConfig::new("https://deployment.example.com")
            .request_timeout(Duration::from_secs(60))
            .reconnect_max_attempts(Some(5))
            .reconnect_jitter(0.0);

        assert_eq!(config.deployment_url, "https://deployment.example.com");
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.reconnect_max_attempts, Some(5));
        assert_eq!(config.reconnect_jitter, 0.0);
    }

    #[test]
    fn test_validation_empty_url() {
        let result = ClientConfig::default().validate();
        assert!(result.is_err());
        assert_eq!(result.unwrap_err(), "Deployment URL cannot be empty");
    }

    #[test]
    fn test_validation_invalid_backoff() {
        let config =
            ClientConfig::new("https://deployment.example.com").reconnect_backoff_factor(0.5);
        let result = config.validate();
        assert_eq!(result.unwrap_err(), "Backoff factor must be >= 1.0");
    }

    #[test]
    fn test_sync_url_rewrites_https() {
        let config = ClientConfig::new("https://deployment.example.com");
        let url = config.sync_url().unwrap();
        assert_eq!(url.as_str(), "wss://deployment.example.com/api/sync");
    }

    #[test]
    fn test_sync_url_keeps_plain_ws_for_local_servers() {
        let config = ClientConfig::new("http://127.0.0.1:8187");
        let url = config.sync_url().unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8187/api/sync");
    }

    #[test]
    fn test_sync_url_replaces_existing_path() {
        let config = ClientConfig::new("https://deployment.example.com/some/base?x=1");
        let url = config.sync_url().unwrap();
        assert_eq!(url.as_str(), "wss://deployment.example.com/api/sync");
    }
}
