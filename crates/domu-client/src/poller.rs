//! Notification polling, the fallback path for when pushes are missed.

use std::time::Duration;

use reqwest::StatusCode;

use domu_types::api::{Envelope, NotificationsPayload};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(5);

const DEFAULT_POLL_LIMIT: u32 = 50;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// REST origin, e.g. `http://localhost:3000`
    pub base_url: String,
    pub interval: Duration,
    pub limit: u32,
}

impl PollerConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            interval: DEFAULT_POLL_INTERVAL,
            limit: DEFAULT_POLL_LIMIT,
        }
    }

    /// Interval clamped to the 2 to 5 second window.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server answered {0}")]
    Status(StatusCode),
}

pub struct NotificationPoller {
    http: reqwest::Client,
    config: PollerConfig,
}

impl NotificationPoller {
    pub fn new(config: PollerConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    pub async fn fetch(&self, token: &str) -> Result<NotificationsPayload, PollError> {
        let url = format!(
            "{}/api/notifications?limit={}",
            self.config.base_url.trim_end_matches('/'),
            self.config.limit
        );
        let resp = self.http.get(&url).bearer_auth(token).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PollError::Status(status));
        }
        let envelope: Envelope<NotificationsPayload> = resp.json().await?;
        Ok(envelope.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_is_clamped() {
        let cfg = PollerConfig::new("http://x").with_interval(Duration::from_millis(100));
        assert_eq!(cfg.interval, MIN_POLL_INTERVAL);
        let cfg = PollerConfig::new("http://x").with_interval(Duration::from_secs(60));
        assert_eq!(cfg.interval, MAX_POLL_INTERVAL);
        let cfg = PollerConfig::new("http://x").with_interval(Duration::from_secs(4));
        assert_eq!(cfg.interval, Duration::from_secs(4));
        assert_eq!(PollerConfig::new("http://x").interval, DEFAULT_POLL_INTERVAL);
    }
}
