use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::poller::BackoffPolicy;
use crate::error::SyncError;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/api";
pub const DEFAULT_CONVERSATION_ID: &str = "demo-conversation";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1200;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_DISCONNECT_THRESHOLD: u32 = 3;

const ENV_BASE_URL: &str = "CHAT_SYNC_BASE_URL";
/// Base-address variable of the browser build, honored as a fallback.
const ENV_VITE_BASE_URL: &str = "VITE_API_BASE_URL";
const ENV_CONVERSATION_ID: &str = "CHAT_SYNC_CONVERSATION_ID";
const ENV_POLL_INTERVAL_MS: &str = "CHAT_SYNC_POLL_INTERVAL_MS";
const ENV_REQUEST_TIMEOUT_MS: &str = "CHAT_SYNC_REQUEST_TIMEOUT_MS";

/// Settings for one synchronizer, resolved once by the host and injected.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub base_url: String,
    pub conversation_id: String,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub backoff: BackoffPolicy,
    /// Consecutive fetch failures before the observer is told the channel
    /// is disconnected.
    pub disconnect_threshold: u32,
    /// Show the user's own text locally until the next snapshot lands.
    pub optimistic_echo: bool,
    /// Drop poll responses that were issued before the last applied one.
    pub discard_stale_responses: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            conversation_id: DEFAULT_CONVERSATION_ID.to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            backoff: BackoffPolicy::Fixed,
            disconnect_threshold: DEFAULT_DISCONNECT_THRESHOLD,
            optimistic_echo: false,
            discard_stale_responses: false,
        }
    }
}

impl SyncConfig {
    pub fn new(base_url: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            conversation_id: conversation_id.into(),
            ..Self::default()
        }
    }

    /// Load from the process environment, reading a `.env` file first if one
    /// exists. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, SyncError> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!("Failed to read .env file: {}", e);
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. `from_env` is this over
    /// `std::env::var`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SyncError> {
        let mut config = Self::default();

        if let Some(base) = lookup(ENV_BASE_URL).or_else(|| lookup(ENV_VITE_BASE_URL)) {
            config.base_url = base;
        }
        if let Some(id) = lookup(ENV_CONVERSATION_ID) {
            config.conversation_id = id;
        }
        if let Some(raw) = lookup(ENV_POLL_INTERVAL_MS) {
            config.poll_interval_ms = parse_millis(ENV_POLL_INTERVAL_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_REQUEST_TIMEOUT_MS) {
            config.request_timeout_ms = parse_millis(ENV_REQUEST_TIMEOUT_MS, &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the settings and normalize the base address (trailing `/` removed).
    pub fn validate(&mut self) -> Result<(), SyncError> {
        let trimmed = self.base_url.trim().trim_end_matches('/').to_string();
        let parsed = url::Url::parse(&trimmed)
            .map_err(|e| SyncError::Config(format!("invalid base_url '{}': {}", self.base_url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SyncError::Config(format!(
                "base_url must be http or https, got '{}'",
                parsed.scheme()
            )));
        }
        self.base_url = trimmed;

        if self.conversation_id.trim().is_empty() {
            return Err(SyncError::Config("conversation_id must not be empty".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(SyncError::Config("poll_interval_ms must be greater than zero".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(SyncError::Config("request_timeout_ms must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn parse_millis(key: &str, raw: &str) -> Result<u64, SyncError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| SyncError::Config(format!("{} must be a whole number of milliseconds, got '{}'", key, raw)))
}
