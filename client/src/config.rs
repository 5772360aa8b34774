use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::TimeDelta;
use common::SNAPSHOT_TTL_SECS;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:3000";
pub const DEFAULT_DATA_DIR: &str = ".brisker";

/// Fixed-interval retry budget for reaching the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Transparent recovery from drops and reloads
    pub const fn short() -> Self {
        Self::new(Duration::from_millis(250), 12)
    }

    /// Deliberate "connect and wait" used by invites and explicit connects
    pub const fn long() -> Self {
        Self::new(Duration::from_millis(1500), 60)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub relay_url: String,
    pub data_dir: PathBuf,
    /// Per transport: how long the relay has to hand us an identity after the socket opens
    pub handshake_timeout: Duration,
    /// Ceiling for a caller of `connect()`
    pub connect_timeout: Duration,
    /// Request/response correlation window (search, nearby)
    pub request_timeout: Duration,
    pub short_retry: RetryPolicy,
    pub long_retry: RetryPolicy,
    pub local_input_debounce: Duration,
    pub snapshot_debounce: Duration,
    pub snapshot_ttl: TimeDelta,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            handshake_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(8),
            request_timeout: Duration::from_secs(6),
            short_retry: RetryPolicy::short(),
            long_retry: RetryPolicy::long(),
            local_input_debounce: Duration::from_millis(300),
            snapshot_debounce: Duration::from_millis(300),
            snapshot_ttl: TimeDelta::seconds(SNAPSHOT_TTL_SECS),
        }
    }
}

impl ClientConfig {
    /// Builds the config from `BRISKER_*` environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            relay_url: env::var("BRISKER_RELAY_URL").unwrap_or(defaults.relay_url),
            data_dir: env::var("BRISKER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            handshake_timeout: env_millis("BRISKER_HANDSHAKE_TIMEOUT_MS", defaults.handshake_timeout)?,
            connect_timeout: env_millis("BRISKER_CONNECT_TIMEOUT_MS", defaults.connect_timeout)?,
            request_timeout: env_millis("BRISKER_REQUEST_TIMEOUT_MS", defaults.request_timeout)?,
            ..defaults
        })
    }

    pub fn with_relay_url(mut self, relay_url: impl Into<String>) -> Self {
        self.relay_url = relay_url.into();
        self
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration> {
    match env::var(key) {
        Ok(raw) => {
            let millis: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number of milliseconds, got {:?}", key, raw))?;
            Ok(Duration::from_millis(millis))
        }
        Err(_) => Ok(default),
    }
}
