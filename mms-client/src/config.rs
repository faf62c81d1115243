use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Relay WebSocket endpoint
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub publish: PublishPolicy,
    /// How long to wait for the relay's `connected` answer (milliseconds)
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Broadcasts buffered per listener before a slow listener starts losing them
    #[serde(default = "default_listener_capacity")]
    pub listener_capacity: usize,
}

fn default_url() -> String {
    "ws://127.0.0.1:43234/api/ws".to_string()
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_listener_capacity() -> usize {
    1024
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            backoff: BackoffConfig::default(),
            publish: PublishPolicy::default(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            listener_capacity: default_listener_capacity(),
        }
    }
}

impl ClientConfig {
    /// Apply MMS_URL override
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("MMS_URL") {
            if !url.is_empty() {
                self.url = url;
            }
        }
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Reconnect backoff
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Fraction of each delay randomised in both directions (0.0 disables)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Consecutive failed attempts before giving up. None = retry forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            max_attempts: None,
        }
    }
}

/// What `publish` does while the client is not connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PublishPolicy {
    /// Fail with `NotConnected` immediately
    FailFast,
    /// Hold up to `capacity` publishes for at most `wait_ms` each while reconnecting
    Queue {
        #[serde(default = "default_queue_capacity")]
        capacity: usize,
        #[serde(default = "default_queue_wait_ms")]
        wait_ms: u64,
    },
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_queue_wait_ms() -> u64 {
    5_000
}

impl Default for PublishPolicy {
    fn default() -> Self {
        PublishPolicy::Queue {
            capacity: default_queue_capacity(),
            wait_ms: default_queue_wait_ms(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: impl AsRef<Path>) -> Result<ClientConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: ClientConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Load configuration from `path` if it exists, defaults otherwise
pub fn load_or_default(path: impl AsRef<Path>) -> Result<ClientConfig> {
    let path = path.as_ref();
    if path.exists() {
        load_config(path)
    } else {
        info!(path = %path.display(), "Config file not found, using defaults");
        Ok(ClientConfig::default())
    }
}
