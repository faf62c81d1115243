pub mod runtime;
pub use runtime::{new_relay_policy, BackpressurePolicy, RelayPolicy, SharedRelayPolicy};

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

/// Complete relay server configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MmsConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

/// HTTP/WebSocket listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Bearer token required by the mutating admin routes. None = unrestricted.
    #[serde(default)]
    pub admin_token: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:43234".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            admin_token: None,
        }
    }
}

/// Broadcast relay configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub self_delivery: bool,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    #[serde(default = "default_max_pending_age_secs")]
    pub max_pending_age_secs: u64,
    #[serde(default = "default_backpressure_policy")]
    pub backpressure_policy: BackpressurePolicy,
    /// How long a detached session survives before it is destroyed (seconds)
    #[serde(default = "default_session_grace_secs")]
    pub session_grace_secs: u64,
    /// How often expired sessions and stale backlogs are swept (seconds)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_max_pending() -> usize {
    RelayPolicy::default().max_pending
}

fn default_max_pending_age_secs() -> u64 {
    RelayPolicy::default().max_pending_age_secs
}

fn default_backpressure_policy() -> BackpressurePolicy {
    RelayPolicy::default().backpressure_policy
}

fn default_session_grace_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    10
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            self_delivery: false,
            max_pending: default_max_pending(),
            max_pending_age_secs: default_max_pending_age_secs(),
            backpressure_policy: default_backpressure_policy(),
            session_grace_secs: default_session_grace_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl RelayConfig {
    /// Initial runtime policy derived from this configuration
    pub fn policy(&self) -> RelayPolicy {
        RelayPolicy {
            self_delivery: self.self_delivery,
            max_pending: self.max_pending,
            max_pending_age_secs: self.max_pending_age_secs,
            backpressure_policy: self.backpressure_policy,
        }
    }
}

impl MmsConfig {
    /// Apply MMS_BIND_ADDR / MMS_ADMIN_TOKEN overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(addr) = std::env::var("MMS_BIND_ADDR") {
            self.server.bind_addr = addr;
        }
        if let Ok(token) = std::env::var("MMS_ADMIN_TOKEN") {
            if !token.is_empty() {
                self.server.admin_token = Some(token);
            }
        }
        self
    }
}

/// Load configuration from TOML file
pub fn load_config(path: impl AsRef<Path>) -> Result<MmsConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: MmsConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Load configuration from `path` if it exists, defaults otherwise
pub fn load_or_default(path: impl AsRef<Path>) -> Result<MmsConfig> {
    let path = path.as_ref();
    if path.exists() {
        load_config(path)
    } else {
        info!(path = %path.display(), "Config file not found, using defaults");
        Ok(MmsConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = MmsConfig::default();
        assert_eq!(config.server.bind_addr, "0.0.0.0:43234");
        assert!(config.server.admin_token.is_none());
        assert_eq!(config.relay.max_pending, 10_000);
        assert_eq!(config.relay.session_grace_secs, 300);
        assert_eq!(
            config.relay.backpressure_policy,
            BackpressurePolicy::DropBacklog
        );
        assert!(!config.relay.self_delivery);
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [server]
            bind_addr = "127.0.0.1:9000"
            admin_token = "secret"

            [relay]
            self_delivery = true
            max_pending = 50
            max_pending_age_secs = 30
            backpressure_policy = "evict"
            session_grace_secs = 60
            sweep_interval_secs = 1
        "#;

        let config: MmsConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.server.admin_token.as_deref(), Some("secret"));
        assert!(config.relay.self_delivery);
        assert_eq!(config.relay.max_pending, 50);
        assert_eq!(config.relay.backpressure_policy, BackpressurePolicy::Evict);
        assert_eq!(config.relay.sweep_interval_secs, 1);

        let policy = config.relay.policy();
        assert_eq!(policy.max_pending, 50);
        assert_eq!(policy.max_pending_age_secs, 30);
        assert!(policy.self_delivery);
    }

    #[test]
    fn test_partial_config() {
        let toml = r#"
            [relay]
            max_pending = 3
        "#;

        let config: MmsConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.relay.max_pending, 3);
        assert_eq!(config.relay.session_grace_secs, 300); // Default
        assert_eq!(config.server.bind_addr, "0.0.0.0:43234"); // Default
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[relay]\nbackpressure_policy = \"log_only\"").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.relay.backpressure_policy, BackpressurePolicy::LogOnly);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.relay.max_pending, 10_000);
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!(
            "drop_backlog".parse::<BackpressurePolicy>(),
            Ok(BackpressurePolicy::DropBacklog)
        );
        assert!("drop_everything".parse::<BackpressurePolicy>().is_err());
    }
}
