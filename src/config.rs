//! Configuration management for Turnstile.
//!
//! Limits themselves arrive with every request; this only covers the
//! system-level choices: which algorithm to run and where state lives.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};
use crate::ratelimit::Algorithm;
use crate::store::FailureMode;

/// Environment variable prefix, e.g. `TURNSTILE__STORE__BACKEND=shared`.
const ENV_PREFIX: &str = "TURNSTILE";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for Turnstile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Engine configuration
    #[serde(default)]
    pub engine: EngineSettings,

    /// Store configuration
    #[serde(default)]
    pub store: StoreSettings,
}

/// Engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Algorithm applied to every limit
    #[serde(default)]
    pub algorithm: Algorithm,
}

/// Which backend holds limiter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process map
    #[default]
    Local,
    /// Redis
    Shared,
}

/// Store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Backend selection
    #[serde(default)]
    pub backend: StoreBackend,

    /// Local store settings, used when `backend` is `local`
    #[serde(default)]
    pub local: LocalStoreConfig,

    /// Shared store settings, used when `backend` is `shared`
    #[serde(default)]
    pub shared: SharedStoreConfig,
}

/// Local store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStoreConfig {
    /// Maximum number of sub-keys held at once
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Expiry sweep interval in seconds, 0 disables the sweep
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl LocalStoreConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(TurnstileError::configuration(
                "local store max_entries must be at least 1",
            ));
        }
        Ok(())
    }
}

fn default_max_entries() -> usize {
    10000
}

fn default_cleanup_interval() -> u64 {
    300
}

/// Shared (Redis) store configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SharedStoreConfig {
    /// Redis host
    #[serde(default = "default_host")]
    pub host: String,

    /// Redis port
    #[serde(default = "default_port")]
    pub port: u16,

    /// ACL username
    #[serde(default)]
    pub username: Option<String>,

    /// Password
    #[serde(default)]
    pub password: Option<String>,

    /// Database index
    #[serde(default)]
    pub db: i64,

    /// Prefix prepended to every sub-key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// What to do with requests while Redis is unreachable
    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_ms: u64,

    /// Timeout for check-only calls in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Timeout for check-and-commit calls in milliseconds
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

impl Default for SharedStoreConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: None,
            password: None,
            db: 0,
            key_prefix: default_key_prefix(),
            failure_mode: FailureMode::default(),
            connection_timeout_ms: default_connection_timeout(),
            read_timeout_ms: default_read_timeout(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

// Keeps the password out of logs.
impl std::fmt::Debug for SharedStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("db", &self.db)
            .field("key_prefix", &self.key_prefix)
            .field("failure_mode", &self.failure_mode)
            .field("connection_timeout_ms", &self.connection_timeout_ms)
            .field("read_timeout_ms", &self.read_timeout_ms)
            .field("write_timeout_ms", &self.write_timeout_ms)
            .finish()
    }
}

impl SharedStoreConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(TurnstileError::configuration(
                "shared store host must not be empty",
            ));
        }
        let timeouts = [
            ("connection_timeout_ms", self.connection_timeout_ms),
            ("read_timeout_ms", self.read_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(TurnstileError::configuration(format!(
                "shared store {} must be positive",
                name
            )));
        }
        Ok(())
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_key_prefix() -> String {
    "ratelimit:v1:".to_string()
}

fn default_connection_timeout() -> u64 {
    5000
}

fn default_read_timeout() -> u64 {
    3000
}

fn default_write_timeout() -> u64 {
    3000
}

impl TurnstileConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TurnstileConfig = serde_yaml::from_str(&contents)
            .map_err(|e| TurnstileError::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file, then apply overrides from
    /// `TURNSTILE__`-prefixed environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        let config: TurnstileConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TurnstileError::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings that serde cannot.
    pub fn validate(&self) -> Result<()> {
        self.store.local.validate()?;
        self.store.shared.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::default();
        assert_eq!(config.engine.algorithm, Algorithm::Continuous);
        assert_eq!(config.store.backend, StoreBackend::Local);
        assert_eq!(config.store.local.max_entries, 10000);
        assert_eq!(config.store.local.cleanup_interval(), Duration::from_secs(300));
        assert_eq!(config.store.shared.port, 6379);
        assert_eq!(config.store.shared.key_prefix, "ratelimit:v1:");
        assert_eq!(config.store.shared.failure_mode, FailureMode::Open);
        assert_eq!(config.store.shared.write_timeout(), Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
engine:
  algorithm: windowed
store:
  backend: shared
  shared:
    host: redis.internal
    failure_mode: closed
    read_timeout_ms: 50
"#;
        let config: TurnstileConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.engine.algorithm, Algorithm::Windowed);
        assert_eq!(config.store.backend, StoreBackend::Shared);
        assert_eq!(config.store.shared.host, "redis.internal");
        assert_eq!(config.store.shared.failure_mode, FailureMode::Closed);
        assert_eq!(config.store.shared.read_timeout_ms, 50);
        assert_eq!(config.store.shared.write_timeout_ms, 3000);
        assert_eq!(config.store.local.max_entries, 10000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = TurnstileConfig::default();
        config.store.local.max_entries = 0;
        assert!(config.validate().is_err());

        let mut config = TurnstileConfig::default();
        config.store.shared.host = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = TurnstileConfig::default();
        config.store.shared.connection_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("turnstile-{}.yaml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "store:\n  local:\n    max_entries: 42").unwrap();

        let config = TurnstileConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.store.local.max_entries, 42);

        std::fs::remove_file(&path).unwrap();
        assert!(TurnstileConfig::from_file(path.to_str().unwrap()).is_err());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = TurnstileConfig::load(None).unwrap();
        assert_eq!(config.store.local.max_entries, 10000);
    }

    #[test]
    fn test_debug_hides_password() {
        let config = SharedStoreConfig {
            password: Some("hunter2".to_string()),
            ..Default::default()
        };
        assert!(!format!("{:?}", config).contains("hunter2"));
    }
}
