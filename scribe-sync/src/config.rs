//! Server configuration, loaded from a TOML file.
//!
//! ```toml
//! bind_addr = "0.0.0.0:9090"
//! default_document = "lobby"
//! heartbeat_interval_secs = 30
//! storage_path = "/var/lib/scribe"
//!
//! [auth]
//! mode = "token"
//! tokens = { "s3cret" = "alice" }
//! ```
//!
//! Every key is optional.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest accepted heartbeat interval (one day).
pub const MAX_HEARTBEAT_INTERVAL_SECS: u64 = 86_400;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Document joined by connections whose URL path is empty
    pub default_document: String,
    /// Liveness tick period in seconds
    pub heartbeat_interval_secs: u64,
    /// Outbound frames buffered per connection before sends are dropped
    pub outbound_capacity: usize,
    /// Accepted operations retained per document for conflict detection
    pub max_log_len: usize,
    /// Unconfirmed operations remembered per connection
    pub max_pending_ops: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            default_document: "default".to_string(),
            heartbeat_interval_secs: 30,
            outbound_capacity: 256,
            max_log_len: 10_000,
            max_pending_ops: 1024,
            storage_path: None,
            auth: AuthConfig::default(),
        }
    }
}

/// How connections are identified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Every connection is admitted; `?user=` names it
    #[default]
    Anonymous,
    /// A bearer token from `tokens` is required
    Token,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    pub mode: AuthMode,
    /// Token → user id
    pub tokens: HashMap<String, String>,
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid("heartbeat_interval_secs must be positive".into()));
        }
        if self.heartbeat_interval_secs > MAX_HEARTBEAT_INTERVAL_SECS {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_interval_secs must be at most {MAX_HEARTBEAT_INTERVAL_SECS}"
            )));
        }
        if self.outbound_capacity == 0 {
            return Err(ConfigError::Invalid("outbound_capacity must be positive".into()));
        }
        if self.max_log_len == 0 {
            return Err(ConfigError::Invalid("max_log_len must be positive".into()));
        }
        if self.default_document.trim().is_empty() {
            return Err(ConfigError::Invalid("default_document must not be empty".into()));
        }
        if self.auth.mode == AuthMode::Token && self.auth.tokens.is_empty() {
            return Err(ConfigError::Invalid("token auth requires at least one token".into()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
