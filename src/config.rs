//! Server configuration.
//!
//! Loaded from YAML (the file named by `PORTICO_CONFIG`, when set) with every
//! field defaulted, then overridden by the `LISTEN` environment variable for
//! the bind address.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub thread_pool: ThreadPoolConfig,
    pub websocket: WebSocketConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address, `host:port`
    pub listen_addr: String,
    /// Prefix stripped from request paths before pattern matching
    pub context_path: String,
    /// Seconds a connection may sit idle before the reaper closes it
    pub keep_alive_time: u64,
    /// Seconds to wait on a stalled read once a request has begun
    pub read_timeout: u64,
    /// Seconds between reaper sweeps
    pub reap_interval: u64,
    /// Seconds `stop` waits for in-flight requests
    pub shutdown_timeout: u64,
    pub max_header_size: usize,
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            context_path: "/".to_string(),
            keep_alive_time: 60,
            read_timeout: 30,
            reap_interval: 1,
            shutdown_timeout: 30,
            max_header_size: 64 * 1024,
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_time)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolConfig {
    /// Without a pool each connection handles its requests on its own task
    pub enabled: bool,
    pub core_size: usize,
    pub max_size: usize,
    pub queue_size: usize,
    /// Seconds an extra worker may idle before it retires
    pub keep_alive_time: u64,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            core_size: 8,
            max_size: 64,
            queue_size: 256,
            keep_alive_time: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Largest reassembled message accepted, in bytes
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Loads configuration from `PORTICO_CONFIG` (if set) and `LISTEN`.
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = match std::env::var("PORTICO_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };

        if let Ok(listen_addr) = std::env::var("LISTEN") {
            cfg.server.listen_addr = listen_addr;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let cfg: Config = serde_yaml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let pool = &self.thread_pool;
        if pool.enabled && pool.max_size == 0 {
            return Err(ConfigError::Invalid(
                "thread_pool.max_size must be at least 1".to_string(),
            ));
        }
        if pool.enabled && pool.max_size < pool.core_size {
            return Err(ConfigError::Invalid(format!(
                "thread_pool.max_size ({}) is below core_size ({})",
                pool.max_size, pool.core_size
            )));
        }
        if self.server.reap_interval == 0 {
            return Err(ConfigError::Invalid(
                "server.reap_interval must be at least 1 second".to_string(),
            ));
        }
        if !self.server.context_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "server.context_path must start with '/', got {:?}",
                self.server.context_path
            )));
        }
        Ok(())
    }
}
