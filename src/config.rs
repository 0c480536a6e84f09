//! Configuration structures for the transactions API
//!
//! Server and pool tunables come from an optional TOML file, overridden by
//! environment variables. Database definitions are not part of this file; they
//! are discovered from the environment by [`crate::environment`].

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::{Result, ServerError};

/// Complete server configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

/// HTTP server configuration section
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Address to bind, e.g. `0.0.0.0:8080`
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Deadline applied to every API request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Parse the listen address
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.listen_addr.parse().map_err(|e| {
            ServerError::configuration_error(
                "server.listen_addr".to_string(),
                format!("'{}' is not a valid socket address: {}", self.listen_addr, e),
            )
        })
    }
}

/// How the delay between connection attempts grows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Fixed,
    Exponential,
}

/// Retry policy for opening a database pool
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryPolicy {
    /// Total attempts per connect, including the first one
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_backoff_strategy")]
    pub strategy: BackoffStrategy,
    /// Upper bound for any single delay
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            delay_ms: default_retry_delay_ms(),
            strategy: default_backoff_strategy(),
            max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// A single attempt with no delay
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 0,
            strategy: BackoffStrategy::Fixed,
            max_delay_ms: 0,
        }
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = match self.strategy {
            BackoffStrategy::Fixed => self.delay_ms,
            BackoffStrategy::Exponential => {
                let shift = attempt.saturating_sub(1).min(16);
                self.delay_ms.saturating_mul(1u64 << shift)
            }
        };
        Duration::from_millis(base.min(self.max_delay_ms))
    }
}

/// Connection pool manager configuration section
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Maximum open connections per database
    #[serde(default = "default_max_open")]
    pub max_open_connections: u32,
    /// Connections kept warm per database
    #[serde(default = "default_max_idle")]
    pub max_idle_connections: u32,
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Bound on opening and verifying a pool
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Bound on probing an existing pool
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// How long a failed database is not retried
    #[serde(default = "default_failure_backoff_ms")]
    pub failure_backoff_ms: u64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_true")]
    pub health_check_enabled: bool,
    /// Connect every configured database at startup
    #[serde(default = "default_true")]
    pub eager_connect: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open_connections: default_max_open(),
            max_idle_connections: default_max_idle(),
            max_lifetime_secs: default_max_lifetime_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            failure_backoff_ms: default_failure_backoff_ms(),
            health_check_interval_secs: default_health_check_interval_secs(),
            health_check_enabled: true,
            eager_connect: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl PoolConfig {
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_open_connections == 0 {
            return Err(ServerError::configuration_error(
                "pool.max_open_connections".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        if self.max_idle_connections > self.max_open_connections {
            return Err(ServerError::configuration_error(
                "pool.max_idle_connections".to_string(),
                format!(
                    "{} exceeds max_open_connections ({})",
                    self.max_idle_connections, self.max_open_connections
                ),
            ));
        }

        if self.connect_timeout_ms == 0 || self.probe_timeout_ms == 0 {
            return Err(ServerError::configuration_error(
                "pool.connect_timeout_ms".to_string(),
                "connect and probe timeouts cannot be 0".to_string(),
            ));
        }

        if self.health_check_enabled && self.health_check_interval_secs == 0 {
            return Err(ServerError::configuration_error(
                "pool.health_check_interval_secs".to_string(),
                "cannot be 0 while the health monitor is enabled".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ServerError::configuration_error(
                "pool.retry.max_attempts".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = fs::read_to_string(path)
            .map_err(|e| ServerError::io_error(e, format!("reading {}", path.display())))?;

        let mut config: Config = toml::from_str(&content).map_err(|e| {
            ServerError::configuration_error(path.display().to_string(), e.to_string())
        })?;

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration with fallback to default file locations
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("CONFIG_PATH") {
            return Self::from_file(path);
        }

        let config_paths = ["config.toml", "config/config.toml"];

        for path in &config_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Self::from_env()
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        use std::env;

        if let Ok(addr) = env::var("APP_ADDR") {
            self.server.listen_addr = addr;
        }

        if let Ok(level) = env::var("LOG_LEVEL") {
            self.server.log_level = level;
        }

        if let Ok(format) = env::var("LOG_FORMAT") {
            self.server.log_format = format;
        }

        if let Ok(raw) = env::var("REQUEST_TIMEOUT_SECS") {
            self.server.request_timeout_secs = raw.parse().map_err(|_| {
                ServerError::configuration_error(
                    "REQUEST_TIMEOUT_SECS".to_string(),
                    format!("'{}' is not a number of seconds", raw),
                )
            })?;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.server.socket_addr()?;

        match self.server.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ServerError::configuration_error(
                    "server.log_level".to_string(),
                    format!(
                        "invalid log level '{}', expected trace, debug, info, warn or error",
                        self.server.log_level
                    ),
                ));
            }
        }

        match self.server.log_format.to_lowercase().as_str() {
            "pretty" | "json" => {}
            _ => {
                return Err(ServerError::configuration_error(
                    "server.log_format".to_string(),
                    format!(
                        "invalid log format '{}', expected pretty or json",
                        self.server.log_format
                    ),
                ));
            }
        }

        if self.server.request_timeout_secs == 0 {
            return Err(ServerError::configuration_error(
                "server.request_timeout_secs".to_string(),
                "cannot be 0".to_string(),
            ));
        }

        self.pool.validate()
    }
}

// Default value functions for serde
fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_max_open() -> u32 {
    25
}

fn default_max_idle() -> u32 {
    5
}

fn default_max_lifetime_secs() -> u64 {
    300
}

fn default_idle_timeout_secs() -> u64 {
    120
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_failure_backoff_ms() -> u64 {
    30_000
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_retry_attempts() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    250
}

fn default_backoff_strategy() -> BackoffStrategy {
    BackoffStrategy::Exponential
}

fn default_retry_max_delay_ms() -> u64 {
    2000
}
