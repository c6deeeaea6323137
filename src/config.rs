//! Configuration management for Toolgate
//!
//! This module handles loading, parsing, validating, and overriding the
//! gateway configuration from a YAML file and `TOOLGATE_*` environment
//! variables.

use crate::error::{GatewayError, Result};
use crate::health::HealthConfig;
use crate::mcp::transport::StdioOptions;
use crate::mcp::types::Implementation;
use crate::pool::PoolConfig;
use crate::registry::ServerDefinition;
use crate::resilience::{CircuitBreakerConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for Toolgate
///
/// # Examples
///
/// ```
/// use toolgate::config::GatewayConfig;
///
/// let config = GatewayConfig::from_yaml_str(
///     r#"
/// request_timeout_ms: 5000
/// servers:
///   - id: files
///     name: Files
///     command: files-server
/// "#,
/// )
/// .unwrap();
/// assert_eq!(config.servers.len(), 1);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Name sent to servers in the `initialize` handshake
    #[serde(default = "default_client_name")]
    pub client_name: String,

    /// Default tool call timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Bound on spawning a server and completing its handshake
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Time a server gets to exit after SIGTERM
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub health: HealthConfig,

    /// Lifetime of a cached tool list
    #[serde(default = "default_tool_cache_ttl_ms")]
    pub tool_cache_ttl_ms: u64,

    /// How long a failed adapter initialisation is remembered before the
    /// next invocation tries again. Unset keeps the failure until the
    /// adapter is disposed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_error_ttl_ms: Option<u64>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub servers: Vec<ServerDefinition>,
}

fn default_client_name() -> String {
    "toolgate".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_tool_cache_ttl_ms() -> u64 {
    300_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            client_name: default_client_name(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            pool: PoolConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            health: HealthConfig::default(),
            tool_cache_ttl_ms: default_tool_cache_ttl_ms(),
            adapter_error_ttl_ms: None,
            logging: LoggingConfig::default(),
            servers: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from `path`, then apply environment overrides.
    ///
    /// A missing file is not an error: defaults are used and a warning is
    /// logged.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if the file exists but cannot be read
    /// or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env_overrides();

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml_str(&contents)
    }

    /// Parse a YAML document. Environment overrides are not applied.
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)).into())
    }

    /// Apply `TOOLGATE_*` overrides. Unparseable values are logged and
    /// ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(timeout) = std::env::var("TOOLGATE_REQUEST_TIMEOUT_MS") {
            if let Ok(value) = timeout.parse() {
                self.request_timeout_ms = value;
                tracing::debug!(value, "Env override: TOOLGATE_REQUEST_TIMEOUT_MS");
            } else {
                tracing::warn!("Invalid TOOLGATE_REQUEST_TIMEOUT_MS: {}", timeout);
            }
        }

        if let Ok(interval) = std::env::var("TOOLGATE_HEALTH_INTERVAL_MS") {
            if let Ok(value) = interval.parse() {
                self.health.interval_ms = value;
                tracing::debug!(value, "Env override: TOOLGATE_HEALTH_INTERVAL_MS");
            } else {
                tracing::warn!("Invalid TOOLGATE_HEALTH_INTERVAL_MS: {}", interval);
            }
        }

        if let Ok(max) = std::env::var("TOOLGATE_MAX_CONNECTIONS") {
            if let Ok(value) = max.parse() {
                self.pool.max_connections = value;
                tracing::debug!(value, "Env override: TOOLGATE_MAX_CONNECTIONS");
            } else {
                tracing::warn!("Invalid TOOLGATE_MAX_CONNECTIONS: {}", max);
            }
        }

        if let Ok(ttl) = std::env::var("TOOLGATE_ADAPTER_ERROR_TTL_MS") {
            if let Ok(value) = ttl.parse() {
                self.adapter_error_ttl_ms = Some(value);
                tracing::debug!(value, "Env override: TOOLGATE_ADAPTER_ERROR_TTL_MS");
            } else {
                tracing::warn!("Invalid TOOLGATE_ADAPTER_ERROR_TTL_MS: {}", ttl);
            }
        }

        if let Ok(level) = std::env::var("TOOLGATE_LOG_LEVEL") {
            if level.trim().is_empty() {
                tracing::warn!("Invalid TOOLGATE_LOG_LEVEL: empty value");
            } else {
                self.logging.level = level;
            }
        }

        if let Ok(json) = std::env::var("TOOLGATE_LOG_JSON") {
            match json.parse::<bool>() {
                Ok(v) => self.logging.json = v,
                Err(_) => tracing::warn!("Invalid value for TOOLGATE_LOG_JSON: {}", json),
            }
        }
    }

    /// Validate the configuration and every server definition
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] naming the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.client_name.trim().is_empty() {
            return Err(GatewayError::Config("client_name cannot be empty".to_string()).into());
        }

        if self.request_timeout_ms == 0 {
            return Err(
                GatewayError::Config("request_timeout_ms must be greater than 0".to_string()).into(),
            );
        }

        if self.connect_timeout_ms == 0 {
            return Err(
                GatewayError::Config("connect_timeout_ms must be greater than 0".to_string()).into(),
            );
        }

        if self.tool_cache_ttl_ms == 0 {
            return Err(
                GatewayError::Config("tool_cache_ttl_ms must be greater than 0".to_string()).into(),
            );
        }

        if self.adapter_error_ttl_ms == Some(0) {
            return Err(GatewayError::Config(
                "adapter_error_ttl_ms must be greater than 0 when set".to_string(),
            )
            .into());
        }

        self.pool.validate()?;
        self.circuit_breaker.validate()?;
        self.retry
            .validate()
            .map_err(|e| GatewayError::Config(format!("retry: {e}")))?;
        self.health.validate()?;

        let mut seen = HashSet::new();
        for server in &self.servers {
            server
                .validate()
                .map_err(|e| GatewayError::Config(format!("servers: {e}")))?;
            if !seen.insert(server.id.as_str()) {
                return Err(GatewayError::Config(format!(
                    "servers: duplicate server id `{}`",
                    server.id
                ))
                .into());
            }
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn tool_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.tool_cache_ttl_ms)
    }

    pub fn adapter_error_ttl(&self) -> Option<Duration> {
        self.adapter_error_ttl_ms.map(Duration::from_millis)
    }

    /// Options for every stdio transport the gateway spawns
    pub fn stdio_options(&self) -> StdioOptions {
        let connect_timeout = Duration::from_millis(self.connect_timeout_ms);
        StdioOptions {
            client_info: Implementation {
                name: self.client_name.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            connect_timeout,
            handshake_timeout: connect_timeout.min(StdioOptions::default().handshake_timeout),
            request_timeout: self.request_timeout(),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }
}
