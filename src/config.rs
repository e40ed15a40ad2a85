//! Application configuration
//!
//! Layers an optional TOML file and `AGENT_RPC__*` environment variables
//! (nested keys separated by `__`, e.g. `AGENT_RPC__RPC__MAX_RETRIES=5`).
//! When no endpoint is configured that way, the `RPC_ENDPOINTS=url1,url2`
//! shortcut is consulted.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::rpc_manager::{ConfigError, NetworkMonitorConfig, PoolConfig, RpcManagerConfig};
use crate::tx_manager::TransactionManagerConfig;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default = "default_rpc")]
    pub rpc: RpcManagerConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub monitor: NetworkMonitorConfig,

    #[serde(default)]
    pub transactions: TransactionManagerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_rpc() -> RpcManagerConfig {
    RpcManagerConfig::with_endpoints(Vec::new())
}

fn default_log_level() -> String {
    "agent_rpc=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load and validate configuration.
    ///
    /// A missing file is not an error; the environment alone may configure
    /// everything.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        let layered = builder
            .add_source(Environment::with_prefix("AGENT_RPC").separator("__"))
            .build()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let mut config: AppConfig = layered
            .try_deserialize()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if config.rpc.endpoints.is_empty() {
            if let Ok(from_env) = RpcManagerConfig::from_env() {
                debug!(count = from_env.endpoints.len(), "Endpoints taken from RPC_ENDPOINTS");
                config.rpc.endpoints = from_env.endpoints;
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rpc.validate()?;
        self.monitor.validate()?;
        self.transactions.validate()?;
        Ok(())
    }
}
