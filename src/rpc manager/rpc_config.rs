use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for an individual RPC endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointConfig {
    /// Human readable endpoint name (used in logs and status tables)
    pub name: String,

    /// The RPC endpoint URL
    pub url: String,

    /// Selection priority, ascending = preferred
    #[serde(default)]
    pub priority: u32,

    /// Provider-side request budget
    #[serde(default = "default_max_rps")]
    pub max_requests_per_second: u32,
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            priority,
            max_requests_per_second: default_max_rps(),
        }
    }

    pub fn with_max_rps(mut self, max_requests_per_second: u32) -> Self {
        self.max_requests_per_second = max_requests_per_second;
        self
    }

    /// Minimum spacing between two dispatches to this endpoint.
    ///
    /// The configured floor wins over the budget-derived interval so that
    /// free-tier providers are never hit faster than the floor.
    pub fn min_interval(&self, floor: Duration) -> Duration {
        let from_budget = Duration::from_millis(1000 / u64::from(self.max_requests_per_second.max(1)));
        from_budget.max(floor)
    }
}

fn default_max_rps() -> u32 {
    1
}

/// Backoff bases applied between attempts of `execute_with_retry`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffConfig {
    #[serde(default = "default_rate_limit_base_ms")]
    pub rate_limit_base_ms: u64,
    #[serde(default = "default_rate_limit_step_ms")]
    pub rate_limit_step_ms: u64,
    #[serde(default = "default_network_base_ms")]
    pub network_base_ms: u64,
    #[serde(default = "default_network_step_ms")]
    pub network_step_ms: u64,
    #[serde(default = "default_generic_step_ms")]
    pub generic_step_ms: u64,
}

fn default_rate_limit_base_ms() -> u64 {
    3000
}

fn default_rate_limit_step_ms() -> u64 {
    2000
}

fn default_network_base_ms() -> u64 {
    2000
}

fn default_network_step_ms() -> u64 {
    1500
}

fn default_generic_step_ms() -> u64 {
    1500
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            rate_limit_base_ms: default_rate_limit_base_ms(),
            rate_limit_step_ms: default_rate_limit_step_ms(),
            network_base_ms: default_network_base_ms(),
            network_step_ms: default_network_step_ms(),
            generic_step_ms: default_generic_step_ms(),
        }
    }
}

/// Global RPC manager configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcManagerConfig {
    /// Candidate endpoints; order in the file does not matter, priority does
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    /// Attempts per `execute_with_retry` call
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per-attempt timeout
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Floor for the per-endpoint minimum inter-request interval
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,

    /// Added on top of the remaining interval when a caller has to wait
    #[serde(default = "default_safety_buffer_ms")]
    pub safety_buffer_ms: u64,

    /// Upper bound of the randomized pre-delay before the first attempt
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,

    /// Consecutive errors after which an endpoint is taken out of rotation
    #[serde(default = "default_unhealthy_after_errors")]
    pub unhealthy_after_errors: u32,

    /// Period of the error-counter decay task
    #[serde(default = "default_error_decay_interval_ms")]
    pub error_decay_interval_ms: u64,

    /// Circuit breaker failure threshold
    #[serde(default = "default_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,

    /// Circuit breaker cooldown before HALF_OPEN
    #[serde(default = "default_circuit_breaker_cooldown_ms")]
    pub circuit_breaker_cooldown_ms: u64,

    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_max_retries() -> u32 {
    3
}

fn default_operation_timeout_ms() -> u64 {
    15_000
}

fn default_min_request_interval_ms() -> u64 {
    2_000
}

fn default_safety_buffer_ms() -> u64 {
    100
}

fn default_max_jitter_ms() -> u64 {
    250
}

fn default_unhealthy_after_errors() -> u32 {
    2
}

fn default_error_decay_interval_ms() -> u64 {
    60 * 60 * 1000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_circuit_breaker_cooldown_ms() -> u64 {
    60_000
}

impl RpcManagerConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("Failed to read config file {}: {}", path, e)))?;

        toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse TOML: {}", e)))
    }

    /// Load configuration from environment variables
    /// Expected format: RPC_ENDPOINTS=url1,url2,url3 (optional RPC_MAX_RPS)
    pub fn from_env() -> Result<Self, ConfigError> {
        let endpoints_str = std::env::var("RPC_ENDPOINTS")
            .map_err(|_| ConfigError::MissingEnvVar("RPC_ENDPOINTS".to_string()))?;

        let urls: Vec<String> = endpoints_str
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if urls.is_empty() {
            return Err(ConfigError::ValidationError("No RPC endpoints provided".to_string()));
        }

        let max_rps = std::env::var("RPC_MAX_RPS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(default_max_rps);

        let mut config = Self::from_urls(&urls);
        for endpoint in &mut config.endpoints {
            endpoint.max_requests_per_second = max_rps;
        }
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one RPC endpoint must be configured".to_string(),
            ));
        }

        let mut seen_urls = std::collections::HashSet::new();
        let mut seen_names = std::collections::HashSet::new();
        for endpoint in &self.endpoints {
            if !seen_urls.insert(&endpoint.url) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate RPC URL: {}",
                    endpoint.url
                )));
            }
            if !seen_names.insert(&endpoint.name) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate endpoint name: {}",
                    endpoint.name
                )));
            }

            if !endpoint.url.starts_with("http://") && !endpoint.url.starts_with("https://") {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid URL format: {}",
                    endpoint.url
                )));
            }

            if endpoint.max_requests_per_second == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid max_requests_per_second for {}: must be > 0",
                    endpoint.name
                )));
            }
        }

        if self.max_retries == 0 {
            return Err(ConfigError::ValidationError("max_retries must be > 0".to_string()));
        }

        if self.unhealthy_after_errors == 0 {
            return Err(ConfigError::ValidationError(
                "unhealthy_after_errors must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Create a default configuration from a list of URLs, priority = position
    pub fn from_urls(urls: &[String]) -> Self {
        let endpoints = urls
            .iter()
            .enumerate()
            .map(|(idx, url)| EndpointConfig::new(format!("rpc-{}", idx), url.clone(), idx as u32))
            .collect();

        Self::with_endpoints(endpoints)
    }

    pub fn with_endpoints(endpoints: Vec<EndpointConfig>) -> Self {
        Self {
            endpoints,
            max_retries: default_max_retries(),
            operation_timeout_ms: default_operation_timeout_ms(),
            min_request_interval_ms: default_min_request_interval_ms(),
            safety_buffer_ms: default_safety_buffer_ms(),
            max_jitter_ms: default_max_jitter_ms(),
            unhealthy_after_errors: default_unhealthy_after_errors(),
            error_decay_interval_ms: default_error_decay_interval_ms(),
            circuit_breaker_failure_threshold: default_failure_threshold(),
            circuit_breaker_cooldown_ms: default_circuit_breaker_cooldown_ms(),
            backoff: BackoffConfig::default(),
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }

    pub fn safety_buffer(&self) -> Duration {
        Duration::from_millis(self.safety_buffer_ms)
    }

    pub fn error_decay_interval(&self) -> Duration {
        Duration::from_millis(self.error_decay_interval_ms)
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Live connections kept per endpoint
    #[serde(default = "default_connections_per_endpoint")]
    pub connections_per_endpoint: usize,

    /// Stagger increment per endpoint index
    #[serde(default = "default_stagger_step_ms")]
    pub stagger_step_ms: u64,

    /// Largest stagger applied to any single endpoint
    #[serde(default = "default_stagger_cap_ms")]
    pub stagger_cap_ms: u64,

    /// Timeout for the chain-id handshake of a new connection
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_connections_per_endpoint() -> usize {
    1
}

fn default_stagger_step_ms() -> u64 {
    200
}

fn default_stagger_cap_ms() -> u64 {
    2_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connections_per_endpoint: default_connections_per_endpoint(),
            stagger_step_ms: default_stagger_step_ms(),
            stagger_cap_ms: default_stagger_cap_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl PoolConfig {
    /// Delay before connecting the endpoint at `index`: grows with the index, capped
    pub fn stagger_delay(&self, index: usize) -> Duration {
        let delay = self.stagger_step_ms.saturating_mul(index as u64 + 1);
        Duration::from_millis(delay.min(self.stagger_cap_ms))
    }
}

/// Network monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkMonitorConfig {
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// Consecutive failed probes after which the monitor reports an endpoint unhealthy
    #[serde(default = "default_unhealthy_after_failures")]
    pub unhealthy_after_failures: u32,

    /// EMA weight of a new latency sample
    #[serde(default = "default_latency_weight")]
    pub latency_weight: f64,

    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,

    /// Fraction of healthy endpoints required for `is_network_healthy`
    #[serde(default = "default_healthy_ratio")]
    pub healthy_ratio: f64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_check_interval_ms() -> u64 {
    30_000
}

fn default_unhealthy_after_failures() -> u32 {
    3
}

fn default_latency_weight() -> f64 {
    0.1
}

fn default_report_interval_ms() -> u64 {
    5 * 60 * 1000
}

fn default_healthy_ratio() -> f64 {
    0.25
}

fn default_probe_timeout_ms() -> u64 {
    10_000
}

impl Default for NetworkMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            unhealthy_after_failures: default_unhealthy_after_failures(),
            latency_weight: default_latency_weight(),
            report_interval_ms: default_report_interval_ms(),
            healthy_ratio: default_healthy_ratio(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl NetworkMonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.latency_weight) || self.latency_weight == 0.0 {
            return Err(ConfigError::ValidationError(
                "latency_weight must be in (0.0, 1.0]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.healthy_ratio) {
            return Err(ConfigError::ValidationError(
                "healthy_ratio must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.check_interval_ms == 0 {
            return Err(ConfigError::ValidationError("check_interval_ms must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Configuration-related errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
}
