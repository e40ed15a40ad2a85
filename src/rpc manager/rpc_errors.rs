use std::time::Duration;
use thiserror::Error;

use super::rpc_config::BackoffConfig;

/// Message fragments that identify provider-side throttling
const RATE_LIMIT_PATTERNS: &[&str] = &[
    "too many requests",
    "rate limit",
    "-32005",
    "429",
    "batch of more than",
];

/// Message fragments that identify transport / reachability problems
const NETWORK_PATTERNS: &[&str] = &[
    "failed to detect network",
    "timeout",
    "timed out",
    "enotfound",
    "network error",
    "connection refused",
    "connection reset",
];

/// Message fragments for failures caused by the request itself. Retrying them
/// on another endpoint cannot succeed and may duplicate a side effect.
pub(crate) const NON_RETRYABLE_PATTERNS: &[&str] = &[
    "insufficient funds",
    "nonce too low",
    "nonce has already been used",
    "already known",
    "replacement transaction underpriced",
    "replacement fee too low",
    "execution reverted",
];

/// Classified failure kind, drives rotation and backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RateLimit,
    Network,
    NonRetryable,
    Generic,
}

impl FailureKind {
    /// Classify an error message (case-insensitive)
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if NON_RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p)) {
            FailureKind::NonRetryable
        } else if RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p)) {
            FailureKind::RateLimit
        } else if NETWORK_PATTERNS.iter().any(|p| lower.contains(p)) {
            FailureKind::Network
        } else {
            FailureKind::Generic
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::RateLimit => "rate_limit",
            FailureKind::Network => "network",
            FailureKind::NonRetryable => "non_retryable",
            FailureKind::Generic => "generic",
        }
    }

    /// Whether the failure should move traffic to the next endpoint
    pub fn forces_rotation(&self) -> bool {
        matches!(self, FailureKind::RateLimit | FailureKind::Network)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comprehensive RPC Manager error types
#[derive(Debug, Clone, Error)]
pub enum RpcManagerError {
    /// Transport-level errors (network, connection)
    #[error("Transport error: {message} (endpoint: {endpoint})")]
    Transport { endpoint: String, message: String },

    /// The attempt did not finish within the operation timeout
    #[error("Operation timeout after {timeout_ms}ms (endpoint: {endpoint})")]
    Timeout { endpoint: String, timeout_ms: u64 },

    /// RPC response errors (from the RPC server)
    #[error("RPC response error: {message} (endpoint: {endpoint}, code: {code:?})")]
    RpcResponse {
        endpoint: String,
        message: String,
        code: Option<i64>,
    },

    /// Provider-side throttling
    #[error("Rate limit exceeded: {message} (endpoint: {endpoint})")]
    RateLimited { endpoint: String, message: String },

    /// Response could not be decoded into the expected shape
    #[error("Malformed response: {message} (endpoint: {endpoint})")]
    Decode { endpoint: String, message: String },

    /// No endpoint could produce a connection
    #[error("No healthy endpoints available (total: {total}, unhealthy: {unhealthy})")]
    NoHealthyEndpoints { total: usize, unhealthy: usize },

    /// Circuit breaker is open for an operation family
    #[error("Circuit breaker open for {family} (failures: {failure_count})")]
    CircuitOpen { family: String, failure_count: u32 },

    /// All attempts failed
    #[error("{description} failed after {attempts} attempt(s): {last_error}")]
    RetriesExhausted {
        description: String,
        attempts: u32,
        #[source]
        last_error: Box<RpcManagerError>,
    },

    /// A non-continuable operation failed inside `execute_sequentially`
    #[error("Sequence '{name}' aborted at operation {index}: {source}")]
    SequenceAborted {
        name: String,
        index: usize,
        #[source]
        source: Box<RpcManagerError>,
    },

    /// The caller cancelled the wait
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RpcManagerError {
    /// Build the right variant for an error message returned by an endpoint
    pub fn from_message(endpoint: &str, message: impl Into<String>, code: Option<i64>) -> Self {
        let message = message.into();
        let kind = if code == Some(-32005) || code == Some(429) {
            FailureKind::RateLimit
        } else {
            FailureKind::classify(&message)
        };

        match kind {
            FailureKind::RateLimit => RpcManagerError::RateLimited {
                endpoint: endpoint.to_string(),
                message,
            },
            FailureKind::Network => RpcManagerError::Transport {
                endpoint: endpoint.to_string(),
                message,
            },
            FailureKind::NonRetryable | FailureKind::Generic => RpcManagerError::RpcResponse {
                endpoint: endpoint.to_string(),
                message,
                code,
            },
        }
    }

    /// Failure kind used for rotation/backoff decisions
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            RpcManagerError::RateLimited { .. } => FailureKind::RateLimit,
            RpcManagerError::Transport { .. } | RpcManagerError::Timeout { .. } => FailureKind::Network,
            RpcManagerError::RpcResponse { code, message, .. } => {
                if matches!(code, Some(-32005) | Some(429)) {
                    FailureKind::RateLimit
                } else {
                    FailureKind::classify(message)
                }
            }
            RpcManagerError::RetriesExhausted { last_error, .. } => last_error.failure_kind(),
            RpcManagerError::SequenceAborted { source, .. } => source.failure_kind(),
            RpcManagerError::CircuitOpen { .. }
            | RpcManagerError::Cancelled(_)
            | RpcManagerError::Configuration(_) => FailureKind::NonRetryable,
            RpcManagerError::Decode { .. }
            | RpcManagerError::NoHealthyEndpoints { .. }
            | RpcManagerError::Internal(_) => FailureKind::Generic,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.failure_kind() != FailureKind::NonRetryable
    }

    /// Get the endpoint associated with this error, if any
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            RpcManagerError::Transport { endpoint, .. } => Some(endpoint),
            RpcManagerError::Timeout { endpoint, .. } => Some(endpoint),
            RpcManagerError::RpcResponse { endpoint, .. } => Some(endpoint),
            RpcManagerError::RateLimited { endpoint, .. } => Some(endpoint),
            RpcManagerError::Decode { endpoint, .. } => Some(endpoint),
            RpcManagerError::RetriesExhausted { last_error, .. } => last_error.endpoint(),
            _ => None,
        }
    }

    /// Innermost error, skipping the aggregation wrappers
    pub fn root_cause(&self) -> &RpcManagerError {
        match self {
            RpcManagerError::RetriesExhausted { last_error, .. } => last_error.root_cause(),
            RpcManagerError::SequenceAborted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Backoff between attempts of `execute_with_retry`.
///
/// Attempts are 1-based. Rate limits wait `base + attempt * step`, network
/// failures likewise with their own bases, anything else `attempt * step`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    config: BackoffConfig,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn delay_for(&self, kind: FailureKind, attempt: u32) -> Duration {
        let attempt = u64::from(attempt);
        let ms = match kind {
            FailureKind::RateLimit => self
                .config
                .rate_limit_base_ms
                .saturating_add(attempt.saturating_mul(self.config.rate_limit_step_ms)),
            FailureKind::Network => self
                .config
                .network_base_ms
                .saturating_add(attempt.saturating_mul(self.config.network_step_ms)),
            FailureKind::Generic => attempt.saturating_mul(self.config.generic_step_ms),
            FailureKind::NonRetryable => 0,
        };
        Duration::from_millis(ms)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
