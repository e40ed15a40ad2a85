//! Error types for the transaction manager

use alloy_primitives::B256;
use thiserror::Error;

use crate::rpc_manager::rpc_errors::NON_RETRYABLE_PATTERNS;
use crate::rpc_manager::{FailureKind, RpcManagerError};

/// Message fragments of failures worth another submission attempt
const RETRYABLE_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "network",
    "connection",
    "rate limit",
    "too many requests",
    "429",
    "-32005",
];

/// Errors raised while building, submitting or tracking a transaction
#[derive(Error, Debug)]
pub enum TransactionError {
    /// Failure reported by the RPC layer (after its own retries)
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcManagerError),

    /// The external signer refused or failed
    #[error(transparent)]
    Signing(#[from] SignerError),

    /// Mined with status 0
    #[error("Transaction {hash} reverted")]
    Reverted { hash: B256 },

    /// Not confirmed within the timeout
    ///
    /// The transaction may still be mined later; the next attempt replaces it
    /// with the same nonce.
    #[error("Transaction {hash} not confirmed within {timeout_ms}ms (timeout)")]
    ConfirmationTimeout { hash: B256, timeout_ms: u64 },

    /// Contract return data did not match the typed binding
    #[error("Failed to decode return data of {method}: {reason}")]
    Decode { method: String, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl TransactionError {
    /// Whether another attempt may succeed.
    ///
    /// Anything not recognisably transient is treated as final so that a
    /// side-effecting call is never duplicated.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConfirmationTimeout { .. } => true,
            Self::Rpc(e) => match e.failure_kind() {
                FailureKind::RateLimit | FailureKind::Network => true,
                FailureKind::NonRetryable => false,
                FailureKind::Generic => is_retryable_message(&e.root_cause().to_string()),
            },
            Self::Signing(_)
            | Self::Reverted { .. }
            | Self::Decode { .. }
            | Self::Configuration(_) => false,
        }
    }

    /// Category for metrics and logs
    pub fn category(&self) -> &'static str {
        match self {
            Self::Rpc(e) => e.failure_kind().as_str(),
            Self::Signing(_) => "signing",
            Self::Reverted { .. } => "reverted",
            Self::ConfirmationTimeout { .. } => "confirmation_timeout",
            Self::Decode { .. } => "decode",
            Self::Configuration(_) => "config",
        }
    }
}

/// Message-level classification used for errors the RPC layer left generic
pub fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    if NON_RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p)) {
        return false;
    }
    RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Errors from a `TransactionSigner`
#[derive(Error, Debug, Clone)]
pub enum SignerError {
    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Signer unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpc(message: &str) -> TransactionError {
        TransactionError::Rpc(RpcManagerError::from_message("a", message, Some(-32000)))
    }

    #[test]
    fn test_non_retryable_messages() {
        assert!(!rpc("insufficient funds for gas * price + value").is_retryable());
        assert!(!rpc("nonce too low").is_retryable());
        assert!(!rpc("already known").is_retryable());
        assert!(!rpc("replacement transaction underpriced").is_retryable());
    }

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(rpc("429 Too Many Requests").is_retryable());
        assert!(rpc("network error").is_retryable());
        assert!(TransactionError::Rpc(RpcManagerError::Timeout {
            endpoint: "a".to_string(),
            timeout_ms: 15_000,
        })
        .is_retryable());
        assert!(TransactionError::ConfirmationTimeout {
            hash: B256::ZERO,
            timeout_ms: 180_000,
        }
        .is_retryable());
    }

    #[test]
    fn test_unknown_errors_fail_closed() {
        assert!(!rpc("gas required exceeds allowance").is_retryable());
        assert!(!TransactionError::Reverted { hash: B256::ZERO }.is_retryable());
        assert!(!TransactionError::Signing(SignerError::Signing("locked".into())).is_retryable());

        let exhausted = TransactionError::Rpc(RpcManagerError::RetriesExhausted {
            description: "eth_sendRawTransaction".to_string(),
            attempts: 3,
            last_error: Box::new(RpcManagerError::RateLimited {
                endpoint: "a".to_string(),
                message: "429".to_string(),
            }),
        });
        assert!(exhausted.is_retryable());
        assert_eq!(exhausted.category(), "rate_limit");
    }

    #[test]
    fn test_circuit_open_is_final() {
        let err = TransactionError::Rpc(RpcManagerError::CircuitOpen {
            family: "transaction_submission".to_string(),
            failure_count: 5,
        });
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_message_classifier() {
        assert!(is_retryable_message("connection reset by peer"));
        assert!(!is_retryable_message("execution reverted: not owner"));
        assert!(!is_retryable_message("unknown account"));
    }
}
