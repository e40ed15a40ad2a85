//! Correlation of log lines belonging to one logical operation

use serde::{Deserialize, Serialize};
use tracing::Span;
use uuid::Uuid;

/// Identifier carried by every log line of one transaction submission,
/// across all of its attempts and endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for human-facing output
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }

    /// Span for a state-changing call; attempts and RPC retries nest under it
    pub fn transaction_span(&self, method: &str, contract: &str) -> Span {
        tracing::info_span!(
            "transaction",
            correlation_id = %self.0,
            method,
            contract,
        )
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_short_prefix() {
        let a = CorrelationId::new();
        let b = CorrelationId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert_eq!(a.short(), &a.as_str()[..8]);
        assert_eq!(CorrelationId::from("abc").short(), "abc");
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let id = CorrelationId::from("deadbeef");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""deadbeef""#);
    }
}
