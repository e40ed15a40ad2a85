//! Gas limit selection: buffered estimates and the static fallback table

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where the gas limit of a transaction came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GasSource {
    Estimated,
    Fallback,
}

/// Per-method gas limits used when estimation fails
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasLimitTable {
    #[serde(default = "default_method_limits")]
    pub methods: BTreeMap<String, u64>,

    #[serde(default = "default_gas_limit")]
    pub default_gas_limit: u64,
}

fn default_gas_limit() -> u64 {
    500_000
}

fn default_method_limits() -> BTreeMap<String, u64> {
    [
        ("registerNodeWithStaking", 1_000_000),
        ("registerNode", 800_000),
        ("approve", 100_000),
        ("transfer", 100_000),
        ("mint", 200_000),
        ("deregisterNode", 300_000),
    ]
    .into_iter()
    .map(|(name, limit)| (name.to_string(), limit))
    .collect()
}

impl Default for GasLimitTable {
    fn default() -> Self {
        Self {
            methods: default_method_limits(),
            default_gas_limit: default_gas_limit(),
        }
    }
}

impl GasLimitTable {
    pub fn with_limit(mut self, method: impl Into<String>, limit: u64) -> Self {
        self.methods.insert(method.into(), limit);
        self
    }

    pub fn fallback_for(&self, method: &str) -> u64 {
        self.methods
            .get(method)
            .copied()
            .unwrap_or(self.default_gas_limit)
    }
}

/// `estimate * (100 + percent) / 100`, rounded down
pub fn buffered(estimate: u64, percent: u32) -> u64 {
    let scaled = u128::from(estimate) * u128::from(100 + percent) / 100;
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let table = GasLimitTable::default();
        assert_eq!(table.fallback_for("registerNodeWithStaking"), 1_000_000);
        assert_eq!(table.fallback_for("registerNode"), 800_000);
        assert_eq!(table.fallback_for("approve"), 100_000);
        assert_eq!(table.fallback_for("transfer"), 100_000);
        assert_eq!(table.fallback_for("mint"), 200_000);
        assert_eq!(table.fallback_for("deregisterNode"), 300_000);
        assert_eq!(table.fallback_for("castVote"), 500_000);
    }

    #[test]
    fn test_override_and_partial_toml() {
        let table = GasLimitTable::default().with_limit("castVote", 150_000);
        assert_eq!(table.fallback_for("castVote"), 150_000);

        let parsed: GasLimitTable = toml::from_str("default_gas_limit = 650000").unwrap();
        assert_eq!(parsed.fallback_for("mint"), 200_000);
        assert_eq!(parsed.fallback_for("unknown"), 650_000);
    }

    #[test]
    fn test_buffer() {
        assert_eq!(buffered(100_000, 20), 120_000);
        assert_eq!(buffered(21_000, 0), 21_000);
        assert_eq!(buffered(u64::MAX, 20), u64::MAX);
    }
}
