use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::circuit_breaker::CircuitSnapshot;

/// One row of the endpoint table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointStatus {
    pub name: String,
    pub url: String,
    pub priority: u32,
    pub max_requests_per_second: u32,
    pub healthy: bool,
    pub consecutive_errors: u32,
    pub total_requests: u64,
    pub total_errors: u64,
    pub last_used_ms_ago: Option<u64>,
    pub last_rate_limit_ms_ago: Option<u64>,
}

/// Pool occupancy of one endpoint
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolOccupancy {
    pub healthy_count: usize,
    pub total_count: usize,
}

/// Endpoint name -> occupancy
pub type PoolStatus = BTreeMap<String, PoolOccupancy>;

/// `OperationMetrics` at a point in time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rate_limit_hits: u64,
    pub average_response_time_ms: f64,
    pub success_rate: f64,
    pub active_provider: Option<String>,
}

/// Monitor view of one endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderHealthSnapshot {
    pub name: String,
    pub healthy: bool,
    pub average_latency_ms: f64,
    pub success_rate: f64,
    pub total_checks: u64,
    pub failed_checks: u64,
    pub consecutive_failures: u32,
    pub last_block_number: Option<u64>,
    pub chain_id: Option<u64>,
    pub last_error: Option<String>,
    pub ms_since_last_success: Option<u64>,
}

/// Aggregated network monitor state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSnapshot {
    pub running: bool,
    pub network_healthy: bool,
    pub healthy_providers: usize,
    pub total_providers: usize,
    pub best_provider: Option<String>,
    pub providers: Vec<ProviderHealthSnapshot>,
}

impl NetworkSnapshot {
    pub fn overall_status(&self) -> HealthLevel {
        HealthLevel::from_counts(self.healthy_providers, self.total_providers)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthLevel {
    pub fn from_counts(healthy: usize, total: usize) -> Self {
        if total > 0 && healthy == total {
            HealthLevel::Healthy
        } else if healthy > 0 {
            HealthLevel::Degraded
        } else {
            HealthLevel::Unhealthy
        }
    }
}

impl fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthLevel::Healthy => "healthy",
            HealthLevel::Degraded => "degraded",
            HealthLevel::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// Everything an external status consumer needs in one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComprehensiveStatus {
    pub timestamp: DateTime<Utc>,
    pub status: HealthLevel,
    pub metrics: MetricsSnapshot,
    pub endpoints: Vec<EndpointStatus>,
    pub network: NetworkSnapshot,
    pub pool: PoolStatus,
    #[serde(default, skip_deserializing)]
    pub circuit_breakers: Vec<CircuitSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_level_from_counts() {
        assert_eq!(HealthLevel::from_counts(3, 3), HealthLevel::Healthy);
        assert_eq!(HealthLevel::from_counts(1, 3), HealthLevel::Degraded);
        assert_eq!(HealthLevel::from_counts(0, 3), HealthLevel::Unhealthy);
        assert_eq!(HealthLevel::from_counts(0, 0), HealthLevel::Unhealthy);
    }

    #[test]
    fn test_pool_status_serializes_by_name() {
        let mut pool = PoolStatus::new();
        pool.insert(
            "b".to_string(),
            PoolOccupancy {
                healthy_count: 0,
                total_count: 1,
            },
        );
        pool.insert(
            "a".to_string(),
            PoolOccupancy {
                healthy_count: 1,
                total_count: 1,
            },
        );
        let json = serde_json::to_string(&pool).unwrap();
        assert_eq!(
            json,
            r#"{"a":{"healthy_count":1,"total_count":1},"b":{"healthy_count":0,"total_count":1}}"#
        );
    }
}
