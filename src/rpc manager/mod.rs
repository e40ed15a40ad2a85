//! RPC Manager Module
//!
//! Resilient access to a set of unreliable, rate-limited JSON-RPC endpoints:
//! priority registry, staggered connection pool, independent network
//! monitor, circuit breakers and the retrying `RpcManager` façade.

// Submodules
pub mod circuit_breaker;
pub mod endpoint;
pub mod manager;
pub mod network_monitor;
pub mod rpc_atomics;
pub mod rpc_config;
pub mod rpc_errors;
pub mod rpc_metrics;
pub mod rpc_pool;
pub mod transport;

// Re-exports for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitState, RPC_FAMILY, TRANSACTION_SUBMISSION_FAMILY};
pub use endpoint::{Endpoint, EndpointRegistry, HealthEvent};
pub use manager::{RpcManager, RpcOperation, SequentialOperation};
pub use network_monitor::NetworkMonitor;
pub use rpc_atomics::OperationMetrics;
pub use rpc_config::{BackoffConfig, ConfigError, EndpointConfig, NetworkMonitorConfig, PoolConfig, RpcManagerConfig};
pub use rpc_errors::{BackoffPolicy, FailureKind, RpcManagerError};
pub use rpc_metrics::{ComprehensiveStatus, EndpointStatus, MetricsSnapshot, NetworkSnapshot, PoolStatus};
pub use rpc_pool::ConnectionPool;
pub use transport::{CallRequest, ChainClient, ClientFactory, FeeData, HttpChainClient, HttpClientFactory, TransactionReceipt};
