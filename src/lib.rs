//! agent-rpc - resilient JSON-RPC and transaction client
//!
//! Automated agents talk to a chain through a handful of unreliable,
//! rate-limited public endpoints. This library hides that behind two
//! services constructed once at start-up and shared by reference:
//!
//! - [`rpc_manager::RpcManager`]: endpoint registry, connection pool,
//!   network monitor, circuit breakers and the retrying call path
//! - [`tx_manager::TransactionManager`]: gas, fees, nonces, signing,
//!   submission and confirmation of state-changing contract calls

pub mod config;
pub mod metrics;
pub mod observability;

// Component modules with non-standard paths (directories with spaces)
#[path = "rpc manager/mod.rs"]
pub mod rpc_manager;

pub mod tx_manager;

pub mod test_utils;

#[cfg(test)]
mod tests;

pub use config::AppConfig;
pub use metrics::RpcTelemetry;
pub use observability::CorrelationId;
pub use rpc_manager::{RpcManager, RpcManagerConfig, RpcManagerError};
pub use tx_manager::{TransactionManager, TransactionResult, TransactionSigner};
