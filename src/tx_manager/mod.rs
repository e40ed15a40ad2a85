//! Transaction Manager Module
//!
//! State-changing contract calls on top of the RPC manager: gas estimation
//! with a static fallback table, EIP-1559 or legacy fees, per-signer nonces,
//! external signing, submission and confirmation with classified retries.

pub mod contracts;
pub mod errors;
pub mod fees;
pub mod gas;
pub mod manager;
pub mod nonce;
pub mod signer;

pub use contracts::{method_name, IGovernance, IMintable, INodeRegistry, IERC20};
pub use errors::{SignerError, TransactionError};
pub use fees::FeeParams;
pub use gas::{GasLimitTable, GasSource};
pub use manager::{
    GasEstimate, TransactionConfig, TransactionManager, TransactionManagerConfig, TransactionResult,
    TransactionStatus,
};
pub use nonce::NonceTracker;
pub use signer::{TransactionSigner, UnsignedTransaction};
