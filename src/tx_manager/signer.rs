//! Signer abstraction
//!
//! Key material never enters this crate: the wallet collaborator receives a
//! fully specified transaction and returns the signed, RLP-encoded bytes.

use alloy_primitives::{Address, Bytes, U256};
use async_trait::async_trait;

use super::errors::SignerError;
use super::fees::FeeParams;

/// Everything the signer needs to produce a raw transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    pub chain_id: u64,
    pub nonce: u64,
    pub to: Address,
    pub value: U256,
    pub input: Bytes,
    pub gas_limit: u64,
    pub fees: FeeParams,
}

/// Async signer for outgoing transactions
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    /// Sender address; nonces are tracked per address
    fn address(&self) -> Address;

    /// Sign and encode a transaction for `eth_sendRawTransaction`
    async fn sign_transaction(&self, tx: &UnsignedTransaction) -> Result<Bytes, SignerError>;
}
