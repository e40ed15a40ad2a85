//! Test Utilities Module
//!
//! Scripted doubles for the provider connection, the connection factory and
//! the signer, for deterministic tests without a node.
//!
//! These utilities are only compiled when running tests or when the
//! `test_utils` feature is enabled.

#![cfg(any(test, feature = "test_utils"))]

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::rpc_manager::transport::RpcResult;
use crate::rpc_manager::{
    CallRequest, ChainClient, ClientFactory, EndpointConfig, FeeData, RpcManagerError, TransactionReceipt,
};
use crate::tx_manager::{SignerError, TransactionSigner, UnsignedTransaction};

const GWEI: u128 = 1_000_000_000;

#[derive(Debug)]
struct Script {
    latency: Duration,
    always_fail: Option<String>,
    fail_next: VecDeque<String>,
    chain_id_failures: u32,
    block_number: u64,
    chain_id: u64,
    estimate: Result<u64, String>,
    fee_data: Result<FeeData, String>,
    nonce: u64,
    send_failures: VecDeque<String>,
    sent: Vec<Bytes>,
    auto_mine: bool,
    receipt_status: bool,
    receipts: HashMap<B256, TransactionReceipt>,
    known: HashSet<B256>,
    call_result: Bytes,
    balance: U256,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            always_fail: None,
            fail_next: VecDeque::new(),
            chain_id_failures: 0,
            block_number: 100,
            chain_id: 31337,
            estimate: Ok(100_000),
            fee_data: Ok(FeeData {
                gas_price: Some(30 * GWEI),
                max_fee_per_gas: Some(40 * GWEI),
                max_priority_fee_per_gas: Some(2 * GWEI),
            }),
            nonce: 0,
            send_failures: VecDeque::new(),
            sent: Vec::new(),
            auto_mine: true,
            receipt_status: true,
            receipts: HashMap::new(),
            known: HashSet::new(),
            call_result: Bytes::new(),
            balance: U256::ZERO,
        }
    }
}

/// Scripted `ChainClient`.
///
/// Clones share state, so a test can keep a handle after registering the
/// client with a `ScriptedFactory`. Every trait method counts as one call,
/// waits the configured latency and then consults the failure script.
#[derive(Debug, Clone)]
pub struct ScriptedClient {
    name: String,
    script: Arc<Mutex<Script>>,
    calls: Arc<AtomicU32>,
}

impl ScriptedClient {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Arc::new(Mutex::new(Script::default())),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.script.lock().latency = latency;
        self
    }

    /// Every call fails with `message` until `clear_failures`
    pub fn always_fail(&self, message: &str) {
        self.script.lock().always_fail = Some(message.to_string());
    }

    /// The next call fails with `message`
    pub fn fail_next(&self, message: &str) {
        self.script.lock().fail_next.push_back(message.to_string());
    }

    pub fn clear_failures(&self) {
        let mut script = self.script.lock();
        script.always_fail = None;
        script.fail_next.clear();
        script.send_failures.clear();
    }

    /// `chain_id` fails the next `times` calls
    pub fn fail_chain_id_times(&self, times: u32) {
        self.script.lock().chain_id_failures = times;
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_block_number(&self, block: u64) {
        self.script.lock().block_number = block;
    }

    pub fn set_chain_id(&self, chain_id: u64) {
        self.script.lock().chain_id = chain_id;
    }

    pub fn set_estimate(&self, gas: u64) {
        self.script.lock().estimate = Ok(gas);
    }

    pub fn fail_estimate(&self, message: &str) {
        self.script.lock().estimate = Err(message.to_string());
    }

    pub fn set_fee_data(&self, fee_data: FeeData) {
        self.script.lock().fee_data = Ok(fee_data);
    }

    pub fn fail_fee_data(&self, message: &str) {
        self.script.lock().fee_data = Err(message.to_string());
    }

    pub fn set_nonce(&self, nonce: u64) {
        self.script.lock().nonce = nonce;
    }

    /// The next `eth_sendRawTransaction` fails with `message`
    pub fn fail_send(&self, message: &str) {
        self.script.lock().send_failures.push_back(message.to_string());
    }

    /// Mine accepted transactions immediately (default) or leave them pending
    pub fn set_auto_mine(&self, auto_mine: bool) {
        self.script.lock().auto_mine = auto_mine;
    }

    /// Execution status of receipts produced from now on
    pub fn set_receipt_status(&self, success: bool) {
        self.script.lock().receipt_status = success;
    }

    /// Mine every accepted transaction that has no receipt yet
    pub fn mine_pending(&self) {
        let mut script = self.script.lock();
        let pending: Vec<B256> = script
            .known
            .iter()
            .filter(|hash| !script.receipts.contains_key(*hash))
            .copied()
            .collect();
        for hash in pending {
            mine(&mut script, hash);
        }
    }

    /// Mine one accepted transaction, leaving the rest pending
    pub fn mine_transaction(&self, hash: B256) {
        let mut script = self.script.lock();
        if script.known.contains(&hash) && !script.receipts.contains_key(&hash) {
            mine(&mut script, hash);
        }
    }

    /// Raw transactions accepted so far, in order
    pub fn sent_transactions(&self) -> Vec<Bytes> {
        self.script.lock().sent.clone()
    }

    pub fn set_call_result(&self, data: impl Into<Bytes>) {
        self.script.lock().call_result = data.into();
    }

    pub fn set_balance(&self, balance: U256) {
        self.script.lock().balance = balance;
    }

    fn error(&self, message: &str) -> RpcManagerError {
        RpcManagerError::from_message(&self.name, message, None)
    }

    /// Count the call, apply latency and the generic failure script
    async fn enter(&self) -> RpcResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.script.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut script = self.script.lock();
        if let Some(message) = &script.always_fail {
            return Err(self.error(message));
        }
        if let Some(message) = script.fail_next.pop_front() {
            return Err(self.error(&message));
        }
        Ok(())
    }
}

fn mine(script: &mut Script, hash: B256) {
    script.block_number += 1;
    let receipt = TransactionReceipt {
        transaction_hash: hash,
        block_number: Some(script.block_number),
        gas_used: 21_000,
        effective_gas_price: 30 * GWEI,
        status: script.receipt_status,
    };
    script.receipts.insert(hash, receipt);
}

#[async_trait]
impl ChainClient for ScriptedClient {
    fn endpoint(&self) -> &str {
        &self.name
    }

    async fn block_number(&self) -> RpcResult<u64> {
        self.enter().await?;
        Ok(self.script.lock().block_number)
    }

    async fn chain_id(&self) -> RpcResult<u64> {
        self.enter().await?;
        let mut script = self.script.lock();
        if script.chain_id_failures > 0 {
            script.chain_id_failures -= 1;
            return Err(self.error("failed to detect network"));
        }
        Ok(script.chain_id)
    }

    async fn balance(&self, _address: Address) -> RpcResult<U256> {
        self.enter().await?;
        Ok(self.script.lock().balance)
    }

    async fn call(&self, _request: &CallRequest) -> RpcResult<Bytes> {
        self.enter().await?;
        Ok(self.script.lock().call_result.clone())
    }

    async fn estimate_gas(&self, _request: &CallRequest) -> RpcResult<u64> {
        self.enter().await?;
        let estimate = self.script.lock().estimate.clone();
        estimate.map_err(|message| self.error(&message))
    }

    async fn fee_data(&self) -> RpcResult<FeeData> {
        self.enter().await?;
        let fee_data = self.script.lock().fee_data.clone();
        fee_data.map_err(|message| self.error(&message))
    }

    async fn pending_nonce(&self, _address: Address) -> RpcResult<u64> {
        self.enter().await?;
        Ok(self.script.lock().nonce)
    }

    async fn send_raw_transaction(&self, raw: &Bytes) -> RpcResult<B256> {
        self.enter().await?;
        let mut script = self.script.lock();
        if let Some(message) = script.send_failures.pop_front() {
            return Err(self.error(&message));
        }
        let hash = keccak256(raw);
        if !script.known.insert(hash) {
            return Err(self.error("already known"));
        }
        script.sent.push(raw.clone());
        script.nonce += 1;
        if script.auto_mine {
            mine(&mut script, hash);
        }
        Ok(hash)
    }

    async fn transaction_receipt(&self, hash: B256) -> RpcResult<Option<TransactionReceipt>> {
        self.enter().await?;
        Ok(self.script.lock().receipts.get(&hash).cloned())
    }

    async fn transaction_exists(&self, hash: B256) -> RpcResult<bool> {
        self.enter().await?;
        Ok(self.script.lock().known.contains(&hash))
    }
}

/// `ClientFactory` handing out registered `ScriptedClient`s by endpoint name.
///
/// Unregistered endpoints get a fresh default client.
#[derive(Debug, Default)]
pub struct ScriptedFactory {
    clients: Mutex<HashMap<String, ScriptedClient>>,
    refused: Mutex<HashSet<String>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client: ScriptedClient) {
        self.clients.lock().insert(client.name.clone(), client);
    }

    /// `connect` to `name` fails
    pub fn fail_connect(&self, name: &str) {
        self.refused.lock().insert(name.to_string());
    }

    pub fn allow_connect(&self, name: &str) {
        self.refused.lock().remove(name);
    }

    pub fn client(&self, name: &str) -> Option<ScriptedClient> {
        self.clients.lock().get(name).cloned()
    }
}

impl ClientFactory for ScriptedFactory {
    fn connect(&self, endpoint: &EndpointConfig) -> RpcResult<Arc<dyn ChainClient>> {
        if self.refused.lock().contains(&endpoint.name) {
            return Err(RpcManagerError::Transport {
                endpoint: endpoint.name.clone(),
                message: "connection refused".to_string(),
            });
        }
        let client = self
            .clients
            .lock()
            .entry(endpoint.name.clone())
            .or_insert_with(|| ScriptedClient::new(endpoint.name.clone()))
            .clone();
        Ok(Arc::new(client))
    }
}

/// Signer that records what it was asked to sign.
///
/// The "raw transaction" is a deterministic encoding of the request, so
/// distinct requests hash differently and identical ones collide.
#[derive(Debug, Clone)]
pub struct MockSigner {
    address: Address,
    signed: Arc<Mutex<Vec<UnsignedTransaction>>>,
    fail_with: Arc<Mutex<Option<String>>>,
}

impl MockSigner {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            signed: Arc::new(Mutex::new(Vec::new())),
            fail_with: Arc::new(Mutex::new(None)),
        }
    }

    pub fn fail_with(&self, message: &str) {
        *self.fail_with.lock() = Some(message.to_string());
    }

    pub fn signed(&self) -> Vec<UnsignedTransaction> {
        self.signed.lock().clone()
    }
}

impl Default for MockSigner {
    fn default() -> Self {
        Self::new(Address::repeat_byte(0xAA))
    }
}

#[async_trait]
impl TransactionSigner for MockSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign_transaction(&self, tx: &UnsignedTransaction) -> Result<Bytes, SignerError> {
        if let Some(message) = self.fail_with.lock().clone() {
            return Err(SignerError::Signing(message));
        }
        self.signed.lock().push(tx.clone());

        let mut raw = format!(
            "{}:{}:{}:{}:{:?}:",
            tx.chain_id, tx.nonce, tx.to, tx.gas_limit, tx.fees
        )
        .into_bytes();
        raw.extend_from_slice(&tx.input);
        Ok(Bytes::from(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_client_failure_script() {
        let client = ScriptedClient::new("a");
        client.fail_next("429 Too Many Requests");
        let err = client.block_number().await.unwrap_err();
        assert!(matches!(err, RpcManagerError::RateLimited { .. }));
        assert_eq!(client.block_number().await.unwrap(), 100);
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_send_mines_and_detects_duplicates() {
        let client = ScriptedClient::new("a");
        let raw = Bytes::from_static(b"tx");
        let hash = client.send_raw_transaction(&raw).await.unwrap();
        let receipt = client.transaction_receipt(hash).await.unwrap().unwrap();
        assert_eq!(receipt.block_number, Some(101));
        assert!(client.send_raw_transaction(&raw).await.is_err());

        client.set_auto_mine(false);
        let other = client.send_raw_transaction(&Bytes::from_static(b"tx2")).await.unwrap();
        assert!(client.transaction_receipt(other).await.unwrap().is_none());
        assert!(client.transaction_exists(other).await.unwrap());
        client.mine_pending();
        assert!(client.transaction_receipt(other).await.unwrap().is_some());
    }

    #[test]
    fn test_factory_shares_state_with_handles() {
        let factory = ScriptedFactory::new();
        let a = ScriptedClient::new("a");
        factory.register(a.clone());
        let conn = factory
            .connect(&EndpointConfig::new("a", "https://a.example", 0))
            .unwrap();
        assert_eq!(conn.endpoint(), "a");

        factory.fail_connect("b");
        assert!(factory
            .connect(&EndpointConfig::new("b", "https://b.example", 1))
            .is_err());
        assert!(factory
            .connect(&EndpointConfig::new("c", "https://c.example", 2))
            .is_ok());
        assert!(factory.client("c").is_some());
    }
}
