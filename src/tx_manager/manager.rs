//! Transaction manager
//!
//! Builds, signs, submits and confirms contract calls on top of the
//! `RpcManager`. Every attempt runs gas estimation, fee resolution, nonce
//! reservation, signing, submission and a bounded confirmation wait. Write
//! paths never return `Err`: the outcome is a `TransactionResult` so batch
//! callers can keep going after a failure.

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_sol_types::SolCall;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn, Instrument};

use crate::metrics::RpcTelemetry;
use crate::observability::CorrelationId;
use crate::rpc_manager::rpc_config::ConfigError;
use crate::rpc_manager::{
    CallRequest, RpcManager, RpcManagerError, TransactionReceipt, RPC_FAMILY, TRANSACTION_SUBMISSION_FAMILY,
};

use super::contracts::method_name;
use super::errors::TransactionError;
use super::fees::FeeParams;
use super::gas::{buffered, GasLimitTable, GasSource};
use super::nonce::NonceTracker;
use super::signer::{TransactionSigner, UnsignedTransaction};

/// Transaction manager configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionManagerConfig {
    /// Attempts per `execute_transaction`
    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_confirmation_timeout_ms")]
    pub confirmation_timeout_ms: u64,

    #[serde(default = "default_confirmation_poll_ms")]
    pub confirmation_poll_ms: u64,

    #[serde(default = "default_confirmations")]
    pub confirmations: u64,

    /// Safety margin added to a successful estimate
    #[serde(default = "default_gas_buffer_percent")]
    pub gas_buffer_percent: u32,

    /// Fee increase for a same-nonce replacement
    #[serde(default = "default_fee_bump_percent")]
    pub fee_bump_percent: u32,

    /// Legacy gas price used when no fee data is available
    #[serde(default = "default_gas_price_wei")]
    pub default_gas_price_wei: u64,

    /// RPC attempts for `eth_estimateGas` before falling back to the table
    #[serde(default = "default_estimation_retries")]
    pub estimation_retries: u32,

    /// Backoff between attempts is `base * 2^attempt`
    #[serde(default = "default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,

    /// Queried once from the network when unset
    #[serde(default)]
    pub chain_id: Option<u64>,

    #[serde(default)]
    pub gas_limits: GasLimitTable,
}

fn default_retries() -> u32 {
    3
}

fn default_confirmation_timeout_ms() -> u64 {
    180_000
}

fn default_confirmation_poll_ms() -> u64 {
    2_000
}

fn default_confirmations() -> u64 {
    1
}

fn default_gas_buffer_percent() -> u32 {
    20
}

fn default_fee_bump_percent() -> u32 {
    10
}

fn default_gas_price_wei() -> u64 {
    20_000_000_000
}

fn default_estimation_retries() -> u32 {
    1
}

fn default_retry_backoff_base_ms() -> u64 {
    1_000
}

impl Default for TransactionManagerConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            confirmation_timeout_ms: default_confirmation_timeout_ms(),
            confirmation_poll_ms: default_confirmation_poll_ms(),
            confirmations: default_confirmations(),
            gas_buffer_percent: default_gas_buffer_percent(),
            fee_bump_percent: default_fee_bump_percent(),
            default_gas_price_wei: default_gas_price_wei(),
            estimation_retries: default_estimation_retries(),
            retry_backoff_base_ms: default_retry_backoff_base_ms(),
            chain_id: None,
            gas_limits: GasLimitTable::default(),
        }
    }
}

impl TransactionManagerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retries == 0 {
            return Err(ConfigError::ValidationError("retries must be > 0".to_string()));
        }
        if self.confirmation_poll_ms == 0 {
            return Err(ConfigError::ValidationError(
                "confirmation_poll_ms must be > 0".to_string(),
            ));
        }
        if self.confirmations == 0 {
            return Err(ConfigError::ValidationError("confirmations must be > 0".to_string()));
        }
        if self.estimation_retries == 0 {
            return Err(ConfigError::ValidationError(
                "estimation_retries must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    /// Pause after failed attempt `attempt` (1-based)
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.retry_backoff_base_ms.saturating_mul(factor))
    }
}

/// Per-call overrides; `None` means "use the manager default or the network"
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionConfig {
    pub retries: Option<u32>,
    pub gas_limit: Option<u64>,
    pub gas_price: Option<u128>,
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
    pub value: U256,
    pub confirmation_timeout_ms: Option<u64>,
    pub confirmations: Option<u64>,
}

/// Outcome of `execute_transaction`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionResult {
    pub success: bool,
    pub transaction_hash: Option<B256>,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
    pub effective_gas_price: Option<u128>,
    pub error: Option<String>,
    /// Number of attempts made (1-based)
    pub retry_count: u32,
    pub correlation_id: CorrelationId,
}

impl TransactionResult {
    fn confirmed(receipt: &TransactionReceipt, attempt: u32, correlation_id: CorrelationId) -> Self {
        Self {
            success: true,
            transaction_hash: Some(receipt.transaction_hash),
            block_number: receipt.block_number,
            gas_used: Some(receipt.gas_used),
            effective_gas_price: Some(receipt.effective_gas_price),
            error: None,
            retry_count: attempt,
            correlation_id,
        }
    }

    fn failed(
        error: &TransactionError,
        transaction_hash: Option<B256>,
        attempt: u32,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            success: false,
            transaction_hash,
            block_number: None,
            gas_used: None,
            effective_gas_price: None,
            error: Some(error.to_string()),
            retry_count: attempt,
            correlation_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Failed,
    NotFound,
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Confirmed => "confirmed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::NotFound => "not_found",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GasEstimate {
    pub gas_limit: u64,
    pub source: GasSource,
}

/// Transactions broadcast for one nonce that timed out waiting for
/// confirmation. Any of them may still be mined, oldest first.
#[derive(Debug, Clone)]
struct PendingSubmission {
    nonce: u64,
    fees: FeeParams,
    hashes: Vec<B256>,
}

impl PendingSubmission {
    fn latest(&self) -> Option<B256> {
        self.hashes.last().copied()
    }
}

pub struct TransactionManager {
    rpc: Arc<RpcManager>,
    config: TransactionManagerConfig,
    nonces: NonceTracker,
    chain_id: OnceCell<u64>,
    telemetry: Option<Arc<RpcTelemetry>>,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TransactionManager {
    pub fn new(rpc: Arc<RpcManager>, config: TransactionManagerConfig) -> Result<Self, TransactionError> {
        config
            .validate()
            .map_err(|e| TransactionError::Configuration(e.to_string()))?;
        let chain_id = match config.chain_id {
            Some(id) => OnceCell::new_with(Some(id)),
            None => OnceCell::new(),
        };
        let telemetry = rpc.telemetry().cloned();
        Ok(Self {
            rpc,
            config,
            nonces: NonceTracker::new(),
            chain_id,
            telemetry,
        })
    }

    pub fn config(&self) -> &TransactionManagerConfig {
        &self.config
    }

    pub fn rpc(&self) -> &Arc<RpcManager> {
        &self.rpc
    }

    pub fn nonces(&self) -> &NonceTracker {
        &self.nonces
    }

    /// Submit `call` to `contract` and wait for its confirmation.
    ///
    /// Never returns an error: failures are reported through
    /// `TransactionResult::success` and `error`.
    pub async fn execute_transaction<C: SolCall>(
        &self,
        signer: &dyn TransactionSigner,
        contract: Address,
        call: &C,
        config: &TransactionConfig,
    ) -> TransactionResult {
        let correlation_id = CorrelationId::new();
        let method = method_name::<C>();
        let span = correlation_id.transaction_span(method, &contract.to_string());
        let input = Bytes::from(call.abi_encode());

        self.run_attempts(signer, contract, method, input, config, correlation_id)
            .instrument(span)
            .await
    }

    async fn run_attempts(
        &self,
        signer: &dyn TransactionSigner,
        contract: Address,
        method: &str,
        input: Bytes,
        config: &TransactionConfig,
        correlation_id: CorrelationId,
    ) -> TransactionResult {
        let retries = config.retries.unwrap_or(self.config.retries).max(1);
        let mut pending: Option<PendingSubmission> = None;
        let mut last_failure: Option<(TransactionError, Option<B256>)> = None;

        for attempt in 1..=retries {
            debug!(attempt, retries, "Transaction attempt");
            let outcome = self
                .attempt(signer, contract, method, &input, config, &mut pending)
                .await;

            let (error, hash) = match outcome {
                Ok(receipt) => {
                    info!(
                        hash = %receipt.transaction_hash,
                        block = ?receipt.block_number,
                        gas_used = receipt.gas_used,
                        attempt,
                        "Transaction confirmed"
                    );
                    self.record_outcome("confirmed");
                    return TransactionResult::confirmed(&receipt, attempt, correlation_id);
                }
                Err(failure) => failure,
            };

            if !error.is_retryable() {
                warn!(
                    attempt,
                    category = error.category(),
                    error = %error,
                    "Transaction failed with non-retryable error"
                );
                self.record_outcome(match error {
                    TransactionError::Reverted { .. } => "reverted",
                    _ => "failed",
                });
                return TransactionResult::failed(&error, hash, attempt, correlation_id);
            }

            warn!(
                attempt,
                retries,
                category = error.category(),
                error = %error,
                "Transaction attempt failed"
            );
            if attempt < retries {
                let delay = self.config.retry_backoff(attempt);
                debug!(delay_ms = delay.as_millis() as u64, "Backing off before next attempt");
                tokio::time::sleep(delay).await;
            }
            last_failure = Some((error, hash));
        }

        self.record_outcome("failed");
        let (error, hash) = last_failure.unwrap_or_else(|| {
            (
                TransactionError::Configuration("no attempt made".to_string()),
                None,
            )
        });
        warn!(retries, error = %error, "Transaction retries exhausted");
        TransactionResult::failed(&error, hash, retries, correlation_id)
    }

    /// One attempt; the error carries the hash when something was broadcast
    async fn attempt(
        &self,
        signer: &dyn TransactionSigner,
        contract: Address,
        method: &str,
        input: &Bytes,
        config: &TransactionConfig,
        pending: &mut Option<PendingSubmission>,
    ) -> Result<TransactionReceipt, (TransactionError, Option<B256>)> {
        let from = signer.address();
        let gas_limit = match config.gas_limit {
            Some(limit) => limit,
            None => {
                self.estimate_for(from, contract, method, input.clone(), config.value)
                    .await
                    .gas_limit
            }
        };

        let fee_data = match self
            .rpc
            .execute_with_retry("eth_feeData", |client| async move { client.fee_data().await })
            .await
        {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(error = %e, "Fee data unavailable, using default gas price");
                None
            }
        };
        let mut fees = FeeParams::resolve(
            fee_data.as_ref(),
            config,
            u128::from(self.config.default_gas_price_wei),
        );

        let chain_id = self.resolve_chain_id().await.map_err(|e| (e, None))?;

        let replacing = pending.clone();
        let nonce = match &replacing {
            Some(previous) => {
                fees = fees.at_least(previous.fees.bump(self.config.fee_bump_percent));
                info!(
                    nonce = previous.nonce,
                    replaces = ?previous.latest(),
                    broadcast = previous.hashes.len(),
                    "Replacing unconfirmed transaction"
                );
                previous.nonce
            }
            None => self
                .nonces
                .reserve(from, || {
                    self.rpc
                        .execute_with_retry("eth_getTransactionCount", move |client| async move {
                            client.pending_nonce(from).await
                        })
                })
                .await
                .map_err(|e| (TransactionError::from(e), None))?,
        };

        let tx = UnsignedTransaction {
            chain_id,
            nonce,
            to: contract,
            value: config.value,
            input: input.clone(),
            gas_limit,
            fees,
        };
        let raw = match signer.sign_transaction(&tx).await {
            Ok(raw) => raw,
            Err(e) => {
                if replacing.is_none() {
                    self.nonces.invalidate(from).await;
                }
                return Err((
                    TransactionError::from(e),
                    replacing.as_ref().and_then(PendingSubmission::latest),
                ));
            }
        };

        let submitted_at = Instant::now();
        let hash = match self.submit(raw).await {
            Ok(hash) => hash,
            Err(e) => {
                if let Some(previous) = &replacing {
                    // A replacement rejected for its nonce means an earlier broadcast was mined.
                    if let Some(receipt) = self.settled_receipt(&previous.hashes).await {
                        return self.conclude(receipt, pending, submitted_at);
                    }
                } else {
                    self.nonces.invalidate(from).await;
                }
                return Err((e, replacing.as_ref().and_then(PendingSubmission::latest)));
            }
        };
        info!(%hash, nonce, gas_limit, max_fee = fees.max_price_per_gas(), "Transaction submitted");

        let mut hashes = replacing.map(|previous| previous.hashes).unwrap_or_default();
        if !hashes.contains(&hash) {
            hashes.push(hash);
        }

        let confirmations = config.confirmations.unwrap_or(self.config.confirmations);
        let timeout = Duration::from_millis(
            config
                .confirmation_timeout_ms
                .unwrap_or(self.config.confirmation_timeout_ms),
        );
        match self.wait_for_any_confirmation(&hashes, confirmations, timeout).await {
            Ok(receipt) => self.conclude(receipt, pending, submitted_at),
            Err(e @ TransactionError::ConfirmationTimeout { .. }) => {
                *pending = Some(PendingSubmission { nonce, fees, hashes });
                Err((e, Some(hash)))
            }
            Err(e) => Err((e, Some(hash))),
        }
    }

    /// Final verdict for the mined transaction of an attempt
    fn conclude(
        &self,
        receipt: TransactionReceipt,
        pending: &mut Option<PendingSubmission>,
        submitted_at: Instant,
    ) -> Result<TransactionReceipt, (TransactionError, Option<B256>)> {
        *pending = None;
        if !receipt.status {
            return Err((
                TransactionError::Reverted {
                    hash: receipt.transaction_hash,
                },
                Some(receipt.transaction_hash),
            ));
        }
        if let Some(telemetry) = &self.telemetry {
            telemetry
                .confirmation_latency
                .observe(submitted_at.elapsed().as_secs_f64());
        }
        Ok(receipt)
    }

    /// Broadcast through the submission circuit breaker.
    ///
    /// A node that already holds these exact bytes has accepted them, so
    /// "already known" yields the hash instead of an error.
    async fn submit(&self, raw: Bytes) -> Result<B256, TransactionError> {
        let local_hash = keccak256(&raw);
        let max_retries = self.rpc.config().max_retries;
        let result = self
            .rpc
            .execute_guarded(
                TRANSACTION_SUBMISSION_FAMILY,
                "eth_sendRawTransaction",
                max_retries,
                None,
                move |client| {
                    let raw = raw.clone();
                    async move {
                        match client.send_raw_transaction(&raw).await {
                            Err(e) if is_already_known(&e) => {
                                debug!(hash = %local_hash, "Node already knows the transaction");
                                Ok(local_hash)
                            }
                            other => other,
                        }
                    }
                },
            )
            .await;
        Ok(result?)
    }

    /// Receipt of whichever of `hashes` made it into a block
    async fn settled_receipt(&self, hashes: &[B256]) -> Option<TransactionReceipt> {
        for hash in hashes {
            match self.fetch_receipt(*hash).await {
                Ok(Some(receipt)) if receipt.block_number.is_some() => return Some(receipt),
                Ok(_) => {}
                Err(e) => debug!(%hash, error = %e, "Receipt lookup failed"),
            }
        }
        None
    }

    async fn resolve_chain_id(&self) -> Result<u64, TransactionError> {
        let id = self
            .chain_id
            .get_or_try_init(|| async { self.rpc.chain_id().await })
            .await?;
        Ok(*id)
    }

    async fn estimate_for(
        &self,
        from: Address,
        contract: Address,
        method: &str,
        input: Bytes,
        value: U256,
    ) -> GasEstimate {
        let request = CallRequest::new(contract, input).from(from).value(value);
        let estimate = self
            .rpc
            .execute_guarded(
                RPC_FAMILY,
                "eth_estimateGas",
                self.config.estimation_retries,
                None,
                move |client| {
                    let request = request.clone();
                    async move { client.estimate_gas(&request).await }
                },
            )
            .await;

        match estimate {
            Ok(gas) => GasEstimate {
                gas_limit: buffered(gas, self.config.gas_buffer_percent),
                source: GasSource::Estimated,
            },
            Err(e) => {
                let gas_limit = self.config.gas_limits.fallback_for(method);
                warn!(method, gas_limit, error = %e, "Gas estimation failed, using static limit");
                if let Some(telemetry) = &self.telemetry {
                    telemetry.gas_estimate_fallbacks.inc();
                }
                GasEstimate {
                    gas_limit,
                    source: GasSource::Fallback,
                }
            }
        }
    }

    /// Gas limit for `call` from `from`: buffered estimate, or the static
    /// per-method limit when estimation fails
    pub async fn estimate_gas<C: SolCall>(
        &self,
        from: Address,
        contract: Address,
        call: &C,
        value: U256,
    ) -> GasEstimate {
        self.estimate_for(from, contract, method_name::<C>(), Bytes::from(call.abi_encode()), value)
            .await
    }

    /// `eth_call` with the typed return value of `C`
    #[instrument(skip(self, call), fields(method = method_name::<C>()))]
    pub async fn execute_contract_read<C: SolCall>(
        &self,
        contract: Address,
        call: &C,
    ) -> Result<C::Return, TransactionError> {
        let request = CallRequest::new(contract, call.abi_encode());
        let data = self
            .rpc
            .execute_with_retry("eth_call", move |client| {
                let request = request.clone();
                async move { client.call(&request).await }
            })
            .await?;

        C::abi_decode_returns(&data, true).map_err(|e| TransactionError::Decode {
            method: method_name::<C>().to_string(),
            reason: e.to_string(),
        })
    }

    /// Poll until `hash` has `confirmations` blocks on top of (and including)
    /// its own, or `timeout` elapses.
    ///
    /// Returns the receipt whatever its execution status; reverted
    /// transactions are confirmed too.
    #[instrument(skip(self))]
    pub async fn wait_for_transaction_confirmation(
        &self,
        hash: B256,
        confirmations: u64,
        timeout: Duration,
    ) -> Result<TransactionReceipt, TransactionError> {
        self.wait_for_any_confirmation(&[hash], confirmations, timeout)
            .await
    }

    /// As `wait_for_transaction_confirmation`, for a set of transactions
    /// sharing one nonce: the first of them to be confirmed wins.
    async fn wait_for_any_confirmation(
        &self,
        hashes: &[B256],
        confirmations: u64,
        timeout: Duration,
    ) -> Result<TransactionReceipt, TransactionError> {
        let poll = Duration::from_millis(self.config.confirmation_poll_ms);
        let confirmations = confirmations.max(1);

        let wait = async {
            loop {
                if let Some(receipt) = self.settled_receipt(hashes).await {
                    if confirmations == 1 {
                        return receipt;
                    }
                    let mined_at = receipt.block_number.unwrap_or(u64::MAX);
                    match self.rpc.block_number().await {
                        Ok(head) if head.saturating_sub(mined_at) + 1 >= confirmations => return receipt,
                        Ok(_) => {}
                        Err(e) => debug!(error = %e, "Head block unavailable while confirming"),
                    }
                }
                tokio::time::sleep(poll).await;
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| TransactionError::ConfirmationTimeout {
                hash: hashes.last().copied().unwrap_or_default(),
                timeout_ms: timeout.as_millis() as u64,
            })
    }

    pub async fn get_transaction_status(&self, hash: B256) -> Result<TransactionStatus, TransactionError> {
        match self.fetch_receipt(hash).await? {
            Some(receipt) if receipt.block_number.is_none() => Ok(TransactionStatus::Pending),
            Some(receipt) if receipt.status => Ok(TransactionStatus::Confirmed),
            Some(_) => Ok(TransactionStatus::Failed),
            None => {
                let known = self
                    .rpc
                    .execute_with_retry("eth_getTransactionByHash", move |client| async move {
                        client.transaction_exists(hash).await
                    })
                    .await?;
                Ok(if known {
                    TransactionStatus::Pending
                } else {
                    TransactionStatus::NotFound
                })
            }
        }
    }

    async fn fetch_receipt(&self, hash: B256) -> Result<Option<TransactionReceipt>, TransactionError> {
        let receipt = self
            .rpc
            .execute_with_retry("eth_getTransactionReceipt", move |client| async move {
                client.transaction_receipt(hash).await
            })
            .await?;
        Ok(receipt)
    }

    fn record_outcome(&self, outcome: &str) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_transaction(outcome);
        }
    }
}

fn is_already_known(error: &RpcManagerError) -> bool {
    error.to_string().to_lowercase().contains("already known")
}
