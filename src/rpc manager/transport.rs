//! Provider connections.
//!
//! `ChainClient` is the live connection object the pool hands out and the
//! manager passes to operations. `HttpChainClient` speaks Ethereum JSON-RPC
//! over a shared reqwest client; tests substitute scripted clients.

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use reqwest::{Client, ClientBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::rpc_config::EndpointConfig;
use super::rpc_errors::RpcManagerError;

pub type RpcResult<T> = Result<T, RpcManagerError>;

/// Priority fee assumed when the node does not implement `eth_maxPriorityFeePerGas`
const FALLBACK_PRIORITY_FEE_WEI: u128 = 1_500_000_000;

/// Read-only call / estimation request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallRequest {
    pub from: Option<Address>,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
}

impl CallRequest {
    pub fn new(to: Address, data: impl Into<Bytes>) -> Self {
        Self {
            from: None,
            to,
            data: data.into(),
            value: U256::ZERO,
        }
    }

    pub fn from(mut self, from: Address) -> Self {
        self.from = Some(from);
        self
    }

    pub fn value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }

    fn to_json(&self) -> Value {
        let mut obj = json!({
            "to": self.to,
            "data": self.data,
        });
        if let Some(from) = self.from {
            obj["from"] = json!(from);
        }
        if !self.value.is_zero() {
            obj["value"] = json!(format!("{:#x}", self.value));
        }
        obj
    }
}

/// Network fee data as reported by an endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeeData {
    pub gas_price: Option<u128>,
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
}

impl FeeData {
    pub fn supports_eip1559(&self) -> bool {
        self.max_fee_per_gas.is_some() && self.max_priority_fee_per_gas.is_some()
    }
}

/// Mined transaction receipt, reduced to what callers consume
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionReceipt {
    pub transaction_hash: B256,
    pub block_number: Option<u64>,
    pub gas_used: u64,
    pub effective_gas_price: u128,
    /// Execution status (`0x1`)
    pub status: bool,
}

/// A live connection to one endpoint
#[async_trait]
pub trait ChainClient: Send + Sync + std::fmt::Debug {
    /// Name of the endpoint this connection is bound to
    fn endpoint(&self) -> &str;

    async fn block_number(&self) -> RpcResult<u64>;

    async fn chain_id(&self) -> RpcResult<u64>;

    async fn balance(&self, address: Address) -> RpcResult<U256>;

    async fn call(&self, request: &CallRequest) -> RpcResult<Bytes>;

    async fn estimate_gas(&self, request: &CallRequest) -> RpcResult<u64>;

    async fn fee_data(&self) -> RpcResult<FeeData>;

    /// Next nonce including pending transactions
    async fn pending_nonce(&self, address: Address) -> RpcResult<u64>;

    async fn send_raw_transaction(&self, raw: &Bytes) -> RpcResult<B256>;

    async fn transaction_receipt(&self, hash: B256) -> RpcResult<Option<TransactionReceipt>>;

    /// Whether the node knows the transaction (mined or in its mempool)
    async fn transaction_exists(&self, hash: B256) -> RpcResult<bool>;
}

/// Creates connections for endpoints
pub trait ClientFactory: Send + Sync + std::fmt::Debug {
    fn connect(&self, endpoint: &EndpointConfig) -> RpcResult<Arc<dyn ChainClient>>;
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: B256,
    block_number: Option<String>,
    gas_used: String,
    effective_gas_price: Option<String>,
    status: Option<String>,
}

pub(crate) fn parse_quantity(endpoint: &str, raw: &str) -> RpcResult<u128> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16).map_err(|e| RpcManagerError::Decode {
        endpoint: endpoint.to_string(),
        message: format!("invalid quantity '{}': {}", raw, e),
    })
}

fn quantity_u64(endpoint: &str, raw: &str) -> RpcResult<u64> {
    let value = parse_quantity(endpoint, raw)?;
    u64::try_from(value).map_err(|_| RpcManagerError::Decode {
        endpoint: endpoint.to_string(),
        message: format!("quantity '{}' does not fit in u64", raw),
    })
}

/// JSON-RPC over HTTP
#[derive(Debug)]
pub struct HttpChainClient {
    name: String,
    url: String,
    http: Client,
    next_id: AtomicU64,
}

impl HttpChainClient {
    pub fn new(endpoint: &EndpointConfig, http: Client) -> Self {
        Self {
            name: endpoint.name.clone(),
            url: endpoint.url.clone(),
            http,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn transport_error(&self, error: &reqwest::Error) -> RpcManagerError {
        let message = if error.is_timeout() {
            "request timed out".to_string()
        } else if error.is_connect() {
            "network error: connection refused or unreachable".to_string()
        } else if error.is_decode() {
            return RpcManagerError::Decode {
                endpoint: self.name.clone(),
                message: error.to_string(),
            };
        } else {
            format!("network error: {}", error)
        };
        RpcManagerError::Transport {
            endpoint: self.name.clone(),
            message,
        }
    }

    async fn request_value(&self, method: &str, params: Value) -> RpcResult<Option<Value>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };

        trace!(endpoint = %self.name, method, id, "json-rpc request");

        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(RpcManagerError::RateLimited {
                endpoint: self.name.clone(),
                message: "HTTP 429 Too Many Requests".to_string(),
            });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RpcManagerError::from_message(
                &self.name,
                format!("HTTP {}: {}", status.as_u16(), text),
                None,
            ));
        }

        let envelope: JsonRpcResponse = response.json().await.map_err(|e| self.transport_error(&e))?;

        if let Some(error) = envelope.error {
            return Err(RpcManagerError::from_message(&self.name, error.message, Some(error.code)));
        }

        Ok(envelope.result.filter(|v| !v.is_null()))
    }

    async fn request<R: DeserializeOwned>(&self, method: &str, params: Value) -> RpcResult<R> {
        let value = self.request_value(method, params).await?.ok_or_else(|| RpcManagerError::Decode {
            endpoint: self.name.clone(),
            message: format!("{} returned null", method),
        })?;
        self.decode(method, value)
    }

    fn decode<R: DeserializeOwned>(&self, method: &str, value: Value) -> RpcResult<R> {
        serde_json::from_value(value).map_err(|e| RpcManagerError::Decode {
            endpoint: self.name.clone(),
            message: format!("{}: {}", method, e),
        })
    }

    async fn quantity(&self, method: &str, params: Value) -> RpcResult<u128> {
        let raw: String = self.request(method, params).await?;
        parse_quantity(&self.name, &raw)
    }
}

#[async_trait]
impl ChainClient for HttpChainClient {
    fn endpoint(&self) -> &str {
        &self.name
    }

    async fn block_number(&self) -> RpcResult<u64> {
        let raw: String = self.request("eth_blockNumber", json!([])).await?;
        quantity_u64(&self.name, &raw)
    }

    async fn chain_id(&self) -> RpcResult<u64> {
        let raw: String = self.request("eth_chainId", json!([])).await?;
        quantity_u64(&self.name, &raw)
    }

    async fn balance(&self, address: Address) -> RpcResult<U256> {
        let raw: String = self.request("eth_getBalance", json!([address, "latest"])).await?;
        raw.parse::<U256>().map_err(|e| RpcManagerError::Decode {
            endpoint: self.name.clone(),
            message: format!("invalid balance '{}': {}", raw, e),
        })
    }

    async fn call(&self, request: &CallRequest) -> RpcResult<Bytes> {
        self.request("eth_call", json!([request.to_json(), "latest"])).await
    }

    async fn estimate_gas(&self, request: &CallRequest) -> RpcResult<u64> {
        let raw: String = self.request("eth_estimateGas", json!([request.to_json()])).await?;
        quantity_u64(&self.name, &raw)
    }

    async fn fee_data(&self) -> RpcResult<FeeData> {
        let gas_price = self.quantity("eth_gasPrice", json!([])).await?;
        let latest = self
            .request_value("eth_getBlockByNumber", json!(["latest", false]))
            .await?;

        let base_fee = match latest.as_ref().and_then(|block| block.get("baseFeePerGas")) {
            Some(Value::String(raw)) => Some(parse_quantity(&self.name, raw)?),
            _ => None,
        };

        let Some(base_fee) = base_fee else {
            return Ok(FeeData {
                gas_price: Some(gas_price),
                max_fee_per_gas: None,
                max_priority_fee_per_gas: None,
            });
        };

        // Not every node implements the method; a missing method is not fatal here.
        let priority = match self.quantity("eth_maxPriorityFeePerGas", json!([])).await {
            Ok(fee) => fee,
            Err(e @ RpcManagerError::RateLimited { .. }) | Err(e @ RpcManagerError::Transport { .. }) => {
                return Err(e)
            }
            Err(_) => FALLBACK_PRIORITY_FEE_WEI,
        };

        Ok(FeeData {
            gas_price: Some(gas_price),
            max_fee_per_gas: Some(base_fee.saturating_mul(2).saturating_add(priority)),
            max_priority_fee_per_gas: Some(priority),
        })
    }

    async fn pending_nonce(&self, address: Address) -> RpcResult<u64> {
        let raw: String = self
            .request("eth_getTransactionCount", json!([address, "pending"]))
            .await?;
        quantity_u64(&self.name, &raw)
    }

    async fn send_raw_transaction(&self, raw: &Bytes) -> RpcResult<B256> {
        self.request("eth_sendRawTransaction", json!([raw])).await
    }

    async fn transaction_receipt(&self, hash: B256) -> RpcResult<Option<TransactionReceipt>> {
        let Some(value) = self.request_value("eth_getTransactionReceipt", json!([hash])).await? else {
            return Ok(None);
        };
        let raw: RawReceipt = self.decode("eth_getTransactionReceipt", value)?;

        let block_number = raw
            .block_number
            .as_deref()
            .map(|b| quantity_u64(&self.name, b))
            .transpose()?;
        let effective_gas_price = raw
            .effective_gas_price
            .as_deref()
            .map(|p| parse_quantity(&self.name, p))
            .transpose()?
            .unwrap_or_default();

        Ok(Some(TransactionReceipt {
            transaction_hash: raw.transaction_hash,
            block_number,
            gas_used: quantity_u64(&self.name, &raw.gas_used)?,
            effective_gas_price,
            status: raw.status.as_deref() == Some("0x1"),
        }))
    }

    async fn transaction_exists(&self, hash: B256) -> RpcResult<bool> {
        Ok(self
            .request_value("eth_getTransactionByHash", json!([hash]))
            .await?
            .is_some())
    }
}

/// Builds `HttpChainClient`s sharing one reqwest connection pool
#[derive(Debug, Clone)]
pub struct HttpClientFactory {
    http: Client,
}

impl HttpClientFactory {
    /// # Errors
    ///
    /// Returns a configuration error if the underlying reqwest client fails to build.
    pub fn new(request_timeout: Duration) -> RpcResult<Self> {
        let http = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .timeout(request_timeout)
            .use_rustls_tls()
            .user_agent(concat!("agent-rpc/", env!("CARGO_PKG_VERSION")))
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|e| RpcManagerError::Configuration(format!("HTTP client build failed: {}", e)))?;
        Ok(Self { http })
    }
}

impl ClientFactory for HttpClientFactory {
    fn connect(&self, endpoint: &EndpointConfig) -> RpcResult<Arc<dyn ChainClient>> {
        Ok(Arc::new(HttpChainClient::new(endpoint, self.http.clone())))
    }
}
