//! RPC manager façade
//!
//! Every outbound call goes through `execute_with_retry`: pick an endpoint
//! (pooled connection first, ordered registry as fallback), wait for that
//! endpoint's dispatch slot, run the operation under a timeout, classify any
//! failure and either rotate, back off or give up.

use alloy_primitives::{Address, U256};
use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakers, RPC_FAMILY};
use super::endpoint::{Endpoint, EndpointRegistry, HealthEvent};
use super::network_monitor::NetworkMonitor;
use super::rpc_atomics::OperationMetrics;
use super::rpc_config::{NetworkMonitorConfig, PoolConfig, RpcManagerConfig};
use super::rpc_errors::{BackoffPolicy, FailureKind, RpcManagerError};
use super::rpc_metrics::{ComprehensiveStatus, EndpointStatus, HealthLevel, MetricsSnapshot, PoolStatus};
use super::rpc_pool::ConnectionPool;
use super::transport::{ChainClient, ClientFactory, HttpClientFactory};
use crate::metrics::RpcTelemetry;

/// Type-erased operation run against a provider connection
pub type RpcOperation<T> =
    Arc<dyn Fn(Arc<dyn ChainClient>) -> BoxFuture<'static, Result<T, RpcManagerError>> + Send + Sync>;

/// One step of `execute_sequentially`
pub struct SequentialOperation<T> {
    label: String,
    operation: RpcOperation<T>,
    continuable: bool,
}

impl<T> SequentialOperation<T> {
    pub fn new<F, Fut>(label: impl Into<String>, operation: F) -> Self
    where
        F: Fn(Arc<dyn ChainClient>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, RpcManagerError>> + Send + 'static,
    {
        Self {
            label: label.into(),
            operation: Arc::new(move |client| Box::pin(operation(client))),
            continuable: true,
        }
    }

    /// A failure of this operation aborts the whole sequence
    pub fn non_continuable(mut self) -> Self {
        self.continuable = false;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Delay before the operation at `index` (0-based) of a sequence
pub(crate) fn sequential_delay(base: Duration, index: usize) -> Duration {
    if index == 0 {
        return Duration::ZERO;
    }
    let step = base * (index as u32 - 1) / 2;
    (base + step).min(base * 4)
}

#[derive(Debug)]
struct BackgroundTasks {
    cancel: CancellationToken,
    recovery: JoinHandle<()>,
}

pub struct RpcManager {
    config: RpcManagerConfig,
    registry: EndpointRegistry,
    pool: ConnectionPool,
    monitor: Arc<NetworkMonitor>,
    factory: Arc<dyn ClientFactory>,
    /// Connections created outside the pool, keyed by endpoint name
    direct_clients: DashMap<String, Arc<dyn ChainClient>>,
    breakers: CircuitBreakers,
    backoff: BackoffPolicy,
    metrics: OperationMetrics,
    telemetry: Option<Arc<RpcTelemetry>>,
    tasks: Mutex<Option<BackgroundTasks>>,
}

impl std::fmt::Debug for RpcManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcManager")
            .field("endpoints", &self.registry.len())
            .field("healthy", &self.registry.healthy_count())
            .finish_non_exhaustive()
    }
}

impl RpcManager {
    /// Manager with default pool and monitor settings
    pub fn new(config: RpcManagerConfig, factory: Arc<dyn ClientFactory>) -> Result<Self, RpcManagerError> {
        Self::with_options(config, PoolConfig::default(), NetworkMonitorConfig::default(), factory)
    }

    /// # Errors
    ///
    /// Fails only on misconfiguration: no endpoints, invalid URLs, zero budgets.
    pub fn with_options(
        config: RpcManagerConfig,
        pool_config: PoolConfig,
        monitor_config: NetworkMonitorConfig,
        factory: Arc<dyn ClientFactory>,
    ) -> Result<Self, RpcManagerError> {
        config
            .validate()
            .map_err(|e| RpcManagerError::Configuration(e.to_string()))?;
        monitor_config
            .validate()
            .map_err(|e| RpcManagerError::Configuration(e.to_string()))?;

        let registry = EndpointRegistry::new(&config)?;
        let pool = ConnectionPool::new(&config.endpoints, Arc::clone(&factory), pool_config);
        let monitor = Arc::new(NetworkMonitor::new(&config.endpoints, Arc::clone(&factory), monitor_config));
        let breakers = CircuitBreakers::new(
            config.circuit_breaker_failure_threshold,
            Duration::from_millis(config.circuit_breaker_cooldown_ms),
        );
        let backoff = BackoffPolicy::new(config.backoff.clone());

        info!(
            endpoints = registry.len(),
            max_retries = config.max_retries,
            "RPC manager created"
        );

        Ok(Self {
            config,
            registry,
            pool,
            monitor,
            factory,
            direct_clients: DashMap::new(),
            breakers,
            backoff,
            metrics: OperationMetrics::new(),
            telemetry: None,
            tasks: Mutex::new(None),
        })
    }

    /// Manager speaking JSON-RPC over HTTP
    pub fn from_http(
        config: RpcManagerConfig,
        pool_config: PoolConfig,
        monitor_config: NetworkMonitorConfig,
    ) -> Result<Self, RpcManagerError> {
        let factory = HttpClientFactory::new(config.operation_timeout())?;
        Self::with_options(config, pool_config, monitor_config, Arc::new(factory))
    }

    pub fn with_telemetry(mut self, telemetry: Arc<RpcTelemetry>) -> Self {
        telemetry.set_healthy_endpoints(self.registry.healthy_count());
        self.telemetry = Some(telemetry);
        self
    }

    pub fn config(&self) -> &RpcManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn monitor(&self) -> &Arc<NetworkMonitor> {
        &self.monitor
    }

    pub fn telemetry(&self) -> Option<&Arc<RpcTelemetry>> {
        self.telemetry.as_ref()
    }

    pub fn circuit_breaker(&self, family: &str) -> Arc<CircuitBreaker> {
        self.breakers.get(family)
    }

    pub fn subscribe_health_events(&self) -> broadcast::Receiver<HealthEvent> {
        self.registry.subscribe()
    }

    /// Initialise the pool, start the network monitor and the hourly recovery task.
    ///
    /// Calling `start` on a running manager is a no-op.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) {
        if self.tasks.lock().is_some() {
            debug!("RPC manager already started");
            return;
        }

        if !self.pool.is_initialized() {
            for name in self.pool.initialize().await {
                self.registry.mark_unhealthy(&name);
            }
        }
        self.monitor.start();

        let cancel = CancellationToken::new();
        let recovery = self.spawn_recovery_task(cancel.clone());

        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            // Lost a race with a concurrent start.
            cancel.cancel();
            recovery.abort();
            return;
        }
        *tasks = Some(BackgroundTasks { cancel, recovery });
        info!("RPC manager started");
    }

    fn spawn_recovery_task(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.error_decay_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = manager.run_recovery_pass() => {}
                }
            }
        })
    }

    /// One error-decay step plus reconnection of unusable pooled connections
    pub async fn run_recovery_pass(&self) {
        let restored = self.registry.decay_errors();
        let reconnected = self.pool.reconnect_unhealthy().await;
        if let Some(telemetry) = &self.telemetry {
            telemetry.set_healthy_endpoints(self.registry.healthy_count());
        }
        info!(
            restored = restored.len(),
            reconnected = reconnected.len(),
            healthy = self.registry.healthy_count(),
            "Endpoint recovery pass"
        );
    }

    /// Stop background work. Idempotent.
    pub fn stop(&self) {
        if let Some(tasks) = self.tasks.lock().take() {
            tasks.cancel.cancel();
            tasks.recovery.abort();
            info!("RPC manager stopped");
        }
        self.monitor.stop();
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some()
    }

    /// Run `operation` with endpoint rotation, backoff and the `"rpc"` circuit breaker
    pub async fn execute_with_retry<T, F, Fut>(&self, description: &str, operation: F) -> Result<T, RpcManagerError>
    where
        F: Fn(Arc<dyn ChainClient>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, RpcManagerError>> + Send,
        T: Send,
    {
        self.execute_guarded(RPC_FAMILY, description, self.config.max_retries, None, operation)
            .await
    }

    /// As `execute_with_retry`; cancelling `cancel` abandons the local wait
    pub async fn execute_with_retry_cancellable<T, F, Fut>(
        &self,
        description: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, RpcManagerError>
    where
        F: Fn(Arc<dyn ChainClient>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, RpcManagerError>> + Send,
        T: Send,
    {
        self.execute_guarded(RPC_FAMILY, description, self.config.max_retries, Some(cancel), operation)
            .await
    }

    /// The general retry loop, guarded by the breaker of `family`.
    ///
    /// Only exhaustion of transient failures counts against the breaker;
    /// errors caused by the request itself are returned at once, without
    /// penalising the endpoint.
    #[instrument(skip(self, cancel, operation))]
    pub async fn execute_guarded<T, F, Fut>(
        &self,
        family: &str,
        description: &str,
        max_retries: u32,
        cancel: Option<&CancellationToken>,
        operation: F,
    ) -> Result<T, RpcManagerError>
    where
        F: Fn(Arc<dyn ChainClient>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, RpcManagerError>> + Send,
        T: Send,
    {
        let breaker = self.breakers.get(family);
        if !breaker.can_execute() {
            warn!(family, description, "Circuit open, failing fast");
            return Err(RpcManagerError::CircuitOpen {
                family: family.to_string(),
                failure_count: breaker.failure_count(),
            });
        }

        let cancelled = || RpcManagerError::Cancelled(description.to_string());
        let max_retries = max_retries.max(1);

        if self.config.max_jitter_ms > 0 {
            let jitter = Duration::from_millis(fastrand::u64(0..=self.config.max_jitter_ms));
            wait_or_cancel(cancel, tokio::time::sleep(jitter))
                .await
                .ok_or_else(cancelled)?;
        }

        let mut start_index = 0usize;
        let mut last_error = None;
        let mut unreachable: HashSet<String> = HashSet::new();

        for attempt in 1..=max_retries {
            let (index, endpoint) = self.registry.select(start_index, |e| self.is_preferred(e));

            let client = match self.client_for(&endpoint) {
                Ok(client) => client,
                Err(e) => {
                    warn!(endpoint = %endpoint.name(), attempt, error = %e, "Could not open connection");
                    self.registry.record_failure(&endpoint, false);
                    unreachable.insert(endpoint.name().to_string());
                    if unreachable.len() >= self.registry.len() {
                        error!(total = self.registry.len(), description, "No endpoint accepts connections");
                        return Err(RpcManagerError::NoHealthyEndpoints {
                            total: self.registry.len(),
                            unhealthy: self.registry.len().saturating_sub(self.registry.healthy_count()),
                        });
                    }
                    start_index = index + 1;
                    last_error = Some(e);
                    continue;
                }
            };

            wait_or_cancel(cancel, endpoint.admit(self.config.safety_buffer()))
                .await
                .ok_or_else(cancelled)?;

            self.metrics.record_request(endpoint.name());
            let started = Instant::now();
            let timeout = self.config.operation_timeout();
            let outcome = wait_or_cancel(cancel, tokio::time::timeout(timeout, operation(client)))
                .await
                .ok_or_else(cancelled)?;

            let error = match outcome {
                Ok(Ok(value)) => {
                    let elapsed = started.elapsed();
                    self.registry.record_success(&endpoint);
                    self.metrics.record_success(elapsed);
                    if let Some(telemetry) = &self.telemetry {
                        telemetry.record_success(endpoint.name(), elapsed);
                        telemetry.set_healthy_endpoints(self.registry.healthy_count());
                    }
                    breaker.on_success();
                    debug!(
                        endpoint = %endpoint.name(),
                        attempt,
                        latency_ms = elapsed.as_millis() as u64,
                        "RPC operation succeeded"
                    );
                    return Ok(value);
                }
                Ok(Err(e)) => e,
                Err(_) => RpcManagerError::Timeout {
                    endpoint: endpoint.name().to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                },
            };

            let kind = error.failure_kind();
            self.metrics.record_failure();
            if let Some(telemetry) = &self.telemetry {
                telemetry.record_failure(endpoint.name(), kind);
            }

            if kind == FailureKind::NonRetryable {
                warn!(
                    endpoint = %endpoint.name(),
                    attempt,
                    kind = %kind,
                    error = %error,
                    "Non-retryable failure, not retrying"
                );
                return Err(error);
            }

            if kind == FailureKind::RateLimit {
                self.metrics.record_rate_limit_hit();
            }
            let became_unhealthy = self.registry.record_failure(&endpoint, kind == FailureKind::RateLimit);
            if became_unhealthy {
                if let Some(telemetry) = &self.telemetry {
                    telemetry.set_healthy_endpoints(self.registry.healthy_count());
                }
            }

            warn!(
                endpoint = %endpoint.name(),
                attempt,
                max_retries,
                kind = %kind,
                error = %error,
                "RPC attempt failed"
            );

            start_index = if kind.forces_rotation() || became_unhealthy {
                index + 1
            } else {
                index
            };

            if attempt < max_retries {
                let delay = self.backoff.delay_for(kind, attempt);
                debug!(delay_ms = delay.as_millis() as u64, attempt, "Backing off");
                wait_or_cancel(cancel, tokio::time::sleep(delay))
                    .await
                    .ok_or_else(cancelled)?;
            }

            last_error = Some(error);
        }

        breaker.on_failure();
        let last_error = last_error.unwrap_or_else(|| {
            RpcManagerError::Internal(format!("{} made no attempt", description))
        });
        Err(RpcManagerError::RetriesExhausted {
            description: description.to_string(),
            attempts: max_retries,
            last_error: Box::new(last_error),
        })
    }

    /// Run operations one at a time with a growing pause between them.
    ///
    /// A failed operation is logged and skipped; the successes are returned
    /// in their original order. A failure of a `non_continuable` operation
    /// aborts the sequence.
    #[instrument(skip(self, operations), fields(count = operations.len()))]
    pub async fn execute_sequentially<T: Send + 'static>(
        &self,
        operations: Vec<SequentialOperation<T>>,
        name: &str,
        base_delay: Duration,
    ) -> Result<Vec<T>, RpcManagerError> {
        let total = operations.len();
        let mut results = Vec::with_capacity(total);
        let mut failures = 0usize;

        for (index, op) in operations.into_iter().enumerate() {
            let delay = sequential_delay(base_delay, index);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let description = format!("{}[{}] {}", name, index, op.label);
            let operation = Arc::clone(&op.operation);
            match self.execute_with_retry(&description, move |client| operation(client)).await {
                Ok(value) => results.push(value),
                Err(e) if op.continuable => {
                    failures += 1;
                    warn!(sequence = name, index, label = %op.label, error = %e, "Sequential operation failed, continuing");
                }
                Err(e) => {
                    warn!(sequence = name, index, label = %op.label, error = %e, "Sequential operation failed, aborting");
                    return Err(RpcManagerError::SequenceAborted {
                        name: name.to_string(),
                        index,
                        source: Box::new(e),
                    });
                }
            }
        }

        info!(sequence = name, total, succeeded = results.len(), failures, "Sequence finished");
        Ok(results)
    }

    pub async fn block_number(&self) -> Result<u64, RpcManagerError> {
        self.execute_with_retry("eth_blockNumber", |client| async move { client.block_number().await })
            .await
    }

    pub async fn chain_id(&self) -> Result<u64, RpcManagerError> {
        self.execute_with_retry("eth_chainId", |client| async move { client.chain_id().await })
            .await
    }

    pub async fn balance(&self, address: Address) -> Result<U256, RpcManagerError> {
        self.execute_with_retry("eth_getBalance", move |client| async move { client.balance(address).await })
            .await
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn get_endpoint_status(&self) -> Vec<EndpointStatus> {
        self.registry.status()
    }

    pub fn get_pool_status(&self) -> PoolStatus {
        self.pool.pool_status()
    }

    pub fn get_comprehensive_status(&self) -> ComprehensiveStatus {
        let endpoints = self.registry.status();
        let healthy = endpoints.iter().filter(|e| e.healthy).count();
        ComprehensiveStatus {
            timestamp: Utc::now(),
            status: HealthLevel::from_counts(healthy, endpoints.len()),
            metrics: self.metrics.snapshot(),
            endpoints,
            network: self.monitor.snapshot(),
            pool: self.pool.pool_status(),
            circuit_breakers: self.breakers.snapshot(),
        }
    }

    /// Endpoints with a pooled connection and a healthy monitor verdict come first
    fn is_preferred(&self, endpoint: &Endpoint) -> bool {
        if !self.monitor.is_provider_healthy(endpoint.name()) {
            return false;
        }
        !self.pool.is_initialized() || self.pool.connection_for(endpoint.name()).is_some()
    }

    fn client_for(&self, endpoint: &Endpoint) -> Result<Arc<dyn ChainClient>, RpcManagerError> {
        if let Some(client) = self.pool.connection_for(endpoint.name()) {
            return Ok(client);
        }
        if let Some(client) = self.direct_clients.get(endpoint.name()) {
            return Ok(Arc::clone(client.value()));
        }
        let client = self.factory.connect(endpoint.config())?;
        debug!(endpoint = %endpoint.name(), "Using direct connection outside the pool");
        self.direct_clients
            .insert(endpoint.name().to_string(), Arc::clone(&client));
        Ok(client)
    }
}

impl Drop for RpcManager {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.get_mut().take() {
            tasks.cancel.cancel();
            tasks.recovery.abort();
        }
    }
}

/// `None` when the token fired first
async fn wait_or_cancel<F: Future>(cancel: Option<&CancellationToken>, fut: F) -> Option<F::Output> {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => None,
            out = fut => Some(out),
        },
        None => Some(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_delay_progression() {
        let base = Duration::from_millis(1000);
        assert_eq!(sequential_delay(base, 0), Duration::ZERO);
        assert_eq!(sequential_delay(base, 1), Duration::from_millis(1000));
        assert_eq!(sequential_delay(base, 2), Duration::from_millis(1500));
        assert_eq!(sequential_delay(base, 3), Duration::from_millis(2000));
        assert_eq!(sequential_delay(base, 7), Duration::from_millis(4000));
        assert_eq!(sequential_delay(base, 100), Duration::from_millis(4000));
    }

    #[tokio::test]
    async fn test_wait_or_cancel() {
        let token = CancellationToken::new();
        assert_eq!(wait_or_cancel(Some(&token), async { 7 }).await, Some(7));
        token.cancel();
        assert_eq!(wait_or_cancel(Some(&token), async { 7 }).await, None);
        assert_eq!(wait_or_cancel(None, async { 7 }).await, Some(7));
    }
}
