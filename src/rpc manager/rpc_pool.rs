//! Connection pool
//!
//! Holds live `ChainClient` connections per endpoint. Connections are opened
//! one endpoint at a time with a growing stagger so a cold start never hits
//! every free-tier provider at once. A failed connection is recorded as an
//! unhealthy slot instead of an error; callers must tolerate an empty pool.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::rpc_config::{EndpointConfig, PoolConfig};
use super::rpc_errors::RpcManagerError;
use super::rpc_metrics::{PoolOccupancy, PoolStatus};
use super::transport::{ChainClient, ClientFactory};

/// One pooled connection bound to one endpoint
#[derive(Debug)]
pub struct ConnectionSlot {
    endpoint: String,
    client: RwLock<Option<Arc<dyn ChainClient>>>,
    healthy: AtomicBool,
}

impl ConnectionSlot {
    fn empty(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            client: RwLock::new(None),
            healthy: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire) && self.client.read().is_some()
    }

    /// The live client, if this slot is usable
    pub fn client(&self) -> Option<Arc<dyn ChainClient>> {
        if !self.healthy.load(Ordering::Acquire) {
            return None;
        }
        self.client.read().clone()
    }

    fn install(&self, client: Arc<dyn ChainClient>) {
        *self.client.write() = Some(client);
        self.healthy.store(true, Ordering::Release);
    }

    fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct ConnectionPool {
    /// Priority order
    endpoints: Vec<EndpointConfig>,
    factory: Arc<dyn ClientFactory>,
    config: PoolConfig,
    slots: DashMap<String, Vec<Arc<ConnectionSlot>>>,
    initialized: AtomicBool,
}

impl ConnectionPool {
    pub fn new(endpoints: &[EndpointConfig], factory: Arc<dyn ClientFactory>, config: PoolConfig) -> Self {
        let mut endpoints = endpoints.to_vec();
        endpoints.sort_by_key(|e| e.priority);

        let slots = DashMap::new();
        for endpoint in &endpoints {
            let per_endpoint = (0..config.connections_per_endpoint.max(1))
                .map(|_| Arc::new(ConnectionSlot::empty(&endpoint.name)))
                .collect::<Vec<_>>();
            slots.insert(endpoint.name.clone(), per_endpoint);
        }

        Self {
            endpoints,
            factory,
            config,
            slots,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Open every connection, staggered by endpoint index.
    ///
    /// Never fails: endpoints whose connection could not be established are
    /// returned so the caller can take them out of rotation.
    #[instrument(skip(self), fields(endpoints = self.endpoints.len()))]
    pub async fn initialize(&self) -> Vec<String> {
        let mut failed = Vec::new();

        for (index, endpoint) in self.endpoints.iter().enumerate() {
            let delay = self.config.stagger_delay(index);
            debug!(endpoint = %endpoint.name, delay_ms = delay.as_millis() as u64, "Staggering connection");
            tokio::time::sleep(delay).await;

            if !self.connect_endpoint(endpoint).await {
                failed.push(endpoint.name.clone());
            }
        }

        self.initialized.store(true, Ordering::Release);
        let healthy: usize = self.pool_status().values().map(|o| o.healthy_count).sum();
        info!(healthy, failed = failed.len(), "Connection pool initialized");
        failed
    }

    /// (Re)connect every slot of one endpoint. Returns `true` if at least one slot is usable.
    async fn connect_endpoint(&self, endpoint: &EndpointConfig) -> bool {
        let Some(slots) = self.slots.get(&endpoint.name).map(|s| s.value().clone()) else {
            return false;
        };

        let mut any_healthy = false;
        for slot in slots.iter().filter(|s| !s.is_healthy()) {
            match self.open(endpoint).await {
                Ok(client) => {
                    slot.install(client);
                    any_healthy = true;
                }
                Err(e) => {
                    slot.mark_unhealthy();
                    warn!(endpoint = %endpoint.name, error = %e, "Failed to open connection");
                }
            }
        }
        any_healthy || slots.iter().any(|s| s.is_healthy())
    }

    /// Create a client and verify it answers `eth_chainId`
    async fn open(&self, endpoint: &EndpointConfig) -> Result<Arc<dyn ChainClient>, RpcManagerError> {
        let client = self.factory.connect(endpoint)?;
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        match tokio::time::timeout(timeout, client.chain_id()).await {
            Ok(Ok(chain_id)) => {
                debug!(endpoint = %endpoint.name, chain_id, "Connection established");
                Ok(client)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RpcManagerError::Timeout {
                endpoint: endpoint.name.clone(),
                timeout_ms: self.config.connect_timeout_ms,
            }),
        }
    }

    /// First healthy connection in priority order
    pub fn get_healthy_connection(&self) -> Option<Arc<dyn ChainClient>> {
        self.endpoints
            .iter()
            .find_map(|endpoint| self.connection_for(&endpoint.name))
    }

    /// A healthy pooled connection for a specific endpoint
    pub fn connection_for(&self, endpoint: &str) -> Option<Arc<dyn ChainClient>> {
        self.slots
            .get(endpoint)?
            .iter()
            .find_map(|slot| slot.client())
    }

    /// Take every connection of an endpoint out of service until the next reconnect
    pub fn mark_unhealthy(&self, endpoint: &str) {
        if let Some(slots) = self.slots.get(endpoint) {
            let mut changed = false;
            for slot in slots.iter() {
                changed |= slot.healthy.swap(false, Ordering::AcqRel);
            }
            if changed {
                warn!(endpoint, "Pooled connections marked unhealthy");
            }
        }
    }

    /// Re-open unusable slots. Returns the endpoints that have a usable connection again.
    #[instrument(skip(self))]
    pub async fn reconnect_unhealthy(&self) -> Vec<String> {
        let mut restored = Vec::new();
        for endpoint in &self.endpoints {
            let needs_reconnect = self
                .slots
                .get(&endpoint.name)
                .is_some_and(|slots| slots.iter().any(|s| !s.is_healthy()));
            if !needs_reconnect {
                continue;
            }

            let had_healthy = self.connection_for(&endpoint.name).is_some();
            if self.connect_endpoint(endpoint).await && !had_healthy {
                info!(endpoint = %endpoint.name, "Pooled connection re-established");
                restored.push(endpoint.name.clone());
            }
        }
        restored
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.endpoints
            .iter()
            .map(|endpoint| {
                let occupancy = self
                    .slots
                    .get(&endpoint.name)
                    .map(|slots| PoolOccupancy {
                        healthy_count: slots.iter().filter(|s| s.is_healthy()).count(),
                        total_count: slots.len(),
                    })
                    .unwrap_or_default();
                (endpoint.name.clone(), occupancy)
            })
            .collect()
    }
}
