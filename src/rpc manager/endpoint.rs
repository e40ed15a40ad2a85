//! Endpoint registry.
//!
//! Endpoints are created once from configuration and never removed. Every
//! attempt mutates an endpoint's counters under its own lock; dispatch
//! admission goes through a FIFO async gate so that two concurrent callers can
//! never both slip inside the minimum interval.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::rpc_config::{EndpointConfig, RpcManagerConfig};
use super::rpc_errors::RpcManagerError;
use super::rpc_metrics::EndpointStatus;

const HEALTH_EVENT_CAPACITY: usize = 64;

/// Emitted whenever an endpoint enters or leaves rotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    pub endpoint: String,
    pub healthy: bool,
    pub consecutive_errors: u32,
}

#[derive(Debug)]
struct EndpointState {
    consecutive_errors: u32,
    healthy: bool,
    last_used: Option<Instant>,
    last_rate_limit: Option<Instant>,
    total_requests: u64,
    total_errors: u64,
}

/// One candidate RPC server
#[derive(Debug)]
pub struct Endpoint {
    config: EndpointConfig,
    min_interval: Duration,
    state: Mutex<EndpointState>,
    /// Last dispatch instant; held across the wait so admission is first-come-first-served
    gate: AsyncMutex<Option<Instant>>,
}

impl Endpoint {
    fn new(config: EndpointConfig, interval_floor: Duration) -> Self {
        let min_interval = config.min_interval(interval_floor);
        Self {
            config,
            min_interval,
            state: Mutex::new(EndpointState {
                consecutive_errors: 0,
                healthy: true,
                last_used: None,
                last_rate_limit: None,
                total_requests: 0,
                total_errors: 0,
            }),
            gate: AsyncMutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn priority(&self) -> u32 {
        self.config.priority
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn is_healthy(&self) -> bool {
        self.state.lock().healthy
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.state.lock().consecutive_errors
    }

    pub fn last_used(&self) -> Option<Instant> {
        self.state.lock().last_used
    }

    /// Wait for this endpoint's dispatch slot.
    ///
    /// Callers are admitted in arrival order. If the previous dispatch was
    /// less than `min_interval` ago the caller sleeps for the remainder plus
    /// `safety_buffer`. Returns the time spent sleeping.
    pub async fn admit(&self, safety_buffer: Duration) -> Duration {
        let mut last_dispatch = self.gate.lock().await;

        let mut waited = Duration::ZERO;
        if let Some(previous) = *last_dispatch {
            let elapsed = Instant::now().saturating_duration_since(previous);
            if elapsed < self.min_interval {
                waited = self.min_interval - elapsed + safety_buffer;
                debug!(
                    endpoint = %self.config.name,
                    wait_ms = waited.as_millis() as u64,
                    "Waiting for minimum request interval"
                );
                tokio::time::sleep(waited).await;
            }
        }

        let dispatched = Instant::now();
        *last_dispatch = Some(dispatched);
        let mut state = self.state.lock();
        state.last_used = Some(dispatched);
        state.total_requests += 1;
        waited
    }

    fn status(&self) -> EndpointStatus {
        let state = self.state.lock();
        let now = Instant::now();
        EndpointStatus {
            name: self.config.name.clone(),
            url: self.config.url.clone(),
            priority: self.config.priority,
            max_requests_per_second: self.config.max_requests_per_second,
            healthy: state.healthy,
            consecutive_errors: state.consecutive_errors,
            total_requests: state.total_requests,
            total_errors: state.total_errors,
            last_used_ms_ago: state
                .last_used
                .map(|t| now.saturating_duration_since(t).as_millis() as u64),
            last_rate_limit_ms_ago: state
                .last_rate_limit
                .map(|t| now.saturating_duration_since(t).as_millis() as u64),
        }
    }
}

/// Priority-ordered set of endpoints with health bookkeeping
#[derive(Debug)]
pub struct EndpointRegistry {
    endpoints: Vec<Arc<Endpoint>>,
    unhealthy_after: u32,
    events: broadcast::Sender<HealthEvent>,
}

impl EndpointRegistry {
    /// Build the registry; endpoints are ordered by ascending priority (stable).
    ///
    /// # Errors
    ///
    /// Returns a configuration error when no endpoints are configured.
    pub fn new(config: &RpcManagerConfig) -> Result<Self, RpcManagerError> {
        if config.endpoints.is_empty() {
            return Err(RpcManagerError::Configuration(
                "At least one RPC endpoint must be configured".to_string(),
            ));
        }

        let mut configs = config.endpoints.clone();
        configs.sort_by_key(|e| e.priority);

        let floor = config.min_request_interval();
        let endpoints = configs
            .into_iter()
            .map(|c| Arc::new(Endpoint::new(c, floor)))
            .collect();

        let (events, _) = broadcast::channel(HEALTH_EVENT_CAPACITY);

        Ok(Self {
            endpoints,
            unhealthy_after: config.unhealthy_after_errors.max(1),
            events,
        })
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Endpoint>> {
        self.endpoints.iter().find(|e| e.name() == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.endpoints.iter().position(|e| e.name() == name)
    }

    pub fn healthy_count(&self) -> usize {
        self.endpoints.iter().filter(|e| e.is_healthy()).count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Pick the endpoint for the next attempt, searching from `start` and
    /// wrapping around. `0` is the best priority; `i + 1` rotates away from `i`.
    ///
    /// Endpoints rejected by `preferred` are only used when nothing else is
    /// healthy. If no endpoint is healthy at all, every endpoint is reset to
    /// healthy rather than leaving the caller without a target.
    pub fn select<F>(&self, start: usize, preferred: F) -> (usize, Arc<Endpoint>)
    where
        F: Fn(&Endpoint) -> bool,
    {
        let len = self.endpoints.len();
        let start = start % len;
        let order = || (0..len).map(move |offset| (start + offset) % len);

        let choice = order()
            .find(|&i| {
                let endpoint = &self.endpoints[i];
                endpoint.is_healthy() && preferred(endpoint)
            })
            .or_else(|| order().find(|&i| self.endpoints[i].is_healthy()));

        let index = match choice {
            Some(index) => index,
            None => {
                warn!(total = len, "No healthy endpoints left, resetting all to healthy");
                self.reset_all();
                start
            }
        };

        (index, Arc::clone(&self.endpoints[index]))
    }

    pub fn record_success(&self, endpoint: &Endpoint) {
        let recovered = {
            let mut state = endpoint.state.lock();
            let recovered = !state.healthy;
            state.consecutive_errors = 0;
            state.healthy = true;
            recovered
        };
        if recovered {
            info!(endpoint = %endpoint.name(), "Endpoint back in rotation after success");
            self.emit(endpoint, true, 0);
        }
    }

    /// Count a failed attempt. Returns `true` if this failure took the endpoint out of rotation.
    pub fn record_failure(&self, endpoint: &Endpoint, rate_limited: bool) -> bool {
        let (became_unhealthy, errors) = {
            let mut state = endpoint.state.lock();
            state.consecutive_errors = state.consecutive_errors.saturating_add(1);
            state.total_errors += 1;
            if rate_limited {
                state.last_rate_limit = Some(Instant::now());
            }
            let became_unhealthy = state.healthy && state.consecutive_errors >= self.unhealthy_after;
            if became_unhealthy {
                state.healthy = false;
            }
            (became_unhealthy, state.consecutive_errors)
        };

        if became_unhealthy {
            warn!(
                endpoint = %endpoint.name(),
                consecutive_errors = errors,
                "Endpoint marked unhealthy"
            );
            self.emit(endpoint, false, errors);
        }
        became_unhealthy
    }

    /// Take an endpoint out of rotation without an attempt (e.g. connection failure).
    ///
    /// The error counter is raised to the threshold so the endpoint comes back
    /// through the regular decay path.
    pub fn mark_unhealthy(&self, name: &str) {
        let Some(endpoint) = self.get(name) else {
            return;
        };
        let errors = {
            let mut state = endpoint.state.lock();
            if !state.healthy {
                return;
            }
            state.healthy = false;
            state.consecutive_errors = state.consecutive_errors.max(self.unhealthy_after);
            state.consecutive_errors
        };
        warn!(endpoint = %name, "Endpoint marked unhealthy");
        self.emit(endpoint, false, errors);
    }

    /// Decrement every error counter by one (floor 0). An unhealthy endpoint is
    /// restored exactly when its counter reaches zero. Returns the endpoints
    /// restored by this pass.
    pub fn decay_errors(&self) -> Vec<String> {
        let mut restored = Vec::new();
        for endpoint in &self.endpoints {
            let recovered = {
                let mut state = endpoint.state.lock();
                state.consecutive_errors = state.consecutive_errors.saturating_sub(1);
                if state.consecutive_errors == 0 && !state.healthy {
                    state.healthy = true;
                    true
                } else {
                    false
                }
            };
            if recovered {
                info!(endpoint = %endpoint.name(), "Endpoint restored by error decay");
                self.emit(endpoint, true, 0);
                restored.push(endpoint.name().to_string());
            }
        }
        restored
    }

    pub fn reset_all(&self) {
        for endpoint in &self.endpoints {
            let was_unhealthy = {
                let mut state = endpoint.state.lock();
                let was_unhealthy = !state.healthy;
                state.healthy = true;
                state.consecutive_errors = 0;
                was_unhealthy
            };
            if was_unhealthy {
                self.emit(endpoint, true, 0);
            }
        }
    }

    pub fn status(&self) -> Vec<EndpointStatus> {
        self.endpoints.iter().map(|e| e.status()).collect()
    }

    fn emit(&self, endpoint: &Endpoint, healthy: bool, consecutive_errors: u32) {
        // No subscribers is fine.
        let _ = self.events.send(HealthEvent {
            endpoint: endpoint.name().to_string(),
            healthy,
            consecutive_errors,
        });
    }
}
