//! Network monitor
//!
//! Independent liveness and latency oracle. Every check interval it probes
//! each endpoint in turn with `eth_blockNumber`, never in parallel, since
//! many free-tier providers reject concurrent or batched calls. The chain id
//! is fetched once per endpoint, spaced from the block query by the
//! endpoint's request interval. Results feed an exponential moving average
//! of latency, a success rate and a healthy flag that the request path
//! consults when choosing an endpoint.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::rpc_config::{EndpointConfig, NetworkMonitorConfig};
use super::rpc_errors::RpcManagerError;
use super::rpc_metrics::{NetworkSnapshot, ProviderHealthSnapshot};
use super::transport::{ChainClient, ClientFactory};

#[derive(Debug, Default)]
struct ProviderHealth {
    client: Option<Arc<dyn ChainClient>>,
    healthy: bool,
    average_latency_ms: Option<f64>,
    total_checks: u64,
    failed_checks: u64,
    consecutive_failures: u32,
    last_success: Option<Instant>,
    last_block_number: Option<u64>,
    chain_id: Option<u64>,
    last_error: Option<String>,
}

impl ProviderHealth {
    fn success_rate(&self) -> f64 {
        if self.total_checks == 0 {
            return 1.0;
        }
        (self.total_checks - self.failed_checks) as f64 / self.total_checks as f64
    }
}

#[derive(Debug, Clone, Copy)]
struct ProbeOutcome {
    block_number: u64,
    chain_id: u64,
    /// Round trip of the block query alone
    latency_ms: f64,
}

#[derive(Debug)]
struct MonitoredProvider {
    config: EndpointConfig,
    health: Mutex<ProviderHealth>,
}

#[derive(Debug)]
struct MonitorTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
pub struct NetworkMonitor {
    /// Priority order
    providers: Vec<MonitoredProvider>,
    factory: Arc<dyn ClientFactory>,
    config: NetworkMonitorConfig,
    task: Mutex<Option<MonitorTask>>,
    last_report: Mutex<Option<Instant>>,
}

impl NetworkMonitor {
    pub fn new(endpoints: &[EndpointConfig], factory: Arc<dyn ClientFactory>, config: NetworkMonitorConfig) -> Self {
        let mut endpoints = endpoints.to_vec();
        endpoints.sort_by_key(|e| e.priority);

        let providers = endpoints
            .into_iter()
            .map(|config| MonitoredProvider {
                config,
                health: Mutex::new(ProviderHealth {
                    healthy: true,
                    ..Default::default()
                }),
            })
            .collect();

        Self {
            providers,
            factory,
            config,
            task: Mutex::new(None),
            last_report: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &NetworkMonitorConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Start the recurring check. Calling it while already running is a no-op.
    ///
    /// The background task only holds a weak reference; dropping the last
    /// `Arc` ends it at the next tick.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            debug!("Network monitor already running");
            return;
        }

        let cancel = CancellationToken::new();
        let weak: Weak<Self> = Arc::downgrade(self);
        let token = cancel.clone();
        let period = Duration::from_millis(self.config.check_interval_ms);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(monitor) = weak.upgrade() else {
                    break;
                };

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = monitor.run_cycle() => {}
                }
            }
            debug!("Network monitor loop exited");
        });

        info!(
            interval_ms = self.config.check_interval_ms,
            providers = self.providers.len(),
            "Network monitor started"
        );
        *task = Some(MonitorTask { cancel, handle });
    }

    /// Cancel the recurring check. Idempotent.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.cancel.cancel();
            task.handle.abort();
            info!("Network monitor stopped");
        }
    }

    async fn run_cycle(&self) {
        self.check_all().await;

        let report_due = {
            let mut last = self.last_report.lock();
            let now = Instant::now();
            let due = last.map_or(true, |at| {
                now.saturating_duration_since(at) >= Duration::from_millis(self.config.report_interval_ms)
            });
            if due {
                *last = Some(now);
            }
            due
        };
        if report_due {
            self.log_report();
        }
    }

    /// Probe every endpoint once, strictly one after another
    #[instrument(skip(self), fields(providers = self.providers.len()))]
    pub async fn check_all(&self) {
        for provider in &self.providers {
            self.check_provider(provider).await;
        }
    }

    async fn check_provider(&self, provider: &MonitoredProvider) {
        let name = provider.config.name.as_str();
        let outcome = self.probe(provider).await;

        let mut health = provider.health.lock();
        health.total_checks += 1;

        match outcome {
            Ok(ProbeOutcome {
                block_number,
                chain_id,
                latency_ms,
            }) => {
                let recovered = !health.healthy;
                health.healthy = true;
                health.consecutive_failures = 0;
                health.last_success = Some(Instant::now());
                health.last_block_number = Some(block_number);
                health.chain_id = Some(chain_id);
                health.last_error = None;

                let weight = self.config.latency_weight;
                health.average_latency_ms = Some(match health.average_latency_ms {
                    Some(avg) => avg * (1.0 - weight) + latency_ms * weight,
                    None => latency_ms,
                });

                if recovered {
                    info!(endpoint = name, latency_ms, "Provider healthy again");
                } else {
                    debug!(endpoint = name, block_number, latency_ms, "Provider check passed");
                }
            }
            Err(e) => {
                health.failed_checks += 1;
                health.consecutive_failures = health.consecutive_failures.saturating_add(1);
                health.last_error = Some(e.to_string());
                // Rebuild the probe connection on the next check.
                health.client = None;

                let threshold = self.config.unhealthy_after_failures.max(1);
                if health.healthy && health.consecutive_failures >= threshold {
                    health.healthy = false;
                    warn!(
                        endpoint = name,
                        consecutive_failures = health.consecutive_failures,
                        error = %e,
                        "Provider marked unhealthy by network monitor"
                    );
                } else {
                    debug!(
                        endpoint = name,
                        consecutive_failures = health.consecutive_failures,
                        kind = %e.failure_kind(),
                        error = %e,
                        "Provider check failed"
                    );
                }
            }
        }
    }

    async fn probe(&self, provider: &MonitoredProvider) -> Result<ProbeOutcome, RpcManagerError> {
        let (cached, known_chain_id) = {
            let health = provider.health.lock();
            (health.client.clone(), health.chain_id)
        };
        let client = match cached {
            Some(client) => client,
            None => {
                let client = self.factory.connect(&provider.config)?;
                provider.health.lock().client = Some(Arc::clone(&client));
                client
            }
        };

        let timeout_ms = self.config.probe_timeout_ms;
        let spacing = provider.config.min_interval(Duration::ZERO);
        let probe = async {
            let started = Instant::now();
            let block_number = client.block_number().await?;
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

            let chain_id = match known_chain_id {
                Some(id) => id,
                None => {
                    tokio::time::sleep(spacing).await;
                    client.chain_id().await?
                }
            };
            Ok::<_, RpcManagerError>(ProbeOutcome {
                block_number,
                chain_id,
                latency_ms,
            })
        };

        match tokio::time::timeout(Duration::from_millis(timeout_ms), probe).await {
            Ok(result) => result,
            Err(_) => Err(RpcManagerError::Timeout {
                endpoint: provider.config.name.clone(),
                timeout_ms,
            }),
        }
    }

    fn log_report(&self) {
        let snapshot = self.snapshot();
        info!(
            healthy = snapshot.healthy_providers,
            total = snapshot.total_providers,
            network_healthy = snapshot.network_healthy,
            best = snapshot.best_provider.as_deref().unwrap_or("none"),
            "Network health report"
        );
        for provider in &snapshot.providers {
            info!(
                endpoint = %provider.name,
                healthy = provider.healthy,
                success_rate = provider.success_rate,
                avg_latency_ms = provider.average_latency_ms,
                ms_since_last_success = provider.ms_since_last_success,
                "Provider report"
            );
        }
    }

    /// Whether the monitor currently considers `name` usable. Unknown names are.
    pub fn is_provider_healthy(&self, name: &str) -> bool {
        self.providers
            .iter()
            .find(|p| p.config.name == name)
            .map_or(true, |p| p.health.lock().healthy)
    }

    /// Names of healthy providers in priority order
    pub fn get_healthy_providers(&self) -> Vec<String> {
        self.providers
            .iter()
            .filter(|p| p.health.lock().healthy)
            .map(|p| p.config.name.clone())
            .collect()
    }

    /// Lowest average latency among healthy, already-measured providers.
    /// Falls back to the first healthy provider if none has been measured yet.
    pub fn get_best_provider(&self) -> Option<String> {
        let mut best: Option<(&str, f64)> = None;
        let mut first_healthy: Option<&str> = None;

        for provider in &self.providers {
            let health = provider.health.lock();
            if !health.healthy {
                continue;
            }
            first_healthy.get_or_insert(provider.config.name.as_str());
            if let Some(latency) = health.average_latency_ms {
                if best.map_or(true, |(_, l)| latency < l) {
                    best = Some((provider.config.name.as_str(), latency));
                }
            }
        }

        best.map(|(name, _)| name)
            .or(first_healthy)
            .map(str::to_string)
    }

    /// True when at least `healthy_ratio` of the providers are healthy
    pub fn is_network_healthy(&self) -> bool {
        if self.providers.is_empty() {
            return false;
        }
        let healthy = self.get_healthy_providers().len();
        healthy as f64 >= self.providers.len() as f64 * self.config.healthy_ratio
    }

    pub fn snapshot(&self) -> NetworkSnapshot {
        let now = Instant::now();
        let providers: Vec<_> = self
            .providers
            .iter()
            .map(|p| {
                let health = p.health.lock();
                ProviderHealthSnapshot {
                    name: p.config.name.clone(),
                    healthy: health.healthy,
                    average_latency_ms: health.average_latency_ms.unwrap_or_default(),
                    success_rate: health.success_rate(),
                    total_checks: health.total_checks,
                    failed_checks: health.failed_checks,
                    consecutive_failures: health.consecutive_failures,
                    last_block_number: health.last_block_number,
                    chain_id: health.chain_id,
                    last_error: health.last_error.clone(),
                    ms_since_last_success: health
                        .last_success
                        .map(|at| now.saturating_duration_since(at).as_millis() as u64),
                }
            })
            .collect();

        NetworkSnapshot {
            running: self.is_running(),
            network_healthy: self.is_network_healthy(),
            healthy_providers: providers.iter().filter(|p| p.healthy).count(),
            total_providers: providers.len(),
            best_provider: self.get_best_provider(),
            providers,
        }
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.cancel.cancel();
            task.handle.abort();
        }
    }
}
