//! Prometheus metrics for the RPC and transaction layers

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Duration;

use crate::rpc_manager::FailureKind;

/// Metrics registry owned by one client stack.
///
/// Constructed once at start-up and handed to the managers; there is no
/// process-global instance.
#[derive(Clone)]
pub struct RpcTelemetry {
    registry: Registry,

    // Counters
    pub requests_total: IntCounterVec,
    pub failures_total: IntCounterVec,
    pub rate_limit_hits: IntCounter,
    pub transactions_total: IntCounterVec,
    pub gas_estimate_fallbacks: IntCounter,

    // Gauges
    pub healthy_endpoints: IntGauge,

    // Histograms
    pub request_latency: Histogram,
    pub confirmation_latency: Histogram,
}

impl std::fmt::Debug for RpcTelemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcTelemetry").finish_non_exhaustive()
    }
}

impl RpcTelemetry {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("agent_rpc_requests_total", "RPC attempts by endpoint and outcome"),
            &["endpoint", "outcome"],
        )?;

        let failures_total = IntCounterVec::new(
            Opts::new("agent_rpc_failures_total", "Failed RPC attempts by endpoint and failure kind"),
            &["endpoint", "kind"],
        )?;

        let rate_limit_hits = IntCounter::with_opts(Opts::new(
            "agent_rpc_rate_limit_hits_total",
            "Provider rate-limit responses",
        ))?;

        let transactions_total = IntCounterVec::new(
            Opts::new("agent_rpc_transactions_total", "Transaction submissions by outcome"),
            &["outcome"],
        )?;

        let gas_estimate_fallbacks = IntCounter::with_opts(Opts::new(
            "agent_rpc_gas_estimate_fallbacks_total",
            "Gas limits taken from the static table after estimation failed",
        ))?;

        let healthy_endpoints = IntGauge::with_opts(Opts::new(
            "agent_rpc_healthy_endpoints",
            "Endpoints currently in rotation",
        ))?;

        let request_latency = Histogram::with_opts(
            HistogramOpts::new("agent_rpc_request_latency_seconds", "Successful RPC attempt latency")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0]),
        )?;

        let confirmation_latency = Histogram::with_opts(
            HistogramOpts::new(
                "agent_rpc_confirmation_latency_seconds",
                "Time from submission to confirmation",
            )
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 180.0]),
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(failures_total.clone()))?;
        registry.register(Box::new(rate_limit_hits.clone()))?;
        registry.register(Box::new(transactions_total.clone()))?;
        registry.register(Box::new(gas_estimate_fallbacks.clone()))?;
        registry.register(Box::new(healthy_endpoints.clone()))?;
        registry.register(Box::new(request_latency.clone()))?;
        registry.register(Box::new(confirmation_latency.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            failures_total,
            rate_limit_hits,
            transactions_total,
            gas_estimate_fallbacks,
            healthy_endpoints,
            request_latency,
            confirmation_latency,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_success(&self, endpoint: &str, latency: Duration) {
        self.requests_total.with_label_values(&[endpoint, "success"]).inc();
        self.request_latency.observe(latency.as_secs_f64());
    }

    pub fn record_failure(&self, endpoint: &str, kind: FailureKind) {
        self.requests_total.with_label_values(&[endpoint, "failure"]).inc();
        self.failures_total.with_label_values(&[endpoint, kind.as_str()]).inc();
        if kind == FailureKind::RateLimit {
            self.rate_limit_hits.inc();
        }
    }

    pub fn record_transaction(&self, outcome: &str) {
        self.transactions_total.with_label_values(&[outcome]).inc();
    }

    pub fn set_healthy_endpoints(&self, count: usize) {
        self.healthy_endpoints.set(count as i64);
    }

    /// Text exposition format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
