use arc_swap::ArcSwapOption;
use crossbeam::atomic::AtomicCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::rpc_metrics::MetricsSnapshot;

/// Weight of a new sample in the response-time moving average
const RESPONSE_TIME_WEIGHT: f64 = 0.1;

/// Process-wide operation metrics owned by one `RpcManager`.
///
/// Counters are lock-free. The moving average is load/store on an
/// `AtomicCell<f64>`, so under heavy contention a concurrent sample can be
/// dropped from the average; the counters are exact.
#[derive(Debug, Default)]
pub struct OperationMetrics {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    rate_limit_hits: AtomicU64,
    average_response_ms: AtomicCell<f64>,
    response_samples: AtomicU64,
    active_provider: ArcSwapOption<String>,
}

impl OperationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// One attempt dispatched to an endpoint
    pub fn record_request(&self, provider: &str) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let unchanged = self
            .active_provider
            .load()
            .as_deref()
            .is_some_and(|current| current == provider);
        if !unchanged {
            self.active_provider.store(Some(Arc::new(provider.to_string())));
        }
    }

    pub fn record_success(&self, elapsed: Duration) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        let sample = elapsed.as_secs_f64() * 1000.0;
        if self.response_samples.fetch_add(1, Ordering::Relaxed) == 0 {
            self.average_response_ms.store(sample);
        } else {
            let avg = self.average_response_ms.load();
            self.average_response_ms
                .store(avg * (1.0 - RESPONSE_TIME_WEIGHT) + sample * RESPONSE_TIME_WEIGHT);
        }
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit_hit(&self) {
        self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn successful_requests(&self) -> u64 {
        self.successful_requests.load(Ordering::Relaxed)
    }

    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    pub fn rate_limit_hits(&self) -> u64 {
        self.rate_limit_hits.load(Ordering::Relaxed)
    }

    pub fn average_response_ms(&self) -> f64 {
        self.average_response_ms.load()
    }

    pub fn active_provider(&self) -> Option<String> {
        self.active_provider.load().as_deref().cloned()
    }

    pub fn success_rate(&self) -> f64 {
        let completed = self.successful_requests() + self.failed_requests();
        if completed == 0 {
            return 1.0;
        }
        self.successful_requests() as f64 / completed as f64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests(),
            successful_requests: self.successful_requests(),
            failed_requests: self.failed_requests(),
            rate_limit_hits: self.rate_limit_hits(),
            average_response_time_ms: self.average_response_ms(),
            success_rate: self.success_rate(),
            active_provider: self.active_provider(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_counters_and_active_provider() {
        let metrics = OperationMetrics::new();
        assert_eq!(metrics.active_provider(), None);
        assert_eq!(metrics.success_rate(), 1.0);

        metrics.record_request("a");
        metrics.record_success(Duration::from_millis(100));
        metrics.record_request("b");
        metrics.record_failure();
        metrics.record_rate_limit_hit();

        let snap = metrics.snapshot();
        assert_eq!(snap.total_requests, 2);
        assert_eq!(snap.successful_requests, 1);
        assert_eq!(snap.failed_requests, 1);
        assert_eq!(snap.rate_limit_hits, 1);
        assert_eq!(snap.active_provider.as_deref(), Some("b"));
        assert!((snap.success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_response_time_ema() {
        let metrics = OperationMetrics::new();
        metrics.record_success(Duration::from_millis(100));
        assert!((metrics.average_response_ms() - 100.0).abs() < 1e-9);

        metrics.record_success(Duration::from_millis(200));
        assert!((metrics.average_response_ms() - 110.0).abs() < 1e-9);
    }

    #[test]
    fn test_concurrent_counting() {
        let metrics = Arc::new(OperationMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let metrics = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..100 {
                        metrics.record_request(if i % 2 == 0 { "a" } else { "b" });
                        metrics.record_success(Duration::from_millis(10));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(metrics.total_requests(), 800);
        assert_eq!(metrics.successful_requests(), 800);
        assert!((metrics.average_response_ms() - 10.0).abs() < 1e-9);
    }
}
