use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Family used by `RpcManager::execute_with_retry`
pub const RPC_FAMILY: &str = "rpc";
/// Family used for transaction submission
pub const TRANSACTION_SUBMISSION_FAMILY: &str = "transaction_submission";

/// Circuit breaker state machine.
///
/// - `Closed` -> `Open`: failure count reaches the threshold
/// - `Open` -> `HalfOpen`: cooldown elapsed since the last failure
/// - `HalfOpen` -> `Closed`: next success
/// - `HalfOpen` -> `Open`: next failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// All transitions happen under one lock
#[derive(Debug)]
struct BreakerState {
    failure_count: u32,
    last_failure: Option<Instant>,
    state: CircuitState,
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub family: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub ms_since_last_failure: Option<u64>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerState>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerState {
                failure_count: 0,
                last_failure: None,
                state: CircuitState::Closed,
            }),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    /// Whether a call may proceed. An open breaker whose cooldown elapsed moves to `HalfOpen`.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = inner
                    .last_failure
                    .is_some_and(|at| at.elapsed() >= self.cooldown);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    tracing::warn!("circuit breaker transitioning to half-open state");
                }
                cooled
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!("circuit breaker closed after successful request");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
    }

    /// Returns `true` when this failure opened the breaker.
    pub fn on_failure(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        let should_open = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.failure_count >= self.threshold,
            CircuitState::Open => false,
        };
        if should_open {
            inner.state = CircuitState::Open;
            tracing::warn!(
                threshold = self.threshold,
                failures = inner.failure_count,
                "circuit breaker opened"
            );
        }
        should_open
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    fn snapshot(&self, family: &str) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            family: family.to_string(),
            state: inner.state,
            failure_count: inner.failure_count,
            ms_since_last_failure: inner.last_failure.map(|at| at.elapsed().as_millis() as u64),
        }
    }
}

/// Breakers keyed by operation family, created on first use
#[derive(Debug)]
pub struct CircuitBreakers {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreakers {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            breakers: DashMap::new(),
            threshold,
            cooldown,
        }
    }

    pub fn get(&self, family: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(family) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.breakers
                .entry(family.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(self.threshold, self.cooldown)))
                .value(),
        )
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| entry.value().snapshot(entry.key()))
            .collect();
        snapshots.sort_by(|a, b| a.family.cmp(&b.family));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_open_half_open_closed() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(60));

        for _ in 0..4 {
            assert!(!breaker.on_failure());
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.on_failure());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!breaker.can_execute());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.on_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(10));
        breaker.on_failure();
        breaker.on_failure();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(breaker.can_execute());

        assert!(breaker.on_failure());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn test_families_are_independent() {
        let breakers = CircuitBreakers::new(1, Duration::from_secs(60));
        breakers.get(RPC_FAMILY).on_failure();

        assert_eq!(breakers.get(RPC_FAMILY).state(), CircuitState::Open);
        assert_eq!(breakers.get(TRANSACTION_SUBMISSION_FAMILY).state(), CircuitState::Closed);

        let snapshot = breakers.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].family, RPC_FAMILY);
        assert_eq!(snapshot[0].state, CircuitState::Open);
    }
}
