use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::test_helpers::{fast_config, manager, scripted};
use crate::rpc_manager::{
    CircuitState, EndpointConfig, RpcManagerConfig, RpcManagerError, RPC_FAMILY,
};

#[tokio::test(start_paused = true)]
async fn test_rate_limited_endpoint_leaves_rotation_after_two_errors() {
    let (factory, clients) = scripted(&["a", "b", "c"]);
    let (a, b) = (&clients[0], &clients[1]);
    a.always_fail("429 Too Many Requests");
    let rpc = manager(fast_config(&["a", "b", "c"]), &factory);

    for _ in 0..5 {
        assert_eq!(rpc.block_number().await.unwrap(), 100);
    }

    // Two rate-limited calls reach the threshold; A is skipped from then on.
    assert_eq!(a.call_count(), 2);
    assert_eq!(b.call_count(), 5);
    assert_eq!(clients[2].call_count(), 0);

    let endpoint = rpc.registry().get("a").unwrap();
    assert!(!endpoint.is_healthy());
    assert_eq!(endpoint.consecutive_errors(), 2);

    let metrics = rpc.get_metrics();
    assert_eq!(metrics.rate_limit_hits, 2);
    assert_eq!(metrics.successful_requests, 5);
    assert_eq!(metrics.active_provider.as_deref(), Some("b"));
}

#[tokio::test(start_paused = true)]
async fn test_decay_restores_exactly_at_zero_and_stays() {
    let (factory, clients) = scripted(&["a", "b"]);
    clients[0].always_fail("Too Many Requests");
    let rpc = manager(fast_config(&["a", "b"]), &factory);
    rpc.block_number().await.unwrap();
    rpc.block_number().await.unwrap();

    let a = rpc.registry().get("a").unwrap();
    assert!(!a.is_healthy());

    let mut events = rpc.subscribe_health_events();
    assert!(rpc.registry().decay_errors().is_empty());
    assert!(!a.is_healthy());
    assert_eq!(a.consecutive_errors(), 1);

    assert_eq!(rpc.registry().decay_errors(), vec!["a".to_string()]);
    assert!(a.is_healthy());
    assert_eq!(a.consecutive_errors(), 0);
    let event = events.try_recv().unwrap();
    assert_eq!(event.endpoint, "a");
    assert!(event.healthy);

    for _ in 0..5 {
        assert!(rpc.registry().decay_errors().is_empty());
        assert!(a.is_healthy());
        assert_eq!(a.consecutive_errors(), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_recovery_task_runs_decay() {
    let (factory, clients) = scripted(&["a", "b"]);
    clients[0].always_fail("429");
    let config = RpcManagerConfig {
        error_decay_interval_ms: 60_000,
        ..fast_config(&["a", "b"])
    };
    let rpc = manager(config, &factory);
    rpc.start().await;
    rpc.block_number().await.unwrap();
    rpc.block_number().await.unwrap();
    assert!(!rpc.registry().get("a").unwrap().is_healthy());

    tokio::time::sleep(Duration::from_secs(125)).await;
    assert!(rpc.registry().get("a").unwrap().is_healthy());

    rpc.stop();
    rpc.stop();
    assert!(!rpc.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_second_call_waits_for_endpoint_interval() {
    let (factory, clients) = scripted(&["a"]);
    let config = RpcManagerConfig {
        max_jitter_ms: 0,
        min_request_interval_ms: 0,
        ..RpcManagerConfig::with_endpoints(vec![EndpointConfig::new("a", "https://a.example", 0).with_max_rps(1)])
    };
    let interval = Duration::from_millis(1000);
    let rpc = manager(config, &factory);

    rpc.block_number().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    rpc.block_number().await.unwrap();
    let waited = started.elapsed();

    assert!(waited >= interval - Duration::from_millis(500));
    assert!(waited >= interval - Duration::from_millis(300));
    assert_eq!(clients[0].call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_are_admitted_in_turn() {
    let (factory, clients) = scripted(&["a"]);
    let config = RpcManagerConfig {
        max_jitter_ms: 0,
        safety_buffer_ms: 0,
        min_request_interval_ms: 0,
        ..RpcManagerConfig::with_endpoints(vec![EndpointConfig::new("a", "https://a.example", 0).with_max_rps(2)])
    };
    let rpc = manager(config, &factory);

    let started = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..4 {
        let rpc = rpc.clone();
        handles.push(tokio::spawn(async move {
            rpc.block_number().await.unwrap();
            Instant::now()
        }));
    }
    let mut finished = Vec::new();
    for handle in handles {
        finished.push(handle.await.unwrap().duration_since(started));
    }
    finished.sort();

    // 500ms spacing: no two callers slip through together.
    for pair in finished.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(500));
    }
    assert_eq!(clients[0].call_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_backoff_grows_between_attempts() {
    let (factory, clients) = scripted(&["a"]);
    clients[0].always_fail("429 Too Many Requests");
    let rpc = manager(fast_config(&["a"]), &factory);

    let started = Instant::now();
    let err = rpc.block_number().await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(
        err,
        RpcManagerError::RetriesExhausted { attempts: 3, .. }
    ));
    // 5000ms after attempt 1, 7000ms after attempt 2, none after the last.
    assert!(elapsed >= Duration::from_millis(12_000));
    assert!(elapsed < Duration::from_millis(13_000));
    assert_eq!(clients[0].call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_error_returns_without_penalty() {
    let (factory, clients) = scripted(&["a", "b"]);
    clients[0].fail_next("insufficient funds for gas * price + value");
    let rpc = manager(fast_config(&["a", "b"]), &factory);

    let err = rpc.block_number().await.unwrap_err();
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("insufficient funds"));
    assert_eq!(clients[0].call_count(), 1);
    assert_eq!(clients[1].call_count(), 0);
    assert_eq!(rpc.registry().get("a").unwrap().consecutive_errors(), 0);
    assert_eq!(rpc.circuit_breaker(RPC_FAMILY).failure_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_network_error_rotates_to_next_endpoint() {
    let (factory, clients) = scripted(&["a", "b"]);
    clients[0].fail_next("network error: connection reset");
    let rpc = manager(fast_config(&["a", "b"]), &factory);

    assert_eq!(rpc.chain_id().await.unwrap(), 31337);
    assert_eq!(clients[0].call_count(), 1);
    assert_eq!(clients[1].call_count(), 1);
    // One error is below the threshold.
    assert!(rpc.registry().get("a").unwrap().is_healthy());
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_fails_fast() {
    let (factory, clients) = scripted(&["a"]);
    clients[0].always_fail("network error");
    let config = RpcManagerConfig {
        circuit_breaker_failure_threshold: 2,
        ..fast_config(&["a"])
    };
    let rpc = manager(config, &factory);

    assert!(rpc.block_number().await.is_err());
    assert!(rpc.block_number().await.is_err());
    assert_eq!(rpc.circuit_breaker(RPC_FAMILY).state(), CircuitState::Open);

    let calls = clients[0].call_count();
    let err = rpc.block_number().await.unwrap_err();
    assert!(matches!(err, RpcManagerError::CircuitOpen { .. }));
    assert_eq!(clients[0].call_count(), calls);

    // After the cooldown one trial call is let through and closes the circuit.
    clients[0].clear_failures();
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(rpc.block_number().await.unwrap(), 100);
    assert_eq!(rpc.circuit_breaker(RPC_FAMILY).state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_abandons_slow_call() {
    let (factory, _) = scripted(&[]);
    factory.register(crate::test_utils::ScriptedClient::new("slow").with_latency(Duration::from_secs(10)));
    let rpc = manager(fast_config(&["slow"]), &factory);

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let err = rpc
        .execute_with_retry_cancellable("eth_blockNumber", &token, |client| async move {
            client.block_number().await
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RpcManagerError::Cancelled(_)));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_slow_endpoint_times_out_and_rotates() {
    let (factory, _) = scripted(&[]);
    let slow = crate::test_utils::ScriptedClient::new("slow").with_latency(Duration::from_secs(30));
    let fast = crate::test_utils::ScriptedClient::new("fast");
    factory.register(slow.clone());
    factory.register(fast.clone());
    let rpc = manager(fast_config(&["slow", "fast"]), &factory);

    assert_eq!(rpc.block_number().await.unwrap(), 100);
    assert_eq!(slow.call_count(), 1);
    assert_eq!(fast.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_start_marks_unreachable_endpoints_and_reports_status() {
    let (factory, _) = scripted(&["a", "b"]);
    factory.fail_connect("a");
    let rpc = manager(fast_config(&["a", "b"]), &factory);
    rpc.start().await;

    assert!(!rpc.registry().get("a").unwrap().is_healthy());
    let pool = rpc.get_pool_status();
    assert_eq!(pool["a"].healthy_count, 0);
    assert_eq!(pool["b"].healthy_count, 1);

    rpc.block_number().await.unwrap();
    let status = rpc.get_comprehensive_status();
    assert_eq!(status.endpoints.len(), 2);
    assert_eq!(status.metrics.successful_requests, 1);
    assert_eq!(status.metrics.active_provider.as_deref(), Some("b"));
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["status"], "degraded");

    rpc.stop();
}

#[tokio::test(start_paused = true)]
async fn test_no_connectable_endpoint_is_reported() {
    let (factory, clients) = scripted(&["a", "b"]);
    factory.fail_connect("a");
    factory.fail_connect("b");
    let rpc = manager(fast_config(&["a", "b"]), &factory);

    let err = rpc.block_number().await.unwrap_err();
    assert!(matches!(err, RpcManagerError::NoHealthyEndpoints { total: 2, .. }));
    assert_eq!(clients[0].call_count(), 0);
    assert_eq!(clients[1].call_count(), 0);
    assert_eq!(rpc.circuit_breaker(RPC_FAMILY).failure_count(), 0);

    factory.allow_connect("b");
    assert_eq!(rpc.block_number().await.unwrap(), 100);
}
