//! Retry, circuit breaker and cache behaviour through the public client

mod common;

use common::{RoutedTransport, client, client_with, model_json, version_json};
use model_scout::api::{CacheSettings, HttpResponse};
use model_scout::error::ApiError;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_rate_limited_then_success_waits_retry_after() {
    let transport = Arc::new(RoutedTransport::new().route(
        "models/1",
        vec![
            HttpResponse::new(429, "slow down").with_header("Retry-After", "3"),
            HttpResponse::new(200, model_json(1, &[10]).to_string()),
        ],
    ));
    let client = client(transport.clone());

    let started = Instant::now();
    let model = client.get_model(1, false).await.unwrap();

    assert_eq!(model.id, 1);
    assert_eq!(transport.calls_to("models/1"), 2);
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn test_persistent_server_error_backs_off_exponentially() {
    let transport = Arc::new(
        RoutedTransport::new().route("models/1", vec![HttpResponse::new(503, "unavailable")]),
    );
    let client = client_with(transport.clone(), |s| {
        s.executor.max_retries = 3;
        s.executor.base_retry_delay = Duration::from_secs(2);
    });

    let started = Instant::now();
    let err = client.get_model(1, false).await.unwrap_err();

    assert!(matches!(err, ApiError::Server { status: 503, .. }));
    assert_eq!(transport.calls_to("models/1"), 4);
    // 2s + 4s + 8s
    assert_eq!(started.elapsed().as_secs(), 14);
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let transport = Arc::new(RoutedTransport::new());
    let client = client_with(transport.clone(), |s| s.executor.max_retries = 5);

    let err = client.get_model(99, false).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn test_circuit_opens_per_endpoint() {
    let transport = Arc::new(
        RoutedTransport::new().json("model-versions/7", version_json(7, 1, 1)),
    );
    let client = client_with(transport.clone(), |s| {
        s.executor.max_retries = 0;
        s.failure_threshold = 2;
    });

    // Two 404s on `models` trip that endpoint's circuit
    assert!(client.get_model(1, false).await.is_err());
    assert!(client.get_model(2, false).await.is_err());

    let err = client.get_model(3, false).await.unwrap_err();
    assert!(matches!(err, ApiError::CircuitOpen { ref endpoint } if endpoint == "models"));
    assert!(err.is_expected());
    assert_eq!(transport.call_count(), 2);

    // Other endpoints are unaffected
    let version = client.get_model_version(7, false).await.unwrap();
    assert_eq!(version.id, 7);
}

#[tokio::test]
async fn test_cache_survives_client_restart() {
    let dir = TempDir::new().unwrap();
    let cache = CacheSettings {
        dir: dir.path().to_path_buf(),
        validity: Duration::from_secs(3600),
        memory_capacity: 16,
    };
    let transport = Arc::new(
        RoutedTransport::new().json("model-versions/by-hash/ABC123", version_json(5, 1, 1)),
    );

    let first = client_with(transport.clone(), |s| s.cache = Some(cache.clone()));
    first.get_model_version_by_hash("ABC123", false).await.unwrap();
    first.get_model_version_by_hash("ABC123", false).await.unwrap();
    assert_eq!(transport.call_count(), 1);

    let second = client_with(transport.clone(), |s| s.cache = Some(cache.clone()));
    let version = second.get_model_version_by_hash("ABC123", false).await.unwrap();
    assert_eq!(version.id, 5);
    assert_eq!(transport.call_count(), 1);

    second.get_model_version_by_hash("ABC123", true).await.unwrap();
    assert_eq!(transport.call_count(), 2);
}
