//! Request executor
//!
//! Every registry call runs through the same sequence:
//!
//! ```text
//! circuit check ─open──────────────────────────────▶ Err(CircuitOpen)
//!      │
//! cache check (GET, no force refresh) ─hit─────────▶ Ok(cached)
//!      │
//! ┌─▶ rate limiter (one token per send)
//! │   send
//! │    ├─ 2xx ─────── record_success, cache GET body ▶ Ok(body)
//! │    ├─ 4xx ─────── record_failure ────────────────▶ Err(Client)
//! │    └─ 429 / 5xx / transport / bad body
//! │         record_failure
//! │         retries left? ──no──────────────────────▶ Err(RateLimited | Server | Network)
//! └──────── sleep (Retry-After or base * 2^attempt)
//! ```
//!
//! Retryable conditions never leave this module; callers only see the five
//! terminal [`ApiError`] kinds.

use super::circuit_breaker::CircuitBreaker;
use super::rate_limiter::RateLimiter;
use super::transport::{HttpRequest, HttpResponse, Method, Transport, query_pairs};
use crate::cache::{ResponseCache, cache_key};
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Wait applied to a 429 without a usable `Retry-After` header
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 1;

/// Retry and timeout settings
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub base_retry_delay: Duration,
    /// Downloads are logged and reported successful without touching the network
    pub dry_run: bool,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            base_url: "https://civitai.com/api/v1".to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            base_retry_delay: Duration::from_secs(2),
            dry_run: false,
        }
    }
}

/// Result of a binary download; failures are reported, never raised
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub success: bool,
    pub content_type: Option<String>,
}

impl DownloadOutcome {
    fn failed() -> Self {
        Self::default()
    }

    /// Whether the server labelled the payload as video
    pub fn is_video(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("video/"))
    }
}

/// A failure worth another attempt
#[derive(Debug)]
enum Retryable {
    RateLimited { retry_after: u64 },
    Server { status: u16, message: String },
    Network(String),
}

impl Retryable {
    fn delay(&self, base: Duration, attempt: u32) -> Duration {
        match self {
            Self::RateLimited { retry_after } => Duration::from_secs(*retry_after),
            Self::Server { .. } | Self::Network(_) => {
                base.saturating_mul(2u32.saturating_pow(attempt))
            }
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Server { .. } => "server_error",
            Self::Network(_) => "network_error",
        }
    }

    fn into_error(self) -> ApiError {
        match self {
            Self::RateLimited { retry_after } => ApiError::RateLimited { retry_after },
            Self::Server { status, message } => ApiError::Server { status, message },
            Self::Network(message) => ApiError::Network(message),
        }
    }
}

/// Outcome of a single send
enum Attempt {
    Success(Value),
    Retry(Retryable),
    Terminal(ApiError),
}

/// Runs requests through breaker, cache, limiter and retry policy
pub struct RequestExecutor {
    settings: ExecutorSettings,
    transport: Arc<dyn Transport>,
    rate_limiter: Arc<RateLimiter>,
    circuit_breaker: Arc<CircuitBreaker>,
    cache: Option<Arc<ResponseCache>>,
}

impl RequestExecutor {
    pub fn new(
        settings: ExecutorSettings,
        transport: Arc<dyn Transport>,
        rate_limiter: Arc<RateLimiter>,
        circuit_breaker: Arc<CircuitBreaker>,
        cache: Option<Arc<ResponseCache>>,
    ) -> Self {
        let settings = ExecutorSettings {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            ..settings
        };

        tracing::debug!(base_url = %settings.base_url, "Initialized request executor");

        Self {
            settings,
            transport,
            rate_limiter,
            circuit_breaker,
            cache,
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    pub fn cache(&self) -> Option<&Arc<ResponseCache>> {
        self.cache.as_ref()
    }

    /// Absolute URL for an endpoint path (absolute URLs pass through)
    pub fn full_url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }
        format!(
            "{}/{}",
            self.settings.base_url,
            endpoint.trim_start_matches('/')
        )
    }

    /// Breaker identity of a URL: its first path segment below the base URL
    pub fn endpoint_name(&self, url: &str) -> String {
        let path = match url.strip_prefix(&self.settings.base_url) {
            Some(rest) => rest,
            None => url
                .split_once("://")
                .and_then(|(_, rest)| rest.split_once('/'))
                .map(|(_, path)| path)
                .unwrap_or(""),
        };

        path.split(['?', '#'])
            .next()
            .unwrap_or("")
            .trim_matches('/')
            .split('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .unwrap_or("unknown")
            .to_string()
    }

    /// Execute a request with caching, circuit breaking, rate limiting and retries
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: &Value,
        body: Option<&Value>,
        force_refresh: bool,
    ) -> ApiResult<Value> {
        let url = self.full_url(endpoint);
        let endpoint_name = self.endpoint_name(&url);

        if self.circuit_breaker.is_open(&endpoint_name) {
            tracing::warn!(endpoint = %endpoint_name, url = %url, "Circuit open, request suppressed");
            metrics::record_request(&endpoint_name, "circuit_open");
            return Err(ApiError::CircuitOpen {
                endpoint: endpoint_name,
            });
        }

        let key = cache_key(
            method.as_str(),
            &url,
            params,
            body.unwrap_or(&Value::Null),
        );
        let cacheable = method == Method::Get;

        if cacheable
            && !force_refresh
            && let Some(cache) = &self.cache
            && let Some(cached) = cache.get(&key).await
        {
            tracing::debug!(url = %url, "Cache hit");
            metrics::record_cache_hit(&endpoint_name);
            return Ok(cached);
        }

        let request = HttpRequest {
            method,
            url: url.clone(),
            query: query_pairs(params),
            body: body.cloned(),
            timeout: self.settings.timeout,
        };

        let mut attempt: u32 = 0;
        loop {
            self.rate_limiter.acquire_one().await;

            match self.send_once(request.clone()).await {
                Attempt::Success(value) => {
                    self.circuit_breaker.record_success(&endpoint_name);
                    metrics::record_request(&endpoint_name, "success");

                    if cacheable && let Some(cache) = &self.cache {
                        cache.set(&key, &value).await;
                    }
                    return Ok(value);
                }
                Attempt::Terminal(err) => {
                    self.circuit_breaker.record_failure(&endpoint_name);
                    metrics::record_request(&endpoint_name, err.kind());
                    tracing::debug!(
                        endpoint = %endpoint_name,
                        url = %url,
                        error = %err,
                        "Request failed without retry"
                    );
                    return Err(err);
                }
                Attempt::Retry(retryable) => {
                    self.circuit_breaker.record_failure(&endpoint_name);

                    if attempt >= self.settings.max_retries {
                        let err = retryable.into_error();
                        metrics::record_request(&endpoint_name, err.kind());
                        tracing::warn!(
                            endpoint = %endpoint_name,
                            url = %url,
                            attempts = attempt + 1,
                            error = %err,
                            "Retries exhausted"
                        );
                        return Err(err);
                    }

                    let delay = retryable.delay(self.settings.base_retry_delay, attempt);
                    metrics::record_retry(retryable.reason());
                    tracing::warn!(
                        endpoint = %endpoint_name,
                        url = %url,
                        attempt,
                        reason = retryable.reason(),
                        delay_ms = delay.as_millis() as u64,
                        "Retrying request"
                    );

                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Send once and classify the outcome
    async fn send_once(&self, request: HttpRequest) -> Attempt {
        let response = match self.transport.send(request).await {
            Ok(response) => response,
            Err(e) => return Attempt::Retry(Retryable::Network(e.to_string())),
        };

        classify(response)
    }

    pub async fn get(&self, endpoint: &str, params: &Value, force_refresh: bool) -> ApiResult<Value> {
        self.request(Method::Get, endpoint, params, None, force_refresh)
            .await
    }

    pub async fn post(&self, endpoint: &str, body: &Value) -> ApiResult<Value> {
        self.request(Method::Post, endpoint, &Value::Null, Some(body), false)
            .await
    }

    pub async fn put(&self, endpoint: &str, body: &Value) -> ApiResult<Value> {
        self.request(Method::Put, endpoint, &Value::Null, Some(body), false)
            .await
    }

    pub async fn delete(&self, endpoint: &str) -> ApiResult<Value> {
        self.request(Method::Delete, endpoint, &Value::Null, None, false)
            .await
    }

    /// Download a binary payload to `dest`
    ///
    /// Rate limited, but bypasses the cache and circuit breaker. Failures are
    /// logged and reported through the returned flag.
    pub async fn download(&self, url: &str, dest: &Path) -> DownloadOutcome {
        if self.settings.dry_run {
            tracing::info!(url = %url, dest = ?dest, "Dry run: would download file");
            return DownloadOutcome {
                success: true,
                content_type: None,
            };
        }

        self.rate_limiter.acquire_one().await;

        match self
            .transport
            .download(url, dest, self.settings.timeout)
            .await
        {
            Ok(content_type) => {
                tracing::debug!(url = %url, content_type = ?content_type, "Downloaded file");
                metrics::record_download(true);
                DownloadOutcome {
                    success: true,
                    content_type,
                }
            }
            Err(e) => {
                tracing::error!(url = %url, dest = ?dest, error = %e, "Error downloading file");
                metrics::record_download(false);
                DownloadOutcome::failed()
            }
        }
    }
}

fn classify(response: HttpResponse) -> Attempt {
    let status = response.status;

    if status == 429 {
        let retry_after = response
            .header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
        return Attempt::Retry(Retryable::RateLimited { retry_after });
    }

    if status >= 500 {
        return Attempt::Retry(Retryable::Server {
            status,
            message: response.text(),
        });
    }

    if status >= 400 {
        return Attempt::Terminal(ApiError::client(status, response.text()));
    }

    if response.body.iter().all(u8::is_ascii_whitespace) {
        return Attempt::Success(Value::Null);
    }

    match serde_json::from_slice::<Value>(&response.body) {
        Ok(value) => Attempt::Success(value),
        Err(e) => Attempt::Retry(Retryable::Network(format!("malformed response body: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockTransport;
    use crate::api::rate_limiter::RateWindow;
    use crate::api::transport::TransportError;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::time::Instant;

    const BASE: &str = "https://registry.test/api/v1";

    fn executor(
        transport: Arc<MockTransport>,
        max_retries: u32,
        cache: Option<Arc<ResponseCache>>,
    ) -> RequestExecutor {
        RequestExecutor::new(
            ExecutorSettings {
                base_url: BASE.to_string(),
                timeout: Duration::from_secs(5),
                max_retries,
                base_retry_delay: Duration::from_secs(2),
                dry_run: false,
            },
            transport,
            Arc::new(RateLimiter::new(1000, RateWindow::PerSecond)),
            Arc::new(CircuitBreaker::new(100, Duration::from_secs(60))),
            cache,
        )
    }

    #[test]
    fn test_endpoint_name_is_first_segment() {
        let exec = executor(Arc::new(MockTransport::ok(json!({}))), 0, None);
        assert_eq!(
            exec.endpoint_name(&exec.full_url("model-versions/by-hash/ABC")),
            "model-versions"
        );
        assert_eq!(exec.endpoint_name(&exec.full_url("/models")), "models");
        assert_eq!(exec.endpoint_name(&format!("{BASE}/images?limit=1")), "images");
        assert_eq!(exec.endpoint_name(BASE), "unknown");
        assert_eq!(
            exec.endpoint_name("https://other.host/files/1.png"),
            "files"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_returns_body() {
        let transport = Arc::new(MockTransport::ok(json!({"id": 7})));
        let exec = executor(transport.clone(), 3, None);

        let value = exec.get("models/7", &Value::Null, false).await.unwrap();
        assert_eq!(value, json!({"id": 7}));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_then_200_retries_once_after_retry_after() {
        let breaker = Arc::new(CircuitBreaker::new(100, Duration::from_secs(60)));
        // Breaker count seen by the transport when the retry arrives
        let seen_on_retry = Arc::new(parking_lot::Mutex::new(None));

        let transport = {
            let breaker = breaker.clone();
            let seen_on_retry = seen_on_retry.clone();
            let calls = std::sync::atomic::AtomicUsize::new(0);
            Arc::new(MockTransport::new(move |_| {
                if calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                    return Ok(HttpResponse::new(429, "").with_header("Retry-After", "3"));
                }
                *seen_on_retry.lock() = Some(breaker.failure_count("models"));
                Ok(HttpResponse::new(200, r#"{"ok":true}"#))
            }))
        };
        let exec = RequestExecutor::new(
            ExecutorSettings {
                base_url: BASE.to_string(),
                max_retries: 3,
                base_retry_delay: Duration::from_secs(2),
                ..Default::default()
            },
            transport.clone(),
            Arc::new(RateLimiter::new(1000, RateWindow::PerSecond)),
            breaker.clone(),
            None,
        );

        let start = Instant::now();
        let value = exec.get("models/1", &Value::Null, false).await.unwrap();

        assert_eq!(value, json!({"ok": true}));
        assert_eq!(transport.call_count(), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(*seen_on_retry.lock(), Some(1));
        assert_eq!(breaker.failure_count("models"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_429_surfaces_rate_limited() {
        let transport = Arc::new(MockTransport::sequence(vec![
            Ok(HttpResponse::new(429, "")),
            Ok(HttpResponse::new(429, "")),
            Ok(HttpResponse::new(200, "{}")),
        ]));
        let exec = RequestExecutor::new(
            ExecutorSettings {
                base_url: BASE.to_string(),
                max_retries: 1,
                ..Default::default()
            },
            transport,
            Arc::new(RateLimiter::new(1000, RateWindow::PerSecond)),
            Arc::new(CircuitBreaker::new(100, Duration::from_secs(60))),
            None,
        );

        let err = exec.get("models", &Value::Null, false).await.unwrap_err();
        assert_eq!(
            err,
            ApiError::RateLimited {
                retry_after: DEFAULT_RETRY_AFTER_SECS
            }
        );
        assert_eq!(exec.circuit_breaker().failure_count("models"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_503_backs_off_exponentially() {
        let transport = Arc::new(MockTransport::always(HttpResponse::new(503, "down")));
        let exec = executor(transport.clone(), 3, None);

        let start = Instant::now();
        let err = exec.get("models/1", &Value::Null, false).await.unwrap_err();

        assert_eq!(err, ApiError::server(503, "down"));
        // 2s + 4s + 8s between the four sends
        assert_eq!(start.elapsed(), Duration::from_secs(14));
        assert_eq!(transport.call_count(), 4);
        assert_eq!(exec.circuit_breaker().failure_count("models"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_is_not_retried() {
        let transport = Arc::new(MockTransport::always(HttpResponse::new(404, "not found")));
        let exec = executor(transport.clone(), 3, None);

        let err = exec.get("models/404", &Value::Null, false).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(transport.call_count(), 1);
        assert_eq!(exec.circuit_breaker().failure_count("models"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_becomes_network_error() {
        let transport = Arc::new(MockTransport::failing(|| {
            TransportError::Timeout("deadline elapsed".to_string())
        }));
        let exec = executor(transport.clone(), 2, None);

        let start = Instant::now();
        let err = exec.get("images", &Value::Null, false).await.unwrap_err();

        assert!(matches!(err, ApiError::Network(ref msg) if msg.contains("deadline elapsed")));
        assert_eq!(transport.call_count(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_body_is_retried() {
        let transport = Arc::new(MockTransport::sequence(vec![
            Ok(HttpResponse::new(200, "<html>")),
            Ok(HttpResponse::new(200, r#"{"id":1}"#)),
        ]));
        let exec = executor(transport.clone(), 3, None);

        let value = exec.get("models/1", &Value::Null, false).await.unwrap();
        assert_eq!(value, json!({"id": 1}));
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_short_circuits() {
        let transport = Arc::new(MockTransport::ok(json!({})));
        let exec = RequestExecutor::new(
            ExecutorSettings {
                base_url: BASE.to_string(),
                ..Default::default()
            },
            transport.clone(),
            Arc::new(RateLimiter::new(1000, RateWindow::PerSecond)),
            Arc::new(CircuitBreaker::new(1, Duration::from_secs(60))),
            None,
        );
        exec.circuit_breaker().record_failure("models");

        let err = exec.get("models/1", &Value::Null, false).await.unwrap_err();
        assert_eq!(
            err,
            ApiError::CircuitOpen {
                endpoint: "models".to_string()
            }
        );
        assert_eq!(transport.call_count(), 0);

        // Other endpoints are unaffected
        assert!(exec.get("images", &Value::Null, false).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_is_cached_and_force_refresh_bypasses() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(ResponseCache::new(dir.path(), Duration::from_secs(3600), 16));
        let transport = Arc::new(MockTransport::ok(json!({"id": 1})));
        let exec = executor(transport.clone(), 0, Some(cache.clone()));

        let params = json!({"limit": 1});
        exec.get("models", &params, false).await.unwrap();
        exec.get("models", &params, false).await.unwrap();
        assert_eq!(transport.call_count(), 1);
        assert_eq!(cache.item_count().await, 1);

        exec.get("models", &params, true).await.unwrap();
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_consumes_no_token() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(ResponseCache::new(dir.path(), Duration::from_secs(3600), 16));
        let transport = Arc::new(MockTransport::ok(json!([])));
        let exec = executor(transport, 0, Some(cache));

        exec.get("images", &Value::Null, false).await.unwrap();
        let tokens = exec.rate_limiter().tokens().await;
        exec.get("images", &Value::Null, false).await.unwrap();
        assert_eq!(exec.rate_limiter().tokens().await, tokens);
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_is_never_cached() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(ResponseCache::new(dir.path(), Duration::from_secs(3600), 16));
        let transport = Arc::new(MockTransport::ok(json!({"created": true})));
        let exec = executor(transport.clone(), 0, Some(cache.clone()));

        exec.post("models", &json!({"name": "x"})).await.unwrap();
        exec.post("models", &json!({"name": "x"})).await.unwrap();
        assert_eq!(transport.call_count(), 2);
        assert_eq!(cache.item_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_success_body_is_null() {
        let transport = Arc::new(MockTransport::always(HttpResponse::new(204, "")));
        let exec = executor(transport, 0, None);
        assert_eq!(exec.delete("models/1").await.unwrap(), Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_reports_content_type() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::ok(json!({})).with_download(
            b"fake video".to_vec(),
            Some("video/mp4"),
        ));
        let exec = executor(transport, 0, None);

        let dest = dir.path().join("model.preview0.jpeg");
        let outcome = exec.download("https://cdn.test/1.jpeg", &dest).await;

        assert!(outcome.success);
        assert!(outcome.is_video());
        assert_eq!(std::fs::read(&dest).unwrap(), b"fake video");
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_failure_is_flagged() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::ok(json!({})));
        let exec = executor(transport, 0, None);

        let outcome = exec
            .download("https://cdn.test/missing.png", &dir.path().join("x.png"))
            .await;
        assert_eq!(outcome, DownloadOutcome::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_download_skips_network() {
        let transport = Arc::new(MockTransport::ok(json!({})));
        let exec = RequestExecutor::new(
            ExecutorSettings {
                base_url: BASE.to_string(),
                dry_run: true,
                ..Default::default()
            },
            transport.clone(),
            Arc::new(RateLimiter::new(1, RateWindow::PerSecond)),
            Arc::new(CircuitBreaker::new(5, Duration::from_secs(60))),
            None,
        );

        let outcome = exec
            .download("https://cdn.test/1.png", Path::new("/nonexistent/1.png"))
            .await;
        assert!(outcome.success);
        assert_eq!(transport.download_count(), 0);
    }
}
