//! Shared fixtures for integration tests: a routed in-memory transport

#![allow(dead_code)]

use async_trait::async_trait;
use model_scout::api::{
    ApiClient, ClientSettings, ExecutorSettings, HttpRequest, HttpResponse, RateWindow,
    Transport, TransportError,
};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const BASE_URL: &str = "https://registry.test/api/v1";

/// Transport answering from per-path scripts
///
/// A route is matched when the request URL ends with its path. Each route
/// replays its queue and then repeats the last reply; unrouted requests get
/// a 404.
#[derive(Default)]
pub struct RoutedTransport {
    routes: Mutex<HashMap<String, VecDeque<HttpResponse>>>,
    requests: Mutex<Vec<HttpRequest>>,
    downloads: Mutex<Vec<String>>,
    download_content_type: Option<String>,
}

impl RoutedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_downloads(mut self, content_type: &str) -> Self {
        self.download_content_type = Some(content_type.to_string());
        self
    }

    pub fn route(self, path: &str, replies: Vec<HttpResponse>) -> Self {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), replies.into());
        self
    }

    pub fn json(self, path: &str, body: Value) -> Self {
        self.route(path, vec![HttpResponse::new(200, body.to_string())])
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.ends_with(path))
            .count()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn download_count(&self) -> usize {
        self.downloads.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for RoutedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let reply = {
            let mut routes = self.routes.lock().unwrap();
            match routes.iter_mut().find(|(path, _)| request.url.ends_with(path.as_str())) {
                Some((_, queue)) if queue.len() > 1 => queue.pop_front().unwrap(),
                Some((_, queue)) => queue.front().cloned().unwrap_or_default(),
                None => HttpResponse::new(404, r#"{"error":"not found"}"#),
            }
        };
        self.requests.lock().unwrap().push(request);
        Ok(reply)
    }

    async fn download(
        &self,
        url: &str,
        dest: &Path,
        _timeout: Duration,
    ) -> Result<Option<String>, TransportError> {
        self.downloads.lock().unwrap().push(url.to_string());
        let Some(content_type) = &self.download_content_type else {
            return Err(TransportError::Status(404));
        };
        tokio::fs::write(dest, url.as_bytes()).await?;
        Ok(Some(content_type.clone()))
    }
}

/// Client with a generous rate limit and fast retries
pub fn client(transport: Arc<RoutedTransport>) -> Arc<ApiClient> {
    client_with(transport, |_| {})
}

pub fn client_with(
    transport: Arc<RoutedTransport>,
    tweak: impl FnOnce(&mut ClientSettings),
) -> Arc<ApiClient> {
    let mut settings = ClientSettings {
        executor: ExecutorSettings {
            base_url: BASE_URL.to_string(),
            base_retry_delay: Duration::from_millis(1),
            ..Default::default()
        },
        rate_limit: 10_000,
        rate_window: RateWindow::PerSecond,
        failure_threshold: 1_000,
        ..Default::default()
    };
    tweak(&mut settings);
    Arc::new(ApiClient::new(settings, transport))
}

/// Registry version body with `images` preview URLs
pub fn version_json(id: u64, model_id: u64, images: usize) -> Value {
    let images: Vec<Value> = (0..images)
        .map(|i| json!({"url": format!("https://cdn.test/{id}/{i}.png")}))
        .collect();
    json!({
        "id": id,
        "name": format!("v{id}"),
        "modelId": model_id,
        "baseModel": "SDXL 1.0",
        "images": images,
    })
}

/// Registry model body with the given version ids
pub fn model_json(id: u64, version_ids: &[u64]) -> Value {
    let versions: Vec<Value> = version_ids
        .iter()
        .map(|v| json!({"id": v, "name": format!("v{v}"), "baseModel": "SDXL 1.0"}))
        .collect();
    json!({
        "id": id,
        "name": format!("model {id}"),
        "type": "LORA",
        "nsfw": false,
        "tags": ["style"],
        "creator": {"username": "maker"},
        "modelVersions": versions,
    })
}
