//! Scripted transport for unit tests

use super::transport::{HttpRequest, HttpResponse, Transport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

type Responder = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync>;

pub(crate) struct MockTransport {
    responder: Responder,
    download: Option<(Vec<u8>, Option<String>)>,
    requests: Mutex<Vec<HttpRequest>>,
    downloads: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new(
        responder: impl Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            download: None,
            requests: Mutex::new(Vec::new()),
            downloads: Mutex::new(Vec::new()),
        }
    }

    /// Every request answers 200 with `body`
    pub fn ok(body: Value) -> Self {
        Self::always(HttpResponse::new(200, body.to_string()))
    }

    pub fn always(response: HttpResponse) -> Self {
        Self::new(move |_| Ok(response.clone()))
    }

    pub fn failing(error: impl Fn() -> TransportError + Send + Sync + 'static) -> Self {
        Self::new(move |_| Err(error()))
    }

    /// Replies in order; once exhausted every request gets a 500
    pub fn sequence(replies: Vec<Result<HttpResponse, TransportError>>) -> Self {
        let replies = Mutex::new(VecDeque::from(replies));
        Self::new(move |_| {
            replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(HttpResponse::new(500, "script exhausted")))
        })
    }

    pub fn with_download(mut self, body: Vec<u8>, content_type: Option<&str>) -> Self {
        self.download = Some((body, content_type.map(str::to_string)));
        self
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Requests whose URL contains `fragment`
    pub fn calls_matching(&self, fragment: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url.contains(fragment))
            .count()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn download_count(&self) -> usize {
        self.downloads.lock().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let reply = (self.responder)(&request);
        self.requests.lock().push(request);
        reply
    }

    async fn download(
        &self,
        url: &str,
        dest: &Path,
        _timeout: Duration,
    ) -> Result<Option<String>, TransportError> {
        self.downloads.lock().push(url.to_string());

        let Some((body, content_type)) = &self.download else {
            return Err(TransportError::Status(404));
        };

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, body).await?;
        Ok(content_type.clone())
    }
}
