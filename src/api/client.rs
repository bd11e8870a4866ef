//! Registry API client
//!
//! [`ApiClient`] owns one rate limiter, one circuit breaker and one response
//! cache. Clone the surrounding `Arc` to share it across workers; never build
//! a second client for the same registry in one run, or the two would throttle
//! independently.

use super::circuit_breaker::CircuitBreaker;
use super::executor::{DownloadOutcome, ExecutorSettings, RequestExecutor};
use super::models::{
    ImageSearchResult, Model, ModelVersion, ParentModelWithVersions, SearchQuery, SearchResult,
};
use super::rate_limiter::{RateLimiter, RateWindow};
use super::transport::Transport;
use crate::cache::ResponseCache;
use crate::error::{ApiError, ApiResult};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Response cache placement
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub dir: PathBuf,
    pub validity: Duration,
    pub memory_capacity: usize,
}

/// Everything needed to assemble an [`ApiClient`]
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub executor: ExecutorSettings,
    pub rate_limit: u32,
    pub rate_window: RateWindow,
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    /// `None` disables response caching
    pub cache: Option<CacheSettings>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            executor: ExecutorSettings::default(),
            rate_limit: 100,
            rate_window: RateWindow::PerMinute,
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            cache: None,
        }
    }
}

/// Filters for `GET images`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageQuery {
    pub model_id: Option<u64>,
    pub model_version_id: Option<u64>,
    pub limit: u32,
    pub page: u32,
}

impl Default for ImageQuery {
    fn default() -> Self {
        Self {
            model_id: None,
            model_version_id: None,
            limit: 100,
            page: 1,
        }
    }
}

impl ImageQuery {
    fn to_params(&self) -> Value {
        let mut params = json!({"limit": self.limit, "page": self.page});
        if let Some(id) = self.model_id {
            params["modelId"] = id.into();
        }
        if let Some(id) = self.model_version_id {
            params["modelVersionId"] = id.into();
        }
        params
    }
}

/// Decode a registry body into its typed form
///
/// A 2xx body that does not match the expected shape is reported as a
/// network error: the registry answered, but not with anything usable.
fn parse<T: DeserializeOwned>(endpoint: &str, value: Value) -> ApiResult<T> {
    serde_json::from_value(value)
        .map_err(|e| ApiError::Network(format!("unexpected response from {endpoint}: {e}")))
}

/// Client aggregate shared by every worker of a run
pub struct ApiClient {
    executor: RequestExecutor,
}

impl ApiClient {
    pub fn new(settings: ClientSettings, transport: Arc<dyn Transport>) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(settings.rate_limit, settings.rate_window));
        let circuit_breaker = Arc::new(CircuitBreaker::new(
            settings.failure_threshold,
            settings.reset_timeout,
        ));
        let cache = settings.cache.map(|c| {
            Arc::new(ResponseCache::new(c.dir, c.validity, c.memory_capacity))
        });

        tracing::info!(
            base_url = %settings.executor.base_url,
            rate_limit = settings.rate_limit,
            rate_window = ?settings.rate_window,
            caching = cache.is_some(),
            "Created API client"
        );

        Self {
            executor: RequestExecutor::new(
                settings.executor,
                transport,
                rate_limiter,
                circuit_breaker,
                cache,
            ),
        }
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    pub fn cache(&self) -> Option<&Arc<ResponseCache>> {
        self.executor.cache()
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        self.executor.circuit_breaker()
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        self.executor.rate_limiter()
    }

    pub async fn get_model(&self, model_id: u64, force_refresh: bool) -> ApiResult<Model> {
        let endpoint = format!("models/{model_id}");
        let value = self
            .executor
            .get(&endpoint, &Value::Null, force_refresh)
            .await?;
        parse(&endpoint, value)
    }

    pub async fn get_model_version(
        &self,
        version_id: u64,
        force_refresh: bool,
    ) -> ApiResult<ModelVersion> {
        let endpoint = format!("model-versions/{version_id}");
        let value = self
            .executor
            .get(&endpoint, &Value::Null, force_refresh)
            .await?;
        parse(&endpoint, value)
    }

    /// Resolve a local file's content hash to its registry version
    pub async fn get_model_version_by_hash(
        &self,
        hash: &str,
        force_refresh: bool,
    ) -> ApiResult<ModelVersion> {
        let endpoint = format!("model-versions/by-hash/{}", urlencoding::encode(hash));
        let value = self
            .executor
            .get(&endpoint, &Value::Null, force_refresh)
            .await?;
        parse(&endpoint, value)
    }

    pub async fn search_models(
        &self,
        query: &SearchQuery,
        force_refresh: bool,
    ) -> ApiResult<SearchResult> {
        let value = self
            .executor
            .get("models", &query.to_params(), force_refresh)
            .await?;
        parse("models", value)
    }

    /// First model whose files match `hash`, if any
    pub async fn get_model_by_hash(
        &self,
        hash: &str,
        force_refresh: bool,
    ) -> ApiResult<Option<Model>> {
        let params = json!({"hashes[]": hash});
        let value = self.executor.get("models", &params, force_refresh).await?;
        let result: SearchResult = parse("models", value)?;
        Ok(result.items.into_iter().next())
    }

    pub async fn get_images(
        &self,
        query: &ImageQuery,
        force_refresh: bool,
    ) -> ApiResult<ImageSearchResult> {
        let value = self
            .executor
            .get("images", &query.to_params(), force_refresh)
            .await?;
        parse("images", value)
    }

    /// Parent model summary plus every version, flagged against `current_version_id`
    pub async fn get_parent_model_with_versions(
        &self,
        model_id: u64,
        current_version_id: u64,
        force_refresh: bool,
    ) -> ApiResult<ParentModelWithVersions> {
        let model = self.get_model(model_id, force_refresh).await?;
        tracing::debug!(
            model_id,
            versions = model.model_versions.len(),
            "Fetched parent model"
        );
        Ok(ParentModelWithVersions::from_model(&model, current_version_id))
    }

    /// Download a preview image; the content type lets callers spot videos
    pub async fn download_image(&self, url: &str, dest: &Path) -> DownloadOutcome {
        self.executor.download(url, dest).await
    }

    /// Download the primary file of a model version
    pub async fn download_model(&self, version_id: u64, dest: &Path) -> bool {
        let version = match self.get_model_version(version_id, false).await {
            Ok(version) => version,
            Err(e) => {
                tracing::error!(version_id, error = %e, "Failed to look up model version for download");
                return false;
            }
        };

        let Some(url) = version
            .download_url
            .as_deref()
            .or_else(|| version.primary_file().and_then(|f| f.download_url.as_deref()))
        else {
            tracing::warn!(version_id, "Model version has no download URL");
            return false;
        };

        self.executor.download(url, dest).await.success
    }
}
