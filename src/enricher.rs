//! Parent model enrichment
//!
//! Many local files usually belong to a handful of parent models. Enrichment
//! groups files by parent id, fetches each parent once, and copies the parent
//! summary and sibling version list onto every file that shares it.
//!
//! Parents that fail to resolve (typically deleted models answering 404) are
//! remembered twice: in memory for the current run, and on disk under
//! `{cache_dir}/failed_models` for a week, so later runs skip them too.

use crate::api::ApiClient;
use crate::api::models::{ModelVersion, ParentModelWithVersions};
use crate::cache::DiskCache;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a failed parent lookup is remembered across runs
pub const FAILED_MODEL_CACHE_VALIDITY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Upper bound on concurrent parent fetches
pub const MAX_ENRICH_CONCURRENCY: usize = 8;

const FAILED_MODELS_DIR: &str = "failed_models";

fn failed_key(model_id: u64) -> String {
    format!("failed_model_{model_id}")
}

/// Counters from one [`VersionEnricher::enrich_batch`] call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichStats {
    pub already_enriched: usize,
    pub unique_parents: usize,
    pub fetched: usize,
    pub failed: usize,
    pub skipped: usize,
    pub enriched: usize,
    /// Files that gained parent data in this call, sorted
    pub enriched_paths: Vec<PathBuf>,
}

pub struct VersionEnricher {
    client: Arc<ApiClient>,
    failed_cache: DiskCache,
    run_failed: Mutex<HashSet<u64>>,
}

impl VersionEnricher {
    pub fn new(client: Arc<ApiClient>, cache_dir: &Path) -> Self {
        Self {
            client,
            failed_cache: DiskCache::new(cache_dir.join(FAILED_MODELS_DIR), FAILED_MODEL_CACHE_VALIDITY),
            run_failed: Mutex::new(HashSet::new()),
        }
    }

    /// Whether `model_id` failed earlier in this run or within the last week
    pub async fn is_known_failed(&self, model_id: u64) -> bool {
        if self.run_failed.lock().contains(&model_id) {
            return true;
        }
        matches!(
            self.failed_cache.get(&failed_key(model_id)).await,
            Some(Value::Bool(true))
        )
    }

    async fn mark_failed(&self, model_id: u64) {
        let count = {
            let mut failed = self.run_failed.lock();
            failed.insert(model_id);
            failed.len()
        };
        crate::metrics::update_known_failed_models(count);
        self.failed_cache
            .set(&failed_key(model_id), &Value::Bool(true))
            .await;
    }

    /// Record a failed parent lookup unless the failure was transient by nature
    async fn handle_failure(&self, model_id: u64, error: &crate::error::ApiError) -> bool {
        if error.is_expected() {
            tracing::warn!(model_id, error = %error, "Parent model lookup deferred");
            return false;
        }
        tracing::debug!(model_id, error = %error, "Parent model lookup failed, caching as failed");
        self.mark_failed(model_id).await;
        true
    }

    /// Enrich every version in `items` with its parent model and siblings
    ///
    /// Each distinct parent id is fetched at most once, with up to
    /// [`MAX_ENRICH_CONCURRENCY`] fetches in flight. Versions that already
    /// carry siblings are left alone.
    pub async fn enrich_batch(
        &self,
        items: &mut HashMap<PathBuf, ModelVersion>,
        force_refresh: bool,
    ) -> EnrichStats {
        let mut stats = EnrichStats::default();
        if items.is_empty() {
            return stats;
        }

        self.run_failed.lock().clear();

        let mut files_by_parent: BTreeMap<u64, Vec<PathBuf>> = BTreeMap::new();
        for (path, version) in items.iter() {
            if version.is_enriched() {
                stats.already_enriched += 1;
                continue;
            }
            match version.model_id {
                Some(model_id) => files_by_parent.entry(model_id).or_default().push(path.clone()),
                None => tracing::debug!(file = ?path, "No parent model id, skipping enrichment"),
            }
        }

        stats.unique_parents = files_by_parent.len();
        if files_by_parent.is_empty() {
            if stats.already_enriched > 0 {
                tracing::info!(files = stats.already_enriched, "All files already enriched");
            }
            return stats;
        }

        let files_to_enrich: usize = files_by_parent.values().map(Vec::len).sum();
        tracing::info!(
            files = files_to_enrich,
            parents = stats.unique_parents,
            already_enriched = stats.already_enriched,
            "Enriching files with parent model data"
        );

        let mut to_fetch = Vec::new();
        for &model_id in files_by_parent.keys() {
            if self.is_known_failed(model_id).await {
                stats.skipped += 1;
            } else {
                to_fetch.push(model_id);
            }
        }
        if stats.skipped > 0 {
            tracing::warn!(skipped = stats.skipped, "Skipping parents with known failed lookups");
        }

        let started = Instant::now();
        let concurrency = to_fetch.len().clamp(1, MAX_ENRICH_CONCURRENCY);
        let client = &self.client;
        let outcomes: Vec<_> = stream::iter(to_fetch)
            .map(|model_id| async move {
                let result = client
                    .get_parent_model_with_versions(model_id, 0, force_refresh)
                    .await;
                (model_id, result)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut parents: HashMap<u64, ParentModelWithVersions> = HashMap::new();
        for (model_id, result) in outcomes {
            match result {
                Ok(parent) => {
                    tracing::debug!(
                        model_id,
                        versions = parent.sibling_versions.len(),
                        "Fetched parent model"
                    );
                    parents.insert(model_id, parent);
                    stats.fetched += 1;
                }
                Err(e) => {
                    self.handle_failure(model_id, &e).await;
                    stats.failed += 1;
                }
            }
        }

        tracing::info!(
            fetched = stats.fetched,
            failed = stats.failed,
            skipped = stats.skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Finished fetching parent models"
        );

        for (model_id, paths) in &files_by_parent {
            let Some(parent) = parents.get(model_id) else {
                continue;
            };
            for path in paths {
                if let Some(version) = items.get_mut(path) {
                    version.parent_model = Some(parent.parent_model.clone());
                    version.sibling_versions = parent.siblings_for(version.id);
                    stats.enriched_paths.push(path.clone());
                }
            }
        }
        stats.enriched_paths.sort();
        stats.enriched = stats.enriched_paths.len();

        tracing::info!(
            enriched = stats.enriched,
            files = files_to_enrich,
            api_calls = stats.fetched + stats.failed,
            "Enriched files with parent model data"
        );

        stats
    }

    /// Enrich one version; returns whether siblings were attached
    pub async fn enrich_single(&self, version: &mut ModelVersion, force_refresh: bool) -> bool {
        if version.is_enriched() {
            tracing::debug!(version_id = version.id, "Already enriched");
            return false;
        }

        let Some(model_id) = version.model_id else {
            tracing::debug!(version_id = version.id, "No parent model id, skipping enrichment");
            return false;
        };

        if self.is_known_failed(model_id).await {
            tracing::debug!(model_id, "Skipping parent with known failed lookup");
            return false;
        }

        match self
            .client
            .get_parent_model_with_versions(model_id, version.id, force_refresh)
            .await
        {
            Ok(parent) => {
                version.parent_model = Some(parent.parent_model);
                version.sibling_versions = parent.sibling_versions;
                true
            }
            Err(e) => {
                self.handle_failure(model_id, &e).await;
                false
            }
        }
    }

    /// Forget every failed lookup, in memory and on disk
    pub async fn clear_failed_cache(&self) {
        self.run_failed.lock().clear();
        self.failed_cache.clear().await;
        crate::metrics::update_known_failed_models(0);
        tracing::info!("Cleared failed model lookup cache");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockTransport;
    use crate::api::transport::HttpResponse;
    use crate::api::{ClientSettings, ExecutorSettings, RateWindow};
    use serde_json::json;
    use tempfile::TempDir;

    fn client(transport: Arc<MockTransport>) -> Arc<ApiClient> {
        Arc::new(ApiClient::new(
            ClientSettings {
                executor: ExecutorSettings {
                    base_url: "https://registry.test/api/v1".to_string(),
                    max_retries: 0,
                    ..Default::default()
                },
                rate_limit: 1000,
                rate_window: RateWindow::PerSecond,
                failure_threshold: 100,
                ..Default::default()
            },
            transport,
        ))
    }

    /// Model 1 has versions 10 and 11, model 2 has 20 and 21, everything else is gone
    fn registry() -> Arc<MockTransport> {
        Arc::new(MockTransport::new(|req| {
            let body = if req.url.ends_with("/models/1") {
                json!({"id": 1, "name": "One", "type": "LORA",
                       "modelVersions": [{"id": 10, "name": "a"}, {"id": 11, "name": "b"}]})
            } else if req.url.ends_with("/models/2") {
                json!({"id": 2, "name": "Two", "type": "Checkpoint",
                       "modelVersions": [{"id": 20, "name": "a"}, {"id": 21, "name": "b"}]})
            } else {
                return Ok(HttpResponse::new(404, "Model not found"));
            };
            Ok(HttpResponse::new(200, body.to_string()))
        }))
    }

    fn version(id: u64, model_id: u64) -> ModelVersion {
        ModelVersion {
            id,
            name: format!("v{id}"),
            model_id: Some(model_id),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_each_parent_fetched_once() {
        let dir = TempDir::new().unwrap();
        let transport = registry();
        let enricher = VersionEnricher::new(client(transport.clone()), dir.path());

        let mut items: HashMap<PathBuf, ModelVersion> = (0..10)
            .map(|i| {
                let (vid, mid) = if i % 2 == 0 { (10, 1) } else { (21, 2) };
                (PathBuf::from(format!("/m/{i}.safetensors")), version(vid, mid))
            })
            .collect();

        let stats = enricher.enrich_batch(&mut items, false).await;

        assert_eq!(transport.call_count(), 2);
        assert_eq!(stats.unique_parents, 2);
        assert_eq!(stats.fetched, 2);
        assert_eq!(stats.enriched, 10);

        let even = &items[&PathBuf::from("/m/0.safetensors")];
        assert_eq!(even.parent_model.as_ref().map(|p| p.name.as_str()), Some("One"));
        let current: Vec<u64> = even
            .sibling_versions
            .iter()
            .filter(|s| s.is_current)
            .map(|s| s.id)
            .collect();
        assert_eq!(current, vec![10]);

        let odd = &items[&PathBuf::from("/m/1.safetensors")];
        assert!(odd.sibling_versions.iter().any(|s| s.id == 21 && s.is_current));
    }

    #[tokio::test]
    async fn test_known_failed_parent_is_not_fetched() {
        let dir = TempDir::new().unwrap();
        let transport = registry();
        let enricher = VersionEnricher::new(client(transport.clone()), dir.path());

        let mut items = HashMap::from([(PathBuf::from("/m/gone.safetensors"), version(90, 9))]);
        let stats = enricher.enrich_batch(&mut items, false).await;
        assert_eq!(stats.failed, 1);
        assert_eq!(transport.call_count(), 1);
        assert!(enricher.is_known_failed(9).await);

        // A fresh run reads the marker from disk
        let transport = registry();
        let enricher = VersionEnricher::new(client(transport.clone()), dir.path());
        let mut items = HashMap::from([
            (PathBuf::from("/m/gone.safetensors"), version(90, 9)),
            (PathBuf::from("/m/gone2.safetensors"), version(91, 9)),
        ]);
        let stats = enricher.enrich_batch(&mut items, false).await;

        assert_eq!(transport.call_count(), 0);
        assert_eq!(stats.skipped, 1);
        assert!(items.values().all(|v| !v.is_enriched()));
    }

    #[tokio::test]
    async fn test_failed_marker_expires() {
        let dir = TempDir::new().unwrap();
        let enricher = VersionEnricher::new(client(registry()), dir.path());
        enricher.mark_failed(9).await;

        let marker = enricher.failed_cache.path_for(&failed_key(9));
        let file = std::fs::OpenOptions::new().write(true).open(&marker).unwrap();
        file.set_modified(std::time::SystemTime::now() - Duration::from_secs(8 * 24 * 3600))
            .unwrap();

        let fresh = VersionEnricher::new(client(registry()), dir.path());
        assert!(!fresh.is_known_failed(9).await);
    }

    #[tokio::test]
    async fn test_already_enriched_and_orphans_are_skipped() {
        let dir = TempDir::new().unwrap();
        let transport = registry();
        let enricher = VersionEnricher::new(client(transport.clone()), dir.path());

        let mut done = version(10, 1);
        done.sibling_versions = vec![Default::default()];
        let orphan = ModelVersion {
            id: 5,
            ..Default::default()
        };
        let mut items = HashMap::from([
            (PathBuf::from("/m/done.safetensors"), done),
            (PathBuf::from("/m/orphan.safetensors"), orphan),
        ]);

        let stats = enricher.enrich_batch(&mut items, false).await;
        assert_eq!(stats.already_enriched, 1);
        assert_eq!(stats.unique_parents, 0);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_enriched_paths_lists_only_changed_files() {
        let dir = TempDir::new().unwrap();
        let enricher = VersionEnricher::new(client(registry()), dir.path());

        let mut done = version(20, 2);
        done.sibling_versions = vec![Default::default()];
        let mut items = HashMap::from([
            (PathBuf::from("/m/b.safetensors"), version(11, 1)),
            (PathBuf::from("/m/a.safetensors"), version(10, 1)),
            (PathBuf::from("/m/done.safetensors"), done),
            (PathBuf::from("/m/gone.safetensors"), version(90, 9)),
        ]);

        let stats = enricher.enrich_batch(&mut items, false).await;

        assert_eq!(
            stats.enriched_paths,
            vec![
                PathBuf::from("/m/a.safetensors"),
                PathBuf::from("/m/b.safetensors"),
            ]
        );
        assert_eq!(stats.enriched, 2);
        assert_eq!(stats.already_enriched, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_enrich_single_and_clear() {
        let dir = TempDir::new().unwrap();
        let transport = registry();
        let enricher = VersionEnricher::new(client(transport.clone()), dir.path());

        let mut v = version(11, 1);
        assert!(enricher.enrich_single(&mut v, false).await);
        assert!(v.sibling_versions.iter().any(|s| s.id == 11 && s.is_current));

        let mut gone = version(90, 9);
        assert!(!enricher.enrich_single(&mut gone, false).await);
        assert!(enricher.is_known_failed(9).await);

        enricher.clear_failed_cache().await;
        assert!(!enricher.is_known_failed(9).await);
    }
}
