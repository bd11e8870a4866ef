//! Per-file pipeline
//!
//! ```text
//! existing sidecar? (skip_existing) ──yes──▶ reuse it
//!        │ no
//! hash file ─▶ model-versions/by-hash ─▶ require images
//!        │
//! write {stem}.json ─▶ download {stem}.preview{n}.{ext}
//! ```

use super::discovery::{existing_previews, metadata_path, preview_path};
use super::hash::{HashAlgorithm, compute_file_hash};
use crate::api::ApiClient;
use crate::api::models::ModelVersion;
use crate::batch::{BatchCoordinator, BatchReport, BatchTask};
use crate::config::ScoutConfig;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

/// What to write for each resolved file
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    pub hash_algorithm: HashAlgorithm,
    pub save_metadata: bool,
    pub skip_existing: bool,
    pub save_images: bool,
    pub max_images: usize,
    pub dry_run: bool,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            hash_algorithm: HashAlgorithm::Sha256,
            save_metadata: true,
            skip_existing: false,
            save_images: true,
            max_images: 4,
            dry_run: false,
        }
    }
}

impl From<&ScoutConfig> for ProcessorOptions {
    fn from(config: &ScoutConfig) -> Self {
        Self {
            hash_algorithm: config.scanner.hash_algorithm,
            save_metadata: config.output.save_metadata,
            skip_existing: config.output.skip_existing,
            save_images: config.output.images.save,
            max_images: config.output.images.max_count,
            dry_run: config.output.dry_run,
        }
    }
}

pub struct ModelProcessor {
    client: Arc<ApiClient>,
    options: ProcessorOptions,
}

impl ModelProcessor {
    pub fn new(client: Arc<ApiClient>, options: ProcessorOptions) -> Self {
        Self { client, options }
    }

    pub fn options(&self) -> &ProcessorOptions {
        &self.options
    }

    /// Hash for a task's file
    ///
    /// Without `verify_hash`, a hash carried by the task or recorded in the
    /// file's sidecar is trusted. Otherwise the file is hashed.
    pub async fn resolve_hash(&self, task: &BatchTask) -> Result<String> {
        if !task.verify_hash {
            if let Some(hash) = &task.file_hash {
                return Ok(hash.clone());
            }
            if let Some(hash) = self.recorded_hash(&task.file_path).await {
                tracing::debug!(file = ?task.file_path, hash = %hash, "Using hash from existing metadata");
                return Ok(hash);
            }
        }
        compute_file_hash(&task.file_path, self.options.hash_algorithm).await
    }

    /// Digest for the configured algorithm stored on the sidecar's primary file
    async fn recorded_hash(&self, file: &Path) -> Option<String> {
        let version = self.load_existing(file).await?;
        let hashes = version.primary_file()?.hashes.as_ref()?;
        let algorithm = self.options.hash_algorithm.as_str();
        hashes
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(algorithm))
            .and_then(|(_, value)| value.as_str())
            .map(str::to_ascii_uppercase)
    }

    /// Look up the registry version for a file
    ///
    /// Versions without preview images are rejected.
    pub async fn fetch_metadata(&self, task: &BatchTask) -> Result<ModelVersion> {
        if !task.file_path.is_file() {
            anyhow::bail!("File not found");
        }

        let hash = self
            .resolve_hash(task)
            .await
            .context("Failed to compute hash")?;

        let version = self
            .client
            .get_model_version_by_hash(&hash, task.force_refresh)
            .await
            .with_context(|| format!("Failed to fetch metadata for hash {hash}"))?;

        if version.images.is_empty() {
            tracing::warn!(hash = %hash, "No images found in metadata");
            anyhow::bail!("No images found in metadata for hash {hash}");
        }

        tracing::debug!(hash = %hash, version_id = version.id, images = version.images.len(), "Fetched metadata");
        Ok(version)
    }

    /// Previously written sidecar, if present and readable
    pub async fn load_existing(&self, file: &Path) -> Option<ModelVersion> {
        let path = metadata_path(file);
        let content = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice(&content) {
            Ok(version) => Some(version),
            Err(e) => {
                tracing::error!(path = ?path, error = %e, "Error loading existing metadata");
                None
            }
        }
    }

    pub async fn save_metadata(&self, file: &Path, version: &ModelVersion) -> Result<()> {
        let path = metadata_path(file);

        if self.options.dry_run {
            tracing::info!(path = ?path, "Dry run: would write metadata");
            return Ok(());
        }

        let content = serde_json::to_vec_pretty(version).context("Failed to serialize metadata")?;

        // Atomic write: write to temp file, then rename
        let temp_file = path.with_extension("json.tmp");
        tokio::fs::write(&temp_file, content)
            .await
            .with_context(|| format!("Failed to write metadata to {:?}", temp_file))?;
        tokio::fs::rename(&temp_file, &path)
            .await
            .context("Failed to rename temp metadata file")?;
        tracing::debug!(path = ?path, "Saved metadata");
        Ok(())
    }

    /// Remove previews at or beyond index `keep`
    async fn remove_stale_previews(&self, file: &Path, keep: usize) {
        for (index, path) in existing_previews(file) {
            if index < keep {
                continue;
            }
            if self.options.dry_run {
                tracing::info!(path = ?path, "Dry run: would remove old preview");
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => tracing::debug!(path = ?path, "Removed old preview"),
                Err(e) => tracing::warn!(path = ?path, error = %e, "Failed to remove old preview"),
            }
        }
    }

    /// Download up to `max_images` previews, returning how many were fetched
    ///
    /// Existing previews are kept unless `force_refresh` is set. A preview
    /// served as `video/*` is renamed to `.mp4`.
    pub async fn download_previews(
        &self,
        file: &Path,
        version: &ModelVersion,
        force_refresh: bool,
    ) -> usize {
        if !self.options.save_images {
            return 0;
        }

        let max = self.options.max_images;
        self.remove_stale_previews(file, if force_refresh { 0 } else { max })
            .await;

        let mut downloaded = 0;
        for (index, image) in version.images.iter().take(max).enumerate() {
            let ext = image.extension().unwrap_or("jpeg");
            let dest = preview_path(file, index, ext);
            let video = dest.with_extension("mp4");

            if !force_refresh && (dest.is_file() || video.is_file()) {
                continue;
            }

            let outcome = self.client.download_image(&image.url, &dest).await;
            if !outcome.success {
                tracing::warn!(url = %image.url, index, "Preview download failed");
                continue;
            }

            if outcome.is_video() && !ext.eq_ignore_ascii_case("mp4") {
                match tokio::fs::rename(&dest, &video).await {
                    Ok(()) => tracing::info!(
                        from = ?dest,
                        to = ?video,
                        content_type = ?outcome.content_type,
                        "Renamed video preview"
                    ),
                    Err(e) => tracing::warn!(path = ?dest, error = %e, "Failed to rename video preview"),
                }
            }
            downloaded += 1;
        }

        downloaded
    }

    /// Resolve one file end to end
    pub async fn process(&self, task: BatchTask) -> Result<ModelVersion> {
        let file = task.file_path.as_path();

        if self.options.skip_existing
            && !task.force_refresh
            && let Some(version) = self.load_existing(file).await
        {
            tracing::debug!(file = ?file, "Reusing existing metadata");
            self.download_previews(file, &version, false).await;
            return Ok(version);
        }

        let version = self.fetch_metadata(&task).await?;

        if self.options.save_metadata {
            self.save_metadata(file, &version).await?;
        }
        self.download_previews(file, &version, task.force_refresh)
            .await;

        Ok(version)
    }

    /// Process every task through `coordinator`
    pub async fn process_files(
        self: &Arc<Self>,
        coordinator: &BatchCoordinator,
        tasks: Vec<BatchTask>,
    ) -> BatchReport<ModelVersion> {
        let this = Arc::clone(self);
        coordinator
            .process_in_batches("Processing model files", tasks, move |task| {
                let this = Arc::clone(&this);
                async move { this.process(task).await }
            })
            .await
    }
}
