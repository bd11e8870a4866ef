//! Copy, move or symlink resolved model files into a target directory
//!
//! A model file travels with its sidecars:
//! ```text
//! loras/detail.safetensors      ─▶ organized/detail.safetensors
//! loras/detail.json             ─▶ organized/detail.json
//! loras/detail.html             ─▶ organized/detail.html
//! loras/detail.preview0.jpeg    ─▶ organized/detail.preview0.jpeg
//! ```

use super::discovery::{existing_previews, metadata_path};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    #[default]
    Copy,
    Move,
    Symlink,
}

impl OperationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Move => "move",
            Self::Symlink => "symlink",
        }
    }
}

/// What to do when the target path already exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionMode {
    #[default]
    Skip,
    Overwrite,
    Fail,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OrganizeOptions {
    pub mode: OperationMode,
    pub on_collision: CollisionMode,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    Done,
    /// Target existed and collision mode is `skip`
    Skipped,
    DryRun,
}

/// Sidecars of `file` that exist on disk: metadata, HTML page, previews
pub fn related_files(file: &Path) -> Vec<PathBuf> {
    let mut related = Vec::new();

    let metadata = metadata_path(file);
    if metadata.is_file() {
        related.push(metadata.clone());
    }
    let html = metadata.with_extension("html");
    if html.is_file() {
        related.push(html);
    }
    related.extend(
        existing_previews(file)
            .into_iter()
            .map(|(_, path)| path)
            .filter(|path| path.is_file()),
    );

    related
}

/// Apply `options.mode` from `source` to `target`, honouring the collision mode
pub async fn perform_operation(
    source: &Path,
    target: &Path,
    options: &OrganizeOptions,
) -> Result<OperationOutcome> {
    let mode = options.mode.as_str();
    // symlink_metadata also sees dangling links
    let target_exists = fs::symlink_metadata(target).await.is_ok();

    if target_exists {
        match options.on_collision {
            CollisionMode::Skip => {
                tracing::info!(source = ?source, target = ?target, mode, "Target exists, skipping");
                return Ok(OperationOutcome::Skipped);
            }
            CollisionMode::Fail => {
                anyhow::bail!("Target exists: {:?}", target);
            }
            CollisionMode::Overwrite => {
                if target.is_dir() {
                    anyhow::bail!("Target is a directory, cannot overwrite: {:?}", target);
                }
                if options.dry_run {
                    tracing::info!(target = ?target, "Dry run: would overwrite existing target");
                } else {
                    fs::remove_file(target)
                        .await
                        .with_context(|| format!("Failed to remove existing target {:?}", target))?;
                    tracing::debug!(target = ?target, "Removed existing target");
                }
            }
        }
    }

    if options.dry_run {
        tracing::info!(source = ?source, target = ?target, mode, "Dry run: would organize file");
        return Ok(OperationOutcome::DryRun);
    }

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    match options.mode {
        OperationMode::Copy => {
            fs::copy(source, target)
                .await
                .with_context(|| format!("Failed to copy {:?} to {:?}", source, target))?;
        }
        OperationMode::Move => move_file(source, target).await?,
        OperationMode::Symlink => {
            let absolute = fs::canonicalize(source)
                .await
                .with_context(|| format!("Symlink source does not exist: {:?}", source))?;
            symlink(&absolute, target)
                .await
                .with_context(|| format!("Failed to link {:?} to {:?}", target, absolute))?;
        }
    }

    tracing::info!(source = ?source, target = ?target, mode, "Organized file");
    Ok(OperationOutcome::Done)
}

/// Rename, falling back to copy and delete across filesystems
async fn move_file(source: &Path, target: &Path) -> Result<()> {
    if fs::rename(source, target).await.is_ok() {
        return Ok(());
    }
    fs::copy(source, target)
        .await
        .with_context(|| format!("Failed to move {:?} to {:?}", source, target))?;
    fs::remove_file(source)
        .await
        .with_context(|| format!("Failed to remove {:?} after copy", source))?;
    Ok(())
}

#[cfg(unix)]
async fn symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    fs::symlink(original, link).await
}

#[cfg(windows)]
async fn symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    fs::symlink_file(original, link).await
}

pub struct FileOrganizer {
    options: OrganizeOptions,
}

impl FileOrganizer {
    pub fn new(options: OrganizeOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &OrganizeOptions {
        &self.options
    }

    /// Organize `file` and its sidecars into `target_dir`
    ///
    /// Returns the model file's new path. Related files are best-effort: a
    /// failure there is logged and does not fail the model file.
    pub async fn organize_file(&self, file: &Path, target_dir: &Path) -> Result<PathBuf> {
        let name = file
            .file_name()
            .with_context(|| format!("Not a file path: {:?}", file))?;
        let target = target_dir.join(name);

        // Collect before a move takes the model file away
        let related = related_files(file);

        perform_operation(file, &target, &self.options).await?;

        for path in related {
            let Some(related_name) = path.file_name() else {
                continue;
            };
            let related_target = target_dir.join(related_name);
            if let Err(e) = perform_operation(&path, &related_target, &self.options).await {
                tracing::warn!(file = ?path, error = %e, "Failed to organize related file");
            }
        }

        Ok(target)
    }

    /// Organize each `(file, target_dir)` pair; `None` marks a failure
    pub async fn organize_files(
        &self,
        files: &[(PathBuf, PathBuf)],
    ) -> Vec<(PathBuf, Option<PathBuf>)> {
        let mut results = Vec::with_capacity(files.len());
        for (file, target_dir) in files {
            match self.organize_file(file, target_dir).await {
                Ok(target) => results.push((file.clone(), Some(target))),
                Err(e) => {
                    tracing::error!(file = ?file, error = %e, "Error organizing file");
                    results.push((file.clone(), None));
                }
            }
        }
        results
    }
}
