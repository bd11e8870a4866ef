//! Model file discovery and sidecar naming
//!
//! Sidecars sit next to the model file and share its stem:
//! ```text
//! loras/
//! ├── detail.safetensors
//! ├── detail.json              metadata sidecar
//! ├── detail.preview0.jpeg
//! └── detail.preview1.mp4      video served under an image URL
//! ```

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Find files under `root` matching any of `patterns`
///
/// A `root` that is itself a file is returned as-is. Results are sorted and
/// deduplicated.
pub fn find_model_files(root: &Path, patterns: &[String], recursive: bool) -> Result<Vec<PathBuf>> {
    if root.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }
    if !root.is_dir() {
        anyhow::bail!("Directory not found: {:?}", root);
    }

    // Brackets and wildcards in the root are literal path characters
    let root_pattern = PathBuf::from(glob::Pattern::escape(&root.to_string_lossy()));

    let mut found = BTreeSet::new();
    for pattern in patterns {
        let full = if recursive {
            root_pattern.join("**").join(pattern)
        } else {
            root_pattern.join(pattern)
        };
        let full = full.to_string_lossy().into_owned();

        let entries =
            glob::glob(&full).with_context(|| format!("Invalid file pattern: {pattern}"))?;
        for entry in entries {
            match entry {
                Ok(path) if path.is_file() => {
                    found.insert(path);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Unreadable path during scan"),
            }
        }
    }

    tracing::info!(root = ?root, files = found.len(), recursive, "Scanned directory");
    Ok(found.into_iter().collect())
}

fn stem(file: &Path) -> String {
    file.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn parent(file: &Path) -> &Path {
    file.parent().unwrap_or_else(|| Path::new(""))
}

/// `{dir}/{stem}.json`
pub fn metadata_path(file: &Path) -> PathBuf {
    parent(file).join(format!("{}.json", stem(file)))
}

/// `{dir}/{stem}.preview{index}.{ext}`
pub fn preview_path(file: &Path, index: usize, ext: &str) -> PathBuf {
    parent(file).join(format!("{}.preview{index}.{ext}", stem(file)))
}

/// Existing preview files for `file` with their index
pub fn existing_previews(file: &Path) -> Vec<(usize, PathBuf)> {
    let prefix = format!("{}.preview", stem(file));
    let Ok(entries) = std::fs::read_dir(parent(file)) else {
        return Vec::new();
    };

    let mut previews: Vec<(usize, PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".part") {
                return None;
            }
            let rest = name.strip_prefix(&prefix)?;
            let (index, _ext) = rest.split_once('.')?;
            let index = index.parse().ok()?;
            Some((index, entry.path()))
        })
        .collect();
    previews.sort();
    previews
}

/// Files that have no metadata sidecar yet
pub fn without_metadata(files: Vec<PathBuf>) -> Vec<PathBuf> {
    files
        .into_iter()
        .filter(|f| !metadata_path(f).is_file())
        .collect()
}
