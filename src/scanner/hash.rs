//! Content hashing for local model files
//!
//! Registry lookups key on upper-case hex digests. Hashing multi-gigabyte
//! checkpoints is CPU and disk bound, so it runs on the blocking pool.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

/// Bytes covered by the AutoV1 hash
pub const AUTOV1_PREFIX_BYTES: u64 = 1024 * 1024;

const READ_BUFFER_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// SHA-256 over the whole file
    #[default]
    Sha256,
    /// SHA-256 over the first MiB
    Autov1,
    /// SHA-256 over the whole file, under the registry's AutoV2 name
    Autov2,
    Blake3,
    Crc32,
}

impl HashAlgorithm {
    /// Lower-case name; matches the registry's hash keys case-insensitively
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Autov1 => "autov1",
            Self::Autov2 => "autov2",
            Self::Blake3 => "blake3",
            Self::Crc32 => "crc32",
        }
    }
}

enum FileHasher {
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
    Crc32(crc32fast::Hasher),
}

impl FileHasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 | HashAlgorithm::Autov1 | HashAlgorithm::Autov2 => {
                Self::Sha256(Sha256::new())
            }
            HashAlgorithm::Blake3 => Self::Blake3(Box::new(blake3::Hasher::new())),
            HashAlgorithm::Crc32 => Self::Crc32(crc32fast::Hasher::new()),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(bytes),
            Self::Blake3(h) => {
                h.update(bytes);
            }
            Self::Crc32(h) => h.update(bytes),
        }
    }

    /// Upper-case hex digest
    fn finish(self) -> String {
        match self {
            Self::Sha256(h) => hex::encode_upper(h.finalize()),
            Self::Blake3(h) => hex::encode_upper(h.finalize().as_bytes()),
            Self::Crc32(h) => format!("{:08X}", h.finalize()),
        }
    }
}

/// Hash `path` on the current thread
pub fn hash_file_blocking(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;

    let mut reader: Box<dyn Read> = match algorithm {
        HashAlgorithm::Autov1 => Box::new(BufReader::new(file).take(AUTOV1_PREFIX_BYTES)),
        _ => Box::new(BufReader::new(file)),
    };

    let mut hasher = FileHasher::new(algorithm);
    let mut buf = vec![0u8; READ_BUFFER_BYTES];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("Failed to read {:?}", path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finish())
}

/// Hash `path` on the blocking pool
pub async fn compute_file_hash(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    let owned: PathBuf = path.to_path_buf();
    let started = std::time::Instant::now();

    let hash = tokio::task::spawn_blocking(move || hash_file_blocking(&owned, algorithm))
        .await
        .context("Hashing task failed")??;

    tracing::debug!(
        file = ?path,
        algorithm = algorithm.as_str(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Computed file hash"
    );

    Ok(hash)
}
