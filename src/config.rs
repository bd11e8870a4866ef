//! Configuration structures and loading logic

use crate::api::{CacheSettings, ClientSettings, ExecutorSettings, RateWindow, TransportConfig};
use crate::scanner::HashAlgorithm;
use crate::scanner::organizer::{CollisionMode, OperationMode, OrganizeOptions};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ScoutConfig {
    pub api: ApiConfig,
    pub batch: BatchConfig,
    pub scanner: ScannerConfig,
    pub output: OutputConfig,
    pub organize: OrganizeConfig,
}

/// Registry connection
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    /// Bearer token, usually supplied through `MODEL_SCOUT_API_KEY`
    #[serde(skip_serializing)]
    pub key: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub user_agent: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            key: None,
            timeout_secs: 30,
            max_retries: 3,
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RateWindowConfig {
    Second,
    Minute,
}

impl From<RateWindowConfig> for RateWindow {
    fn from(window: RateWindowConfig) -> Self {
        match window {
            RateWindowConfig::Second => RateWindow::PerSecond,
            RateWindowConfig::Minute => RateWindow::PerMinute,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_secs: 60,
        }
    }
}

/// Concurrency, throttling and retry behaviour
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchConfig {
    /// When false, files are processed one at a time
    pub enabled: bool,
    pub max_concurrent: usize,
    pub batch_size: usize,
    /// Requests allowed per `rate_window`
    pub rate_limit: u32,
    pub rate_window: RateWindowConfig,
    pub retry_delay_ms: u64,
    /// Memory tier capacity of the response cache
    pub cache_size: usize,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: 4,
            batch_size: 100,
            rate_limit: 100,
            rate_window: RateWindowConfig::Minute,
            retry_delay_ms: 2000,
            cache_size: 100,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub cache_dir: PathBuf,
    pub cache_validity_secs: u64,
    /// Set to false to disable response caching entirely
    pub use_cache: bool,
    pub patterns: Vec<String>,
    pub recursive: bool,
    pub hash_algorithm: HashAlgorithm,
    /// Hash every file, even when its metadata sidecar already records a
    /// digest for `hash_algorithm`
    pub verify_hash: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            cache_dir: crate::cache::default_cache_dir(),
            cache_validity_secs: 86_400,
            use_cache: true,
            patterns: vec![
                "*.safetensors".to_string(),
                "*.ckpt".to_string(),
                "*.pt".to_string(),
            ],
            recursive: true,
            hash_algorithm: HashAlgorithm::Sha256,
            verify_hash: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ImagesConfig {
    pub save: bool,
    pub max_count: usize,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            save: true,
            max_count: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    pub save_metadata: bool,
    /// Reuse an existing metadata sidecar instead of querying the registry
    pub skip_existing: bool,
    pub images: ImagesConfig,
    pub dry_run: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            save_metadata: true,
            skip_existing: false,
            images: ImagesConfig::default(),
            dry_run: false,
        }
    }
}

/// Where resolved files are copied, moved or linked to
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct OrganizeConfig {
    pub enabled: bool,
    /// Defaults to `organized/` next to each model file
    pub output_dir: Option<PathBuf>,
    pub operation_mode: OperationMode,
    pub on_collision: CollisionMode,
}

impl OrganizeConfig {
    /// Resolved target directory for `file`
    pub fn target_dir(&self, file: &Path) -> PathBuf {
        match &self.output_dir {
            Some(dir) => dir.clone(),
            None => file
                .parent()
                .unwrap_or_else(|| Path::new(""))
                .join("organized"),
        }
    }
}

impl ScoutConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(key) = std::env::var("MODEL_SCOUT_API_KEY") {
            self.api.key = Some(key);
        }
        if let Ok(base_url) = std::env::var("MODEL_SCOUT_BASE_URL") {
            self.api.base_url = base_url;
        }
        if let Ok(cache_dir) = std::env::var("MODEL_SCOUT_CACHE_DIR") {
            self.scanner.cache_dir = PathBuf::from(cache_dir);
        }
        if let Ok(max_concurrent) = std::env::var("MODEL_SCOUT_MAX_CONCURRENT") {
            self.batch.max_concurrent = max_concurrent
                .parse()
                .context("Invalid MODEL_SCOUT_MAX_CONCURRENT value")?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://")
        {
            anyhow::bail!("api.base_url must be an http(s) URL (got {})", self.api.base_url);
        }
        if self.api.timeout_secs == 0 {
            anyhow::bail!("api.timeout_secs must be > 0");
        }
        if self.batch.max_concurrent == 0 {
            anyhow::bail!("batch.max_concurrent must be > 0");
        }
        if self.batch.batch_size == 0 {
            anyhow::bail!("batch.batch_size must be > 0");
        }
        if self.batch.rate_limit == 0 {
            anyhow::bail!("batch.rate_limit must be > 0");
        }
        if self.batch.circuit_breaker.failure_threshold == 0 {
            anyhow::bail!("batch.circuit_breaker.failure_threshold must be > 0");
        }
        if self.scanner.patterns.is_empty() {
            anyhow::bail!("scanner.patterns cannot be empty");
        }
        for pattern in &self.scanner.patterns {
            glob::Pattern::new(pattern)
                .with_context(|| format!("Invalid scanner pattern: {pattern}"))?;
        }
        Ok(())
    }

    /// Worker count for file batches (1 when batching is disabled)
    pub fn workers(&self) -> usize {
        if self.batch.enabled {
            self.batch.max_concurrent
        } else {
            1
        }
    }

    pub fn organize_options(&self) -> OrganizeOptions {
        OrganizeOptions {
            mode: self.organize.operation_mode,
            on_collision: self.organize.on_collision,
            dry_run: self.output.dry_run,
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            api_key: self.api.key.clone(),
            user_agent: self.api.user_agent.clone(),
        }
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            executor: ExecutorSettings {
                base_url: self.api.base_url.clone(),
                timeout: Duration::from_secs(self.api.timeout_secs),
                max_retries: self.api.max_retries,
                base_retry_delay: Duration::from_millis(self.batch.retry_delay_ms),
                dry_run: self.output.dry_run,
            },
            rate_limit: self.batch.rate_limit,
            rate_window: self.batch.rate_window.into(),
            failure_threshold: self.batch.circuit_breaker.failure_threshold,
            reset_timeout: Duration::from_secs(self.batch.circuit_breaker.reset_timeout_secs),
            cache: self.scanner.use_cache.then(|| CacheSettings {
                dir: self.scanner.cache_dir.clone(),
                validity: Duration::from_secs(self.scanner.cache_validity_secs),
                memory_capacity: self.batch.cache_size,
            }),
        }
    }
}

fn default_base_url() -> String {
    "https://civitai.com/api/v1".to_string()
}
fn default_user_agent() -> String {
    format!("model-scout/{}", env!("CARGO_PKG_VERSION"))
}
