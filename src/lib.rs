//! Model Scout - registry metadata fetcher for local ML model files
//!
//! Resolves model files to registry versions by content hash, writes metadata
//! sidecars and preview images, and enriches versions with their parent model.
//! Registry traffic goes through a shared resilience layer: token bucket rate
//! limiting, a per-endpoint circuit breaker, bounded retries and a two-tier
//! response cache.

pub mod api;
pub mod batch;
pub mod cache;
pub mod config;
pub mod enricher;
pub mod error;
pub mod metrics;
pub mod scanner;

pub use api::{ApiClient, CircuitBreaker, RateLimiter, RateWindow, RequestExecutor};
pub use batch::{BatchCoordinator, BatchReport, BatchTask};
pub use cache::ResponseCache;
pub use config::ScoutConfig;
pub use enricher::{EnrichStats, VersionEnricher};
pub use error::{ApiError, ApiResult};
pub use scanner::{ModelProcessor, ProcessorOptions};
