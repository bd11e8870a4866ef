//! Registry API client and its resilience layer

pub mod circuit_breaker;
pub mod client;
pub mod executor;
pub mod models;
pub mod rate_limiter;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use circuit_breaker::CircuitBreaker;
pub use client::{ApiClient, CacheSettings, ClientSettings, ImageQuery};
pub use executor::{DownloadOutcome, ExecutorSettings, RequestExecutor};
pub use rate_limiter::{RateLimiter, RateWindow};
pub use transport::{
    HttpRequest, HttpResponse, Method, ReqwestTransport, Transport, TransportConfig,
    TransportError,
};
