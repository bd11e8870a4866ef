//! Error types for registry API calls

use thiserror::Error;

/// Result alias for registry API calls
pub type ApiResult<T> = Result<T, ApiError>;

/// Terminal failure of a registry request
///
/// Retryable conditions (429, 5xx, transport errors) are handled inside the
/// executor's retry loop and only surface here once retries are exhausted.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    /// Endpoint is suppressed locally, no network call was attempted
    #[error("Circuit breaker open for endpoint: {endpoint}")]
    CircuitOpen { endpoint: String },

    /// 429 responses persisted past the retry budget
    #[error("Rate limit exceeded. Retry after {retry_after} seconds")]
    RateLimited { retry_after: u64 },

    /// 4xx other than 429, never retried
    #[error("Client error: {status} - {message}")]
    Client { status: u16, message: String },

    /// 5xx responses persisted past the retry budget
    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },

    /// Transport failure or unparseable body persisted past the retry budget
    #[error("Network error: {0}")]
    Network(String),
}

impl ApiError {
    pub fn client(status: u16, message: impl Into<String>) -> Self {
        Self::Client {
            status,
            message: message.into(),
        }
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }

    /// Circuit-open and rate-limit outcomes are steady-state behaviour, not faults
    #[must_use]
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::RateLimited { .. })
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Client { status: 404, .. })
    }

    /// HTTP status carried by the error, if any
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Client { status, .. } | Self::Server { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            Self::CircuitOpen { .. } | Self::Network(_) => None,
        }
    }

    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "circuit_open",
            Self::RateLimited { .. } => "rate_limited",
            Self::Client { .. } => "client_error",
            Self::Server { .. } => "server_error",
            Self::Network(_) => "network_error",
        }
    }
}
