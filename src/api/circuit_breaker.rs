//! Per-endpoint circuit breaker
//!
//! Tracks consecutive failures per endpoint name (the first path segment of a
//! registry URL). Reaching the threshold opens the circuit; the first check
//! after `reset_timeout` closes it again and zeroes the counter. There is no
//! half-open trial request: the reset is optimistic.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct Circuits {
    failures: HashMap<String, u32>,
    opened_at: HashMap<String, Instant>,
}

/// Circuit breaker shared by every worker of one API client
///
/// One mutex guards the whole endpoint map.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    circuits: Mutex<Circuits>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        tracing::debug!(
            failure_threshold,
            reset_timeout_secs = reset_timeout.as_secs(),
            "Initialized circuit breaker"
        );

        Self {
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            circuits: Mutex::new(Circuits::default()),
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }

    /// Whether calls to `endpoint` should be rejected
    pub fn is_open(&self, endpoint: &str) -> bool {
        let mut circuits = self.circuits.lock();

        let Some(opened_at) = circuits.opened_at.get(endpoint).copied() else {
            return false;
        };

        if opened_at.elapsed() >= self.reset_timeout {
            circuits.opened_at.remove(endpoint);
            circuits.failures.insert(endpoint.to_string(), 0);
            tracing::info!(endpoint = %endpoint, "Circuit breaker reset");
            return false;
        }

        true
    }

    pub fn record_failure(&self, endpoint: &str) {
        let mut circuits = self.circuits.lock();

        let count = circuits.failures.entry(endpoint.to_string()).or_insert(0);
        *count += 1;
        let count = *count;

        if count >= self.failure_threshold {
            // Repeated failures past the threshold push the reset window out
            circuits
                .opened_at
                .insert(endpoint.to_string(), Instant::now());
            tracing::warn!(
                endpoint = %endpoint,
                failures = count,
                "Circuit breaker opened"
            );
            crate::metrics::record_circuit_opened(endpoint);
        }
    }

    pub fn record_success(&self, endpoint: &str) {
        let mut circuits = self.circuits.lock();
        if let Some(count) = circuits.failures.get_mut(endpoint) {
            *count = 0;
        }
    }

    /// Consecutive failures recorded for `endpoint`
    pub fn failure_count(&self, endpoint: &str) -> u32 {
        self.circuits
            .lock()
            .failures
            .get(endpoint)
            .copied()
            .unwrap_or(0)
    }

    /// Snapshot of currently open endpoints and when they opened
    pub fn open_circuits(&self) -> HashMap<String, Instant> {
        self.circuits.lock().opened_at.clone()
    }
}
