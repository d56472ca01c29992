//! Circuit breaker for calls to handlers and producers.
//!
//! # States
//!
//! - **Closed**: Normal operation. Calls pass through. Failures are counted.
//! - **Open**: Too many failures. Calls fail immediately until the timeout passes.
//! - **HalfOpen**: After the timeout, calls are let through to probe recovery.
//!
//! State lives behind a short-lived `std` mutex that is never held across an
//! await point, so one breaker can guard blocking and suspending calls alike.
//! Clones share state.
//!
//! # Example
//!
//! ```rust
//! use herald_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::new(
//!     CircuitBreakerConfig::builder()
//!         .failure_threshold(5)
//!         .timeout(Duration::from_secs(60))
//!         .build(),
//! );
//!
//! let result = breaker.call_blocking(|| Ok::<_, String>(42));
//! assert_eq!(result.ok(), Some(42));
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: usize,
    /// How long the circuit stays open before probing
    pub timeout: Duration,
    /// Successes in `HalfOpen` needed to close the circuit
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            failure_threshold: Some(5),
            timeout: Some(Duration::from_secs(60)),
            success_threshold: Some(2),
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: Option<usize>,
    timeout: Option<Duration>,
    success_threshold: Option<usize>,
}

impl CircuitBreakerConfigBuilder {
    /// Set the failure threshold.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Set how long the circuit stays open.
    #[must_use]
    pub const fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Set the success threshold for `HalfOpen`.
    #[must_use]
    pub const fn success_threshold(mut self, threshold: usize) -> Self {
        self.success_threshold = Some(threshold);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(5).max(1),
            timeout: self.timeout.unwrap_or(Duration::from_secs(60)),
            success_threshold: self.success_threshold.unwrap_or(2).max(1),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Calls pass through
    Closed,
    /// Calls are rejected
    Open,
    /// Calls probe whether the dependency recovered
    HalfOpen,
}

/// Errors from circuit breaker operations.
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, call rejected
    #[error("circuit breaker is open")]
    Open,
    /// The guarded call failed
    #[error("operation failed: {0}")]
    Inner(E),
}

/// Returned by [`CircuitBreaker::try_acquire`] when the circuit is open.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("circuit breaker is open")]
pub struct CircuitOpen;

#[derive(Debug)]
struct Inner {
    state: State,
    failure_count: usize,
    success_count: usize,
    opened_at: Option<Instant>,
}

/// Circuit breaker. Clones share state and counters.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    inner: Arc<Mutex<Inner>>,
    total_calls: Arc<AtomicU64>,
    total_successes: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
    total_rejections: Arc<AtomicU64>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(Inner {
                state: State::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            })),
            total_calls: Arc::new(AtomicU64::new(0)),
            total_successes: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
            total_rejections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state. An open circuit whose timeout passed reports `HalfOpen`.
    #[must_use]
    pub fn state(&self) -> State {
        let inner = self.lock();
        match (inner.state, inner.opened_at) {
            (State::Open, Some(opened)) if opened.elapsed() >= self.config.timeout => {
                State::HalfOpen
            },
            (state, _) => state,
        }
    }

    /// Ask permission for one call.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitOpen`] while the circuit is open.
    pub fn try_acquire(&self) -> Result<(), CircuitOpen> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();
        match inner.state {
            State::Closed | State::HalfOpen => Ok(()),
            State::Open => match inner.opened_at {
                Some(opened) if opened.elapsed() >= self.config.timeout => {
                    tracing::info!("circuit breaker transitioning OPEN -> HALF_OPEN");
                    inner.state = State::HalfOpen;
                    inner.success_count = 0;
                    Ok(())
                },
                _ => {
                    self.total_rejections.fetch_add(1, Ordering::Relaxed);
                    Err(CircuitOpen)
                },
            },
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();
        match inner.state {
            State::Closed | State::Open => inner.failure_count = 0,
            State::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    tracing::info!(
                        successes = inner.success_count,
                        "circuit breaker transitioning HALF_OPEN -> CLOSED"
                    );
                    inner.state = State::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                }
            },
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();
        match inner.state {
            State::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        failures = inner.failure_count,
                        threshold = self.config.failure_threshold,
                        "circuit breaker transitioning CLOSED -> OPEN"
                    );
                    inner.state = State::Open;
                    inner.opened_at = Some(Instant::now());
                }
            },
            State::HalfOpen => {
                tracing::warn!("circuit breaker transitioning HALF_OPEN -> OPEN (recovery failed)");
                inner.state = State::Open;
                inner.opened_at = Some(Instant::now());
                inner.failure_count = 1;
                inner.success_count = 0;
            },
            State::Open => inner.failure_count += 1,
        }
    }

    /// Run an async operation through the breaker.
    ///
    /// # Errors
    ///
    /// Returns `CircuitBreakerError::Open` if the circuit is open, or
    /// `CircuitBreakerError::Inner` if the operation fails.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.try_acquire().map_err(|_| CircuitBreakerError::Open)?;
        let result = operation().await;
        self.settle(result)
    }

    /// Run a blocking operation through the breaker.
    ///
    /// # Errors
    ///
    /// Returns `CircuitBreakerError::Open` if the circuit is open, or
    /// `CircuitBreakerError::Inner` if the operation fails.
    pub fn call_blocking<F, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.try_acquire().map_err(|_| CircuitBreakerError::Open)?;
        self.settle(operation())
    }

    fn settle<T, E>(&self, result: Result<T, E>) -> Result<T, CircuitBreakerError<E>> {
        match result {
            Ok(value) => {
                self.record_success();
                Ok(value)
            },
            Err(err) => {
                self.record_failure();
                Err(CircuitBreakerError::Inner(err))
            },
        }
    }

    /// Snapshot of call counters.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Force the circuit closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        tracing::info!("circuit breaker manually reset to CLOSED");
        inner.state = State::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.opened_at = None;
    }
}

/// Counters for circuit breaker monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    /// Calls attempted, including rejected ones
    pub total_calls: u64,
    /// Successful calls
    pub total_successes: u64,
    /// Failed calls
    pub total_failures: u64,
    /// Calls rejected while open
    pub total_rejections: u64,
}

impl CircuitBreakerMetrics {
    /// Share of calls rejected (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rejection_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.total_rejections as f64 / self.total_calls as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failures: usize, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::builder()
                .failure_threshold(failures)
                .timeout(timeout)
                .success_threshold(1)
                .build(),
        )
    }

    #[test]
    fn opens_after_threshold_and_rejects() {
        let breaker = breaker(2, Duration::from_secs(60));

        for _ in 0..2 {
            let _ = breaker.call_blocking(|| Err::<(), _>("down"));
        }

        assert_eq!(breaker.state(), State::Open);
        assert!(matches!(
            breaker.call_blocking(|| Ok::<_, &str>(1)),
            Err(CircuitBreakerError::Open)
        ));
        assert_eq!(breaker.metrics().total_rejections, 1);
    }

    #[test]
    fn success_resets_the_failure_count() {
        let breaker = breaker(2, Duration::from_secs(60));

        let _ = breaker.call_blocking(|| Err::<(), _>("down"));
        let _ = breaker.call_blocking(|| Ok::<_, &str>(()));
        let _ = breaker.call_blocking(|| Err::<(), _>("down"));

        assert_eq!(breaker.state(), State::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_closes_the_circuit() {
        let breaker = breaker(1, Duration::from_millis(20));
        let _ = breaker.call(|| async { Err::<(), _>("down") }).await;
        assert_eq!(breaker.state(), State::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(breaker.state(), State::HalfOpen);

        let result = breaker.call(|| async { Ok::<_, &str>(7) }).await;
        assert_eq!(result.ok(), Some(7));
        assert_eq!(breaker.state(), State::Closed);
    }

    #[test]
    fn clones_share_state() {
        let breaker = breaker(1, Duration::from_secs(60));
        let shared = breaker.clone();

        shared.record_failure();

        assert_eq!(breaker.try_acquire(), Err(CircuitOpen));
        breaker.reset();
        assert_eq!(shared.state(), State::Closed);
    }
}
