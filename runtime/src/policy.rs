//! Named resilience policies referenced by QoS declarations.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::ConfigurationError;
use crate::retry::RetryPolicy;
use std::collections::HashMap;

/// Name of the retry policy registered by [`PolicyRegistry::with_defaults`].
pub const DEFAULT_RETRY_POLICY: &str = "herald.retry";

/// Name of the circuit breaker registered by [`PolicyRegistry::with_defaults`].
pub const DEFAULT_CIRCUIT_BREAKER: &str = "herald.circuit-breaker";

/// Retry policies and circuit breakers, keyed by name.
///
/// Breakers are shared: every pipeline that references a breaker by name
/// trips and resets the same instance.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    retries: HashMap<String, RetryPolicy>,
    breakers: HashMap<String, CircuitBreaker>,
}

impl PolicyRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding [`DEFAULT_RETRY_POLICY`] and [`DEFAULT_CIRCUIT_BREAKER`].
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new()
            .with_retry(DEFAULT_RETRY_POLICY, RetryPolicy::default())
            .with_circuit_breaker(DEFAULT_CIRCUIT_BREAKER, CircuitBreakerConfig::default())
    }

    /// Register a retry policy.
    #[must_use]
    pub fn with_retry(mut self, name: impl Into<String>, policy: RetryPolicy) -> Self {
        self.retries.insert(name.into(), policy);
        self
    }

    /// Register a circuit breaker.
    #[must_use]
    pub fn with_circuit_breaker(mut self, name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.breakers.insert(name.into(), CircuitBreaker::new(config));
        self
    }

    /// Look up a retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::MissingPolicy`] if `name` is unknown.
    pub fn retry(&self, name: &str) -> Result<&RetryPolicy, ConfigurationError> {
        self.retries.get(name).ok_or_else(|| ConfigurationError::MissingPolicy {
            kind: "retry",
            name: name.to_string(),
        })
    }

    /// Look up a circuit breaker.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::MissingPolicy`] if `name` is unknown.
    pub fn circuit_breaker(&self, name: &str) -> Result<&CircuitBreaker, ConfigurationError> {
        self.breakers.get(name).ok_or_else(|| ConfigurationError::MissingPolicy {
            kind: "circuit breaker",
            name: name.to_string(),
        })
    }
}
