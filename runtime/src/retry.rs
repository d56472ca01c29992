//! Retry with exponential backoff.
//!
//! Used by the outbox when handing messages to producers, and by the
//! `Retry` QoS node inside handler pipelines. Both an async and a blocking
//! flavour are provided so the same [`RetryPolicy`] serves either
//! execution mode.
//!
//! # Example
//!
//! ```rust
//! use herald_runtime::retry::{RetryPolicy, retry_with_predicate};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .build();
//!
//! let value = retry_with_predicate(
//!     &policy,
//!     || async { Ok::<_, String>(42) },
//!     |err: &String| err.contains("transient"),
//! )
//! .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use rand::Rng;
use std::time::Duration;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `initial_delay`: 100ms
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0 (delay doubles each retry)
/// - `jitter`: off
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first call
    pub max_retries: usize,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap for the exponential backoff
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Randomise each delay between half and the full computed value
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_retries: Some(3),
            initial_delay: Some(Duration::from_millis(100)),
            max_delay: Some(Duration::from_secs(30)),
            multiplier: Some(2.0),
            jitter: false,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay before retry number `attempt` (zero based).
    ///
    /// `initial_delay * multiplier^attempt`, capped at `max_delay`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss
    )]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.min(i32::MAX as usize) as i32;
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64).max(0.0);
        let delay = Duration::from_millis(capped_ms as u64);

        if self.jitter && !delay.is_zero() {
            let half = delay / 2;
            half + rand::thread_rng().gen_range(Duration::ZERO..=half)
        } else {
            delay
        }
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: Option<usize>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
    jitter: bool,
}

impl RetryPolicyBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set initial delay before first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub const fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(3),
            initial_delay: self.initial_delay.unwrap_or(Duration::from_millis(100)),
            max_delay: self.max_delay.unwrap_or(Duration::from_secs(30)),
            multiplier: self.multiplier.unwrap_or(2.0),
            jitter: self.jitter,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NextStep {
    Wait(Duration),
    GiveUp,
}

impl RetryPolicy {
    /// Decide whether attempt number `attempt` (zero based) gets another try.
    pub(crate) fn next_step<E: std::fmt::Display>(
        &self,
        attempt: usize,
        err: &E,
        retryable: bool,
    ) -> NextStep {
        if !retryable {
            tracing::debug!(error = %err, "error is not retryable, failing immediately");
            return NextStep::GiveUp;
        }
        if attempt >= self.max_retries {
            tracing::warn!(attempt, error = %err, "operation failed after max retries");
            return NextStep::GiveUp;
        }
        let delay = self.delay_for_attempt(attempt);
        tracing::debug!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "operation failed, retrying"
        );
        NextStep::Wait(delay)
    }
}

/// Retry an async operation while `is_retryable` approves the error.
///
/// Returns the error of the last attempt once retries are exhausted.
///
/// # Errors
///
/// Returns the operation's error when it is not retryable or when every
/// attempt failed.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            },
            Err(err) => match policy.next_step(attempt, &err, is_retryable(&err)) {
                NextStep::Wait(delay) => {
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                NextStep::GiveUp => return Err(err),
            },
        }
    }
}

/// Retry an async operation on every error.
///
/// # Errors
///
/// Returns the last error once retries are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_predicate(policy, operation, |_| true).await
}

/// Blocking counterpart of [`retry_with_predicate`]; sleeps the current thread.
///
/// # Errors
///
/// Returns the operation's error when it is not retryable or when every
/// attempt failed.
pub fn retry_blocking<F, T, E, P>(policy: &RetryPolicy, mut operation: F, is_retryable: P) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(err) => match policy.next_step(attempt, &err, is_retryable(&err)) {
                NextStep::Wait(delay) => {
                    std::thread::sleep(delay);
                    attempt += 1;
                },
                NextStep::GiveUp => return Err(err),
            },
        }
    }
}
