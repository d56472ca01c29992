//! # Herald Testing
//!
//! Testing utilities and helpers for Herald.
//!
//! This crate provides:
//! - Deterministic clocks
//! - In-memory outbox, archive, inbox and transactions
//! - An in-memory broker with producers, consumers and a channel factory
//! - Polling helpers for asserting on background performers
//!
//! ## Example
//!
//! ```ignore
//! use herald_testing::{InMemoryBus, InMemoryChannelFactory, InMemoryOutbox, wait_until};
//!
//! #[test]
//! fn posted_orders_reach_the_bus() {
//!     let bus = InMemoryBus::new();
//!     let outbox = InMemoryOutbox::new();
//!     let processor = CommandProcessor::builder(registry)
//!         .mappers(mappers)
//!         .producers(ProducerRegistry::new().with_dual_producer("orders", Arc::new(bus.clone())))
//!         .outbox(Arc::new(outbox.clone()))
//!         .build();
//!
//!     processor.post(&PlaceOrder::new("order-1")).unwrap();
//!
//!     assert_eq!(bus.published().len(), 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use herald_core::environment::Clock;

mod broker_mocks;
mod inbox_mocks;
mod outbox_mocks;

pub use broker_mocks::{
    Delivery, DeliveryKind, InMemoryBus, InMemoryChannelFactory, InMemoryConsumer,
    InMemoryProducer,
};
pub use inbox_mocks::InMemoryInbox;
pub use outbox_mocks::{
    InMemoryArchive, InMemoryOutbox, InMemoryTransaction, InMemoryTransactionProvider,
};

/// Mock implementations of Environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use herald_testing::mocks::FixedClock;
    /// use herald_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can hand one clone to the
    /// outbox and advance another.
    ///
    /// ```
    /// use herald_testing::{mocks::ManualClock, test_clock};
    /// use herald_core::environment::Clock;
    /// use std::time::Duration;
    ///
    /// let clock = ManualClock::starting_at(test_clock().now());
    /// let before = clock.now();
    /// clock.advance(Duration::from_secs(60));
    /// assert_eq!((clock.now() - before).num_seconds(), 60);
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock reading `time`
        #[must_use]
        pub fn starting_at(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward by `by`.
        pub fn advance(&self, by: std::time::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            let next = chrono::Duration::from_std(by)
                .ok()
                .and_then(|by| time.checked_add_signed(by))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            *time = next;
        }

        /// Set the clock to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Polling helpers for assertions on background work.
pub mod helpers {
    use std::time::{Duration, Instant};

    const POLL_INTERVAL: Duration = Duration::from_millis(5);

    /// Poll `condition` on the current thread until it holds or `timeout`
    /// elapses. Returns whether it held.
    pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Async form of [`wait_until`]; yields to the runtime between polls.
    pub async fn wait_until_async(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Install a `tracing` subscriber writing to the test harness.
    ///
    /// Safe to call from every test; only the first call installs.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }
}

// Re-export commonly used items
pub use helpers::{init_tracing, wait_until, wait_until_async};
pub use mocks::{FixedClock, ManualClock, test_clock};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::starting_at(test_clock().now());
        let shared = clock.clone();

        clock.advance(Duration::from_secs(5));

        assert_eq!(shared.now(), clock.now());
        assert_eq!((shared.now() - test_clock().now()).num_seconds(), 5);
    }

    #[test]
    fn wait_until_reports_timeouts() {
        assert!(wait_until(Duration::from_millis(10), || true));
        assert!(!wait_until(Duration::from_millis(10), || false));
    }
}
