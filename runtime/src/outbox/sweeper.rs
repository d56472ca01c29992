//! Background sweeper that clears messages left outstanding.
//!
//! A post whose send failed leaves its message in the outbox. The sweeper
//! periodically picks up outstanding messages older than a minimum age and
//! clears them, oldest first.

use super::{ClearReport, OutboxError, OutboxProducerMediator};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Periodic outbox sweeper.
#[derive(Debug, Clone)]
pub struct OutboxSweeper {
    mediator: Arc<OutboxProducerMediator>,
    interval: Duration,
    min_age: Duration,
    batch_size: usize,
}

impl OutboxSweeper {
    /// Sweep every `interval`, clearing messages older than five seconds in batches of 100.
    ///
    /// Intervals shorter than one millisecond are raised to one millisecond.
    #[must_use]
    pub fn new(mediator: Arc<OutboxProducerMediator>, interval: Duration) -> Self {
        Self {
            mediator,
            interval: interval.max(MIN_INTERVAL),
            min_age: Duration::from_secs(5),
            batch_size: 100,
        }
    }

    /// Only sweep messages at least this old.
    #[must_use]
    pub const fn with_min_age(mut self, min_age: Duration) -> Self {
        self.min_age = min_age;
        self
    }

    /// Messages cleared per sweep.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Run one sweep.
    ///
    /// # Errors
    ///
    /// Returns an error if the outbox cannot be queried.
    pub async fn sweep_once(&self) -> Result<ClearReport, OutboxError> {
        self.mediator
            .clear_outstanding_async(self.min_age, self.batch_size)
            .await
    }

    /// Time between sweeps.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Run sweeps on the current runtime until the handle is stopped.
    #[must_use]
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => match self.sweep_once().await {
                        Ok(report) if !report.dispatched.is_empty() || !report.failed.is_empty() => {
                            tracing::info!(
                                dispatched = report.dispatched.len(),
                                failed = report.failed.len(),
                                "outbox sweep finished"
                            );
                        },
                        Ok(_) => {},
                        Err(err) => tracing::warn!(error = %err, "outbox sweep failed"),
                    },
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    },
                }
            }
            tracing::debug!("outbox sweeper stopped");
        });
        SweeperHandle { shutdown, task }
    }
}

/// Handle to a running sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for an in-flight sweep to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "outbox sweeper task failed");
        }
    }

    /// Whether the sweeper task has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
