//! Message pumps: move messages from a channel into the command processor.
//!
//! Both pump flavours run the same loop for one performer:
//!
//! ```text
//!            ┌──────────── empty: wait empty_channel_delay ◄──────────┐
//!            │                                                        │
//!  Running ──┴─► receive ─┬─► quit sentinel ─────────────► stop (Quit) │
//!      ▲                  ├─► channel failure: wait channel_failure_delay
//!      │                  └─► message ─► translate ─► dispatch ─► ack │ requeue │ reject
//!      └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Messages are handled strictly one at a time. Untranslatable messages are
//! rejected and counted; a run of `unacceptable_message_limit` of them
//! quarantines the performer. Recoverable dispatch failures are requeued
//! until the subscription's requeue count is used up, then rejected.

mod proactor;
mod reactor;

pub use proactor::Proactor;
pub use reactor::Reactor;

use crate::error::DispatchError;
use crate::metrics::PumpMetrics;
use herald_core::mapper::MessageMapper;
use herald_core::message::{Message, MessageType};
use herald_core::request::Request;
use herald_core::subscription::Subscription;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Why a performer stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpOutcome {
    /// The channel delivered the quit sentinel.
    Quit,
    /// Too many consecutive untranslatable messages.
    Quarantined {
        /// Length of the run that tripped the limit.
        unacceptable_messages: u32,
    },
    /// The request type has no usable pipeline.
    ConfigurationFailure(String),
}

/// Live counters for one performer.
#[derive(Debug, Default)]
pub struct PumpStatistics {
    received: AtomicU64,
    acknowledged: AtomicU64,
    requeued: AtomicU64,
    rejected: AtomicU64,
    unacceptable: AtomicU64,
    channel_failures: AtomicU64,
    running: AtomicBool,
    outcome: Mutex<Option<PumpOutcome>>,
}

/// Point-in-time copy of [`PumpStatistics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PumpSnapshot {
    /// Messages read, excluding the quit sentinel.
    pub received: u64,
    /// Messages acknowledged.
    pub acknowledged: u64,
    /// Messages requeued.
    pub requeued: u64,
    /// Messages rejected.
    pub rejected: u64,
    /// Messages that could not be translated.
    pub unacceptable: u64,
    /// Failed channel operations.
    pub channel_failures: u64,
    /// Whether the loop is running.
    pub running: bool,
    /// How the loop ended, once it has.
    pub outcome: Option<PumpOutcome>,
}

impl PumpStatistics {
    /// Copy the counters.
    #[must_use]
    pub fn snapshot(&self) -> PumpSnapshot {
        PumpSnapshot {
            received: self.received.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            unacceptable: self.unacceptable.load(Ordering::Relaxed),
            channel_failures: self.channel_failures.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Acquire),
            outcome: self.outcome(),
        }
    }

    /// Whether the loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// How the loop ended, once it has.
    #[must_use]
    pub fn outcome(&self) -> Option<PumpOutcome> {
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn started(&self) {
        self.running.store(true, Ordering::Release);
    }

    fn finished(&self, outcome: &PumpOutcome) {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome.clone());
        self.running.store(false, Ordering::Release);
    }
}

/// What the pump does with a message after dispatch.
#[derive(Debug, PartialEq)]
enum Disposition {
    Acknowledge,
    Requeue(Option<Duration>),
    Reject(&'static str),
    RejectAndStop(PumpOutcome),
}

/// How a message reaches the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Send,
    Publish,
}

/// State and decisions shared by both pump flavours.
struct PumpCore<R> {
    performer: String,
    subscription: Subscription,
    mapper: Arc<dyn MessageMapper<R>>,
    statistics: Arc<PumpStatistics>,
    unacceptable_run: u32,
}

impl<R: Request> PumpCore<R> {
    fn new(performer: String, subscription: Subscription, mapper: Arc<dyn MessageMapper<R>>) -> Self {
        Self {
            performer,
            subscription,
            mapper,
            statistics: Arc::new(PumpStatistics::default()),
            unacceptable_run: 0,
        }
    }

    fn subscription_name(&self) -> &str {
        &self.subscription.name
    }

    fn on_received(&self) {
        self.statistics.received.fetch_add(1, Ordering::Relaxed);
        PumpMetrics::record_received(self.subscription_name());
    }

    fn on_channel_failure(&self, error: &dyn std::fmt::Display) {
        self.statistics.channel_failures.fetch_add(1, Ordering::Relaxed);
        PumpMetrics::record_channel_failure(self.subscription_name());
        tracing::warn!(performer = %self.performer, error = %error, "channel operation failed");
    }

    /// Translate a message, or explain why it is unacceptable.
    fn translate(&mut self, message: &Message) -> Result<(R, Route), String> {
        let route = match message.message_type() {
            MessageType::Command | MessageType::Document => Route::Send,
            MessageType::Event => Route::Publish,
            other => return Err(format!("message type {other} cannot be dispatched")),
        };
        let request = self
            .mapper
            .map_to_request(message)
            .map_err(|err| err.to_string())?;
        self.unacceptable_run = 0;
        Ok((request, route))
    }

    /// Count an unacceptable message; `Some` once the run trips quarantine.
    fn on_unacceptable(&mut self, message: &Message, reason: &str) -> Option<PumpOutcome> {
        self.unacceptable_run = self.unacceptable_run.saturating_add(1);
        self.statistics.unacceptable.fetch_add(1, Ordering::Relaxed);
        PumpMetrics::record_unacceptable(self.subscription_name());
        tracing::warn!(
            performer = %self.performer,
            message_id = %message.id(),
            consecutive = self.unacceptable_run,
            reason,
            "unacceptable message"
        );

        let limit = self.subscription.unacceptable_message_limit;
        (limit > 0 && self.unacceptable_run >= limit).then(|| {
            PumpMetrics::record_quarantine(self.subscription_name());
            tracing::error!(
                performer = %self.performer,
                limit,
                "unacceptable message limit reached, quarantining performer"
            );
            PumpOutcome::Quarantined {
                unacceptable_messages: self.unacceptable_run,
            }
        })
    }

    /// Decide what happens to a dispatched message.
    ///
    /// Recoverable failures bump the message's handled count, which travels
    /// with the requeued copy.
    fn disposition(&self, message: &mut Message, result: &Result<(), DispatchError>) -> Disposition {
        let Err(err) = result else {
            return Disposition::Acknowledge;
        };
        if err.is_configuration() {
            tracing::error!(performer = %self.performer, error = %err, "pipeline configuration error, stopping performer");
            return Disposition::RejectAndStop(PumpOutcome::ConfigurationFailure(err.to_string()));
        }
        if !err.is_recoverable() {
            tracing::warn!(performer = %self.performer, message_id = %message.id(), error = %err, "dispatch failed");
            return Disposition::Reject("handler_failure");
        }

        message.header.handled_count = message.header.handled_count.saturating_add(1);
        if self.subscription.requeues_exhausted(message.header.handled_count) {
            tracing::warn!(
                performer = %self.performer,
                message_id = %message.id(),
                handled_count = message.header.handled_count,
                "requeue limit reached, rejecting"
            );
            return Disposition::Reject("requeue_limit");
        }
        let delay = err
            .requeue_delay()
            .or_else(|| Some(self.subscription.requeue_delay).filter(|d| !d.is_zero()));
        tracing::debug!(
            performer = %self.performer,
            message_id = %message.id(),
            handled_count = message.header.handled_count,
            error = %err,
            "requeueing message"
        );
        Disposition::Requeue(delay)
    }

    fn on_acknowledged(&self, elapsed: Duration) {
        self.statistics.acknowledged.fetch_add(1, Ordering::Relaxed);
        PumpMetrics::record_acknowledged(self.subscription_name(), elapsed);
    }

    fn on_requeued(&self) {
        self.statistics.requeued.fetch_add(1, Ordering::Relaxed);
        PumpMetrics::record_requeued(self.subscription_name());
    }

    fn on_rejected(&self, reason: &'static str) {
        self.statistics.rejected.fetch_add(1, Ordering::Relaxed);
        PumpMetrics::record_rejected(self.subscription_name(), reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::handler::HandlerError;
    use herald_core::mapper::JsonMessageMapper;
    use herald_core::message::{MessageBody, MessageHeader, RoutingKey};
    use herald_core::request::Id;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        id: Id,
    }

    impl Request for Ping {
        fn id(&self) -> &Id {
            &self.id
        }
    }

    fn core(subscription: Subscription) -> PumpCore<Ping> {
        PumpCore::new(
            "pings#0".to_string(),
            subscription,
            Arc::new(JsonMessageMapper::<Ping>::new()),
        )
    }

    fn message(message_type: MessageType, body: &str) -> Message {
        Message::new(
            MessageHeader::new(Id::new("m-1"), RoutingKey::new("pings"), message_type),
            MessageBody::from(body),
        )
    }

    fn deferred() -> Result<(), DispatchError> {
        Err(DispatchError::Handler {
            handler: "ping",
            source: HandlerError::defer("busy"),
        })
    }

    #[test]
    fn commands_are_sent_and_events_published() {
        let mut core = core(Subscription::new("pings", "pings", "pings"));

        let (_, route) = core.translate(&message(MessageType::Command, r#"{"id":"a"}"#)).unwrap();
        assert_eq!(route, Route::Send);
        let (_, route) = core.translate(&message(MessageType::Event, r#"{"id":"a"}"#)).unwrap();
        assert_eq!(route, Route::Publish);
        assert!(core.translate(&message(MessageType::None, r#"{"id":"a"}"#)).is_err());
    }

    #[test]
    fn quarantine_trips_on_the_limit_and_successes_reset_the_run() {
        let mut core = core(Subscription::new("pings", "pings", "pings").with_unacceptable_message_limit(2));
        let poison = message(MessageType::Command, "not json");

        assert!(core.on_unacceptable(&poison, "bad").is_none());
        core.translate(&message(MessageType::Command, r#"{"id":"a"}"#)).unwrap();
        assert!(core.on_unacceptable(&poison, "bad").is_none());
        assert_eq!(
            core.on_unacceptable(&poison, "bad"),
            Some(PumpOutcome::Quarantined { unacceptable_messages: 2 })
        );
    }

    #[test]
    fn zero_limit_never_quarantines() {
        let mut core = core(Subscription::new("pings", "pings", "pings"));
        let poison = message(MessageType::Command, "not json");
        for _ in 0..50 {
            assert!(core.on_unacceptable(&poison, "bad").is_none());
        }
    }

    #[test]
    fn recoverable_failures_requeue_until_the_count_is_used_up() {
        let core = core(
            Subscription::new("pings", "pings", "pings")
                .with_requeue_count(2)
                .with_requeue_delay(Duration::from_millis(10)),
        );
        let mut message = message(MessageType::Command, r#"{"id":"a"}"#);

        assert_eq!(
            core.disposition(&mut message, &deferred()),
            Disposition::Requeue(Some(Duration::from_millis(10)))
        );
        assert_eq!(
            core.disposition(&mut message, &deferred()),
            Disposition::Requeue(Some(Duration::from_millis(10)))
        );
        assert_eq!(core.disposition(&mut message, &deferred()), Disposition::Reject("requeue_limit"));
        assert_eq!(message.header.handled_count, 3);
    }

    #[test]
    fn deferral_delay_overrides_the_subscription_delay() {
        let core = core(Subscription::new("pings", "pings", "pings"));
        let mut message = message(MessageType::Command, r#"{"id":"a"}"#);
        let result = Err(DispatchError::Handler {
            handler: "ping",
            source: HandlerError::defer_for("busy", Duration::from_secs(3)),
        });

        assert_eq!(
            core.disposition(&mut message, &result),
            Disposition::Requeue(Some(Duration::from_secs(3)))
        );
    }

    #[test]
    fn unrecoverable_and_configuration_failures() {
        let core = core(Subscription::new("pings", "pings", "pings"));
        let mut message = message(MessageType::Command, r#"{"id":"a"}"#);

        let failed = Err(DispatchError::Handler {
            handler: "ping",
            source: HandlerError::failed("boom"),
        });
        assert_eq!(core.disposition(&mut message, &failed), Disposition::Reject("handler_failure"));

        let missing = Err(DispatchError::from(crate::error::ConfigurationError::MissingHandler("Ping")));
        assert!(matches!(
            core.disposition(&mut message, &missing),
            Disposition::RejectAndStop(PumpOutcome::ConfigurationFailure(_))
        ));
        assert_eq!(message.header.handled_count, 0);
    }
}
