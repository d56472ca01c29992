//! Suspending pump: one task per performer on a shared runtime.

use super::{Disposition, PumpCore, PumpOutcome, PumpStatistics, Route};
use crate::error::DispatchError;
use crate::processor::CommandProcessor;
use herald_core::channel::AsyncChannel;
use herald_core::mapper::MessageMapper;
use herald_core::message::Message;
use herald_core::request::Request;
use herald_core::subscription::Subscription;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

/// Suspending message pump.
///
/// The loop yields only at channel operations and at dispatch. Dispatch is
/// bounded by the subscription's `dispatch_timeout`; an overrun counts as a
/// recoverable failure.
pub struct Proactor<R> {
    core: PumpCore<R>,
    channel: Arc<AsyncChannel>,
    processor: Arc<CommandProcessor>,
}

impl<R: Request> Proactor<R> {
    /// Pump `channel` into `processor`, translating with `mapper`.
    #[must_use]
    pub fn new(
        performer: impl Into<String>,
        subscription: Subscription,
        channel: Arc<AsyncChannel>,
        processor: Arc<CommandProcessor>,
        mapper: Arc<dyn MessageMapper<R>>,
    ) -> Self {
        Self {
            core: PumpCore::new(performer.into(), subscription, mapper),
            channel,
            processor,
        }
    }

    /// Live counters.
    #[must_use]
    pub fn statistics(&self) -> Arc<PumpStatistics> {
        Arc::clone(&self.core.statistics)
    }

    /// Run until the quit sentinel arrives or the performer must stop.
    pub async fn run(mut self) -> PumpOutcome {
        let subscription = self.core.subscription.clone();
        self.core.statistics.started();
        tracing::info!(performer = %self.core.performer, channel = self.channel.name(), "proactor started");

        let outcome = loop {
            let message = match self.channel.receive(subscription.timeout).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    tokio::time::sleep(subscription.empty_channel_delay).await;
                    continue;
                },
                Err(err) => {
                    self.core.on_channel_failure(&err);
                    tokio::time::sleep(subscription.channel_failure_delay).await;
                    continue;
                },
            };
            if message.is_quit() {
                break PumpOutcome::Quit;
            }
            let span = tracing::info_span!(
                "pump.message",
                performer = %self.core.performer,
                message_id = %message.id(),
                topic = %message.topic()
            );
            if let Some(outcome) = self.process(message).instrument(span).await {
                break outcome;
            }
        };

        self.core.statistics.finished(&outcome);
        tracing::info!(performer = %self.core.performer, ?outcome, "proactor stopped");
        outcome
    }

    async fn process(&mut self, mut message: Message) -> Option<PumpOutcome> {
        self.core.on_received();

        let (mut request, route) = match self.core.translate(&message) {
            Ok(translated) => translated,
            Err(reason) => {
                let outcome = self.core.on_unacceptable(&message, &reason);
                self.reject(&message, "unacceptable").await;
                return outcome;
            },
        };

        let started = Instant::now();
        let result = self.dispatch(&mut request, route).await;
        let elapsed = started.elapsed();

        match self.core.disposition(&mut message, &result) {
            Disposition::Acknowledge => match self.channel.acknowledge(&message).await {
                Ok(()) => self.core.on_acknowledged(elapsed),
                Err(err) => self.core.on_channel_failure(&err),
            },
            Disposition::Requeue(delay) => match self.channel.requeue(&message, delay).await {
                Ok(_) => self.core.on_requeued(),
                Err(err) => self.core.on_channel_failure(&err),
            },
            Disposition::Reject(reason) => self.reject(&message, reason).await,
            Disposition::RejectAndStop(outcome) => {
                self.reject(&message, "configuration").await;
                return Some(outcome);
            },
        }
        None
    }

    async fn dispatch(&self, request: &mut R, route: Route) -> Result<(), DispatchError> {
        let budget = self.core.subscription.dispatch_timeout;
        let dispatch = async {
            match route {
                Route::Send => self.processor.send_async(request).await,
                Route::Publish => self.processor.publish_async(request).await,
            }
        };
        match tokio::time::timeout(budget, dispatch).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(timeout_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX), "dispatch timed out");
                Err(DispatchError::Timeout(budget))
            },
        }
    }

    async fn reject(&self, message: &Message, reason: &'static str) {
        match self.channel.reject(message).await {
            Ok(_) => self.core.on_rejected(reason),
            Err(err) => self.core.on_channel_failure(&err),
        }
    }
}
