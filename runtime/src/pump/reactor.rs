//! Blocking pump: one dedicated thread per performer.

use super::{Disposition, PumpCore, PumpOutcome, PumpStatistics, Route};
use crate::error::DispatchError;
use crate::processor::CommandProcessor;
use herald_core::channel::Channel;
use herald_core::mapper::MessageMapper;
use herald_core::message::Message;
use herald_core::request::Request;
use herald_core::subscription::Subscription;
use std::sync::Arc;
use std::time::Instant;

/// Blocking message pump.
///
/// Dispatch deadlines are advisory here: a blocking handler is never
/// interrupted, and an overrun is only logged.
pub struct Reactor<R> {
    core: PumpCore<R>,
    channel: Arc<Channel>,
    processor: Arc<CommandProcessor>,
}

impl<R: Request> Reactor<R> {
    /// Pump `channel` into `processor`, translating with `mapper`.
    #[must_use]
    pub fn new(
        performer: impl Into<String>,
        subscription: Subscription,
        channel: Arc<Channel>,
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
    pub fn run(mut self) -> PumpOutcome {
        let subscription = self.core.subscription.clone();
        self.core.statistics.started();
        tracing::info!(performer = %self.core.performer, channel = self.channel.name(), "reactor started");

        let outcome = loop {
            let message = match self.channel.receive(subscription.timeout) {
                Ok(Some(message)) => message,
                Ok(None) => {
                    std::thread::sleep(subscription.empty_channel_delay);
                    continue;
                },
                Err(err) => {
                    self.core.on_channel_failure(&err);
                    std::thread::sleep(subscription.channel_failure_delay);
                    continue;
                },
            };
            if message.is_quit() {
                break PumpOutcome::Quit;
            }
            if let Some(outcome) = self.process(message) {
                break outcome;
            }
        };

        self.core.statistics.finished(&outcome);
        tracing::info!(performer = %self.core.performer, ?outcome, "reactor stopped");
        outcome
    }

    fn process(&mut self, mut message: Message) -> Option<PumpOutcome> {
        let span = tracing::info_span!(
            "pump.message",
            performer = %self.core.performer,
            message_id = %message.id(),
            topic = %message.topic()
        );
        let _entered = span.enter();
        self.core.on_received();

        let (mut request, route) = match self.core.translate(&message) {
            Ok(translated) => translated,
            Err(reason) => {
                let outcome = self.core.on_unacceptable(&message, &reason);
                self.reject(&message, "unacceptable");
                return outcome;
            },
        };

        let started = Instant::now();
        let result = self.dispatch(&mut request, route);
        let elapsed = started.elapsed();
        if elapsed > self.core.subscription.dispatch_timeout {
            tracing::warn!(
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                "dispatch overran its timeout"
            );
        }

        match self.core.disposition(&mut message, &result) {
            Disposition::Acknowledge => match self.channel.acknowledge(&message) {
                Ok(()) => self.core.on_acknowledged(elapsed),
                Err(err) => self.core.on_channel_failure(&err),
            },
            Disposition::Requeue(delay) => match self.channel.requeue(&message, delay) {
                Ok(_) => self.core.on_requeued(),
                Err(err) => self.core.on_channel_failure(&err),
            },
            Disposition::Reject(reason) => self.reject(&message, reason),
            Disposition::RejectAndStop(outcome) => {
                self.reject(&message, "configuration");
                return Some(outcome);
            },
        }
        None
    }

    fn dispatch(&self, request: &mut R, route: Route) -> Result<(), DispatchError> {
        match route {
            Route::Send => self.processor.send(request),
            Route::Publish => self.processor.publish(request),
        }
    }

    fn reject(&self, message: &Message, reason: &'static str) {
        match self.channel.reject(message) {
            Ok(_) => self.core.on_rejected(reason),
            Err(err) => self.core.on_channel_failure(&err),
        }
    }
}
