//! Outbound transport contracts.

use crate::handler::BoxFuture;
use crate::message::{Message, RoutingKey};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by producers.
#[derive(Error, Debug, Clone)]
pub enum ProducerError {
    /// The broker refused or failed the send.
    #[error("send to '{topic}' failed: {reason}")]
    SendFailed {
        /// Destination topic.
        topic: RoutingKey,
        /// Broker-reported reason.
        reason: String,
    },

    /// The producer has no connection to the broker.
    #[error("producer for '{topic}' is unavailable: {reason}")]
    Unavailable {
        /// Destination topic.
        topic: RoutingKey,
        /// Why the producer is unavailable.
        reason: String,
    },

    /// The producer cannot honour a delivery delay.
    #[error("producer for '{0}' does not support delayed delivery")]
    DelayNotSupported(RoutingKey),
}

/// A blocking message producer bound to a topic.
pub trait MessageProducer: Send + Sync {
    /// Send a message.
    ///
    /// # Errors
    ///
    /// Returns a [`ProducerError`] if the broker did not accept the message.
    fn send(&self, message: &Message) -> Result<(), ProducerError>;

    /// Send a message for delivery after `delay`.
    ///
    /// # Errors
    ///
    /// The default implementation only supports a zero delay and returns
    /// [`ProducerError::DelayNotSupported`] otherwise.
    fn send_with_delay(&self, message: &Message, delay: Duration) -> Result<(), ProducerError> {
        if delay.is_zero() {
            self.send(message)
        } else {
            Err(ProducerError::DelayNotSupported(message.topic().clone()))
        }
    }
}

/// A suspending message producer bound to a topic.
pub trait AsyncMessageProducer: Send + Sync {
    /// Send a message.
    ///
    /// # Errors
    ///
    /// Resolves to a [`ProducerError`] if the broker did not accept the message.
    fn send<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), ProducerError>>;

    /// Send a message for delivery after `delay`.
    ///
    /// # Errors
    ///
    /// The default implementation only supports a zero delay and resolves to
    /// [`ProducerError::DelayNotSupported`] otherwise.
    fn send_with_delay<'a>(
        &'a self,
        message: &'a Message,
        delay: Duration,
    ) -> BoxFuture<'a, Result<(), ProducerError>> {
        if delay.is_zero() {
            self.send(message)
        } else {
            let topic = message.topic().clone();
            Box::pin(async move { Err(ProducerError::DelayNotSupported(topic)) })
        }
    }
}
