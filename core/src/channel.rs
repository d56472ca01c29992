//! Inbound transport contracts and the buffering channel wrapper.

use crate::handler::BoxFuture;
use crate::message::{Message, RoutingKey};
use crate::subscription::Subscription;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by consumers and channel factories.
#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    /// A receive, acknowledge, reject or requeue failed.
    #[error("channel '{channel}' failed: {reason}")]
    Failure {
        /// Channel name.
        channel: String,
        /// Broker-reported reason.
        reason: String,
    },

    /// The broker connection dropped.
    #[error("broker connection lost: {0}")]
    ConnectionLost(String),

    /// The channel could not be created or validated.
    #[error("could not provision channel '{channel}': {reason}")]
    Provisioning {
        /// Channel name.
        channel: String,
        /// Why provisioning failed.
        reason: String,
    },
}

/// A blocking consumer bound to one broker channel.
pub trait MessageConsumer: Send + Sync {
    /// Fetch up to the subscription's buffer size, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] if the broker read failed.
    fn receive(&self, timeout: Duration) -> Result<Vec<Message>, ChannelError>;

    /// Acknowledge successful handling.
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] if the broker call failed.
    fn acknowledge(&self, message: &Message) -> Result<(), ChannelError>;

    /// Reject (dead-letter or drop) the message. Returns whether the broker
    /// accepted the rejection.
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] if the broker call failed.
    fn reject(&self, message: &Message) -> Result<bool, ChannelError>;

    /// Return the message to the channel for another attempt.
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] if the broker call failed.
    fn requeue(&self, message: &Message, delay: Option<Duration>) -> Result<bool, ChannelError>;

    /// Drop every pending message.
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] if the broker call failed.
    fn purge(&self) -> Result<(), ChannelError>;
}

/// A suspending consumer bound to one broker channel.
///
/// Same semantics as [`MessageConsumer`].
#[allow(missing_docs, clippy::missing_errors_doc)]
pub trait AsyncMessageConsumer: Send + Sync {
    fn receive(&self, timeout: Duration) -> BoxFuture<'_, Result<Vec<Message>, ChannelError>>;

    fn acknowledge<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), ChannelError>>;

    fn reject<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<bool, ChannelError>>;

    fn requeue<'a>(
        &'a self,
        message: &'a Message,
        delay: Option<Duration>,
    ) -> BoxFuture<'a, Result<bool, ChannelError>>;

    fn purge(&self) -> BoxFuture<'_, Result<(), ChannelError>>;
}

/// Local read-ahead buffer shared by both channel flavours.
#[derive(Debug)]
struct ReadAhead {
    messages: Mutex<VecDeque<Message>>,
    capacity: usize,
}

impl ReadAhead {
    fn new(capacity: usize) -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    fn pop(&self) -> Option<Message> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Queue fetched messages behind anything already buffered and hand
    /// back the first one.
    fn fill(&self, fetched: Vec<Message>) -> Option<Message> {
        let mut messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        messages.extend(fetched);
        messages.pop_front()
    }

    fn push(&self, message: Message) {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(message);
    }

    fn clear(&self) {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Blocking channel: a consumer plus a local buffer and a stop signal.
pub struct Channel {
    name: String,
    routing_key: RoutingKey,
    consumer: Box<dyn MessageConsumer>,
    buffer: ReadAhead,
}

impl Channel {
    /// Wrap a consumer.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        routing_key: RoutingKey,
        consumer: Box<dyn MessageConsumer>,
        buffer_size: usize,
    ) -> Self {
        Self {
            name: name.into(),
            routing_key,
            consumer,
            buffer: ReadAhead::new(buffer_size),
        }
    }

    /// Channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bound topic.
    #[must_use]
    pub const fn routing_key(&self) -> &RoutingKey {
        &self.routing_key
    }

    /// Maximum batch fetched per broker read.
    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.buffer.capacity
    }

    /// Next message, from the buffer first and then from the broker.
    ///
    /// Returns `Ok(None)` when nothing arrived within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] if the broker read failed.
    pub fn receive(&self, timeout: Duration) -> Result<Option<Message>, ChannelError> {
        if let Some(message) = self.buffer.pop() {
            return Ok(Some(message));
        }
        let fetched = self.consumer.receive(timeout)?;
        Ok(self.buffer.fill(fetched))
    }

    /// Acknowledge a message.
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] if the broker call failed.
    pub fn acknowledge(&self, message: &Message) -> Result<(), ChannelError> {
        self.consumer.acknowledge(message)
    }

    /// Reject a message.
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] if the broker call failed.
    pub fn reject(&self, message: &Message) -> Result<bool, ChannelError> {
        self.consumer.reject(message)
    }

    /// Requeue a message.
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] if the broker call failed.
    pub fn requeue(&self, message: &Message, delay: Option<Duration>) -> Result<bool, ChannelError> {
        self.consumer.requeue(message, delay)
    }

    /// Drop buffered and pending messages.
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] if the broker call failed.
    pub fn purge(&self) -> Result<(), ChannelError> {
        self.buffer.clear();
        self.consumer.purge()
    }

    /// Queue the quit sentinel so the pump reading this channel stops.
    pub fn stop(&self) {
        tracing::debug!(channel = %self.name, "stopping channel");
        self.buffer.push(Message::quit(self.routing_key.clone()));
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("routing_key", &self.routing_key)
            .finish_non_exhaustive()
    }
}

/// Suspending channel: an async consumer plus a local buffer and a stop signal.
pub struct AsyncChannel {
    name: String,
    routing_key: RoutingKey,
    consumer: Box<dyn AsyncMessageConsumer>,
    buffer: ReadAhead,
}

#[allow(clippy::missing_errors_doc)]
impl AsyncChannel {
    /// Wrap a consumer.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        routing_key: RoutingKey,
        consumer: Box<dyn AsyncMessageConsumer>,
        buffer_size: usize,
    ) -> Self {
        Self {
            name: name.into(),
            routing_key,
            consumer,
            buffer: ReadAhead::new(buffer_size),
        }
    }

    /// Channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bound topic.
    #[must_use]
    pub const fn routing_key(&self) -> &RoutingKey {
        &self.routing_key
    }

    /// Next message, from the buffer first and then from the broker.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Message>, ChannelError> {
        if let Some(message) = self.buffer.pop() {
            return Ok(Some(message));
        }
        let fetched = self.consumer.receive(timeout).await?;
        Ok(self.buffer.fill(fetched))
    }

    /// Acknowledge a message.
    pub async fn acknowledge(&self, message: &Message) -> Result<(), ChannelError> {
        self.consumer.acknowledge(message).await
    }

    /// Reject a message.
    pub async fn reject(&self, message: &Message) -> Result<bool, ChannelError> {
        self.consumer.reject(message).await
    }

    /// Requeue a message.
    pub async fn requeue(
        &self,
        message: &Message,
        delay: Option<Duration>,
    ) -> Result<bool, ChannelError> {
        self.consumer.requeue(message, delay).await
    }

    /// Drop buffered and pending messages.
    pub async fn purge(&self) -> Result<(), ChannelError> {
        self.buffer.clear();
        self.consumer.purge().await
    }

    /// Queue the quit sentinel so the pump reading this channel stops.
    pub fn stop(&self) {
        tracing::debug!(channel = %self.name, "stopping channel");
        self.buffer.push(Message::quit(self.routing_key.clone()));
    }
}

impl std::fmt::Debug for AsyncChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncChannel")
            .field("name", &self.name)
            .field("routing_key", &self.routing_key)
            .finish_non_exhaustive()
    }
}

/// Creates channels for subscriptions.
pub trait ChannelFactory: Send + Sync {
    /// Create a blocking channel.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Provisioning`] if the channel cannot be set up.
    fn create_sync_channel(&self, subscription: &Subscription) -> Result<Channel, ChannelError>;

    /// Create a suspending channel.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Provisioning`] if the channel cannot be set up.
    fn create_async_channel(
        &self,
        subscription: &Subscription,
    ) -> Result<AsyncChannel, ChannelError>;
}
