//! In-memory broker testing utilities
//!
//! - [`InMemoryProducer`]: records what it is asked to send
//! - [`InMemoryBus`]: topic-routed queues that are both a producer and a
//!   source of consumers
//! - [`InMemoryChannelFactory`]: builds [`Channel`]s and [`AsyncChannel`]s
//!   over an [`InMemoryBus`]

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use herald_core::channel::{
    AsyncChannel, AsyncMessageConsumer, Channel, ChannelError, ChannelFactory, MessageConsumer,
};
use herald_core::handler::BoxFuture;
use herald_core::message::{Message, RoutingKey};
use herald_core::producer::{AsyncMessageProducer, MessageProducer, ProducerError};
use herald_core::request::Id;
use herald_core::subscription::{OnMissingChannel, Subscription};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

const ASYNC_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
struct ProducerState {
    sent: Vec<(Message, Duration)>,
    failures: usize,
}

/// Producer that records every message it sends.
///
/// # Example
///
/// ```
/// use herald_testing::InMemoryProducer;
/// use herald_core::producer::MessageProducer;
/// use herald_core::message::{Message, RoutingKey};
///
/// let producer = InMemoryProducer::new();
/// producer.fail_next(1);
/// assert!(producer.send(&Message::quit(RoutingKey::new("orders"))).is_err());
/// assert!(producer.send(&Message::quit(RoutingKey::new("orders"))).is_ok());
/// assert_eq!(producer.count(), 1);
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryProducer {
    state: Arc<Mutex<ProducerState>>,
}

impl InMemoryProducer {
    /// Create a producer with nothing recorded
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` sends fail.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().unwrap().failures = count;
    }

    /// Messages sent, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<Message> {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .map(|(message, _)| message.clone())
            .collect()
    }

    /// Ids of messages sent, in order.
    #[must_use]
    pub fn sent_ids(&self) -> Vec<Id> {
        self.sent().iter().map(|message| message.id().clone()).collect()
    }

    /// Delay requested for each send, in order.
    #[must_use]
    pub fn delays(&self) -> Vec<Duration> {
        self.state.lock().unwrap().sent.iter().map(|(_, delay)| *delay).collect()
    }

    /// Number of successful sends.
    #[must_use]
    pub fn count(&self) -> usize {
        self.state.lock().unwrap().sent.len()
    }

    fn record(&self, message: &Message, delay: Duration) -> Result<(), ProducerError> {
        let mut state = self.state.lock().unwrap();
        if state.failures > 0 {
            state.failures -= 1;
            return Err(ProducerError::SendFailed {
                topic: message.topic().clone(),
                reason: "injected send failure".to_string(),
            });
        }
        state.sent.push((message.clone(), delay));
        Ok(())
    }
}

impl MessageProducer for InMemoryProducer {
    fn send(&self, message: &Message) -> Result<(), ProducerError> {
        self.record(message, Duration::ZERO)
    }

    fn send_with_delay(&self, message: &Message, delay: Duration) -> Result<(), ProducerError> {
        self.record(message, delay)
    }
}

impl AsyncMessageProducer for InMemoryProducer {
    fn send<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), ProducerError>> {
        Box::pin(async move { self.record(message, Duration::ZERO) })
    }

    fn send_with_delay<'a>(
        &'a self,
        message: &'a Message,
        delay: Duration,
    ) -> BoxFuture<'a, Result<(), ProducerError>> {
        Box::pin(async move { self.record(message, delay) })
    }
}

/// How a consumer settled a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    /// Handled successfully.
    Acknowledged,
    /// Dropped or dead-lettered.
    Rejected,
    /// Returned to the queue.
    Requeued,
}

/// One settlement recorded by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel that settled the message.
    pub channel: String,
    /// Message id.
    pub message_id: Id,
    /// Settlement.
    pub kind: DeliveryKind,
    /// Handled count carried by the message when it was settled.
    pub handled_count: u32,
    /// Requested requeue delay.
    pub delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct BusState {
    queues: HashMap<String, VecDeque<Message>>,
    bindings: HashMap<RoutingKey, Vec<String>>,
    published: Vec<Message>,
    deliveries: Vec<Delivery>,
    failing_receives: usize,
    failing_creates: bool,
}

#[derive(Debug, Default)]
struct BusInner {
    state: Mutex<BusState>,
    arrivals: Condvar,
}

/// In-memory broker.
///
/// Each channel name owns a queue bound to one routing key. Publishing a
/// message copies it into every queue bound to its topic; with no binding the
/// message is only recorded.
#[derive(Clone, Debug, Default)]
pub struct InMemoryBus {
    inner: Arc<BusInner>,
}

impl InMemoryBus {
    /// Create a bus with no channels
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (if needed) the queue `channel` and bind it to `routing_key`.
    pub fn bind(&self, channel: &str, routing_key: &RoutingKey) {
        let mut state = self.inner.state.lock().unwrap();
        state.queues.entry(channel.to_string()).or_default();
        let bound = state.bindings.entry(routing_key.clone()).or_default();
        if !bound.iter().any(|name| name == channel) {
            bound.push(channel.to_string());
        }
    }

    /// Whether the queue `channel` exists.
    #[must_use]
    pub fn has_channel(&self, channel: &str) -> bool {
        self.inner.state.lock().unwrap().queues.contains_key(channel)
    }

    /// Route `message` to every queue bound to its topic.
    pub fn publish(&self, message: Message) {
        let mut state = self.inner.state.lock().unwrap();
        let targets = state.bindings.get(message.topic()).cloned().unwrap_or_default();
        for channel in targets {
            state
                .queues
                .entry(channel)
                .or_default()
                .push_back(message.clone());
        }
        state.published.push(message);
        drop(state);
        self.inner.arrivals.notify_all();
    }

    /// Every published message, in order.
    #[must_use]
    pub fn published(&self) -> Vec<Message> {
        self.inner.state.lock().unwrap().published.clone()
    }

    /// Messages waiting in `channel`.
    #[must_use]
    pub fn depth(&self, channel: &str) -> usize {
        self.inner
            .state
            .lock()
            .unwrap()
            .queues
            .get(channel)
            .map_or(0, VecDeque::len)
    }

    /// Every settlement, in order.
    #[must_use]
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.inner.state.lock().unwrap().deliveries.clone()
    }

    /// Ids settled with `kind`, in order.
    #[must_use]
    pub fn settled(&self, kind: DeliveryKind) -> Vec<Id> {
        self.deliveries()
            .into_iter()
            .filter(|delivery| delivery.kind == kind)
            .map(|delivery| delivery.message_id)
            .collect()
    }

    /// Make the next `count` receives fail, on any channel.
    pub fn fail_next_receives(&self, count: usize) {
        self.inner.state.lock().unwrap().failing_receives = count;
    }

    /// Make channel creation fail.
    pub fn fail_channel_creation(&self, failing: bool) {
        self.inner.state.lock().unwrap().failing_creates = failing;
    }

    /// A consumer reading up to `batch` messages at a time from `channel`.
    #[must_use]
    pub fn consumer(&self, channel: &str, batch: usize) -> InMemoryConsumer {
        InMemoryConsumer {
            bus: self.clone(),
            channel: channel.to_string(),
            batch: batch.max(1),
        }
    }

    fn take(&self, channel: &str, batch: usize) -> Result<Vec<Message>, ChannelError> {
        let mut state = self.inner.state.lock().unwrap();
        Self::take_locked(&mut state, channel, batch)
    }

    fn take_locked(
        state: &mut BusState,
        channel: &str,
        batch: usize,
    ) -> Result<Vec<Message>, ChannelError> {
        if state.failing_receives > 0 {
            state.failing_receives -= 1;
            return Err(ChannelError::Failure {
                channel: channel.to_string(),
                reason: "injected receive failure".to_string(),
            });
        }
        let Some(queue) = state.queues.get_mut(channel) else {
            return Ok(Vec::new());
        };
        let count = batch.min(queue.len());
        Ok(queue.drain(..count).collect())
    }

    fn take_blocking(&self, channel: &str, batch: usize, timeout: Duration) -> Result<Vec<Message>, ChannelError> {
        let state = self.inner.state.lock().unwrap();
        let (mut state, _) = self
            .inner
            .arrivals
            .wait_timeout_while(state, timeout, |state| {
                state.failing_receives == 0
                    && state.queues.get(channel).is_none_or(VecDeque::is_empty)
            })
            .unwrap();
        Self::take_locked(&mut state, channel, batch)
    }

    fn settle(&self, channel: &str, message: &Message, kind: DeliveryKind, delay: Option<Duration>) {
        let mut state = self.inner.state.lock().unwrap();
        state.deliveries.push(Delivery {
            channel: channel.to_string(),
            message_id: message.id().clone(),
            kind,
            handled_count: message.header.handled_count,
            delay,
        });
        if kind == DeliveryKind::Requeued {
            state
                .queues
                .entry(channel.to_string())
                .or_default()
                .push_back(message.clone());
            drop(state);
            self.inner.arrivals.notify_all();
        }
    }

    fn purge(&self, channel: &str) {
        if let Some(queue) = self.inner.state.lock().unwrap().queues.get_mut(channel) {
            queue.clear();
        }
    }

    fn creation_failure(&self, channel: &str) -> Option<ChannelError> {
        self.inner
            .state
            .lock()
            .unwrap()
            .failing_creates
            .then(|| ChannelError::Provisioning {
                channel: channel.to_string(),
                reason: "injected provisioning failure".to_string(),
            })
    }
}

impl MessageProducer for InMemoryBus {
    fn send(&self, message: &Message) -> Result<(), ProducerError> {
        self.publish(message.clone());
        Ok(())
    }
}

impl AsyncMessageProducer for InMemoryBus {
    fn send<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), ProducerError>> {
        Box::pin(async move {
            self.publish(message.clone());
            Ok(())
        })
    }
}

/// Consumer over one [`InMemoryBus`] queue.
///
/// Requeued messages go to the back of the queue immediately; the requested
/// delay is recorded but not waited for.
#[derive(Clone, Debug)]
pub struct InMemoryConsumer {
    bus: InMemoryBus,
    channel: String,
    batch: usize,
}

impl MessageConsumer for InMemoryConsumer {
    fn receive(&self, timeout: Duration) -> Result<Vec<Message>, ChannelError> {
        self.bus.take_blocking(&self.channel, self.batch, timeout)
    }

    fn acknowledge(&self, message: &Message) -> Result<(), ChannelError> {
        self.bus.settle(&self.channel, message, DeliveryKind::Acknowledged, None);
        Ok(())
    }

    fn reject(&self, message: &Message) -> Result<bool, ChannelError> {
        self.bus.settle(&self.channel, message, DeliveryKind::Rejected, None);
        Ok(true)
    }

    fn requeue(&self, message: &Message, delay: Option<Duration>) -> Result<bool, ChannelError> {
        self.bus.settle(&self.channel, message, DeliveryKind::Requeued, delay);
        Ok(true)
    }

    fn purge(&self) -> Result<(), ChannelError> {
        self.bus.purge(&self.channel);
        Ok(())
    }
}

impl AsyncMessageConsumer for InMemoryConsumer {
    fn receive(&self, timeout: Duration) -> BoxFuture<'_, Result<Vec<Message>, ChannelError>> {
        Box::pin(async move {
            let deadline = Instant::now() + timeout;
            loop {
                let messages = self.bus.take(&self.channel, self.batch)?;
                if !messages.is_empty() || Instant::now() >= deadline {
                    return Ok(messages);
                }
                tokio::time::sleep(ASYNC_POLL_INTERVAL).await;
            }
        })
    }

    fn acknowledge<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), ChannelError>> {
        Box::pin(async move { MessageConsumer::acknowledge(self, message) })
    }

    fn reject<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<bool, ChannelError>> {
        Box::pin(async move { MessageConsumer::reject(self, message) })
    }

    fn requeue<'a>(
        &'a self,
        message: &'a Message,
        delay: Option<Duration>,
    ) -> BoxFuture<'a, Result<bool, ChannelError>> {
        Box::pin(async move { MessageConsumer::requeue(self, message, delay) })
    }

    fn purge(&self) -> BoxFuture<'_, Result<(), ChannelError>> {
        Box::pin(async move { MessageConsumer::purge(self) })
    }
}

/// Channel factory over an [`InMemoryBus`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryChannelFactory {
    bus: InMemoryBus,
}

impl InMemoryChannelFactory {
    /// Factory creating channels on `bus`.
    #[must_use]
    pub const fn new(bus: InMemoryBus) -> Self {
        Self { bus }
    }

    /// The underlying bus.
    #[must_use]
    pub const fn bus(&self) -> &InMemoryBus {
        &self.bus
    }

    fn provision(&self, subscription: &Subscription) -> Result<InMemoryConsumer, ChannelError> {
        if let Some(err) = self.bus.creation_failure(&subscription.channel_name) {
            return Err(err);
        }
        match subscription.make_channels {
            OnMissingChannel::Create => {
                self.bus.bind(&subscription.channel_name, &subscription.routing_key);
            },
            OnMissingChannel::Validate if !self.bus.has_channel(&subscription.channel_name) => {
                return Err(ChannelError::Provisioning {
                    channel: subscription.channel_name.clone(),
                    reason: "channel does not exist".to_string(),
                });
            },
            OnMissingChannel::Validate | OnMissingChannel::Assume => {},
        }
        Ok(self
            .bus
            .consumer(&subscription.channel_name, subscription.buffer_size))
    }
}

impl ChannelFactory for InMemoryChannelFactory {
    fn create_sync_channel(&self, subscription: &Subscription) -> Result<Channel, ChannelError> {
        let consumer = self.provision(subscription)?;
        Ok(Channel::new(
            subscription.channel_name.clone(),
            subscription.routing_key.clone(),
            Box::new(consumer),
            subscription.buffer_size,
        ))
    }

    fn create_async_channel(&self, subscription: &Subscription) -> Result<AsyncChannel, ChannelError> {
        let consumer = self.provision(subscription)?;
        Ok(AsyncChannel::new(
            subscription.channel_name.clone(),
            subscription.routing_key.clone(),
            Box::new(consumer),
            subscription.buffer_size,
        ))
    }
}
