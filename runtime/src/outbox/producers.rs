//! Producers keyed by topic.

use herald_core::message::RoutingKey;
use herald_core::producer::{AsyncMessageProducer, MessageProducer};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default, Clone)]
struct TopicProducers {
    blocking: Option<Arc<dyn MessageProducer>>,
    suspending: Option<Arc<dyn AsyncMessageProducer>>,
}

/// One blocking and/or one suspending producer per topic.
#[derive(Default, Clone)]
pub struct ProducerRegistry {
    producers: HashMap<RoutingKey, TopicProducers>,
}

impl ProducerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the blocking producer for `topic`.
    #[must_use]
    pub fn with_producer(mut self, topic: impl Into<RoutingKey>, producer: Arc<dyn MessageProducer>) -> Self {
        self.producers.entry(topic.into()).or_default().blocking = Some(producer);
        self
    }

    /// Register the suspending producer for `topic`.
    #[must_use]
    pub fn with_async_producer(
        mut self,
        topic: impl Into<RoutingKey>,
        producer: Arc<dyn AsyncMessageProducer>,
    ) -> Self {
        self.producers.entry(topic.into()).or_default().suspending = Some(producer);
        self
    }

    /// Register a producer that offers both flavours.
    #[must_use]
    pub fn with_dual_producer<P>(self, topic: impl Into<RoutingKey>, producer: Arc<P>) -> Self
    where
        P: MessageProducer + AsyncMessageProducer + 'static,
    {
        let topic = topic.into();
        let blocking: Arc<dyn MessageProducer> = producer.clone();
        let suspending: Arc<dyn AsyncMessageProducer> = producer;
        self.with_producer(topic.clone(), blocking)
            .with_async_producer(topic, suspending)
    }

    /// Blocking producer for `topic`.
    #[must_use]
    pub fn blocking(&self, topic: &RoutingKey) -> Option<Arc<dyn MessageProducer>> {
        self.producers.get(topic).and_then(|p| p.blocking.clone())
    }

    /// Suspending producer for `topic`.
    #[must_use]
    pub fn suspending(&self, topic: &RoutingKey) -> Option<Arc<dyn AsyncMessageProducer>> {
        self.producers.get(topic).and_then(|p| p.suspending.clone())
    }

    /// Registered topics.
    #[must_use]
    pub fn topics(&self) -> Vec<&RoutingKey> {
        self.producers.keys().collect()
    }
}

impl std::fmt::Debug for ProducerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerRegistry")
            .field("topics", &self.topics())
            .finish()
    }
}
