//! Integration tests for the command processor
//!
//! Exercises `send`, `publish`, `post` and `call` against in-memory
//! collaborators.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use herald_core::channel::MessageConsumer;
use herald_core::handler::{AsyncRequestHandler, BoxFuture, HandlerError};
use herald_core::mapper::Publication;
use herald_core::message::{Message, MessageBody, MessageHeader, MessageType, RoutingKey};
use herald_core::request::{Id, Request, RequestContext, RequestContextFactory};
use herald_core::{Deserialize, Serialize};
use herald_runtime::outbox::OutboxConfig;
use herald_runtime::pipeline::HandlerRegistration;
use herald_runtime::retry::RetryPolicy;
use herald_runtime::{
    CommandProcessor, ConfigurationError, DispatchError, ExecutionMode, MapperRegistry,
    ProducerRegistry, SubscriberRegistry,
};
use herald_testing::{DeliveryKind, InMemoryBus, InMemoryChannelFactory, InMemoryOutbox};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PlaceOrder {
    id: Id,
    customer: String,
}

impl PlaceOrder {
    fn new(id: &str) -> Self {
        Self {
            id: Id::new(id),
            customer: "ada".to_string(),
        }
    }
}

impl Request for PlaceOrder {
    fn id(&self) -> &Id {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderPlaced {
    id: Id,
}

impl Request for OrderPlaced {
    fn id(&self) -> &Id {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct QuotePrice {
    id: Id,
    sku: String,
}

impl Request for QuotePrice {
    fn id(&self) -> &Id {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PriceQuoted {
    id: Id,
    cents: u64,
}

impl Request for PriceQuoted {
    fn id(&self) -> &Id {
        &self.id
    }
}

fn recording(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> HandlerRegistration<OrderPlaced> {
    let log = Arc::clone(log);
    HandlerRegistration::<OrderPlaced>::blocking_fn(name, move |request, _| {
        log.lock().unwrap().push(format!("{name}:{}", request.id()));
        Ok(())
    })
}

fn order_mappers() -> MapperRegistry {
    MapperRegistry::new()
        .with_json::<PlaceOrder>(Publication::command("orders"))
        .with_json::<OrderPlaced>(Publication::event("orders.placed"))
}

fn outbox_processor(bus: &InMemoryBus, outbox: &InMemoryOutbox) -> CommandProcessor {
    CommandProcessor::builder(SubscriberRegistry::new())
        .mappers(order_mappers())
        .producers(ProducerRegistry::new().with_dual_producer("orders", Arc::new(bus.clone())))
        .outbox(Arc::new(outbox.clone()))
        .async_outbox(Arc::new(outbox.clone()))
        .outbox_config(OutboxConfig::default().with_retry(RetryPolicy::none()))
        .build()
}

// ============================================================================
// Send
// ============================================================================

#[test]
fn send_runs_the_single_handler() {
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&handled);
    let registry = SubscriberRegistry::new().with(HandlerRegistration::<PlaceOrder>::blocking_fn(
        "place-order",
        move |request, _| {
            assert_eq!(request.customer, "ada");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    ));
    let processor = CommandProcessor::builder(registry).build();

    processor.send(&mut PlaceOrder::new("o-1")).unwrap();

    assert_eq!(handled.load(Ordering::SeqCst), 1);
}

#[test]
fn send_requires_exactly_one_handler() {
    let empty = CommandProcessor::builder(SubscriberRegistry::new()).build();
    let err = empty.send(&mut PlaceOrder::new("o-1")).unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Configuration(ConfigurationError::MissingHandler(_))
    ));

    let registry = SubscriberRegistry::new()
        .with(HandlerRegistration::<PlaceOrder>::blocking_fn("first", |_, _| Ok(())))
        .with(HandlerRegistration::<PlaceOrder>::blocking_fn("second", |_, _| Ok(())));
    let crowded = CommandProcessor::builder(registry).build();
    let err = crowded.send(&mut PlaceOrder::new("o-1")).unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Configuration(ConfigurationError::MultipleHandlers { count: 2, .. })
    ));
}

#[test]
fn handler_failures_name_the_handler() {
    let registry = SubscriberRegistry::new().with(HandlerRegistration::<PlaceOrder>::blocking_fn(
        "place-order",
        |_, _| Err(HandlerError::defer("inventory locked")),
    ));
    let processor = CommandProcessor::builder(registry).build();

    let err = processor.send(&mut PlaceOrder::new("o-1")).unwrap_err();

    assert!(err.is_recoverable());
    assert!(matches!(err, DispatchError::Handler { handler: "place-order", .. }));
}

#[test]
fn handlers_share_the_context_created_by_the_factory() {
    struct Tenant;

    impl RequestContextFactory for Tenant {
        fn create(&self) -> RequestContext {
            let mut context = RequestContext::new();
            context.insert("tenant", "acme");
            context
        }
    }

    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    let registry = SubscriberRegistry::new().with(HandlerRegistration::<PlaceOrder>::blocking_fn(
        "place-order",
        move |_, context| {
            *sink.lock().unwrap() = context.get("tenant").cloned();
            Ok(())
        },
    ));
    let processor = CommandProcessor::builder(registry)
        .context_factory(Arc::new(Tenant))
        .build();

    processor.send(&mut PlaceOrder::new("o-1")).unwrap();

    assert_eq!(*seen.lock().unwrap(), Some(serde_json::json!("acme")));
}

struct AsyncPlaceOrder {
    handled: Arc<AtomicUsize>,
}

impl AsyncRequestHandler<PlaceOrder> for AsyncPlaceOrder {
    fn handle<'a>(
        &'a self,
        _request: &'a mut PlaceOrder,
        _context: &'a mut RequestContext,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[tokio::test]
async fn send_async_runs_suspending_handlers() {
    let handled = Arc::new(AtomicUsize::new(0));
    let shared = Arc::clone(&handled);
    let registry = SubscriberRegistry::new().with(HandlerRegistration::<PlaceOrder>::suspending(
        "place-order",
        move || {
            Ok(AsyncPlaceOrder {
                handled: Arc::clone(&shared),
            })
        },
    ));
    let processor = CommandProcessor::builder(registry).build();

    processor.send_async(&mut PlaceOrder::new("o-1")).await.unwrap();

    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert!(processor.validate::<PlaceOrder>(ExecutionMode::Suspending).is_ok());
    assert!(matches!(
        processor.validate::<PlaceOrder>(ExecutionMode::Blocking),
        Err(ConfigurationError::ModeMismatch { .. })
    ));
}

// ============================================================================
// Publish
// ============================================================================

#[test]
fn publish_runs_every_handler_in_registration_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = SubscriberRegistry::new()
        .with(recording("billing", &log))
        .with(recording("shipping", &log));
    let processor = CommandProcessor::builder(registry).build();

    processor
        .publish(&mut OrderPlaced { id: Id::new("o-1") })
        .unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["billing:o-1", "shipping:o-1"]);
}

#[test]
fn publish_continues_past_failures_and_aggregates_them() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = SubscriberRegistry::new()
        .with(recording("billing", &log))
        .with(HandlerRegistration::<OrderPlaced>::blocking_fn("audit", |_, _| {
            Err(HandlerError::failed("audit log full"))
        }))
        .with(recording("shipping", &log));
    let processor = CommandProcessor::builder(registry).build();

    let err = processor
        .publish(&mut OrderPlaced { id: Id::new("o-1") })
        .unwrap_err();

    match err {
        DispatchError::Aggregate { total, failures } => {
            assert_eq!(total, 3);
            assert_eq!(failures.len(), 1);
            assert!(matches!(failures[0], DispatchError::Handler { handler: "audit", .. }));
        },
        other => panic!("expected an aggregate, got {other}"),
    }
    assert_eq!(log.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn publishing_without_subscribers_succeeds() {
    let processor = CommandProcessor::builder(SubscriberRegistry::new()).build();

    processor
        .publish(&mut OrderPlaced { id: Id::new("o-1") })
        .unwrap();
    processor
        .publish_async(&mut OrderPlaced { id: Id::new("o-2") })
        .await
        .unwrap();
}

// ============================================================================
// Post
// ============================================================================

#[test]
fn post_deposits_and_sends_the_message() {
    let bus = InMemoryBus::new();
    let outbox = InMemoryOutbox::new();
    let processor = outbox_processor(&bus, &outbox);

    let id = processor.post(&PlaceOrder::new("o-1")).unwrap();

    assert_eq!(id, Id::new("o-1"));
    let published = bus.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic().as_str(), "orders");
    assert_eq!(published[0].message_type(), MessageType::Command);
    assert!(outbox.entry(&id).unwrap().dispatched_at.is_some());
}

#[tokio::test]
async fn post_async_uses_the_suspending_outbox() {
    let bus = InMemoryBus::new();
    let outbox = InMemoryOutbox::new();
    let processor = outbox_processor(&bus, &outbox);

    processor.post_async(&PlaceOrder::new("o-1")).await.unwrap();

    assert_eq!(bus.published().len(), 1);
    assert!(outbox.outstanding_ids().is_empty());
}

#[test]
fn deposited_messages_wait_for_an_explicit_clear() {
    let bus = InMemoryBus::new();
    let outbox = InMemoryOutbox::new();
    let processor = outbox_processor(&bus, &outbox);

    let ids = processor
        .deposit_post(&[PlaceOrder::new("o-1"), PlaceOrder::new("o-2")], None)
        .unwrap();
    assert!(bus.published().is_empty());
    assert_eq!(outbox.outstanding_ids().len(), 2);

    let report = processor.clear_outbox(&ids).unwrap();

    assert_eq!(report.dispatched, ids);
    assert_eq!(bus.published().len(), 2);
}

#[test]
fn post_without_an_outbox_is_a_configuration_error() {
    let processor = CommandProcessor::builder(SubscriberRegistry::new())
        .mappers(order_mappers())
        .build();

    let err = processor.post(&PlaceOrder::new("o-1")).unwrap_err();

    assert!(matches!(
        err,
        DispatchError::Configuration(ConfigurationError::MissingOutbox)
    ));
}

#[test]
fn post_without_a_mapper_fails() {
    let outbox = InMemoryOutbox::new();
    let processor = CommandProcessor::builder(SubscriberRegistry::new())
        .outbox(Arc::new(outbox.clone()))
        .build();

    assert!(processor.post(&PlaceOrder::new("o-1")).is_err());
    assert!(outbox.is_empty());
}

#[test]
fn context_partition_key_reaches_the_message() {
    struct Partitioned;

    impl RequestContextFactory for Partitioned {
        fn create(&self) -> RequestContext {
            RequestContext::new().with_partition_key("customer-ada")
        }
    }

    let bus = InMemoryBus::new();
    let outbox = InMemoryOutbox::new();
    let processor = CommandProcessor::builder(SubscriberRegistry::new())
        .mappers(order_mappers())
        .producers(ProducerRegistry::new().with_dual_producer("orders", Arc::new(bus.clone())))
        .outbox(Arc::new(outbox))
        .context_factory(Arc::new(Partitioned))
        .build();

    processor.post(&PlaceOrder::new("o-1")).unwrap();

    assert_eq!(
        bus.published()[0].header.partition_key.as_deref(),
        Some("customer-ada")
    );
}

// ============================================================================
// Call
// ============================================================================

fn call_processor(bus: &InMemoryBus) -> CommandProcessor {
    CommandProcessor::builder(SubscriberRegistry::new())
        .mappers(
            MapperRegistry::new()
                .with_json::<QuotePrice>(Publication::command("quotes"))
                .with_json::<PriceQuoted>(Publication::command("quotes.replies")),
        )
        .producers(ProducerRegistry::new().with_dual_producer("quotes", Arc::new(bus.clone())))
        .reply_channel_factory(Arc::new(InMemoryChannelFactory::new(bus.clone())))
        .build()
}

fn reply_to(request: &Message, correlation_id: Id, cents: u64) -> Message {
    let topic = request.header.reply_to.clone().unwrap();
    let body = serde_json::to_vec(&PriceQuoted {
        id: Id::random(),
        cents,
    })
    .unwrap();
    Message::new(
        MessageHeader::new(Id::random(), topic, MessageType::Command).with_correlation_id(correlation_id),
        MessageBody::new(body),
    )
}

/// Answer the next request on `quotes`, first with a stray reply when `stray` is set.
fn spawn_responder(bus: &InMemoryBus, stray: bool) -> std::thread::JoinHandle<()> {
    let requests = bus.consumer("quotes.q", 1);
    let bus = bus.clone();
    std::thread::spawn(move || {
        let request = loop {
            if let Some(message) = requests.receive(Duration::from_millis(50)).unwrap().pop() {
                break message;
            }
        };
        requests.acknowledge(&request).unwrap();
        let correlation_id = request.header.correlation_id.clone().unwrap();
        if stray {
            bus.publish(reply_to(&request, Id::new("someone-else"), 1));
        }
        bus.publish(reply_to(&request, correlation_id, 1299));
    })
}

#[test]
fn call_returns_the_correlated_reply() {
    let bus = InMemoryBus::new();
    bus.bind("quotes.q", &RoutingKey::new("quotes"));
    let processor = call_processor(&bus);
    let responder = spawn_responder(&bus, false);

    let reply: PriceQuoted = processor
        .call(
            &QuotePrice {
                id: Id::new("q-1"),
                sku: "sku-1".to_string(),
            },
            Duration::from_secs(5),
        )
        .unwrap();

    responder.join().unwrap();
    assert_eq!(reply.cents, 1299);
    let request = &bus.published()[0];
    assert_eq!(request.header.correlation_id, Some(Id::new("q-1")));
    assert!(request
        .header
        .reply_to
        .as_ref()
        .unwrap()
        .as_str()
        .starts_with("quotes.reply."));
}

#[test]
fn call_rejects_replies_for_other_requests() {
    let bus = InMemoryBus::new();
    bus.bind("quotes.q", &RoutingKey::new("quotes"));
    let processor = call_processor(&bus);
    let responder = spawn_responder(&bus, true);

    let reply: PriceQuoted = processor
        .call(
            &QuotePrice {
                id: Id::new("q-1"),
                sku: "sku-1".to_string(),
            },
            Duration::from_secs(5),
        )
        .unwrap();

    responder.join().unwrap();
    assert_eq!(reply.cents, 1299);
    assert_eq!(bus.settled(DeliveryKind::Rejected).len(), 1);
}

#[test]
fn call_with_an_unbounded_timeout_waits_for_the_reply() {
    let bus = InMemoryBus::new();
    bus.bind("quotes.q", &RoutingKey::new("quotes"));
    let processor = call_processor(&bus);
    let responder = spawn_responder(&bus, false);

    let reply = processor
        .call::<QuotePrice, PriceQuoted>(
            &QuotePrice {
                id: Id::new("q-1"),
                sku: "sku-1".to_string(),
            },
            Duration::MAX,
        )
        .unwrap();

    responder.join().unwrap();
    assert_eq!(reply.cents, 1299);
}

#[test]
fn call_times_out_without_a_reply() {
    let bus = InMemoryBus::new();
    let processor = call_processor(&bus);

    let err = processor
        .call::<QuotePrice, PriceQuoted>(
            &QuotePrice {
                id: Id::new("q-1"),
                sku: "sku-1".to_string(),
            },
            Duration::from_millis(150),
        )
        .unwrap_err();

    assert!(matches!(err, DispatchError::ReplyTimeout(timeout) if timeout == Duration::from_millis(150)));
}

#[test]
fn call_needs_a_reply_channel_factory() {
    let processor = CommandProcessor::builder(SubscriberRegistry::new())
        .mappers(
            MapperRegistry::new()
                .with_json::<QuotePrice>(Publication::command("quotes"))
                .with_json::<PriceQuoted>(Publication::command("quotes.replies")),
        )
        .build();

    let err = processor
        .call::<QuotePrice, PriceQuoted>(
            &QuotePrice {
                id: Id::new("q-1"),
                sku: "sku-1".to_string(),
            },
            Duration::from_millis(50),
        )
        .unwrap_err();

    assert!(matches!(
        err,
        DispatchError::Configuration(ConfigurationError::MissingReplyChannelFactory)
    ));
}
