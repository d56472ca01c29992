//! Integration tests for the message pumps
//!
//! Runs reactors on threads and proactors on tokio tasks over the in-memory
//! bus, then checks how each message was settled.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use herald_core::channel::ChannelFactory;
use herald_core::handler::{AsyncRequestHandler, BoxFuture, HandlerError};
use herald_core::mapper::{JsonMessageMapper, MessageMapper};
use herald_core::message::{Message, MessageBody, MessageHeader, MessageType, RoutingKey};
use herald_core::request::{Id, Request, RequestContext};
use herald_core::subscription::{MessagePumpType, Subscription};
use herald_core::{Deserialize, Serialize};
use herald_runtime::pipeline::HandlerRegistration;
use herald_runtime::pump::{Proactor, PumpOutcome, Reactor};
use herald_runtime::{CommandProcessor, SubscriberRegistry};
use herald_testing::{
    DeliveryKind, InMemoryBus, InMemoryChannelFactory, init_tracing, wait_until, wait_until_async,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PATIENCE: Duration = Duration::from_secs(5);

// ============================================================================
// Test Fixtures
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ShipParcel {
    id: Id,
    destination: String,
}

impl Request for ShipParcel {
    fn id(&self) -> &Id {
        &self.id
    }
}

fn subscription() -> Subscription {
    Subscription::new("parcels", "parcels.q", "parcels")
        .with_timeout(Duration::from_millis(20))
        .with_empty_channel_delay(Duration::from_millis(5))
        .with_channel_failure_delay(Duration::from_millis(5))
}

fn parcel(id: &str, message_type: MessageType) -> Message {
    let body = serde_json::to_vec(&ShipParcel {
        id: Id::new(id),
        destination: "Lyon".to_string(),
    })
    .unwrap();
    Message::new(
        MessageHeader::new(Id::new(id), RoutingKey::new("parcels"), message_type),
        MessageBody::new(body),
    )
}

fn garbage(id: &str) -> Message {
    Message::new(
        MessageHeader::new(Id::new(id), RoutingKey::new("parcels"), MessageType::Command),
        MessageBody::from("not a parcel"),
    )
}

fn mapper() -> Arc<dyn MessageMapper<ShipParcel>> {
    Arc::new(JsonMessageMapper::<ShipParcel>::new())
}

fn counting(name: &'static str, counter: &Arc<AtomicUsize>) -> HandlerRegistration<ShipParcel> {
    let counter = Arc::clone(counter);
    HandlerRegistration::blocking_fn(name, move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

/// Bind the queue, start a reactor on a thread and hand back its pieces.
struct RunningReactor {
    bus: InMemoryBus,
    channel: Arc<herald_core::channel::Channel>,
    statistics: Arc<herald_runtime::pump::PumpStatistics>,
    thread: std::thread::JoinHandle<PumpOutcome>,
}

impl RunningReactor {
    fn start(registry: SubscriberRegistry, subscription: Subscription) -> Self {
        init_tracing();
        let bus = InMemoryBus::new();
        let factory = InMemoryChannelFactory::new(bus.clone());
        let channel = Arc::new(factory.create_sync_channel(&subscription).unwrap());
        let processor = Arc::new(CommandProcessor::builder(registry).build());
        let reactor = Reactor::new("parcels#0", subscription, Arc::clone(&channel), processor, mapper());
        let statistics = reactor.statistics();
        let thread = std::thread::spawn(move || reactor.run());
        Self {
            bus,
            channel,
            statistics,
            thread,
        }
    }

    fn stop(self) -> PumpOutcome {
        self.channel.stop();
        self.thread.join().unwrap()
    }
}

// ============================================================================
// Reactor
// ============================================================================

#[test]
fn reactor_acknowledges_handled_commands() {
    let handled = Arc::new(AtomicUsize::new(0));
    let reactor = RunningReactor::start(
        SubscriberRegistry::new().with(counting("ship", &handled)),
        subscription(),
    );

    for id in ["p-1", "p-2", "p-3"] {
        reactor.bus.publish(parcel(id, MessageType::Command));
    }

    assert!(wait_until(PATIENCE, || reactor.bus.settled(DeliveryKind::Acknowledged).len() == 3));
    let statistics = Arc::clone(&reactor.statistics);
    assert_eq!(reactor.stop(), PumpOutcome::Quit);

    assert_eq!(handled.load(Ordering::SeqCst), 3);
    let snapshot = statistics.snapshot();
    assert_eq!(snapshot.received, 3);
    assert_eq!(snapshot.acknowledged, 3);
    assert!(!snapshot.running);
    assert_eq!(snapshot.outcome, Some(PumpOutcome::Quit));
}

#[test]
fn reactor_processes_messages_in_arrival_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let registry = SubscriberRegistry::new().with(HandlerRegistration::<ShipParcel>::blocking_fn(
        "ship",
        move |request, _| {
            log.lock().unwrap().push(request.id().to_string());
            Ok(())
        },
    ));
    let reactor = RunningReactor::start(registry, subscription().with_buffer_size(2));

    for id in ["p-1", "p-2", "p-3", "p-4", "p-5"] {
        reactor.bus.publish(parcel(id, MessageType::Command));
    }

    assert!(wait_until(PATIENCE, || seen.lock().unwrap().len() == 5));
    reactor.stop();
    assert_eq!(*seen.lock().unwrap(), vec!["p-1", "p-2", "p-3", "p-4", "p-5"]);
}

#[test]
fn reactor_requeues_deferred_messages_until_the_limit_then_rejects() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let registry = SubscriberRegistry::new().with(HandlerRegistration::<ShipParcel>::blocking_fn(
        "ship",
        move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::defer("warehouse closed"))
        },
    ));
    let reactor = RunningReactor::start(
        registry,
        subscription()
            .with_requeue_count(2)
            .with_requeue_delay(Duration::from_millis(50)),
    );

    reactor.bus.publish(parcel("p-1", MessageType::Command));

    assert!(wait_until(PATIENCE, || !reactor.bus.settled(DeliveryKind::Rejected).is_empty()));
    let bus = reactor.bus.clone();
    reactor.stop();

    let trail: Vec<_> = bus
        .deliveries()
        .into_iter()
        .map(|delivery| (delivery.kind, delivery.handled_count, delivery.delay))
        .collect();
    assert_eq!(
        trail,
        vec![
            (DeliveryKind::Requeued, 1, Some(Duration::from_millis(50))),
            (DeliveryKind::Requeued, 2, Some(Duration::from_millis(50))),
            (DeliveryKind::Rejected, 3, None),
        ]
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[test]
fn reactor_rejects_unrecoverable_failures_without_requeueing() {
    let registry = SubscriberRegistry::new().with(HandlerRegistration::<ShipParcel>::blocking_fn(
        "ship",
        |_, _| Err(HandlerError::failed("unknown destination")),
    ));
    let reactor = RunningReactor::start(registry, subscription().with_requeue_count(5));

    reactor.bus.publish(parcel("p-1", MessageType::Command));
    reactor.bus.publish(parcel("p-2", MessageType::Command));

    assert!(wait_until(PATIENCE, || reactor.bus.settled(DeliveryKind::Rejected).len() == 2));
    let bus = reactor.bus.clone();
    assert_eq!(reactor.stop(), PumpOutcome::Quit);
    assert!(bus.settled(DeliveryKind::Requeued).is_empty());
}

#[test]
fn reactor_quarantines_after_consecutive_unacceptable_messages() {
    let handled = Arc::new(AtomicUsize::new(0));
    let reactor = RunningReactor::start(
        SubscriberRegistry::new().with(counting("ship", &handled)),
        subscription().with_unacceptable_message_limit(2),
    );

    reactor.bus.publish(garbage("g-1"));
    reactor.bus.publish(garbage("g-2"));

    let bus = reactor.bus.clone();
    let statistics = Arc::clone(&reactor.statistics);
    let outcome = reactor.thread.join().unwrap();

    assert_eq!(outcome, PumpOutcome::Quarantined { unacceptable_messages: 2 });
    assert_eq!(bus.settled(DeliveryKind::Rejected).len(), 2);
    assert_eq!(statistics.snapshot().unacceptable, 2);
    assert_eq!(handled.load(Ordering::SeqCst), 0);
}

#[test]
fn a_good_message_resets_the_unacceptable_run() {
    let handled = Arc::new(AtomicUsize::new(0));
    let reactor = RunningReactor::start(
        SubscriberRegistry::new().with(counting("ship", &handled)),
        subscription().with_unacceptable_message_limit(2),
    );

    reactor.bus.publish(garbage("g-1"));
    reactor.bus.publish(parcel("p-1", MessageType::Command));
    reactor.bus.publish(garbage("g-2"));
    reactor.bus.publish(parcel("p-2", MessageType::Command));

    assert!(wait_until(PATIENCE, || handled.load(Ordering::SeqCst) == 2));
    assert_eq!(reactor.stop(), PumpOutcome::Quit);
}

#[test]
fn reactor_rejects_messages_without_a_dispatchable_type() {
    let handled = Arc::new(AtomicUsize::new(0));
    let reactor = RunningReactor::start(
        SubscriberRegistry::new().with(counting("ship", &handled)),
        subscription(),
    );

    reactor.bus.publish(parcel("u-1", MessageType::Unacceptable));
    reactor.bus.publish(parcel("n-1", MessageType::None));

    assert!(wait_until(PATIENCE, || reactor.bus.settled(DeliveryKind::Rejected).len() == 2));
    let statistics = Arc::clone(&reactor.statistics);
    assert_eq!(reactor.stop(), PumpOutcome::Quit);
    assert_eq!(statistics.snapshot().unacceptable, 2);
    assert_eq!(handled.load(Ordering::SeqCst), 0);
}

#[test]
fn reactor_stops_on_configuration_failure() {
    let reactor = RunningReactor::start(SubscriberRegistry::new(), subscription());

    reactor.bus.publish(parcel("p-1", MessageType::Command));

    let bus = reactor.bus.clone();
    let outcome = reactor.thread.join().unwrap();

    assert!(matches!(outcome, PumpOutcome::ConfigurationFailure(_)));
    assert_eq!(bus.settled(DeliveryKind::Rejected), vec![Id::new("p-1")]);
}

#[test]
fn reactor_publishes_events_to_every_handler() {
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let registry = SubscriberRegistry::new()
        .with(counting("label", &first))
        .with(counting("notify", &second));
    let reactor = RunningReactor::start(registry, subscription());

    reactor.bus.publish(parcel("e-1", MessageType::Event));

    assert!(wait_until(PATIENCE, || !reactor.bus.settled(DeliveryKind::Acknowledged).is_empty()));
    reactor.stop();
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[test]
fn reactor_survives_channel_failures() {
    let handled = Arc::new(AtomicUsize::new(0));
    let reactor = RunningReactor::start(
        SubscriberRegistry::new().with(counting("ship", &handled)),
        subscription(),
    );

    reactor.bus.fail_next_receives(2);
    reactor.bus.publish(parcel("p-1", MessageType::Command));

    assert!(wait_until(PATIENCE, || handled.load(Ordering::SeqCst) == 1));
    let statistics = Arc::clone(&reactor.statistics);
    assert_eq!(reactor.stop(), PumpOutcome::Quit);
    assert_eq!(statistics.snapshot().channel_failures, 2);
}

#[test]
fn reactor_settles_an_overrunning_dispatch_by_its_result() {
    let registry = SubscriberRegistry::new().with(HandlerRegistration::<ShipParcel>::blocking_fn(
        "slow",
        |_, _| {
            std::thread::sleep(Duration::from_millis(30));
            Ok(())
        },
    ));
    let subscription = Subscription {
        dispatch_timeout: Duration::from_millis(5),
        ..subscription().with_requeue_count(3)
    };
    let reactor = RunningReactor::start(registry, subscription);

    reactor.bus.publish(parcel("p-1", MessageType::Command));

    assert!(wait_until(PATIENCE, || !reactor.bus.settled(DeliveryKind::Acknowledged).is_empty()));
    let bus = reactor.bus.clone();
    assert_eq!(reactor.stop(), PumpOutcome::Quit);

    let kinds: Vec<_> = bus.deliveries().into_iter().map(|delivery| delivery.kind).collect();
    assert_eq!(kinds, vec![DeliveryKind::Acknowledged]);
}

#[test]
fn stopping_an_idle_reactor_quits() {
    let reactor = RunningReactor::start(SubscriberRegistry::new(), subscription());
    assert!(wait_until(PATIENCE, || reactor.statistics.is_running()));
    assert_eq!(reactor.stop(), PumpOutcome::Quit);
}

// ============================================================================
// Proactor
// ============================================================================

struct AsyncShip {
    handled: Arc<AtomicUsize>,
    stall_first: bool,
}

impl AsyncRequestHandler<ShipParcel> for AsyncShip {
    fn handle<'a>(
        &'a self,
        _request: &'a mut ShipParcel,
        _context: &'a mut RequestContext,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            let attempt = self.handled.fetch_add(1, Ordering::SeqCst);
            if self.stall_first && attempt == 0 {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Ok(())
        })
    }
}

fn async_registry(handled: &Arc<AtomicUsize>, stall_first: bool) -> SubscriberRegistry {
    let shared = Arc::clone(handled);
    SubscriberRegistry::new().with(HandlerRegistration::<ShipParcel>::suspending("ship", move || {
        Ok(AsyncShip {
            handled: Arc::clone(&shared),
            stall_first,
        })
    }))
}

fn proactor(
    bus: &InMemoryBus,
    registry: SubscriberRegistry,
    subscription: Subscription,
) -> (Arc<herald_core::channel::AsyncChannel>, Proactor<ShipParcel>) {
    let subscription = Subscription {
        message_pump_type: MessagePumpType::Proactor,
        ..subscription
    };
    let factory = InMemoryChannelFactory::new(bus.clone());
    let channel = Arc::new(factory.create_async_channel(&subscription).unwrap());
    let processor = Arc::new(CommandProcessor::builder(registry).build());
    let pump = Proactor::new("parcels#0", subscription, Arc::clone(&channel), processor, mapper());
    (channel, pump)
}

#[tokio::test]
async fn proactor_acknowledges_handled_commands() {
    let bus = InMemoryBus::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let (channel, pump) = proactor(&bus, async_registry(&handled, false), subscription());
    let statistics = pump.statistics();
    let task = tokio::spawn(pump.run());

    bus.publish(parcel("p-1", MessageType::Command));
    bus.publish(parcel("p-2", MessageType::Command));

    assert!(wait_until_async(PATIENCE, || bus.settled(DeliveryKind::Acknowledged).len() == 2).await);
    channel.stop();
    assert_eq!(task.await.unwrap(), PumpOutcome::Quit);
    assert_eq!(handled.load(Ordering::SeqCst), 2);
    assert_eq!(statistics.snapshot().acknowledged, 2);
}

#[tokio::test]
async fn proactor_requeues_dispatch_that_overruns_its_deadline() {
    let bus = InMemoryBus::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let subscription = Subscription {
        dispatch_timeout: Duration::from_millis(30),
        ..subscription().with_requeue_count(3)
    };
    let (channel, pump) = proactor(&bus, async_registry(&handled, true), subscription);
    let task = tokio::spawn(pump.run());

    bus.publish(parcel("p-1", MessageType::Command));

    assert!(wait_until_async(PATIENCE, || !bus.settled(DeliveryKind::Acknowledged).is_empty()).await);
    channel.stop();
    task.await.unwrap();

    let kinds: Vec<_> = bus.deliveries().into_iter().map(|delivery| delivery.kind).collect();
    assert_eq!(kinds, vec![DeliveryKind::Requeued, DeliveryKind::Acknowledged]);
    assert_eq!(handled.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn proactor_quarantines_after_consecutive_unacceptable_messages() {
    let bus = InMemoryBus::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let (_channel, pump) = proactor(
        &bus,
        async_registry(&handled, false),
        subscription().with_unacceptable_message_limit(3),
    );
    let task = tokio::spawn(pump.run());

    for id in ["g-1", "g-2", "g-3"] {
        bus.publish(garbage(id));
    }

    let outcome = tokio::time::timeout(PATIENCE, task).await.unwrap().unwrap();
    assert_eq!(outcome, PumpOutcome::Quarantined { unacceptable_messages: 3 });
    assert_eq!(bus.settled(DeliveryKind::Rejected).len(), 3);
}

#[tokio::test]
async fn proactor_stops_when_only_blocking_handlers_exist() {
    let bus = InMemoryBus::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let (_channel, pump) = proactor(
        &bus,
        SubscriberRegistry::new().with(counting("ship", &handled)),
        subscription(),
    );
    let task = tokio::spawn(pump.run());

    bus.publish(parcel("p-1", MessageType::Command));

    let outcome = tokio::time::timeout(PATIENCE, task).await.unwrap().unwrap();
    assert!(matches!(outcome, PumpOutcome::ConfigurationFailure(_)));
    assert_eq!(handled.load(Ordering::SeqCst), 0);
}
