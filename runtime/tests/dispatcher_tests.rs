//! Integration tests for the dispatcher
//!
//! Lifecycle, health and failure handling of performers over the in-memory
//! bus.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use herald_core::handler::{AsyncRequestHandler, BoxFuture, HandlerError};
use herald_core::mapper::{JsonMessageMapper, Publication};
use herald_core::message::{Message, MessageBody, MessageHeader, MessageType, RoutingKey};
use herald_core::request::{Id, Request, RequestContext};
use herald_core::subscription::{MessagePumpType, Subscription};
use herald_core::{Deserialize, Serialize};
use herald_runtime::health::HealthStatus;
use herald_runtime::pipeline::HandlerRegistration;
use herald_runtime::{
    CommandProcessor, Dispatcher, DispatcherError, DispatcherState, MapperRegistry, PumpOutcome,
    SubscriberRegistry,
};
use herald_testing::{DeliveryKind, InMemoryBus, InMemoryChannelFactory, init_tracing, wait_until_async};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const PATIENCE: Duration = Duration::from_secs(5);

// ============================================================================
// Test Fixtures
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IssueInvoice {
    id: Id,
    amount_cents: u64,
}

impl Request for IssueInvoice {
    fn id(&self) -> &Id {
        &self.id
    }
}

fn invoice(id: &str) -> Message {
    let body = serde_json::to_vec(&IssueInvoice {
        id: Id::new(id),
        amount_cents: 1_250,
    })
    .unwrap();
    Message::new(
        MessageHeader::new(Id::new(id), RoutingKey::new("invoices"), MessageType::Command),
        MessageBody::new(body),
    )
}

fn subscription(name: &str) -> Subscription {
    Subscription::new(name, format!("{name}.q"), "invoices")
        .with_timeout(Duration::from_millis(20))
        .with_empty_channel_delay(Duration::from_millis(5))
        .with_channel_failure_delay(Duration::from_millis(5))
}

fn invoice_mappers() -> MapperRegistry {
    MapperRegistry::new().with_json::<IssueInvoice>(Publication::command("invoices"))
}

fn counting_registry(handled: &Arc<AtomicUsize>) -> SubscriberRegistry {
    let counter = Arc::clone(handled);
    SubscriberRegistry::new().with(HandlerRegistration::<IssueInvoice>::blocking_fn(
        "issue-invoice",
        move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    ))
}

fn processor(registry: SubscriberRegistry) -> Arc<CommandProcessor> {
    Arc::new(CommandProcessor::builder(registry).mappers(invoice_mappers()).build())
}

fn dispatcher(bus: &InMemoryBus, registry: SubscriberRegistry, subscription: Subscription) -> Dispatcher {
    init_tracing();
    Dispatcher::builder()
        .command_processor(processor(registry))
        .channel_factory(Arc::new(InMemoryChannelFactory::new(bus.clone())))
        .subscription::<IssueInvoice>(subscription)
        .shutdown_timeout(Duration::from_secs(2))
        .build()
        .unwrap()
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn receive_then_end_walks_the_lifecycle() {
    let bus = InMemoryBus::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let dispatcher = dispatcher(&bus, counting_registry(&handled), subscription("invoices").with_performers(2));
    let mut transitions = dispatcher.subscribe_state_changes();
    assert_eq!(dispatcher.state(), DispatcherState::Awaiting);

    dispatcher.receive().unwrap();
    assert_eq!(dispatcher.state(), DispatcherState::Running);

    for id in ["i-1", "i-2", "i-3", "i-4"] {
        bus.publish(invoice(id));
    }
    assert!(wait_until_async(PATIENCE, || handled.load(Ordering::SeqCst) == 4).await);

    dispatcher.end().await.unwrap();
    assert_eq!(dispatcher.state(), DispatcherState::Stopped);

    assert_eq!(transitions.recv().await.unwrap(), DispatcherState::Running);
    assert_eq!(transitions.recv().await.unwrap(), DispatcherState::Stopping);
    assert_eq!(transitions.recv().await.unwrap(), DispatcherState::Stopped);
    assert_eq!(bus.settled(DeliveryKind::Acknowledged).len(), 4);
}

#[tokio::test]
async fn performers_are_named_after_their_subscription() {
    let bus = InMemoryBus::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let dispatcher = dispatcher(&bus, counting_registry(&handled), subscription("billing").with_performers(3));

    dispatcher.receive().unwrap();
    let mut names: Vec<_> = dispatcher.statistics().into_iter().map(|(name, _)| name).collect();
    names.sort();
    dispatcher.end().await.unwrap();

    assert_eq!(names, vec!["billing#0", "billing#1", "billing#2"]);
}

#[tokio::test]
async fn receive_and_end_are_ignored_in_the_wrong_state() {
    let bus = InMemoryBus::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let dispatcher = dispatcher(&bus, counting_registry(&handled), subscription("invoices"));

    dispatcher.end().await.unwrap();
    assert_eq!(dispatcher.state(), DispatcherState::Awaiting);

    dispatcher.receive().unwrap();
    dispatcher.receive().unwrap();
    assert_eq!(dispatcher.statistics().len(), 1);

    dispatcher.end().await.unwrap();
    dispatcher.receive().unwrap();
    assert_eq!(dispatcher.state(), DispatcherState::Stopped);
}

#[tokio::test]
async fn statistics_report_every_performer() {
    let bus = InMemoryBus::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let dispatcher = dispatcher(&bus, counting_registry(&handled), subscription("invoices"));

    dispatcher.receive().unwrap();
    bus.publish(invoice("i-1"));
    bus.publish(invoice("i-2"));
    assert!(wait_until_async(PATIENCE, || {
        dispatcher
            .statistics()
            .iter()
            .any(|(_, snapshot)| snapshot.acknowledged == 2)
    })
    .await);

    dispatcher.end().await.unwrap();
    let (name, snapshot) = dispatcher.statistics().pop().unwrap();
    assert_eq!(name, "invoices#0");
    assert_eq!(snapshot.received, 2);
    assert_eq!(snapshot.outcome, Some(PumpOutcome::Quit));
}

#[tokio::test]
async fn end_times_out_on_a_stuck_performer() {
    let bus = InMemoryBus::new();
    let registry = SubscriberRegistry::new().with(HandlerRegistration::<IssueInvoice>::blocking_fn(
        "slow-invoice",
        |_, _| {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        },
    ));
    let dispatcher = Dispatcher::builder()
        .command_processor(processor(registry))
        .channel_factory(Arc::new(InMemoryChannelFactory::new(bus.clone())))
        .subscription::<IssueInvoice>(subscription("invoices"))
        .shutdown_timeout(Duration::from_millis(50))
        .build()
        .unwrap();

    dispatcher.receive().unwrap();
    bus.publish(invoice("i-1"));
    assert!(wait_until_async(PATIENCE, || {
        dispatcher.statistics().iter().any(|(_, snapshot)| snapshot.received == 1)
    })
    .await);

    let err = dispatcher.end().await.unwrap_err();
    assert!(matches!(err, DispatcherError::ShutdownTimeout(1)));
    assert_eq!(dispatcher.state(), DispatcherState::Stopped);
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn health_follows_the_lifecycle() {
    let bus = InMemoryBus::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let dispatcher = dispatcher(&bus, counting_registry(&handled), subscription("invoices"));

    let before = dispatcher.health();
    assert_eq!(before.status, HealthStatus::Degraded);
    assert_eq!(before.checks.len(), 1);

    dispatcher.receive().unwrap();
    assert!(wait_until_async(PATIENCE, || dispatcher.health().is_healthy()).await);
    let running = dispatcher.health();
    assert_eq!(running.check("invoices#0").unwrap().status, HealthStatus::Healthy);
    assert_eq!(running.check("invoices#0").unwrap().metadata("received"), Some("0"));

    dispatcher.end().await.unwrap();
    let after = dispatcher.health();
    assert_eq!(after.check("dispatcher").unwrap().status, HealthStatus::Degraded);
    assert_eq!(after.check("invoices#0").unwrap().status, HealthStatus::Healthy);
}

#[tokio::test]
async fn quarantined_performers_are_unhealthy() {
    let bus = InMemoryBus::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let dispatcher = dispatcher(
        &bus,
        counting_registry(&handled),
        subscription("invoices").with_unacceptable_message_limit(1),
    );

    dispatcher.receive().unwrap();
    bus.publish(Message::new(
        MessageHeader::new(Id::new("bad"), RoutingKey::new("invoices"), MessageType::Command),
        MessageBody::from("{"),
    ));

    assert!(wait_until_async(PATIENCE, || dispatcher.health().status == HealthStatus::Unhealthy).await);
    let report = dispatcher.health();
    let performer = report.check("invoices#0").unwrap();
    assert!(performer.message.as_deref().unwrap().contains("quarantined"));
    assert_eq!(report.check("dispatcher").unwrap().status, HealthStatus::Healthy);

    dispatcher.end().await.unwrap();
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn builder_requires_a_processor_and_a_channel_factory() {
    let err = Dispatcher::builder()
        .channel_factory(Arc::new(InMemoryChannelFactory::default()))
        .build()
        .unwrap_err();
    assert!(matches!(err, DispatcherError::Incomplete(_)));

    let err = Dispatcher::builder()
        .command_processor(processor(SubscriberRegistry::new()))
        .build()
        .unwrap_err();
    assert!(matches!(err, DispatcherError::Incomplete(_)));
}

#[test]
fn builder_rejects_duplicate_subscription_names() {
    let err = Dispatcher::builder()
        .command_processor(processor(SubscriberRegistry::new()))
        .channel_factory(Arc::new(InMemoryChannelFactory::default()))
        .subscription::<IssueInvoice>(subscription("invoices"))
        .subscription::<IssueInvoice>(subscription("invoices"))
        .build()
        .unwrap_err();

    assert!(matches!(err, DispatcherError::DuplicateSubscription(name) if name == "invoices"));
}

#[test]
fn builder_requires_a_mapper_unless_one_is_given() {
    let bare = Arc::new(CommandProcessor::builder(SubscriberRegistry::new()).build());
    let err = Dispatcher::builder()
        .command_processor(Arc::clone(&bare))
        .channel_factory(Arc::new(InMemoryChannelFactory::default()))
        .subscription::<IssueInvoice>(subscription("invoices"))
        .build()
        .unwrap_err();
    assert!(matches!(err, DispatcherError::MissingMapper { .. }));

    let built = Dispatcher::builder()
        .command_processor(bare)
        .channel_factory(Arc::new(InMemoryChannelFactory::default()))
        .subscription_with_mapper::<IssueInvoice>(
            subscription("invoices"),
            Arc::new(JsonMessageMapper::<IssueInvoice>::new()),
        )
        .build();
    assert!(built.is_ok());
}

#[test]
fn receive_fails_fast_on_unhandled_request_types() {
    let bus = InMemoryBus::new();
    let dispatcher = dispatcher(&bus, SubscriberRegistry::new(), subscription("invoices"));

    let err = dispatcher.receive().unwrap_err();

    assert!(matches!(err, DispatcherError::Configuration { subscription, .. } if subscription == "invoices"));
    assert_eq!(dispatcher.state(), DispatcherState::Awaiting);
    assert!(dispatcher.statistics().is_empty());
}

#[test]
fn receive_reports_channel_creation_failures() {
    let bus = InMemoryBus::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let dispatcher = dispatcher(&bus, counting_registry(&handled), subscription("invoices"));
    bus.fail_channel_creation(true);

    let err = dispatcher.receive().unwrap_err();

    assert!(matches!(err, DispatcherError::Channel { performer, .. } if performer == "invoices#0"));
    assert_eq!(dispatcher.state(), DispatcherState::Awaiting);
}

#[test]
fn proactor_subscriptions_need_a_runtime() {
    let bus = InMemoryBus::new();
    let dispatcher = dispatcher(
        &bus,
        async_registry(&Arc::new(AtomicUsize::new(0))),
        subscription("invoices").with_pump(MessagePumpType::Proactor),
    );

    let err = dispatcher.receive().unwrap_err();

    assert!(matches!(err, DispatcherError::NoRuntime(name) if name == "invoices"));
}

// ============================================================================
// Proactor
// ============================================================================

struct AsyncIssueInvoice {
    handled: Arc<AtomicUsize>,
}

impl AsyncRequestHandler<IssueInvoice> for AsyncIssueInvoice {
    fn handle<'a>(
        &'a self,
        request: &'a mut IssueInvoice,
        _context: &'a mut RequestContext,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            if request.amount_cents == 0 {
                return Err(HandlerError::failed("empty invoice"));
            }
            tokio::task::yield_now().await;
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

fn async_registry(handled: &Arc<AtomicUsize>) -> SubscriberRegistry {
    let shared = Arc::clone(handled);
    SubscriberRegistry::new().with(HandlerRegistration::<IssueInvoice>::suspending(
        "issue-invoice",
        move || {
            Ok(AsyncIssueInvoice {
                handled: Arc::clone(&shared),
            })
        },
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn proactor_subscriptions_run_as_tasks() {
    let bus = InMemoryBus::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let dispatcher = dispatcher(
        &bus,
        async_registry(&handled),
        subscription("invoices")
            .with_pump(MessagePumpType::Proactor)
            .with_performers(2),
    );

    dispatcher.receive().unwrap();
    for id in ["i-1", "i-2", "i-3"] {
        bus.publish(invoice(id));
    }

    assert!(wait_until_async(PATIENCE, || handled.load(Ordering::SeqCst) == 3).await);
    dispatcher.end().await.unwrap();
    assert_eq!(bus.settled(DeliveryKind::Acknowledged).len(), 3);
    assert!(
        dispatcher
            .statistics()
            .iter()
            .all(|(_, snapshot)| snapshot.outcome == Some(PumpOutcome::Quit))
    );
}

#[tokio::test]
async fn proactor_subscriptions_reject_blocking_only_handlers() {
    let bus = InMemoryBus::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let dispatcher = dispatcher(
        &bus,
        counting_registry(&handled),
        subscription("invoices").with_pump(MessagePumpType::Proactor),
    );

    let err = dispatcher.receive().unwrap_err();

    assert!(matches!(err, DispatcherError::Configuration { .. }));
}
