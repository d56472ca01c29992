//! Pipeline and processor benchmarks
//!
//! - Bare `send` against a single handler
//! - `send` through a stack of QoS steps
//! - `publish` fan-out
//! - Shape resolution, cold and cached
//! - Suspending `send_async`
//!
//! Run with: `cargo bench`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use herald_core::handler::{AsyncRequestHandler, BoxFuture, HandlerError};
use herald_core::request::{Id, Request, RequestContext};
use herald_core::{Deserialize, Serialize};
use herald_runtime::pipeline::{HandlerRegistration, InboxConfiguration};
use herald_runtime::policy::DEFAULT_RETRY_POLICY;
use herald_runtime::{CommandProcessor, PipelineBuilder, PolicyRegistry, SubscriberRegistry};
use std::sync::Arc;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Tick {
    id: Id,
    value: u64,
}

impl Request for Tick {
    fn id(&self) -> &Id {
        &self.id
    }
}

fn tick() -> Tick {
    Tick {
        id: Id::new("tick-1"),
        value: 7,
    }
}

fn noop(name: &'static str) -> HandlerRegistration<Tick> {
    HandlerRegistration::blocking_fn(name, |request, _| {
        black_box(request.value);
        Ok(())
    })
}

fn decorated(name: &'static str) -> HandlerRegistration<Tick> {
    noop(name)
        .logging(30, tracing::Level::DEBUG)
        .validate(20, |tick: &Tick| if tick.value > 0 { Ok(()) } else { Err("zero".to_string()) })
        .retry(10, DEFAULT_RETRY_POLICY)
}

struct AsyncNoop;

impl AsyncRequestHandler<Tick> for AsyncNoop {
    fn handle<'a>(
        &'a self,
        request: &'a mut Tick,
        _context: &'a mut RequestContext,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            black_box(request.value);
            Ok(())
        })
    }
}

/// Single handler, no decorators
fn benchmark_send(c: &mut Criterion) {
    let mut group = c.benchmark_group("send");
    group.throughput(Throughput::Elements(1));

    let bare = CommandProcessor::builder(SubscriberRegistry::new().with(noop("bare"))).build();
    group.bench_function("bare", |b| {
        let mut request = tick();
        b.iter(|| bare.send(black_box(&mut request)).expect("send"));
    });

    let stacked = CommandProcessor::builder(SubscriberRegistry::new().with(decorated("stacked"))).build();
    group.bench_function("logging_validate_retry", |b| {
        let mut request = tick();
        b.iter(|| stacked.send(black_box(&mut request)).expect("send"));
    });

    group.finish();
}

/// Events fan out to every subscribed handler
fn benchmark_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish");

    for handlers in [1_usize, 4, 16] {
        let mut registry = SubscriberRegistry::new();
        for _ in 0..handlers {
            registry.register(noop("listener"));
        }
        let processor = CommandProcessor::builder(registry).build();

        group.throughput(Throughput::Elements(handlers as u64));
        group.bench_function(format!("{handlers}_handlers"), |b| {
            let mut request = tick();
            b.iter(|| processor.publish(black_box(&mut request)).expect("publish"));
        });
    }

    group.finish();
}

/// Shape resolution with and without the cache
fn benchmark_describe(c: &mut Criterion) {
    let mut group = c.benchmark_group("describe");
    group.throughput(Throughput::Elements(1));

    let registry = Arc::new(SubscriberRegistry::new().with(decorated("a")).with(decorated("b")));
    let builder = PipelineBuilder::new(
        registry,
        Arc::new(PolicyRegistry::with_defaults()),
        InboxConfiguration::new(),
    );

    group.bench_function("cold", |b| {
        b.iter(|| {
            builder.clear_cache();
            black_box(builder.describe::<Tick>());
        });
    });

    group.bench_function("cached", |b| {
        b.iter(|| black_box(builder.describe::<Tick>()));
    });

    group.finish();
}

/// Suspending dispatch on a current-thread runtime
fn benchmark_send_async(c: &mut Criterion) {
    let mut group = c.benchmark_group("send_async");
    group.throughput(Throughput::Elements(1));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime");

    let processor = CommandProcessor::builder(
        SubscriberRegistry::new().with(HandlerRegistration::<Tick>::suspending("async", || Ok(AsyncNoop))),
    )
    .build();

    group.bench_function("bare", |b| {
        b.to_async(&runtime).iter(|| async {
            let mut request = tick();
            processor.send_async(black_box(&mut request)).await.expect("send_async");
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_send,
    benchmark_publish,
    benchmark_describe,
    benchmark_send_async
);
criterion_main!(benches);
