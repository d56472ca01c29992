//! # Herald Runtime
//!
//! Request dispatch for Herald: handler pipelines with QoS decorators, a
//! transactional outbox, message pumps and the dispatcher that runs them.
//!
//! ## Core Components
//!
//! - **Pipeline builder**: assembles the QoS chain for a request type and
//!   caches its shape
//! - **Command processor**: `send`, `publish`, `post`, `call` and the
//!   outbox operations, in blocking and async forms
//! - **Outbox mediator**: deposits messages, clears them through producers
//!   guarded by retry and a per-topic circuit breaker, archives what was sent
//! - **Message pumps**: the blocking [`Reactor`](pump::Reactor) and the
//!   async [`Proactor`](pump::Proactor)
//! - **Dispatcher**: starts and stops performers for every subscription
//!
//! ## Example
//!
//! ```ignore
//! use herald_runtime::pipeline::HandlerRegistration;
//! use herald_runtime::{CommandProcessor, Dispatcher, SubscriberRegistry};
//!
//! let registry = SubscriberRegistry::new()
//!     .with(HandlerRegistration::blocking("place-order", || Ok(PlaceOrderHandler)).retry(10, "orders.retry"));
//! let processor = Arc::new(CommandProcessor::builder(registry).mappers(mappers).build());
//!
//! processor.send(&mut PlaceOrder::new("order-1"))?;
//!
//! let dispatcher = Dispatcher::builder()
//!     .command_processor(Arc::clone(&processor))
//!     .channel_factory(channels)
//!     .subscription::<PlaceOrder>(Subscription::new("orders", "orders.q", "orders"))
//!     .build()?;
//! dispatcher.receive()?;
//! // ...
//! dispatcher.end().await?;
//! ```

/// Retry logic with exponential backoff
pub mod retry;

/// Circuit breaker pattern for preventing cascading failures
pub mod circuit_breaker;

/// Prometheus metrics for observability
pub mod metrics;

/// Health reporting
pub mod health;

/// Error types shared by the processor, pipelines and pumps
pub mod error;

/// Named retry and circuit-breaker policies
pub mod policy;

/// Request type to message mapper registry
pub mod mappers;

/// Handler pipelines and QoS decorators
pub mod pipeline;

/// Outbox producer mediator and sweeper
pub mod outbox;

/// Command processor
pub mod processor;

/// Message pumps
pub mod pump;

/// Dispatcher lifecycle
pub mod dispatcher;

/// TOML configuration
pub mod config;

pub use config::RuntimeConfig;
pub use dispatcher::{Dispatcher, DispatcherError, DispatcherState};
pub use error::{ConfigurationError, DispatchError, ExecutionMode};
pub use mappers::MapperRegistry;
pub use outbox::{ClearReport, OutboxConfig, OutboxError, OutboxProducerMediator, ProducerRegistry};
pub use pipeline::{PipelineBuilder, Qos, QosDeclaration, SubscriberRegistry};
pub use policy::PolicyRegistry;
pub use processor::{CommandProcessor, ProcessorBuilder};
pub use pump::{Proactor, PumpOutcome, PumpStatistics, Reactor};
