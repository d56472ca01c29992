//! Handler registrations keyed by request type.

use super::{Fallback, OnceOnlyAction, Qos, QosDeclaration, Validator};
use herald_core::handler::{AsyncRequestHandler, HandlerError, RequestHandler};
use herald_core::request::{Request, RequestContext};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

type BlockingFactory<R> = dyn Fn() -> anyhow::Result<Box<dyn RequestHandler<R>>> + Send + Sync;
type SuspendingFactory<R> =
    dyn Fn() -> anyhow::Result<Box<dyn AsyncRequestHandler<R>>> + Send + Sync;

/// Produces a fresh handler for every pipeline.
pub enum HandlerFactory<R> {
    /// Blocking handlers.
    Blocking(Arc<BlockingFactory<R>>),
    /// Suspending handlers.
    Suspending(Arc<SuspendingFactory<R>>),
}

impl<R> Clone for HandlerFactory<R> {
    fn clone(&self) -> Self {
        match self {
            Self::Blocking(factory) => Self::Blocking(Arc::clone(factory)),
            Self::Suspending(factory) => Self::Suspending(Arc::clone(factory)),
        }
    }
}

/// One handler for a request type, with its QoS declarations.
///
/// ```rust,ignore
/// let registration = HandlerRegistration::blocking("ship-order", || Ok(ShipOrderHandler::default()))
///     .logging(30, tracing::Level::INFO)
///     .circuit_breaker(20, "warehouse")
///     .retry(10, "warehouse");
/// ```
pub struct HandlerRegistration<R> {
    name: &'static str,
    factory: HandlerFactory<R>,
    declarations: Vec<QosDeclaration<R>>,
    use_global_inbox: bool,
}

impl<R: Request> HandlerRegistration<R> {
    /// Register a blocking handler built by `factory` for every dispatch.
    pub fn blocking<H, F>(name: &'static str, factory: F) -> Self
    where
        H: RequestHandler<R> + 'static,
        F: Fn() -> anyhow::Result<H> + Send + Sync + 'static,
    {
        let factory: Arc<BlockingFactory<R>> = Arc::new(move || {
            let handler: Box<dyn RequestHandler<R>> = Box::new(factory()?);
            Ok(handler)
        });
        Self::from_factory(name, HandlerFactory::Blocking(factory))
    }

    /// Register a suspending handler built by `factory` for every dispatch.
    pub fn suspending<H, F>(name: &'static str, factory: F) -> Self
    where
        H: AsyncRequestHandler<R> + 'static,
        F: Fn() -> anyhow::Result<H> + Send + Sync + 'static,
    {
        let factory: Arc<SuspendingFactory<R>> = Arc::new(move || {
            let handler: Box<dyn AsyncRequestHandler<R>> = Box::new(factory()?);
            Ok(handler)
        });
        Self::from_factory(name, HandlerFactory::Suspending(factory))
    }

    /// Register a blocking handler written as a closure.
    pub fn blocking_fn<F>(name: &'static str, handle: F) -> Self
    where
        F: Fn(&mut R, &mut RequestContext) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let handle = Arc::new(handle);
        Self::blocking(name, move || Ok(FnHandler(Arc::clone(&handle))))
    }

    /// Register a handler from an explicit factory.
    #[must_use]
    pub const fn from_factory(name: &'static str, factory: HandlerFactory<R>) -> Self {
        Self {
            name,
            factory,
            declarations: Vec::new(),
            use_global_inbox: true,
        }
    }

    /// Declare a QoS step.
    #[must_use]
    pub fn with_qos(mut self, priority: u32, qos: Qos<R>) -> Self {
        self.declarations.push(QosDeclaration { priority, qos });
        self
    }

    /// Log entry and exit.
    #[must_use]
    pub fn logging(self, priority: u32, level: tracing::Level) -> Self {
        self.with_qos(priority, Qos::Logging { level })
    }

    /// Validate the request.
    #[must_use]
    pub fn validate<F>(self, priority: u32, validator: F) -> Self
    where
        F: Fn(&R) -> Result<(), String> + Send + Sync + 'static,
    {
        let validator: Validator<R> = Arc::new(validator);
        self.with_qos(priority, Qos::Validation(validator))
    }

    /// Retry with a named policy.
    #[must_use]
    pub fn retry(self, priority: u32, policy: impl Into<String>) -> Self {
        self.with_qos(
            priority,
            Qos::Retry {
                policy: policy.into(),
            },
        )
    }

    /// Guard with a named circuit breaker.
    #[must_use]
    pub fn circuit_breaker(self, priority: u32, policy: impl Into<String>) -> Self {
        self.with_qos(
            priority,
            Qos::CircuitBreaker {
                policy: policy.into(),
            },
        )
    }

    /// Recover from any inner failure.
    #[must_use]
    pub fn fallback<F>(self, priority: u32, fallback: F) -> Self
    where
        F: Fn(&mut R, &mut RequestContext, &HandlerError) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let handler: Fallback<R> = Arc::new(fallback);
        self.with_qos(
            priority,
            Qos::Fallback {
                handler,
                on_circuit_open_only: false,
            },
        )
    }

    /// Handle each request id once per context key.
    #[must_use]
    pub fn once_only(self, priority: u32, context_key: Option<String>, on_duplicate: OnceOnlyAction) -> Self {
        self.with_qos(
            priority,
            Qos::InboxDedup {
                context_key,
                on_duplicate,
            },
        )
    }

    /// Opt out of the globally configured inbox.
    #[must_use]
    pub const fn without_global_inbox(mut self) -> Self {
        self.use_global_inbox = false;
        self
    }

    /// Handler name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn declarations(&self) -> &[QosDeclaration<R>] {
        &self.declarations
    }

    pub(crate) const fn factory(&self) -> &HandlerFactory<R> {
        &self.factory
    }

    pub(crate) const fn uses_global_inbox(&self) -> bool {
        self.use_global_inbox
    }
}

struct FnHandler<F>(Arc<F>);

impl<R, F> RequestHandler<R> for FnHandler<F>
where
    R: Request,
    F: Fn(&mut R, &mut RequestContext) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, request: &mut R, context: &mut RequestContext) -> Result<(), HandlerError> {
        (self.0)(request, context)
    }
}

/// Handler registrations for every request type.
///
/// Registration order is preserved; `publish` invokes handlers in it.
#[derive(Default)]
pub struct SubscriberRegistry {
    handlers: HashMap<TypeId, Vec<Arc<dyn Any + Send + Sync>>>,
}

impl SubscriberRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a registration.
    pub fn register<R: Request>(&mut self, registration: HandlerRegistration<R>) -> &mut Self {
        tracing::debug!(
            request_type = std::any::type_name::<R>(),
            handler = registration.name(),
            "registering handler"
        );
        self.handlers
            .entry(TypeId::of::<R>())
            .or_default()
            .push(Arc::new(registration));
        self
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with<R: Request>(mut self, registration: HandlerRegistration<R>) -> Self {
        self.register(registration);
        self
    }

    /// Registrations for `R`, in registration order.
    #[must_use]
    pub fn registrations<R: Request>(&self) -> Vec<Arc<HandlerRegistration<R>>> {
        self.handlers
            .get(&TypeId::of::<R>())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| Arc::clone(entry).downcast::<HandlerRegistration<R>>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of handlers for `R`.
    #[must_use]
    pub fn handler_count<R: Request>(&self) -> usize {
        self.handlers.get(&TypeId::of::<R>()).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("request_types", &self.handlers.len())
            .finish()
    }
}
