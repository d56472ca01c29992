//! Builds pipelines from registrations, policies and the inbox configuration.

use super::chain::{InboxAccess, Node, Pipeline, Target};
use super::registry::{HandlerFactory, HandlerRegistration, SubscriberRegistry};
use super::shape::{NodeSource, PipelineShape, ShapeCache};
use super::{OnceOnlyAction, Qos};
use crate::error::{ConfigurationError, ExecutionMode};
use crate::metrics::ProcessorMetrics;
use crate::policy::PolicyRegistry;
use herald_core::inbox::{AsyncInboxStore, InboxStore};
use herald_core::request::Request;
use std::any::TypeId;
use std::sync::Arc;

/// Inbox used by once-only QoS steps, optionally applied to every handler.
#[derive(Clone, Default)]
pub struct InboxConfiguration {
    blocking: Option<Arc<dyn InboxStore>>,
    suspending: Option<Arc<dyn AsyncInboxStore>>,
    on_duplicate: OnceOnlyAction,
    context_key: Option<String>,
    global: bool,
}

impl InboxConfiguration {
    /// No stores; once-only steps fail to build until one is added.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store used by blocking pipelines.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn InboxStore>) -> Self {
        self.blocking = Some(store);
        self
    }

    /// Store used by suspending pipelines.
    #[must_use]
    pub fn with_async_store(mut self, store: Arc<dyn AsyncInboxStore>) -> Self {
        self.suspending = Some(store);
        self
    }

    /// Behaviour of globally injected inbox steps on a repeat.
    #[must_use]
    pub const fn on_duplicate(mut self, action: OnceOnlyAction) -> Self {
        self.on_duplicate = action;
        self
    }

    /// Context key for globally injected inbox steps; defaults to the handler name.
    #[must_use]
    pub fn with_context_key(mut self, key: impl Into<String>) -> Self {
        self.context_key = Some(key.into());
        self
    }

    /// Inject an inbox step as the outermost node of every pipeline.
    #[must_use]
    pub const fn global(mut self, global: bool) -> Self {
        self.global = global;
        self
    }

    fn access(&self, mode: ExecutionMode) -> Option<InboxAccess> {
        match mode {
            ExecutionMode::Blocking => self.blocking.clone().map(InboxAccess::Blocking),
            ExecutionMode::Suspending => self.suspending.clone().map(InboxAccess::Suspending),
        }
    }
}

impl std::fmt::Debug for InboxConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboxConfiguration")
            .field("blocking", &self.blocking.is_some())
            .field("suspending", &self.suspending.is_some())
            .field("on_duplicate", &self.on_duplicate)
            .field("context_key", &self.context_key)
            .field("global", &self.global)
            .finish()
    }
}

/// Builds handler pipelines for request types.
///
/// Shapes are cached per request type on first build and reused by both
/// execution modes. Every build still creates fresh target handlers.
#[derive(Debug)]
pub struct PipelineBuilder {
    registry: Arc<SubscriberRegistry>,
    policies: Arc<PolicyRegistry>,
    inbox: InboxConfiguration,
    shapes: ShapeCache,
}

impl PipelineBuilder {
    /// Create a builder.
    #[must_use]
    pub fn new(
        registry: Arc<SubscriberRegistry>,
        policies: Arc<PolicyRegistry>,
        inbox: InboxConfiguration,
    ) -> Self {
        Self {
            registry,
            policies,
            inbox,
            shapes: ShapeCache::default(),
        }
    }

    /// The registrations the builder draws from.
    #[must_use]
    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    /// Blocking pipelines for every handler of `R`, in registration order.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if no handler is registered, a
    /// handler factory fails, a handler is suspending, or a QoS step refers
    /// to a missing policy or inbox.
    pub fn build<R: Request>(&self) -> Result<Vec<Pipeline<R>>, ConfigurationError> {
        self.build_for(ExecutionMode::Blocking)
    }

    /// Suspending pipelines for every handler of `R`, in registration order.
    ///
    /// # Errors
    ///
    /// As [`build`](Self::build), with the roles of blocking and suspending
    /// handlers swapped.
    pub fn build_async<R: Request>(&self) -> Result<Vec<Pipeline<R>>, ConfigurationError> {
        self.build_for(ExecutionMode::Suspending)
    }

    /// Pipelines for `R` in the given mode.
    ///
    /// # Errors
    ///
    /// See [`build`](Self::build).
    pub fn build_for<R: Request>(
        &self,
        mode: ExecutionMode,
    ) -> Result<Vec<Pipeline<R>>, ConfigurationError> {
        let registrations = self.registry.registrations::<R>();
        if registrations.is_empty() {
            return Err(ConfigurationError::MissingHandler(std::any::type_name::<R>()));
        }
        let shapes = self.shapes_for(&registrations);
        registrations
            .iter()
            .zip(shapes.iter())
            .map(|(registration, shape)| self.instantiate(registration, shape, mode))
            .collect()
    }

    /// Cached shapes of `R`'s pipelines, computing them on first use.
    #[must_use]
    pub fn describe<R: Request>(&self) -> Arc<[PipelineShape]> {
        self.shapes_for(&self.registry.registrations::<R>())
    }

    /// Drop every cached shape.
    pub fn clear_cache(&self) {
        tracing::debug!(cached = self.shapes.len(), "clearing pipeline shape cache");
        self.shapes.clear();
    }

    /// Number of request types with a cached shape.
    #[must_use]
    pub fn cached_shapes(&self) -> usize {
        self.shapes.len()
    }

    fn shapes_for<R: Request>(
        &self,
        registrations: &[Arc<HandlerRegistration<R>>],
    ) -> Arc<[PipelineShape]> {
        let type_id = TypeId::of::<R>();
        if let Some(shapes) = self.shapes.get(type_id) {
            return shapes;
        }
        ProcessorMetrics::record_shape_miss(std::any::type_name::<R>());
        let shapes = registrations
            .iter()
            .map(|registration| PipelineShape::describe(registration, self.inbox.global))
            .collect();
        self.shapes.insert(type_id, shapes)
    }

    fn instantiate<R: Request>(
        &self,
        registration: &HandlerRegistration<R>,
        shape: &PipelineShape,
        mode: ExecutionMode,
    ) -> Result<Pipeline<R>, ConfigurationError> {
        let nodes = shape
            .nodes
            .iter()
            .map(|(_, source)| match source {
                NodeSource::GlobalInbox => self.inbox_node(
                    registration,
                    self.inbox.context_key.clone(),
                    self.inbox.on_duplicate,
                    mode,
                ),
                NodeSource::Declared(index) => {
                    self.declared_node(registration, &registration.declarations()[*index].qos, mode)
                },
                NodeSource::Target => Self::target_node(registration, mode),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Pipeline::new(
            shape.request_type,
            shape.handler,
            mode,
            shape.kinds(),
            nodes,
        ))
    }

    fn declared_node<R: Request>(
        &self,
        registration: &HandlerRegistration<R>,
        qos: &Qos<R>,
        mode: ExecutionMode,
    ) -> Result<Node<R>, ConfigurationError> {
        Ok(match qos {
            Qos::Logging { level } => Node::Logging { level: *level },
            Qos::Validation(validator) => Node::Validation(Arc::clone(validator)),
            Qos::Retry { policy } => Node::Retry {
                name: policy.clone(),
                policy: self.policies.retry(policy)?.clone(),
            },
            Qos::CircuitBreaker { policy } => Node::CircuitBreaker {
                name: policy.clone(),
                breaker: self.policies.circuit_breaker(policy)?.clone(),
            },
            Qos::Fallback {
                handler,
                on_circuit_open_only,
            } => Node::Fallback {
                handler: Arc::clone(handler),
                on_circuit_open_only: *on_circuit_open_only,
            },
            Qos::InboxDedup {
                context_key,
                on_duplicate,
            } => self.inbox_node(registration, context_key.clone(), *on_duplicate, mode)?,
        })
    }

    fn inbox_node<R: Request>(
        &self,
        registration: &HandlerRegistration<R>,
        context_key: Option<String>,
        on_duplicate: OnceOnlyAction,
        mode: ExecutionMode,
    ) -> Result<Node<R>, ConfigurationError> {
        let store = self
            .inbox
            .access(mode)
            .ok_or(ConfigurationError::MissingInbox {
                request_type: std::any::type_name::<R>(),
                mode,
            })?;
        Ok(Node::Inbox {
            store,
            context_key: context_key.unwrap_or_else(|| registration.name().to_string()),
            on_duplicate,
        })
    }

    fn target_node<R: Request>(
        registration: &HandlerRegistration<R>,
        mode: ExecutionMode,
    ) -> Result<Node<R>, ConfigurationError> {
        let request_type = std::any::type_name::<R>();
        let handler = registration.name();
        let factory_failed = |source| ConfigurationError::FactoryFailed {
            request_type,
            handler,
            source,
        };
        let target = match (registration.factory(), mode) {
            (HandlerFactory::Blocking(factory), ExecutionMode::Blocking) => {
                Target::Blocking(factory().map_err(factory_failed)?)
            },
            (HandlerFactory::Suspending(factory), ExecutionMode::Suspending) => {
                Target::Suspending(factory().map_err(factory_failed)?)
            },
            _ => {
                return Err(ConfigurationError::ModeMismatch {
                    request_type,
                    handler,
                    mode,
                });
            },
        };
        Ok(Node::Target(target))
    }
}
