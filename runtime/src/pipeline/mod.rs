//! Handler pipelines: registration, shape caching and execution.
//!
//! A pipeline is an ordered chain of QoS nodes ending in the target
//! handler. Each registration declares its QoS steps with a priority.
//! Higher priorities run further out, and the target is always innermost.
//! Equal priorities keep declaration order, with the earlier declaration
//! outermost.
//!
//! Building happens in two stages:
//!
//! 1. The **shape** (node kinds, order, handler name) is derived from the
//!    registration and cached per request type. Shapes are immutable and
//!    shared between execution modes.
//! 2. The **pipeline** is instantiated from the shape for one dispatch. It
//!    gets a fresh target handler from the factory, plus the policies and
//!    stores for the requested execution mode.
//!
//! ```text
//!  priority 30        priority 20         priority 10
//! ┌──────────┐      ┌──────────────┐     ┌──────────┐     ┌────────┐
//! │ Logging  │ ───► │ Circuit      │ ──► │ Retry    │ ──► │ target │
//! └──────────┘      │ breaker      │     └──────────┘     └────────┘
//!                   └──────────────┘
//! ```

mod builder;
mod chain;
mod registry;
mod shape;

pub use builder::{InboxConfiguration, PipelineBuilder};
pub use chain::Pipeline;
pub use registry::{HandlerFactory, HandlerRegistration, SubscriberRegistry};
pub use shape::{NodeKind, PipelineShape};

use herald_core::handler::HandlerError;
use herald_core::request::RequestContext;
use std::sync::Arc;

/// What to do when once-only handling sees a request again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnceOnlyAction {
    /// Fail the dispatch with [`HandlerError::Duplicate`].
    #[default]
    Throw,
    /// Log a warning and skip the rest of the pipeline.
    Warn,
}

/// Validation step: `Err(reason)` fails the dispatch before inner nodes run.
pub type Validator<R> = Arc<dyn Fn(&R) -> Result<(), String> + Send + Sync>;

/// Fallback step: invoked with the failure of the inner pipeline.
pub type Fallback<R> =
    Arc<dyn Fn(&mut R, &mut RequestContext, &HandlerError) -> Result<(), HandlerError> + Send + Sync>;

/// A quality-of-service step wrapped around the target handler.
pub enum Qos<R> {
    /// Log entry and exit at the given level.
    Logging {
        /// Level of the emitted events.
        level: tracing::Level,
    },
    /// Validate the request.
    Validation(Validator<R>),
    /// Retry inner nodes with a named policy.
    Retry {
        /// Policy name in the [`crate::policy::PolicyRegistry`].
        policy: String,
    },
    /// Guard inner nodes with a named circuit breaker.
    CircuitBreaker {
        /// Breaker name in the [`crate::policy::PolicyRegistry`].
        policy: String,
    },
    /// Recover from inner failures.
    Fallback {
        /// Recovery function.
        handler: Fallback<R>,
        /// Only recover when a circuit breaker rejected the call.
        on_circuit_open_only: bool,
    },
    /// Once-only handling backed by the inbox.
    InboxDedup {
        /// De-duplication scope; defaults to the handler name.
        context_key: Option<String>,
        /// Behaviour on a repeat.
        on_duplicate: OnceOnlyAction,
    },
}

impl<R> Clone for Qos<R> {
    fn clone(&self) -> Self {
        match self {
            Self::Logging { level } => Self::Logging { level: *level },
            Self::Validation(validator) => Self::Validation(Arc::clone(validator)),
            Self::Retry { policy } => Self::Retry {
                policy: policy.clone(),
            },
            Self::CircuitBreaker { policy } => Self::CircuitBreaker {
                policy: policy.clone(),
            },
            Self::Fallback {
                handler,
                on_circuit_open_only,
            } => Self::Fallback {
                handler: Arc::clone(handler),
                on_circuit_open_only: *on_circuit_open_only,
            },
            Self::InboxDedup {
                context_key,
                on_duplicate,
            } => Self::InboxDedup {
                context_key: context_key.clone(),
                on_duplicate: *on_duplicate,
            },
        }
    }
}

impl<R> std::fmt::Debug for Qos<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.kind().to_string())
    }
}

impl<R> Qos<R> {
    /// Shape node describing this step.
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Logging { .. } => NodeKind::Logging,
            Self::Validation(_) => NodeKind::Validation,
            Self::Retry { policy } => NodeKind::Retry {
                policy: policy.clone(),
            },
            Self::CircuitBreaker { policy } => NodeKind::CircuitBreaker {
                policy: policy.clone(),
            },
            Self::Fallback { .. } => NodeKind::Fallback,
            Self::InboxDedup { .. } => NodeKind::Inbox { global: false },
        }
    }
}

/// A QoS step with its priority.
pub struct QosDeclaration<R> {
    /// Higher runs further from the target.
    pub priority: u32,
    /// The step.
    pub qos: Qos<R>,
}

impl<R> Clone for QosDeclaration<R> {
    fn clone(&self) -> Self {
        Self {
            priority: self.priority,
            qos: self.qos.clone(),
        }
    }
}

impl<R> std::fmt::Debug for QosDeclaration<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QosDeclaration")
            .field("priority", &self.priority)
            .field("qos", &self.qos)
            .finish()
    }
}
