//! Cached pipeline shapes.

use super::registry::HandlerRegistration;
use super::Qos;
use herald_core::request::Request;
use std::any::TypeId;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Kind of a pipeline node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Once-only handling; `global` when injected by the inbox configuration.
    Inbox {
        /// Injected by the global inbox configuration.
        global: bool,
    },
    /// Entry/exit logging.
    Logging,
    /// Request validation.
    Validation,
    /// Retry with a named policy.
    Retry {
        /// Policy name.
        policy: String,
    },
    /// Named circuit breaker.
    CircuitBreaker {
        /// Breaker name.
        policy: String,
    },
    /// Failure recovery.
    Fallback,
    /// The registered handler.
    Target {
        /// Handler name.
        handler: &'static str,
    },
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbox { global: true } => f.write_str("inbox(global)"),
            Self::Inbox { global: false } => f.write_str("inbox"),
            Self::Logging => f.write_str("logging"),
            Self::Validation => f.write_str("validation"),
            Self::Retry { policy } => write!(f, "retry({policy})"),
            Self::CircuitBreaker { policy } => write!(f, "circuit-breaker({policy})"),
            Self::Fallback => f.write_str("fallback"),
            Self::Target { handler } => write!(f, "target({handler})"),
        }
    }
}

/// Where an instantiated node takes its configuration from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeSource {
    /// The global inbox configuration.
    GlobalInbox,
    /// A QoS declaration, by index in the registration.
    Declared(usize),
    /// The handler factory.
    Target,
}

/// Ordered description of one handler's pipeline, outermost node first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineShape {
    pub(crate) request_type: &'static str,
    pub(crate) handler: &'static str,
    pub(crate) nodes: Vec<(NodeKind, NodeSource)>,
}

impl PipelineShape {
    /// Derive the shape of a registration.
    pub(crate) fn describe<R: Request>(
        registration: &HandlerRegistration<R>,
        global_inbox: bool,
    ) -> Self {
        let declarations = registration.declarations();
        let mut order: Vec<usize> = (0..declarations.len()).collect();
        // Stable sort: equal priorities keep declaration order, earliest outermost.
        order.sort_by_key(|&index| Reverse(declarations[index].priority));

        let declares_inbox = declarations
            .iter()
            .any(|d| matches!(d.qos, Qos::InboxDedup { .. }));

        let mut nodes = Vec::with_capacity(declarations.len() + 2);
        if global_inbox && registration.uses_global_inbox() && !declares_inbox {
            nodes.push((NodeKind::Inbox { global: true }, NodeSource::GlobalInbox));
        }
        nodes.extend(
            order
                .into_iter()
                .map(|index| (declarations[index].qos.kind(), NodeSource::Declared(index))),
        );
        nodes.push((
            NodeKind::Target {
                handler: registration.name(),
            },
            NodeSource::Target,
        ));

        Self {
            request_type: std::any::type_name::<R>(),
            handler: registration.name(),
            nodes,
        }
    }

    /// Request type name.
    #[must_use]
    pub const fn request_type(&self) -> &'static str {
        self.request_type
    }

    /// Handler name.
    #[must_use]
    pub const fn handler(&self) -> &'static str {
        self.handler
    }

    /// Node kinds, outermost first; the last one is the target.
    #[must_use]
    pub fn kinds(&self) -> Vec<NodeKind> {
        self.nodes.iter().map(|(kind, _)| kind.clone()).collect()
    }

    /// Number of nodes including the target.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: a shape holds at least its target.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Shapes per request type, shared by all execution modes.
///
/// Concurrent first builds may both compute a shape; the first insert wins
/// and every caller observes that one.
#[derive(Debug, Default)]
pub(crate) struct ShapeCache {
    shapes: RwLock<HashMap<TypeId, Arc<[PipelineShape]>>>,
}

impl ShapeCache {
    pub(crate) fn get(&self, type_id: TypeId) -> Option<Arc<[PipelineShape]>> {
        self.shapes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&type_id)
            .cloned()
    }

    pub(crate) fn insert(
        &self,
        type_id: TypeId,
        shapes: Vec<PipelineShape>,
    ) -> Arc<[PipelineShape]> {
        let mut cache = self.shapes.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(cache.entry(type_id).or_insert_with(|| shapes.into()))
    }

    pub(crate) fn clear(&self) {
        self.shapes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.shapes.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
