//! Error types returned by the runtime.

use crate::outbox::OutboxError;
use herald_core::channel::ChannelError;
use herald_core::handler::HandlerError;
use herald_core::mapper::MappingError;
use herald_core::producer::ProducerError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Which flavour of collaborators a pipeline or call uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    /// Blocking handlers and stores.
    Blocking,
    /// Suspending (async) handlers and stores.
    Suspending,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocking => f.write_str("blocking"),
            Self::Suspending => f.write_str("suspending"),
        }
    }
}

/// A dispatch could not be set up: a wiring mistake rather than a runtime failure.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    /// No handler is registered for the request type.
    #[error("no handler registered for {0}")]
    MissingHandler(&'static str),

    /// `send` found more than one handler.
    #[error("{count} handlers registered for {request_type}; send requires exactly one")]
    MultipleHandlers {
        /// Request type.
        request_type: &'static str,
        /// Registered handler count.
        count: usize,
    },

    /// A handler factory failed to produce a handler.
    #[error("handler factory '{handler}' for {request_type} failed: {source}")]
    FactoryFailed {
        /// Request type.
        request_type: &'static str,
        /// Handler name.
        handler: &'static str,
        /// Factory error.
        source: anyhow::Error,
    },

    /// A handler was registered for the other execution mode.
    #[error("handler '{handler}' for {request_type} cannot run in {mode} mode")]
    ModeMismatch {
        /// Request type.
        request_type: &'static str,
        /// Handler name.
        handler: &'static str,
        /// Mode requested by the caller.
        mode: ExecutionMode,
    },

    /// A QoS declaration names an unknown policy.
    #[error("no {kind} policy named '{name}' is registered")]
    MissingPolicy {
        /// Policy kind ("retry" or "circuit breaker").
        kind: &'static str,
        /// Policy name.
        name: String,
    },

    /// Once-only handling was requested but no inbox exists for the mode.
    #[error("no {mode} inbox is configured for once-only handling of {request_type}")]
    MissingInbox {
        /// Request type.
        request_type: &'static str,
        /// Mode requested by the caller.
        mode: ExecutionMode,
    },

    /// No mapper is registered for the request type.
    #[error("no message mapper registered for {0}")]
    MissingMapper(&'static str),

    /// The processor has no outbox.
    #[error("no outbox is configured")]
    MissingOutbox,

    /// Request-reply needs a channel factory.
    #[error("request-reply requires a channel factory")]
    MissingReplyChannelFactory,
}

/// Errors returned by the command processor.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Wiring mistake; fatal for the performer that hits it.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// A handler pipeline failed.
    #[error("handler '{handler}' failed: {source}")]
    Handler {
        /// Handler name.
        handler: &'static str,
        /// What went wrong.
        #[source]
        source: HandlerError,
    },

    /// Some publish handlers failed; the others ran.
    #[error("{} of {} handlers failed", .failures.len(), .total)]
    Aggregate {
        /// Handlers invoked.
        total: usize,
        /// Individual failures.
        failures: Vec<DispatchError>,
    },

    /// The outbox failed.
    #[error(transparent)]
    Outbox(#[from] OutboxError),

    /// A request could not be mapped.
    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// A reply channel failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// A direct send failed.
    #[error(transparent)]
    Producer(#[from] ProducerError),

    /// No reply arrived in time.
    #[error("no reply received within {0:?}")]
    ReplyTimeout(Duration),

    /// Dispatch exceeded its time budget.
    #[error("dispatch timed out after {0:?}")]
    Timeout(Duration),
}

impl DispatchError {
    /// Whether the failure should lead to a requeue.
    ///
    /// An aggregate is recoverable only if every failure in it is.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Handler { source, .. } => source.is_recoverable(),
            Self::Timeout(_) => true,
            Self::Aggregate { failures, .. } => {
                !failures.is_empty() && failures.iter().all(Self::is_recoverable)
            },
            _ => false,
        }
    }

    /// Whether the failure is a wiring mistake.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::Configuration(_) => true,
            Self::Aggregate { failures, .. } => failures.iter().any(Self::is_configuration),
            _ => false,
        }
    }

    /// Requeue delay requested by a deferring handler.
    #[must_use]
    pub fn requeue_delay(&self) -> Option<Duration> {
        match self {
            Self::Handler { source, .. } => source.requeue_delay(),
            Self::Aggregate { failures, .. } => failures.iter().filter_map(Self::requeue_delay).max(),
            _ => None,
        }
    }
}
