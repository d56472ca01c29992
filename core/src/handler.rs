//! Handler contracts and the error type handlers raise.

use crate::request::{Id, Request, RequestContext};
use std::time::Duration;
use thiserror::Error;

/// Boxed, sendable future returned by the suspending contracts.
pub type BoxFuture<'a, T> = futures::future::BoxFuture<'a, T>;

/// Errors raised while handling a request.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The handler asks for the message to be retried later.
    #[error("handler deferred the request: {reason}")]
    Defer {
        /// Why the request was deferred.
        reason: String,
        /// Overrides the subscription's requeue delay when set.
        delay: Option<Duration>,
    },

    /// The request failed a validation step.
    #[error("request failed validation: {0}")]
    Validation(String),

    /// The request was already handled (once-only processing).
    #[error("request {0} has already been handled")]
    Duplicate(Id),

    /// A circuit breaker rejected the call.
    #[error("circuit '{0}' is open")]
    CircuitOpen(String),

    /// The dispatch did not finish within its time budget.
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    /// Any other failure.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl HandlerError {
    /// Defer with the subscription's requeue delay.
    #[must_use]
    pub fn defer(reason: impl Into<String>) -> Self {
        Self::Defer {
            reason: reason.into(),
            delay: None,
        }
    }

    /// Defer with an explicit requeue delay.
    #[must_use]
    pub fn defer_for(reason: impl Into<String>, delay: Duration) -> Self {
        Self::Defer {
            reason: reason.into(),
            delay: Some(delay),
        }
    }

    /// Build a generic failure from a message.
    #[must_use]
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed(anyhow::anyhow!("{message}"))
    }

    /// Whether the message should be requeued rather than rejected.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Defer { .. } | Self::Timeout(_))
    }

    /// Delay requested by a deferral, if any.
    #[must_use]
    pub const fn requeue_delay(&self) -> Option<Duration> {
        match self {
            Self::Defer { delay, .. } => *delay,
            _ => None,
        }
    }

    /// Whether retrying the same call could succeed.
    ///
    /// Validation failures, duplicates and open circuits never change on
    /// an immediate retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::Validation(_) | Self::Duplicate(_) | Self::CircuitOpen(_)
        )
    }
}

/// A blocking request handler.
pub trait RequestHandler<R: Request>: Send + Sync {
    /// Handle the request.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`] when the request could not be handled.
    fn handle(&self, request: &mut R, context: &mut RequestContext) -> Result<(), HandlerError>;
}

/// A suspending request handler.
pub trait AsyncRequestHandler<R: Request>: Send + Sync {
    /// Handle the request.
    ///
    /// # Errors
    ///
    /// The returned future resolves to a [`HandlerError`] when the request
    /// could not be handled.
    fn handle<'a>(
        &'a self,
        request: &'a mut R,
        context: &'a mut RequestContext,
    ) -> BoxFuture<'a, Result<(), HandlerError>>;
}
