//! Instantiated pipelines and their execution.

use super::shape::NodeKind;
use super::{Fallback, OnceOnlyAction, Validator};
use crate::circuit_breaker::CircuitBreaker;
use crate::error::ExecutionMode;
use crate::retry::{NextStep, RetryPolicy};
use herald_core::handler::{AsyncRequestHandler, BoxFuture, HandlerError, RequestHandler};
use herald_core::inbox::{AsyncInboxStore, InboxEntry, InboxStore};
use herald_core::request::{Request, RequestContext};
use std::sync::Arc;
use std::time::Instant;
use tracing::Level;

pub(crate) enum InboxAccess {
    Blocking(Arc<dyn InboxStore>),
    Suspending(Arc<dyn AsyncInboxStore>),
}

pub(crate) enum Target<R> {
    Blocking(Box<dyn RequestHandler<R>>),
    Suspending(Box<dyn AsyncRequestHandler<R>>),
}

pub(crate) enum Node<R> {
    Inbox {
        store: InboxAccess,
        context_key: String,
        on_duplicate: OnceOnlyAction,
    },
    Logging {
        level: Level,
    },
    Validation(Validator<R>),
    Retry {
        name: String,
        policy: RetryPolicy,
    },
    CircuitBreaker {
        name: String,
        breaker: CircuitBreaker,
    },
    Fallback {
        handler: Fallback<R>,
        on_circuit_open_only: bool,
    },
    Target(Target<R>),
}

/// A ready-to-run chain for one handler: QoS nodes outermost first, then the target.
///
/// Execution threads a cursor through the node list; each node runs the
/// remainder of the chain at most as often as its policy allows.
pub struct Pipeline<R> {
    request_type: &'static str,
    handler: &'static str,
    mode: ExecutionMode,
    kinds: Vec<NodeKind>,
    nodes: Vec<Node<R>>,
}

impl<R: Request> Pipeline<R> {
    pub(crate) fn new(
        request_type: &'static str,
        handler: &'static str,
        mode: ExecutionMode,
        kinds: Vec<NodeKind>,
        nodes: Vec<Node<R>>,
    ) -> Self {
        Self {
            request_type,
            handler,
            mode,
            kinds,
            nodes,
        }
    }

    /// Handler name.
    #[must_use]
    pub const fn handler_name(&self) -> &'static str {
        self.handler
    }

    /// Execution mode the pipeline was built for.
    #[must_use]
    pub const fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Node kinds, outermost first.
    #[must_use]
    pub fn kinds(&self) -> &[NodeKind] {
        &self.kinds
    }

    /// Number of nodes including the target.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the pipeline has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Run a blocking pipeline.
    ///
    /// # Errors
    ///
    /// Returns the [`HandlerError`] that escaped the outermost node.
    pub fn run(&self, request: &mut R, context: &mut RequestContext) -> Result<(), HandlerError> {
        self.run_from(0, request, context)
    }

    /// Run a suspending pipeline.
    ///
    /// # Errors
    ///
    /// Resolves to the [`HandlerError`] that escaped the outermost node.
    pub fn run_async<'a>(
        &'a self,
        request: &'a mut R,
        context: &'a mut RequestContext,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        self.run_from_async(0, request, context)
    }

    fn run_from(
        &self,
        cursor: usize,
        request: &mut R,
        context: &mut RequestContext,
    ) -> Result<(), HandlerError> {
        let Some(node) = self.nodes.get(cursor) else {
            return Ok(());
        };
        let next = cursor + 1;

        match node {
            Node::Inbox {
                store,
                context_key,
                on_duplicate,
            } => {
                let InboxAccess::Blocking(store) = store else {
                    return Err(self.wrong_mode("inbox"));
                };
                let seen = store
                    .exists(request.id(), context_key)
                    .map_err(|e| HandlerError::Failed(e.into()))?;
                if seen {
                    return self.on_duplicate(request, *on_duplicate);
                }
                self.run_from(next, request, context)?;
                store
                    .add(self.inbox_entry(request, context_key))
                    .map_err(|e| HandlerError::Failed(e.into()))
            },
            Node::Logging { level } => {
                let started = Instant::now();
                log_at(*level, self, request, "handling request");
                let result = self.run_from(next, request, context);
                log_outcome(*level, self, request, started, &result);
                result
            },
            Node::Validation(validator) => {
                validator(request).map_err(HandlerError::Validation)?;
                self.run_from(next, request, context)
            },
            Node::Retry { name, policy } => {
                let mut attempt = 0;
                loop {
                    match self.run_from(next, request, context) {
                        Ok(()) => return Ok(()),
                        Err(err) => match policy.next_step(attempt, &err, err.is_transient()) {
                            NextStep::Wait(delay) => {
                                tracing::debug!(policy = %name, attempt, handler = self.handler, "retrying handler");
                                std::thread::sleep(delay);
                                attempt += 1;
                            },
                            NextStep::GiveUp => return Err(err),
                        },
                    }
                }
            },
            Node::CircuitBreaker { name, breaker } => {
                breaker
                    .try_acquire()
                    .map_err(|_| HandlerError::CircuitOpen(name.clone()))?;
                let result = self.run_from(next, request, context);
                settle(breaker, &result);
                result
            },
            Node::Fallback {
                handler,
                on_circuit_open_only,
            } => match self.run_from(next, request, context) {
                Err(err) if applies(*on_circuit_open_only, &err) => {
                    tracing::debug!(handler = self.handler, error = %err, "invoking fallback");
                    handler(request, context, &err)
                },
                result => result,
            },
            Node::Target(Target::Blocking(handler)) => handler.handle(request, context),
            Node::Target(Target::Suspending(_)) => Err(self.wrong_mode("target")),
        }
    }

    fn run_from_async<'a>(
        &'a self,
        cursor: usize,
        request: &'a mut R,
        context: &'a mut RequestContext,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            let Some(node) = self.nodes.get(cursor) else {
                return Ok(());
            };
            let next = cursor + 1;

            match node {
                Node::Inbox {
                    store,
                    context_key,
                    on_duplicate,
                } => {
                    let InboxAccess::Suspending(store) = store else {
                        return Err(self.wrong_mode("inbox"));
                    };
                    let seen = store
                        .exists(request.id(), context_key)
                        .await
                        .map_err(|e| HandlerError::Failed(e.into()))?;
                    if seen {
                        return self.on_duplicate(request, *on_duplicate);
                    }
                    self.run_from_async(next, &mut *request, &mut *context).await?;
                    store
                        .add(self.inbox_entry(request, context_key))
                        .await
                        .map_err(|e| HandlerError::Failed(e.into()))
                },
                Node::Logging { level } => {
                    let started = Instant::now();
                    log_at(*level, self, request, "handling request");
                    let result = self.run_from_async(next, &mut *request, &mut *context).await;
                    log_outcome(*level, self, request, started, &result);
                    result
                },
                Node::Validation(validator) => {
                    validator(request).map_err(HandlerError::Validation)?;
                    self.run_from_async(next, request, context).await
                },
                Node::Retry { name, policy } => {
                    let mut attempt = 0;
                    loop {
                        match self.run_from_async(next, &mut *request, &mut *context).await {
                            Ok(()) => return Ok(()),
                            Err(err) => match policy.next_step(attempt, &err, err.is_transient()) {
                                NextStep::Wait(delay) => {
                                    tracing::debug!(policy = %name, attempt, handler = self.handler, "retrying handler");
                                    tokio::time::sleep(delay).await;
                                    attempt += 1;
                                },
                                NextStep::GiveUp => return Err(err),
                            },
                        }
                    }
                },
                Node::CircuitBreaker { name, breaker } => {
                    breaker
                        .try_acquire()
                        .map_err(|_| HandlerError::CircuitOpen(name.clone()))?;
                    let result = self.run_from_async(next, request, context).await;
                    settle(breaker, &result);
                    result
                },
                Node::Fallback {
                    handler,
                    on_circuit_open_only,
                } => match self.run_from_async(next, &mut *request, &mut *context).await {
                    Err(err) if applies(*on_circuit_open_only, &err) => {
                        tracing::debug!(handler = self.handler, error = %err, "invoking fallback");
                        handler(request, context, &err)
                    },
                    result => result,
                },
                Node::Target(Target::Suspending(handler)) => handler.handle(request, context).await,
                Node::Target(Target::Blocking(_)) => Err(self.wrong_mode("target")),
            }
        })
    }

    fn on_duplicate(&self, request: &R, action: OnceOnlyAction) -> Result<(), HandlerError> {
        match action {
            OnceOnlyAction::Throw => Err(HandlerError::Duplicate(request.id().clone())),
            OnceOnlyAction::Warn => {
                tracing::warn!(
                    request_id = %request.id(),
                    request_type = self.request_type,
                    handler = self.handler,
                    "request already handled, skipping"
                );
                Ok(())
            },
        }
    }

    fn inbox_entry(&self, request: &R, context_key: &str) -> InboxEntry {
        InboxEntry {
            request_id: request.id().clone(),
            context_key: context_key.to_string(),
            request_type: self.request_type.to_string(),
            handled_at: chrono::Utc::now(),
        }
    }

    fn wrong_mode(&self, node: &str) -> HandlerError {
        HandlerError::failed(format!(
            "{node} node of '{}' was built for another execution mode than {}",
            self.handler, self.mode
        ))
    }
}

impl<R> std::fmt::Debug for Pipeline<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("request_type", &self.request_type)
            .field("handler", &self.handler)
            .field("mode", &self.mode)
            .field("nodes", &self.kinds)
            .finish()
    }
}

const fn applies(on_circuit_open_only: bool, err: &HandlerError) -> bool {
    !on_circuit_open_only || matches!(err, HandlerError::CircuitOpen(_))
}

/// Only failures that say something about the dependency move the breaker.
fn settle(breaker: &CircuitBreaker, result: &Result<(), HandlerError>) {
    match result {
        Ok(()) => breaker.record_success(),
        Err(err) if err.is_transient() => breaker.record_failure(),
        Err(_) => {},
    }
}

fn log_at<R: Request>(level: Level, pipeline: &Pipeline<R>, request: &R, message: &str) {
    let request_id = request.id();
    let request_type = pipeline.request_type;
    let handler = pipeline.handler;
    if level == Level::ERROR {
        tracing::error!(%request_id, request_type, handler, "{message}");
    } else if level == Level::WARN {
        tracing::warn!(%request_id, request_type, handler, "{message}");
    } else if level == Level::INFO {
        tracing::info!(%request_id, request_type, handler, "{message}");
    } else if level == Level::DEBUG {
        tracing::debug!(%request_id, request_type, handler, "{message}");
    } else {
        tracing::trace!(%request_id, request_type, handler, "{message}");
    }
}

fn log_outcome<R: Request>(
    level: Level,
    pipeline: &Pipeline<R>,
    request: &R,
    started: Instant,
    result: &Result<(), HandlerError>,
) {
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    match result {
        Ok(()) => log_at(level, pipeline, request, &format!("handled request in {elapsed_ms}ms")),
        Err(err) => tracing::warn!(
            request_id = %request.id(),
            request_type = pipeline.request_type,
            handler = pipeline.handler,
            elapsed_ms,
            error = %err,
            "request failed"
        ),
    }
}
