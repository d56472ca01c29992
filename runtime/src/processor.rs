//! The command processor: the façade application code dispatches through.
//!
//! - `send` runs the single handler registered for a request type.
//! - `publish` runs every handler, continuing past failures.
//! - `post`, `deposit_post` and `clear_outbox` go through the outbox.
//! - `call` sends a request and waits for the correlated reply.
//!
//! Each operation has a suspending mirror. Pipelines are built fresh for
//! every dispatch from shapes cached by the [`PipelineBuilder`].

use crate::error::{ConfigurationError, DispatchError, ExecutionMode};
use crate::mappers::MapperRegistry;
use crate::metrics::ProcessorMetrics;
use crate::outbox::{ClearReport, OutboxConfig, OutboxError, OutboxProducerMediator, ProducerRegistry};
use crate::pipeline::{InboxConfiguration, Pipeline, PipelineBuilder, SubscriberRegistry};
use crate::policy::PolicyRegistry;
use herald_core::channel::ChannelFactory;
use herald_core::environment::Clock;
use herald_core::handler::HandlerError;
use herald_core::message::RoutingKey;
use herald_core::outbox::{ArchiveProvider, AsyncArchiveProvider, AsyncOutboxStore, OutboxStore};
use herald_core::request::{DefaultRequestContextFactory, Id, Request, RequestContext, RequestContextFactory};
use herald_core::subscription::Subscription;
use herald_core::transaction::Transaction;
use std::any::type_name;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

/// Dispatches requests to handler pipelines and the outbox.
pub struct CommandProcessor {
    pipelines: PipelineBuilder,
    mappers: Arc<MapperRegistry>,
    producers: Arc<ProducerRegistry>,
    mediator: Option<Arc<OutboxProducerMediator>>,
    context_factory: Arc<dyn RequestContextFactory>,
    reply_channels: Option<Arc<dyn ChannelFactory>>,
}

impl CommandProcessor {
    /// Start building a processor over `registry`.
    #[must_use]
    pub fn builder(registry: SubscriberRegistry) -> ProcessorBuilder {
        ProcessorBuilder::new(registry)
    }

    /// A fresh request context from the configured factory.
    #[must_use]
    pub fn create_context(&self) -> RequestContext {
        self.context_factory.create()
    }

    /// Registered mappers.
    #[must_use]
    pub fn mappers(&self) -> &MapperRegistry {
        &self.mappers
    }

    /// The pipeline builder.
    #[must_use]
    pub const fn pipelines(&self) -> &PipelineBuilder {
        &self.pipelines
    }

    /// The outbox mediator, if an outbox is configured.
    #[must_use]
    pub const fn mediator(&self) -> Option<&Arc<OutboxProducerMediator>> {
        self.mediator.as_ref()
    }

    /// Drop cached pipeline shapes; the next dispatch rebuilds them.
    pub fn clear_pipeline_cache(&self) {
        self.pipelines.clear_cache();
    }

    /// Check that `R` has a buildable pipeline in `mode`.
    ///
    /// # Errors
    ///
    /// Returns the [`ConfigurationError`] a dispatch would hit.
    pub fn validate<R: Request>(&self, mode: ExecutionMode) -> Result<(), ConfigurationError> {
        self.pipelines.build_for::<R>(mode).map(drop)
    }

    fn single_pipeline<R: Request>(&self, mode: ExecutionMode) -> Result<Pipeline<R>, ConfigurationError> {
        let count = self.pipelines.registry().handler_count::<R>();
        if count > 1 {
            return Err(ConfigurationError::MultipleHandlers {
                request_type: type_name::<R>(),
                count,
            });
        }
        self.pipelines
            .build_for::<R>(mode)?
            .pop()
            .ok_or(ConfigurationError::MissingHandler(type_name::<R>()))
    }

    /// Pipelines for publishing `R`; no handlers is not an error.
    fn publish_pipelines<R: Request>(&self, mode: ExecutionMode) -> Result<Vec<Pipeline<R>>, ConfigurationError> {
        match self.pipelines.build_for::<R>(mode) {
            Err(ConfigurationError::MissingHandler(request_type)) => {
                tracing::debug!(request_type, "no handlers subscribed to event");
                Ok(Vec::new())
            },
            result => result,
        }
    }

    fn mediator_or_err(&self) -> Result<&OutboxProducerMediator, ConfigurationError> {
        self.mediator
            .as_deref()
            .ok_or(ConfigurationError::MissingOutbox)
    }

    // ----- send -----

    /// Dispatch `request` to its single handler.
    ///
    /// # Errors
    ///
    /// Returns a configuration error unless exactly one handler is
    /// registered, or the handler pipeline's failure.
    pub fn send<R: Request>(&self, request: &mut R) -> Result<(), DispatchError> {
        let mut context = self.create_context();
        self.send_with_context(request, &mut context)
    }

    /// [`send`](Self::send) with a caller-supplied context.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn send_with_context<R: Request>(
        &self,
        request: &mut R,
        context: &mut RequestContext,
    ) -> Result<(), DispatchError> {
        let span = tracing::info_span!("processor.send", request_type = type_name::<R>(), request_id = %request.id());
        let _entered = span.enter();
        context.set_span(span.clone());
        ProcessorMetrics::record_request("send");

        let result = self
            .single_pipeline::<R>(ExecutionMode::Blocking)
            .map_err(DispatchError::from)
            .and_then(|pipeline| {
                pipeline
                    .run(request, context)
                    .map_err(|source| handler_failure(&pipeline, source))
            });
        observe("send", result)
    }

    /// Suspending [`send`](Self::send).
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_async<R: Request>(&self, request: &mut R) -> Result<(), DispatchError> {
        let mut context = self.create_context();
        self.send_async_with_context(request, &mut context).await
    }

    /// Suspending [`send_with_context`](Self::send_with_context).
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_async_with_context<R: Request>(
        &self,
        request: &mut R,
        context: &mut RequestContext,
    ) -> Result<(), DispatchError> {
        let span = tracing::info_span!("processor.send", request_type = type_name::<R>(), request_id = %request.id());
        context.set_span(span.clone());
        ProcessorMetrics::record_request("send");

        let result = async {
            let pipeline = self.single_pipeline::<R>(ExecutionMode::Suspending)?;
            pipeline
                .run_async(request, context)
                .await
                .map_err(|source| handler_failure(&pipeline, source))
        }
        .instrument(span)
        .await;
        observe("send", result)
    }

    // ----- publish -----

    /// Dispatch `request` to every subscribed handler, in registration order.
    ///
    /// Every handler runs even if an earlier one fails.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Aggregate`] holding each handler failure, or
    /// a configuration error if a pipeline could not be built.
    pub fn publish<R: Request>(&self, request: &mut R) -> Result<(), DispatchError> {
        let mut context = self.create_context();
        self.publish_with_context(request, &mut context)
    }

    /// [`publish`](Self::publish) with a caller-supplied context.
    ///
    /// # Errors
    ///
    /// See [`publish`](Self::publish).
    pub fn publish_with_context<R: Request>(
        &self,
        request: &mut R,
        context: &mut RequestContext,
    ) -> Result<(), DispatchError> {
        let span = tracing::info_span!("processor.publish", request_type = type_name::<R>(), request_id = %request.id());
        let _entered = span.enter();
        context.set_span(span.clone());
        ProcessorMetrics::record_request("publish");

        let result = self
            .publish_pipelines::<R>(ExecutionMode::Blocking)
            .map_err(DispatchError::from)
            .and_then(|pipelines| {
                let mut failures = Vec::new();
                for pipeline in &pipelines {
                    if let Err(source) = pipeline.run(&mut *request, &mut *context) {
                        failures.push(handler_failure(pipeline, source));
                    }
                }
                aggregate(pipelines.len(), failures)
            });
        observe("publish", result)
    }

    /// Suspending [`publish`](Self::publish). Handlers run one after another.
    ///
    /// # Errors
    ///
    /// See [`publish`](Self::publish).
    pub async fn publish_async<R: Request>(&self, request: &mut R) -> Result<(), DispatchError> {
        let mut context = self.create_context();
        self.publish_async_with_context(request, &mut context).await
    }

    /// Suspending [`publish_with_context`](Self::publish_with_context).
    ///
    /// # Errors
    ///
    /// See [`publish`](Self::publish).
    pub async fn publish_async_with_context<R: Request>(
        &self,
        request: &mut R,
        context: &mut RequestContext,
    ) -> Result<(), DispatchError> {
        let span = tracing::info_span!("processor.publish", request_type = type_name::<R>(), request_id = %request.id());
        context.set_span(span.clone());
        ProcessorMetrics::record_request("publish");

        let result = async {
            let pipelines = self.publish_pipelines::<R>(ExecutionMode::Suspending)?;
            let mut failures = Vec::new();
            for pipeline in &pipelines {
                if let Err(source) = pipeline.run_async(&mut *request, &mut *context).await {
                    failures.push(handler_failure(pipeline, source));
                }
            }
            aggregate(pipelines.len(), failures)
        }
        .instrument(span)
        .await;
        observe("publish", result)
    }

    // ----- outbox -----

    /// Deposit `request` in the outbox and send it immediately.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::MissingOutbox`] without an outbox, or
    /// the mediator's failure. A failed send leaves the message outstanding.
    pub fn post<R: Request>(&self, request: &R) -> Result<Id, DispatchError> {
        ProcessorMetrics::record_request("post");
        let context = self.create_context();
        let result = self
            .mediator_or_err()
            .map_err(DispatchError::from)
            .and_then(|mediator| Ok(mediator.post(request, &context)?));
        observe("post", result)
    }

    /// Suspending [`post`](Self::post).
    ///
    /// # Errors
    ///
    /// See [`post`](Self::post).
    pub async fn post_async<R: Request>(&self, request: &R) -> Result<Id, DispatchError> {
        ProcessorMetrics::record_request("post");
        let context = self.create_context();
        let result = match self.mediator_or_err() {
            Ok(mediator) => mediator
                .post_async(request, &context)
                .await
                .map_err(DispatchError::from),
            Err(err) => Err(err.into()),
        };
        observe("post", result)
    }

    /// Store requests in the outbox without sending them, optionally inside
    /// the caller's transaction.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::MissingOutbox`] without an outbox, or
    /// the mediator's failure.
    pub fn deposit_post<R: Request>(
        &self,
        requests: &[R],
        transaction: Option<&mut dyn Transaction>,
    ) -> Result<Vec<Id>, DispatchError> {
        ProcessorMetrics::record_request("deposit_post");
        let context = self.create_context();
        let mediator = self.mediator_or_err()?;
        observe(
            "deposit_post",
            mediator
                .deposit_post(requests, &context, transaction)
                .map_err(DispatchError::from),
        )
    }

    /// Suspending [`deposit_post`](Self::deposit_post).
    ///
    /// # Errors
    ///
    /// See [`deposit_post`](Self::deposit_post).
    pub async fn deposit_post_async<R: Request>(
        &self,
        requests: &[R],
        transaction: Option<&mut dyn Transaction>,
    ) -> Result<Vec<Id>, DispatchError> {
        ProcessorMetrics::record_request("deposit_post");
        let context = self.create_context();
        let mediator = self.mediator_or_err()?;
        let result = mediator
            .deposit_post_async(requests, &context, transaction)
            .await
            .map_err(DispatchError::from);
        observe("deposit_post", result)
    }

    /// Send deposited messages.
    ///
    /// # Errors
    ///
    /// Fails if an id is unknown. Per-message send failures are in the report.
    pub fn clear_outbox(&self, ids: &[Id]) -> Result<ClearReport, DispatchError> {
        ProcessorMetrics::record_request("clear_outbox");
        let mediator = self.mediator_or_err()?;
        observe("clear_outbox", mediator.clear_outbox(ids).map_err(DispatchError::from))
    }

    /// Suspending [`clear_outbox`](Self::clear_outbox).
    ///
    /// # Errors
    ///
    /// See [`clear_outbox`](Self::clear_outbox).
    pub async fn clear_outbox_async(&self, ids: &[Id]) -> Result<ClearReport, DispatchError> {
        ProcessorMetrics::record_request("clear_outbox");
        let mediator = self.mediator_or_err()?;
        let result = mediator
            .clear_outbox_async(ids)
            .await
            .map_err(DispatchError::from);
        observe("clear_outbox", result)
    }

    // ----- request-reply -----

    /// Send `request` and wait for the reply correlated to its id.
    ///
    /// A private reply channel is created for the call. Replies carrying a
    /// different correlation id are rejected.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::ReplyTimeout`] if no reply arrives within
    /// `timeout`, or a configuration, mapping, transport or channel error.
    #[tracing::instrument(skip_all, name = "processor.call", fields(request_type = type_name::<Q>(), request_id = %request.id()))]
    pub fn call<Q: Request, P: Request>(&self, request: &Q, timeout: Duration) -> Result<P, DispatchError> {
        ProcessorMetrics::record_request("call");
        let result = self.call_inner(request, timeout);
        observe("call", result)
    }

    fn call_inner<Q: Request, P: Request>(&self, request: &Q, timeout: Duration) -> Result<P, DispatchError> {
        let factory = self
            .reply_channels
            .as_ref()
            .ok_or(ConfigurationError::MissingReplyChannelFactory)?;
        let outbound = self.mappers.get::<Q>()?;
        let inbound = self.mappers.get::<P>()?;

        let reply_to = RoutingKey::new(format!(
            "{}.reply.{}",
            outbound.publication.topic,
            Id::random()
        ));
        let subscription = Subscription::new(reply_to.as_str(), reply_to.as_str(), reply_to.clone())
            .with_timeout(timeout.min(Duration::from_millis(100)));
        let channel = factory.create_sync_channel(&subscription)?;

        let context = self.create_context();
        let mut message = outbound.to_message(request, &context)?;
        message.header.reply_to = Some(reply_to.clone());
        message.header.correlation_id = Some(request.id().clone());

        let producer = self.producers.blocking(message.topic()).ok_or_else(|| {
            OutboxError::MissingProducer {
                topic: message.topic().clone(),
                mode: ExecutionMode::Blocking,
            }
        })?;
        producer.send(&message)?;
        tracing::debug!(reply_to = %reply_to, "request sent, awaiting reply");

        // A timeout past the clock's range waits without a deadline.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let remaining = deadline.map_or(timeout, |d| d.saturating_duration_since(Instant::now()));
            if remaining.is_zero() {
                return Err(DispatchError::ReplyTimeout(timeout));
            }
            let Some(reply) = channel.receive(remaining.min(subscription.timeout))? else {
                continue;
            };
            if reply.header.correlation_id.as_ref() != Some(request.id()) {
                tracing::warn!(message_id = %reply.id(), "reply does not match the pending call, rejecting");
                channel.reject(&reply)?;
                continue;
            }
            channel.acknowledge(&reply)?;
            return Ok(inbound.mapper.map_to_request(&reply)?);
        }
    }
}

impl std::fmt::Debug for CommandProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandProcessor")
            .field("pipelines", &self.pipelines)
            .field("outbox", &self.mediator.is_some())
            .finish_non_exhaustive()
    }
}

fn handler_failure<R: Request>(pipeline: &Pipeline<R>, source: HandlerError) -> DispatchError {
    DispatchError::Handler {
        handler: pipeline.handler_name(),
        source,
    }
}

fn aggregate(total: usize, failures: Vec<DispatchError>) -> Result<(), DispatchError> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(DispatchError::Aggregate { total, failures })
    }
}

fn observe<T>(operation: &'static str, result: Result<T, DispatchError>) -> Result<T, DispatchError> {
    if let Err(err) = &result {
        ProcessorMetrics::record_failure(operation);
        tracing::debug!(operation, error = %err, "dispatch failed");
    }
    result
}

/// Builder for [`CommandProcessor`].
pub struct ProcessorBuilder {
    registry: SubscriberRegistry,
    policies: PolicyRegistry,
    inbox: InboxConfiguration,
    mappers: MapperRegistry,
    producers: ProducerRegistry,
    outbox: Option<Arc<dyn OutboxStore>>,
    async_outbox: Option<Arc<dyn AsyncOutboxStore>>,
    archive: Option<Arc<dyn ArchiveProvider>>,
    async_archive: Option<Arc<dyn AsyncArchiveProvider>>,
    outbox_config: OutboxConfig,
    clock: Option<Arc<dyn Clock>>,
    context_factory: Arc<dyn RequestContextFactory>,
    reply_channels: Option<Arc<dyn ChannelFactory>>,
}

impl ProcessorBuilder {
    /// A builder with default policies and no outbox.
    #[must_use]
    pub fn new(registry: SubscriberRegistry) -> Self {
        Self {
            registry,
            policies: PolicyRegistry::with_defaults(),
            inbox: InboxConfiguration::default(),
            mappers: MapperRegistry::new(),
            producers: ProducerRegistry::new(),
            outbox: None,
            async_outbox: None,
            archive: None,
            async_archive: None,
            outbox_config: OutboxConfig::default(),
            clock: None,
            context_factory: Arc::new(DefaultRequestContextFactory),
            reply_channels: None,
        }
    }

    /// Named retry and circuit-breaker policies.
    #[must_use]
    pub fn policies(mut self, policies: PolicyRegistry) -> Self {
        self.policies = policies;
        self
    }

    /// Inbox used by once-only handling.
    #[must_use]
    pub fn inbox(mut self, inbox: InboxConfiguration) -> Self {
        self.inbox = inbox;
        self
    }

    /// Message mappers.
    #[must_use]
    pub fn mappers(mut self, mappers: MapperRegistry) -> Self {
        self.mappers = mappers;
        self
    }

    /// Producers keyed by topic.
    #[must_use]
    pub fn producers(mut self, producers: ProducerRegistry) -> Self {
        self.producers = producers;
        self
    }

    /// Blocking outbox store.
    #[must_use]
    pub fn outbox(mut self, store: Arc<dyn OutboxStore>) -> Self {
        self.outbox = Some(store);
        self
    }

    /// Suspending outbox store.
    #[must_use]
    pub fn async_outbox(mut self, store: Arc<dyn AsyncOutboxStore>) -> Self {
        self.async_outbox = Some(store);
        self
    }

    /// Blocking archive provider.
    #[must_use]
    pub fn archive(mut self, archive: Arc<dyn ArchiveProvider>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Suspending archive provider.
    #[must_use]
    pub fn async_archive(mut self, archive: Arc<dyn AsyncArchiveProvider>) -> Self {
        self.async_archive = Some(archive);
        self
    }

    /// Outbox tuning.
    #[must_use]
    pub fn outbox_config(mut self, config: OutboxConfig) -> Self {
        self.outbox_config = config;
        self
    }

    /// Clock for outbox timestamps.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Factory for per-dispatch contexts.
    #[must_use]
    pub fn context_factory(mut self, factory: Arc<dyn RequestContextFactory>) -> Self {
        self.context_factory = factory;
        self
    }

    /// Channel factory used to create reply channels for [`CommandProcessor::call`].
    #[must_use]
    pub fn reply_channel_factory(mut self, factory: Arc<dyn ChannelFactory>) -> Self {
        self.reply_channels = Some(factory);
        self
    }

    /// Build the processor. An outbox mediator is created when a store is set.
    #[must_use]
    pub fn build(self) -> CommandProcessor {
        let mappers = Arc::new(self.mappers);
        let producers = Arc::new(self.producers);

        let mediator = (self.outbox.is_some() || self.async_outbox.is_some()).then(|| {
            let mut builder = OutboxProducerMediator::builder(Arc::clone(&mappers), Arc::clone(&producers))
                .config(self.outbox_config);
            if let Some(store) = self.outbox {
                builder = builder.store(store);
            }
            if let Some(store) = self.async_outbox {
                builder = builder.async_store(store);
            }
            if let Some(archive) = self.archive {
                builder = builder.archive(archive);
            }
            if let Some(archive) = self.async_archive {
                builder = builder.async_archive(archive);
            }
            if let Some(clock) = self.clock {
                builder = builder.clock(clock);
            }
            Arc::new(builder.build())
        });

        CommandProcessor {
            pipelines: PipelineBuilder::new(Arc::new(self.registry), Arc::new(self.policies), self.inbox),
            mappers,
            producers,
            mediator,
            context_factory: self.context_factory,
            reply_channels: self.reply_channels,
        }
    }
}
