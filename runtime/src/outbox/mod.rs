//! Outbox producer mediator.
//!
//! Requests are mapped to messages and deposited in the outbox, optionally
//! inside the caller's transaction. Clearing hands outstanding messages to the
//! producer for their topic and marks them dispatched. Producer calls go
//! through a retry policy wrapped around a per-topic circuit breaker. An open
//! circuit is not retried.
//!
//! Delivery is at least once. A message whose send succeeded but whose
//! dispatch mark failed stays outstanding and is sent again by the next clear.

mod producers;
mod sweeper;

pub use producers::ProducerRegistry;
pub use sweeper::{OutboxSweeper, SweeperHandle};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use crate::error::{ConfigurationError, ExecutionMode};
use crate::mappers::MapperRegistry;
use crate::metrics::OutboxMetrics;
use crate::retry::{RetryPolicy, retry_blocking, retry_with_predicate};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use herald_core::environment::{Clock, SystemClock};
use herald_core::handler::BoxFuture;
use herald_core::mapper::MappingError;
use herald_core::message::{Message, RoutingKey};
use herald_core::outbox::{
    ArchiveProvider, AsyncArchiveProvider, AsyncOutboxStore, OutboxEntry, OutboxStore,
    OutboxStoreError,
};
use herald_core::producer::{AsyncMessageProducer, MessageProducer, ProducerError};
use herald_core::request::{Id, Request, RequestContext};
use herald_core::transaction::{Transaction, TransactionError};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Why a producer call failed.
#[derive(Error, Debug, Clone)]
pub enum SendError {
    /// The topic's circuit breaker is open.
    #[error("circuit for topic '{0}' is open")]
    CircuitOpen(RoutingKey),

    /// The producer failed after retries.
    #[error(transparent)]
    Producer(#[from] ProducerError),
}

/// Errors raised by the outbox mediator.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// The store failed.
    #[error(transparent)]
    Store(#[from] OutboxStoreError),

    /// Missing mapper or similar wiring mistake.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// A request could not be mapped.
    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// The surrounding transaction failed.
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// An id passed to clear is not in the outbox.
    #[error("message {0} is not in the outbox")]
    NotFound(Id),

    /// No producer handles the topic.
    #[error("no {mode} producer registered for topic '{topic}'")]
    MissingProducer {
        /// Topic of the message.
        topic: RoutingKey,
        /// Mode of the call.
        mode: ExecutionMode,
    },

    /// No store for the call's mode.
    #[error("no {0} outbox store is configured")]
    MissingStore(ExecutionMode),

    /// No archive provider for the call's mode.
    #[error("no {0} archive provider is configured")]
    MissingArchive(ExecutionMode),

    /// Sending a message failed.
    #[error("failed to send message {id}: {source}")]
    Send {
        /// Message id.
        id: Id,
        /// Why.
        #[source]
        source: SendError,
    },
}

/// Outbox tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxConfig {
    /// Outstanding ceiling enforced by `post`; negative disables it.
    pub max_outstanding_messages: i64,
    /// Entries archived per batch.
    pub archive_batch_size: usize,
    /// Retry policy for producer calls.
    pub retry: RetryPolicy,
    /// Circuit breaker settings, one breaker per topic.
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_outstanding_messages: -1,
            archive_batch_size: 100,
            retry: RetryPolicy::builder()
                .max_retries(3)
                .initial_delay(Duration::from_millis(50))
                .max_delay(Duration::from_secs(5))
                .build(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl OutboxConfig {
    /// Set the outstanding ceiling (`-1` disables).
    #[must_use]
    pub const fn with_max_outstanding_messages(mut self, ceiling: i64) -> Self {
        self.max_outstanding_messages = ceiling;
        self
    }

    /// Set the archive batch size.
    #[must_use]
    pub const fn with_archive_batch_size(mut self, size: usize) -> Self {
        self.archive_batch_size = size;
        self
    }

    /// Set the producer retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-topic circuit breaker settings.
    #[must_use]
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    fn ceiling(&self) -> Option<usize> {
        usize::try_from(self.max_outstanding_messages).ok()
    }
}

/// Outcome of a clear, per message.
#[derive(Debug, Default)]
pub struct ClearReport {
    /// Sent and marked dispatched.
    pub dispatched: Vec<Id>,
    /// Failed; still outstanding.
    pub failed: Vec<(Id, OutboxError)>,
    /// Already dispatched, or being sent by a concurrent clear.
    pub skipped: Vec<Id>,
}

impl ClearReport {
    /// Whether nothing failed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Dispatched ids, or the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first failure, if any.
    pub fn into_result(self) -> Result<Vec<Id>, OutboxError> {
        match self.failed.into_iter().next() {
            Some((_, err)) => Err(err),
            None => Ok(self.dispatched),
        }
    }

    fn record(&mut self, id: Id, outcome: Outcome) {
        match outcome {
            Outcome::Dispatched => self.dispatched.push(id),
            Outcome::Skipped => self.skipped.push(id),
            Outcome::Failed(err) => self.failed.push((id, err)),
        }
    }
}

enum Outcome {
    Dispatched,
    Skipped,
    Failed(OutboxError),
}

/// Releases a message id when its send finishes.
struct Claim<'a> {
    claims: &'a Mutex<HashSet<Id>>,
    id: Id,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Deposits requests in the outbox and clears them to producers.
pub struct OutboxProducerMediator {
    mappers: Arc<MapperRegistry>,
    producers: Arc<ProducerRegistry>,
    store: Option<Arc<dyn OutboxStore>>,
    async_store: Option<Arc<dyn AsyncOutboxStore>>,
    archive: Option<Arc<dyn ArchiveProvider>>,
    async_archive: Option<Arc<dyn AsyncArchiveProvider>>,
    clock: Arc<dyn Clock>,
    config: OutboxConfig,
    breakers: Mutex<HashMap<RoutingKey, CircuitBreaker>>,
    claims: Mutex<HashSet<Id>>,
}

impl OutboxProducerMediator {
    /// Start building a mediator.
    #[must_use]
    pub fn builder(mappers: Arc<MapperRegistry>, producers: Arc<ProducerRegistry>) -> MediatorBuilder {
        MediatorBuilder {
            mappers,
            producers,
            store: None,
            async_store: None,
            archive: None,
            async_archive: None,
            clock: None,
            config: OutboxConfig::default(),
        }
    }

    /// Mapper registry.
    #[must_use]
    pub fn mappers(&self) -> &MapperRegistry {
        &self.mappers
    }

    /// Producer registry.
    #[must_use]
    pub fn producers(&self) -> &ProducerRegistry {
        &self.producers
    }

    /// Configuration.
    #[must_use]
    pub const fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Circuit breaker guarding `topic`.
    #[must_use]
    pub fn circuit_breaker(&self, topic: &RoutingKey) -> CircuitBreaker {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.clone())
            .or_insert_with(|| CircuitBreaker::new(self.config.circuit_breaker.clone()))
            .clone()
    }

    fn store(&self) -> Result<&dyn OutboxStore, OutboxError> {
        self.store
            .as_deref()
            .ok_or(OutboxError::MissingStore(ExecutionMode::Blocking))
    }

    fn async_store(&self) -> Result<&dyn AsyncOutboxStore, OutboxError> {
        self.async_store
            .as_deref()
            .ok_or(OutboxError::MissingStore(ExecutionMode::Suspending))
    }

    fn claim(&self, id: &Id) -> Option<Claim<'_>> {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        claims.insert(id.clone()).then(|| Claim {
            claims: &self.claims,
            id: id.clone(),
        })
    }

    fn entries<R: Request>(
        &self,
        requests: &[R],
        context: &RequestContext,
    ) -> Result<Vec<OutboxEntry>, OutboxError> {
        let mapped = self.mappers.get::<R>()?;
        let now = self.clock.now();
        requests
            .iter()
            .map(|request| Ok(OutboxEntry::new(mapped.to_message(request, context)?, now)))
            .collect()
    }

    fn older_than(&self, age: Duration) -> DateTime<Utc> {
        let now = self.clock.now();
        chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    // ----- blocking -----

    /// Map and store requests without sending them. Returns their message ids.
    ///
    /// Storing an id that is already in the outbox leaves the existing entry
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if no mapper is registered, mapping fails or the
    /// store rejects the write.
    #[tracing::instrument(skip_all, fields(request_type = std::any::type_name::<R>(), count = requests.len()))]
    pub fn deposit_post<R: Request>(
        &self,
        requests: &[R],
        context: &RequestContext,
        transaction: Option<&mut dyn Transaction>,
    ) -> Result<Vec<Id>, OutboxError> {
        let entries = self.entries(requests, context)?;
        let ids: Vec<Id> = entries.iter().map(|e| e.id().clone()).collect();
        self.store()?.add(entries, transaction)?;
        OutboxMetrics::record_deposit(ids.len());
        tracing::debug!(?ids, "deposited messages in outbox");
        Ok(ids)
    }

    /// Send the given outstanding messages and mark them dispatched.
    ///
    /// Every id is looked up before anything is sent.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::NotFound`] if any id is unknown. Per-message
    /// send failures are reported in the [`ClearReport`].
    #[tracing::instrument(skip_all, fields(count = ids.len()))]
    pub fn clear_outbox(&self, ids: &[Id]) -> Result<ClearReport, OutboxError> {
        let store = self.store()?;
        for id in ids {
            if !store.exists(id)? {
                return Err(OutboxError::NotFound(id.clone()));
            }
        }
        let mut report = ClearReport::default();
        for id in ids {
            let outcome = self.dispatch(store, id);
            report.record(id.clone(), outcome);
        }
        Ok(report)
    }

    fn dispatch(&self, store: &dyn OutboxStore, id: &Id) -> Outcome {
        let Some(_claim) = self.claim(id) else {
            tracing::debug!(%id, "message is being sent by a concurrent clear");
            return Outcome::Skipped;
        };
        let entry = match store.get(id) {
            Ok(Some(entry)) if entry.is_outstanding() => entry,
            Ok(_) => return Outcome::Skipped,
            Err(err) => return Outcome::Failed(err.into()),
        };
        if let Err(err) = self.send(&entry.message) {
            return Outcome::Failed(err);
        }
        match store.mark_dispatched(id, self.clock.now()) {
            Ok(()) => Outcome::Dispatched,
            Err(err) => Outcome::Failed(err.into()),
        }
    }

    fn send(&self, message: &Message) -> Result<(), OutboxError> {
        let topic = message.topic();
        let producer = self
            .producers
            .blocking(topic)
            .ok_or_else(|| OutboxError::MissingProducer {
                topic: topic.clone(),
                mode: ExecutionMode::Blocking,
            })?;
        let breaker = self.circuit_breaker(topic);
        let started = Instant::now();

        let result = retry_blocking(
            &self.config.retry,
            || {
                breaker
                    .call_blocking(|| send_via(producer.as_ref(), message))
                    .map_err(|err| send_error(topic, err))
            },
            is_retryable,
        );
        self.settle_send(message, started, result)
    }

    fn settle_send(
        &self,
        message: &Message,
        started: Instant,
        result: Result<(), SendError>,
    ) -> Result<(), OutboxError> {
        let topic = message.topic().as_str();
        match result {
            Ok(()) => {
                OutboxMetrics::record_dispatch(topic, started.elapsed());
                Ok(())
            },
            Err(source) => {
                OutboxMetrics::record_send_failure(topic);
                tracing::warn!(id = %message.id(), topic, error = %source, "outbox send failed");
                Err(OutboxError::Send {
                    id: message.id().clone(),
                    source,
                })
            },
        }
    }

    /// Deposit a request and send it right away.
    ///
    /// When the outbox holds more outstanding messages than the configured
    /// ceiling, the oldest ones are cleared inline first.
    ///
    /// # Errors
    ///
    /// Returns an error if depositing fails or the request's own message
    /// could not be sent. The message then stays outstanding.
    pub fn post<R: Request>(&self, request: &R, context: &RequestContext) -> Result<Id, OutboxError> {
        let ids = self.deposit_post(std::slice::from_ref(request), context, None)?;
        self.relieve_pressure()?;
        self.clear_outbox(&ids)?.into_result()?;
        ids.into_iter()
            .next()
            .ok_or_else(|| OutboxError::NotFound(request.id().clone()))
    }

    fn relieve_pressure(&self) -> Result<(), OutboxError> {
        let Some(ceiling) = self.config.ceiling() else {
            return Ok(());
        };
        let store = self.store()?;
        let outstanding = store.outstanding_count()?;
        if outstanding <= ceiling {
            return Ok(());
        }
        tracing::warn!(outstanding, ceiling, "outbox above its ceiling, clearing inline");
        let oldest: Vec<Id> = store
            .outstanding(self.clock.now(), outstanding - ceiling)?
            .iter()
            .map(|entry| entry.id().clone())
            .collect();
        let report = self.clear_outbox(&oldest)?;
        OutboxMetrics::record_inline_clear(report.dispatched.len());
        Ok(())
    }

    /// Clear outstanding messages created at least `min_age` ago, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be queried.
    pub fn clear_outstanding(&self, min_age: Duration, limit: usize) -> Result<ClearReport, OutboxError> {
        let ids: Vec<Id> = self
            .store()?
            .outstanding(self.older_than(min_age), limit)?
            .iter()
            .map(|entry| entry.id().clone())
            .collect();
        self.clear_outbox(&ids)
    }

    /// Move dispatched messages older than `min_age` to the archive, in batches.
    ///
    /// Each batch is deleted from the outbox only after the archive accepted
    /// it. Returns the number of archived messages.
    ///
    /// # Errors
    ///
    /// Returns an error if no archive is configured, or the archive or store fails.
    pub fn archive(&self, min_age: Duration) -> Result<usize, OutboxError> {
        let store = self.store()?;
        let archive = self
            .archive
            .as_deref()
            .ok_or(OutboxError::MissingArchive(ExecutionMode::Blocking))?;
        let threshold = self.older_than(min_age);
        let batch_size = self.config.archive_batch_size.max(1);

        let mut archived = 0;
        loop {
            let batch = store.dispatched(threshold, batch_size)?;
            if batch.is_empty() {
                break;
            }
            archive.archive(&batch)?;
            let ids: Vec<Id> = batch.iter().map(|entry| entry.id().clone()).collect();
            store.delete(&ids)?;
            archived += batch.len();
            if batch.len() < batch_size {
                break;
            }
        }
        OutboxMetrics::record_archived(archived);
        tracing::info!(archived, "archived dispatched messages");
        Ok(archived)
    }

    /// Number of outstanding messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn outstanding_count(&self) -> Result<usize, OutboxError> {
        Ok(self.store()?.outstanding_count()?)
    }

    // ----- suspending -----

    /// Suspending [`deposit_post`](Self::deposit_post).
    ///
    /// # Errors
    ///
    /// See [`deposit_post`](Self::deposit_post).
    pub async fn deposit_post_async<R: Request>(
        &self,
        requests: &[R],
        context: &RequestContext,
        transaction: Option<&mut dyn Transaction>,
    ) -> Result<Vec<Id>, OutboxError> {
        let entries = self.entries(requests, context)?;
        let ids: Vec<Id> = entries.iter().map(|e| e.id().clone()).collect();
        let transaction = transaction.map(|tx| -> &mut dyn Transaction { tx });
        self.async_store()?.add(entries, transaction).await?;
        OutboxMetrics::record_deposit(ids.len());
        tracing::debug!(?ids, "deposited messages in outbox");
        Ok(ids)
    }

    /// Suspending [`clear_outbox`](Self::clear_outbox). Messages are sent concurrently.
    ///
    /// # Errors
    ///
    /// See [`clear_outbox`](Self::clear_outbox).
    pub async fn clear_outbox_async(&self, ids: &[Id]) -> Result<ClearReport, OutboxError> {
        let store = self.async_store()?;
        for id in ids {
            if store.get(id).await?.is_none() {
                return Err(OutboxError::NotFound(id.clone()));
            }
        }
        let outcomes = join_all(ids.iter().map(|id| self.dispatch_async(store, id))).await;
        let mut report = ClearReport::default();
        for (id, outcome) in ids.iter().zip(outcomes) {
            report.record(id.clone(), outcome);
        }
        Ok(report)
    }

    async fn dispatch_async(&self, store: &dyn AsyncOutboxStore, id: &Id) -> Outcome {
        let Some(_claim) = self.claim(id) else {
            tracing::debug!(%id, "message is being sent by a concurrent clear");
            return Outcome::Skipped;
        };
        let entry = match store.get(id).await {
            Ok(Some(entry)) if entry.is_outstanding() => entry,
            Ok(_) => return Outcome::Skipped,
            Err(err) => return Outcome::Failed(err.into()),
        };
        if let Err(err) = self.send_async(&entry.message).await {
            return Outcome::Failed(err);
        }
        match store.mark_dispatched(id, self.clock.now()).await {
            Ok(()) => Outcome::Dispatched,
            Err(err) => Outcome::Failed(err.into()),
        }
    }

    async fn send_async(&self, message: &Message) -> Result<(), OutboxError> {
        let topic = message.topic();
        let producer = self
            .producers
            .suspending(topic)
            .ok_or_else(|| OutboxError::MissingProducer {
                topic: topic.clone(),
                mode: ExecutionMode::Suspending,
            })?;
        let producer: &dyn AsyncMessageProducer = producer.as_ref();
        let breaker = &self.circuit_breaker(topic);
        let started = Instant::now();

        let result = retry_with_predicate(
            &self.config.retry,
            move || async move {
                breaker
                    .call(|| send_via_async(producer, message))
                    .await
                    .map_err(|err| send_error(topic, err))
            },
            is_retryable,
        )
        .await;
        self.settle_send(message, started, result)
    }

    /// Suspending [`post`](Self::post).
    ///
    /// # Errors
    ///
    /// See [`post`](Self::post).
    pub async fn post_async<R: Request>(
        &self,
        request: &R,
        context: &RequestContext,
    ) -> Result<Id, OutboxError> {
        let ids = self
            .deposit_post_async(std::slice::from_ref(request), context, None)
            .await?;
        self.relieve_pressure_async().await?;
        self.clear_outbox_async(&ids).await?.into_result()?;
        ids.into_iter()
            .next()
            .ok_or_else(|| OutboxError::NotFound(request.id().clone()))
    }

    async fn relieve_pressure_async(&self) -> Result<(), OutboxError> {
        let Some(ceiling) = self.config.ceiling() else {
            return Ok(());
        };
        let store = self.async_store()?;
        let outstanding = store.outstanding_count().await?;
        if outstanding <= ceiling {
            return Ok(());
        }
        tracing::warn!(outstanding, ceiling, "outbox above its ceiling, clearing inline");
        let oldest: Vec<Id> = store
            .outstanding(self.clock.now(), outstanding - ceiling)
            .await?
            .iter()
            .map(|entry| entry.id().clone())
            .collect();
        let report = self.clear_outbox_async(&oldest).await?;
        OutboxMetrics::record_inline_clear(report.dispatched.len());
        Ok(())
    }

    /// Suspending [`clear_outstanding`](Self::clear_outstanding).
    ///
    /// # Errors
    ///
    /// See [`clear_outstanding`](Self::clear_outstanding).
    pub async fn clear_outstanding_async(
        &self,
        min_age: Duration,
        limit: usize,
    ) -> Result<ClearReport, OutboxError> {
        let ids: Vec<Id> = self
            .async_store()?
            .outstanding(self.older_than(min_age), limit)
            .await?
            .iter()
            .map(|entry| entry.id().clone())
            .collect();
        self.clear_outbox_async(&ids).await
    }

    /// Suspending [`archive`](Self::archive).
    ///
    /// # Errors
    ///
    /// See [`archive`](Self::archive).
    pub async fn archive_async(&self, min_age: Duration) -> Result<usize, OutboxError> {
        let store = self.async_store()?;
        let archive = self
            .async_archive
            .as_deref()
            .ok_or(OutboxError::MissingArchive(ExecutionMode::Suspending))?;
        let threshold = self.older_than(min_age);
        let batch_size = self.config.archive_batch_size.max(1);

        let mut archived = 0;
        loop {
            let batch = store.dispatched(threshold, batch_size).await?;
            if batch.is_empty() {
                break;
            }
            archive.archive(&batch).await?;
            let ids: Vec<Id> = batch.iter().map(|entry| entry.id().clone()).collect();
            store.delete(&ids).await?;
            archived += batch.len();
            if batch.len() < batch_size {
                break;
            }
        }
        OutboxMetrics::record_archived(archived);
        tracing::info!(archived, "archived dispatched messages");
        Ok(archived)
    }

    /// Number of outstanding messages, from the suspending store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn outstanding_count_async(&self) -> Result<usize, OutboxError> {
        Ok(self.async_store()?.outstanding_count().await?)
    }
}

impl std::fmt::Debug for OutboxProducerMediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxProducerMediator")
            .field("producers", &self.producers)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn send_via(producer: &dyn MessageProducer, message: &Message) -> Result<(), ProducerError> {
    let delay = message.header.delayed;
    if delay.is_zero() {
        producer.send(message)
    } else {
        producer.send_with_delay(message, delay)
    }
}

fn send_via_async<'a>(
    producer: &'a dyn AsyncMessageProducer,
    message: &'a Message,
) -> BoxFuture<'a, Result<(), ProducerError>> {
    let delay = message.header.delayed;
    if delay.is_zero() {
        producer.send(message)
    } else {
        producer.send_with_delay(message, delay)
    }
}

fn send_error(topic: &RoutingKey, err: CircuitBreakerError<ProducerError>) -> SendError {
    match err {
        CircuitBreakerError::Open => SendError::CircuitOpen(topic.clone()),
        CircuitBreakerError::Inner(err) => SendError::Producer(err),
    }
}

const fn is_retryable(err: &SendError) -> bool {
    !matches!(err, SendError::CircuitOpen(_))
}

/// Builder for [`OutboxProducerMediator`].
pub struct MediatorBuilder {
    mappers: Arc<MapperRegistry>,
    producers: Arc<ProducerRegistry>,
    store: Option<Arc<dyn OutboxStore>>,
    async_store: Option<Arc<dyn AsyncOutboxStore>>,
    archive: Option<Arc<dyn ArchiveProvider>>,
    async_archive: Option<Arc<dyn AsyncArchiveProvider>>,
    clock: Option<Arc<dyn Clock>>,
    config: OutboxConfig,
}

impl MediatorBuilder {
    /// Blocking outbox store.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn OutboxStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Suspending outbox store.
    #[must_use]
    pub fn async_store(mut self, store: Arc<dyn AsyncOutboxStore>) -> Self {
        self.async_store = Some(store);
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

    /// Clock used for creation, dispatch and archive timestamps.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Tuning.
    #[must_use]
    pub fn config(mut self, config: OutboxConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the mediator.
    #[must_use]
    pub fn build(self) -> OutboxProducerMediator {
        OutboxProducerMediator {
            mappers: self.mappers,
            producers: self.producers,
            store: self.store,
            async_store: self.async_store,
            archive: self.archive,
            async_archive: self.async_archive,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            config: self.config,
            breakers: Mutex::new(HashMap::new()),
            claims: Mutex::new(HashSet::new()),
        }
    }
}
