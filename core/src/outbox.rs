//! Outbox storage and archive contracts.

use crate::handler::BoxFuture;
use crate::message::Message;
use crate::request::Id;
use crate::transaction::Transaction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A message persisted in the outbox.
///
/// An entry is outstanding until `dispatched_at` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// The stored message.
    pub message: Message,
    /// When the message was deposited.
    pub created_at: DateTime<Utc>,
    /// When the message was handed to a producer.
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// A new outstanding entry.
    #[must_use]
    pub const fn new(message: Message, created_at: DateTime<Utc>) -> Self {
        Self {
            message,
            created_at,
            dispatched_at: None,
        }
    }

    /// Message id.
    #[must_use]
    pub const fn id(&self) -> &Id {
        self.message.id()
    }

    /// Whether the entry still needs to be sent.
    #[must_use]
    pub const fn is_outstanding(&self) -> bool {
        self.dispatched_at.is_none()
    }
}

/// Errors raised by outbox stores and archive providers.
#[derive(Error, Debug, Clone)]
pub enum OutboxStoreError {
    /// Storage backend failure.
    #[error("outbox storage error: {0}")]
    Storage(String),

    /// The transaction handed to the store belongs to another backend.
    #[error("transaction is not compatible with this outbox: {0}")]
    IncompatibleTransaction(String),

    /// The archive refused the entries.
    #[error("archive error: {0}")]
    Archive(String),
}

/// Blocking outbox store.
///
/// Adding an id that already exists is a no-op. Outstanding and
/// dispatched queries return entries oldest first.
#[allow(clippy::missing_errors_doc)]
pub trait OutboxStore: Send + Sync {
    /// Persist entries, inside `transaction` when one is given.
    fn add(
        &self,
        entries: Vec<OutboxEntry>,
        transaction: Option<&mut dyn Transaction>,
    ) -> Result<(), OutboxStoreError>;

    /// Look up an entry.
    fn get(&self, id: &Id) -> Result<Option<OutboxEntry>, OutboxStoreError>;

    /// Whether an entry exists.
    fn exists(&self, id: &Id) -> Result<bool, OutboxStoreError> {
        Ok(self.get(id)?.is_some())
    }

    /// Record that the entry was handed to a producer at `at`.
    fn mark_dispatched(&self, id: &Id, at: DateTime<Utc>) -> Result<(), OutboxStoreError>;

    /// Outstanding entries created at or before `created_before`, at most `limit`.
    fn outstanding(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>, OutboxStoreError>;

    /// Number of outstanding entries.
    fn outstanding_count(&self) -> Result<usize, OutboxStoreError>;

    /// Dispatched entries dispatched at or before `dispatched_before`, at most `limit`.
    fn dispatched(
        &self,
        dispatched_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>, OutboxStoreError>;

    /// Remove entries.
    fn delete(&self, ids: &[Id]) -> Result<(), OutboxStoreError>;
}

/// Suspending outbox store. Same semantics as [`OutboxStore`].
#[allow(missing_docs, clippy::missing_errors_doc)]
pub trait AsyncOutboxStore: Send + Sync {
    fn add<'a>(
        &'a self,
        entries: Vec<OutboxEntry>,
        transaction: Option<&'a mut dyn Transaction>,
    ) -> BoxFuture<'a, Result<(), OutboxStoreError>>;

    fn get<'a>(&'a self, id: &'a Id) -> BoxFuture<'a, Result<Option<OutboxEntry>, OutboxStoreError>>;

    fn mark_dispatched<'a>(
        &'a self,
        id: &'a Id,
        at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), OutboxStoreError>>;

    fn outstanding(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<OutboxEntry>, OutboxStoreError>>;

    fn outstanding_count(&self) -> BoxFuture<'_, Result<usize, OutboxStoreError>>;

    fn dispatched(
        &self,
        dispatched_before: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<OutboxEntry>, OutboxStoreError>>;

    fn delete<'a>(&'a self, ids: &'a [Id]) -> BoxFuture<'a, Result<(), OutboxStoreError>>;
}

/// Long-term storage for dispatched messages.
pub trait ArchiveProvider: Send + Sync {
    /// Archive a batch. Entries are deleted from the outbox only after this succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxStoreError::Archive`] if the batch was not stored.
    fn archive(&self, entries: &[OutboxEntry]) -> Result<(), OutboxStoreError>;
}

/// Suspending archive provider.
pub trait AsyncArchiveProvider: Send + Sync {
    /// Archive a batch.
    ///
    /// # Errors
    ///
    /// Resolves to [`OutboxStoreError::Archive`] if the batch was not stored.
    fn archive<'a>(&'a self, entries: &'a [OutboxEntry]) -> BoxFuture<'a, Result<(), OutboxStoreError>>;
}
