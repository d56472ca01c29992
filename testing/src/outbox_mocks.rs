//! In-memory outbox testing utilities
//!
//! - [`InMemoryOutbox`]: outbox store with both blocking and async faces
//! - [`InMemoryTransactionProvider`]: transactions that stage outbox writes
//!   until commit
//! - [`InMemoryArchive`]: records archived entries

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use chrono::{DateTime, Utc};
use herald_core::handler::BoxFuture;
use herald_core::outbox::{
    ArchiveProvider, AsyncArchiveProvider, AsyncOutboxStore, OutboxEntry, OutboxStore,
    OutboxStoreError,
};
use herald_core::request::Id;
use herald_core::transaction::{Transaction, TransactionError, TransactionProvider};
use std::any::Any;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct OutboxState {
    entries: Vec<OutboxEntry>,
    failing_adds: usize,
}

impl OutboxState {
    fn insert(&mut self, entries: Vec<OutboxEntry>) {
        for entry in entries {
            if self.entries.iter().any(|existing| existing.id() == entry.id()) {
                continue;
            }
            self.entries.push(entry);
        }
    }

    fn take_failure(&mut self) -> Result<(), OutboxStoreError> {
        if self.failing_adds > 0 {
            self.failing_adds -= 1;
            return Err(OutboxStoreError::Storage("injected add failure".to_string()));
        }
        Ok(())
    }
}

/// In-memory outbox store.
///
/// Adding an id that is already present is a no-op. Writes made through an
/// [`InMemoryTransaction`] become visible only when it commits.
///
/// # Example
///
/// ```
/// use herald_testing::InMemoryOutbox;
/// use herald_core::outbox::{OutboxEntry, OutboxStore};
/// use herald_core::message::{Message, MessageBody, MessageHeader, MessageType};
/// use herald_core::request::Id;
/// use chrono::Utc;
///
/// let outbox = InMemoryOutbox::new();
/// let message = Message::new(
///     MessageHeader::new(Id::new("m-1"), "orders".into(), MessageType::Command),
///     MessageBody::default(),
/// );
/// outbox.add(vec![OutboxEntry::new(message, Utc::now())], None).unwrap();
/// assert_eq!(outbox.outstanding_count().unwrap(), 1);
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryOutbox {
    state: Arc<Mutex<OutboxState>>,
}

impl InMemoryOutbox {
    /// Create an empty outbox
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Transaction provider whose transactions commit into this outbox.
    #[must_use]
    pub fn transaction_provider(&self) -> InMemoryTransactionProvider {
        InMemoryTransactionProvider {
            state: Arc::clone(&self.state),
        }
    }

    /// Make the next `count` adds fail.
    pub fn fail_next_adds(&self, count: usize) {
        self.state.lock().unwrap().failing_adds = count;
    }

    /// Every entry, in insertion order.
    #[must_use]
    pub fn entries(&self) -> Vec<OutboxEntry> {
        self.state.lock().unwrap().entries.clone()
    }

    /// Entry by id.
    #[must_use]
    pub fn entry(&self, id: &Id) -> Option<OutboxEntry> {
        self.state
            .lock()
            .unwrap()
            .entries
            .iter()
            .find(|entry| entry.id() == id)
            .cloned()
    }

    /// Number of stored entries, dispatched or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    /// Whether the outbox holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of undispatched entries, oldest first.
    #[must_use]
    pub fn outstanding_ids(&self) -> Vec<Id> {
        self.outstanding_before(DateTime::<Utc>::MAX_UTC, usize::MAX)
            .iter()
            .map(|entry| entry.id().clone())
            .collect()
    }

    fn add_entries(
        &self,
        entries: Vec<OutboxEntry>,
        transaction: Option<&mut dyn Transaction>,
    ) -> Result<(), OutboxStoreError> {
        self.state.lock().unwrap().take_failure()?;
        match transaction {
            None => {
                self.state.lock().unwrap().insert(entries);
                Ok(())
            },
            Some(transaction) => {
                let staged = transaction
                    .as_any_mut()
                    .downcast_mut::<InMemoryTransaction>()
                    .ok_or_else(|| {
                        OutboxStoreError::IncompatibleTransaction(
                            "expected an in-memory transaction".to_string(),
                        )
                    })?;
                if !Arc::ptr_eq(&staged.state, &self.state) {
                    return Err(OutboxStoreError::IncompatibleTransaction(
                        "transaction belongs to another outbox".to_string(),
                    ));
                }
                staged.pending.extend(entries);
                Ok(())
            },
        }
    }

    fn outstanding_before(&self, created_before: DateTime<Utc>, limit: usize) -> Vec<OutboxEntry> {
        let state = self.state.lock().unwrap();
        let mut outstanding: Vec<OutboxEntry> = state
            .entries
            .iter()
            .filter(|entry| entry.is_outstanding() && entry.created_at <= created_before)
            .cloned()
            .collect();
        outstanding.sort_by_key(|entry| entry.created_at);
        outstanding.truncate(limit);
        outstanding
    }

    fn dispatched_before(&self, dispatched_before: DateTime<Utc>, limit: usize) -> Vec<OutboxEntry> {
        let state = self.state.lock().unwrap();
        let mut dispatched: Vec<OutboxEntry> = state
            .entries
            .iter()
            .filter(|entry| entry.dispatched_at.is_some_and(|at| at <= dispatched_before))
            .cloned()
            .collect();
        dispatched.sort_by_key(|entry| entry.dispatched_at);
        dispatched.truncate(limit);
        dispatched
    }

    fn set_dispatched(&self, id: &Id, at: DateTime<Utc>) -> Result<(), OutboxStoreError> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .entries
            .iter_mut()
            .find(|entry| entry.id() == id)
            .ok_or_else(|| OutboxStoreError::Storage(format!("no outbox entry {id}")))?;
        entry.dispatched_at = Some(at);
        Ok(())
    }

    fn remove(&self, ids: &[Id]) {
        self.state
            .lock()
            .unwrap()
            .entries
            .retain(|entry| !ids.contains(entry.id()));
    }

    fn count_outstanding(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|entry| entry.is_outstanding())
            .count()
    }
}

impl OutboxStore for InMemoryOutbox {
    fn add(
        &self,
        entries: Vec<OutboxEntry>,
        transaction: Option<&mut dyn Transaction>,
    ) -> Result<(), OutboxStoreError> {
        self.add_entries(entries, transaction)
    }

    fn get(&self, id: &Id) -> Result<Option<OutboxEntry>, OutboxStoreError> {
        Ok(self.entry(id))
    }

    fn mark_dispatched(&self, id: &Id, at: DateTime<Utc>) -> Result<(), OutboxStoreError> {
        self.set_dispatched(id, at)
    }

    fn outstanding(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>, OutboxStoreError> {
        Ok(self.outstanding_before(created_before, limit))
    }

    fn outstanding_count(&self) -> Result<usize, OutboxStoreError> {
        Ok(self.count_outstanding())
    }

    fn dispatched(
        &self,
        dispatched_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>, OutboxStoreError> {
        Ok(self.dispatched_before(dispatched_before, limit))
    }

    fn delete(&self, ids: &[Id]) -> Result<(), OutboxStoreError> {
        self.remove(ids);
        Ok(())
    }
}

impl AsyncOutboxStore for InMemoryOutbox {
    fn add<'a>(
        &'a self,
        entries: Vec<OutboxEntry>,
        transaction: Option<&'a mut dyn Transaction>,
    ) -> BoxFuture<'a, Result<(), OutboxStoreError>> {
        Box::pin(async move { self.add_entries(entries, transaction) })
    }

    fn get<'a>(&'a self, id: &'a Id) -> BoxFuture<'a, Result<Option<OutboxEntry>, OutboxStoreError>> {
        Box::pin(async move { Ok(self.entry(id)) })
    }

    fn mark_dispatched<'a>(
        &'a self,
        id: &'a Id,
        at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), OutboxStoreError>> {
        Box::pin(async move { self.set_dispatched(id, at) })
    }

    fn outstanding(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<OutboxEntry>, OutboxStoreError>> {
        Box::pin(async move { Ok(self.outstanding_before(created_before, limit)) })
    }

    fn outstanding_count(&self) -> BoxFuture<'_, Result<usize, OutboxStoreError>> {
        Box::pin(async move { Ok(self.count_outstanding()) })
    }

    fn dispatched(
        &self,
        dispatched_before: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<OutboxEntry>, OutboxStoreError>> {
        Box::pin(async move { Ok(self.dispatched_before(dispatched_before, limit)) })
    }

    fn delete<'a>(&'a self, ids: &'a [Id]) -> BoxFuture<'a, Result<(), OutboxStoreError>> {
        Box::pin(async move {
            self.remove(ids);
            Ok(())
        })
    }
}

/// Begins [`InMemoryTransaction`]s bound to one [`InMemoryOutbox`].
#[derive(Clone, Debug)]
pub struct InMemoryTransactionProvider {
    state: Arc<Mutex<OutboxState>>,
}

impl TransactionProvider for InMemoryTransactionProvider {
    fn begin(&self) -> Result<Box<dyn Transaction>, TransactionError> {
        Ok(Box::new(InMemoryTransaction {
            state: Arc::clone(&self.state),
            pending: Vec::new(),
        }))
    }
}

/// Staged outbox writes. Dropping without commit discards them.
#[derive(Debug)]
pub struct InMemoryTransaction {
    state: Arc<Mutex<OutboxState>>,
    pending: Vec<OutboxEntry>,
}

impl InMemoryTransaction {
    /// Number of staged entries.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl Transaction for InMemoryTransaction {
    fn commit(self: Box<Self>) -> Result<(), TransactionError> {
        let Self { state, pending } = *self;
        state.lock().unwrap().insert(pending);
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), TransactionError> {
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Archive that keeps every entry it receives.
#[derive(Clone, Debug, Default)]
pub struct InMemoryArchive {
    archived: Arc<Mutex<Vec<OutboxEntry>>>,
    failing: Arc<Mutex<bool>>,
}

impl InMemoryArchive {
    /// Create an empty archive
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every archive call fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    /// Archived entries, in archive order.
    #[must_use]
    pub fn archived(&self) -> Vec<OutboxEntry> {
        self.archived.lock().unwrap().clone()
    }

    fn store(&self, entries: &[OutboxEntry]) -> Result<(), OutboxStoreError> {
        if *self.failing.lock().unwrap() {
            return Err(OutboxStoreError::Archive("archive unavailable".to_string()));
        }
        self.archived.lock().unwrap().extend_from_slice(entries);
        Ok(())
    }
}

impl ArchiveProvider for InMemoryArchive {
    fn archive(&self, entries: &[OutboxEntry]) -> Result<(), OutboxStoreError> {
        self.store(entries)
    }
}

impl AsyncArchiveProvider for InMemoryArchive {
    fn archive<'a>(&'a self, entries: &'a [OutboxEntry]) -> BoxFuture<'a, Result<(), OutboxStoreError>> {
        Box::pin(async move { self.store(entries) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::message::{Message, MessageBody, MessageHeader, MessageType};
    use herald_core::transaction::with_transaction;

    fn entry(id: &str, created_at: DateTime<Utc>) -> OutboxEntry {
        OutboxEntry::new(
            Message::new(
                MessageHeader::new(Id::new(id), "orders".into(), MessageType::Command),
                MessageBody::default(),
            ),
            created_at,
        )
    }

    #[test]
    fn duplicate_adds_are_ignored() {
        let outbox = InMemoryOutbox::new();
        let now = Utc::now();
        OutboxStore::add(&outbox, vec![entry("a", now)], None).unwrap();
        OutboxStore::add(&outbox, vec![entry("a", now)], None).unwrap();
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn committed_transactions_become_visible() {
        let outbox = InMemoryOutbox::new();
        let provider = outbox.transaction_provider();

        let result: Result<(), WorkError> = with_transaction(&provider, |tx| {
            OutboxStore::add(&outbox, vec![entry("a", Utc::now())], Some(tx))?;
            assert!(outbox.is_empty());
            Ok(())
        });

        result.unwrap();
        assert_eq!(outbox.outstanding_ids(), vec![Id::new("a")]);
    }

    #[test]
    fn rolled_back_transactions_leave_nothing() {
        let outbox = InMemoryOutbox::new();
        let provider = outbox.transaction_provider();

        let result: Result<(), WorkError> = with_transaction(&provider, |tx| {
            OutboxStore::add(&outbox, vec![entry("a", Utc::now())], Some(tx))?;
            Err(OutboxStoreError::Storage("abort".to_string()).into())
        });

        assert!(matches!(result, Err(WorkError::Store(_))));
        assert!(outbox.is_empty());
    }

    #[test]
    fn outstanding_is_oldest_first_and_bounded() {
        let outbox = InMemoryOutbox::new();
        let now = Utc::now();
        OutboxStore::add(
            &outbox,
            vec![
                entry("new", now),
                entry("old", now - chrono::Duration::seconds(10)),
                entry("mid", now - chrono::Duration::seconds(5)),
            ],
            None,
        )
        .unwrap();

        let ids: Vec<Id> = OutboxStore::outstanding(&outbox, now - chrono::Duration::seconds(1), 5)
            .unwrap()
            .iter()
            .map(|e| e.id().clone())
            .collect();
        assert_eq!(ids, vec![Id::new("old"), Id::new("mid")]);
    }

    #[derive(Debug)]
    enum WorkError {
        Store(OutboxStoreError),
        Transaction(TransactionError),
    }

    impl From<OutboxStoreError> for WorkError {
        fn from(err: OutboxStoreError) -> Self {
            Self::Store(err)
        }
    }

    impl From<TransactionError> for WorkError {
        fn from(err: TransactionError) -> Self {
            Self::Transaction(err)
        }
    }
}
