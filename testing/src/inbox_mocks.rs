//! In-memory inbox for once-only handling tests.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use herald_core::handler::BoxFuture;
use herald_core::inbox::{AsyncInboxStore, InboxEntry, InboxError, InboxStore};
use herald_core::request::Id;
use std::sync::{Arc, Mutex};

/// In-memory inbox keyed by request id and context key.
#[derive(Clone, Debug, Default)]
pub struct InMemoryInbox {
    entries: Arc<Mutex<Vec<InboxEntry>>>,
}

impl InMemoryInbox {
    /// Create an empty inbox
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded entries, in handling order.
    #[must_use]
    pub fn entries(&self) -> Vec<InboxEntry> {
        self.entries.lock().unwrap().clone()
    }

    /// Number of recorded entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, entry: InboxEntry) {
        let mut entries = self.entries.lock().unwrap();
        let seen = entries
            .iter()
            .any(|e| e.request_id == entry.request_id && e.context_key == entry.context_key);
        if !seen {
            entries.push(entry);
        }
    }

    fn contains(&self, id: &Id, context_key: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .any(|e| &e.request_id == id && e.context_key == context_key)
    }
}

impl InboxStore for InMemoryInbox {
    fn add(&self, entry: InboxEntry) -> Result<(), InboxError> {
        self.record(entry);
        Ok(())
    }

    fn exists(&self, id: &Id, context_key: &str) -> Result<bool, InboxError> {
        Ok(self.contains(id, context_key))
    }
}

impl AsyncInboxStore for InMemoryInbox {
    fn add(&self, entry: InboxEntry) -> BoxFuture<'_, Result<(), InboxError>> {
        Box::pin(async move {
            self.record(entry);
            Ok(())
        })
    }

    fn exists<'a>(&'a self, id: &'a Id, context_key: &'a str) -> BoxFuture<'a, Result<bool, InboxError>> {
        Box::pin(async move { Ok(self.contains(id, context_key)) })
    }
}
