//! Inbox storage for once-only handling.

use crate::handler::BoxFuture;
use crate::request::Id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Record that a request was handled under a context key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxEntry {
    /// Request id.
    pub request_id: Id,
    /// Scope of the de-duplication, usually the handler or service name.
    pub context_key: String,
    /// Rust type name of the request.
    pub request_type: String,
    /// When the request was handled.
    pub handled_at: DateTime<Utc>,
}

/// Errors raised by inbox stores.
#[derive(Error, Debug, Clone)]
pub enum InboxError {
    /// Storage backend failure.
    #[error("inbox storage error: {0}")]
    Storage(String),
}

/// Blocking inbox store.
#[allow(clippy::missing_errors_doc)]
pub trait InboxStore: Send + Sync {
    /// Record a handled request. Recording the same key twice is a no-op.
    fn add(&self, entry: InboxEntry) -> Result<(), InboxError>;

    /// Whether the request was handled under `context_key`.
    fn exists(&self, id: &Id, context_key: &str) -> Result<bool, InboxError>;
}

/// Suspending inbox store.
#[allow(missing_docs, clippy::missing_errors_doc)]
pub trait AsyncInboxStore: Send + Sync {
    fn add(&self, entry: InboxEntry) -> BoxFuture<'_, Result<(), InboxError>>;

    fn exists<'a>(&'a self, id: &'a Id, context_key: &'a str) -> BoxFuture<'a, Result<bool, InboxError>>;
}
