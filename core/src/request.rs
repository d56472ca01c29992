//! Requests and the per-dispatch context that travels with them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Unique identifier of a request or message.
///
/// Wraps a string so adapters can carry broker-native identifiers, while
/// [`Id::random`] produces UUID v4 values for locally created requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    /// Create an identifier from any string-like value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a fresh random identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Id {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<uuid::Uuid> for Id {
    fn from(value: uuid::Uuid) -> Self {
        Self(value.to_string())
    }
}

/// A command or event dispatched through the processor.
///
/// The concrete Rust type of the request is its routing key inside the
/// process: handlers, QoS declarations and mappers are all registered per
/// type.
pub trait Request: Send + Sync + 'static {
    /// Stable identifier, used for inbox de-duplication and correlation.
    fn id(&self) -> &Id;
}

/// Per-dispatch mutable context.
///
/// Created fresh for every processor call by a [`RequestContextFactory`].
/// Handlers in the same pipeline share it, so QoS nodes and targets can
/// pass values through the bag.
#[derive(Debug, Default)]
pub struct RequestContext {
    bag: HashMap<String, serde_json::Value>,
    span: Option<tracing::Span>,
    partition_key: Option<String>,
}

impl RequestContext {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the partition key used when the request is mapped to a message.
    #[must_use]
    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// Insert a value into the bag, returning the previous value.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Option<serde_json::Value> {
        self.bag.insert(key.into(), value.into())
    }

    /// Look up a value in the bag.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.bag.get(key)
    }

    /// Read-only view of the bag.
    #[must_use]
    pub const fn bag(&self) -> &HashMap<String, serde_json::Value> {
        &self.bag
    }

    /// The span the dispatch runs in, if one was attached.
    #[must_use]
    pub const fn span(&self) -> Option<&tracing::Span> {
        self.span.as_ref()
    }

    /// Attach the span the dispatch runs in.
    pub fn set_span(&mut self, span: tracing::Span) {
        self.span = Some(span);
    }

    /// Partition key for outbound messages.
    #[must_use]
    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    /// Replace the partition key.
    pub fn set_partition_key(&mut self, key: Option<String>) {
        self.partition_key = key;
    }
}

/// Creates a [`RequestContext`] for each dispatch.
pub trait RequestContextFactory: Send + Sync {
    /// Build a new context.
    fn create(&self) -> RequestContext;
}

/// Factory producing empty contexts.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRequestContextFactory;

impl RequestContextFactory for DefaultRequestContextFactory {
    fn create(&self) -> RequestContext {
        RequestContext::new()
    }
}
