//! Transport envelopes exchanged with brokers.

use crate::request::Id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Kind of payload a message carries.
///
/// `Quit` is a control sentinel injected locally to stop a pump. `None` marks
/// an empty read, `Unacceptable` a message the transport could not decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MessageType {
    /// No message (empty read).
    #[default]
    None,
    /// A command, handled by exactly one handler.
    Command,
    /// An event, published to every handler.
    Event,
    /// A document, handled like a command.
    Document,
    /// Stop the pump reading this channel.
    Quit,
    /// The transport could not decode the message.
    Unacceptable,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Command => "command",
            Self::Event => "event",
            Self::Document => "document",
            Self::Quit => "quit",
            Self::Unacceptable => "unacceptable",
        };
        f.write_str(name)
    }
}

/// Topic a message is published to or consumed from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingKey(String);

impl RoutingKey {
    /// Create a routing key.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoutingKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RoutingKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Message metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Unique message id. Outbox keys and request ids share this value.
    pub message_id: Id,
    /// Topic the message is routed by.
    pub topic: RoutingKey,
    /// Payload kind.
    pub message_type: MessageType,
    /// Correlation id for request-reply.
    pub correlation_id: Option<Id>,
    /// Topic a reply should be sent to.
    pub reply_to: Option<RoutingKey>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// MIME type of the body.
    pub content_type: String,
    /// How many times a consumer has handed this message back for retry.
    pub handled_count: u32,
    /// Delivery delay requested by the sender.
    pub delayed: Duration,
    /// Broker partition key.
    pub partition_key: Option<String>,
    /// Free-form transport attributes.
    pub bag: HashMap<String, serde_json::Value>,
}

impl MessageHeader {
    /// Create a header stamped with the current time.
    #[must_use]
    pub fn new(message_id: Id, topic: RoutingKey, message_type: MessageType) -> Self {
        Self {
            message_id,
            topic,
            message_type,
            correlation_id: None,
            reply_to: None,
            timestamp: Utc::now(),
            content_type: "application/json".to_string(),
            handled_count: 0,
            delayed: Duration::ZERO,
            partition_key: None,
            bag: HashMap::new(),
        }
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: Id) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Set the reply topic.
    #[must_use]
    pub fn with_reply_to(mut self, topic: RoutingKey) -> Self {
        self.reply_to = Some(topic);
        self
    }

    /// Set the body content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Request delayed delivery.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delayed = delay;
        self
    }

    /// Set the partition key.
    #[must_use]
    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }
}

/// Opaque message payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageBody {
    bytes: Vec<u8>,
}

impl MessageBody {
    /// Wrap raw bytes.
    #[must_use]
    pub const fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Body as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid UTF-8.
    pub fn as_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.bytes)
    }

    /// Consume the body, returning its bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Whether the body is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<String> for MessageBody {
    fn from(value: String) -> Self {
        Self::new(value.into_bytes())
    }
}

impl From<&str> for MessageBody {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for MessageBody {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

/// A transport message: header plus body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Metadata.
    pub header: MessageHeader,
    /// Payload.
    pub body: MessageBody,
}

impl Message {
    /// Create a message.
    #[must_use]
    pub const fn new(header: MessageHeader, body: MessageBody) -> Self {
        Self { header, body }
    }

    /// The quit sentinel for the given channel topic.
    #[must_use]
    pub fn quit(topic: RoutingKey) -> Self {
        Self::new(
            MessageHeader::new(Id::random(), topic, MessageType::Quit),
            MessageBody::default(),
        )
    }

    /// Message id.
    #[must_use]
    pub const fn id(&self) -> &Id {
        &self.header.message_id
    }

    /// Topic.
    #[must_use]
    pub const fn topic(&self) -> &RoutingKey {
        &self.header.topic
    }

    /// Payload kind.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    /// Whether this is the quit sentinel.
    #[must_use]
    pub fn is_quit(&self) -> bool {
        self.header.message_type == MessageType::Quit
    }
}
