//! Translation between requests and transport messages.

use crate::message::{Message, MessageBody, MessageHeader, MessageType, RoutingKey};
use crate::request::{Id, Request};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use thiserror::Error;

/// Errors raised while mapping between requests and messages.
#[derive(Error, Debug, Clone)]
pub enum MappingError {
    /// The request could not be serialized.
    #[error("failed to serialize {request_type}: {reason}")]
    Serialization {
        /// Rust type name of the request.
        request_type: &'static str,
        /// Underlying error.
        reason: String,
    },

    /// The message body could not be turned back into a request.
    #[error("failed to deserialize message {message_id}: {reason}")]
    Deserialization {
        /// Id of the offending message.
        message_id: Id,
        /// Underlying error.
        reason: String,
    },
}

/// Where and how a request type is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    /// Destination topic.
    pub topic: RoutingKey,
    /// Message type stamped on outbound messages.
    pub message_type: MessageType,
    /// Body content type.
    pub content_type: String,
}

impl Publication {
    /// Publication of commands to `topic`.
    #[must_use]
    pub fn command(topic: impl Into<RoutingKey>) -> Self {
        Self {
            topic: topic.into(),
            message_type: MessageType::Command,
            content_type: "application/json".to_string(),
        }
    }

    /// Publication of events to `topic`.
    #[must_use]
    pub fn event(topic: impl Into<RoutingKey>) -> Self {
        Self {
            message_type: MessageType::Event,
            ..Self::command(topic)
        }
    }

    /// Override the content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }
}

/// Maps a request type to and from a [`Message`].
pub trait MessageMapper<R>: Send + Sync {
    /// Build the outbound message for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::Serialization`] if the request cannot be encoded.
    fn map_to_message(&self, request: &R, publication: &Publication)
    -> Result<Message, MappingError>;

    /// Rebuild a request from an inbound message.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::Deserialization`] if the body cannot be decoded.
    fn map_to_request(&self, message: &Message) -> Result<R, MappingError>;
}

/// JSON mapper for any serde request.
///
/// The message id is the request id, so outbox entries and inbox records
/// line up with the request that produced them.
pub struct JsonMessageMapper<R> {
    _marker: PhantomData<fn() -> R>,
}

impl<R> JsonMessageMapper<R> {
    /// Create a mapper.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<R> Default for JsonMessageMapper<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> std::fmt::Debug for JsonMessageMapper<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonMessageMapper")
            .field("request_type", &std::any::type_name::<R>())
            .finish()
    }
}

impl<R> MessageMapper<R> for JsonMessageMapper<R>
where
    R: Request + Serialize + DeserializeOwned,
{
    fn map_to_message(
        &self,
        request: &R,
        publication: &Publication,
    ) -> Result<Message, MappingError> {
        let body = serde_json::to_vec(request).map_err(|e| MappingError::Serialization {
            request_type: std::any::type_name::<R>(),
            reason: e.to_string(),
        })?;
        let header = MessageHeader::new(
            request.id().clone(),
            publication.topic.clone(),
            publication.message_type,
        )
        .with_content_type(publication.content_type.clone());
        Ok(Message::new(header, MessageBody::new(body)))
    }

    fn map_to_request(&self, message: &Message) -> Result<R, MappingError> {
        serde_json::from_slice(message.body.as_bytes()).map_err(|e| {
            MappingError::Deserialization {
                message_id: message.id().clone(),
                reason: e.to_string(),
            }
        })
    }
}
