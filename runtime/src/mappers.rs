//! Message mappers and publications per request type.

use crate::error::ConfigurationError;
use herald_core::mapper::{JsonMessageMapper, MappingError, MessageMapper, Publication};
use herald_core::message::Message;
use herald_core::request::{Request, RequestContext};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// A mapper and where its messages go.
pub struct MappedRequest<R> {
    /// Mapper for `R`.
    pub mapper: Arc<dyn MessageMapper<R>>,
    /// Outbound publication.
    pub publication: Publication,
}

impl<R: Request> MappedRequest<R> {
    /// Map `request` to its outbound message, carrying the context's partition key.
    ///
    /// # Errors
    ///
    /// Returns the mapper's [`MappingError`].
    pub fn to_message(&self, request: &R, context: &RequestContext) -> Result<Message, MappingError> {
        let mut message = self.mapper.map_to_message(request, &self.publication)?;
        if message.header.partition_key.is_none() {
            message.header.partition_key = context.partition_key().map(str::to_string);
        }
        Ok(message)
    }
}

/// Mappers keyed by request type.
#[derive(Default)]
pub struct MapperRegistry {
    mappers: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl MapperRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mapper for `R`.
    #[must_use]
    pub fn with<R: Request>(
        mut self,
        publication: Publication,
        mapper: impl MessageMapper<R> + 'static,
    ) -> Self {
        self.register(publication, mapper);
        self
    }

    /// Register the JSON mapper for `R`.
    #[must_use]
    pub fn with_json<R>(self, publication: Publication) -> Self
    where
        R: Request + Serialize + DeserializeOwned,
    {
        self.with(publication, JsonMessageMapper::<R>::new())
    }

    /// Register a mapper for `R`, replacing any previous one.
    pub fn register<R: Request>(
        &mut self,
        publication: Publication,
        mapper: impl MessageMapper<R> + 'static,
    ) -> &mut Self {
        let mapped = MappedRequest::<R> {
            mapper: Arc::new(mapper),
            publication,
        };
        self.mappers.insert(TypeId::of::<R>(), Arc::new(mapped));
        self
    }

    /// Mapper for `R`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::MissingMapper`] if none is registered.
    pub fn get<R: Request>(&self) -> Result<Arc<MappedRequest<R>>, ConfigurationError> {
        self.mappers
            .get(&TypeId::of::<R>())
            .and_then(|entry| Arc::clone(entry).downcast::<MappedRequest<R>>().ok())
            .ok_or(ConfigurationError::MissingMapper(std::any::type_name::<R>()))
    }
}

impl std::fmt::Debug for MapperRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapperRegistry")
            .field("request_types", &self.mappers.len())
            .finish()
    }
}
