//! # Herald Core
//!
//! Core types and collaborator contracts for the Herald command dispatcher.
//!
//! This crate holds everything the runtime and its adapters agree on:
//!
//! - **Requests**: commands and events with a stable [`request::Id`]
//! - **Messages**: transport envelopes ([`message::Message`]) with a header and body
//! - **Handlers**: the blocking and suspending handler contracts
//! - **Collaborators**: producers, consumers, outbox/inbox stores, transactions
//! - **Environment**: injected clock for deterministic tests
//!
//! Every collaborator comes in a blocking flavour and a suspending flavour.
//! Implementations choose which one they offer; the runtime picks the one
//! matching the caller's execution mode.
//!
//! ## Example
//!
//! ```ignore
//! use herald_core::prelude::*;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct GreetingMade {
//!     id: Id,
//!     greeting: String,
//! }
//!
//! impl Request for GreetingMade {
//!     fn id(&self) -> &Id {
//!         &self.id
//!     }
//! }
//!
//! struct GreetingHandler;
//!
//! impl RequestHandler<GreetingMade> for GreetingHandler {
//!     fn handle(&self, request: &mut GreetingMade, _: &mut RequestContext) -> Result<(), HandlerError> {
//!         tracing::info!(greeting = %request.greeting, "hello");
//!         Ok(())
//!     }
//! }
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod channel;
pub mod handler;
pub mod inbox;
pub mod mapper;
pub mod message;
pub mod outbox;
pub mod producer;
pub mod request;
pub mod subscription;
pub mod transaction;

/// Environment traits injected into the runtime.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// The outbox stamps creation and dispatch times through this trait, so
    /// archive thresholds can be tested without sleeping.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

/// Commonly used items, for glob import.
pub mod prelude {
    pub use crate::channel::{
        AsyncChannel, AsyncMessageConsumer, Channel, ChannelError, ChannelFactory,
        MessageConsumer,
    };
    pub use crate::environment::{Clock, SystemClock};
    pub use crate::handler::{AsyncRequestHandler, BoxFuture, HandlerError, RequestHandler};
    pub use crate::inbox::{AsyncInboxStore, InboxEntry, InboxError, InboxStore};
    pub use crate::mapper::{JsonMessageMapper, MappingError, MessageMapper, Publication};
    pub use crate::message::{Message, MessageBody, MessageHeader, MessageType, RoutingKey};
    pub use crate::outbox::{
        ArchiveProvider, AsyncArchiveProvider, AsyncOutboxStore, OutboxEntry, OutboxStore,
        OutboxStoreError,
    };
    pub use crate::producer::{AsyncMessageProducer, MessageProducer, ProducerError};
    pub use crate::request::{
        DefaultRequestContextFactory, Id, Request, RequestContext, RequestContextFactory,
    };
    pub use crate::subscription::{MessagePumpType, OnMissingChannel, Subscription};
    pub use crate::transaction::{Transaction, TransactionError, TransactionProvider};
    pub use chrono::{DateTime, Utc};
    pub use serde::{Deserialize, Serialize};
}

#[cfg(test)]
mod tests {
    use super::environment::{Clock, SystemClock};

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
