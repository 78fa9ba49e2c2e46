//! Message type and host-facing handler traits.
//!
//! A [`Message`] is the decoded form of one wire envelope record: a set of
//! header key/value pairs and a body string. Hosts receive messages through
//! either a per-message [`MessageHandler`] or a per-poll-cycle
//! [`BatchHandler`].
//!
//! # Example
//!
//! ```rust
//! use restqueue::{Message, MessageHandler};
//!
//! struct PrintHandler;
//!
//! #[async_trait::async_trait]
//! impl MessageHandler for PrintHandler {
//!     async fn handle(
//!         &self,
//!         message: Message,
//!     ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!         println!("{}", message.body);
//!         Ok(())
//!     }
//! }
//! ```

use std::collections::HashMap;

/// A decoded queue message.
///
/// Immutable once constructed. `headers` is empty when the wire envelope
/// carried no parseable header block; this never aborts processing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Header key/value pairs from the envelope's header block.
    pub headers: HashMap<String, String>,
    /// Message body, trimmed of surrounding whitespace.
    pub body: String,
}

/// Handler trait for processing messages one at a time.
///
/// The handler is called once per decoded message, in the order messages
/// were received from the queue. Return `Err` if processing failed; the
/// error is logged and the consumer continues with the remaining messages.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a single message.
    async fn handle(
        &self,
        message: Message,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Handler trait for processing one poll cycle's messages as a batch.
///
/// Called exactly once per poll cycle with the full ordered batch, and only
/// when the batch is non-empty.
#[async_trait::async_trait]
pub trait BatchHandler: Send + Sync {
    /// Process the full batch of messages from one poll cycle.
    async fn handle_batch(
        &self,
        messages: Vec<Message>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}
