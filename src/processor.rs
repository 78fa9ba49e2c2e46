//! Message dispatch strategies.
//!
//! One poll cycle's decoded messages are handed to the host either one at
//! a time ([`MessageProcessor::Serial`]) or as a single ordered batch
//! ([`MessageProcessor::Batched`]). Handler errors are logged and never
//! interrupt dispatch of the remaining messages.

use std::sync::Arc;

use tracing::error;

use crate::message::{BatchHandler, Message, MessageHandler};

/// Dispatch strategy applied to a decoded message set.
#[derive(Clone)]
pub(crate) enum MessageProcessor {
    /// Invoke the handler once per message, in order.
    Serial(Arc<dyn MessageHandler>),
    /// Invoke the handler once with the full ordered batch, when non-empty.
    Batched(Arc<dyn BatchHandler>),
}

impl MessageProcessor {
    pub(crate) async fn process(&self, messages: Vec<Message>) {
        match self {
            Self::Serial(handler) => {
                for message in messages {
                    if let Err(e) = handler.handle(message).await {
                        error!(error = %e, "Message handler failed");
                    }
                }
            }
            Self::Batched(handler) => {
                if messages.is_empty() {
                    return;
                }
                if let Err(e) = handler.handle_batch(messages).await {
                    error!(error = %e, "Batch handler failed");
                }
            }
        }
    }
}
