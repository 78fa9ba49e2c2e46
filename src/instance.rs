//! Per-stream consumer lifecycle.
//!
//! A [`ConsumerInstance`] owns one remote consumer handle and drives the
//! create → subscribe → {poll → decode → dispatch → commit} loop until its
//! shutdown signal fires. Protocol failures never propagate to the host:
//! they are logged, the remote instance is torn down, and the loop backs
//! off before establishing a fresh one.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use thiserror::Error;
use tokio::sync::watch;
use tracing::error;

use crate::config::ConsumerConfig;
use crate::message::Message;
use crate::parser::{MessageParser, ParseError};
use crate::processor::MessageProcessor;
use crate::queue::{InstanceUri, QueueCaller, QueueError};

#[derive(Error, Debug)]
pub(crate) enum InstanceError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// One stream's consumer state machine.
///
/// Not safe to drive from more than one task; each stream owns its
/// instance exclusively.
pub(crate) struct ConsumerInstance {
    config: ConsumerConfig,
    queue: Arc<dyn QueueCaller>,
    remote: Option<InstanceUri>,
    processor: MessageProcessor,
    parser: MessageParser,
    shutdown: watch::Receiver<bool>,
}

impl ConsumerInstance {
    pub(crate) fn new(
        config: ConsumerConfig,
        queue: Arc<dyn QueueCaller>,
        processor: MessageProcessor,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            queue,
            remote: None,
            processor,
            parser: MessageParser::new(),
            shutdown,
        }
    }

    /// Drives the consuming loop until shutdown is requested. The shutdown
    /// signal is checked once per iteration, before any remote call.
    pub(crate) async fn consume_while_active(mut self) {
        loop {
            if *self.shutdown.borrow() {
                self.teardown().await;
                return;
            }
            self.consume_and_handle_messages().await;
        }
    }

    /// Runs one guarded loop iteration. A panic raised anywhere in the
    /// iteration is logged and treated like an ordinary failed cycle, so a
    /// misbehaving handler can never kill the stream.
    async fn consume_and_handle_messages(&mut self) {
        let idle = match AssertUnwindSafe(self.consume()).catch_unwind().await {
            Ok(Ok(count)) => count == 0,
            // already logged at the point of failure
            Ok(Err(_)) => true,
            Err(panic) => {
                error!(reason = %panic_reason(&panic), "Recovered from panic while consuming");
                true
            }
        };

        if idle {
            // the backoff sleep races the shutdown signal, so stopping is
            // not delayed by a full backoff period
            tokio::select! {
                _ = tokio::time::sleep(self.config.backoff()) => {}
                _ = self.shutdown.changed() => {}
            }
        }
    }

    /// One poll cycle: ensure a remote instance exists, poll it, decode,
    /// dispatch, commit. Returns the number of dispatched messages.
    async fn consume(&mut self) -> Result<usize, InstanceError> {
        let remote = match self.remote.clone() {
            Some(remote) => remote,
            None => {
                let created = match self.queue.create_instance().await {
                    Ok(created) => created,
                    Err(e) => {
                        error!(error = %e, "Error creating consumer instance");
                        return Err(e.into());
                    }
                };
                self.remote = Some(created.clone());

                if let Err(e) = self.queue.subscribe(&created).await {
                    error!(error = %e, "Error subscribing consumer instance to topic");
                    self.teardown().await;
                    return Err(e.into());
                }
                created
            }
        };

        let raw = match self.queue.consume(&remote).await {
            Ok(raw) => raw,
            Err(e) => {
                error!(error = %e, "Error consuming messages");
                self.teardown().await;
                return Err(e.into());
            }
        };

        let messages = match self.parser.parse_response(&raw) {
            Ok(messages) => messages,
            Err(e) => {
                error!(error = %e, "Error parsing messages");
                self.teardown().await;
                return Err(e.into());
            }
        };

        let count = messages.len();
        self.dispatch(messages).await;

        if !self.config.auto_commit_enable {
            if let Err(e) = self.queue.commit_offsets(&remote).await {
                error!(error = %e, "Error committing offsets");
                self.teardown().await;
                return Err(e.into());
            }
        }

        Ok(count)
    }

    /// Dispatches one cycle's messages, waiting for every handler call to
    /// finish before returning so that nothing is committed unprocessed.
    async fn dispatch(&self, messages: Vec<Message>) {
        match (&self.processor, self.config.concurrent_processing) {
            (MessageProcessor::Serial(handler), true) => {
                futures::stream::iter(messages)
                    .for_each_concurrent(self.config.workers(), |message| {
                        let handler = Arc::clone(handler);
                        async move {
                            if let Err(e) = handler.handle(message).await {
                                error!(error = %e, "Message handler failed");
                            }
                        }
                    })
                    .await;
            }
            _ => self.processor.process(messages).await,
        }
    }

    /// Removes the subscription and destroys the remote instance,
    /// best-effort. Sub-errors are logged, never propagated.
    async fn teardown(&mut self) {
        if let Some(remote) = self.remote.take() {
            if let Err(e) = self.queue.unsubscribe(&remote).await {
                error!(error = %e, "Error deleting consumer instance subscription");
            }
            if let Err(e) = self.queue.destroy(&remote).await {
                error!(error = %e, "Error deleting consumer instance");
            }
        }
    }
}

fn panic_reason(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
