//! Restqueue - resilient consumer client for REST-proxied message queues
//!
//! This library turns the stateless HTTP polling protocol of a
//! Kafka-REST-proxy-style queue into a continuously running,
//! fault-tolerant subscription. The host supplies a handler and receives
//! decoded messages; it never touches the remote protocol directly.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `consumer`: multi-stream orchestrator (`start`, `stop`, connectivity check)
//! - `config`: consumer configuration and builder
//! - `message`: the decoded `Message` type and the host handler traits
//! - `transport`: HTTP execution with status validation and idle-pool remediation
//! - `ageing`: periodic idle-connection closer for long-lived pools
//!
//! Each configured stream independently drives a
//! create → subscribe → poll → dispatch → commit loop against the proxy
//! pool, rotating across addresses in a round-robin fashion when new
//! remote instances are created. Protocol failures tear the remote
//! instance down, back off, and retry with a fresh one; the only errors
//! surfaced synchronously to the host come from the connectivity check.
//!
//! # Example
//!
//! ```rust,no_run
//! use restqueue::{Consumer, ConsumerConfig, Message, MessageHandler};
//! use std::sync::Arc;
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
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConsumerConfig::new(
//!         vec!["http://queue-proxy:8080".into()],
//!         "my-group",
//!         "my-topic",
//!     );
//!     let consumer = Arc::new(Consumer::new(config, Arc::new(PrintHandler), reqwest::Client::new)?);
//!
//!     let runner = Arc::clone(&consumer);
//!     tokio::spawn(async move { runner.start().await });
//!
//!     // ... on shutdown
//!     consumer.stop();
//!     Ok(())
//! }
//! ```

pub mod ageing;
pub mod config;
pub mod consumer;
pub mod message;
pub mod transport;

mod instance;
mod parser;
mod processor;
mod queue;

// Re-export commonly used types
pub use ageing::AgeingClient;
pub use config::{ConfigError, ConsumerConfig, Offset};
pub use consumer::{ConnectivityError, Consumer};
pub use message::{BatchHandler, Message, MessageHandler};
pub use transport::{HttpTransport, Transport, TransportError};
