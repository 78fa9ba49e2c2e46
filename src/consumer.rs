//! Multi-stream consumer orchestrator.
//!
//! [`Consumer`] fans out a configured number of independent consuming
//! streams, forwards stop signals to them and aggregates their
//! connectivity probes into a single health-check result.
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
//!     let running = tokio::spawn(async move { runner.start().await });
//!
//!     // ... later
//!     consumer.stop();
//!     running.await?;
//!     Ok(())
//! }
//! ```

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::ageing::AgeingClient;
use crate::config::{ConfigError, ConsumerConfig};
use crate::instance::ConsumerInstance;
use crate::message::{BatchHandler, MessageHandler};
use crate::processor::MessageProcessor;
use crate::queue::{QueueCaller, RestQueueCaller};
use crate::transport::{HttpTransport, Transport};

const CONNECTIVITY_OK: &str = "Connectivity to queue proxies is OK.";

/// Aggregated connectivity failure across the consumer's streams.
#[derive(Error, Debug)]
#[error("Error connecting to queue proxies: {details}")]
pub struct ConnectivityError {
    /// Concatenated per-stream failure descriptions.
    pub details: String,
}

struct Stream {
    instance: Mutex<Option<ConsumerInstance>>,
    shutdown: watch::Sender<bool>,
    queue: Arc<dyn QueueCaller>,
}

/// The multi-stream queue consumer.
///
/// Constructed once from a [`ConsumerConfig`], a handler and an injected
/// HTTP client factory; the factory is used to (re)build the connection
/// pool shared by all streams.
pub struct Consumer {
    streams: Vec<Stream>,
    ageing: Option<JoinHandle<()>>,
}

impl Consumer {
    /// Creates a consumer that dispatches messages one at a time (or
    /// through a bounded worker pool when concurrent processing is
    /// configured).
    pub fn new<F>(
        config: ConsumerConfig,
        handler: Arc<dyn MessageHandler>,
        make_client: F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn() -> reqwest::Client + Send + Sync + 'static,
    {
        let transport = Self::make_transport(&config, make_client);
        Self::build(config, transport, MessageProcessor::Serial(handler), None)
    }

    /// Creates a consumer that dispatches each poll cycle's messages as a
    /// single batch.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnsupportedCombination`] when the
    /// configuration also requests concurrent processing.
    pub fn new_batched<F>(
        config: ConsumerConfig,
        handler: Arc<dyn BatchHandler>,
        make_client: F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn() -> reqwest::Client + Send + Sync + 'static,
    {
        if config.concurrent_processing {
            return Err(ConfigError::UnsupportedCombination);
        }
        let transport = Self::make_transport(&config, make_client);
        Self::build(config, transport, MessageProcessor::Batched(handler), None)
    }

    /// Creates a serial consumer whose transport additionally drops idle
    /// connections every `max_age`, guarding against stale sockets to
    /// proxies that were removed from a load-balancer pool.
    pub fn with_ageing<F>(
        config: ConsumerConfig,
        handler: Arc<dyn MessageHandler>,
        make_client: F,
        max_age: Duration,
    ) -> Result<Self, ConfigError>
    where
        F: Fn() -> reqwest::Client + Send + Sync + 'static,
    {
        let transport = Self::make_transport(&config, make_client);
        let ageing = AgeingClient::new(Arc::clone(&transport) as Arc<dyn Transport>, max_age)?;
        let handle = ageing.start();
        Self::build(
            config,
            transport,
            MessageProcessor::Serial(handler),
            Some(handle),
        )
    }

    fn make_transport<F>(config: &ConsumerConfig, make_client: F) -> Arc<HttpTransport>
    where
        F: Fn() -> reqwest::Client + Send + Sync + 'static,
    {
        let mut transport = HttpTransport::new(make_client);
        if let Some(queue) = &config.queue {
            transport = transport.with_host_header(queue);
        }
        if let Some(key) = &config.authorization_key {
            transport = transport.with_authorization_key(key);
        }
        Arc::new(transport)
    }

    fn build(
        config: ConsumerConfig,
        transport: Arc<HttpTransport>,
        processor: MessageProcessor,
        ageing: Option<JoinHandle<()>>,
    ) -> Result<Self, ConfigError> {
        let shared_cursor = Arc::new(AtomicUsize::new(0));
        let mut streams = Vec::with_capacity(config.streams());

        for _ in 0..config.streams() {
            let cursor = if config.shared_address_cursor {
                Arc::clone(&shared_cursor)
            } else {
                Arc::new(AtomicUsize::new(0))
            };
            let queue: Arc<dyn QueueCaller> = Arc::new(RestQueueCaller::new(
                &config,
                cursor,
                Arc::clone(&transport) as Arc<dyn Transport>,
            )?);

            let (shutdown, signal) = watch::channel(false);
            let instance = ConsumerInstance::new(
                config.clone(),
                Arc::clone(&queue),
                processor.clone(),
                signal,
            );
            streams.push(Stream {
                instance: Mutex::new(Some(instance)),
                shutdown,
                queue,
            });
        }

        Ok(Self { streams, ageing })
    }

    /// Launches every stream's consuming loop and blocks until all of them
    /// have terminated, which only happens after [`stop`](Self::stop) has
    /// been called. Spawn this on a dedicated task if the caller must not
    /// block.
    pub async fn start(&self) {
        let mut tasks = Vec::with_capacity(self.streams.len());
        for stream in &self.streams {
            if let Some(instance) = stream.instance.lock().await.take() {
                tasks.push(tokio::spawn(instance.consume_while_active()));
            }
        }
        info!(streams = tasks.len(), "Started consumer streams");

        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!(error = %e, "Consumer stream task failed");
            }
        }
    }

    /// Signals every stream to begin shutdown. Does not wait for the
    /// streams to finish; await [`start`](Self::start)'s return for that.
    pub fn stop(&self) {
        info!("Stopping consumer streams");
        for stream in &self.streams {
            let _ = stream.shutdown.send(true);
        }
        if let Some(ageing) = &self.ageing {
            ageing.abort();
        }
    }

    /// Probes every stream's queue caller and aggregates the outcome.
    ///
    /// Returns a fixed success message when every configured proxy address
    /// is reachable from every stream; otherwise the error carries the
    /// concatenated per-stream failure descriptions.
    pub async fn connectivity_check(&self) -> Result<String, ConnectivityError> {
        let mut details = String::new();
        for stream in &self.streams {
            if let Err(e) = stream.queue.check_connectivity().await {
                details.push_str(&e.to_string());
            }
        }

        if details.is_empty() {
            Ok(CONNECTIVITY_OK.to_string())
        } else {
            Err(ConnectivityError { details })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    use crate::message::Message;
    use crate::queue::{InstanceUri, QueueError};

    struct IdleQueue {
        connectivity_error: Option<&'static str>,
    }

    #[async_trait::async_trait]
    impl QueueCaller for IdleQueue {
        async fn create_instance(&self) -> Result<InstanceUri, QueueError> {
            Ok(InstanceUri {
                base_uri: "/consumers/group/instances/i1".to_string(),
            })
        }
        async fn subscribe(&self, _: &InstanceUri) -> Result<(), QueueError> {
            Ok(())
        }
        async fn unsubscribe(&self, _: &InstanceUri) -> Result<(), QueueError> {
            Ok(())
        }
        async fn destroy(&self, _: &InstanceUri) -> Result<(), QueueError> {
            Ok(())
        }
        async fn consume(&self, _: &InstanceUri) -> Result<Bytes, QueueError> {
            Ok(Bytes::from_static(b"[]"))
        }
        async fn commit_offsets(&self, _: &InstanceUri) -> Result<(), QueueError> {
            Ok(())
        }
        async fn check_connectivity(&self) -> Result<(), QueueError> {
            match self.connectivity_error {
                Some(details) => Err(QueueError::Connectivity(details.to_string())),
                None => Ok(()),
            }
        }
    }

    struct NoopHandler;

    #[async_trait::async_trait]
    impl MessageHandler for NoopHandler {
        async fn handle(
            &self,
            _message: Message,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
    }

    fn consumer_over(queues: Vec<Arc<dyn QueueCaller>>) -> Consumer {
        let config = ConsumerConfig::new(vec!["http://queue-proxy".into()], "group", "topic")
            .with_backoff_period(Duration::from_secs(1));
        let streams = queues
            .into_iter()
            .map(|queue| {
                let (shutdown, signal) = watch::channel(false);
                let instance = ConsumerInstance::new(
                    config.clone(),
                    Arc::clone(&queue),
                    MessageProcessor::Serial(Arc::new(NoopHandler)),
                    signal,
                );
                Stream {
                    instance: Mutex::new(Some(instance)),
                    shutdown,
                    queue,
                }
            })
            .collect();
        Consumer {
            streams,
            ageing: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_blocks_until_stop() {
        let consumer = Arc::new(consumer_over(vec![
            Arc::new(IdleQueue {
                connectivity_error: None,
            }),
            Arc::new(IdleQueue {
                connectivity_error: None,
            }),
        ]));

        let runner = Arc::clone(&consumer);
        let running = tokio::spawn(async move { runner.start().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!running.is_finished());

        consumer.stop();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("streams did not terminate")
            .unwrap();
    }

    #[tokio::test]
    async fn test_connectivity_check_all_healthy() {
        let consumer = consumer_over(vec![
            Arc::new(IdleQueue {
                connectivity_error: None,
            }),
            Arc::new(IdleQueue {
                connectivity_error: None,
            }),
        ]);

        let status = consumer.connectivity_check().await.unwrap();

        assert_eq!(status, "Connectivity to queue proxies is OK.");
    }

    #[tokio::test]
    async fn test_connectivity_check_aggregates_failures() {
        let consumer = consumer_over(vec![
            Arc::new(IdleQueue {
                connectivity_error: None,
            }),
            Arc::new(IdleQueue {
                connectivity_error: Some("could not connect to proxy: connection refused; "),
            }),
        ]);

        let err = consumer.connectivity_check().await.unwrap_err();

        assert!(err.details.contains("connection refused"));
        assert!(err
            .to_string()
            .starts_with("Error connecting to queue proxies:"));
    }

    #[tokio::test]
    async fn test_batched_with_concurrent_processing_is_rejected() {
        struct NoopBatch;

        #[async_trait::async_trait]
        impl BatchHandler for NoopBatch {
            async fn handle_batch(
                &self,
                _messages: Vec<Message>,
            ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
                Ok(())
            }
        }

        let config = ConsumerConfig::new(vec!["http://queue-proxy".into()], "group", "topic")
            .with_concurrent_processing(8);

        let result = Consumer::new_batched(config, Arc::new(NoopBatch), reqwest::Client::new);

        assert!(matches!(
            result,
            Err(ConfigError::UnsupportedCombination)
        ));
    }

    #[tokio::test]
    async fn test_builds_configured_stream_count() {
        let config = ConsumerConfig::new(
            vec!["http://queue-proxy-1".into(), "http://queue-proxy-2".into()],
            "group",
            "topic",
        )
        .with_stream_count(3);

        let consumer = Consumer::new(config, Arc::new(NoopHandler), reqwest::Client::new).unwrap();

        assert_eq!(consumer.streams.len(), 3);
    }
}
