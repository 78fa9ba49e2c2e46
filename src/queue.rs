//! Round-robin REST caller for the queue proxy protocol.
//!
//! [`RestQueueCaller`] implements the remote protocol operations (create,
//! subscribe, poll, commit, unsubscribe, destroy, connectivity probe)
//! against a pool of proxy addresses. The active address rotates in a
//! round-robin fashion before each new consumer instance creation, so
//! retries after a failed cycle land on the next proxy in the pool.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::config::{ConfigError, ConsumerConfig, Offset};
use crate::transport::{Transport, TransportError};

pub(crate) const MSG_CONTENT_TYPE: &str = "application/vnd.kafka.v2+json";

/// Errors from queue protocol operations.
#[derive(Error, Debug)]
pub(crate) enum QueueError {
    /// The address pool is empty.
    #[error("no queue proxy addresses configured")]
    NoAddresses,

    /// The remote consumer instance handle is absent or empty.
    #[error("consumer instance is not initialised")]
    InvalidInstance,

    /// The HTTP call failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The response payload could not be parsed.
    #[error("error parsing json response: {0}")]
    Response(#[from] serde_json::Error),

    /// The instance locator could not be parsed as a URI.
    #[error("error parsing base URI: {0}")]
    Locator(#[from] url::ParseError),

    /// Aggregated per-address connectivity failures.
    #[error("{0}")]
    Connectivity(String),
}

/// Server-issued locator identifying one remote consumer instance.
///
/// Owned by exactly one stream at a time; emptied on teardown so a fresh
/// instance is created on the next loop iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub(crate) struct InstanceUri {
    #[serde(default)]
    pub(crate) base_uri: String,
}

/// The remote protocol operations one stream needs.
#[async_trait::async_trait]
pub(crate) trait QueueCaller: Send + Sync {
    async fn create_instance(&self) -> Result<InstanceUri, QueueError>;
    async fn subscribe(&self, instance: &InstanceUri) -> Result<(), QueueError>;
    async fn unsubscribe(&self, instance: &InstanceUri) -> Result<(), QueueError>;
    async fn destroy(&self, instance: &InstanceUri) -> Result<(), QueueError>;
    async fn consume(&self, instance: &InstanceUri) -> Result<Bytes, QueueError>;
    async fn commit_offsets(&self, instance: &InstanceUri) -> Result<(), QueueError>;
    async fn check_connectivity(&self) -> Result<(), QueueError>;
}

#[derive(Serialize)]
struct CreateInstanceRequest<'a> {
    #[serde(rename = "auto.offset.reset")]
    auto_offset_reset: &'a str,
    // the proxy expects the flag as a string, not a JSON boolean
    #[serde(rename = "auto.commit.enable")]
    auto_commit_enable: &'a str,
}

#[derive(Serialize)]
struct SubscriptionRequest<'a> {
    topics: [&'a str; 1],
}

/// REST implementation of [`QueueCaller`] over a [`Transport`].
pub(crate) struct RestQueueCaller {
    addrs: Vec<Url>,
    // counts instance creations; the selected address is the count modulo
    // the pool size
    cursor: Arc<AtomicUsize>,
    group: String,
    topic: String,
    offset: Offset,
    auto_commit_enable: bool,
    transport: Arc<dyn Transport>,
}

impl RestQueueCaller {
    pub(crate) fn new(
        config: &ConsumerConfig,
        cursor: Arc<AtomicUsize>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ConfigError> {
        let addrs = config
            .addrs
            .iter()
            .map(|addr| Url::parse(addr))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            addrs,
            cursor,
            group: config.group.clone(),
            topic: config.topic.clone(),
            offset: config.offset,
            auto_commit_enable: config.auto_commit_enable,
            transport,
        })
    }

    fn advance_addr(&self) -> Result<&Url, QueueError> {
        if self.addrs.is_empty() {
            return Err(QueueError::NoAddresses);
        }
        let count = self.cursor.fetch_add(1, Ordering::SeqCst);
        Ok(&self.addrs[count.wrapping_add(1) % self.addrs.len()])
    }

    fn current_addr(&self) -> Result<&Url, QueueError> {
        if self.addrs.is_empty() {
            return Err(QueueError::NoAddresses);
        }
        Ok(&self.addrs[self.cursor.load(Ordering::SeqCst) % self.addrs.len()])
    }

    /// Resolves the instance locator against the currently selected pool
    /// address. Only the locator's path is used; any scheme or host the
    /// server embedded in it is ignored.
    fn build_instance_url(
        &self,
        instance: &InstanceUri,
        suffix: &str,
    ) -> Result<Url, QueueError> {
        if instance.base_uri.is_empty() {
            return Err(QueueError::InvalidInstance);
        }

        let instance_path = match Url::parse(&instance.base_uri) {
            Ok(parsed) => parsed.path().to_string(),
            Err(url::ParseError::RelativeUrlWithoutBase) => instance.base_uri.clone(),
            Err(e) => return Err(e.into()),
        };

        let addr = self.current_addr()?;
        let mut url = addr.clone();
        url.set_path(&format!(
            "{}{}{}",
            addr.path().trim_end_matches('/'),
            instance_path.trim_end_matches('/'),
            suffix
        ));
        Ok(url)
    }

    fn join_addr(addr: &Url, suffix: &str) -> Url {
        let mut url = addr.clone();
        url.set_path(&format!("{}{}", addr.path().trim_end_matches('/'), suffix));
        url
    }

    async fn probe(&self, addr: &Url) -> Result<(), TransportError> {
        self.transport
            .do_req(
                Method::GET,
                Self::join_addr(addr, "/topics"),
                None,
                &[("Accept", MSG_CONTENT_TYPE)],
                StatusCode::OK,
            )
            .await
            .map(|_| ())
    }
}

#[async_trait::async_trait]
impl QueueCaller for RestQueueCaller {
    async fn create_instance(&self) -> Result<InstanceUri, QueueError> {
        // rotate before issuing the call, so the selection advances even
        // when the previous cycle failed
        let addr = self.advance_addr()?;

        let body = serde_json::to_string(&CreateInstanceRequest {
            auto_offset_reset: self.offset.as_str(),
            auto_commit_enable: if self.auto_commit_enable { "true" } else { "false" },
        })?;

        let data = self
            .transport
            .do_req(
                Method::POST,
                Self::join_addr(addr, &format!("/consumers/{}", self.group)),
                Some(body),
                &[("Content-Type", MSG_CONTENT_TYPE)],
                StatusCode::OK,
            )
            .await?;

        Ok(serde_json::from_slice(&data)?)
    }

    async fn subscribe(&self, instance: &InstanceUri) -> Result<(), QueueError> {
        let url = self.build_instance_url(instance, "/subscription")?;
        let body = serde_json::to_string(&SubscriptionRequest {
            topics: [self.topic.as_str()],
        })?;

        self.transport
            .do_req(
                Method::POST,
                url,
                Some(body),
                &[("Content-Type", MSG_CONTENT_TYPE)],
                StatusCode::NO_CONTENT,
            )
            .await?;
        Ok(())
    }

    async fn unsubscribe(&self, instance: &InstanceUri) -> Result<(), QueueError> {
        let url = self.build_instance_url(instance, "/subscription")?;

        self.transport
            .do_req(
                Method::DELETE,
                url,
                None,
                &[("Accept", MSG_CONTENT_TYPE)],
                StatusCode::NO_CONTENT,
            )
            .await?;
        Ok(())
    }

    async fn destroy(&self, instance: &InstanceUri) -> Result<(), QueueError> {
        let url = self.build_instance_url(instance, "")?;

        self.transport
            .do_req(
                Method::DELETE,
                url,
                None,
                &[("Accept", MSG_CONTENT_TYPE)],
                StatusCode::NO_CONTENT,
            )
            .await?;
        Ok(())
    }

    async fn consume(&self, instance: &InstanceUri) -> Result<Bytes, QueueError> {
        let url = self.build_instance_url(instance, "/records")?;

        let data = self
            .transport
            .do_req(
                Method::GET,
                url,
                None,
                &[("Accept", MSG_CONTENT_TYPE)],
                StatusCode::OK,
            )
            .await?;
        Ok(data)
    }

    async fn commit_offsets(&self, instance: &InstanceUri) -> Result<(), QueueError> {
        let url = self.build_instance_url(instance, "/offsets")?;

        self.transport
            .do_req(
                Method::POST,
                url,
                None,
                &[("Content-Type", MSG_CONTENT_TYPE)],
                StatusCode::OK,
            )
            .await?;
        Ok(())
    }

    async fn check_connectivity(&self) -> Result<(), QueueError> {
        if self.addrs.is_empty() {
            return Err(QueueError::NoAddresses);
        }

        let mut details = String::new();
        for addr in &self.addrs {
            if let Err(e) = self.probe(addr).await {
                let _ = write!(details, "could not connect to proxy: {e}; ");
            }
        }

        if details.is_empty() {
            Ok(())
        } else {
            Err(QueueError::Connectivity(details))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingTransport {
        calls: Mutex<Vec<(Method, Url, Option<String>)>>,
        response: &'static str,
    }

    impl RecordingTransport {
        fn new(response: &'static str) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                response,
            })
        }

        fn calls(&self) -> Vec<(Method, Url, Option<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Transport for RecordingTransport {
        async fn do_req(
            &self,
            method: Method,
            url: Url,
            body: Option<String>,
            _headers: &[(&str, &str)],
            _expected: StatusCode,
        ) -> Result<Bytes, TransportError> {
            self.calls.lock().unwrap().push((method, url, body));
            Ok(Bytes::from_static(self.response.as_bytes()))
        }

        fn close_idle_connections(&self) {}
    }

    fn caller_with(addrs: Vec<String>, transport: Arc<dyn Transport>) -> RestQueueCaller {
        let config = ConsumerConfig::new(addrs, "group1", "topic1");
        RestQueueCaller::new(&config, Arc::new(AtomicUsize::new(0)), transport).unwrap()
    }

    fn instance(base_uri: &str) -> InstanceUri {
        InstanceUri {
            base_uri: base_uri.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_instance_rotates_addresses_round_robin() {
        let transport = RecordingTransport::new("{}");
        let caller = caller_with(
            vec![
                "http://queue-proxy-1".into(),
                "http://queue-proxy-2".into(),
                "http://queue-proxy-3".into(),
            ],
            transport.clone(),
        );

        for expected_host in [
            "queue-proxy-2",
            "queue-proxy-3",
            "queue-proxy-1",
            "queue-proxy-2",
        ] {
            caller.create_instance().await.unwrap();
            let calls = transport.calls();
            let (_, url, _) = calls.last().unwrap();
            assert_eq!(url.host_str(), Some(expected_host));
        }
    }

    #[tokio::test]
    async fn test_create_instance_sends_offset_and_commit_policy() {
        let transport = RecordingTransport::new(r#"{"base_uri":"/consumers/group1/instances/i1"}"#);
        let caller = caller_with(vec!["http://queue-proxy".into()], transport.clone());

        let created = caller.create_instance().await.unwrap();

        assert_eq!(created.base_uri, "/consumers/group1/instances/i1");
        let calls = transport.calls();
        let (method, url, body) = &calls[0];
        assert_eq!(*method, Method::POST);
        assert_eq!(url.path(), "/consumers/group1");
        let body = body.as_deref().unwrap();
        assert!(body.contains(r#""auto.offset.reset":"latest""#));
        assert!(body.contains(r#""auto.commit.enable":"false""#));
    }

    #[tokio::test]
    async fn test_instance_operations_resolve_against_current_address() {
        let transport = RecordingTransport::new("[]");
        let caller = caller_with(
            vec!["https://localhost:8080/__queue-proxy".into()],
            transport.clone(),
        );
        let inst = instance("http://remote-host:8082/consumers/group1/instances/rest-consumer-1-45864");

        caller.subscribe(&inst).await.unwrap();
        caller.consume(&inst).await.unwrap();
        caller.commit_offsets(&inst).await.unwrap();
        caller.unsubscribe(&inst).await.unwrap();
        caller.destroy(&inst).await.unwrap();

        let calls = transport.calls();
        let paths: Vec<&str> = calls.iter().map(|(_, url, _)| url.path()).collect();
        assert_eq!(
            paths,
            vec![
                "/__queue-proxy/consumers/group1/instances/rest-consumer-1-45864/subscription",
                "/__queue-proxy/consumers/group1/instances/rest-consumer-1-45864/records",
                "/__queue-proxy/consumers/group1/instances/rest-consumer-1-45864/offsets",
                "/__queue-proxy/consumers/group1/instances/rest-consumer-1-45864/subscription",
                "/__queue-proxy/consumers/group1/instances/rest-consumer-1-45864",
            ]
        );
        // the locator's own host is ignored in favour of the pool address
        for (_, url, _) in &calls {
            assert_eq!(url.host_str(), Some("localhost"));
            assert_eq!(url.scheme(), "https");
        }
    }

    #[tokio::test]
    async fn test_subscribe_sends_topic_list() {
        let transport = RecordingTransport::new("");
        let caller = caller_with(vec!["http://queue-proxy".into()], transport.clone());

        caller
            .subscribe(&instance("/consumers/group1/instances/i1"))
            .await
            .unwrap();

        let calls = transport.calls();
        let (_, _, body) = &calls[0];
        assert_eq!(body.as_deref(), Some(r#"{"topics":["topic1"]}"#));
    }

    #[tokio::test]
    async fn test_empty_instance_locator_never_issues_a_call() {
        let transport = RecordingTransport::new("");
        let caller = caller_with(vec!["http://queue-proxy".into()], transport.clone());
        let empty = InstanceUri::default();

        assert!(matches!(
            caller.subscribe(&empty).await,
            Err(QueueError::InvalidInstance)
        ));
        assert!(matches!(
            caller.unsubscribe(&empty).await,
            Err(QueueError::InvalidInstance)
        ));
        assert!(matches!(
            caller.destroy(&empty).await,
            Err(QueueError::InvalidInstance)
        ));
        assert!(matches!(
            caller.consume(&empty).await,
            Err(QueueError::InvalidInstance)
        ));
        assert!(matches!(
            caller.commit_offsets(&empty).await,
            Err(QueueError::InvalidInstance)
        ));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_check_connectivity_probes_every_address() {
        let transport = RecordingTransport::new(r#"["topic1"]"#);
        let caller = caller_with(
            vec!["http://queue-proxy-1".into(), "http://queue-proxy-2".into()],
            transport.clone(),
        );

        caller.check_connectivity().await.unwrap();

        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls
            .iter()
            .all(|(method, url, _)| *method == Method::GET && url.path() == "/topics"));
        assert_eq!(calls[0].1.host_str(), Some("queue-proxy-1"));
        assert_eq!(calls[1].1.host_str(), Some("queue-proxy-2"));
    }

    #[tokio::test]
    async fn test_check_connectivity_empty_pool_fails() {
        let transport = RecordingTransport::new("");
        let caller = caller_with(vec![], transport);

        assert!(matches!(
            caller.check_connectivity().await,
            Err(QueueError::NoAddresses)
        ));
    }

    #[test]
    fn test_invalid_address_is_rejected_at_construction() {
        let transport = RecordingTransport::new("");
        let config = ConsumerConfig::new(vec!["not a url".into()], "group1", "topic1");

        let result = RestQueueCaller::new(&config, Arc::new(AtomicUsize::new(0)), transport);

        assert!(matches!(result, Err(ConfigError::InvalidAddress(_))));
    }
}
