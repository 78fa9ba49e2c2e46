//! HTTP request execution.
//!
//! [`HttpTransport`] wraps an injected `reqwest` client with header
//! injection, single-expected-status validation and idle-connection
//! remediation. The [`Transport`] trait is the seam the queue caller and
//! the ageing helper depend on, so tests can substitute recording fakes.

use std::sync::RwLock;

use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, HOST};
use reqwest::{Client, Method, StatusCode};
use thiserror::Error;
use url::Url;

/// Errors from executing a single HTTP request.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The request could not be built or executed.
    #[error("error executing request: {0}")]
    Request(#[from] reqwest::Error),

    /// The response status did not match the expected one.
    #[error("unexpected response status {}, expected {}", .status.as_u16(), .expected.as_u16())]
    UnexpectedStatus {
        /// Observed status code.
        status: StatusCode,
        /// The single status code the caller accepts.
        expected: StatusCode,
    },
}

/// Executes one HTTP request and manages the underlying connection pool.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Executes a request and returns the response body, failing unless the
    /// response carries exactly the expected status.
    async fn do_req(
        &self,
        method: Method,
        url: Url,
        body: Option<String>,
        headers: &[(&str, &str)],
        expected: StatusCode,
    ) -> Result<Bytes, TransportError>;

    /// Drops idle connections in the underlying pool.
    fn close_idle_connections(&self);
}

/// HTTP transport over an injected `reqwest` client.
///
/// The client is produced by a factory closure so that
/// [`close_idle_connections`](Transport::close_idle_connections) can swap in
/// a fresh client, discarding the old pool and whatever idle sockets it
/// still holds.
pub struct HttpTransport {
    client: RwLock<Client>,
    make_client: Box<dyn Fn() -> Client + Send + Sync>,
    host_header: Option<String>,
    authorization_key: Option<String>,
}

impl HttpTransport {
    /// Creates a transport from a client factory.
    ///
    /// The factory is called once immediately and again every time the
    /// idle pool is discarded, so it should encode the host's full client
    /// configuration (timeouts, TLS, pool limits).
    pub fn new<F>(make_client: F) -> Self
    where
        F: Fn() -> Client + Send + Sync + 'static,
    {
        let client = make_client();
        Self {
            client: RwLock::new(client),
            make_client: Box::new(make_client),
            host_header: None,
            authorization_key: None,
        }
    }

    /// Sets a `Host` header override applied to every request.
    pub fn with_host_header(mut self, host: &str) -> Self {
        self.host_header = Some(host.to_string());
        self
    }

    /// Sets a raw `Authorization` header value applied to every request.
    pub fn with_authorization_key(mut self, key: &str) -> Self {
        self.authorization_key = Some(key.to_string());
        self
    }

    fn current_client(&self) -> Client {
        match self.client.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn do_req(
        &self,
        method: Method,
        url: Url,
        body: Option<String>,
        headers: &[(&str, &str)],
        expected: StatusCode,
    ) -> Result<Bytes, TransportError> {
        let client = self.current_client();

        let mut request = client.request(method, url);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        if let Some(host) = &self.host_header {
            request = request.header(HOST, host);
        }
        if let Some(key) = &self.authorization_key {
            request = request.header(AUTHORIZATION, key);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_server_error() {
            // A 5xx can mean the peer was pulled from the load balancer
            // while we still hold an open connection to it; dropping the
            // pool forces the next request to re-resolve and reconnect.
            self.close_idle_connections();
        }

        if status != expected {
            return Err(TransportError::UnexpectedStatus { status, expected });
        }

        Ok(response.bytes().await?)
    }

    fn close_idle_connections(&self) {
        let fresh = (self.make_client)();
        let mut guard = match self.client.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = fresh;
    }
}
