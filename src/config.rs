//! Consumer configuration.
//!
//! [`ConsumerConfig`] describes the queue, consumer group and topic a
//! consumer is interested in, together with the knobs of the consuming
//! loop (backoff, stream count, dispatch concurrency).
//!
//! # Example
//!
//! ```rust
//! use restqueue::{ConsumerConfig, Offset};
//!
//! let config = ConsumerConfig::new(
//!     vec!["http://queue-proxy-1:8080".into(), "http://queue-proxy-2:8080".into()],
//!     "my-group",
//!     "my-topic",
//! )
//! .with_offset(Offset::Earliest)
//! .with_stream_count(4);
//!
//! assert_eq!(config.stream_count, 4);
//! ```

use std::time::Duration;
use thiserror::Error;

const DEFAULT_BACKOFF: Duration = Duration::from_secs(8);
const DEFAULT_WORKER_COUNT: usize = 100;

/// Errors raised while assembling a consumer.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Batched dispatch cannot be combined with concurrent processing.
    #[error("batched consumers do not support concurrent processing")]
    UnsupportedCombination,

    /// A queue proxy address is not a valid URL.
    #[error("invalid queue address: {0}")]
    InvalidAddress(#[from] url::ParseError),

    /// The ageing period must be greater than zero.
    #[error("ageing period must be greater than zero")]
    InvalidAgeingPeriod,
}

/// Offset reset policy applied when a new remote consumer instance is
/// created without a previous committed offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Offset {
    /// Start from the beginning of the topic. Impacts proxy memory usage.
    Earliest,
    /// Start from the end of the topic.
    #[default]
    Latest,
    /// Raise an error on the remote consumer when no offset is found.
    None,
}

impl Offset {
    /// Returns the wire value for this policy.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Earliest => "earliest",
            Self::Latest => "latest",
            Self::None => "none",
        }
    }
}

/// Configuration of the queue, consumer group and topic a consumer is
/// interested in.
///
/// Supplied once at construction and never mutated afterwards. Zero values
/// for `backoff_period`, `stream_count` and `worker_count` fall back to the
/// defaults at the point of use, so a struct assembled by hand behaves the
/// same as one built through [`ConsumerConfig::new`].
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Ordered pool of queue proxy addresses.
    pub addrs: Vec<String>,

    /// Consumer group name.
    pub group: String,

    /// Topic to consume from.
    pub topic: String,

    /// Optional `Host` header override, for proxies addressed through a
    /// shared gateway.
    pub queue: Option<String>,

    /// Offset reset policy for fresh remote consumer instances.
    pub offset: Offset,

    /// Delay applied after an empty or failed poll cycle (default 8s).
    pub backoff_period: Duration,

    /// Number of independent consuming streams (default 1).
    pub stream_count: usize,

    /// Dispatch messages through a bounded worker pool instead of serially.
    pub concurrent_processing: bool,

    /// Width of the worker pool used by concurrent dispatch (default 100).
    pub worker_count: usize,

    /// Let the remote proxy manage offset commits. When enabled the client
    /// never issues explicit commit calls.
    pub auto_commit_enable: bool,

    /// Raw `Authorization` header value, sent verbatim when set.
    pub authorization_key: Option<String>,

    /// Share one round-robin address cursor across all streams of an
    /// orchestrator instead of keeping a private cursor per stream.
    pub shared_address_cursor: bool,
}

impl ConsumerConfig {
    /// Creates a configuration with defaults for everything but the
    /// address pool, group and topic.
    pub fn new(addrs: Vec<String>, group: &str, topic: &str) -> Self {
        Self {
            addrs,
            group: group.to_string(),
            topic: topic.to_string(),
            queue: None,
            offset: Offset::default(),
            backoff_period: DEFAULT_BACKOFF,
            stream_count: 1,
            concurrent_processing: false,
            worker_count: DEFAULT_WORKER_COUNT,
            auto_commit_enable: false,
            authorization_key: None,
            shared_address_cursor: false,
        }
    }

    /// Sets the offset reset policy.
    pub fn with_offset(mut self, offset: Offset) -> Self {
        self.offset = offset;
        self
    }

    /// Sets the `Host` header override.
    pub fn with_queue(mut self, queue: &str) -> Self {
        self.queue = Some(queue.to_string());
        self
    }

    /// Sets the backoff period applied after empty or failed poll cycles.
    pub fn with_backoff_period(mut self, backoff: Duration) -> Self {
        self.backoff_period = backoff;
        self
    }

    /// Sets the number of independent consuming streams.
    pub fn with_stream_count(mut self, streams: usize) -> Self {
        self.stream_count = streams;
        self
    }

    /// Enables concurrent dispatch over a worker pool of the given width.
    pub fn with_concurrent_processing(mut self, workers: usize) -> Self {
        self.concurrent_processing = true;
        self.worker_count = workers;
        self
    }

    /// Lets the remote proxy manage offset commits.
    pub fn with_auto_commit(mut self) -> Self {
        self.auto_commit_enable = true;
        self
    }

    /// Sets the raw `Authorization` header value.
    pub fn with_authorization_key(mut self, key: &str) -> Self {
        self.authorization_key = Some(key.to_string());
        self
    }

    /// Shares one round-robin address cursor across all streams.
    pub fn with_shared_address_cursor(mut self) -> Self {
        self.shared_address_cursor = true;
        self
    }

    /// Effective backoff period.
    pub(crate) fn backoff(&self) -> Duration {
        if self.backoff_period.is_zero() {
            DEFAULT_BACKOFF
        } else {
            self.backoff_period
        }
    }

    /// Effective stream count.
    pub(crate) fn streams(&self) -> usize {
        if self.stream_count == 0 {
            1
        } else {
            self.stream_count
        }
    }

    /// Effective worker pool width for concurrent dispatch.
    pub(crate) fn workers(&self) -> usize {
        if self.worker_count == 0 {
            DEFAULT_WORKER_COUNT
        } else {
            self.worker_count
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConsumerConfig::new(vec!["http://proxy".into()], "group", "topic");

        assert_eq!(config.offset, Offset::Latest);
        assert_eq!(config.backoff(), Duration::from_secs(8));
        assert_eq!(config.streams(), 1);
        assert_eq!(config.workers(), 100);
        assert!(!config.auto_commit_enable);
        assert!(!config.concurrent_processing);
        assert!(!config.shared_address_cursor);
    }

    #[test]
    fn test_zero_values_fall_back_to_defaults() {
        let mut config = ConsumerConfig::new(vec![], "group", "topic");
        config.backoff_period = Duration::ZERO;
        config.stream_count = 0;
        config.worker_count = 0;

        assert_eq!(config.backoff(), Duration::from_secs(8));
        assert_eq!(config.streams(), 1);
        assert_eq!(config.workers(), 100);
    }

    #[test]
    fn test_offset_wire_values() {
        assert_eq!(Offset::Earliest.as_str(), "earliest");
        assert_eq!(Offset::Latest.as_str(), "latest");
        assert_eq!(Offset::None.as_str(), "none");
    }

    #[test]
    fn test_builder_methods() {
        let config = ConsumerConfig::new(vec!["http://proxy".into()], "group", "topic")
            .with_queue("queue-host")
            .with_offset(Offset::None)
            .with_backoff_period(Duration::from_secs(1))
            .with_stream_count(3)
            .with_concurrent_processing(16)
            .with_auto_commit()
            .with_authorization_key("secret")
            .with_shared_address_cursor();

        assert_eq!(config.queue.as_deref(), Some("queue-host"));
        assert_eq!(config.offset, Offset::None);
        assert_eq!(config.backoff(), Duration::from_secs(1));
        assert_eq!(config.streams(), 3);
        assert!(config.concurrent_processing);
        assert_eq!(config.workers(), 16);
        assert!(config.auto_commit_enable);
        assert_eq!(config.authorization_key.as_deref(), Some("secret"));
        assert!(config.shared_address_cursor);
    }
}
