//! Idle-connection ageing helper.
//!
//! Long-lived connections to a proxy behind a load balancer can outlive
//! the proxy itself. [`AgeingClient`] periodically tells the transport to
//! drop idle connections so the pool re-resolves and reconnects.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::ConfigError;
use crate::transport::Transport;

/// Periodically closes the transport's idle connections.
pub struct AgeingClient {
    transport: Arc<dyn Transport>,
    max_age: Duration,
}

impl AgeingClient {
    /// Creates an ageing client over the given transport.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAgeingPeriod`] when `max_age` is zero.
    pub fn new(transport: Arc<dyn Transport>, max_age: Duration) -> Result<Self, ConfigError> {
        if max_age.is_zero() {
            return Err(ConfigError::InvalidAgeingPeriod);
        }
        Ok(Self { transport, max_age })
    }

    /// Spawns the background ageing task. The task runs until the returned
    /// handle is aborted.
    pub fn start(&self) -> JoinHandle<()> {
        info!(max_age = ?self.max_age, "Starting connection ageing");
        let transport = Arc::clone(&self.transport);
        let max_age = self.max_age;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(max_age);
            // the first tick of an interval fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                info!("Closing idle connections");
                transport.close_idle_connections();
            }
        })
    }
}
