use std::sync::Arc;
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::{backoff_delay, Connector, Endpoint, RetryConfig, Transport, TransportError};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Transport Error")]
    Transport(#[from] TransportError),
    #[error("Unable to connect to {endpoint} after {attempts} attempts")]
    Exhausted {
        endpoint: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("Connect cancelled")]
    Cancelled,
}

/// [`TransportConnection`] owns (at most) one session with the controller
/// and the bookkeeping needed to keep it alive:
/// 1. Connecting with retries, sleeping an exponential backoff between
/// attempts (see [`backoff_delay`]) that is cut short on cancellation
/// 2. Tracking health: a ping is sent at most once per
/// `health_check_interval`, and a failed ping (or any failed read/write)
/// marks the session unhealthy without tearing it down, so the owner
/// decides when to reconnect
/// 3. Bounding every read by a deadline
pub struct TransportConnection {
    endpoint: Endpoint,
    config: RetryConfig,
    connector: Arc<dyn Connector>,
    transport: Option<Box<dyn Transport>>,
    healthy: bool,
    last_health_check: Option<Instant>,
    consecutive_failures: u32,
    connect_timeout: Duration,
}

impl TransportConnection {
    pub fn new(endpoint: Endpoint, config: RetryConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            endpoint,
            config,
            connector,
            transport: None,
            healthy: false,
            last_health_check: None,
            consecutive_failures: 0,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Takes effect on the next [`connect`](Self::connect)
    pub fn set_endpoint(&mut self, endpoint: Endpoint) {
        if endpoint != self.endpoint {
            log::info!("Controller endpoint {} -> {}", self.endpoint, endpoint);
        }
        self.endpoint = endpoint;
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Up to `max_retries + 1` attempts; before every retry sleeps the
    /// backoff delay for that retry number
    pub async fn connect(&mut self, cancel: &CancellationToken) -> Result<(), ConnectionError> {
        let attempts = self.config.max_retries.saturating_add(1);
        let mut last_error = TransportError::NotConnected;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = backoff_delay(&self.config, attempt);
                log::debug!(
                    "Retrying {} in {:?} (attempt {}/{})",
                    self.endpoint,
                    delay,
                    attempt + 1,
                    attempts
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if cancel.is_cancelled() {
                return Err(ConnectionError::Cancelled);
            }

            let res = tokio::select! {
                _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
                res = tokio::time::timeout(
                    self.connect_timeout,
                    self.connector.connect(&self.endpoint)
                ) => res,
            };

            match res {
                Ok(Ok(transport)) => {
                    self.transport = Some(transport);
                    self.healthy = true;
                    self.last_health_check = Some(Instant::now());
                    self.consecutive_failures = 0;
                    log::info!("Connected to {}", self.endpoint);
                    return Ok(());
                }
                Ok(Err(e)) => {
                    log::warn!("Connect to {} failed: {e:}", self.endpoint);
                    self.consecutive_failures += 1;
                    last_error = e;
                }
                Err(_) => {
                    log::warn!(
                        "Connect to {} timed out after {:?}",
                        self.endpoint,
                        self.connect_timeout
                    );
                    self.consecutive_failures += 1;
                    last_error = TransportError::Timeout(self.connect_timeout);
                }
            }
        }

        Err(ConnectionError::Exhausted {
            endpoint: self.endpoint.to_string(),
            attempts,
            source: last_error,
        })
    }

    /// Safe to call repeatedly and with no session open
    pub async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                log::debug!("Error closing session to {}: {e:}", self.endpoint);
            }
            log::debug!("Closed session to {}", self.endpoint);
        }
        self.healthy = false;
        self.last_health_check = None;
    }

    /// Marks the session unusable (the session itself stays open until
    /// [`close`](Self::close))
    pub fn mark_disconnected(&mut self) {
        if self.healthy {
            log::warn!("Marking connection to {} as disconnected", self.endpoint);
        }
        self.healthy = false;
    }

    pub async fn is_healthy(&mut self) -> bool {
        let Some(transport) = self.transport.as_mut() else {
            return false;
        };
        if !self.healthy {
            return false;
        }

        if let Some(last) = self.last_health_check {
            if last.elapsed() < self.config.health_check_interval {
                return self.healthy;
            }
        }

        let res = transport.ping().await;
        self.last_health_check = Some(Instant::now());
        if let Err(e) = res {
            log::warn!("Health check ping to {} failed: {e:}", self.endpoint);
            self.healthy = false;
        }
        self.healthy
    }

    pub async fn ensure_connected(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        if self.is_healthy().await {
            return Ok(());
        }
        self.close().await;
        self.connect(cancel).await
    }

    pub async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        let transport = self.transport.as_mut().ok_or(TransportError::NotConnected)?;
        let res = transport.send_text(text).await;
        if res.is_err() {
            self.healthy = false;
        }
        res
    }

    /// A timeout is reported as [`TransportError::Timeout`] and leaves
    /// the health state alone; any other failure marks the session
    /// unhealthy
    pub async fn recv_text(&mut self, deadline: Duration) -> Result<String, TransportError> {
        let transport = self.transport.as_mut().ok_or(TransportError::NotConnected)?;
        match tokio::time::timeout(deadline, transport.recv_text()).await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => {
                self.healthy = false;
                Err(e)
            }
            Err(_) => Err(TransportError::Timeout(deadline)),
        }
    }
}

impl Drop for TransportConnection {
    fn drop(&mut self) {
        if self.transport.is_some() {
            log::trace!("Dropping open session to {}", self.endpoint);
        }
    }
}
