//! One-shot event notifier.
//!
//! Wakes an external peer (typically a scheduler) by writing a short fixed
//! payload to a cached non-blocking connection. Delivery of the whole
//! payload is not required: any byte reaching the peer is enough.
//!
//! - The primary address is tried first, the backup only if it fails.
//! - Would-block and interrupted writes are retried in place.
//! - A peer that closed the socket (broken pipe) gets one reconnect.
//! - Notifications within the aggregation window are suppressed.
//! - After an open failure the notifier stays quiet for a back-off period
//!   so an unreachable peer cannot stall callers with connect timeouts.

use std::time::Duration;

use fedmesh_proto::constants::FED_NOTIFY_PAYLOAD;
use fedmesh_proto::defaults::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_NOTIFY_AGGREGATION_SECS,
    DEFAULT_NOTIFY_OPEN_FAILURE_BACKOFF_SECS, DEFAULT_NOTIFY_RETRIES,
};
use fedmesh_proto::{FedError, FedResult};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::net::connect_with_fallback;
use crate::send::{try_send, SendOutcome};

/// Notifier configuration.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub host: String,
    pub backup_host: Option<String>,
    /// Zero disables notification entirely.
    pub port: u16,
    pub aggregation: Duration,
    pub open_failure_backoff: Duration,
    pub connect_timeout: Duration,
    pub retries: u32,
}

impl NotifierConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            backup_host: None,
            port,
            aggregation: Duration::from_secs(DEFAULT_NOTIFY_AGGREGATION_SECS),
            open_failure_backoff: Duration::from_secs(DEFAULT_NOTIFY_OPEN_FAILURE_BACKOFF_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            retries: DEFAULT_NOTIFY_RETRIES,
        }
    }

    fn addrs(&self) -> Vec<(String, u16)> {
        std::iter::once(&self.host)
            .chain(self.backup_host.iter())
            .map(|h| (h.clone(), self.port))
            .collect()
    }
}

/// What a call to [`EventNotifier::notify`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent,
    Disabled,
    /// Within the aggregation window or the open-failure back-off.
    Suppressed,
}

#[derive(Default)]
struct NotifierState {
    stream: Option<TcpStream>,
    last_sent: Option<Instant>,
    quiet_until: Option<Instant>,
}

/// Cached-connection notifier. Safe to share between tasks.
pub struct EventNotifier {
    config: NotifierConfig,
    state: Mutex<NotifierState>,
}

impl EventNotifier {
    pub fn new(config: NotifierConfig) -> Self {
        Self {
            config,
            state: Mutex::new(NotifierState::default()),
        }
    }

    async fn open(&self) -> FedResult<TcpStream> {
        let (stream, idx) =
            connect_with_fallback(&self.config.addrs(), self.config.connect_timeout).await?;
        debug!("event notifier connected via address #{}", idx);
        Ok(stream)
    }

    /// Notify the peer that something changed. `what` is only logged.
    pub async fn notify(&self, what: &str) -> FedResult<NotifyOutcome> {
        if self.config.port == 0 {
            return Ok(NotifyOutcome::Disabled);
        }

        let mut state = self.state.lock().await;
        let now = Instant::now();

        if let Some(until) = state.quiet_until {
            if now < until {
                debug!("event notification suppressed after open failure: {}", what);
                return Ok(NotifyOutcome::Suppressed);
            }
            state.quiet_until = None;
        }
        if let Some(last) = state.last_sent {
            if !self.config.aggregation.is_zero() && now.duration_since(last) < self.config.aggregation {
                info!("event notification already sent recently");
                return Ok(NotifyOutcome::Suppressed);
            }
        }

        let mut attempts = self.config.retries.max(1);
        while attempts > 0 {
            if state.stream.is_none() {
                match self.open().await {
                    Ok(s) => state.stream = Some(s),
                    Err(e) => {
                        error!("unable to open event notification port: {}", e);
                        state.quiet_until = Some(now + self.config.open_failure_backoff);
                        return Err(FedError::ConnectFailed);
                    }
                }
            }
            let Some(stream) = state.stream.as_ref() else {
                break;
            };

            match try_send(stream, FED_NOTIFY_PAYLOAD, 0) {
                SendOutcome::Sent { .. } => {
                    info!("event notification sent: {}", what);
                    state.last_sent = Some(now);
                    return Ok(NotifyOutcome::Sent);
                }
                SendOutcome::Deferred => {
                    attempts -= 1;
                }
                SendOutcome::Failed(kind) => {
                    error!("event notification failure: {:?}", kind);
                    attempts -= 1;
                    state.stream = None;
                    if kind != std::io::ErrorKind::BrokenPipe {
                        break;
                    }
                }
            }
        }

        Err(FedError::SendFailed)
    }

    /// Drop the cached connection.
    pub async fn close(&self) {
        self.state.lock().await.stream = None;
    }
}
