//! Transport abstraction.
//!
//! A transport owns one physical connection and exposes the same contract
//! whatever the mechanism underneath:
//!
//! ```text
//! Transport (trait)
//!     │
//!     ├── WebSocketTransport        full-duplex socket, send loop + receive loop
//!     ├── ServerSentEventsTransport push stream receive loop, POST per send
//!     └── LongPollingTransport      poll receive loop, POST per send
//! ```
//!
//! Every transport walks the same lifecycle, driven by the shared
//! [`TransportLifecycle`] helper:
//!
//! ```text
//! Unstarted ──start──> Starting ──ok──> Connected ──stop/loop exit──> Stopping ──> Stopped
//!                          └──────────────failure──────────────────────────────────┘
//! ```
//!
//! Inbound payloads and the single terminal notification are delivered on
//! the `mpsc` channel handed to [`Transport::start`] as [`TransportEvent`]s.
//! The channel preserves arrival order, and `Closed` is always the last event.

pub mod lifecycle;
pub mod long_polling;
pub mod selector;
pub mod server_sent_events;
pub mod websocket;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::constants;
use crate::http::HttpClient;

pub use lifecycle::TransportLifecycle;
pub use long_polling::LongPollingTransport;
pub use selector::{NegotiationError, TransportSelector};
pub use server_sent_events::ServerSentEventsTransport;
pub use websocket::WebSocketTransport;

/// Transport mechanisms, named as the server advertises them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Full-duplex WebSocket.
    WebSockets,
    /// Server push stream plus HTTP POST for sends.
    ServerSentEvents,
    /// HTTP long polling plus HTTP POST for sends.
    LongPolling,
}

impl TransportKind {
    /// All kinds, in the default preference order.
    pub const ALL: [TransportKind; 3] = [
        TransportKind::WebSockets,
        TransportKind::ServerSentEvents,
        TransportKind::LongPolling,
    ];

    /// Wire name of this kind.
    pub fn name(self) -> &'static str {
        match self {
            Self::WebSockets => "WebSockets",
            Self::ServerSentEvents => "ServerSentEvents",
            Self::LongPolling => "LongPolling",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "websockets" | "websocket" | "ws" => Ok(Self::WebSockets),
            "serversentevents" | "sse" => Ok(Self::ServerSentEvents),
            "longpolling" | "long-polling" | "lp" => Ok(Self::LongPolling),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

/// Transport lifecycle state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportState {
    /// Created, `start` not called yet.
    Unstarted,
    /// `start` in progress.
    Starting,
    /// Loops running.
    Connected,
    /// Loops are being shut down.
    Stopping,
    /// Terminal.
    Stopped,
}

impl Default for TransportState {
    fn default() -> Self {
        Self::Unstarted
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// `start` was called more than once.
    AlreadyStarted,
    /// `send` called before the transport connected.
    NotConnected,
    /// The transport is stopping or stopped.
    ConnectionStopped,
    /// Failure that may succeed on retry (one failed poll, a dropped request).
    Transient(String),
    /// Failure that ends the transport.
    Fatal(String),
    /// The server closed the WebSocket with a non-normal close code.
    ClosedByServer {
        /// WebSocket close code.
        code: u16,
        /// Close reason sent by the server.
        reason: String,
    },
    /// Operation timed out (start, dispose, inactivity).
    Timeout,
}

impl TransportError {
    /// Whether retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout)
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyStarted => write!(f, "Transport already started"),
            Self::NotConnected => write!(f, "Transport not connected"),
            Self::ConnectionStopped => write!(f, "Transport stopped"),
            Self::Transient(msg) => write!(f, "Transient transport error: {msg}"),
            Self::Fatal(msg) => write!(f, "Transport failed: {msg}"),
            Self::ClosedByServer { code, reason } => {
                write!(f, "Closed by server with status {code}")?;
                if !reason.is_empty() {
                    write!(f, ": {reason}")?;
                }
                Ok(())
            }
            Self::Timeout => write!(f, "Operation timed out"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Event delivered by a transport to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One inbound payload, in network arrival order.
    Received(Bytes),
    /// Terminal notification, sent exactly once. Carries the error that
    /// ended the transport, or `None` for a clean shutdown.
    Closed(Option<TransportError>),
}

/// Runtime options handed to [`Transport::start`].
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Long-poll hold time; the request timeout adds a small slack on top.
    pub poll_timeout: Duration,
    /// Consecutive transient poll failures tolerated.
    pub max_poll_retries: u32,
    /// Bound on waiting for loops during `stop`.
    pub shutdown_grace: Duration,
    /// Capacity of the outbound queue (WebSocket).
    pub send_queue_capacity: usize,
    /// Frame size limit for stream reassembly (Server-Sent Events).
    pub max_message_size: usize,
    /// Extra headers for the connect / stream requests.
    pub headers: Vec<(String, String)>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            poll_timeout: constants::POLL_TIMEOUT,
            max_poll_retries: constants::MAX_POLL_RETRIES,
            shutdown_grace: constants::SHUTDOWN_GRACE,
            send_queue_capacity: constants::SEND_QUEUE_CAPACITY,
            max_message_size: constants::MAX_MESSAGE_SIZE,
            headers: Vec::new(),
        }
    }
}

/// One physical connection with a uniform start/send/stop contract.
///
/// Implementations run one receive loop and, where the mechanism allows, one
/// send loop. `send` is safe to call concurrently: each payload is delivered
/// whole, and one caller's payloads stay in order.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Mechanism of this transport.
    fn kind(&self) -> TransportKind;

    /// Current lifecycle state.
    fn state(&self) -> TransportState;

    /// Establish the physical connection and spawn the loops.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::AlreadyStarted` on a second call, or the
    /// connect failure. A transport that fails to start is `Stopped` and never
    /// emits events.
    async fn start(
        &self,
        url: &str,
        options: &TransportOptions,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError>;

    /// Hand `payload` to the transport for transmission.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::NotConnected` before start, or
    /// `TransportError::ConnectionStopped` once stopping. Other errors are
    /// returned to the caller without ending the transport.
    async fn send(&self, payload: Bytes) -> Result<(), TransportError>;

    /// Stop the loops and wait for the transport to reach `Stopped`.
    ///
    /// `error` becomes the terminating error reported in
    /// [`TransportEvent::Closed`]. Safe to call from any task, any number of
    /// times; only the first error is kept.
    async fn stop(&self, error: Option<TransportError>);

    /// Error the transport stopped with, once `Stopped`.
    ///
    /// Mirrors the error in [`TransportEvent::Closed`] and stays readable
    /// when that event could not be delivered.
    fn close_error(&self) -> Option<TransportError> {
        None
    }
}

/// Creates transports by kind.
pub trait TransportFactory: Send + Sync + std::fmt::Debug {
    /// Build an unstarted transport of the given kind.
    fn create(&self, kind: TransportKind) -> Arc<dyn Transport>;
}

/// Factory for the built-in transports.
#[derive(Debug, Clone)]
pub struct DefaultTransportFactory {
    http: Arc<dyn HttpClient>,
}

impl DefaultTransportFactory {
    /// Create a factory whose HTTP-based transports use `http`.
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self { http }
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, kind: TransportKind) -> Arc<dyn Transport> {
        match kind {
            TransportKind::WebSockets => Arc::new(WebSocketTransport::new()),
            TransportKind::ServerSentEvents => {
                Arc::new(ServerSentEventsTransport::new(Arc::clone(&self.http)))
            }
            TransportKind::LongPolling => {
                Arc::new(LongPollingTransport::new(Arc::clone(&self.http)))
            }
        }
    }
}

/// Receive-side handle used by loops to pass payloads to the owner.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    label: &'static str,
    tx: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
}

impl EventSink {
    /// Deliver one payload, waiting for queue space.
    ///
    /// Returns `false` when the transport is cancelled or the owner is gone;
    /// the loop should exit.
    pub(crate) async fn received(&self, payload: Bytes) -> bool {
        log::debug!(
            "{} Passing message to application. Payload size: {}",
            self.label,
            payload.len()
        );

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            res = self.tx.send(TransportEvent::Received(payload)) => {
                if res.is_err() {
                    log::debug!("{} Event receiver dropped", self.label);
                }
                res.is_ok()
            }
        }
    }
}

/// URL and headers an HTTP-based transport sends to.
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
    pub(crate) url: String,
    pub(crate) headers: Vec<(String, String)>,
}

impl Endpoint {
    /// POST one payload. A non-2xx status fails this send only.
    pub(crate) async fn post(
        &self,
        http: &dyn HttpClient,
        label: &str,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        log::trace!("{} Sending {} bytes to '{}'.", label, payload.len(), self.url);
        let response = http.post(&self.url, &self.headers, payload).await?;
        if !response.is_success() {
            log::warn!("{} Send to '{}' returned {}.", label, self.url, response.status);
            return Err(TransportError::Transient(format!(
                "send returned status {}",
                response.status
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_parsing() {
        assert_eq!("WebSockets".parse::<TransportKind>(), Ok(TransportKind::WebSockets));
        assert_eq!("sse".parse::<TransportKind>(), Ok(TransportKind::ServerSentEvents));
        assert_eq!(" LongPolling ".parse::<TransportKind>(), Ok(TransportKind::LongPolling));
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_transport_kind_serde_uses_wire_names() {
        let json = serde_json::to_string(&TransportKind::ALL).unwrap();
        assert_eq!(json, r#"["WebSockets","ServerSentEvents","LongPolling"]"#);
    }

    #[test]
    fn test_state_ordering_is_lifecycle_order() {
        assert!(TransportState::Unstarted < TransportState::Starting);
        assert!(TransportState::Starting < TransportState::Connected);
        assert!(TransportState::Connected < TransportState::Stopping);
        assert!(TransportState::Stopping < TransportState::Stopped);
    }

    #[test]
    fn test_error_classification() {
        assert!(TransportError::Transient("poll".into()).is_transient());
        assert!(TransportError::Timeout.is_transient());
        assert!(!TransportError::Fatal("x".into()).is_transient());
        assert_eq!(
            TransportError::ClosedByServer { code: 4000, reason: "bye".into() }.to_string(),
            "Closed by server with status 4000: bye"
        );
    }
}
