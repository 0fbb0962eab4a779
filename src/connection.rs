//! Client-side logical connection.
//!
//! [`ClientConnection`] is what the application holds. It negotiates, lets
//! the [`TransportSelector`] pick a transport, encodes outgoing hub messages,
//! decodes incoming ones, and owns shutdown.
//!
//! ```text
//!                 send(msg)                         received stream
//!                    │                                     ▲
//!                    ▼                                     │
//!  ┌──────────── SendGate ─────────────┐        ┌──── pump task ────┐
//!  │ NotStarted │ Open(transport) │ Closed      │  decode_all        │
//!  └───────────────────┬───────────────┘        └────────▲──────────┘
//!                      ▼                                  │
//!                  Transport ──────── TransportEvent ─────┘
//! ```
//!
//! # Shutdown ordering
//!
//! `send` holds a read guard on the gate until the transport has accepted the
//! payload. `stop` takes the write guard to close the gate, which waits for
//! those sends, and only then stops the transport. A payload for which `send`
//! returned `Ok` is therefore always handed to the transport before
//! `Transport::stop` runs.
//!
//! The closed event fires exactly once, after every payload received before
//! the close has been forwarded to the received stream. Once `stop` begins,
//! messages that do not fit in the received stream are discarded so an
//! undrained stream cannot hold the close back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::framing::BinaryFramer;
use crate::http::{HttpClient, ReqwestHttpClient};
use crate::negotiate::{HttpNegotiator, Negotiator};
use crate::protocol::{HubMessage, HubProtocolRole, MessagePackHubProtocol, ProtocolError};
use crate::transport::lifecycle::lock;
use crate::transport::{
    DefaultTransportFactory, NegotiationError, Transport, TransportError, TransportEvent,
    TransportFactory, TransportKind, TransportSelector,
};

/// Errors from [`ClientConnection::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// `start` was already called on this connection.
    AlreadyStarted,
    /// The hub URL could not be parsed.
    InvalidUrl(String),
    /// The negotiate request failed.
    Negotiate(String),
    /// No transport could be started.
    Negotiation(NegotiationError),
    /// `stop` was called while starting.
    ConnectionStopped,
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyStarted => write!(f, "Connection already started"),
            Self::InvalidUrl(msg) => write!(f, "Invalid URL: {msg}"),
            Self::Negotiate(msg) => write!(f, "Negotiation failed: {msg}"),
            Self::Negotiation(e) => write!(f, "{e}"),
            Self::ConnectionStopped => write!(f, "Connection stopped while starting"),
        }
    }
}

impl std::error::Error for ConnectError {}

/// Errors from [`ClientConnection::send`].
#[derive(Debug, Clone, PartialEq)]
pub enum SendError {
    /// `start` has not completed.
    NotStarted,
    /// The connection is stopping or closed.
    ConnectionStopped,
    /// The message could not be encoded.
    Protocol(ProtocolError),
    /// The transport rejected this payload. The connection stays open.
    Transport(TransportError),
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "Cannot send until the connection is started"),
            Self::ConnectionStopped => write!(f, "Cannot send on a stopped connection"),
            Self::Protocol(e) => write!(f, "{e}"),
            Self::Transport(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SendError {}

impl From<ProtocolError> for SendError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// Payload of the closed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionClosed {
    /// The error that ended the connection, `None` for a clean stop.
    pub error: Option<TransportError>,
}

#[derive(Debug)]
enum SendGate {
    NotStarted,
    Open(Arc<dyn Transport>),
    Closed,
}

#[derive(Debug)]
struct Shared {
    gate: RwLock<SendGate>,
    closed: watch::Sender<Option<ConnectionClosed>>,
    /// Cancelled when `stop` begins.
    stopping: CancellationToken,
}

impl Shared {
    /// Fire the closed event. Later calls are ignored.
    fn raise_closed(&self, error: Option<TransportError>) {
        let raised = self.closed.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(ConnectionClosed { error });
            true
        });
        if raised {
            log::debug!("[ClientConnection] Raising Closed event.");
        }
    }
}

#[derive(Debug, Clone)]
struct Established {
    connection_id: String,
    kind: TransportKind,
}

/// A logical hub connection over whichever transport could be started.
#[derive(Debug)]
pub struct ClientConnection {
    url: String,
    config: ClientConfig,
    headers: Vec<(String, String)>,
    negotiator: Arc<dyn Negotiator>,
    factory: Arc<dyn TransportFactory>,
    protocol: MessagePackHubProtocol,
    started: AtomicBool,
    established: OnceLock<Established>,
    shared: Arc<Shared>,
    received_tx: Mutex<Option<mpsc::Sender<HubMessage>>>,
    received_rx: Mutex<Option<mpsc::Receiver<HubMessage>>>,
}

/// Builder for [`ClientConnection`].
#[derive(Debug)]
pub struct ClientConnectionBuilder {
    url: String,
    config: ClientConfig,
    headers: Vec<(String, String)>,
    http: Option<Arc<dyn HttpClient>>,
    negotiator: Option<Arc<dyn Negotiator>>,
    factory: Option<Arc<dyn TransportFactory>>,
}

impl ClientConnectionBuilder {
    /// Use `config` instead of the defaults.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a header to the negotiate and transport requests.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// HTTP client for negotiation and the HTTP-based transports.
    pub fn http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    /// Replace the negotiation collaborator.
    pub fn negotiator(mut self, negotiator: Arc<dyn Negotiator>) -> Self {
        self.negotiator = Some(negotiator);
        self
    }

    /// Replace the transport factory.
    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Build the connection. Nothing is sent until [`ClientConnection::start`].
    pub fn build(self) -> ClientConnection {
        let http = self
            .http
            .unwrap_or_else(|| Arc::new(ReqwestHttpClient::new()));
        let negotiator = self.negotiator.unwrap_or_else(|| {
            Arc::new(HttpNegotiator::new(Arc::clone(&http)).with_headers(self.headers.clone()))
        });
        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(DefaultTransportFactory::new(Arc::clone(&http))));

        let (closed, _) = watch::channel(None);
        let (received_tx, received_rx) = mpsc::channel(self.config.receive_queue_capacity.max(1));
        let protocol = MessagePackHubProtocol::new(
            HubProtocolRole::Client,
            BinaryFramer::new(self.config.max_message_size),
        );

        ClientConnection {
            url: self.url,
            config: self.config,
            headers: self.headers,
            negotiator,
            factory,
            protocol,
            started: AtomicBool::new(false),
            established: OnceLock::new(),
            shared: Arc::new(Shared {
                gate: RwLock::new(SendGate::NotStarted),
                closed,
                stopping: CancellationToken::new(),
            }),
            received_tx: Mutex::new(Some(received_tx)),
            received_rx: Mutex::new(Some(received_rx)),
        }
    }
}

impl ClientConnection {
    /// Connection to `url` with default settings.
    pub fn new(url: impl Into<String>) -> Self {
        Self::builder(url).build()
    }

    /// Start building a connection to `url`.
    pub fn builder(url: impl Into<String>) -> ClientConnectionBuilder {
        ClientConnectionBuilder {
            url: url.into(),
            config: ClientConfig::default(),
            headers: Vec::new(),
            http: None,
            negotiator: None,
            factory: None,
        }
    }

    /// Id assigned by the server, once started.
    pub fn connection_id(&self) -> Option<&str> {
        self.established.get().map(|e| e.connection_id.as_str())
    }

    /// Kind of the selected transport, once started.
    pub fn transport_kind(&self) -> Option<TransportKind> {
        self.established.get().map(|e| e.kind)
    }

    /// Take the stream of decoded inbound messages.
    ///
    /// Returns `None` after the first call. The stream ends after the closed
    /// event. It must be drained: a full stream holds back the transport
    /// until `stop` is called.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<HubMessage>> {
        lock(&self.received_rx).take()
    }

    /// Wait for the closed event and return its error.
    pub async fn closed(&self) -> Option<TransportError> {
        let mut rx = self.shared.closed.subscribe();
        let error = match rx.wait_for(Option::is_some).await {
            Ok(closed) => closed.as_ref().and_then(|c| c.error.clone()),
            Err(_) => None,
        };
        error
    }

    /// True once the closed event fired.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.borrow().is_some()
    }

    /// Negotiate, start a transport and begin delivering messages.
    ///
    /// Candidates are the configured transports, in configured order,
    /// restricted to those the server offers. A failed start leaves the
    /// connection closed.
    pub async fn start(&self) -> Result<(), ConnectError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ConnectError::AlreadyStarted);
        }
        if matches!(*self.shared.gate.read().await, SendGate::Closed) {
            log::debug!("[ClientConnection] Connection was stopped before starting.");
            return Err(ConnectError::ConnectionStopped);
        }
        log::debug!("[ClientConnection] Starting connection.");

        let result = match self.establish().await {
            Ok((transport, events, established)) => self.open(transport, events, established).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            let requested = {
                let mut gate = self.shared.gate.write().await;
                let requested = matches!(*gate, SendGate::Closed);
                *gate = SendGate::Closed;
                requested
            };
            let error = (!requested).then(|| TransportError::Fatal(e.to_string()));
            self.shared.raise_closed(error);
        }
        result
    }

    async fn establish(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>, Established), ConnectError> {
        let negotiation = tokio::time::timeout(
            self.config.negotiate_timeout(),
            self.negotiator.negotiate(&self.url),
        )
        .await
        .unwrap_or_else(|_elapsed| Err("negotiate request timed out".to_string()))
        .map_err(|e| {
            log::error!(
                "[ClientConnection] Failed to start connection. Error getting negotiation response from '{}': {}",
                self.url,
                e
            );
            ConnectError::Negotiate(e)
        })?;

        let kinds: Vec<TransportKind> = self
            .config
            .transports
            .iter()
            .copied()
            .filter(|kind| negotiation.available_transports.contains(kind))
            .collect();
        let url = with_connection_id(&self.url, &negotiation.connection_id)?;
        let candidates = kinds.iter().map(|kind| self.factory.create(*kind)).collect();

        let mut options = self.config.transport_options();
        options.headers = self.headers.clone();

        let (events_tx, events_rx) = mpsc::channel(self.config.receive_queue_capacity.max(1));
        let transport = TransportSelector::new(self.config.start_timeout())
            .connect(&url, candidates, &options, events_tx)
            .await
            .map_err(ConnectError::Negotiation)?;

        let established = Established {
            connection_id: negotiation.connection_id,
            kind: transport.kind(),
        };
        Ok((transport, events_rx, established))
    }

    async fn open(
        &self,
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
        established: Established,
    ) -> Result<(), ConnectError> {
        {
            let mut gate = self.shared.gate.write().await;
            if matches!(*gate, SendGate::Closed) {
                drop(gate);
                drop(events);
                transport.stop(None).await;
                return Err(ConnectError::ConnectionStopped);
            }
            *gate = SendGate::Open(Arc::clone(&transport));
        }

        let received = lock(&self.received_tx).take();
        let Some(received) = received else {
            return Err(ConnectError::AlreadyStarted);
        };

        let _ = self.established.set(established);
        log::debug!("[ClientConnection] Raising Connected event.");

        tokio::spawn(pump(
            Arc::clone(&self.shared),
            transport,
            self.protocol.clone(),
            events,
            received,
        ));
        Ok(())
    }

    /// Encode `message` and hand it to the transport.
    ///
    /// # Errors
    ///
    /// Returns `SendError::ConnectionStopped` once `stop` began or the
    /// transport closed. Transport errors for this payload are returned
    /// without closing the connection.
    pub async fn send(&self, message: &HubMessage) -> Result<(), SendError> {
        let payload = Bytes::from(self.protocol.encode(message)?);

        let gate = self.shared.gate.read().await;
        let transport = match &*gate {
            SendGate::NotStarted => return Err(SendError::NotStarted),
            SendGate::Closed => return Err(SendError::ConnectionStopped),
            SendGate::Open(transport) => transport,
        };

        log::debug!("[ClientConnection] Sending message.");
        match transport.send(payload).await {
            Ok(()) => Ok(()),
            Err(TransportError::ConnectionStopped) => Err(SendError::ConnectionStopped),
            Err(e) => Err(SendError::Transport(e)),
        }
    }

    /// Stop accepting sends, let in-flight sends reach the transport, stop
    /// the transport and wait for the closed event.
    pub async fn stop(&self) {
        log::info!("[ClientConnection] Stopping client.");
        self.shared.stopping.cancel();

        let previous = {
            let mut gate = self.shared.gate.write().await;
            std::mem::replace(&mut *gate, SendGate::Closed)
        };

        match previous {
            SendGate::Open(transport) => transport.stop(None).await,
            SendGate::NotStarted if !self.started.load(Ordering::SeqCst) => {
                self.shared.raise_closed(None);
                return;
            }
            SendGate::NotStarted | SendGate::Closed => {}
        }

        self.closed().await;
    }
}

/// Forward transport events to the application until the transport closes.
async fn pump(
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    protocol: MessagePackHubProtocol,
    mut events: mpsc::Receiver<TransportEvent>,
    received: mpsc::Sender<HubMessage>,
) {
    log::trace!("[ClientConnection] Beginning receive loop.");
    let mut closed = None;

    while let Some(event) = events.recv().await {
        let payload = match event {
            TransportEvent::Received(payload) => payload,
            TransportEvent::Closed(e) => {
                closed = Some(e);
                break;
            }
        };

        let messages = match protocol.decode_all(&payload) {
            Ok(messages) => messages,
            Err(e) => {
                log::error!("[ClientConnection] Error receiving message: {}", e);
                continue;
            }
        };

        for message in messages {
            match message {
                Ok(message) => {
                    log::trace!("[ClientConnection] Raising Received event.");
                    deliver(&shared, &received, message).await;
                }
                Err(e) => log::warn!("[ClientConnection] Could not read message: {}", e),
            }
        }
    }
    log::trace!("[ClientConnection] Ending receive loop.");

    let error = closed.unwrap_or_else(|| {
        log::debug!("[ClientConnection] Event channel ended without a Closed event.");
        transport.close_error()
    });

    *shared.gate.write().await = SendGate::Closed;
    log::debug!("[ClientConnection] Draining event queue.");
    drop(received);
    shared.raise_closed(error);
}

/// Queue `message` on the received stream, waiting for room until `stop` begins.
async fn deliver(shared: &Shared, received: &mpsc::Sender<HubMessage>, message: HubMessage) {
    tokio::select! {
        biased;
        permit = received.reserve() => match permit {
            Ok(permit) => permit.send(message),
            Err(_) => log::debug!("[ClientConnection] Received stream dropped, discarding message."),
        },
        () = shared.stopping.cancelled() => {
            if received.try_send(message).is_err() {
                log::debug!("[ClientConnection] Stopping with a full received stream, discarding message.");
            }
        }
    }
}

/// Append `id=<connection_id>` to the query string of `url`.
fn with_connection_id(url: &str, connection_id: &str) -> Result<String, ConnectError> {
    let mut parsed =
        reqwest::Url::parse(url).map_err(|e| ConnectError::InvalidUrl(format!("{url}: {e}")))?;
    parsed.query_pairs_mut().append_pair("id", connection_id);
    Ok(parsed.to_string())
}
