//! Hubsockets - transport and wire-protocol core for real-time hub connections.
//!
//! A client opens one logical connection to a hub endpoint over the best
//! transport both sides support, and exchanges length-prefixed MessagePack
//! hub messages over it. The server side keeps a registry of live
//! connections and evicts the idle ones.
//!
//! # Architecture
//!
//! ```text
//!  ClientConnection ── negotiate ──> Negotiator (POST {url}/negotiate)
//!        │
//!        ├── TransportSelector ── tries in order ──> WebSocketTransport
//!        │                                           ServerSentEventsTransport
//!        │                                           LongPollingTransport
//!        │
//!        └── MessagePackHubProtocol ── BinaryFramer (varint length prefix)
//!
//!  ConnectionManager ── register / touch / remove / scan ──> Transport::stop
//! ```
//!
//! # Modules
//!
//! - [`framing`] - Varint length-prefix framing
//! - [`protocol`] - Hub messages and their MessagePack encoding
//! - [`transport`] - Transport trait, the three transports and fallback selection
//! - [`connection`] - Client connection with send gating and a single closed event
//! - [`server`] - Server-side connection registry with inactivity eviction
//! - [`negotiate`] - Negotiate request and response
//! - [`http`] - HTTP client seam used by the HTTP-based transports
//! - [`config`] - Configuration loading

pub mod clock;
pub mod config;
pub mod connection;
pub mod constants;
pub mod framing;
pub mod http;
pub mod negotiate;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod ws;

// Re-export commonly used types
pub use config::{ClientConfig, ServerConfig};
pub use connection::{ClientConnection, ConnectError, SendError};
pub use framing::BinaryFramer;
pub use protocol::{HubMessage, MessagePackHubProtocol, ProtocolError};
pub use server::ConnectionManager;
pub use transport::{Transport, TransportError, TransportEvent, TransportKind, TransportState};
