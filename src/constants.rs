//! Default limits and durations for hubsockets.
//!
//! This module centralizes the magic numbers used across transports, the
//! client connection and the server-side connection manager. Every value here
//! is only a default: [`crate::config`] lets callers override them.
//!
//! # Categories
//!
//! - **Framing**: message size limits
//! - **Timeouts**: negotiation, polling, shutdown and inactivity
//! - **Queues**: channel capacities between loops and the application

use std::time::Duration;

// ============================================================================
// Framing
// ============================================================================

/// Maximum payload size accepted from a length prefix (16 MB).
///
/// A length prefix declaring more than this is rejected before any buffer is
/// allocated for it.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Largest HTTP response body read into memory (64 MB).
///
/// A long-poll response may batch several frames, so this sits above
/// [`MAX_MESSAGE_SIZE`].
pub const MAX_RESPONSE_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Longest length prefix, in bytes, the framing format allows.
///
/// Five 7-bit groups cover every length up to 2^35 - 1, far above any sane
/// message size limit.
pub const MAX_LENGTH_PREFIX_BYTES: usize = 5;

// ============================================================================
// Timeouts
// ============================================================================

/// Timeout for the negotiate request issued before transport selection.
pub const NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-candidate timeout for `Transport::start` during transport selection.
///
/// Exceeding it is a start failure for that candidate only.
pub const TRANSPORT_START_TIMEOUT: Duration = Duration::from_secs(15);

/// Server-side hold time of a single long-poll request.
///
/// The client request timeout is this plus [`POLL_TIMEOUT_SLACK`], so a
/// healthy server always answers before the client gives up.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(100);

/// Extra time granted to a poll request on top of [`POLL_TIMEOUT`].
pub const POLL_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

/// Consecutive transient poll failures tolerated before the transport fails.
pub const MAX_POLL_RETRIES: u32 = 5;

/// Base delay between poll retries. Multiplied by the attempt number.
pub const POLL_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// How long `Transport::stop` waits for the loops to exit before aborting them.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Idle time after which the server evicts a connection.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Interval between two inactivity scans of the connection registry.
pub const SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on disposing a single stale connection during a scan.
pub const DISPOSE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Queues
// ============================================================================

/// Capacity of a transport's outbound queue.
///
/// `Transport::send` waits for room once the send loop falls this far behind.
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// Capacity of the event queue between a transport and its owner.
pub const RECEIVE_QUEUE_CAPACITY: usize = 256;

// ============================================================================
// WebSocket
// ============================================================================

/// WebSocket close code for a normal closure.
pub const NORMAL_CLOSURE: u16 = 1000;

/// WebSocket close code reported when the peer sent no status.
pub const NO_STATUS_RECEIVED: u16 = 1005;
