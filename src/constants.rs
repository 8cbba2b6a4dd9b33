//! Protocol and timing constants.
//!
//! Timing defaults mirror the usual SignalR client defaults so that a hub
//! server configured with stock settings neither drops us for silence nor
//! gets dropped by us.

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// Upper bound on the protocol handshake after the socket opens.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Interval between client keep-alive pings.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Silence after which the server is considered gone.
///
/// Should be at least twice the server's own keep-alive interval.
pub const SERVER_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP timeout for the negotiate request.
pub const NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Reconnection
// ============================================================================

/// Delays before each automatic reconnect attempt. Reconnection gives up
/// after the last one.
pub const DEFAULT_RECONNECT_DELAYS: [Duration; 4] = [
    Duration::from_secs(0),
    Duration::from_secs(2),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

// ============================================================================
// Protocol
// ============================================================================

/// Terminator appended to every JSON hub protocol record.
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Hub protocol name sent in the handshake.
pub const PROTOCOL_NAME: &str = "json";

/// Hub protocol version sent in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Negotiate protocol version requested from the server.
pub const NEGOTIATE_VERSION: u32 = 1;

/// Maximum negotiate redirects followed before giving up.
pub const MAX_NEGOTIATE_REDIRECTS: usize = 100;
