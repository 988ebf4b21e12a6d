//! Protocol and connection constants for hubrpc.
//!
//! This module centralizes the magic numbers of the hub protocol and the
//! default connection tuning so they can be found in one place. Constants are
//! grouped by domain.
//!
//! # Categories
//!
//! - **Wire format**: framing bytes and protocol identifiers
//! - **Timeouts**: liveness and handshake bounds
//! - **Buffering**: outbound backpressure budget
//! - **HTTP**: negotiation and polling parameters

use std::time::Duration;

// ============================================================================
// Wire format
// ============================================================================

/// Record separator terminating every text frame (ASCII 0x1E).
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Record separator as a raw byte, for binary payloads.
pub const RECORD_SEPARATOR_BYTE: u8 = 0x1e;

/// The only handshake version this client speaks.
pub const SUPPORTED_HANDSHAKE_VERSION: u32 = 0;

/// Name announced in the handshake for the JSON hub protocol.
pub const JSON_PROTOCOL_NAME: &str = "json";

// ============================================================================
// Timeouts
// ============================================================================

/// How long the server may stay silent before the connection is considered dead.
///
/// Must be comfortably larger than the server's own keep-alive interval
/// (15 seconds by default on the hub side).
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the client pings when it has nothing else to send.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Upper bound on waiting for the handshake response.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// How long `stop` waits for already-buffered messages to go out.
pub const STOP_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Tick of the per-connection liveness loop (timeouts, pings, acks).
pub const LIVENESS_TICK: Duration = Duration::from_secs(1);

// ============================================================================
// Buffering
// ============================================================================

/// Byte budget of the outbound message buffer before producers are suspended.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 100_000;

// ============================================================================
// HTTP
// ============================================================================

/// Negotiate protocol version requested from the server.
pub const NEGOTIATE_VERSION: u32 = 1;

/// Maximum number of negotiate redirects followed before giving up.
pub const MAX_NEGOTIATE_REDIRECTS: usize = 100;

/// Per-request timeout of a long poll; the server answers well before this.
pub const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(100);

/// Timeout for negotiate, send and delete requests.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Query parameter carrying the access token on WebSocket connects.
pub const ACCESS_TOKEN_QUERY_PARAM: &str = "access_token";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_timeout_exceeds_keep_alive() {
        assert!(DEFAULT_SERVER_TIMEOUT > DEFAULT_KEEP_ALIVE_INTERVAL);
    }

    #[test]
    fn test_record_separator_forms_agree() {
        assert_eq!(RECORD_SEPARATOR as u32, u32::from(RECORD_SEPARATOR_BYTE));
    }
}
