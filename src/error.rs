//! Error type shared by every layer of the hub client.
//!
//! Transport plumbing works in `anyhow::Result` internally and is folded into
//! [`HubError::Transport`] at the [`Transport`](crate::transport::Transport)
//! boundary, so callers only ever match on this enum.

/// Errors that can occur while talking to a hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// The API was used against the wrong connection state.
    InvalidOperation(String),
    /// The underlying connection went away while the operation was pending.
    ConnectionAborted(String),
    /// The codec asked for a handshake version this client does not speak.
    UnsupportedHandshakeVersion(u32),
    /// The server rejected the handshake.
    HandshakeError(String),
    /// A wire message was malformed or did not match the registered handler.
    InvalidData(String),
    /// The hub method completed with an error.
    Invocation(String),
    /// Connecting, sending or negotiating over the network failed.
    Transport(String),
    /// An operation did not finish in time.
    Timeout(String),
}

impl HubError {
    /// Default error used when a connection dies without a specific cause.
    pub(crate) fn aborted() -> Self {
        Self::ConnectionAborted("The underlying connection was closed.".to_string())
    }

    /// Fold an `anyhow` chain from the transport plumbing into a `Transport` error.
    pub(crate) fn transport(err: &anyhow::Error) -> Self {
        Self::Transport(format!("{err:#}"))
    }
}

impl std::fmt::Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidOperation(msg) => write!(f, "Invalid operation: {msg}"),
            Self::ConnectionAborted(msg) => write!(f, "Connection aborted: {msg}"),
            Self::UnsupportedHandshakeVersion(version) => {
                write!(f, "Unsupported handshake version: {version}")
            }
            Self::HandshakeError(msg) => write!(f, "Handshake failed: {msg}"),
            Self::InvalidData(msg) => write!(f, "Invalid data: {msg}"),
            Self::Invocation(msg) => write!(f, "Invocation failed: {msg}"),
            Self::Transport(msg) => write!(f, "Transport error: {msg}"),
            Self::Timeout(msg) => write!(f, "Operation timed out: {msg}"),
        }
    }
}

impl std::error::Error for HubError {}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidData(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_server_message() {
        let err = HubError::HandshakeError("protocol not supported".to_string());
        assert_eq!(err.to_string(), "Handshake failed: protocol not supported");
    }

    #[test]
    fn test_transport_keeps_context_chain() {
        let source = anyhow::anyhow!("connection refused").context("WebSocket connect failed");
        let err = HubError::transport(&source);
        assert_eq!(
            err,
            HubError::Transport("WebSocket connect failed: connection refused".to_string())
        );
    }

    #[test]
    fn test_json_errors_become_invalid_data() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: HubError = parse.unwrap_err().into();
        assert!(matches!(err, HubError::InvalidData(_)));
    }
}
