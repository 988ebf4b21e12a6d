//! Hub wire protocol.
//!
//! The protocol layer turns transport payloads into [`HubMessage`] values and
//! back. It is split into:
//!
//! - [`text_format`] - record-separator framing shared by text protocols
//! - [`handshake`] - the one-off negotiation frames exchanged before messages
//! - [`messages`] - the typed hub messages
//! - [`json`] - the JSON hub protocol codec
//!
//! A codec implements [`HubProtocol`]. Decoding an invocation consults an
//! [`InvocationBinder`] (normally the connection's handler registry) so that
//! argument counts can be checked against what the target handler declared.

pub mod handshake;
pub mod json;
pub mod messages;
pub mod text_format;

use bytes::Bytes;

use crate::error::HubError;

pub use handshake::{HandshakeRequest, HandshakeResponse};
pub use json::JsonHubProtocol;
pub use messages::{
    AckMessage, CancelInvocationMessage, CloseMessage, CompletionMessage, Headers, HubMessage,
    InvocationMessage, SequenceMessage, StreamInvocationMessage, StreamItemMessage,
};

/// Whether a transport carries text or binary frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferFormat {
    /// UTF-8 text frames.
    Text,
    /// Raw binary frames.
    Binary,
}

impl TransferFormat {
    /// Name used for this format in negotiate responses.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "Text",
            Self::Binary => "Binary",
        }
    }
}

impl std::fmt::Display for TransferFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single frame as handed to or received from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Text frame.
    Text(String),
    /// Binary frame.
    Binary(Bytes),
}

impl Payload {
    /// Size of the payload in bytes (UTF-8 length for text).
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
        }
    }

    /// Whether the payload carries no bytes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the text content, if this is a text frame.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    /// Raw bytes of the payload regardless of frame kind.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(data) => data,
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(data))
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Self::Binary(data)
    }
}

/// Source of the argument counts registered client methods expect.
pub trait InvocationBinder {
    /// Number of arguments the handler for `target` declared, or `None` when
    /// no handler with a fixed arity is registered for it.
    fn parameter_count(&self, target: &str) -> Option<usize>;
}

/// A hub wire codec.
pub trait HubProtocol: Send + Sync + std::fmt::Debug {
    /// Protocol name announced in the handshake.
    fn name(&self) -> &str;

    /// Protocol version announced in the handshake.
    fn version(&self) -> u32;

    /// Frame kind the protocol needs from the transport.
    fn transfer_format(&self) -> TransferFormat;

    /// Decode every message contained in `input`.
    ///
    /// Unknown message types are skipped.
    fn parse_messages(
        &self,
        input: &Payload,
        binder: &dyn InvocationBinder,
    ) -> Result<Vec<HubMessage>, HubError>;

    /// Encode one message into a transport payload.
    fn write_message(&self, message: &HubMessage) -> Result<Payload, HubError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_len_counts_utf8_bytes() {
        assert_eq!(Payload::from("héllo").len(), 6);
        assert_eq!(Payload::from(vec![1u8, 2, 3]).len(), 3);
        assert!(Payload::from("").is_empty());
    }

    #[test]
    fn test_payload_as_text() {
        assert_eq!(Payload::from("abc").as_text(), Some("abc"));
        assert_eq!(Payload::from(vec![0u8]).as_text(), None);
    }

    #[test]
    fn test_transfer_format_names() {
        assert_eq!(TransferFormat::Text.to_string(), "Text");
        assert_eq!(TransferFormat::Binary.as_str(), "Binary");
    }
}
