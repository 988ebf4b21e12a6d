//! Handshake frames.
//!
//! Before any hub message flows the client sends
//! `{"protocol":<name>,"version":<n>}` and the server answers with `{}` or
//! `{"error":"..."}`, each terminated by the record separator. The server may
//! append ordinary hub messages to the same payload as its response, so
//! parsing returns whatever follows the handshake record.

use serde::{Deserialize, Serialize};

use super::{text_format, Payload};
use crate::constants::RECORD_SEPARATOR_BYTE;
use crate::error::HubError;

/// First frame sent by the client on every (re)connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Protocol name, e.g. `json`.
    pub protocol: String,
    /// Protocol version.
    pub version: u32,
}

/// The server's answer to a [`HandshakeRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    /// Present when the server refused the handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Minor protocol version the server speaks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minor_version: Option<u32>,
}

/// Encode a handshake request as a framed text record.
pub fn write_request(request: &HandshakeRequest) -> Result<String, HubError> {
    Ok(text_format::write(&serde_json::to_string(request)?))
}

/// Decode the handshake response at the start of `payload`.
///
/// Returns the response and any data that followed the handshake record.
pub fn parse_response(payload: &Payload) -> Result<(HandshakeResponse, Option<Payload>), HubError> {
    let bytes = payload.as_bytes();
    let Some(end) = bytes.iter().position(|b| *b == RECORD_SEPARATOR_BYTE) else {
        return Err(HubError::InvalidData("Message is incomplete.".to_string()));
    };

    let value: serde_json::Value = serde_json::from_slice(&bytes[..end])?;
    if value.get("type").is_some() {
        return Err(HubError::InvalidData(
            "Expected a handshake response from the server.".to_string(),
        ));
    }
    let response: HandshakeResponse = serde_json::from_value(value)?;

    let rest_start = end + 1;
    let remaining = if rest_start < bytes.len() {
        Some(match payload {
            Payload::Text(text) => Payload::Text(text[rest_start..].to_string()),
            Payload::Binary(data) => Payload::Binary(data.slice(rest_start..)),
        })
    } else {
        None
    };

    Ok((response, remaining))
}
