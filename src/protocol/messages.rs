//! Typed hub messages.
//!
//! Field names follow the wire (camelCase). The integer `type` discriminator is
//! not part of these structs; the codec adds and strips it.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Integer discriminators of the hub message kinds.
pub mod message_type {
    /// Server or client calls a method on the other side.
    pub const INVOCATION: u64 = 1;
    /// One item of a streaming result.
    pub const STREAM_ITEM: u64 = 2;
    /// Final result (or error) of an invocation or stream.
    pub const COMPLETION: u64 = 3;
    /// Invocation whose result is a stream.
    pub const STREAM_INVOCATION: u64 = 4;
    /// Cancels a running stream.
    pub const CANCEL_INVOCATION: u64 = 5;
    /// Keep-alive.
    pub const PING: u64 = 6;
    /// The server is closing the connection.
    pub const CLOSE: u64 = 7;
    /// Acknowledges buffered messages up to a sequence id.
    pub const ACK: u64 = 8;
    /// Announces the sequence id of the next replayed message.
    pub const SEQUENCE: u64 = 9;
}

/// Header map carried by invocation-class messages.
pub type Headers = BTreeMap<String, String>;

/// Call of a named method on the other side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationMessage {
    /// Set when the caller expects a completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    /// Method name.
    pub target: String,
    /// Positional arguments.
    #[serde(default)]
    pub arguments: Vec<Value>,
    /// Ids of client-to-server streams passed as arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_ids: Option<Vec<String>>,
    /// Optional message headers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
}

/// One item produced by a streaming invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamItemMessage {
    /// Stream the item belongs to.
    pub invocation_id: String,
    /// The item value.
    #[serde(default)]
    pub item: Value,
    /// Optional message headers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
}

/// Result of an invocation or the end of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionMessage {
    /// Invocation being completed.
    pub invocation_id: String,
    /// Result value. `Some(Value::Null)` is an explicit `null`, `None` means
    /// the method returned nothing.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    /// Error reported by the method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Optional message headers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
}

/// Invocation whose result is delivered as a stream of items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInvocationMessage {
    /// Stream id; items and the completion carry it.
    pub invocation_id: String,
    /// Method name.
    pub target: String,
    /// Positional arguments.
    #[serde(default)]
    pub arguments: Vec<Value>,
    /// Ids of client-to-server streams passed as arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_ids: Option<Vec<String>>,
    /// Optional message headers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
}

/// Request to stop a running stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelInvocationMessage {
    /// Stream to cancel.
    pub invocation_id: String,
    /// Optional message headers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
}

/// Sent by the server right before it closes the connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseMessage {
    /// Why the server is closing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether the client may reconnect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_reconnect: Option<bool>,
}

/// Acknowledges every buffered message up to `sequence_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckMessage {
    /// Highest acknowledged sequence id.
    pub sequence_id: i64,
}

/// Announces the id of the next message after a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceMessage {
    /// Id of the first message that follows.
    pub sequence_id: i64,
}

/// Every message kind of the hub protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// `type: 1`
    Invocation(InvocationMessage),
    /// `type: 2`
    StreamItem(StreamItemMessage),
    /// `type: 3`
    Completion(CompletionMessage),
    /// `type: 4`
    StreamInvocation(StreamInvocationMessage),
    /// `type: 5`
    CancelInvocation(CancelInvocationMessage),
    /// `type: 6`
    Ping,
    /// `type: 7`
    Close(CloseMessage),
    /// `type: 8`
    Ack(AckMessage),
    /// `type: 9`
    Sequence(SequenceMessage),
}

impl HubMessage {
    /// Wire discriminator of this message.
    #[must_use]
    pub fn message_type(&self) -> u64 {
        match self {
            Self::Invocation(_) => message_type::INVOCATION,
            Self::StreamItem(_) => message_type::STREAM_ITEM,
            Self::Completion(_) => message_type::COMPLETION,
            Self::StreamInvocation(_) => message_type::STREAM_INVOCATION,
            Self::CancelInvocation(_) => message_type::CANCEL_INVOCATION,
            Self::Ping => message_type::PING,
            Self::Close(_) => message_type::CLOSE,
            Self::Ack(_) => message_type::ACK,
            Self::Sequence(_) => message_type::SEQUENCE,
        }
    }

    /// Whether the message takes part in sequencing (buffered, acknowledged and
    /// replayed). Pings, closes and the sequencing messages themselves do not.
    #[must_use]
    pub fn is_sequenced(&self) -> bool {
        matches!(
            self,
            Self::Invocation(_)
                | Self::StreamItem(_)
                | Self::Completion(_)
                | Self::StreamInvocation(_)
                | Self::CancelInvocation(_)
        )
    }
}

/// Maps a present JSON `null` to `Some(Value::Null)` instead of `None`.
fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}
