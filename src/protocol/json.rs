//! JSON hub protocol.
//!
//! Each message is a JSON object with an integer `type` discriminator,
//! terminated by the record separator. Several messages may share a payload.

use serde_json::{Map, Value};

use super::messages::message_type;
use super::{
    text_format, HubMessage, HubProtocol, InvocationBinder, InvocationMessage, Payload,
    TransferFormat,
};
use crate::constants::{JSON_PROTOCOL_NAME, SUPPORTED_HANDSHAKE_VERSION};
use crate::error::HubError;

/// The JSON hub protocol codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonHubProtocol;

impl JsonHubProtocol {
    /// Create the codec.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn decode_record(
        record: &str,
        binder: &dyn InvocationBinder,
    ) -> Result<Option<HubMessage>, HubError> {
        let value: Value = serde_json::from_str(record)?;
        let Some(kind) = value.get("type").and_then(Value::as_u64) else {
            return Err(HubError::InvalidData(
                "Invalid payload: missing integer 'type' field.".to_string(),
            ));
        };

        let message = match kind {
            message_type::INVOCATION => HubMessage::Invocation(decode_invocation(value, binder)?),
            message_type::STREAM_ITEM => HubMessage::StreamItem(serde_json::from_value(value)?),
            message_type::COMPLETION => HubMessage::Completion(serde_json::from_value(value)?),
            message_type::STREAM_INVOCATION => {
                HubMessage::StreamInvocation(serde_json::from_value(value)?)
            }
            message_type::CANCEL_INVOCATION => {
                HubMessage::CancelInvocation(serde_json::from_value(value)?)
            }
            message_type::PING => HubMessage::Ping,
            message_type::CLOSE => HubMessage::Close(serde_json::from_value(value)?),
            message_type::ACK => HubMessage::Ack(serde_json::from_value(value)?),
            message_type::SEQUENCE => HubMessage::Sequence(serde_json::from_value(value)?),
            other => {
                log::debug!("[JsonHubProtocol] Skipping unknown message type {}", other);
                return Ok(None);
            }
        };
        Ok(Some(message))
    }
}

/// Decode an invocation, checking its argument count against the binder.
fn decode_invocation(
    value: Value,
    binder: &dyn InvocationBinder,
) -> Result<InvocationMessage, HubError> {
    if !value.get("target").is_some_and(Value::is_string) {
        return Err(HubError::InvalidData(
            "'target' not found in JSON object for InvocationMessage.".to_string(),
        ));
    }

    let message: InvocationMessage = serde_json::from_value(value)?;
    if let Some(expected) = binder.parameter_count(&message.target) {
        if message.arguments.len() != expected {
            return Err(HubError::InvalidData(format!(
                "Invocation provides {} argument(s) but target expects {}.",
                message.arguments.len(),
                expected
            )));
        }
    }
    Ok(message)
}

impl HubProtocol for JsonHubProtocol {
    fn name(&self) -> &str {
        JSON_PROTOCOL_NAME
    }

    fn version(&self) -> u32 {
        SUPPORTED_HANDSHAKE_VERSION
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Text
    }

    fn parse_messages(
        &self,
        input: &Payload,
        binder: &dyn InvocationBinder,
    ) -> Result<Vec<HubMessage>, HubError> {
        let Payload::Text(text) = input else {
            return Err(HubError::InvalidData(
                "Invalid input for JSON hub protocol. Expected a string.".to_string(),
            ));
        };
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let mut messages = Vec::new();
        for record in text_format::parse(text)? {
            if let Some(message) = Self::decode_record(record, binder)? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    fn write_message(&self, message: &HubMessage) -> Result<Payload, HubError> {
        let mut value = match message {
            HubMessage::Invocation(m) => serde_json::to_value(m)?,
            HubMessage::StreamItem(m) => serde_json::to_value(m)?,
            HubMessage::Completion(m) => serde_json::to_value(m)?,
            HubMessage::StreamInvocation(m) => serde_json::to_value(m)?,
            HubMessage::CancelInvocation(m) => serde_json::to_value(m)?,
            HubMessage::Ping => Value::Object(Map::new()),
            HubMessage::Close(m) => serde_json::to_value(m)?,
            HubMessage::Ack(m) => serde_json::to_value(m)?,
            HubMessage::Sequence(m) => serde_json::to_value(m)?,
        };
        let Value::Object(fields) = &mut value else {
            return Err(HubError::InvalidData(
                "Hub message did not serialize to a JSON object.".to_string(),
            ));
        };
        fields.insert("type".to_string(), Value::from(message.message_type()));

        Ok(Payload::Text(text_format::write(&serde_json::to_string(&value)?)))
    }
}
