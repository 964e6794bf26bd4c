//! Stream Codec Module
//!
//! JSON encoding and decoding for the market data wire protocol.
//!
//! Decoding is tag-first: the `type` field is inspected before any payload
//! deserialization, so a frame with an unknown tag is rejected with
//! [`CodecError::UnknownMessageType`] without touching its payload. Unknown
//! tags are recoverable (logged and dropped by the caller), keeping the
//! message set closed without making protocol evolution fatal.

use serde_json::json;

use super::messages::{
    ChainUpdatePayload, ErrorPayload, HeartbeatPayload, PriceUpdatePayload, SubscriptionRequest,
    WireMessage,
};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// The `type` tag is not in the closed message set.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// Frame shape is not a tagged JSON object.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// JSON codec for the stream protocol.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode one text frame into a [`WireMessage`].
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a JSON object, lacks a `type`
    /// tag, carries an unknown tag, or its payload does not match the tag's
    /// schema.
    pub fn decode(&self, text: &str) -> Result<WireMessage, CodecError> {
        let value: serde_json::Value = serde_json::from_str(text)?;

        let Some(tag) = value.get("type").and_then(|v| v.as_str()) else {
            let preview: String = text.chars().take(50).collect();
            return Err(CodecError::InvalidFormat(format!(
                "missing type tag: {preview}..."
            )));
        };

        match tag {
            "subscribe" => {
                let request: SubscriptionRequest = serde_json::from_value(value)?;
                Ok(WireMessage::Subscribe(request))
            }
            "unsubscribe" => {
                let request: SubscriptionRequest = serde_json::from_value(value)?;
                Ok(WireMessage::Unsubscribe(request))
            }
            "price_update" => {
                let payload: PriceUpdatePayload = Self::take_data(value)?;
                Ok(WireMessage::PriceUpdate(payload))
            }
            "option_chain_update" => {
                let payload: ChainUpdatePayload = Self::take_data(value)?;
                Ok(WireMessage::ChainUpdate(payload))
            }
            "heartbeat" => {
                let payload = Self::heartbeat_payload(&value)?;
                Ok(WireMessage::Heartbeat(payload))
            }
            "heartbeat_response" => {
                let payload = Self::heartbeat_payload(&value)?;
                Ok(WireMessage::HeartbeatAck(payload))
            }
            "error" => {
                let payload: ErrorPayload = Self::take_data(value)?;
                Ok(WireMessage::Error(payload))
            }
            "subscription_confirmed" => {
                let data = value.get("data").cloned().unwrap_or(serde_json::Value::Null);
                Ok(WireMessage::SubscriptionAck(data))
            }
            "subscription_error" => {
                let payload: ErrorPayload = Self::take_data(value)?;
                Ok(WireMessage::SubscriptionError(payload))
            }
            other => Err(CodecError::UnknownMessageType(other.to_string())),
        }
    }

    /// Encode a [`WireMessage`] to one text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode(&self, message: &WireMessage) -> Result<String, CodecError> {
        let value = match message {
            WireMessage::Subscribe(request) | WireMessage::Unsubscribe(request) => {
                let mut body = serde_json::to_value(request)?;
                if let Some(map) = body.as_object_mut() {
                    map.insert("type".to_string(), json!(message.tag()));
                }
                body
            }
            WireMessage::Heartbeat(payload) | WireMessage::HeartbeatAck(payload) => {
                json!({ "type": message.tag(), "timestamp": payload.timestamp })
            }
            WireMessage::PriceUpdate(payload) => {
                json!({ "type": message.tag(), "data": payload })
            }
            WireMessage::ChainUpdate(payload) => {
                json!({ "type": message.tag(), "data": payload })
            }
            WireMessage::Error(payload) | WireMessage::SubscriptionError(payload) => {
                json!({ "type": message.tag(), "data": payload })
            }
            WireMessage::SubscriptionAck(data) => {
                json!({ "type": message.tag(), "data": data })
            }
        };

        Ok(serde_json::to_string(&value)?)
    }

    /// Deserialize the `data` payload of an inbound event.
    fn take_data<T: serde::de::DeserializeOwned>(
        mut value: serde_json::Value,
    ) -> Result<T, CodecError> {
        let data = value
            .get_mut("data")
            .map(serde_json::Value::take)
            .ok_or_else(|| CodecError::InvalidFormat("missing data payload".to_string()))?;
        Ok(serde_json::from_value(data)?)
    }

    /// Heartbeats carry their timestamp either at the top level (outbound
    /// form) or under `data` (inbound form); accept both.
    fn heartbeat_payload(value: &serde_json::Value) -> Result<HeartbeatPayload, CodecError> {
        let source = value
            .get("data")
            .filter(|d| d.get("timestamp").is_some())
            .unwrap_or(value);
        Ok(serde_json::from_value(source.clone())?)
    }
}
