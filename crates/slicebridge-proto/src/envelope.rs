//! Message envelope framing.
//!
//! Engine messages cross the transport as a JSON envelope: a wire type name
//! plus the message payload. Byte-valued fields are base64 within the JSON.
//! One envelope per line when written to a stream.

use serde::{Deserialize, Serialize};

use crate::message::{EngineMessage, SettingListMessage, SliceMessage};
use crate::{SETTING_LIST_MESSAGE_TYPE, SLICE_MESSAGE_TYPE};

/// Framed engine message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Wire type name (e.g. `slicer.proto.Slice`).
    pub message_type: String,

    /// Message body as JSON.
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Frame an engine message.
    pub fn from_message(message: &EngineMessage) -> Result<Self, ProtoError> {
        let payload = match message {
            EngineMessage::SettingList(m) => serde_json::to_value(m)?,
            EngineMessage::Slice(m) => serde_json::to_value(m)?,
        };
        Ok(Self {
            message_type: message.message_type().to_string(),
            payload,
        })
    }

    /// Recover the typed message from the envelope.
    pub fn into_message(self) -> Result<EngineMessage, ProtoError> {
        match self.message_type.as_str() {
            SETTING_LIST_MESSAGE_TYPE => {
                let m: SettingListMessage = serde_json::from_value(self.payload)?;
                Ok(EngineMessage::SettingList(m))
            }
            SLICE_MESSAGE_TYPE => {
                let m: SliceMessage = serde_json::from_value(self.payload)?;
                Ok(EngineMessage::Slice(m))
            }
            other => Err(ProtoError::UnknownMessageType(other.to_string())),
        }
    }

    /// Serialize the envelope to a single JSON line.
    pub fn to_json_line(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Protocol-level errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Serde adapter encoding `Vec<u8>` as a base64 string.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
