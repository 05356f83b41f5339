//! Message encoding and decoding for network transport.
//!
//! # Wire Format
//!
//! ```text
//! [version: u8][payload: bincode-encoded ConsensusMessage]
//! ```

use crate::message::ConsensusMessage;
use thiserror::Error;

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown wire version: {0}")]
    UnknownVersion(u8),

    #[error("message too short")]
    MessageTooShort,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),
}

/// Encode a message to wire format.
pub fn encode_message(message: &ConsensusMessage) -> Result<Vec<u8>, CodecError> {
    let payload = bincode::serialize(message).map_err(|e| CodecError::Encode(e.to_string()))?;
    let mut bytes = Vec::with_capacity(1 + payload.len());
    bytes.push(WIRE_VERSION);
    bytes.extend(payload);
    Ok(bytes)
}

/// Decode a message from wire format.
pub fn decode_message(data: &[u8]) -> Result<ConsensusMessage, CodecError> {
    let (&version, payload) = data.split_first().ok_or(CodecError::MessageTooShort)?;
    if version != WIRE_VERSION {
        return Err(CodecError::UnknownVersion(version));
    }
    bincode::deserialize(payload).map_err(|e| CodecError::Decode(e.to_string()))
}
