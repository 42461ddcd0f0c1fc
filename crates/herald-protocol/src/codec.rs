//! Codec for encoding and decoding Herald frames.
//!
//! Client frames are JSON text. Replication frames travelling between server
//! processes are MessagePack.

use bytes::Bytes;
use thiserror::Error;

use crate::messages::PusherMessage;
use crate::replication::ReplicationFrame;

/// Default maximum size of a client frame (10 KiB, the Pusher limit).
pub const MAX_FRAME_SIZE: usize = 10 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode a message to its JSON text form.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(message: &PusherMessage) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a client frame.
///
/// # Errors
///
/// Returns an error if the frame is not a JSON object with an `event` field.
pub fn decode(text: &str) -> Result<PusherMessage, ProtocolError> {
    decode_with_limit(text, MAX_FRAME_SIZE)
}

/// Decode a client frame, rejecting frames larger than `max_size` bytes.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_with_limit(text: &str, max_size: usize) -> Result<PusherMessage, ProtocolError> {
    if text.len() > max_size {
        return Err(ProtocolError::FrameTooLarge {
            size: text.len(),
            max: max_size,
        });
    }

    let message: PusherMessage = serde_json::from_str(text)?;
    if message.event.is_empty() {
        return Err(ProtocolError::Invalid("Event name cannot be empty".into()));
    }
    Ok(message)
}

/// Encode a replication frame for the bus.
///
/// # Errors
///
/// Returns an error if encoding fails.
pub fn encode_replication(frame: &ReplicationFrame) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(rmp_serde::to_vec_named(frame)?))
}

/// Decode a replication frame received from the bus.
///
/// # Errors
///
/// Returns an error if the payload is not a valid frame.
pub fn decode_replication(data: &[u8]) -> Result<ReplicationFrame, ProtocolError> {
    Ok(rmp_serde::from_slice(data)?)
}
