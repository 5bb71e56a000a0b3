//! Binary wire protocol for the authenticated collaboration transport.
//!
//! Frame layout (bincode-encoded):
//! ```text
//! ┌────────────┬──────────┐
//! │ frame_type │ payload  │
//! │ 1 byte     │ variable │
//! └────────────┴──────────┘
//! ```
//!
//! The handshake runs over the first two frames: the client opens with
//! `Hello { csrf_token }`, the server answers `Welcome` (or `Reject` with a
//! reason). Everything after the handshake is `Event` frames plus the
//! heartbeat pair. Inbound frames that fail to decode are discarded by the
//! transport, never forwarded.

use serde::{Deserialize, Serialize};

use crate::error::CollabError;

/// Frame types for the transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Client credential presentation, first frame after the upgrade
    Hello = 1,
    /// Server connect acknowledgement
    Welcome = 2,
    /// Server handshake rejection with a reason
    Reject = 3,
    /// Named application event
    Event = 4,
    /// Heartbeat ping
    Ping = 5,
    /// Heartbeat pong
    Pong = 6,
}

/// Payload of a `Hello` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HelloPayload {
    pub csrf_token: String,
}

/// Payload of a `Reject` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RejectPayload {
    pub reason: String,
}

/// Payload of an `Event` frame — a named event with an opaque body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventPayload {
    pub name: String,
    pub data: Vec<u8>,
}

/// Top-level protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
}

impl WireFrame {
    /// Create a `Hello` frame carrying the credential token.
    pub fn hello(csrf_token: impl Into<String>) -> Self {
        let payload = HelloPayload {
            csrf_token: csrf_token.into(),
        };
        Self {
            frame_type: FrameType::Hello,
            payload: encode_payload(&payload),
        }
    }

    /// Create a `Welcome` acknowledgement frame.
    pub fn welcome() -> Self {
        Self {
            frame_type: FrameType::Welcome,
            payload: Vec::new(),
        }
    }

    /// Create a `Reject` frame with a human-readable reason.
    pub fn reject(reason: impl Into<String>) -> Self {
        let payload = RejectPayload {
            reason: reason.into(),
        };
        Self {
            frame_type: FrameType::Reject,
            payload: encode_payload(&payload),
        }
    }

    /// Create a named `Event` frame.
    pub fn event(name: impl Into<String>, data: Vec<u8>) -> Self {
        let payload = EventPayload {
            name: name.into(),
            data,
        };
        Self {
            frame_type: FrameType::Event,
            payload: encode_payload(&payload),
        }
    }

    /// Create a ping frame.
    pub fn ping() -> Self {
        Self {
            frame_type: FrameType::Ping,
            payload: Vec::new(),
        }
    }

    /// Create a pong frame.
    pub fn pong() -> Self {
        Self {
            frame_type: FrameType::Pong,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, CollabError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CollabError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, CollabError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CollabError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }

    /// Parse a `Hello` payload.
    pub fn hello_payload(&self) -> Result<HelloPayload, CollabError> {
        if self.frame_type != FrameType::Hello {
            return Err(CollabError::DeserializationError(
                "not a Hello frame".to_string(),
            ));
        }
        decode_payload(&self.payload)
    }

    /// Parse a `Reject` reason.
    pub fn reject_reason(&self) -> Result<String, CollabError> {
        if self.frame_type != FrameType::Reject {
            return Err(CollabError::DeserializationError(
                "not a Reject frame".to_string(),
            ));
        }
        let payload: RejectPayload = decode_payload(&self.payload)?;
        Ok(payload.reason)
    }

    /// Parse an `Event` payload.
    pub fn event_payload(&self) -> Result<EventPayload, CollabError> {
        if self.frame_type != FrameType::Event {
            return Err(CollabError::DeserializationError(
                "not an Event frame".to_string(),
            ));
        }
        decode_payload(&self.payload)
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).unwrap_or_default()
}

fn decode_payload<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, CollabError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| CollabError::DeserializationError(e.to_string()))?;
    Ok(value)
}
