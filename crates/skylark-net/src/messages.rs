//! Wire message types and payload serialization.
//!
//! The frame layer carries a `u16` message kind next to every payload, so
//! there is no top-level message enum; each kind constant in [`kind`] maps
//! to one payload struct here. Payloads are serialized with [`postcard`]
//! and prefixed with a protocol version byte. Use [`encode_payload`] and
//! [`decode_payload`] for encoding and decoding.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current wire-protocol version. Prepended to every serialized payload.
pub const PROTOCOL_VERSION: u8 = 1;

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

/// Message kind constants carried in the frame header.
///
/// Handlers register against these values. Kinds below `0x0010` are
/// reserved for connection upkeep.
pub mod kind {
    /// Heartbeat ping, client to server.
    pub const PING: u16 = 0x0001;
    /// Heartbeat pong, server to client. Echoes the ping timestamp.
    pub const PONG: u16 = 0x0002;
    /// Entity state snapshot, server to client.
    pub const ENTITY_SNAPSHOT: u16 = 0x0010;
    /// Server acknowledgement of client movement up to a tick.
    pub const MOVE_ACK: u16 = 0x0011;
    /// Scheduled world event, server to client.
    pub const WORLD_EVENT: u16 = 0x0020;
}

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// Heartbeat ping sent by the client on a fixed cadence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ping {
    /// Client monotonic time in milliseconds at send.
    pub client_time_ms: u64,
    /// Monotonically increasing ping sequence number.
    pub sequence: u32,
}

/// Heartbeat pong returned by the server.
///
/// Echoes `client_time_ms` so the receiver can compute round-trip time
/// without any shared clock, and carries the server tick for clock
/// synchronization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pong {
    /// Echoed client timestamp from the matching [`Ping`].
    pub client_time_ms: u64,
    /// Server wall time in milliseconds, informational.
    pub server_time_ms: u64,
    /// Server simulation tick when the pong was sent.
    pub server_tick: u64,
    /// Echoed ping sequence number.
    pub sequence: u32,
}

/// Authoritative state of one remote entity at a server tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitySnapshot {
    /// Entity this snapshot describes.
    pub entity_id: u64,
    /// Server tick the state was captured at.
    pub tick: u64,
    /// World position.
    pub position: [f32; 3],
    /// Facing angle in radians.
    pub yaw: f32,
    /// Unit movement direction, zero when stationary.
    pub direction: [f32; 3],
    /// Movement speed in world units per second.
    pub speed: f32,
}

/// Server verdict on client movement up to and including a tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MoveAck {
    /// Last tick the server has judged.
    pub tick: u64,
    /// Whether the client's reported movement was accepted.
    pub valid: bool,
}

/// A world event scheduled for execution at a future tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorldEvent {
    /// Tick at which the event takes effect.
    pub tick: u64,
    /// Application-defined event discriminant.
    pub event_kind: u16,
    /// Opaque event body, interpreted by the consumer.
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from payload serialization or deserialization.
#[derive(Debug, Error)]
pub enum MessageError {
    /// The payload was empty, with no room for a version byte.
    #[error("empty payload: missing version byte")]
    EmptyPayload,

    /// The version byte does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Postcard serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Postcard(#[from] postcard::Error),
}

// ---------------------------------------------------------------------------
// Serialization helpers
// ---------------------------------------------------------------------------

/// Serialize a payload struct into a versioned binary payload.
///
/// Wire format: `[version: u8] [postcard-encoded payload]`
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>, MessageError> {
    let body = postcard::to_allocvec(payload)?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Deserialize a versioned binary payload into a payload struct.
///
/// Returns an error if the version is unsupported or the bytes are
/// malformed for the expected type.
pub fn decode_payload<T: DeserializeOwned>(data: &[u8]) -> Result<T, MessageError> {
    if data.is_empty() {
        return Err(MessageError::EmptyPayload);
    }

    let version = data[0];
    if version != PROTOCOL_VERSION {
        return Err(MessageError::UnsupportedVersion(version));
    }

    let payload = postcard::from_bytes(&data[1..])?;
    Ok(payload)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_roundtrip() {
        let ping = Ping {
            client_time_ms: 123_456,
            sequence: 42,
        };
        let bytes = encode_payload(&ping).unwrap();
        let decoded: Ping = decode_payload(&bytes).unwrap();
        assert_eq!(decoded, ping);
    }

    #[test]
    fn test_pong_roundtrip() {
        let pong = Pong {
            client_time_ms: 123_456,
            server_time_ms: 999_000,
            server_tick: 5_000,
            sequence: 42,
        };
        let bytes = encode_payload(&pong).unwrap();
        let decoded: Pong = decode_payload(&bytes).unwrap();
        assert_eq!(decoded, pong);
    }

    #[test]
    fn test_entity_snapshot_roundtrip() {
        let snapshot = EntitySnapshot {
            entity_id: 7,
            tick: 1_200,
            position: [10.5, 64.0, -3.25],
            yaw: 1.57,
            direction: [0.0, 0.0, 1.0],
            speed: 4.2,
        };
        let bytes = encode_payload(&snapshot).unwrap();
        let decoded: EntitySnapshot = decode_payload(&bytes).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn test_world_event_roundtrip() {
        let event = WorldEvent {
            tick: 88,
            event_kind: 3,
            payload: vec![1, 2, 3, 4],
        };
        let bytes = encode_payload(&event).unwrap();
        let decoded: WorldEvent = decode_payload(&bytes).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_version_byte_prepended() {
        let ack = MoveAck {
            tick: 1,
            valid: true,
        };
        let bytes = encode_payload(&ack).unwrap();
        assert_eq!(bytes[0], PROTOCOL_VERSION);
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let ack = MoveAck {
            tick: 1,
            valid: true,
        };
        let mut bytes = encode_payload(&ack).unwrap();
        bytes[0] = 255;
        let result: Result<MoveAck, _> = decode_payload(&bytes);
        assert!(matches!(result, Err(MessageError::UnsupportedVersion(255))));
    }

    #[test]
    fn test_empty_payload_rejected() {
        let result: Result<Ping, _> = decode_payload(&[]);
        assert!(matches!(result, Err(MessageError::EmptyPayload)));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let snapshot = EntitySnapshot {
            entity_id: 7,
            tick: 1_200,
            position: [1.0, 2.0, 3.0],
            yaw: 0.0,
            direction: [1.0, 0.0, 0.0],
            speed: 1.0,
        };
        let bytes = encode_payload(&snapshot).unwrap();
        let result: Result<EntitySnapshot, _> = decode_payload(&bytes[..bytes.len() / 2]);
        assert!(matches!(result, Err(MessageError::Postcard(_))));
    }
}
