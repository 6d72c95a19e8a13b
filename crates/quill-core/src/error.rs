//! Protocol error types.

use thiserror::Error;

/// MQTT protocol errors.
///
/// Every variant maps to a situation that is either malformed on the wire or
/// violates a negotiated limit. The client treats any of these coming from
/// broker data as fatal to the connection.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("invalid remaining length encoding")]
    InvalidRemainingLength,

    #[error("incomplete packet: need {needed} bytes, have {have}")]
    IncompletePacket { needed: usize, have: usize },

    #[error("invalid protocol name: expected 'MQTT', got '{0}'")]
    InvalidProtocolName(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(u8),

    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    #[error("invalid QoS value: {0}")]
    InvalidQoS(u8),

    #[error("{packet} fixed header flags must be {expected:#04x}, got {flags:#04x}")]
    InvalidFlags {
        packet: &'static str,
        expected: u8,
        flags: u8,
    },

    #[error("unknown {context} property: {id:#04x}")]
    UnknownProperty { context: &'static str, id: u32 },

    #[error("packet of {size} bytes exceeds maximum of {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("malformed packet: {0}")]
    MalformedPacket(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
