//! Client error types.

use std::io;

use thiserror::Error;

/// Client error type.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] quill_core::ProtocolError),

    #[error("Connection refused by broker: reason code {code:#04x}")]
    ConnectionRefused { code: u8 },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Not connected")]
    NotConnected,

    #[error("Packet of {size} bytes exceeds broker maximum of {max}")]
    PacketTooLarge { size: usize, max: u32 },

    #[error("Broker does not support QoS {0}")]
    QosNotSupported(u8),

    #[error("Broker does not support retained messages")]
    RetainNotAvailable,

    #[error("Invalid topic name: {0:?}")]
    InvalidTopic(String),

    #[error("Invalid topic filter: {0:?}")]
    InvalidFilter(String),

    #[error("All packet identifiers are in use")]
    IdentifiersExhausted,

    #[error("Subscription rejected by broker: reason code {code:#04x}")]
    SubscribeFailed { code: u8 },

    #[error("Publish rejected by broker: reason code {code:#04x}")]
    PublishFailed { code: u8 },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation timed out")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, ClientError>;
