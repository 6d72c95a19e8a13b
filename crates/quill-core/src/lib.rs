//! quill-core - MQTT protocol types and codec.
//!
//! This crate provides the protocol-level building blocks shared by the
//! client crate: packet encoding/decoding for MQTT 3.1.1 and 5.0, variable
//! byte integer handling, and topic name/filter validation and matching.
//! It performs no I/O.

pub mod error;
pub mod packet;
pub mod topic;
pub mod varint;

pub use error::{ProtocolError, Result};
pub use packet::*;
