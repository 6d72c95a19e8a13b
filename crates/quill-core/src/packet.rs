//! MQTT packet types and codec for MQTT 3.1.1 and MQTT 5.0.
//!
//! Decoding is incremental: [`decode_packet`] consumes a prefix of the
//! caller's buffer and reports `Ok(None)` until a complete packet is
//! available. Encoding is a pure transformation into a byte vector.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::varint;

/// MQTT protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    /// MQTT 3.1.1 (wire value 4).
    #[default]
    V311,
    /// MQTT 5.0 (wire value 5).
    V5,
}

impl ProtocolVersion {
    /// Protocol level byte carried in the CONNECT packet.
    pub fn wire(self) -> u8 {
        match self {
            ProtocolVersion::V311 => 4,
            ProtocolVersion::V5 => 5,
        }
    }

    pub fn is_v5(self) -> bool {
        self == ProtocolVersion::V5
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            4 => Ok(ProtocolVersion::V311),
            5 => Ok(ProtocolVersion::V5),
            other => Err(ProtocolError::UnsupportedProtocolVersion(other)),
        }
    }
}

/// MQTT Control Packet Types (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::ConnAck),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::PubAck),
            5 => Ok(PacketType::PubRec),
            6 => Ok(PacketType::PubRel),
            7 => Ok(PacketType::PubComp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::SubAck),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::UnsubAck),
            12 => Ok(PacketType::PingReq),
            13 => Ok(PacketType::PingResp),
            14 => Ok(PacketType::Disconnect),
            15 => Ok(PacketType::Auth),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(ProtocolError::InvalidQoS(other)),
        }
    }
}

/// MQTT v5 Reason Codes (used in CONNACK, PUBACK, DISCONNECT, AUTH, etc.).
/// Constants rather than an enum since several codes share a numeric value
/// with different meanings depending on the packet they appear in.
pub mod reason_code {
    pub const SUCCESS: u8 = 0x00;
    pub const NORMAL_DISCONNECTION: u8 = 0x00;
    pub const GRANTED_QOS_0: u8 = 0x00;
    pub const GRANTED_QOS_1: u8 = 0x01;
    pub const GRANTED_QOS_2: u8 = 0x02;
    pub const DISCONNECT_WITH_WILL: u8 = 0x04;
    pub const NO_SUBSCRIPTION_EXISTED: u8 = 0x11;
    pub const CONTINUE_AUTHENTICATION: u8 = 0x18;
    pub const RE_AUTHENTICATE: u8 = 0x19;
    pub const UNSPECIFIED_ERROR: u8 = 0x80;
    pub const MALFORMED_PACKET: u8 = 0x81;
    pub const PROTOCOL_ERROR: u8 = 0x82;
    pub const UNSUPPORTED_PROTOCOL_VERSION: u8 = 0x84;
    pub const CLIENT_IDENTIFIER_NOT_VALID: u8 = 0x85;
    pub const BAD_USER_NAME_OR_PASSWORD: u8 = 0x86;
    pub const NOT_AUTHORIZED: u8 = 0x87;
    pub const SERVER_UNAVAILABLE: u8 = 0x88;
    pub const SERVER_BUSY: u8 = 0x89;
    pub const BANNED: u8 = 0x8A;
    pub const SERVER_SHUTTING_DOWN: u8 = 0x8B;
    pub const BAD_AUTHENTICATION_METHOD: u8 = 0x8C;
    pub const KEEP_ALIVE_TIMEOUT: u8 = 0x8D;
    pub const SESSION_TAKEN_OVER: u8 = 0x8E;
    pub const TOPIC_FILTER_INVALID: u8 = 0x8F;
    pub const TOPIC_NAME_INVALID: u8 = 0x90;
    pub const PACKET_IDENTIFIER_IN_USE: u8 = 0x91;
    pub const PACKET_IDENTIFIER_NOT_FOUND: u8 = 0x92;
    pub const PACKET_TOO_LARGE: u8 = 0x95;
    pub const QUOTA_EXCEEDED: u8 = 0x97;
    pub const PAYLOAD_FORMAT_INVALID: u8 = 0x99;
    pub const RETAIN_NOT_SUPPORTED: u8 = 0x9A;
    pub const QOS_NOT_SUPPORTED: u8 = 0x9B;
    pub const USE_ANOTHER_SERVER: u8 = 0x9C;
    pub const SERVER_MOVED: u8 = 0x9D;
    pub const CONNECTION_RATE_EXCEEDED: u8 = 0x9F;
}

// MQTT v5 property identifiers.
mod prop {
    pub const PAYLOAD_FORMAT_INDICATOR: u32 = 0x01;
    pub const MESSAGE_EXPIRY_INTERVAL: u32 = 0x02;
    pub const CONTENT_TYPE: u32 = 0x03;
    pub const RESPONSE_TOPIC: u32 = 0x08;
    pub const CORRELATION_DATA: u32 = 0x09;
    pub const SUBSCRIPTION_IDENTIFIER: u32 = 0x0B;
    pub const SESSION_EXPIRY_INTERVAL: u32 = 0x11;
    pub const ASSIGNED_CLIENT_IDENTIFIER: u32 = 0x12;
    pub const SERVER_KEEP_ALIVE: u32 = 0x13;
    pub const AUTHENTICATION_METHOD: u32 = 0x15;
    pub const AUTHENTICATION_DATA: u32 = 0x16;
    pub const REQUEST_PROBLEM_INFORMATION: u32 = 0x17;
    pub const WILL_DELAY_INTERVAL: u32 = 0x18;
    pub const REQUEST_RESPONSE_INFORMATION: u32 = 0x19;
    pub const RESPONSE_INFORMATION: u32 = 0x1A;
    pub const SERVER_REFERENCE: u32 = 0x1C;
    pub const REASON_STRING: u32 = 0x1F;
    pub const RECEIVE_MAXIMUM: u32 = 0x21;
    pub const TOPIC_ALIAS_MAXIMUM: u32 = 0x22;
    pub const TOPIC_ALIAS: u32 = 0x23;
    pub const MAXIMUM_QOS: u32 = 0x24;
    pub const RETAIN_AVAILABLE: u32 = 0x25;
    pub const USER_PROPERTY: u32 = 0x26;
    pub const MAXIMUM_PACKET_SIZE: u32 = 0x27;
    pub const WILDCARD_SUBSCRIPTION_AVAILABLE: u32 = 0x28;
    pub const SUBSCRIPTION_IDENTIFIERS_AVAILABLE: u32 = 0x29;
    pub const SHARED_SUBSCRIPTION_AVAILABLE: u32 = 0x2A;
}

/// MQTT v5 CONNECT properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectProperties {
    pub session_expiry_interval: Option<u32>,
    pub receive_maximum: Option<u16>,
    pub maximum_packet_size: Option<u32>,
    pub topic_alias_maximum: Option<u16>,
    pub request_response_information: bool,
    pub request_problem_information: bool,
    pub user_properties: Vec<(String, String)>,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Vec<u8>>,
}

/// MQTT v5 CONNACK properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnAckProperties {
    pub session_expiry_interval: Option<u32>,
    pub receive_maximum: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<bool>,
    pub maximum_packet_size: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub topic_alias_maximum: Option<u16>,
    pub reason_string: Option<String>,
    pub user_properties: Vec<(String, String)>,
    pub wildcard_subscription_available: Option<bool>,
    pub subscription_identifiers_available: Option<bool>,
    pub shared_subscription_available: Option<bool>,
    pub server_keep_alive: Option<u16>,
    pub response_information: Option<String>,
    pub server_reference: Option<String>,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Vec<u8>>,
}

/// MQTT v5 PUBLISH properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishProperties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub topic_alias: Option<u16>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub user_properties: Vec<(String, String)>,
    /// May repeat when the broker forwards a message matching several
    /// subscriptions.
    pub subscription_identifiers: Vec<u32>,
    pub content_type: Option<String>,
}

/// MQTT v5 Will properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WillProperties {
    pub will_delay_interval: Option<u32>,
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub user_properties: Vec<(String, String)>,
}

/// MQTT v5 properties shared by the acknowledgement family
/// (PUBACK, PUBREC, PUBREL, PUBCOMP, SUBACK, UNSUBACK).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AckProperties {
    pub reason_string: Option<String>,
    pub user_properties: Vec<(String, String)>,
}

/// MQTT v5 DISCONNECT properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisconnectProperties {
    pub session_expiry_interval: Option<u32>,
    pub reason_string: Option<String>,
    pub user_properties: Vec<(String, String)>,
    pub server_reference: Option<String>,
}

/// MQTT v5 AUTH properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthProperties {
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Vec<u8>>,
    pub reason_string: Option<String>,
    pub user_properties: Vec<(String, String)>,
}

/// MQTT v5 subscription options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: u8,
}

impl SubscriptionOptions {
    /// Parse from a SUBSCRIBE options byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        let qos = QoS::try_from(byte & 0x03)?;
        Ok(Self {
            qos,
            no_local: (byte & 0x04) != 0,
            retain_as_published: (byte & 0x08) != 0,
            retain_handling: (byte >> 4) & 0x03,
        })
    }

    pub fn to_byte(self) -> u8 {
        (self.qos as u8)
            | if self.no_local { 0x04 } else { 0 }
            | if self.retain_as_published { 0x08 } else { 0 }
            | (self.retain_handling << 4)
    }
}

/// A single topic-filter entry of a SUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub filter: String,
    pub options: SubscriptionOptions,
}

/// MQTT packets.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(Ack),
    PubRec(Ack),
    PubRel(Ack),
    PubComp(Ack),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect(Disconnect),
    Auth(Auth),
}

/// CONNECT packet data. The protocol name and level are supplied by the
/// codec from the version it is asked to encode for.
#[derive(Debug, Clone, PartialEq)]
pub struct Connect {
    pub clean_start: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    /// MQTT v5 properties (None for 3.1.1).
    pub properties: Option<ConnectProperties>,
}

/// Will message carried in CONNECT.
#[derive(Debug, Clone, PartialEq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Option<WillProperties>,
}

/// CONNACK packet data.
///
/// For 3.1.1 `reason_code` holds the connect return code (0 = accepted,
/// 1..=5 refusal reasons); for 5.0 it holds the v5 reason code.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnAck {
    pub session_present: bool,
    pub reason_code: u8,
    pub properties: Option<ConnAckProperties>,
}

impl ConnAck {
    pub fn is_success(&self) -> bool {
        self.reason_code == reason_code::SUCCESS
    }
}

/// PUBLISH packet data.
#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    pub properties: Option<PublishProperties>,
}

/// PUBACK/PUBREC/PUBREL/PUBCOMP packet data.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub packet_id: u16,
    /// v5 reason code; always 0 on 3.1.1.
    pub reason_code: u8,
    pub properties: Option<AckProperties>,
}

impl Ack {
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            reason_code: reason_code::SUCCESS,
            properties: None,
        }
    }
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub subscriptions: Vec<Subscription>,
    /// MQTT v5 subscription identifier (applies to all entries).
    pub subscription_id: Option<u32>,
    pub user_properties: Vec<(String, String)>,
}

/// SUBACK packet data.
#[derive(Debug, Clone, PartialEq)]
pub struct SubAck {
    pub packet_id: u16,
    /// One granted-QoS or failure code per requested filter, in order.
    pub reason_codes: Vec<u8>,
    pub properties: Option<AckProperties>,
}

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
    pub user_properties: Vec<(String, String)>,
}

/// UNSUBACK packet data. 3.1.1 carries no reason codes.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsubAck {
    pub packet_id: u16,
    pub reason_codes: Vec<u8>,
    pub properties: Option<AckProperties>,
}

/// DISCONNECT packet data.
#[derive(Debug, Clone, PartialEq)]
pub struct Disconnect {
    pub reason_code: u8,
    pub properties: Option<DisconnectProperties>,
}

impl Disconnect {
    pub fn normal() -> Self {
        Self {
            reason_code: reason_code::NORMAL_DISCONNECTION,
            properties: None,
        }
    }
}

/// AUTH packet data (5.0 only).
#[derive(Debug, Clone, PartialEq)]
pub struct Auth {
    pub reason_code: u8,
    pub properties: Option<AuthProperties>,
}

// === Decoding ===

/// Cursor over a packet's variable header and payload.
struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_u8(&mut self) -> Result<u8> {
        if self.remaining() < 1 {
            return Err(ProtocolError::IncompletePacket { needed: 1, have: 0 });
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(ProtocolError::IncompletePacket {
                needed: 2,
                have: self.remaining(),
            });
        }
        let val = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(val)
    }

    fn read_u32(&mut self) -> Result<u32> {
        if self.remaining() < 4 {
            return Err(ProtocolError::IncompletePacket {
                needed: 4,
                have: self.remaining(),
            });
        }
        let bytes = [
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
        ];
        self.pos += 4;
        Ok(u32::from_be_bytes(bytes))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::IncompletePacket {
                needed: len,
                have: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        // MQTT-1.5.3-2: UTF-8 strings must not contain U+0000.
        if bytes.contains(&0u8) {
            return Err(ProtocolError::InvalidUtf8);
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    fn read_binary(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u16()? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }

    fn read_varint(&mut self) -> Result<u32> {
        match varint::decode(&self.buf[self.pos..])? {
            Some((value, consumed)) => {
                self.pos += consumed;
                Ok(value)
            }
            None => Err(ProtocolError::IncompletePacket {
                needed: 1,
                have: 0,
            }),
        }
    }
}

impl ConnectProperties {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let len = dec.read_varint()? as usize;
        let end = dec.pos() + len;
        let mut props = Self::default();

        while dec.pos() < end {
            match dec.read_varint()? {
                prop::SESSION_EXPIRY_INTERVAL => {
                    props.session_expiry_interval = Some(dec.read_u32()?)
                }
                prop::RECEIVE_MAXIMUM => props.receive_maximum = Some(dec.read_u16()?),
                prop::MAXIMUM_PACKET_SIZE => props.maximum_packet_size = Some(dec.read_u32()?),
                prop::TOPIC_ALIAS_MAXIMUM => props.topic_alias_maximum = Some(dec.read_u16()?),
                prop::REQUEST_RESPONSE_INFORMATION => {
                    props.request_response_information = dec.read_u8()? != 0
                }
                prop::REQUEST_PROBLEM_INFORMATION => {
                    props.request_problem_information = dec.read_u8()? != 0
                }
                prop::USER_PROPERTY => {
                    let key = dec.read_string()?;
                    let value = dec.read_string()?;
                    props.user_properties.push((key, value));
                }
                prop::AUTHENTICATION_METHOD => {
                    props.authentication_method = Some(dec.read_string()?)
                }
                prop::AUTHENTICATION_DATA => props.authentication_data = Some(dec.read_binary()?),
                id => {
                    return Err(ProtocolError::UnknownProperty {
                        context: "CONNECT",
                        id,
                    })
                }
            }
        }
        Ok(props)
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        put_opt_u32(&mut body, prop::SESSION_EXPIRY_INTERVAL, self.session_expiry_interval);
        put_opt_u16(&mut body, prop::RECEIVE_MAXIMUM, self.receive_maximum);
        put_opt_u32(&mut body, prop::MAXIMUM_PACKET_SIZE, self.maximum_packet_size);
        put_opt_u16(&mut body, prop::TOPIC_ALIAS_MAXIMUM, self.topic_alias_maximum);
        if self.request_response_information {
            put_u8(&mut body, prop::REQUEST_RESPONSE_INFORMATION, 1);
        }
        if self.request_problem_information {
            put_u8(&mut body, prop::REQUEST_PROBLEM_INFORMATION, 1);
        }
        put_user_properties(&mut body, &self.user_properties);
        put_opt_string(&mut body, prop::AUTHENTICATION_METHOD, &self.authentication_method);
        put_opt_binary(&mut body, prop::AUTHENTICATION_DATA, &self.authentication_data);
        finish_props(out, body);
    }
}

impl ConnAckProperties {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let len = dec.read_varint()? as usize;
        let end = dec.pos() + len;
        let mut props = Self::default();

        while dec.pos() < end {
            match dec.read_varint()? {
                prop::SESSION_EXPIRY_INTERVAL => {
                    props.session_expiry_interval = Some(dec.read_u32()?)
                }
                prop::RECEIVE_MAXIMUM => props.receive_maximum = Some(dec.read_u16()?),
                prop::MAXIMUM_QOS => props.maximum_qos = Some(dec.read_u8()?),
                prop::RETAIN_AVAILABLE => props.retain_available = Some(dec.read_u8()? != 0),
                prop::MAXIMUM_PACKET_SIZE => props.maximum_packet_size = Some(dec.read_u32()?),
                prop::ASSIGNED_CLIENT_IDENTIFIER => {
                    props.assigned_client_identifier = Some(dec.read_string()?)
                }
                prop::TOPIC_ALIAS_MAXIMUM => props.topic_alias_maximum = Some(dec.read_u16()?),
                prop::REASON_STRING => props.reason_string = Some(dec.read_string()?),
                prop::USER_PROPERTY => {
                    let key = dec.read_string()?;
                    let value = dec.read_string()?;
                    props.user_properties.push((key, value));
                }
                prop::WILDCARD_SUBSCRIPTION_AVAILABLE => {
                    props.wildcard_subscription_available = Some(dec.read_u8()? != 0)
                }
                prop::SUBSCRIPTION_IDENTIFIERS_AVAILABLE => {
                    props.subscription_identifiers_available = Some(dec.read_u8()? != 0)
                }
                prop::SHARED_SUBSCRIPTION_AVAILABLE => {
                    props.shared_subscription_available = Some(dec.read_u8()? != 0)
                }
                prop::SERVER_KEEP_ALIVE => props.server_keep_alive = Some(dec.read_u16()?),
                prop::RESPONSE_INFORMATION => {
                    props.response_information = Some(dec.read_string()?)
                }
                prop::SERVER_REFERENCE => props.server_reference = Some(dec.read_string()?),
                prop::AUTHENTICATION_METHOD => {
                    props.authentication_method = Some(dec.read_string()?)
                }
                prop::AUTHENTICATION_DATA => props.authentication_data = Some(dec.read_binary()?),
                id => {
                    return Err(ProtocolError::UnknownProperty {
                        context: "CONNACK",
                        id,
                    })
                }
            }
        }
        Ok(props)
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        put_opt_u32(&mut body, prop::SESSION_EXPIRY_INTERVAL, self.session_expiry_interval);
        put_opt_u16(&mut body, prop::RECEIVE_MAXIMUM, self.receive_maximum);
        if let Some(v) = self.maximum_qos {
            put_u8(&mut body, prop::MAXIMUM_QOS, v);
        }
        put_opt_bool(&mut body, prop::RETAIN_AVAILABLE, self.retain_available);
        put_opt_u32(&mut body, prop::MAXIMUM_PACKET_SIZE, self.maximum_packet_size);
        put_opt_string(
            &mut body,
            prop::ASSIGNED_CLIENT_IDENTIFIER,
            &self.assigned_client_identifier,
        );
        put_opt_u16(&mut body, prop::TOPIC_ALIAS_MAXIMUM, self.topic_alias_maximum);
        put_opt_string(&mut body, prop::REASON_STRING, &self.reason_string);
        put_user_properties(&mut body, &self.user_properties);
        put_opt_bool(
            &mut body,
            prop::WILDCARD_SUBSCRIPTION_AVAILABLE,
            self.wildcard_subscription_available,
        );
        put_opt_bool(
            &mut body,
            prop::SUBSCRIPTION_IDENTIFIERS_AVAILABLE,
            self.subscription_identifiers_available,
        );
        put_opt_bool(
            &mut body,
            prop::SHARED_SUBSCRIPTION_AVAILABLE,
            self.shared_subscription_available,
        );
        put_opt_u16(&mut body, prop::SERVER_KEEP_ALIVE, self.server_keep_alive);
        put_opt_string(&mut body, prop::RESPONSE_INFORMATION, &self.response_information);
        put_opt_string(&mut body, prop::SERVER_REFERENCE, &self.server_reference);
        put_opt_string(&mut body, prop::AUTHENTICATION_METHOD, &self.authentication_method);
        put_opt_binary(&mut body, prop::AUTHENTICATION_DATA, &self.authentication_data);
        finish_props(out, body);
    }
}

impl PublishProperties {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let len = dec.read_varint()? as usize;
        let end = dec.pos() + len;
        let mut props = Self::default();

        while dec.pos() < end {
            match dec.read_varint()? {
                prop::PAYLOAD_FORMAT_INDICATOR => {
                    props.payload_format_indicator = Some(dec.read_u8()?)
                }
                prop::MESSAGE_EXPIRY_INTERVAL => {
                    props.message_expiry_interval = Some(dec.read_u32()?)
                }
                prop::TOPIC_ALIAS => props.topic_alias = Some(dec.read_u16()?),
                prop::RESPONSE_TOPIC => props.response_topic = Some(dec.read_string()?),
                prop::CORRELATION_DATA => props.correlation_data = Some(dec.read_binary()?),
                prop::USER_PROPERTY => {
                    let key = dec.read_string()?;
                    let value = dec.read_string()?;
                    props.user_properties.push((key, value));
                }
                prop::SUBSCRIPTION_IDENTIFIER => {
                    let id = dec.read_varint()?;
                    if id == 0 {
                        return Err(ProtocolError::MalformedPacket(
                            "subscription identifier must be non-zero".into(),
                        ));
                    }
                    props.subscription_identifiers.push(id);
                }
                prop::CONTENT_TYPE => props.content_type = Some(dec.read_string()?),
                id => {
                    return Err(ProtocolError::UnknownProperty {
                        context: "PUBLISH",
                        id,
                    })
                }
            }
        }
        Ok(props)
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        if let Some(v) = self.payload_format_indicator {
            put_u8(&mut body, prop::PAYLOAD_FORMAT_INDICATOR, v);
        }
        put_opt_u32(&mut body, prop::MESSAGE_EXPIRY_INTERVAL, self.message_expiry_interval);
        put_opt_u16(&mut body, prop::TOPIC_ALIAS, self.topic_alias);
        put_opt_string(&mut body, prop::RESPONSE_TOPIC, &self.response_topic);
        put_opt_binary(&mut body, prop::CORRELATION_DATA, &self.correlation_data);
        put_user_properties(&mut body, &self.user_properties);
        for id in &self.subscription_identifiers {
            varint::encode(prop::SUBSCRIPTION_IDENTIFIER, &mut body);
            varint::encode(*id, &mut body);
        }
        put_opt_string(&mut body, prop::CONTENT_TYPE, &self.content_type);
        finish_props(out, body);
    }
}

impl WillProperties {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let len = dec.read_varint()? as usize;
        let end = dec.pos() + len;
        let mut props = Self::default();

        while dec.pos() < end {
            match dec.read_varint()? {
                prop::WILL_DELAY_INTERVAL => props.will_delay_interval = Some(dec.read_u32()?),
                prop::PAYLOAD_FORMAT_INDICATOR => {
                    props.payload_format_indicator = Some(dec.read_u8()?)
                }
                prop::MESSAGE_EXPIRY_INTERVAL => {
                    props.message_expiry_interval = Some(dec.read_u32()?)
                }
                prop::CONTENT_TYPE => props.content_type = Some(dec.read_string()?),
                prop::RESPONSE_TOPIC => props.response_topic = Some(dec.read_string()?),
                prop::CORRELATION_DATA => props.correlation_data = Some(dec.read_binary()?),
                prop::USER_PROPERTY => {
                    let key = dec.read_string()?;
                    let value = dec.read_string()?;
                    props.user_properties.push((key, value));
                }
                id => {
                    return Err(ProtocolError::UnknownProperty {
                        context: "Will",
                        id,
                    })
                }
            }
        }
        Ok(props)
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        put_opt_u32(&mut body, prop::WILL_DELAY_INTERVAL, self.will_delay_interval);
        if let Some(v) = self.payload_format_indicator {
            put_u8(&mut body, prop::PAYLOAD_FORMAT_INDICATOR, v);
        }
        put_opt_u32(&mut body, prop::MESSAGE_EXPIRY_INTERVAL, self.message_expiry_interval);
        put_opt_string(&mut body, prop::CONTENT_TYPE, &self.content_type);
        put_opt_string(&mut body, prop::RESPONSE_TOPIC, &self.response_topic);
        put_opt_binary(&mut body, prop::CORRELATION_DATA, &self.correlation_data);
        put_user_properties(&mut body, &self.user_properties);
        finish_props(out, body);
    }
}

impl AckProperties {
    fn decode(dec: &mut Decoder<'_>, context: &'static str) -> Result<Self> {
        let len = dec.read_varint()? as usize;
        let end = dec.pos() + len;
        let mut props = Self::default();

        while dec.pos() < end {
            match dec.read_varint()? {
                prop::REASON_STRING => props.reason_string = Some(dec.read_string()?),
                prop::USER_PROPERTY => {
                    let key = dec.read_string()?;
                    let value = dec.read_string()?;
                    props.user_properties.push((key, value));
                }
                id => return Err(ProtocolError::UnknownProperty { context, id }),
            }
        }
        Ok(props)
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        put_opt_string(&mut body, prop::REASON_STRING, &self.reason_string);
        put_user_properties(&mut body, &self.user_properties);
        finish_props(out, body);
    }
}

impl DisconnectProperties {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let len = dec.read_varint()? as usize;
        let end = dec.pos() + len;
        let mut props = Self::default();

        while dec.pos() < end {
            match dec.read_varint()? {
                prop::SESSION_EXPIRY_INTERVAL => {
                    props.session_expiry_interval = Some(dec.read_u32()?)
                }
                prop::REASON_STRING => props.reason_string = Some(dec.read_string()?),
                prop::USER_PROPERTY => {
                    let key = dec.read_string()?;
                    let value = dec.read_string()?;
                    props.user_properties.push((key, value));
                }
                prop::SERVER_REFERENCE => props.server_reference = Some(dec.read_string()?),
                id => {
                    return Err(ProtocolError::UnknownProperty {
                        context: "DISCONNECT",
                        id,
                    })
                }
            }
        }
        Ok(props)
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        put_opt_u32(&mut body, prop::SESSION_EXPIRY_INTERVAL, self.session_expiry_interval);
        put_opt_string(&mut body, prop::REASON_STRING, &self.reason_string);
        put_user_properties(&mut body, &self.user_properties);
        put_opt_string(&mut body, prop::SERVER_REFERENCE, &self.server_reference);
        finish_props(out, body);
    }
}

impl AuthProperties {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let len = dec.read_varint()? as usize;
        let end = dec.pos() + len;
        let mut props = Self::default();

        while dec.pos() < end {
            match dec.read_varint()? {
                prop::AUTHENTICATION_METHOD => {
                    props.authentication_method = Some(dec.read_string()?)
                }
                prop::AUTHENTICATION_DATA => props.authentication_data = Some(dec.read_binary()?),
                prop::REASON_STRING => props.reason_string = Some(dec.read_string()?),
                prop::USER_PROPERTY => {
                    let key = dec.read_string()?;
                    let value = dec.read_string()?;
                    props.user_properties.push((key, value));
                }
                id => {
                    return Err(ProtocolError::UnknownProperty {
                        context: "AUTH",
                        id,
                    })
                }
            }
        }
        Ok(props)
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        put_opt_string(&mut body, prop::AUTHENTICATION_METHOD, &self.authentication_method);
        put_opt_binary(&mut body, prop::AUTHENTICATION_DATA, &self.authentication_data);
        put_opt_string(&mut body, prop::REASON_STRING, &self.reason_string);
        put_user_properties(&mut body, &self.user_properties);
        finish_props(out, body);
    }
}

/// Try to decode a complete packet from the front of `buf`.
///
/// Returns `Ok(Some((packet, bytes_consumed)))` on success, `Ok(None)` if
/// more data is needed, or an error for malformed input. `max_packet_size`
/// of 0 means no limit.
pub fn decode_packet(
    buf: &[u8],
    version: ProtocolVersion,
    max_packet_size: u32,
) -> Result<Option<(Packet, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let fixed_header = buf[0];
    let packet_type_raw = fixed_header >> 4;
    let flags = fixed_header & 0x0F;

    let Some((remaining_len, len_bytes)) = varint::decode(&buf[1..])? else {
        return Ok(None);
    };
    let remaining_len = remaining_len as usize;

    let header_len = 1 + len_bytes;
    let total_len = header_len + remaining_len;

    if max_packet_size > 0 && total_len > max_packet_size as usize {
        return Err(ProtocolError::PacketTooLarge {
            size: total_len,
            max: max_packet_size as usize,
        });
    }

    if buf.len() < total_len {
        return Ok(None);
    }

    let packet_type = PacketType::try_from(packet_type_raw)?;
    let payload = &buf[header_len..total_len];
    let is_v5 = version.is_v5();

    // MQTT-3.6.1-1 / MQTT-3.8.1-1 / MQTT-3.10.1-1: these three carry fixed
    // flags 0b0010; everything except PUBLISH requires zero flags.
    match packet_type {
        PacketType::Subscribe | PacketType::Unsubscribe | PacketType::PubRel => {
            if flags != 0x02 {
                return Err(ProtocolError::InvalidFlags {
                    packet: packet_name(packet_type),
                    expected: 0x02,
                    flags,
                });
            }
        }
        PacketType::Publish => {}
        _ => {
            if flags != 0 {
                return Err(ProtocolError::InvalidFlags {
                    packet: packet_name(packet_type),
                    expected: 0,
                    flags,
                });
            }
        }
    }

    let packet = match packet_type {
        PacketType::Connect => decode_connect(payload)?,
        PacketType::ConnAck => decode_connack(payload, is_v5)?,
        PacketType::Publish => decode_publish(flags, payload, is_v5)?,
        PacketType::PubAck => Packet::PubAck(decode_ack(payload, is_v5, "PUBACK")?),
        PacketType::PubRec => Packet::PubRec(decode_ack(payload, is_v5, "PUBREC")?),
        PacketType::PubRel => Packet::PubRel(decode_ack(payload, is_v5, "PUBREL")?),
        PacketType::PubComp => Packet::PubComp(decode_ack(payload, is_v5, "PUBCOMP")?),
        PacketType::Subscribe => decode_subscribe(payload, is_v5)?,
        PacketType::SubAck => decode_suback(payload, is_v5)?,
        PacketType::Unsubscribe => decode_unsubscribe(payload, is_v5)?,
        PacketType::UnsubAck => decode_unsuback(payload, is_v5)?,
        PacketType::PingReq => Packet::PingReq,
        PacketType::PingResp => Packet::PingResp,
        PacketType::Disconnect => decode_disconnect(payload, is_v5)?,
        PacketType::Auth => {
            if !is_v5 {
                return Err(ProtocolError::InvalidPacketType(packet_type_raw));
            }
            decode_auth(payload)?
        }
    };

    Ok(Some((packet, total_len)))
}

fn packet_name(packet_type: PacketType) -> &'static str {
    match packet_type {
        PacketType::Connect => "CONNECT",
        PacketType::ConnAck => "CONNACK",
        PacketType::Publish => "PUBLISH",
        PacketType::PubAck => "PUBACK",
        PacketType::PubRec => "PUBREC",
        PacketType::PubRel => "PUBREL",
        PacketType::PubComp => "PUBCOMP",
        PacketType::Subscribe => "SUBSCRIBE",
        PacketType::SubAck => "SUBACK",
        PacketType::Unsubscribe => "UNSUBSCRIBE",
        PacketType::UnsubAck => "UNSUBACK",
        PacketType::PingReq => "PINGREQ",
        PacketType::PingResp => "PINGRESP",
        PacketType::Disconnect => "DISCONNECT",
        PacketType::Auth => "AUTH",
    }
}

fn decode_connect(payload: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(payload);

    let protocol_name = dec.read_string()?;
    if protocol_name != "MQTT" {
        return Err(ProtocolError::InvalidProtocolName(protocol_name));
    }
    let wire_version = ProtocolVersion::try_from(dec.read_u8()?)?;
    let is_v5 = wire_version.is_v5();

    let flags = dec.read_u8()?;
    let clean_start = (flags & 0x02) != 0;
    let will_flag = (flags & 0x04) != 0;
    let will_qos = QoS::try_from((flags >> 3) & 0x03)?;
    let will_retain = (flags & 0x20) != 0;
    let password_flag = (flags & 0x40) != 0;
    let username_flag = (flags & 0x80) != 0;

    // MQTT-3.1.2-3: reserved bit must be zero.
    if (flags & 0x01) != 0 {
        return Err(ProtocolError::MalformedPacket(
            "CONNECT reserved flag set".into(),
        ));
    }
    // MQTT-3.1.2-11/-13/-15: will QoS and retain require the will flag.
    if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
        return Err(ProtocolError::MalformedPacket(
            "will QoS/retain set without will flag".into(),
        ));
    }
    // MQTT-3.1.2-22 (3.1.1 only; v5 allows password without username).
    if !is_v5 && !username_flag && password_flag {
        return Err(ProtocolError::MalformedPacket(
            "password flag set without username flag".into(),
        ));
    }

    let keep_alive = dec.read_u16()?;

    let properties = if is_v5 {
        let props = ConnectProperties::decode(&mut dec)?;
        (props != ConnectProperties::default()).then_some(props)
    } else {
        None
    };

    let client_id = dec.read_string()?;

    let will = if will_flag {
        let will_properties = if is_v5 {
            let props = WillProperties::decode(&mut dec)?;
            (props != WillProperties::default()).then_some(props)
        } else {
            None
        };
        let topic = dec.read_string()?;
        let payload = Bytes::from(dec.read_binary()?);
        Some(Will {
            topic,
            payload,
            qos: will_qos,
            retain: will_retain,
            properties: will_properties,
        })
    } else {
        None
    };

    let username = if username_flag {
        Some(dec.read_string()?)
    } else {
        None
    };
    let password = if password_flag {
        Some(dec.read_binary()?)
    } else {
        None
    };

    Ok(Packet::Connect(Connect {
        clean_start,
        keep_alive,
        client_id,
        will,
        username,
        password,
        properties,
    }))
}

fn decode_connack(payload: &[u8], is_v5: bool) -> Result<Packet> {
    let mut dec = Decoder::new(payload);

    let ack_flags = dec.read_u8()?;
    if ack_flags & !0x01 != 0 {
        return Err(ProtocolError::MalformedPacket(
            "CONNACK acknowledge flags must be 0 or 1".into(),
        ));
    }
    let session_present = ack_flags & 0x01 != 0;
    let reason_code = dec.read_u8()?;

    let properties = if is_v5 {
        let props = ConnAckProperties::decode(&mut dec)?;
        (props != ConnAckProperties::default()).then_some(props)
    } else {
        None
    };

    Ok(Packet::ConnAck(ConnAck {
        session_present,
        reason_code,
        properties,
    }))
}

fn decode_publish(flags: u8, payload: &[u8], is_v5: bool) -> Result<Packet> {
    let dup = (flags & 0x08) != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = (flags & 0x01) != 0;

    let mut dec = Decoder::new(payload);
    let topic = dec.read_string()?;

    let packet_id = if qos != QoS::AtMostOnce {
        let id = dec.read_u16()?;
        // MQTT-2.3.1-1: packet identifiers must be non-zero.
        if id == 0 {
            return Err(ProtocolError::MalformedPacket(
                "PUBLISH packet identifier must be non-zero".into(),
            ));
        }
        Some(id)
    } else {
        None
    };

    let properties = if is_v5 {
        let props = PublishProperties::decode(&mut dec)?;
        (props != PublishProperties::default()).then_some(props)
    } else {
        None
    };

    let body = dec.read_bytes(dec.remaining())?;

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload: Bytes::copy_from_slice(body),
        properties,
    }))
}

fn decode_ack(payload: &[u8], is_v5: bool, context: &'static str) -> Result<Ack> {
    let mut dec = Decoder::new(payload);
    let packet_id = dec.read_u16()?;

    // v5 permits a shortened form: remaining length 2 means reason 0 and no
    // properties, length 3 means a bare reason code.
    let mut ack = Ack::new(packet_id);
    if is_v5 && dec.remaining() > 0 {
        ack.reason_code = dec.read_u8()?;
        if dec.remaining() > 0 {
            let props = AckProperties::decode(&mut dec, context)?;
            ack.properties = (props != AckProperties::default()).then_some(props);
        }
    }
    Ok(ack)
}

fn decode_subscribe(payload: &[u8], is_v5: bool) -> Result<Packet> {
    let mut dec = Decoder::new(payload);
    let packet_id = dec.read_u16()?;

    let mut subscription_id = None;
    let mut user_properties = Vec::new();
    if is_v5 {
        let len = dec.read_varint()? as usize;
        let end = dec.pos() + len;
        while dec.pos() < end {
            match dec.read_varint()? {
                prop::SUBSCRIPTION_IDENTIFIER => {
                    let id = dec.read_varint()?;
                    // MQTT-3.8.2-1
                    if id == 0 {
                        return Err(ProtocolError::MalformedPacket(
                            "subscription identifier must be non-zero".into(),
                        ));
                    }
                    subscription_id = Some(id);
                }
                prop::USER_PROPERTY => {
                    let key = dec.read_string()?;
                    let value = dec.read_string()?;
                    user_properties.push((key, value));
                }
                id => {
                    return Err(ProtocolError::UnknownProperty {
                        context: "SUBSCRIBE",
                        id,
                    })
                }
            }
        }
    }

    let mut subscriptions = Vec::new();
    while dec.remaining() > 0 {
        let filter = dec.read_string()?;
        if filter.is_empty() {
            return Err(ProtocolError::MalformedPacket(
                "empty topic filter".into(),
            ));
        }
        let options = SubscriptionOptions::from_byte(dec.read_u8()?)?;
        subscriptions.push(Subscription { filter, options });
    }
    // MQTT-3.8.3-3: at least one filter is required.
    if subscriptions.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "SUBSCRIBE with no topic filters".into(),
        ));
    }

    Ok(Packet::Subscribe(Subscribe {
        packet_id,
        subscriptions,
        subscription_id,
        user_properties,
    }))
}

fn decode_suback(payload: &[u8], is_v5: bool) -> Result<Packet> {
    let mut dec = Decoder::new(payload);
    let packet_id = dec.read_u16()?;

    let properties = if is_v5 {
        let props = AckProperties::decode(&mut dec, "SUBACK")?;
        (props != AckProperties::default()).then_some(props)
    } else {
        None
    };

    let reason_codes = dec.read_bytes(dec.remaining())?.to_vec();
    if reason_codes.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "SUBACK with no reason codes".into(),
        ));
    }

    Ok(Packet::SubAck(SubAck {
        packet_id,
        reason_codes,
        properties,
    }))
}

fn decode_unsubscribe(payload: &[u8], is_v5: bool) -> Result<Packet> {
    let mut dec = Decoder::new(payload);
    let packet_id = dec.read_u16()?;

    let mut user_properties = Vec::new();
    if is_v5 {
        let len = dec.read_varint()? as usize;
        let end = dec.pos() + len;
        while dec.pos() < end {
            match dec.read_varint()? {
                prop::USER_PROPERTY => {
                    let key = dec.read_string()?;
                    let value = dec.read_string()?;
                    user_properties.push((key, value));
                }
                id => {
                    return Err(ProtocolError::UnknownProperty {
                        context: "UNSUBSCRIBE",
                        id,
                    })
                }
            }
        }
    }

    let mut filters = Vec::new();
    while dec.remaining() > 0 {
        let filter = dec.read_string()?;
        if filter.is_empty() {
            return Err(ProtocolError::MalformedPacket(
                "empty topic filter".into(),
            ));
        }
        filters.push(filter);
    }
    if filters.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "UNSUBSCRIBE with no topic filters".into(),
        ));
    }

    Ok(Packet::Unsubscribe(Unsubscribe {
        packet_id,
        filters,
        user_properties,
    }))
}

fn decode_unsuback(payload: &[u8], is_v5: bool) -> Result<Packet> {
    let mut dec = Decoder::new(payload);
    let packet_id = dec.read_u16()?;

    let (properties, reason_codes) = if is_v5 {
        let props = AckProperties::decode(&mut dec, "UNSUBACK")?;
        let properties = (props != AckProperties::default()).then_some(props);
        (properties, dec.read_bytes(dec.remaining())?.to_vec())
    } else {
        // 3.1.1 UNSUBACK has no payload.
        (None, Vec::new())
    };

    Ok(Packet::UnsubAck(UnsubAck {
        packet_id,
        reason_codes,
        properties,
    }))
}

fn decode_disconnect(payload: &[u8], is_v5: bool) -> Result<Packet> {
    if !is_v5 || payload.is_empty() {
        return Ok(Packet::Disconnect(Disconnect::normal()));
    }

    let mut dec = Decoder::new(payload);
    let reason_code = dec.read_u8()?;
    let properties = if dec.remaining() > 0 {
        let props = DisconnectProperties::decode(&mut dec)?;
        (props != DisconnectProperties::default()).then_some(props)
    } else {
        None
    };

    Ok(Packet::Disconnect(Disconnect {
        reason_code,
        properties,
    }))
}

fn decode_auth(payload: &[u8]) -> Result<Packet> {
    if payload.is_empty() {
        return Ok(Packet::Auth(Auth {
            reason_code: reason_code::SUCCESS,
            properties: None,
        }));
    }

    let mut dec = Decoder::new(payload);
    let reason_code = dec.read_u8()?;
    let properties = if dec.remaining() > 0 {
        let props = AuthProperties::decode(&mut dec)?;
        (props != AuthProperties::default()).then_some(props)
    } else {
        None
    };

    Ok(Packet::Auth(Auth {
        reason_code,
        properties,
    }))
}

// === Encoding ===

/// Encode a packet for the given protocol version, appending to `buf`.
///
/// # Panics
///
/// Panics if a string or binary field exceeds the 65 535 bytes its two-byte
/// length prefix can express. Topic validation in callers rejects such
/// values before they reach the codec.
pub fn encode_packet(packet: &Packet, version: ProtocolVersion, buf: &mut Vec<u8>) {
    let is_v5 = version.is_v5();
    match packet {
        Packet::Connect(connect) => encode_connect(connect, version, buf),
        Packet::ConnAck(connack) => encode_connack(connack, is_v5, buf),
        Packet::Publish(publish) => encode_publish(publish, is_v5, buf),
        Packet::PubAck(ack) => encode_ack(PacketType::PubAck, 0, ack, is_v5, buf),
        Packet::PubRec(ack) => encode_ack(PacketType::PubRec, 0, ack, is_v5, buf),
        Packet::PubRel(ack) => encode_ack(PacketType::PubRel, 0x02, ack, is_v5, buf),
        Packet::PubComp(ack) => encode_ack(PacketType::PubComp, 0, ack, is_v5, buf),
        Packet::Subscribe(subscribe) => encode_subscribe(subscribe, is_v5, buf),
        Packet::SubAck(suback) => encode_suback(suback, is_v5, buf),
        Packet::Unsubscribe(unsubscribe) => encode_unsubscribe(unsubscribe, is_v5, buf),
        Packet::UnsubAck(unsuback) => encode_unsuback(unsuback, is_v5, buf),
        Packet::PingReq => put_header(buf, (PacketType::PingReq as u8) << 4, &[]),
        Packet::PingResp => put_header(buf, (PacketType::PingResp as u8) << 4, &[]),
        Packet::Disconnect(disconnect) => encode_disconnect(disconnect, is_v5, buf),
        Packet::Auth(auth) => encode_auth(auth, buf),
    }
}

fn encode_connect(connect: &Connect, version: ProtocolVersion, buf: &mut Vec<u8>) {
    let is_v5 = version.is_v5();
    let mut body = Vec::new();

    put_string(&mut body, "MQTT");
    body.push(version.wire());

    let mut flags = 0u8;
    if connect.clean_start {
        flags |= 0x02;
    }
    if let Some(will) = &connect.will {
        flags |= 0x04 | ((will.qos as u8) << 3);
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    body.push(flags);
    body.extend_from_slice(&connect.keep_alive.to_be_bytes());

    if is_v5 {
        match &connect.properties {
            Some(props) => props.encode_into(&mut body),
            None => body.push(0),
        }
    }

    put_string(&mut body, &connect.client_id);

    if let Some(will) = &connect.will {
        if is_v5 {
            match &will.properties {
                Some(props) => props.encode_into(&mut body),
                None => body.push(0),
            }
        }
        put_string(&mut body, &will.topic);
        put_binary(&mut body, &will.payload);
    }
    if let Some(username) = &connect.username {
        put_string(&mut body, username);
    }
    if let Some(password) = &connect.password {
        put_binary(&mut body, password);
    }

    put_header(buf, (PacketType::Connect as u8) << 4, &body);
}

fn encode_connack(connack: &ConnAck, is_v5: bool, buf: &mut Vec<u8>) {
    let mut body = Vec::new();
    body.push(connack.session_present as u8);
    body.push(connack.reason_code);

    if is_v5 {
        match &connack.properties {
            Some(props) => props.encode_into(&mut body),
            None => body.push(0),
        }
    }

    put_header(buf, (PacketType::ConnAck as u8) << 4, &body);
}

fn encode_publish(publish: &Publish, is_v5: bool, buf: &mut Vec<u8>) {
    let mut first = (PacketType::Publish as u8) << 4;
    if publish.dup {
        first |= 0x08;
    }
    first |= (publish.qos as u8) << 1;
    if publish.retain {
        first |= 0x01;
    }

    let mut body = Vec::new();
    put_string(&mut body, &publish.topic);
    if let Some(id) = publish.packet_id {
        body.extend_from_slice(&id.to_be_bytes());
    }
    if is_v5 {
        match &publish.properties {
            Some(props) => props.encode_into(&mut body),
            None => body.push(0),
        }
    }
    body.extend_from_slice(&publish.payload);

    put_header(buf, first, &body);
}

fn encode_ack(packet_type: PacketType, flags: u8, ack: &Ack, is_v5: bool, buf: &mut Vec<u8>) {
    let first = ((packet_type as u8) << 4) | flags;
    let mut body = Vec::new();
    body.extend_from_slice(&ack.packet_id.to_be_bytes());

    if is_v5 && (ack.reason_code != 0 || ack.properties.is_some()) {
        body.push(ack.reason_code);
        if let Some(props) = &ack.properties {
            props.encode_into(&mut body);
        }
    }

    put_header(buf, first, &body);
}

fn encode_subscribe(subscribe: &Subscribe, is_v5: bool, buf: &mut Vec<u8>) {
    let mut body = Vec::new();
    body.extend_from_slice(&subscribe.packet_id.to_be_bytes());

    if is_v5 {
        let mut props = Vec::new();
        if let Some(id) = subscribe.subscription_id {
            varint::encode(prop::SUBSCRIPTION_IDENTIFIER, &mut props);
            varint::encode(id, &mut props);
        }
        put_user_properties(&mut props, &subscribe.user_properties);
        finish_props(&mut body, props);
    }

    for sub in &subscribe.subscriptions {
        put_string(&mut body, &sub.filter);
        body.push(sub.options.to_byte());
    }

    put_header(buf, ((PacketType::Subscribe as u8) << 4) | 0x02, &body);
}

fn encode_suback(suback: &SubAck, is_v5: bool, buf: &mut Vec<u8>) {
    let mut body = Vec::new();
    body.extend_from_slice(&suback.packet_id.to_be_bytes());

    if is_v5 {
        match &suback.properties {
            Some(props) => props.encode_into(&mut body),
            None => body.push(0),
        }
    }
    body.extend_from_slice(&suback.reason_codes);

    put_header(buf, (PacketType::SubAck as u8) << 4, &body);
}

fn encode_unsubscribe(unsubscribe: &Unsubscribe, is_v5: bool, buf: &mut Vec<u8>) {
    let mut body = Vec::new();
    body.extend_from_slice(&unsubscribe.packet_id.to_be_bytes());

    if is_v5 {
        let mut props = Vec::new();
        put_user_properties(&mut props, &unsubscribe.user_properties);
        finish_props(&mut body, props);
    }

    for filter in &unsubscribe.filters {
        put_string(&mut body, filter);
    }

    put_header(buf, ((PacketType::Unsubscribe as u8) << 4) | 0x02, &body);
}

fn encode_unsuback(unsuback: &UnsubAck, is_v5: bool, buf: &mut Vec<u8>) {
    let mut body = Vec::new();
    body.extend_from_slice(&unsuback.packet_id.to_be_bytes());

    if is_v5 {
        match &unsuback.properties {
            Some(props) => props.encode_into(&mut body),
            None => body.push(0),
        }
        body.extend_from_slice(&unsuback.reason_codes);
    }

    put_header(buf, (PacketType::UnsubAck as u8) << 4, &body);
}

fn encode_disconnect(disconnect: &Disconnect, is_v5: bool, buf: &mut Vec<u8>) {
    let first = (PacketType::Disconnect as u8) << 4;

    if !is_v5 || (disconnect.reason_code == 0 && disconnect.properties.is_none()) {
        put_header(buf, first, &[]);
        return;
    }

    let mut body = vec![disconnect.reason_code];
    if let Some(props) = &disconnect.properties {
        props.encode_into(&mut body);
    }
    put_header(buf, first, &body);
}

fn encode_auth(auth: &Auth, buf: &mut Vec<u8>) {
    let first = (PacketType::Auth as u8) << 4;

    if auth.reason_code == 0 && auth.properties.is_none() {
        put_header(buf, first, &[]);
        return;
    }

    let mut body = vec![auth.reason_code];
    if let Some(props) = &auth.properties {
        props.encode_into(&mut body);
    }
    put_header(buf, first, &body);
}

// === Encoding helpers ===

fn put_header(buf: &mut Vec<u8>, first_byte: u8, body: &[u8]) {
    buf.push(first_byte);
    varint::encode(body.len() as u32, buf);
    buf.extend_from_slice(body);
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    assert!(s.len() <= u16::MAX as usize, "string field exceeds 65535 bytes");
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn put_binary(buf: &mut Vec<u8>, bytes: &[u8]) {
    assert!(bytes.len() <= u16::MAX as usize, "binary field exceeds 65535 bytes");
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn put_u8(buf: &mut Vec<u8>, id: u32, value: u8) {
    varint::encode(id, buf);
    buf.push(value);
}

fn put_opt_u16(buf: &mut Vec<u8>, id: u32, value: Option<u16>) {
    if let Some(v) = value {
        varint::encode(id, buf);
        buf.extend_from_slice(&v.to_be_bytes());
    }
}

fn put_opt_u32(buf: &mut Vec<u8>, id: u32, value: Option<u32>) {
    if let Some(v) = value {
        varint::encode(id, buf);
        buf.extend_from_slice(&v.to_be_bytes());
    }
}

fn put_opt_bool(buf: &mut Vec<u8>, id: u32, value: Option<bool>) {
    if let Some(v) = value {
        put_u8(buf, id, v as u8);
    }
}

fn put_opt_string(buf: &mut Vec<u8>, id: u32, value: &Option<String>) {
    if let Some(v) = value {
        varint::encode(id, buf);
        put_string(buf, v);
    }
}

fn put_opt_binary(buf: &mut Vec<u8>, id: u32, value: &Option<Vec<u8>>) {
    if let Some(v) = value {
        varint::encode(id, buf);
        put_binary(buf, v);
    }
}

fn put_user_properties(buf: &mut Vec<u8>, pairs: &[(String, String)]) {
    for (key, value) in pairs {
        varint::encode(prop::USER_PROPERTY, buf);
        put_string(buf, key);
        put_string(buf, value);
    }
}

fn finish_props(out: &mut Vec<u8>, body: Vec<u8>) {
    varint::encode(body.len() as u32, out);
    out.extend_from_slice(&body);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: Packet, version: ProtocolVersion) {
        let mut buf = Vec::new();
        encode_packet(&packet, version, &mut buf);
        let (decoded, consumed) = decode_packet(&buf, version, 0)
            .expect("decode failed")
            .expect("packet incomplete");
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, packet);
    }

    fn both_versions(packet: Packet) {
        roundtrip(packet.clone(), ProtocolVersion::V311);
        roundtrip(packet, ProtocolVersion::V5);
    }

    #[test]
    fn roundtrip_connect() {
        both_versions(Packet::Connect(Connect {
            clean_start: true,
            keep_alive: 60,
            client_id: "quill-test".into(),
            will: None,
            username: Some("user".into()),
            password: Some(b"secret".to_vec()),
            properties: None,
        }));
    }

    #[test]
    fn roundtrip_connect_with_will_and_properties() {
        roundtrip(
            Packet::Connect(Connect {
                clean_start: false,
                keep_alive: 30,
                client_id: "quill".into(),
                will: Some(Will {
                    topic: "client/status".into(),
                    payload: Bytes::from_static(b"offline"),
                    qos: QoS::AtLeastOnce,
                    retain: true,
                    properties: Some(WillProperties {
                        will_delay_interval: Some(5),
                        content_type: Some("text/plain".into()),
                        ..Default::default()
                    }),
                }),
                username: None,
                password: None,
                properties: Some(ConnectProperties {
                    session_expiry_interval: Some(120),
                    receive_maximum: Some(16),
                    user_properties: vec![("k".into(), "v".into())],
                    ..Default::default()
                }),
            }),
            ProtocolVersion::V5,
        );
    }

    #[test]
    fn roundtrip_connack() {
        both_versions(Packet::ConnAck(ConnAck {
            session_present: true,
            reason_code: 0,
            properties: None,
        }));
        roundtrip(
            Packet::ConnAck(ConnAck {
                session_present: false,
                reason_code: reason_code::NOT_AUTHORIZED,
                properties: Some(ConnAckProperties {
                    maximum_qos: Some(1),
                    retain_available: Some(false),
                    maximum_packet_size: Some(100),
                    server_keep_alive: Some(30),
                    assigned_client_identifier: Some("assigned".into()),
                    ..Default::default()
                }),
            }),
            ProtocolVersion::V5,
        );
    }

    #[test]
    fn roundtrip_publish() {
        for qos in [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce] {
            both_versions(Packet::Publish(Publish {
                dup: qos != QoS::AtMostOnce,
                qos,
                retain: true,
                topic: "one/two/three".into(),
                packet_id: (qos != QoS::AtMostOnce).then_some(42),
                payload: Bytes::from_static(b"hello"),
                properties: None,
            }));
        }
        roundtrip(
            Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtLeastOnce,
                retain: false,
                topic: "a/b".into(),
                packet_id: Some(7),
                payload: Bytes::from_static(&[1, 2, 3]),
                properties: Some(PublishProperties {
                    message_expiry_interval: Some(60),
                    response_topic: Some("reply/here".into()),
                    correlation_data: Some(vec![9, 9]),
                    subscription_identifiers: vec![1, 300],
                    content_type: Some("application/octet-stream".into()),
                    ..Default::default()
                }),
            }),
            ProtocolVersion::V5,
        );
    }

    #[test]
    fn roundtrip_ack_family() {
        for make in [
            Packet::PubAck as fn(Ack) -> Packet,
            Packet::PubRec,
            Packet::PubRel,
            Packet::PubComp,
        ] {
            both_versions(make(Ack::new(99)));
            roundtrip(
                make(Ack {
                    packet_id: 99,
                    reason_code: reason_code::QUOTA_EXCEEDED,
                    properties: Some(AckProperties {
                        reason_string: Some("quota".into()),
                        user_properties: vec![],
                    }),
                }),
                ProtocolVersion::V5,
            );
        }
    }

    #[test]
    fn roundtrip_subscribe() {
        both_versions(Packet::Subscribe(Subscribe {
            packet_id: 10,
            subscriptions: vec![
                Subscription {
                    filter: "one/+/three".into(),
                    options: SubscriptionOptions {
                        qos: QoS::AtLeastOnce,
                        ..Default::default()
                    },
                },
                Subscription {
                    filter: "four/#".into(),
                    options: SubscriptionOptions {
                        qos: QoS::ExactlyOnce,
                        no_local: true,
                        retain_as_published: true,
                        retain_handling: 2,
                    },
                },
            ],
            subscription_id: None,
            user_properties: vec![],
        }));
        roundtrip(
            Packet::Subscribe(Subscribe {
                packet_id: 11,
                subscriptions: vec![Subscription {
                    filter: "a".into(),
                    options: SubscriptionOptions::default(),
                }],
                subscription_id: Some(77),
                user_properties: vec![("k".into(), "v".into())],
            }),
            ProtocolVersion::V5,
        );
    }

    #[test]
    fn roundtrip_suback_unsuback() {
        both_versions(Packet::SubAck(SubAck {
            packet_id: 10,
            reason_codes: vec![0, 1, 0x80],
            properties: None,
        }));
        both_versions(Packet::Unsubscribe(Unsubscribe {
            packet_id: 12,
            filters: vec!["one/two".into(), "three/#".into()],
            user_properties: vec![],
        }));
        roundtrip(
            Packet::UnsubAck(UnsubAck {
                packet_id: 12,
                reason_codes: vec![0, reason_code::NO_SUBSCRIPTION_EXISTED],
                properties: None,
            }),
            ProtocolVersion::V5,
        );
        roundtrip(
            Packet::UnsubAck(UnsubAck {
                packet_id: 12,
                reason_codes: vec![],
                properties: None,
            }),
            ProtocolVersion::V311,
        );
    }

    #[test]
    fn roundtrip_ping_disconnect_auth() {
        both_versions(Packet::PingReq);
        both_versions(Packet::PingResp);
        both_versions(Packet::Disconnect(Disconnect::normal()));
        roundtrip(
            Packet::Disconnect(Disconnect {
                reason_code: reason_code::DISCONNECT_WITH_WILL,
                properties: Some(DisconnectProperties {
                    session_expiry_interval: Some(0),
                    ..Default::default()
                }),
            }),
            ProtocolVersion::V5,
        );
        roundtrip(
            Packet::Auth(Auth {
                reason_code: reason_code::RE_AUTHENTICATE,
                properties: Some(AuthProperties {
                    authentication_method: Some("SCRAM-SHA-1".into()),
                    authentication_data: Some(vec![1, 2, 3]),
                    ..Default::default()
                }),
            }),
            ProtocolVersion::V5,
        );
        roundtrip(
            Packet::Auth(Auth {
                reason_code: 0,
                properties: None,
            }),
            ProtocolVersion::V5,
        );
    }

    #[test]
    fn incremental_decode_needs_more_data() {
        let packet = Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: "x/y".into(),
            packet_id: Some(3),
            payload: Bytes::from_static(b"abcdef"),
            properties: None,
        });
        let mut buf = Vec::new();
        encode_packet(&packet, ProtocolVersion::V311, &mut buf);

        for cut in 0..buf.len() {
            assert!(
                decode_packet(&buf[..cut], ProtocolVersion::V311, 0)
                    .unwrap()
                    .is_none(),
                "prefix of {cut} bytes should be incomplete"
            );
        }
        assert!(decode_packet(&buf, ProtocolVersion::V311, 0)
            .unwrap()
            .is_some());
    }

    #[test]
    fn decode_consumes_only_one_packet() {
        let mut buf = Vec::new();
        encode_packet(&Packet::PingReq, ProtocolVersion::V311, &mut buf);
        let first_len = buf.len();
        encode_packet(&Packet::PingResp, ProtocolVersion::V311, &mut buf);

        let (packet, consumed) = decode_packet(&buf, ProtocolVersion::V311, 0)
            .unwrap()
            .unwrap();
        assert_eq!(packet, Packet::PingReq);
        assert_eq!(consumed, first_len);
    }

    #[test]
    fn rejects_remaining_length_overflow() {
        let buf = [0x30, 0xFF, 0xFF, 0xFF, 0xFF];
        assert!(matches!(
            decode_packet(&buf, ProtocolVersion::V311, 0),
            Err(ProtocolError::InvalidRemainingLength)
        ));
    }

    #[test]
    fn rejects_oversized_packet() {
        let packet = Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "t".into(),
            packet_id: None,
            payload: Bytes::from(vec![0u8; 256]),
            properties: None,
        });
        let mut buf = Vec::new();
        encode_packet(&packet, ProtocolVersion::V311, &mut buf);

        assert!(matches!(
            decode_packet(&buf, ProtocolVersion::V311, 100),
            Err(ProtocolError::PacketTooLarge { .. })
        ));
        assert!(decode_packet(&buf, ProtocolVersion::V311, 0).unwrap().is_some());
    }

    #[test]
    fn rejects_invalid_fixed_header_flags() {
        // SUBSCRIBE with flags 0000 instead of 0010.
        let mut buf = Vec::new();
        encode_packet(
            &Packet::Subscribe(Subscribe {
                packet_id: 1,
                subscriptions: vec![Subscription {
                    filter: "a".into(),
                    options: SubscriptionOptions::default(),
                }],
                subscription_id: None,
                user_properties: vec![],
            }),
            ProtocolVersion::V311,
            &mut buf,
        );
        buf[0] &= 0xF0;
        assert!(matches!(
            decode_packet(&buf, ProtocolVersion::V311, 0),
            Err(ProtocolError::InvalidFlags { .. })
        ));

        // PINGREQ with non-zero flags.
        assert!(matches!(
            decode_packet(&[0xC1, 0x00], ProtocolVersion::V311, 0),
            Err(ProtocolError::InvalidFlags { .. })
        ));
    }

    #[test]
    fn rejects_publish_qos3() {
        // Flags 0110 = QoS 3.
        let buf = [0x36, 0x05, 0x00, 0x01, b't', 0x00, 0x01];
        assert!(matches!(
            decode_packet(&buf, ProtocolVersion::V311, 0),
            Err(ProtocolError::InvalidQoS(3))
        ));
    }

    #[test]
    fn rejects_unknown_property() {
        // v5 PUBLISH with property id 0x7F.
        let mut body = Vec::new();
        put_string(&mut body, "t");
        body.push(2); // property length
        body.push(0x7F);
        body.push(0x00);
        let mut buf = vec![0x30];
        varint::encode(body.len() as u32, &mut buf);
        buf.extend_from_slice(&body);

        assert!(matches!(
            decode_packet(&buf, ProtocolVersion::V5, 0),
            Err(ProtocolError::UnknownProperty {
                context: "PUBLISH",
                id: 0x7F,
            })
        ));
    }

    #[test]
    fn rejects_auth_on_v311() {
        assert!(decode_packet(&[0xF0, 0x00], ProtocolVersion::V311, 0).is_err());
        assert!(decode_packet(&[0xF0, 0x00], ProtocolVersion::V5, 0).unwrap().is_some());
    }

    #[test]
    fn rejects_zero_packet_id_publish() {
        // QoS 1 PUBLISH with packet id 0.
        let buf = [0x32, 0x05, 0x00, 0x01, b't', 0x00, 0x00];
        assert!(decode_packet(&buf, ProtocolVersion::V311, 0).is_err());
    }

    #[test]
    #[should_panic(expected = "exceeds 65535 bytes")]
    fn oversized_string_field_panics() {
        let mut buf = Vec::new();
        encode_packet(
            &Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
                topic: "t/".repeat(40_000),
                packet_id: None,
                payload: Bytes::new(),
                properties: None,
            }),
            ProtocolVersion::V311,
            &mut buf,
        );
    }

    #[test]
    fn rejects_string_with_embedded_nul() {
        let buf = [0x30, 0x04, 0x00, 0x02, b'a', 0x00];
        assert!(matches!(
            decode_packet(&buf, ProtocolVersion::V311, 0),
            Err(ProtocolError::InvalidUtf8)
        ));
    }
}
