//! Will message (Last Will and Testament) support.
//!
//! The will message is published by the broker if the client disconnects
//! without sending DISCONNECT.

use bytes::Bytes;
use quill_core::packet::{QoS, WillProperties};

/// Last Will and Testament message.
#[derive(Debug, Clone)]
pub struct Will {
    /// Topic to publish the will message to.
    pub topic: String,
    /// Will message payload.
    pub payload: Bytes,
    /// QoS level for will message delivery.
    pub qos: QoS,
    /// Whether the will message should be retained.
    pub retain: bool,
    /// MQTT 5.0 will properties.
    pub properties: Option<WillProperties>,
}

impl Will {
    /// Create a new will message with QoS 0 and no retain.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            properties: None,
        }
    }

    /// Set the QoS level for the will message.
    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Set whether the will message should be retained.
    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Delay before the broker publishes the will, in seconds (MQTT 5.0).
    pub fn delay_interval(mut self, seconds: u32) -> Self {
        self.properties
            .get_or_insert_with(WillProperties::default)
            .will_delay_interval = Some(seconds);
        self
    }

    /// Set the will content type (MQTT 5.0).
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.properties
            .get_or_insert_with(WillProperties::default)
            .content_type = Some(content_type.into());
        self
    }

    /// Drop the will if the broker has not published it after this many
    /// seconds (MQTT 5.0).
    pub fn message_expiry(mut self, seconds: u32) -> Self {
        self.properties
            .get_or_insert_with(WillProperties::default)
            .message_expiry_interval = Some(seconds);
        self
    }

    /// Set the response topic carried by the will (MQTT 5.0).
    pub fn response_topic(mut self, topic: impl Into<String>) -> Self {
        self.properties
            .get_or_insert_with(WillProperties::default)
            .response_topic = Some(topic.into());
        self
    }

    /// Set the correlation data carried by the will (MQTT 5.0).
    pub fn correlation_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.properties
            .get_or_insert_with(WillProperties::default)
            .correlation_data = Some(data.into());
        self
    }

    pub(crate) fn to_packet_will(&self) -> quill_core::packet::Will {
        quill_core::packet::Will {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            qos: self.qos,
            retain: self.retain,
            properties: self.properties.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn will_builder() {
        let will = Will::new("client/status", "offline")
            .qos(QoS::AtLeastOnce)
            .retain(true)
            .delay_interval(5);

        assert_eq!(will.topic, "client/status");
        assert_eq!(will.payload.as_ref(), b"offline");
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(will.retain);
        assert_eq!(
            will.properties.unwrap().will_delay_interval,
            Some(5)
        );
    }
}
