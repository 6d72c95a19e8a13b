//! Session state tracking for the MQTT client.
//!
//! Client-side session state per MQTT spec section 4.1:
//! - QoS 1 and QoS 2 messages sent but not completely acknowledged
//! - QoS 2 messages received but not completely acknowledged
//!
//! Key requirements:
//! - [MQTT-4.4.0-1] On reconnect with a resumed session, re-send
//!   unacknowledged messages with DUP set and their original packet IDs
//! - [MQTT-4.6.0-1] Re-send in the order originally sent

use std::collections::HashSet;
use std::collections::VecDeque;
use std::time::Duration;

use quill_core::packet::{Ack, Packet, Publish, QoS, SubscriptionOptions};
use tokio::time::Instant;

/// Where an outbound QoS 1/2 publish stands in its acknowledgement flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundState {
    /// QoS 1 PUBLISH sent, awaiting PUBACK
    AwaitingPubAck,
    /// QoS 2 PUBLISH sent, awaiting PUBREC
    AwaitingPubRec,
    /// PUBREC received, PUBREL sent, awaiting PUBCOMP
    AwaitingPubComp,
}

/// An outbound publish awaiting acknowledgement. The original packet is
/// retained so redelivery keeps identical content.
#[derive(Debug, Clone)]
pub struct InFlightPublish {
    pub publish: Publish,
    pub state: OutboundState,
    /// When the packet (or its PUBREL) was last written.
    pub last_sent: Instant,
    pub send_count: u32,
}

impl InFlightPublish {
    fn new(publish: Publish) -> Self {
        let state = match publish.qos {
            QoS::AtLeastOnce => OutboundState::AwaitingPubAck,
            QoS::ExactlyOnce => OutboundState::AwaitingPubRec,
            QoS::AtMostOnce => unreachable!("QoS 0 is never tracked"),
        };
        Self {
            publish,
            state,
            last_sent: Instant::now(),
            send_count: 1,
        }
    }

    fn packet_id(&self) -> u16 {
        // Tracked publishes always carry an identifier.
        self.publish.packet_id.unwrap_or(0)
    }

    /// The packet to write when this entry is (re-)delivered.
    fn resend_packet(&self) -> Packet {
        match self.state {
            OutboundState::AwaitingPubAck | OutboundState::AwaitingPubRec => {
                let mut publish = self.publish.clone();
                publish.dup = true;
                Packet::Publish(publish)
            }
            OutboundState::AwaitingPubComp => Packet::PubRel(Ack::new(self.packet_id())),
        }
    }
}

/// Subscription record, kept so the active set survives reconnects.
#[derive(Debug, Clone)]
pub struct SubscriptionRecord {
    pub filter: String,
    pub options: SubscriptionOptions,
}

/// Client session state.
#[derive(Debug, Default)]
pub struct Session {
    /// Outbound QoS 1/2 publishes in original send order.
    outbound: VecDeque<InFlightPublish>,

    /// Inbound QoS 2 packet IDs for which delivery already happened
    /// (PUBREC sent, awaiting PUBREL).
    inbound_qos2: HashSet<u16>,

    /// Active subscriptions.
    pub subscriptions: Vec<SubscriptionRecord>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard all session state (fresh session negotiated).
    pub fn clear(&mut self) {
        self.outbound.clear();
        self.inbound_qos2.clear();
        self.subscriptions.clear();
    }

    /// Track an outbound QoS 1/2 publish until its terminal acknowledgement.
    pub fn track(&mut self, publish: Publish) {
        debug_assert!(publish.qos != QoS::AtMostOnce && publish.packet_id.is_some());
        self.outbound.push_back(InFlightPublish::new(publish));
    }

    /// PUBACK received: complete a QoS 1 publish.
    pub fn on_puback(&mut self, packet_id: u16) -> bool {
        self.remove_outbound(packet_id, OutboundState::AwaitingPubAck)
    }

    /// PUBREC received: advance a QoS 2 publish to awaiting PUBCOMP.
    /// Returns true when a PUBREL should be sent.
    pub fn on_pubrec(&mut self, packet_id: u16) -> bool {
        match self.find_mut(packet_id) {
            Some(entry) if entry.state == OutboundState::AwaitingPubRec => {
                entry.state = OutboundState::AwaitingPubComp;
                entry.last_sent = Instant::now();
                true
            }
            // Duplicate PUBREC: PUBREL was already sent, the retry timer
            // will repeat it if needed.
            _ => false,
        }
    }

    /// PUBCOMP received: complete a QoS 2 publish.
    pub fn on_pubcomp(&mut self, packet_id: u16) -> bool {
        self.remove_outbound(packet_id, OutboundState::AwaitingPubComp)
    }

    /// Record an inbound QoS 2 delivery. Returns true the first time the
    /// packet ID is seen; duplicates return false and must not be
    /// dispatched again.
    pub fn begin_inbound_qos2(&mut self, packet_id: u16) -> bool {
        self.inbound_qos2.insert(packet_id)
    }

    /// PUBREL received: release the inbound QoS 2 record.
    /// Returns true if the ID was known.
    pub fn end_inbound_qos2(&mut self, packet_id: u16) -> bool {
        self.inbound_qos2.remove(&packet_id)
    }

    pub fn outbound_count(&self) -> usize {
        self.outbound.len()
    }

    /// Packet IDs of all in-flight outbound publishes.
    pub fn outbound_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.outbound.iter().map(|e| e.packet_id())
    }

    pub fn add_subscription(&mut self, filter: String, options: SubscriptionOptions) {
        if let Some(sub) = self.subscriptions.iter_mut().find(|s| s.filter == filter) {
            sub.options = options;
        } else {
            self.subscriptions.push(SubscriptionRecord { filter, options });
        }
    }

    pub fn remove_subscription(&mut self, filter: &str) {
        self.subscriptions.retain(|s| s.filter != filter);
    }

    /// Packets to re-send after the broker confirmed session resumption,
    /// in original send order with DUP set.
    pub fn resend_packets(&mut self) -> Vec<Packet> {
        let now = Instant::now();
        self.outbound
            .iter_mut()
            .map(|entry| {
                entry.last_sent = now;
                entry.send_count += 1;
                entry.resend_packet()
            })
            .collect()
    }

    /// Packets whose acknowledgement is overdue, with their send state
    /// refreshed.
    pub fn retry_packets(&mut self, interval: Duration) -> Vec<Packet> {
        let now = Instant::now();
        self.outbound
            .iter_mut()
            .filter(|entry| now.duration_since(entry.last_sent) >= interval)
            .map(|entry| {
                entry.last_sent = now;
                entry.send_count += 1;
                entry.resend_packet()
            })
            .collect()
    }

    /// Drop an outbound entry in any state (broker rejected the exchange).
    /// Returns true if the ID was tracked.
    pub fn abort(&mut self, packet_id: u16) -> bool {
        if let Some(pos) = self
            .outbound
            .iter()
            .position(|e| e.packet_id() == packet_id)
        {
            self.outbound.remove(pos);
            true
        } else {
            false
        }
    }

    fn find_mut(&mut self, packet_id: u16) -> Option<&mut InFlightPublish> {
        self.outbound
            .iter_mut()
            .find(|e| e.packet_id() == packet_id)
    }

    fn remove_outbound(&mut self, packet_id: u16, expected: OutboundState) -> bool {
        if let Some(pos) = self
            .outbound
            .iter()
            .position(|e| e.packet_id() == packet_id && e.state == expected)
        {
            self.outbound.remove(pos);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn publish(packet_id: u16, qos: QoS) -> Publish {
        Publish {
            dup: false,
            qos,
            retain: false,
            topic: "test/topic".into(),
            packet_id: Some(packet_id),
            payload: Bytes::from_static(b"payload"),
            properties: None,
        }
    }

    #[test]
    fn qos1_lifecycle() {
        let mut session = Session::new();
        session.track(publish(1, QoS::AtLeastOnce));
        assert_eq!(session.outbound_count(), 1);

        // PUBCOMP for a QoS 1 entry is ignored.
        assert!(!session.on_pubcomp(1));
        assert!(session.on_puback(1));
        assert!(!session.on_puback(1));
        assert_eq!(session.outbound_count(), 0);
    }

    #[test]
    fn qos2_lifecycle() {
        let mut session = Session::new();
        session.track(publish(1, QoS::ExactlyOnce));

        // PUBACK never completes a QoS 2 entry.
        assert!(!session.on_puback(1));

        assert!(session.on_pubrec(1));
        // Duplicate PUBREC does not transition again.
        assert!(!session.on_pubrec(1));

        assert!(session.on_pubcomp(1));
        assert_eq!(session.outbound_count(), 0);
    }

    #[test]
    fn inbound_qos2_dedup() {
        let mut session = Session::new();

        assert!(session.begin_inbound_qos2(100));
        // Duplicate delivery must not dispatch again.
        assert!(!session.begin_inbound_qos2(100));

        assert!(session.end_inbound_qos2(100));
        assert!(!session.end_inbound_qos2(100));
        // Redelivery after PUBREL is a fresh exchange.
        assert!(session.begin_inbound_qos2(100));
    }

    #[test]
    fn resend_order_and_dup() {
        let mut session = Session::new();
        session.track(publish(1, QoS::AtLeastOnce));
        session.track(publish(2, QoS::ExactlyOnce));
        session.track(publish(3, QoS::ExactlyOnce));
        session.on_pubrec(3);

        let resend = session.resend_packets();
        assert_eq!(resend.len(), 3);

        match &resend[0] {
            Packet::Publish(p) => {
                assert_eq!(p.packet_id, Some(1));
                assert!(p.dup);
            }
            other => panic!("expected PUBLISH, got {other:?}"),
        }
        match &resend[1] {
            Packet::Publish(p) => {
                assert_eq!(p.packet_id, Some(2));
                assert!(p.dup);
            }
            other => panic!("expected PUBLISH, got {other:?}"),
        }
        assert!(matches!(&resend[2], Packet::PubRel(ack) if ack.packet_id == 3));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_only_overdue() {
        let mut session = Session::new();
        session.track(publish(1, QoS::AtLeastOnce));

        tokio::time::advance(Duration::from_secs(5)).await;
        session.track(publish(2, QoS::AtLeastOnce));

        tokio::time::advance(Duration::from_secs(6)).await;
        let due = session.retry_packets(Duration::from_secs(10));
        assert_eq!(due.len(), 1);
        assert!(matches!(&due[0], Packet::Publish(p) if p.packet_id == Some(1)));

        // Entry 1 was just refreshed; only entry 2 comes due next.
        tokio::time::advance(Duration::from_secs(6)).await;
        let due = session.retry_packets(Duration::from_secs(10));
        assert_eq!(due.len(), 1);
        assert!(matches!(&due[0], Packet::Publish(p) if p.packet_id == Some(2)));
    }
}
