//! Routing of inbound PUBLISH packets to subscription streams.

use bytes::Bytes;
use quill_core::packet::{PublishProperties, QoS};
use quill_core::topic;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// A message received from the broker.
#[derive(Debug, Clone)]
pub struct Message {
    /// Topic the message was published to.
    pub topic: String,
    /// Message payload.
    pub payload: Bytes,
    /// Quality of Service level.
    pub qos: QoS,
    /// Whether this is a retained message.
    pub retain: bool,
    /// MQTT 5.0 properties carried by the PUBLISH.
    pub properties: Option<PublishProperties>,
}

/// A stream of messages for a specific subscription.
pub struct MessageStream {
    pub(crate) rx: mpsc::Receiver<Message>,
    pub(crate) filter: String,
}

impl MessageStream {
    /// Receive the next message.
    ///
    /// Returns `None` when the subscription is removed or the event loop
    /// is dropped.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Get the topic filter this stream is subscribed to.
    pub fn filter(&self) -> &str {
        &self.filter
    }
}

struct Route {
    filter: String,
    subscription_id: Option<u32>,
    tx: mpsc::Sender<Message>,
}

/// Registry of subscription routes.
///
/// Routes are evaluated in registration order. Hand-off is non-blocking:
/// a subscriber whose channel is full loses the message rather than
/// stalling protocol timers. Closed receivers are pruned lazily.
#[derive(Default)]
pub struct Dispatcher {
    routes: Vec<Route>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        filter: String,
        subscription_id: Option<u32>,
        tx: mpsc::Sender<Message>,
    ) {
        self.routes.push(Route {
            filter,
            subscription_id,
            tx,
        });
    }

    pub fn remove_filter(&mut self, filter: &str) {
        self.routes.retain(|r| r.filter != filter);
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }

    /// Deliver a message to every matching route.
    ///
    /// When the PUBLISH carries subscription identifiers, routes registered
    /// with one of those identifiers match directly; otherwise the topic is
    /// matched against each route's filter. Returns true if at least one
    /// route matched.
    pub fn dispatch(&mut self, msg: &Message) -> bool {
        let ids: &[u32] = msg
            .properties
            .as_ref()
            .map(|p| p.subscription_identifiers.as_slice())
            .unwrap_or(&[]);

        let mut matched = false;
        self.routes.retain(|route| {
            if route.tx.is_closed() {
                return false;
            }

            let hit = match route.subscription_id {
                Some(id) if !ids.is_empty() => ids.contains(&id),
                _ => topic::matches(&msg.topic, &route.filter),
            };
            if hit {
                matched = true;
                match route.tx.try_send(msg.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        log::warn!(
                            "subscriber for {:?} is full, dropping message on {:?}",
                            route.filter,
                            msg.topic
                        );
                    }
                    Err(TrySendError::Closed(_)) => return false,
                }
            }
            true
        });
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(topic: &str) -> Message {
        Message {
            topic: topic.to_string(),
            payload: Bytes::from_static(b"x"),
            qos: QoS::AtMostOnce,
            retain: false,
            properties: None,
        }
    }

    #[test]
    fn routes_by_filter() {
        let mut dispatcher = Dispatcher::new();
        let (tx, mut rx) = mpsc::channel(4);
        dispatcher.register("sensors/#".to_string(), None, tx);

        assert!(dispatcher.dispatch(&msg("sensors/temp")));
        assert!(!dispatcher.dispatch(&msg("commands/reboot")));

        assert_eq!(rx.try_recv().unwrap().topic, "sensors/temp");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn all_matching_routes_receive() {
        let mut dispatcher = Dispatcher::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        dispatcher.register("sensors/+".to_string(), None, tx1);
        dispatcher.register("sensors/#".to_string(), None, tx2);

        assert!(dispatcher.dispatch(&msg("sensors/temp")));
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn routes_by_subscription_id() {
        let mut dispatcher = Dispatcher::new();
        let (tx, mut rx) = mpsc::channel(4);
        dispatcher.register("ignored/#".to_string(), Some(7), tx);

        let mut m = msg("anything/at/all");
        m.properties = Some(PublishProperties {
            subscription_identifiers: vec![7],
            ..Default::default()
        });
        assert!(dispatcher.dispatch(&m));
        assert!(rx.try_recv().is_ok());

        // Different identifier does not match even if the filter would.
        let mut m = msg("ignored/topic");
        m.properties = Some(PublishProperties {
            subscription_identifiers: vec![8],
            ..Default::default()
        });
        assert!(!dispatcher.dispatch(&m));
    }

    #[test]
    fn full_subscriber_drops_without_blocking() {
        let mut dispatcher = Dispatcher::new();
        let (tx, mut rx) = mpsc::channel(1);
        dispatcher.register("t".to_string(), None, tx);

        assert!(dispatcher.dispatch(&msg("t")));
        assert!(dispatcher.dispatch(&msg("t")));

        // Only the first fits in the channel; the route survives.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert!(dispatcher.dispatch(&msg("t")));
    }

    #[test]
    fn closed_receivers_are_pruned() {
        let mut dispatcher = Dispatcher::new();
        let (tx, rx) = mpsc::channel(4);
        dispatcher.register("t".to_string(), None, tx);
        drop(rx);

        assert!(!dispatcher.dispatch(&msg("t")));
        assert!(dispatcher.routes.is_empty());
    }

    #[test]
    fn remove_filter_drops_route() {
        let mut dispatcher = Dispatcher::new();
        let (tx, mut rx) = mpsc::channel(4);
        dispatcher.register("t".to_string(), None, tx);
        dispatcher.remove_filter("t");

        assert!(!dispatcher.dispatch(&msg("t")));
        assert!(rx.try_recv().is_err());
    }
}
