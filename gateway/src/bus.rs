//! # bus
//!
//! Topic-based publish/subscribe channel carrying JSON-encoded payloads.
//! Every topic owns an independent `tokio::sync::broadcast` channel:
//! messages on one topic are delivered in publish order to each of that
//! topic's subscribers (per-topic FIFO); there is no ordering guarantee
//! across topics.
//!
//! Delivery is at-most-once from the bus's point of view — a subscriber
//! that isn't polling when a message is published simply misses it, so a
//! publisher is expected to re-emit periodically rather than rely on a
//! single delivery. Publishers never block: [`Bus::publish`] is
//! synchronous and returns immediately whether or not anyone is
//! listening.

use std::collections::HashMap;
use std::sync::Mutex;

use telemetry_types::BusMessage;
use tokio::sync::broadcast;
use tracing::trace;

const TOPIC_CHANNEL_CAPACITY: usize = 256;

/// An in-process topic registry. Cheap to clone (an `Arc` internally via
/// `tokio::sync::broadcast::Sender`'s own ref-counting); every listener and
/// the fusion controller hold a `Bus` handle.
#[derive(Clone)]
pub struct Bus {
    topics: std::sync::Arc<Mutex<HashMap<String, broadcast::Sender<BusMessage>>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            topics: std::sync::Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        let mut topics = self.topics.lock().expect("bus topic map poisoned");
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Publish a JSON payload to `topic`. Never blocks; a topic with no
    /// subscribers simply drops the message.
    pub fn publish(&self, topic: &str, payload: serde_json::Value) {
        let sender = self.sender_for(topic);
        trace!(topic, "bus publish");
        // send() only errors when there are zero receivers, which is a
        // normal and harmless condition for a fire-and-forget bus.
        let _ = sender.send(BusMessage::new(topic, payload));
    }

    /// Subscribe to a single topic, receiving every message published to it
    /// from this point on.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(topic).subscribe()
    }

    /// Subscribe to a group of topics, merging them into one receiver so a
    /// single task (e.g. the fusion controller's distance-arbitration loop)
    /// can `recv()` from all of them. Cross-topic ordering is unspecified.
    pub fn subscribe_group(&self, topics: &[&str]) -> TopicGroup {
        TopicGroup::from_receivers(topics.iter().map(|t| self.subscribe(t)).collect())
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// A fan-in over several topics' broadcast receivers. Each member topic gets
/// its own forwarding task that copies messages into a shared mpsc channel,
/// so `recv()` suspends cleanly instead of polling.
pub struct TopicGroup {
    rx: tokio::sync::mpsc::UnboundedReceiver<BusMessage>,
    _forwarders: Vec<tokio::task::JoinHandle<()>>,
}

impl TopicGroup {
    fn from_receivers(receivers: Vec<broadcast::Receiver<BusMessage>>) -> Self {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let forwarders = receivers
            .into_iter()
            .map(|mut member| {
                let tx = tx.clone();
                tokio::spawn(async move {
                    loop {
                        match member.recv().await {
                            Ok(msg) => {
                                if tx.send(msg).is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                })
            })
            .collect();
        Self {
            rx,
            _forwarders: forwarders,
        }
    }

    /// Wait for the next message across any of the group's topics.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

impl Drop for TopicGroup {
    fn drop(&mut self) {
        for handle in &self._forwarders {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_subscribe_misses_earlier_messages() {
        let bus = Bus::new();
        bus.publish("x", serde_json::json!({"a": 1}));
        let mut rx = bus.subscribe("x");
        bus.publish("x", serde_json::json!({"a": 2}));
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload["a"], 2);
    }

    #[tokio::test]
    async fn per_topic_fifo_order_preserved() {
        let bus = Bus::new();
        let mut rx = bus.subscribe("x");
        for i in 0..5 {
            bus.publish("x", serde_json::json!({"i": i}));
        }
        for i in 0..5 {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.payload["i"], i);
        }
    }

    #[tokio::test]
    async fn topic_group_receives_from_any_member() {
        let bus = Bus::new();
        let mut group = bus.subscribe_group(&["a", "b"]);
        bus.publish("b", serde_json::json!({"v": 1}));
        let msg = group.recv().await.unwrap();
        assert_eq!(msg.topic, "b");
        assert_eq!(msg.payload["v"], 1);
    }
}
