//! In-process bus.
//!
//! Fan-out over tokio mpsc channels, one sender list per topic. Used by the
//! test suite and by single-host deployments where core and nodes share a
//! process. Subscribers that fall behind past their buffer lose messages,
//! matching at-most-once pub/sub semantics of the real transports.

use super::{Bus, Envelope};
use crate::error::BusError;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

/// Per-subscriber buffer. Bounded so a stuck subscriber cannot hold the
/// publisher's memory hostage.
const SUBSCRIBER_BUFFER: usize = 256;

/// In-process pub/sub bus.
pub struct InProcessBus {
    topics: DashMap<String, Vec<mpsc::Sender<Envelope>>>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
        }
    }

    /// Number of live subscribers on a channel. Test helper.
    #[allow(dead_code)]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.topics
            .get(channel)
            .map(|senders| senders.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for InProcessBus {
    async fn publish(&self, channel: &str, envelope: Envelope) -> Result<(), BusError> {
        // Collect live senders first so the shard lock is not held across
        // awaits or try_send wakeups.
        let senders: Vec<mpsc::Sender<Envelope>> = match self.topics.get_mut(channel) {
            Some(mut entry) => {
                entry.retain(|s| !s.is_closed());
                entry.clone()
            }
            None => return Ok(()),
        };

        for sender in senders {
            if let Err(e) = sender.try_send(envelope.clone()) {
                match e {
                    mpsc::error::TrySendError::Full(_) => {
                        tracing::warn!(
                            channel = %channel,
                            "Subscriber buffer full, dropping envelope"
                        );
                    }
                    mpsc::error::TrySendError::Closed(_) => {}
                }
            }
        }
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.topics.entry(channel.to_string()).or_default().push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::channels;
    use std::time::Duration;

    fn envelope(kind: &str) -> Envelope {
        Envelope::new(kind, "test", &serde_json::json!({"n": 1})).unwrap()
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = InProcessBus::new();
        let mut a = bus.subscribe("topic");
        let mut b = bus.subscribe("topic");

        bus.publish("topic", envelope("topic")).await.unwrap();

        assert_eq!(a.recv().await.unwrap().kind, "topic");
        assert_eq!(b.recv().await.unwrap().kind, "topic");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = InProcessBus::new();
        bus.publish("empty", envelope("empty")).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let bus = InProcessBus::new();
        let rx = bus.subscribe("topic");
        drop(rx);
        bus.publish("topic", envelope("topic")).await.unwrap();
        assert_eq!(bus.subscriber_count("topic"), 0);
    }

    #[tokio::test]
    async fn test_request_reply_round_trip() {
        let bus = std::sync::Arc::new(InProcessBus::new());

        // A fake node answers the first request it sees.
        let responder_bus = bus.clone();
        let mut requests = bus.subscribe("svc:request");
        tokio::spawn(async move {
            let req = requests.recv().await.unwrap();
            let reply = Envelope::new("svc:reply", "node", &req.payload).unwrap();
            responder_bus.publish("svc:reply", reply).await.unwrap();
        });

        let reply = bus
            .request(
                "svc:request",
                "svc:reply",
                envelope("svc:request"),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(reply.kind, "svc:reply");
    }

    #[tokio::test]
    async fn test_request_times_out_without_reply() {
        let bus = InProcessBus::new();
        let err = bus
            .request(
                channels::REGISTER,
                "nobody:replies",
                envelope(channels::REGISTER),
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "timeout");
    }
}
