//! In-process bus.

use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::mpsc;

use super::{
    encode_payload, topic_matches, BusError, Message, MessageBus, MessagePayload, Subscription,
};

const CHANNEL_CAPACITY: usize = 256;

struct Subscriber {
    filter: String,
    tx: mpsc::Sender<Message>,
}

/// Bus delivering messages between tasks of the same process.
///
/// Messages are encoded exactly as on MQTT so consumers exercise the same
/// decoding path.
#[derive(Default)]
pub struct MemoryBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn targets(&self, topic: &str) -> Result<Vec<mpsc::Sender<Message>>, BusError> {
        let mut subscribers = self.subscribers.lock().map_err(|_| BusError::Closed)?;
        subscribers.retain(|s| !s.tx.is_closed());
        Ok(subscribers
            .iter()
            .filter(|s| topic_matches(&s.filter, topic))
            .map(|s| s.tx.clone())
            .collect())
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: &[MessagePayload]) -> Result<(), BusError> {
        let message = Message {
            topic: topic.to_string(),
            payload: encode_payload(payload)?,
        };
        for tx in self.targets(topic)? {
            // A subscriber dropped between lookup and send is not an error.
            let _ = tx.send(message.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.subscribers
            .lock()
            .map_err(|_| BusError::Closed)?
            .push(Subscriber {
                filter: filter.to_string(),
                tx,
            });
        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(t: &str, ts: &str) -> MessagePayload {
        vec![t.to_string(), ts.to_string()]
    }

    #[tokio::test]
    async fn delivers_to_matching_subscribers_only() {
        let bus = MemoryBus::new();
        let mut all = bus.subscribe("sensors/#").await.unwrap();
        let mut other = bus.subscribe("sensors/krakow/+").await.unwrap();

        bus.publish("sensors/warsaw/s1", &[entry("1.00", "2024-01-01T00:00:00Z")])
            .await
            .unwrap();

        let msg = all.recv().await.unwrap();
        assert_eq!(msg.topic, "sensors/warsaw/s1");
        assert_eq!(msg.entries().unwrap()[0][0], "1.00");
        assert!(other.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_succeeds() {
        let bus = MemoryBus::new();
        bus.publish("sensors/a/b", &[]).await.unwrap();
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_pruned() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe("sensors/#").await.unwrap();
        drop(sub);
        bus.publish("sensors/a/b", &[]).await.unwrap();
        assert!(bus.subscribers.lock().unwrap().is_empty());
    }
}
