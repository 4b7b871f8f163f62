//! Publish/subscribe transport for sensor readings.
//!
//! Readings travel on `sensors/<location-sid>/<sensor-sid>` topics as a JSON
//! array of `[temperature, timestamp]` string pairs. The [`MessageBus`]
//! trait is implemented by the MQTT client used in production and by an
//! in-process bus used for local runs and tests.

pub mod memory;
pub mod mqtt;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use memory::MemoryBus;
pub use mqtt::MqttBus;

/// Prefix segment shared by every sensor topic.
pub const SENSORS_PREFIX: &str = "sensors";

/// Filter matching every sensor topic.
pub const SENSORS_FILTER: &str = "sensors/#";

/// One payload entry: `[temperature, timestamp]` on the wire.
pub type MessagePayload = Vec<String>;

/// Errors from bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("bus operation timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("payload encoding error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("payload decoding error: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("bus closed")]
    Closed,
}

/// A message received from the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Message {
    /// Decode the raw payload into its entries.
    pub fn entries(&self) -> Result<Vec<MessagePayload>, BusError> {
        decode_payload(&self.payload)
    }
}

/// Stream of messages for one subscription.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<Message>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<Message>) -> Self {
        Self { rx }
    }

    /// Next message, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

/// Topic-based publish/subscribe.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish payload entries on a topic.
    async fn publish(&self, topic: &str, payload: &[MessagePayload]) -> Result<(), BusError>;

    /// Subscribe to a topic filter (`+` and `#` wildcards).
    async fn subscribe(&self, filter: &str) -> Result<Subscription, BusError>;
}

/// Build the topic addressing a location sensor.
pub fn sensor_topic(location_sid: &str, sensor_sid: &str) -> String {
    format!("{}/{}/{}", SENSORS_PREFIX, location_sid, sensor_sid)
}

/// Split a sensor topic into `(location_sid, sensor_sid)`.
///
/// Returns `None` unless the topic has exactly three segments.
pub fn parse_sensor_topic(topic: &str) -> Option<(&str, &str)> {
    let parts: Vec<&str> = topic.split('/').collect();
    match parts.as_slice() {
        [_, location_sid, sensor_sid] => Some((location_sid, sensor_sid)),
        _ => None,
    }
}

/// MQTT topic filter matching.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

pub fn encode_payload(payload: &[MessagePayload]) -> Result<Vec<u8>, BusError> {
    serde_json::to_vec(payload).map_err(BusError::Encode)
}

pub fn decode_payload(bytes: &[u8]) -> Result<Vec<MessagePayload>, BusError> {
    serde_json::from_slice(bytes).map_err(BusError::Decode)
}
