//! Sensor bus reader.
//!
//! Subscribes to every sensor topic and stores what arrives. Each message is
//! handled in its own task; a bad topic, an unknown sensor or a malformed
//! entry drops only the affected unit of work.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::bus::{parse_sensor_topic, BusError, Message, MessageBus, MessagePayload, SENSORS_FILTER};
use crate::model::SensorReading;
use crate::store::{SensorStore, StoreError};

/// Errors that stop the reader.
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("subscribe failed: {0}")]
    Subscribe(#[source] BusError),
}

/// Reasons a whole message is dropped.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("invalid topic format {0}")]
    InvalidTopic(String),

    #[error("unknown sensor {sensor_sid} at location {location_sid}")]
    UnknownSensor {
        location_sid: String,
        sensor_sid: String,
    },

    #[error("invalid payload on {topic}: {source}")]
    Payload { topic: String, source: BusError },

    #[error("store sensor data: {0}")]
    Store(#[from] StoreError),
}

/// Reasons a single payload entry is skipped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EntryError {
    #[error("entry {index}: invalid payload length {len}")]
    InvalidLength { index: usize, len: usize },

    #[error("entry {index}: failed to parse sensor value {value:?}: {reason}")]
    Value {
        index: usize,
        value: String,
        reason: String,
    },

    #[error("entry {index}: failed to parse sensor time {value:?}: {reason}")]
    Time {
        index: usize,
        value: String,
        reason: String,
    },
}

/// Result of parsing one message payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPayload {
    /// Readings in payload order.
    pub readings: Vec<SensorReading>,
    pub errors: Vec<EntryError>,
}

/// What happened to one message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ingested {
    pub stored: usize,
    pub rejected: Vec<EntryError>,
}

fn parse_entry(
    sensor_id: i64,
    index: usize,
    entry: &MessagePayload,
) -> Result<SensorReading, EntryError> {
    let [value, time] = entry.as_slice() else {
        return Err(EntryError::InvalidLength {
            index,
            len: entry.len(),
        });
    };

    let temperature: f64 = value.trim().parse().map_err(|e: std::num::ParseFloatError| {
        EntryError::Value {
            index,
            value: value.clone(),
            reason: e.to_string(),
        }
    })?;
    if !temperature.is_finite() {
        return Err(EntryError::Value {
            index,
            value: value.clone(),
            reason: "not a finite number".to_string(),
        });
    }

    let timestamp = DateTime::parse_from_rfc3339(time)
        .map_err(|e| EntryError::Time {
            index,
            value: time.clone(),
            reason: e.to_string(),
        })?
        .with_timezone(&Utc);

    Ok(SensorReading {
        location_sensor_id: sensor_id,
        timestamp,
        temperature,
    })
}

/// Parse every entry independently, keeping the ones that are valid.
pub fn parse_sensor_data(sensor_id: i64, entries: &[MessagePayload]) -> ParsedPayload {
    let mut parsed = ParsedPayload::default();
    for (index, entry) in entries.iter().enumerate() {
        match parse_entry(sensor_id, index, entry) {
            Ok(reading) => parsed.readings.push(reading),
            Err(e) => parsed.errors.push(e),
        }
    }
    parsed
}

/// Resolve, parse and store one message.
pub async fn ingest(store: &dyn SensorStore, message: &Message) -> Result<Ingested, MessageError> {
    let (location_sid, sensor_sid) = parse_sensor_topic(&message.topic)
        .ok_or_else(|| MessageError::InvalidTopic(message.topic.clone()))?;

    let sensor_id = store
        .location_sensor_id(location_sid, sensor_sid)
        .await?
        .ok_or_else(|| MessageError::UnknownSensor {
            location_sid: location_sid.to_string(),
            sensor_sid: sensor_sid.to_string(),
        })?;

    let entries = message.entries().map_err(|source| MessageError::Payload {
        topic: message.topic.clone(),
        source,
    })?;

    let parsed = parse_sensor_data(sensor_id, &entries);
    let stored = if parsed.readings.is_empty() {
        0
    } else {
        store.insert_readings(&parsed.readings).await?
    };

    Ok(Ingested {
        stored,
        rejected: parsed.errors,
    })
}

async fn handle(store: Arc<dyn SensorStore>, message: Message) {
    match ingest(store.as_ref(), &message).await {
        Ok(ingested) => {
            for e in &ingested.rejected {
                log::warn!("[Reader] {}: {}", message.topic, e);
            }
            log::debug!(
                "[Reader] stored {} readings from {}",
                ingested.stored,
                message.topic
            );
        }
        Err(e @ MessageError::Store(_)) => log::error!("[Reader] {}: {}", message.topic, e),
        Err(e) => log::warn!("[Reader] dropped message: {}", e),
    }
}

pub struct Reader {
    store: Arc<dyn SensorStore>,
    bus: Arc<dyn MessageBus>,
}

impl Reader {
    pub fn new(store: Arc<dyn SensorStore>, bus: Arc<dyn MessageBus>) -> Self {
        Self { store, bus }
    }

    /// Subscribe to all sensor topics and store incoming readings until
    /// shutdown. Only a failed subscription is an error; in-flight messages
    /// are finished before returning.
    pub async fn listen(&self, mut shutdown: watch::Receiver<()>) -> Result<(), ReaderError> {
        let mut subscription = self
            .bus
            .subscribe(SENSORS_FILTER)
            .await
            .map_err(ReaderError::Subscribe)?;
        log::info!("[Reader] listening on {}", SENSORS_FILTER);

        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                message = subscription.recv() => match message {
                    Some(message) => {
                        tasks.spawn(handle(self.store.clone(), message));
                    }
                    None => {
                        log::warn!("[Reader] subscription closed");
                        break;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        log::error!("[Reader] message handler failed: {}", e);
                    }
                }
                Ok(()) = shutdown.changed() => {
                    log::info!("[Reader] shutdown signal received");
                    break;
                }
            }
        }

        while tasks.join_next().await.is_some() {}
        log::info!("[Reader] stopped");
        Ok(())
    }
}
