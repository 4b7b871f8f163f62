//! MQTT bus backed by `rumqttc`.
//!
//! A background task drives the `rumqttc` event loop and fans incoming
//! publishes out to subscriptions by topic filter. Subscriptions are
//! re-issued after every reconnect.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{
    encode_payload, topic_matches, BusError, Message, MessageBus, MessagePayload, Subscription,
};
use crate::config::MqttConfig;

const REQUEST_CAPACITY: usize = 64;
const CHANNEL_CAPACITY: usize = 256;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

struct Subscriber {
    filter: String,
    tx: mpsc::Sender<Message>,
}

type Subscribers = Arc<Mutex<Vec<Subscriber>>>;

/// Connected MQTT client.
///
/// Dropping the bus stops the event loop; call [`MqttBus::close`] first to
/// send a clean DISCONNECT.
pub struct MqttBus {
    client: AsyncClient,
    subscribers: Subscribers,
    event_task: JoinHandle<()>,
    timeout: Duration,
}

/// Build client options from configuration.
pub fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.as_deref().unwrap_or_default());
    }
    options
}

impl MqttBus {
    /// Create the client and start its event loop. Must be called inside a
    /// tokio runtime; the connection itself is established in the background.
    pub fn connect(config: &MqttConfig) -> Self {
        let (client, eventloop) = AsyncClient::new(mqtt_options(config), REQUEST_CAPACITY);
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));

        log::info!(
            "[Mqtt] connecting to {}:{} as {}",
            config.host,
            config.port,
            config.client_id
        );
        let event_task = tokio::spawn(drive(eventloop, client.clone(), subscribers.clone()));

        Self {
            client,
            subscribers,
            event_task,
            timeout: config.operation_timeout(),
        }
    }

    /// Disconnect from the broker and stop the event loop.
    pub async fn close(&self) {
        match tokio::time::timeout(self.timeout, self.client.disconnect()).await {
            Ok(Ok(())) => log::info!("[Mqtt] disconnected"),
            Ok(Err(e)) => log::warn!("[Mqtt] disconnect failed: {}", e),
            Err(_) => log::warn!("[Mqtt] disconnect timed out"),
        }
        self.event_task.abort();
    }

    async fn with_timeout<F>(&self, request: F) -> Result<(), BusError>
    where
        F: std::future::Future<Output = Result<(), rumqttc::ClientError>>,
    {
        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| BusError::Timeout(self.timeout))?
            .map_err(BusError::from)
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        self.event_task.abort();
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn publish(&self, topic: &str, payload: &[MessagePayload]) -> Result<(), BusError> {
        let bytes = encode_payload(payload)?;
        self.with_timeout(self.client.publish(topic, QoS::AtLeastOnce, false, bytes))
            .await
    }

    async fn subscribe(&self, filter: &str) -> Result<Subscription, BusError> {
        // Register locally first so nothing the broker sends right after
        // SUBACK is routed to nobody.
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.subscribers
            .lock()
            .map_err(|_| BusError::Closed)?
            .push(Subscriber {
                filter: filter.to_string(),
                tx: tx.clone(),
            });

        let request = self
            .with_timeout(self.client.subscribe(filter, QoS::AtLeastOnce))
            .await;
        if let Err(e) = request {
            unregister(&self.subscribers, &tx);
            return Err(e);
        }

        log::info!("[Mqtt] subscribed to {}", filter);
        Ok(Subscription::new(rx))
    }
}

/// Senders whose filter matches `topic`. Closed subscriptions are pruned.
fn route(subscribers: &Subscribers, topic: &str) -> Vec<mpsc::Sender<Message>> {
    let mut subscribers = match subscribers.lock() {
        Ok(s) => s,
        Err(e) => {
            log::error!("[Mqtt] subscriber list poisoned: {}", e);
            return Vec::new();
        }
    };
    subscribers.retain(|s| !s.tx.is_closed());
    subscribers
        .iter()
        .filter(|s| topic_matches(&s.filter, topic))
        .map(|s| s.tx.clone())
        .collect()
}

/// Drop the subscriber owning `tx`.
fn unregister(subscribers: &Subscribers, tx: &mpsc::Sender<Message>) {
    if let Ok(mut subscribers) = subscribers.lock() {
        subscribers.retain(|s| !s.tx.same_channel(tx));
    }
}

fn filters(subscribers: &Subscribers) -> Vec<String> {
    subscribers
        .lock()
        .map(|s| s.iter().map(|s| s.filter.clone()).collect())
        .unwrap_or_default()
}

async fn drive(mut eventloop: EventLoop, client: AsyncClient, subscribers: Subscribers) {
    let mut connected_before = false;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                log::debug!(
                    "[Mqtt] message on {} ({} bytes)",
                    publish.topic,
                    publish.payload.len()
                );
                let message = Message {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                for tx in route(&subscribers, &message.topic) {
                    let _ = tx.send(message.clone()).await;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                log::info!("[Mqtt] connected");
                if connected_before {
                    for filter in filters(&subscribers) {
                        if let Err(e) = client.try_subscribe(&filter, QoS::AtLeastOnce) {
                            log::error!("[Mqtt] resubscribe to {} failed: {}", filter, e);
                        }
                    }
                }
                connected_before = true;
            }
            Ok(_) => {}
            Err(e) => {
                log::error!("[Mqtt] connection error: {}", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
