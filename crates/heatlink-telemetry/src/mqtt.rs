//! Broker links.
//!
//! Each configured broker gets its own rumqttc client and event-loop task.
//! The set of links implements [`TelemetryPublisher`] keyed by broker name,
//! which is all the control side knows about the transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::Deserialize;
use tracing::{debug, info, warn};

use heatlink_core::{Clock, CoreError, Mutation, StateStore, TelemetryPublisher};

use crate::ingress::{self, TopicRouter};

fn default_port() -> u16 {
    1883
}
fn default_keep_alive_secs() -> u64 {
    30
}

/// Connection settings for one broker.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSettings {
    /// Name devices refer to in their `broker` field.
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

/// All broker links, keyed by broker name.
pub struct BrokerSet {
    clients: HashMap<String, AsyncClient>,
}

impl BrokerSet {
    /// Create the clients and spawn one event-loop task per broker.
    ///
    /// Subscriptions happen on `ConnAck`, so a broker that is down at
    /// startup is picked up as soon as rumqttc gets through to it.
    pub fn connect(
        settings: &[BrokerSettings],
        store: Arc<StateStore>,
        clock: Arc<dyn Clock>,
        running: Arc<AtomicBool>,
    ) -> Self {
        let mut clients = HashMap::new();

        for broker in settings {
            let router = Arc::new(TopicRouter::for_broker(store.registry(), &broker.name));

            let mut options = MqttOptions::new(
                format!("heatlink-{}", broker.name),
                broker.host.clone(),
                broker.port,
            );
            options.set_keep_alive(Duration::from_secs(broker.keep_alive_secs));
            if let (Some(username), Some(password)) = (&broker.username, &broker.password) {
                options.set_credentials(username.clone(), password.clone());
            }

            let (client, event_loop) = AsyncClient::new(options, 64);
            info!(broker = %broker.name, host = %broker.host, port = broker.port, "broker link created");

            tokio::spawn(run_event_loop(
                broker.name.clone(),
                event_loop,
                client.clone(),
                router,
                store.clone(),
                clock.clone(),
                running.clone(),
            ));

            clients.insert(broker.name.clone(), client);
        }

        Self { clients }
    }
}

#[async_trait]
impl TelemetryPublisher for BrokerSet {
    async fn publish(&self, broker: &str, topic: &str, payload: Vec<u8>) -> Result<(), CoreError> {
        let client = self
            .clients
            .get(broker)
            .ok_or_else(|| CoreError::Transport(format!("unknown broker: {broker}")))?;
        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|err| CoreError::Transport(err.to_string()))
    }
}

async fn run_event_loop(
    broker: String,
    mut event_loop: EventLoop,
    client: AsyncClient,
    router: Arc<TopicRouter>,
    store: Arc<StateStore>,
    clock: Arc<dyn Clock>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match event_loop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                info!(broker = %broker, "connected, replaying subscriptions");
                for topic in router.topics() {
                    if let Err(err) = client.subscribe(topic, QoS::AtLeastOnce).await {
                        warn!(broker = %broker, topic, error = %err, "subscribe failed");
                    }
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                ingress::handle_publish(
                    &store,
                    clock.as_ref(),
                    &router,
                    &publish.topic,
                    &publish.payload,
                );
            }
            Ok(event) => {
                debug!(broker = %broker, ?event, "mqtt event");
            }
            Err(err) => {
                // rumqttc reconnects on the next poll. Until then the
                // broker's devices are unreachable, so they go offline now
                // instead of waiting out the stale threshold.
                warn!(broker = %broker, error = %err, "mqtt connection error");
                for device_id in router.device_ids() {
                    if let Err(err) = store.apply(device_id, Mutation::SetOnline(false)) {
                        warn!(device_id, error = %err, "offline update failed");
                    }
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    debug!(broker = %broker, "event loop stopped");
}
