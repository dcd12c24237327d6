//! Inbound telemetry routing and parsing.
//!
//! The routing table is fixed at startup (the device table is static), so
//! the hot path is a single map lookup. Unparseable payloads are dropped
//! with a warning and never disturb the subscription.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{trace, warn};

use heatlink_core::{Clock, DeviceRegistry, Mutation, StateStore};

/// What an inbound topic carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Temperature,
    Alarm,
}

/// Topic → device routing for one broker.
pub struct TopicRouter {
    routes: HashMap<String, (String, TopicKind)>,
}

impl TopicRouter {
    /// Build the routing table for the devices attached to `broker`.
    pub fn for_broker(registry: &DeviceRegistry, broker: &str) -> Self {
        let mut routes = HashMap::new();
        for config in registry.iter().filter(|c| c.broker == broker) {
            routes.insert(
                config.topics.temperature_in.clone(),
                (config.device_id.clone(), TopicKind::Temperature),
            );
            if let Some(alarm_in) = &config.topics.alarm_in {
                routes.insert(
                    alarm_in.clone(),
                    (config.device_id.clone(), TopicKind::Alarm),
                );
            }
        }
        Self { routes }
    }

    pub fn route(&self, topic: &str) -> Option<&(String, TopicKind)> {
        self.routes.get(topic)
    }

    /// All topics this broker link must subscribe to.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// The devices routed through this broker, deduplicated.
    pub fn device_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.routes.values().map(|(id, _)| id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Fold one inbound publish into the state store.
pub fn handle_publish(
    store: &Arc<StateStore>,
    clock: &dyn Clock,
    router: &TopicRouter,
    topic: &str,
    payload: &[u8],
) {
    let Some((device_id, kind)) = router.route(topic) else {
        trace!(topic, "publish on unrouted topic ignored");
        return;
    };

    match kind {
        TopicKind::Temperature => {
            let Some(celsius) = parse_temperature(payload) else {
                warn!(
                    device_id = %device_id,
                    topic,
                    payload = %String::from_utf8_lossy(payload),
                    "unparseable temperature payload dropped"
                );
                return;
            };
            if let Err(err) = store.apply(
                device_id,
                Mutation::UpdateTemperature {
                    celsius,
                    at_ms: clock.now_ms(),
                },
            ) {
                warn!(device_id = %device_id, error = %err, "temperature update failed");
            }
        }
        TopicKind::Alarm => {
            let Some(alarm) = parse_flag(payload) else {
                warn!(
                    device_id = %device_id,
                    topic,
                    payload = %String::from_utf8_lossy(payload),
                    "unparseable alarm payload dropped"
                );
                return;
            };
            if let Err(err) = store.apply(device_id, Mutation::SetAlarm(alarm)) {
                warn!(device_id = %device_id, error = %err, "alarm update failed");
            }
        }
    }
}

/// Parse a decimal floating-point temperature; rejects non-finite values.
fn parse_temperature(payload: &[u8]) -> Option<f32> {
    let text = std::str::from_utf8(payload).ok()?;
    let value: f32 = text.trim().parse().ok()?;
    value.is_finite().then_some(value)
}

fn parse_flag(payload: &[u8]) -> Option<bool> {
    let text = std::str::from_utf8(payload).ok()?;
    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => None,
    }
}
