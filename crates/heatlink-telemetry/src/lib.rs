//! MQTT telemetry transport.
//!
//! One broker link per configured broker: a rumqttc `AsyncClient` plus a
//! polled event loop task. Inbound publishes are routed by topic to the
//! device they belong to and folded into the state store; outbound publishes
//! implement the [`TelemetryPublisher`] port for the control side. rumqttc
//! reconnects on its own; subscriptions are replayed on every `ConnAck`, so
//! the initial connect and every reconnect share the same path.

pub mod health;
pub mod ingress;
pub mod mqtt;

pub use health::spawn_health_task;
pub use ingress::{TopicKind, TopicRouter};
pub use mqtt::{BrokerSet, BrokerSettings};
