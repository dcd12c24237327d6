//! Telemetry egress port.
//!
//! The control logic publishes actuator commands through this trait; the
//! rumqttc-backed implementation lives in `heatlink-telemetry`. Payload
//! encodings match what the controllers expect on the wire: integers for
//! the fan dimmer, `1`/`0` for the valve relay.

use async_trait::async_trait;

use crate::error::CoreError;
use crate::state::ValveState;

/// Outbound publish capability, keyed by broker name.
#[async_trait]
pub trait TelemetryPublisher: Send + Sync {
    async fn publish(&self, broker: &str, topic: &str, payload: Vec<u8>) -> Result<(), CoreError>;
}

/// Fan dimmer payload: integer percent, 0..100.
pub fn fan_payload(percent: f32) -> Vec<u8> {
    let value = percent.round().clamp(0.0, 100.0) as i64;
    value.to_string().into_bytes()
}

/// Valve relay payload: `1` open, `0` closed.
pub fn valve_payload(valve: ValveState) -> Vec<u8> {
    match valve {
        ValveState::Open => b"1".to_vec(),
        ValveState::Closed => b"0".to_vec(),
    }
}
