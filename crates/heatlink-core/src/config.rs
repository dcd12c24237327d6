//! Static per-device configuration.
//!
//! One [`DeviceConfig`] per physical heating controller, loaded at startup
//! and never mutated afterwards. Serde defaults match the values the SCADA
//! integration was commissioned with.

use serde::{Deserialize, Serialize};

/// Telemetry topic names for one controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceTopics {
    /// Inbound temperature readings (decimal float payload).
    pub temperature_in: String,
    /// Outbound valve relay command (`1` open, `0` closed).
    pub valve_relay_out: String,
    /// Outbound fan/pump dimmer command (integer percent).
    pub fan_dimmer_out: String,
    /// Optional inbound hardware alarm flag.
    #[serde(default)]
    pub alarm_in: Option<String>,
}

/// PID gains and output limits for one regulator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegulatorGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    #[serde(default = "default_out_min")]
    pub out_min: f32,
    #[serde(default = "default_out_max")]
    pub out_max: f32,
    /// Soft anti-windup: the integral is multiplied by this factor while the
    /// error is negative. Kept from the commissioned controllers, not a
    /// textbook clamp.
    #[serde(default = "default_integral_decay")]
    pub integral_decay: f32,
}

/// Safety limits and actuator constraints.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Below this temperature the fan is forced to `out_max` and the valve
    /// opened, without tripping the emergency latch.
    #[serde(default = "default_freeze_limit")]
    pub freeze_limit: f32,
    /// Above this temperature the device is put into emergency stop.
    #[serde(default = "default_overheat_limit")]
    pub overheat_limit: f32,
    /// Dead-band half-width around the setpoint; the actuator is not
    /// switched off while inside the band.
    #[serde(default = "default_hysteresis")]
    pub hysteresis: f32,
    /// The dimmer misbehaves below this output percentage, so anything under
    /// it is published as 0.
    #[serde(default = "default_min_output_threshold")]
    pub min_output_threshold: f32,
}

fn default_out_min() -> f32 {
    0.0
}
fn default_out_max() -> f32 {
    100.0
}
fn default_integral_decay() -> f32 {
    0.95
}
fn default_freeze_limit() -> f32 {
    5.0
}
fn default_overheat_limit() -> f32 {
    35.0
}
fn default_hysteresis() -> f32 {
    0.5
}
fn default_min_output_threshold() -> f32 {
    15.0
}
fn default_setpoint_min() -> f32 {
    5.0
}
fn default_setpoint_max() -> f32 {
    35.0
}
fn default_stale_threshold_ms() -> i64 {
    30_000
}

/// Immutable configuration of one heating controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique operator-assigned identifier.
    pub device_id: String,
    /// Modbus unit id, unique, 1..=247.
    pub unit_id: u8,
    /// Name of the telemetry broker this controller is attached to.
    pub broker: String,
    pub topics: DeviceTopics,
    pub gains: RegulatorGains,
    #[serde(default)]
    pub safety: SafetyLimits,
    /// Accepted setpoint range in degrees Celsius.
    #[serde(default = "default_setpoint_min")]
    pub setpoint_min: f32,
    #[serde(default = "default_setpoint_max")]
    pub setpoint_max: f32,
    /// A reading older than this marks the sensor stale: `is_online` drops
    /// and the Modbus status word raises the sensor-error bit.
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: i64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            freeze_limit: default_freeze_limit(),
            overheat_limit: default_overheat_limit(),
            hysteresis: default_hysteresis(),
            min_output_threshold: default_min_output_threshold(),
        }
    }
}

impl DeviceConfig {
    /// True when `value` is inside the accepted setpoint range.
    pub fn setpoint_in_range(&self, value: f32) -> bool {
        value >= self.setpoint_min && value <= self.setpoint_max
    }
}
