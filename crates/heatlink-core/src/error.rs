//! Error types shared across the daemon.

use thiserror::Error;

/// Errors produced by the core state and command paths.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No device with this id in the registry.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// No device occupies this Modbus unit id.
    #[error("unknown unit id: {0}")]
    UnknownUnit(u8),

    /// Setpoint outside the accepted range for the device.
    #[error("setpoint {value} outside accepted range [{min}, {max}]")]
    SetpointOutOfRange { value: f32, min: f32, max: f32 },

    /// Fan speed outside 0..100 %.
    #[error("fan speed {0} outside accepted range [0, 100]")]
    FanSpeedOutOfRange(f32),

    /// Two devices configured with the same device id.
    #[error("duplicate device id: {0}")]
    DuplicateDeviceId(String),

    /// Two devices configured with the same Modbus unit id.
    #[error("duplicate unit id: {0}")]
    DuplicateUnitId(u8),

    /// Unit id outside the Modbus address range.
    #[error("unit id {0} outside Modbus range [1, 247]")]
    UnitIdOutOfRange(u8),

    /// Telemetry transport failure (publish or subscribe).
    #[error("telemetry transport: {0}")]
    Transport(String),

    /// The command dispatcher is gone; the daemon is shutting down.
    #[error("command channel closed")]
    ChannelClosed,
}

impl CoreError {
    /// True for caller mistakes that should surface as a validation error
    /// (HTTP 400, Modbus exception 03) rather than a server fault.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            CoreError::SetpointOutOfRange { .. } | CoreError::FanSpeedOutOfRange(_)
        )
    }
}
