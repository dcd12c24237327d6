//! Typed state-change events.
//!
//! Every observable mutation of a device's state produces an [`Event`] on a
//! broadcast channel. Subscribers (the Modbus reflector, the WebSocket
//! gateway) each get their own receiver; a slow subscriber lags and resyncs,
//! it never blocks the mutation path.

use serde::Serialize;

/// What changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TempUpdated,
    SetpointChanged,
    ValveChanged,
    FanChanged,
    AutoEnabled,
    AutoDisabled,
    Emergency,
    EmergencyReset,
    PidTick,
    OnlineChanged,
    AlarmChanged,
}

/// A state change on one device. Per device, events are totally ordered and
/// reflect the order of applied mutations; across devices there is no
/// ordering guarantee.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub device_id: String,
    pub kind: EventKind,
}

impl Event {
    pub fn new(device_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            device_id: device_id.into(),
            kind,
        }
    }
}
