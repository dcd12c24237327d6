//! Per-device mutable state and the store that owns it.
//!
//! The [`StateStore`] is the only owner of [`DeviceState`]. Every surface
//! mutates through [`StateStore::apply`], which takes the device's lock,
//! applies one [`Mutation`] atomically and emits the resulting events after
//! the lock is released. Critical sections are short and never perform I/O;
//! publishes happen before or after the mutation on the caller's side.
//!
//! Invariants enforced here, per atomic update:
//! - `setpoint_min <= setpoint_temperature <= setpoint_max`
//! - `0 <= fan_output <= 100`
//! - `emergency_stop ⇒ !auto_enabled && fan_output == 0 && valve closed`
//! - `is_working ⇔ fan_output > 0`

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::DeviceConfig;
use crate::error::CoreError;
use crate::event::{Event, EventKind};
use crate::registry::DeviceRegistry;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Valve relay position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValveState {
    Closed,
    Open,
}

impl ValveState {
    pub fn is_open(&self) -> bool {
        matches!(self, ValveState::Open)
    }

    /// Register and telemetry encoding: `1` open, `0` closed.
    pub fn wire_value(&self) -> u16 {
        match self {
            ValveState::Open => 1,
            ValveState::Closed => 0,
        }
    }
}

/// Live state of one heating controller.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceState {
    /// Last measured temperature, °C.
    pub current_temperature: f32,
    /// Target temperature, °C.
    pub setpoint_temperature: f32,
    /// Published fan/pump output, percent.
    pub fan_output: f32,
    /// Raw saturated regulator output, percent.
    pub pid_output: f32,
    pub valve_state: ValveState,
    pub auto_enabled: bool,
    pub emergency_stop: bool,
    /// `fan_output > 0`.
    pub is_working: bool,
    pub is_online: bool,
    pub alarm: bool,
    /// Regulator integral accumulator.
    pub integral: f32,
    /// Previous regulator error, for the derivative term.
    pub prev_error: f32,
    /// Wall-clock ms of the last regulator tick.
    pub last_tick_ms: i64,
    /// Wall-clock ms of the last accepted temperature reading.
    pub last_temperature_update_ms: i64,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            current_temperature: 0.0,
            setpoint_temperature: 20.0,
            fan_output: 0.0,
            pid_output: 0.0,
            valve_state: ValveState::Closed,
            auto_enabled: false,
            emergency_stop: false,
            is_working: false,
            is_online: false,
            alarm: false,
            integral: 0.0,
            prev_error: 0.0,
            last_tick_ms: 0,
            last_temperature_update_ms: 0,
        }
    }
}

/// One atomic state change.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// A parsed telemetry reading arrived.
    UpdateTemperature { celsius: f32, at_ms: i64 },
    /// New setpoint, validated against the device's accepted range.
    SetSetpoint(f32),
    /// Enable or disable the regulator. Enabling clears the emergency latch
    /// and resets the regulator internals; disabling zeroes the outputs.
    SetAuto(bool),
    /// Latch or release the emergency stop. Latching forces outputs off.
    SetEmergency(bool),
    /// Update actuator shadows after a publish.
    SetActuators {
        fan: Option<f32>,
        pid: Option<f32>,
        valve: Option<ValveState>,
    },
    /// Store regulator internals at the end of a tick.
    SetRegulator {
        integral: f32,
        prev_error: f32,
        last_tick_ms: i64,
    },
    /// Health transition driven by the staleness scan or the broker link.
    SetOnline(bool),
    /// Hardware alarm flag from the optional alarm topic.
    SetAlarm(bool),
}

struct DeviceEntry {
    config: Arc<DeviceConfig>,
    state: Mutex<DeviceState>,
}

/// Owner of all device state, indexed by `device_id` and `unit_id`.
pub struct StateStore {
    registry: Arc<DeviceRegistry>,
    entries: HashMap<String, DeviceEntry>,
    events: broadcast::Sender<Event>,
}

impl StateStore {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let entries = registry
            .iter()
            .map(|config| {
                (
                    config.device_id.clone(),
                    DeviceEntry {
                        config: config.clone(),
                        state: Mutex::new(DeviceState::default()),
                    },
                )
            })
            .collect();
        Self {
            registry,
            entries,
            events,
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Subscribe to the state-change event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Consistent snapshot of one device.
    pub fn snapshot(&self, device_id: &str) -> Result<DeviceState, CoreError> {
        let entry = self.entry(device_id)?;
        Ok(entry.state.lock().expect("state lock poisoned").clone())
    }

    /// Snapshot addressed by Modbus unit id.
    pub fn snapshot_by_unit(&self, unit_id: u8) -> Result<(Arc<DeviceConfig>, DeviceState), CoreError> {
        let config = self
            .registry
            .by_unit(unit_id)
            .ok_or(CoreError::UnknownUnit(unit_id))?
            .clone();
        let state = self.snapshot(&config.device_id)?;
        Ok((config, state))
    }

    /// Snapshots of every device, in configuration order.
    pub fn all(&self) -> Vec<(Arc<DeviceConfig>, DeviceState)> {
        self.registry
            .iter()
            .filter_map(|config| {
                self.snapshot(&config.device_id)
                    .ok()
                    .map(|state| (config.clone(), state))
            })
            .collect()
    }

    pub fn config(&self, device_id: &str) -> Result<&Arc<DeviceConfig>, CoreError> {
        Ok(&self.entry(device_id)?.config)
    }

    /// Apply one mutation atomically and broadcast the resulting events.
    pub fn apply(&self, device_id: &str, mutation: Mutation) -> Result<(), CoreError> {
        let entry = self.entry(device_id)?;
        let mut kinds = Vec::new();
        {
            let mut state = entry.state.lock().expect("state lock poisoned");
            Self::mutate(&entry.config, &mut state, mutation, &mut kinds)?;
        }
        for kind in kinds {
            let _ = self.events.send(Event::new(device_id, kind));
        }
        Ok(())
    }

    fn entry(&self, device_id: &str) -> Result<&DeviceEntry, CoreError> {
        self.entries
            .get(device_id)
            .ok_or_else(|| CoreError::UnknownDevice(device_id.to_string()))
    }

    fn mutate(
        config: &DeviceConfig,
        s: &mut DeviceState,
        mutation: Mutation,
        kinds: &mut Vec<EventKind>,
    ) -> Result<(), CoreError> {
        match mutation {
            Mutation::UpdateTemperature { celsius, at_ms } => {
                s.current_temperature = celsius;
                s.last_temperature_update_ms = at_ms;
                if !s.is_online {
                    s.is_online = true;
                    kinds.push(EventKind::OnlineChanged);
                }
                kinds.push(EventKind::TempUpdated);
            }
            Mutation::SetSetpoint(value) => {
                if !config.setpoint_in_range(value) {
                    return Err(CoreError::SetpointOutOfRange {
                        value,
                        min: config.setpoint_min,
                        max: config.setpoint_max,
                    });
                }
                s.setpoint_temperature = value;
                kinds.push(EventKind::SetpointChanged);
            }
            Mutation::SetAuto(true) => {
                s.emergency_stop = false;
                if !s.auto_enabled {
                    s.auto_enabled = true;
                    s.integral = 0.0;
                    s.prev_error = 0.0;
                    kinds.push(EventKind::AutoEnabled);
                }
            }
            Mutation::SetAuto(false) => {
                if s.auto_enabled {
                    s.auto_enabled = false;
                    kinds.push(EventKind::AutoDisabled);
                }
                if s.fan_output != 0.0 {
                    kinds.push(EventKind::FanChanged);
                }
                s.fan_output = 0.0;
                s.pid_output = 0.0;
                s.is_working = false;
            }
            Mutation::SetEmergency(true) => {
                if !s.emergency_stop {
                    s.emergency_stop = true;
                    kinds.push(EventKind::Emergency);
                }
                s.auto_enabled = false;
                s.fan_output = 0.0;
                s.pid_output = 0.0;
                s.is_working = false;
                if s.valve_state != ValveState::Closed {
                    s.valve_state = ValveState::Closed;
                    kinds.push(EventKind::ValveChanged);
                }
            }
            Mutation::SetEmergency(false) => {
                if s.emergency_stop {
                    s.emergency_stop = false;
                    kinds.push(EventKind::EmergencyReset);
                }
            }
            Mutation::SetActuators { fan, pid, valve } => {
                // While the emergency latch is set the outputs stay forced
                // off; late publishes from a racing tick must not reopen them.
                if s.emergency_stop {
                    debug!(
                        device_id = %config.device_id,
                        "actuator update ignored while in emergency stop"
                    );
                    return Ok(());
                }
                if let Some(fan) = fan {
                    let fan = fan.clamp(0.0, 100.0);
                    if fan != s.fan_output {
                        kinds.push(EventKind::FanChanged);
                    }
                    s.fan_output = fan;
                    s.is_working = fan > 0.0;
                }
                if let Some(pid) = pid {
                    s.pid_output = pid;
                }
                if let Some(valve) = valve {
                    if valve != s.valve_state {
                        s.valve_state = valve;
                        kinds.push(EventKind::ValveChanged);
                    }
                }
            }
            Mutation::SetRegulator {
                integral,
                prev_error,
                last_tick_ms,
            } => {
                s.integral = integral;
                s.prev_error = prev_error;
                s.last_tick_ms = last_tick_ms;
                kinds.push(EventKind::PidTick);
            }
            Mutation::SetOnline(online) => {
                if s.is_online != online {
                    s.is_online = online;
                    kinds.push(EventKind::OnlineChanged);
                }
            }
            Mutation::SetAlarm(alarm) => {
                if s.alarm != alarm {
                    s.alarm = alarm;
                    kinds.push(EventKind::AlarmChanged);
                }
            }
        }
        Ok(())
    }
}
