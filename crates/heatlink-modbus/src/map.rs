//! Per-device register layout and value encoding.
//!
//! Each device occupies a fixed stride in every area: 30 holding registers,
//! 20 input registers, 16 coils and 16 discrete inputs. Temperatures and
//! regulator outputs are INT16 two's complement scaled by 10; the status
//! word and the discrete inputs expose the same bit set.

use heatlink_core::{DeviceConfig, DeviceState};

use crate::plane::UnitSlice;

pub const HOLDING_STRIDE: u16 = 30;
pub const INPUT_STRIDE: u16 = 20;
pub const BIT_STRIDE: u16 = 16;

/// Holding register offsets within a device slice.
pub mod holding {
    pub const SETPOINT_TEMP: u16 = 0;
    pub const HYSTERESIS: u16 = 1;
    pub const TEMP_LOW: u16 = 2;
    pub const TEMP_HIGH: u16 = 3;
    pub const FREEZE_LIMIT: u16 = 4;
    pub const OVERHEAT_LIMIT: u16 = 5;
    pub const COMMAND: u16 = 10;
    pub const DEVICE_NAME_START: u16 = 20;
    pub const DEVICE_NAME_REGS: u16 = 5;
}

/// Input register offsets within a device slice.
pub mod input {
    pub const CURRENT_TEMP: u16 = 0;
    pub const CURRENT_FAN_SPEED: u16 = 1;
    pub const VALVE_STATE: u16 = 2;
    pub const PID_OUTPUT: u16 = 3;
    pub const STATUS_WORD: u16 = 4;
}

/// Coil offsets within a device slice.
pub mod coil {
    pub const AUTO_CONTROL_ENABLED: u16 = 0;
    /// Reserved; writes are accepted and logged only.
    pub const MANUAL_OVERRIDE: u16 = 1;
}

/// Status word bits; the discrete inputs mirror bits 0..7.
pub mod status {
    pub const IS_ONLINE: u16 = 1 << 0;
    pub const IS_WORKING: u16 = 1 << 1;
    pub const IS_EMERGENCY_STOP: u16 = 1 << 2;
    pub const TEMP_SENSOR_ERROR: u16 = 1 << 3;
    pub const PID_ACTIVE: u16 = 1 << 4;
    pub const FREEZE_PROTECTION: u16 = 1 << 5;
    pub const OVERHEAT_PROTECTION: u16 = 1 << 6;
    pub const VALVE_OPEN: u16 = 1 << 7;
}

/// COMMAND word bits (holding register 10).
pub mod command_word {
    pub const ENABLE_AUTO: u16 = 0x0002;
    pub const DISABLE_AUTO: u16 = 0x0004;
    pub const KNOWN_BITS: u16 = ENABLE_AUTO | DISABLE_AUTO;
}

/// Engineering value → INT16 two's complement register, scaled by 10.
pub fn encode_scaled(value: f32) -> u16 {
    ((value * 10.0).round() as i32 as i16) as u16
}

/// Register → engineering value, sign-extended and descaled.
pub fn decode_scaled(raw: u16) -> f32 {
    (raw as i16) as f32 / 10.0
}

/// Assemble the status word from a state snapshot.
pub fn status_word(config: &DeviceConfig, state: &DeviceState, now_ms: i64) -> u16 {
    let mut word = 0;
    if state.is_online {
        word |= status::IS_ONLINE;
    }
    if state.is_working {
        word |= status::IS_WORKING;
    }
    if state.emergency_stop {
        word |= status::IS_EMERGENCY_STOP;
    }
    if now_ms - state.last_temperature_update_ms > config.stale_threshold_ms {
        word |= status::TEMP_SENSOR_ERROR;
    }
    if state.auto_enabled {
        word |= status::PID_ACTIVE;
    }
    let has_reading = state.last_temperature_update_ms != 0;
    if has_reading && state.current_temperature < config.safety.freeze_limit {
        word |= status::FREEZE_PROTECTION;
    }
    if has_reading && state.current_temperature > config.safety.overheat_limit {
        word |= status::OVERHEAT_PROTECTION;
    }
    if state.valve_state.is_open() {
        word |= status::VALVE_OPEN;
    }
    word
}

/// 10 ASCII bytes, space-padded, big-endian-packed into 5 registers.
pub fn pack_device_name(name: &str) -> [u16; holding::DEVICE_NAME_REGS as usize] {
    let mut bytes = [b' '; 10];
    for (slot, ch) in bytes.iter_mut().zip(name.chars()) {
        *slot = if ch.is_ascii() { ch as u8 } else { b'?' };
    }
    let mut regs = [0u16; holding::DEVICE_NAME_REGS as usize];
    for (i, reg) in regs.iter_mut().enumerate() {
        *reg = u16::from_be_bytes([bytes[i * 2], bytes[i * 2 + 1]]);
    }
    regs
}

/// Rewrite the mapped registers of one device slice from a state snapshot.
///
/// Reserved registers and the COMMAND word are left untouched, so values a
/// SCADA client parked there survive the 1 Hz sweep.
pub fn render_into(slice: &mut UnitSlice, config: &DeviceConfig, state: &DeviceState, now_ms: i64) {
    slice.holding[holding::SETPOINT_TEMP as usize] = encode_scaled(state.setpoint_temperature);
    slice.holding[holding::HYSTERESIS as usize] = encode_scaled(config.safety.hysteresis);
    slice.holding[holding::TEMP_LOW as usize] = encode_scaled(config.setpoint_min);
    slice.holding[holding::TEMP_HIGH as usize] = encode_scaled(config.setpoint_max);
    slice.holding[holding::FREEZE_LIMIT as usize] = encode_scaled(config.safety.freeze_limit);
    slice.holding[holding::OVERHEAT_LIMIT as usize] = encode_scaled(config.safety.overheat_limit);
    let name = pack_device_name(&config.device_id);
    let start = holding::DEVICE_NAME_START as usize;
    slice.holding[start..start + name.len()].copy_from_slice(&name);

    slice.input[input::CURRENT_TEMP as usize] = encode_scaled(state.current_temperature);
    slice.input[input::CURRENT_FAN_SPEED as usize] = state.fan_output.round() as u16;
    slice.input[input::VALVE_STATE as usize] = state.valve_state.wire_value();
    slice.input[input::PID_OUTPUT as usize] = encode_scaled(state.pid_output);
    let word = status_word(config, state, now_ms);
    slice.input[input::STATUS_WORD as usize] = word;

    if state.auto_enabled {
        slice.coils |= 1 << coil::AUTO_CONTROL_ENABLED;
    } else {
        slice.coils &= !(1 << coil::AUTO_CONTROL_ENABLED);
    }

    // Discrete inputs mirror status bits 0..7; 8..15 stay reserved.
    slice.discrete = word & 0x00FF;
}
