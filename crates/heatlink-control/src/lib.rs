//! Closed-loop control for the heatlink daemon.
//!
//! One regulator task per device runs the 1 Hz loop: PID with hysteresis
//! dead-zone and soft anti-windup, the minimum-output cut-off of the fan
//! dimmer, the seasonal valve policy and the safety interlocks. The command
//! dispatcher drains the shared command bus and executes the command table
//! serially, so telemetry updates, regulator ticks and commands interleave
//! in a single total order per device.

pub mod commands;
pub mod pid;
pub mod regulator;
pub mod sweep;

pub use commands::CommandDispatcher;
pub use pid::{PidInput, PidOutcome};
pub use regulator::RegulatorSet;
pub use sweep::startup_valve_sweep;
