//! Core domain model for the heatlink heating-control daemon.
//!
//! This crate owns everything the concurrent surfaces (telemetry ingress,
//! regulator tasks, Modbus slave, HTTP/WS facade) share: the static device
//! registry, the per-device state store with its typed event stream, the
//! command bus, the seasonal valve policy and the clock abstraction.
//!
//! Nothing in here performs I/O. Transport concerns live behind the
//! [`TelemetryPublisher`] port so the control logic stays testable with
//! in-memory fakes.

pub mod clock;
pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod registry;
pub mod season;
pub mod state;
pub mod telemetry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{Command, CommandBus, CommandEnvelope, CommandSource};
pub use config::{DeviceConfig, DeviceTopics, RegulatorGains, SafetyLimits};
pub use error::CoreError;
pub use event::{Event, EventKind};
pub use registry::DeviceRegistry;
pub use season::valve_target;
pub use state::{DeviceState, Mutation, StateStore, ValveState};
pub use telemetry::{fan_payload, valve_payload, TelemetryPublisher};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
