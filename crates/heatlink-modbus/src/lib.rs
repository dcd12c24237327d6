//! Modbus TCP slave for the heatlink daemon.
//!
//! The wire protocol is implemented directly: MBAP framing and the PDU codec
//! live in [`frame`], the flat strided register image in [`plane`], the
//! per-device layout and scaling rules in [`map`]. The [`server`] accepts
//! any number of SCADA clients and serves reads from the plane; writes are
//! stored and translated into commands on the shared bus. The [`reflector`]
//! keeps the plane in step with the canonical device state, event-driven
//! with a 1 Hz sweep as the backstop.
//!
//! Addressing is flat: device N's holding registers start at
//! `(N-1) * 30`, input registers at `(N-1) * 20`, coils and discrete
//! inputs at `(N-1) * 16`. The effective unit is derived from the register
//! address, not from the MBAP unit byte, so one read can span many devices.

pub mod frame;
pub mod map;
pub mod plane;
pub mod reflector;
pub mod server;

pub use frame::{ExceptionCode, MbapHeader, Request, Response};
pub use plane::RegisterPlane;
pub use reflector::Reflector;
pub use server::ModbusServer;
