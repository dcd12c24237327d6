//! The Modbus TCP slave.
//!
//! Each accepted connection gets its own task. Reads are served from the
//! register plane; writes are stored in the plane (so an immediate read-back
//! returns the written value) and translated into commands on the shared
//! bus, which re-enter the same mutation paths as every other surface.
//!
//! The effective device is always derived from the register address via the
//! area stride. The MBAP unit byte is validated and echoed, and a mismatch
//! with the derived unit is logged, but the derived unit wins; this is what
//! the SCADA integration relies on for bulk reads across devices.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use heatlink_core::{Command, CommandBus, CommandSource, DeviceConfig, StateStore};

use crate::frame::{ExceptionCode, FrameError, MbapHeader, Request, Response};
use crate::map::{self, command_word, holding, BIT_STRIDE, HOLDING_STRIDE, INPUT_STRIDE};
use crate::plane::RegisterPlane;

/// Multi-client Modbus TCP slave over the register plane.
pub struct ModbusServer {
    plane: Arc<RegisterPlane>,
    store: Arc<StateStore>,
    commands: CommandBus,
    idle_timeout: Duration,
}

impl ModbusServer {
    pub fn new(
        plane: Arc<RegisterPlane>,
        store: Arc<StateStore>,
        commands: CommandBus,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            plane,
            store,
            commands,
            idle_timeout,
        })
    }

    /// Accept clients until the listener is torn down.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        info!(addr = ?listener.local_addr().ok(), "modbus slave listening");
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        info!(%peer, "modbus client connected");
                        if let Err(err) = server.handle_connection(stream, peer).await {
                            debug!(%peer, error = %err, "connection closed with error");
                        }
                        info!(%peer, "modbus client disconnected");
                    });
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let mut header_buf = [0u8; MbapHeader::LEN];
        loop {
            match timeout(self.idle_timeout, stream.read_exact(&mut header_buf)).await {
                Err(_) => {
                    info!(%peer, "idle timeout, closing connection");
                    return Ok(());
                }
                Ok(Err(err)) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Ok(Err(err)) => return Err(err),
                Ok(Ok(_)) => {}
            }

            let header = MbapHeader::parse(&header_buf);
            if header.protocol_id != 0 {
                warn!(%peer, protocol_id = header.protocol_id, "non-Modbus protocol id, closing");
                return Ok(());
            }
            let pdu_len = header.pdu_len();
            if pdu_len == 0 || pdu_len > 253 {
                warn!(%peer, length = header.length, "malformed MBAP length, closing");
                return Ok(());
            }
            if !(1..=247).contains(&header.unit_id) {
                warn!(%peer, unit_id = header.unit_id, "MBAP unit id outside [1, 247]");
            }

            let mut pdu = vec![0u8; pdu_len];
            match timeout(self.idle_timeout, stream.read_exact(&mut pdu)).await {
                Err(_) => {
                    info!(%peer, "idle timeout mid-frame, closing connection");
                    return Ok(());
                }
                Ok(Err(err)) => return Err(err),
                Ok(Ok(_)) => {}
            }

            let response = match Request::decode(&pdu) {
                Ok(request) => self.dispatch(request, header.unit_id).await,
                Err(FrameError::Exception { function, code }) => {
                    debug!(%peer, function, ?code, "request rejected at decode");
                    Response::Exception { function, code }
                }
                Err(FrameError::EmptyPdu) => {
                    warn!(%peer, "empty pdu, closing");
                    return Ok(());
                }
            };

            stream
                .write_all(&response.encode_adu(header.transaction_id, header.unit_id))
                .await?;
        }
    }

    async fn dispatch(&self, request: Request, mbap_unit: u8) -> Response {
        let function_code = request.function_code();
        let exception = |code| Response::Exception {
            function: function_code,
            code,
        };

        match request {
            Request::ReadCoils { address, quantity } => {
                self.note_unit_mismatch(mbap_unit, address, BIT_STRIDE);
                match self.plane.read_coils(address, quantity) {
                    Ok(bits) => Response::Bits {
                        function: function_code,
                        bits,
                    },
                    Err(code) => exception(code),
                }
            }
            Request::ReadDiscreteInputs { address, quantity } => {
                self.note_unit_mismatch(mbap_unit, address, BIT_STRIDE);
                match self.plane.read_discrete(address, quantity) {
                    Ok(bits) => Response::Bits {
                        function: function_code,
                        bits,
                    },
                    Err(code) => exception(code),
                }
            }
            Request::ReadHoldingRegisters { address, quantity } => {
                self.note_unit_mismatch(mbap_unit, address, HOLDING_STRIDE);
                match self.plane.read_holding(address, quantity) {
                    Ok(values) => Response::Registers {
                        function: function_code,
                        values,
                    },
                    Err(code) => exception(code),
                }
            }
            Request::ReadInputRegisters { address, quantity } => {
                self.note_unit_mismatch(mbap_unit, address, INPUT_STRIDE);
                match self.plane.read_input(address, quantity) {
                    Ok(values) => Response::Registers {
                        function: function_code,
                        values,
                    },
                    Err(code) => exception(code),
                }
            }
            Request::WriteSingleCoil { address, value } => {
                self.note_unit_mismatch(mbap_unit, address, BIT_STRIDE);
                match self.apply_coil_write(address, value).await {
                    Ok(()) => Response::WriteSingle {
                        function: function_code,
                        address,
                        value: if value { 0xFF00 } else { 0x0000 },
                    },
                    Err(code) => exception(code),
                }
            }
            Request::WriteMultipleCoils { address, values } => {
                self.note_unit_mismatch(mbap_unit, address, BIT_STRIDE);
                let quantity = values.len() as u16;
                // Validate the whole range before touching anything.
                for offset in 0..quantity {
                    if self.device_for(address + offset, BIT_STRIDE).is_err() {
                        return exception(ExceptionCode::IllegalDataAddress);
                    }
                }
                for (offset, value) in values.into_iter().enumerate() {
                    if let Err(code) = self.apply_coil_write(address + offset as u16, value).await {
                        return exception(code);
                    }
                }
                Response::WriteMultiple {
                    function: function_code,
                    address,
                    quantity,
                }
            }
            Request::WriteSingleRegister { address, value } => {
                self.note_unit_mismatch(mbap_unit, address, HOLDING_STRIDE);
                match self.plan_register_write(address, value) {
                    Ok(planned) => {
                        self.apply_register_write(planned).await;
                        Response::WriteSingle {
                            function: function_code,
                            address,
                            value,
                        }
                    }
                    Err(code) => exception(code),
                }
            }
            Request::WriteMultipleRegisters { address, values } => {
                self.note_unit_mismatch(mbap_unit, address, HOLDING_STRIDE);
                let quantity = values.len() as u16;
                let mut planned = Vec::with_capacity(values.len());
                for (offset, value) in values.into_iter().enumerate() {
                    match self.plan_register_write(address + offset as u16, value) {
                        Ok(write) => planned.push(write),
                        Err(code) => return exception(code),
                    }
                }
                for write in planned {
                    self.apply_register_write(write).await;
                }
                Response::WriteMultiple {
                    function: function_code,
                    address,
                    quantity,
                }
            }
        }
    }

    /// Resolve the device occupying the flat address for an area stride.
    fn device_for(&self, address: u16, stride: u16) -> Result<Arc<DeviceConfig>, ExceptionCode> {
        let unit_index = (address / stride) as usize;
        if unit_index >= self.plane.unit_count() {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        self.store
            .registry()
            .by_unit(unit_index as u8 + 1)
            .cloned()
            .ok_or(ExceptionCode::IllegalDataAddress)
    }

    fn note_unit_mismatch(&self, mbap_unit: u8, address: u16, stride: u16) {
        let derived = (address / stride) as u8 + 1;
        if mbap_unit != derived {
            debug!(
                mbap_unit,
                derived, "MBAP unit byte differs from address-derived unit, using derived"
            );
        }
    }

    async fn apply_coil_write(&self, address: u16, value: bool) -> Result<(), ExceptionCode> {
        let config = self.device_for(address, BIT_STRIDE)?;
        self.plane.write_coil(address, value)?;

        match address % BIT_STRIDE {
            map::coil::AUTO_CONTROL_ENABLED => {
                let command = if value {
                    Command::EnableAuto
                } else {
                    Command::DisableAuto
                };
                if let Err(err) = self
                    .commands
                    .dispatch(config.device_id.clone(), command, CommandSource::Modbus)
                    .await
                {
                    warn!(device_id = %config.device_id, error = %err, "coil command dispatch failed");
                }
            }
            map::coil::MANUAL_OVERRIDE => {
                info!(device_id = %config.device_id, value, "manual override coil is reserved, write logged only");
            }
            rel => {
                debug!(device_id = %config.device_id, rel, value, "write to reserved coil");
            }
        }
        Ok(())
    }

    /// Validate a holding-register write without side effects.
    fn plan_register_write(
        &self,
        address: u16,
        value: u16,
    ) -> Result<RegisterWrite, ExceptionCode> {
        let config = self.device_for(address, HOLDING_STRIDE)?;
        match address % HOLDING_STRIDE {
            holding::SETPOINT_TEMP => {
                let setpoint = map::decode_scaled(value);
                if !config.setpoint_in_range(setpoint) {
                    return Err(ExceptionCode::IllegalDataValue);
                }
                Ok(RegisterWrite {
                    address,
                    value,
                    config,
                    action: WriteAction::Setpoint(setpoint),
                })
            }
            holding::COMMAND => {
                let command = decode_command_word(value)?;
                Ok(RegisterWrite {
                    address,
                    // The COMMAND register reads back zero once dispatched.
                    value: 0,
                    config,
                    action: WriteAction::Command(command),
                })
            }
            _ => Ok(RegisterWrite {
                address,
                value,
                config,
                action: WriteAction::Store,
            }),
        }
    }

    async fn apply_register_write(&self, write: RegisterWrite) {
        if let Err(code) = self.plane.write_holding(write.address, write.value) {
            // Bounds were checked during planning.
            warn!(address = write.address, ?code, "plane write failed");
            return;
        }
        let command = match write.action {
            WriteAction::Store => return,
            WriteAction::Setpoint(setpoint) => Command::SetTemperature(setpoint),
            WriteAction::Command(None) => return,
            WriteAction::Command(Some(command)) => command,
        };
        if let Err(err) = self
            .commands
            .dispatch(
                write.config.device_id.clone(),
                command,
                CommandSource::Modbus,
            )
            .await
        {
            warn!(device_id = %write.config.device_id, error = %err, "register command dispatch failed");
        }
    }
}

struct RegisterWrite {
    address: u16,
    value: u16,
    config: Arc<DeviceConfig>,
    action: WriteAction,
}

enum WriteAction {
    /// Plain store into the plane, no command.
    Store,
    Setpoint(f32),
    /// Decoded COMMAND word; `None` is the explicit NOP.
    Command(Option<Command>),
}

/// Decode the COMMAND word. Disable wins when both bits are set; any unknown
/// bit is an illegal data value.
fn decode_command_word(value: u16) -> Result<Option<Command>, ExceptionCode> {
    if value == 0 {
        return Ok(None);
    }
    if value & !command_word::KNOWN_BITS != 0 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    if value & command_word::DISABLE_AUTO != 0 {
        Ok(Some(Command::DisableAuto))
    } else {
        Ok(Some(Command::EnableAuto))
    }
}
