//! MBAP framing and PDU codec.
//!
//! All multi-byte integers are big-endian. Bit values are packed LSB-first
//! within each byte, as the function codes 01/02/15 require.

use thiserror::Error;

/// Function codes served by the slave.
pub mod function {
    pub const READ_COILS: u8 = 0x01;
    pub const READ_DISCRETE_INPUTS: u8 = 0x02;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const READ_INPUT_REGISTERS: u8 = 0x04;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
    pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
}

/// Modbus exception codes returned by this slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
}

/// PDU decode failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Nothing to answer; the connection is dropped.
    #[error("empty pdu")]
    EmptyPdu,
    /// Answerable failure: respond with the exception for this function.
    #[error("exception {code:?} for function {function:#04x}")]
    Exception { function: u8, code: ExceptionCode },
}

/// The 7-byte Modbus TCP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Remaining byte count: unit id + PDU.
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub const LEN: usize = 7;

    pub fn parse(bytes: &[u8; Self::LEN]) -> Self {
        Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        }
    }

    /// PDU length implied by the header, 0 when the length field is bogus.
    pub fn pdu_len(&self) -> usize {
        (self.length as usize).saturating_sub(1)
    }
}

/// A decoded request PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadCoils { address: u16, quantity: u16 },
    ReadDiscreteInputs { address: u16, quantity: u16 },
    ReadHoldingRegisters { address: u16, quantity: u16 },
    ReadInputRegisters { address: u16, quantity: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, values: Vec<bool> },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
}

impl Request {
    pub fn function_code(&self) -> u8 {
        match self {
            Request::ReadCoils { .. } => function::READ_COILS,
            Request::ReadDiscreteInputs { .. } => function::READ_DISCRETE_INPUTS,
            Request::ReadHoldingRegisters { .. } => function::READ_HOLDING_REGISTERS,
            Request::ReadInputRegisters { .. } => function::READ_INPUT_REGISTERS,
            Request::WriteSingleCoil { .. } => function::WRITE_SINGLE_COIL,
            Request::WriteSingleRegister { .. } => function::WRITE_SINGLE_REGISTER,
            Request::WriteMultipleCoils { .. } => function::WRITE_MULTIPLE_COILS,
            Request::WriteMultipleRegisters { .. } => function::WRITE_MULTIPLE_REGISTERS,
        }
    }

    /// Decode a request PDU (function code followed by data).
    pub fn decode(pdu: &[u8]) -> Result<Self, FrameError> {
        let (&fc, data) = pdu.split_first().ok_or(FrameError::EmptyPdu)?;
        let exception = |code| FrameError::Exception { function: fc, code };

        match fc {
            function::READ_COILS | function::READ_DISCRETE_INPUTS => {
                let (address, quantity) = decode_addr_quantity(fc, data)?;
                if !(1..=2000).contains(&quantity) {
                    return Err(exception(ExceptionCode::IllegalDataValue));
                }
                Ok(if fc == function::READ_COILS {
                    Request::ReadCoils { address, quantity }
                } else {
                    Request::ReadDiscreteInputs { address, quantity }
                })
            }
            function::READ_HOLDING_REGISTERS | function::READ_INPUT_REGISTERS => {
                let (address, quantity) = decode_addr_quantity(fc, data)?;
                if !(1..=125).contains(&quantity) {
                    return Err(exception(ExceptionCode::IllegalDataValue));
                }
                Ok(if fc == function::READ_HOLDING_REGISTERS {
                    Request::ReadHoldingRegisters { address, quantity }
                } else {
                    Request::ReadInputRegisters { address, quantity }
                })
            }
            function::WRITE_SINGLE_COIL => {
                let (address, raw) = decode_addr_quantity(fc, data)?;
                let value = match raw {
                    0xFF00 => true,
                    0x0000 => false,
                    _ => return Err(exception(ExceptionCode::IllegalDataValue)),
                };
                Ok(Request::WriteSingleCoil { address, value })
            }
            function::WRITE_SINGLE_REGISTER => {
                let (address, value) = decode_addr_quantity(fc, data)?;
                Ok(Request::WriteSingleRegister { address, value })
            }
            function::WRITE_MULTIPLE_COILS => {
                if data.len() < 5 {
                    return Err(exception(ExceptionCode::IllegalDataValue));
                }
                let address = u16::from_be_bytes([data[0], data[1]]);
                let quantity = u16::from_be_bytes([data[2], data[3]]);
                let byte_count = data[4] as usize;
                if !(1..=1968).contains(&quantity)
                    || byte_count != (quantity as usize).div_ceil(8)
                    || data.len() != 5 + byte_count
                {
                    return Err(exception(ExceptionCode::IllegalDataValue));
                }
                let values = unpack_bits(&data[5..], quantity as usize);
                Ok(Request::WriteMultipleCoils { address, values })
            }
            function::WRITE_MULTIPLE_REGISTERS => {
                if data.len() < 5 {
                    return Err(exception(ExceptionCode::IllegalDataValue));
                }
                let address = u16::from_be_bytes([data[0], data[1]]);
                let quantity = u16::from_be_bytes([data[2], data[3]]);
                let byte_count = data[4] as usize;
                if !(1..=123).contains(&quantity)
                    || byte_count != quantity as usize * 2
                    || data.len() != 5 + byte_count
                {
                    return Err(exception(ExceptionCode::IllegalDataValue));
                }
                let values = data[5..]
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                Ok(Request::WriteMultipleRegisters { address, values })
            }
            _ => Err(exception(ExceptionCode::IllegalFunction)),
        }
    }
}

fn decode_addr_quantity(fc: u8, data: &[u8]) -> Result<(u16, u16), FrameError> {
    if data.len() != 4 {
        return Err(FrameError::Exception {
            function: fc,
            code: ExceptionCode::IllegalDataValue,
        });
    }
    Ok((
        u16::from_be_bytes([data[0], data[1]]),
        u16::from_be_bytes([data[2], data[3]]),
    ))
}

/// A response PDU ready for encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// FC 01/02 bit read.
    Bits { function: u8, bits: Vec<bool> },
    /// FC 03/04 register read.
    Registers { function: u8, values: Vec<u16> },
    /// FC 05/06 echo.
    WriteSingle {
        function: u8,
        address: u16,
        value: u16,
    },
    /// FC 15/16 confirmation.
    WriteMultiple {
        function: u8,
        address: u16,
        quantity: u16,
    },
    Exception { function: u8, code: ExceptionCode },
}

impl Response {
    fn encode_pdu(&self) -> Vec<u8> {
        match self {
            Response::Bits { function, bits } => {
                let packed = pack_bits(bits);
                let mut pdu = Vec::with_capacity(2 + packed.len());
                pdu.push(*function);
                pdu.push(packed.len() as u8);
                pdu.extend_from_slice(&packed);
                pdu
            }
            Response::Registers { function, values } => {
                let mut pdu = Vec::with_capacity(2 + values.len() * 2);
                pdu.push(*function);
                pdu.push((values.len() * 2) as u8);
                for value in values {
                    pdu.extend_from_slice(&value.to_be_bytes());
                }
                pdu
            }
            Response::WriteSingle {
                function,
                address,
                value,
            } => {
                let mut pdu = Vec::with_capacity(5);
                pdu.push(*function);
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&value.to_be_bytes());
                pdu
            }
            Response::WriteMultiple {
                function,
                address,
                quantity,
            } => {
                let mut pdu = Vec::with_capacity(5);
                pdu.push(*function);
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&quantity.to_be_bytes());
                pdu
            }
            Response::Exception { function, code } => {
                vec![function | 0x80, *code as u8]
            }
        }
    }

    /// Encode the full ADU, echoing the request's transaction and unit ids.
    pub fn encode_adu(&self, transaction_id: u16, unit_id: u8) -> Vec<u8> {
        let pdu = self.encode_pdu();
        let mut adu = Vec::with_capacity(MbapHeader::LEN + pdu.len());
        adu.extend_from_slice(&transaction_id.to_be_bytes());
        adu.extend_from_slice(&0u16.to_be_bytes());
        adu.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
        adu.push(unit_id);
        adu.extend_from_slice(&pdu);
        adu
    }
}

/// Pack bits LSB-first into bytes; the tail of the last byte stays zero.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; bits.len().div_ceil(8)];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Unpack `count` bits, LSB-first per byte.
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes[i / 8] & (1 << (i % 8)) != 0)
        .collect()
}
