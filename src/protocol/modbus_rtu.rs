//! Modbus RTU framing for the two function codes the flow controllers use.
//!
//! Only holding-register reads (0x03) and multi-register writes (0x10) are
//! modelled. Frames are `[station, function, payload.., crc_lo, crc_hi]` with
//! CRC-16/MODBUS (reflected polynomial 0xA001, initial value 0xFFFF).
//!
//! The request parsers and response builders at the bottom exist so a simulated
//! bus can answer driver requests in tests.

use super::register_codec::{bytes_to_registers, registers_to_bytes};
use crate::error::{AppResult, DaqError};

/// Read Holding Registers
pub const READ_HOLDING_REGISTERS: u8 = 0x03;
/// Write Multiple Registers
pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
/// Set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Length of the fixed head every response starts with: station, function, and
/// either a byte count or an exception code.
pub const RESPONSE_HEAD_LEN: usize = 3;
/// Length of an exception response
pub const EXCEPTION_RESPONSE_LEN: usize = 5;
/// Length of a write-multiple-registers acknowledgement
pub const WRITE_RESPONSE_LEN: usize = 8;

/// Illegal Data Address
pub const EXCEPTION_ILLEGAL_ADDRESS: u8 = 0x02;
/// Illegal Data Value
pub const EXCEPTION_ILLEGAL_VALUE: u8 = 0x03;

/// CRC-16/MODBUS over `data`
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn seal(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

fn check_crc(frame: &[u8]) -> AppResult<()> {
    if frame.len() < 4 {
        return Err(DaqError::Protocol(format!("frame too short: {} bytes", frame.len())));
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let expected = crc16(body);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    if expected != received {
        return Err(DaqError::Protocol(format!(
            "CRC mismatch: expected {expected:04X}, received {received:04X}"
        )));
    }
    Ok(())
}

/// Build a Read Holding Registers request
pub fn read_registers_request(station: u8, start: u16, count: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(station);
    frame.push(READ_HOLDING_REGISTERS);
    frame.extend_from_slice(&start.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    seal(frame)
}

/// Build a Write Multiple Registers request
pub fn write_registers_request(station: u8, start: u16, values: &[u16]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(9 + values.len() * 2);
    frame.push(station);
    frame.push(WRITE_MULTIPLE_REGISTERS);
    frame.extend_from_slice(&start.to_be_bytes());
    frame.extend_from_slice(&(values.len() as u16).to_be_bytes());
    frame.push((values.len() * 2) as u8);
    frame.extend(registers_to_bytes(values));
    seal(frame)
}

/// Expected length of a successful read response carrying `count` registers
pub fn read_response_len(count: u16) -> usize {
    5 + usize::from(count) * 2
}

/// Total frame length given the first [`RESPONSE_HEAD_LEN`] bytes of a response
/// and the length a successful response would have.
pub fn response_len(head: &[u8; RESPONSE_HEAD_LEN], success_len: usize) -> usize {
    if head[1] & EXCEPTION_FLAG != 0 {
        EXCEPTION_RESPONSE_LEN
    } else {
        success_len
    }
}

fn check_header(station: u8, function: u8, frame: &[u8]) -> AppResult<()> {
    check_crc(frame)?;
    if frame[0] != station {
        return Err(DaqError::Protocol(format!(
            "response from station {} while addressing {station}",
            frame[0]
        )));
    }
    if frame[1] == function | EXCEPTION_FLAG {
        return Err(DaqError::ModbusException {
            station,
            code: frame[2],
        });
    }
    if frame[1] != function {
        return Err(DaqError::Protocol(format!(
            "unexpected function code 0x{:02X} (expected 0x{function:02X})",
            frame[1]
        )));
    }
    Ok(())
}

/// Validate a read response and extract its registers
pub fn parse_read_response(station: u8, count: u16, frame: &[u8]) -> AppResult<Vec<u16>> {
    check_header(station, READ_HOLDING_REGISTERS, frame)?;
    let byte_count = usize::from(frame[2]);
    if byte_count != usize::from(count) * 2 || frame.len() != 5 + byte_count {
        return Err(DaqError::Protocol(format!(
            "expected {count} registers, response carries {byte_count} bytes"
        )));
    }
    Ok(bytes_to_registers(&frame[3..3 + byte_count]))
}

/// Validate a write acknowledgement against the request it answers
pub fn parse_write_response(station: u8, start: u16, count: u16, frame: &[u8]) -> AppResult<()> {
    check_header(station, WRITE_MULTIPLE_REGISTERS, frame)?;
    if frame.len() != WRITE_RESPONSE_LEN {
        return Err(DaqError::Protocol(format!(
            "write acknowledgement has {} bytes",
            frame.len()
        )));
    }
    let echoed_start = u16::from_be_bytes([frame[2], frame[3]]);
    let echoed_count = u16::from_be_bytes([frame[4], frame[5]]);
    if echoed_start != start || echoed_count != count {
        return Err(DaqError::Protocol(format!(
            "write echo mismatch: {echoed_start:#06X}/{echoed_count} for {start:#06X}/{count}"
        )));
    }
    Ok(())
}

/// A decoded request, as seen by a station on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Read Holding Registers
    Read {
        /// Addressed station
        station: u8,
        /// First register
        start: u16,
        /// Number of registers
        count: u16,
    },
    /// Write Multiple Registers
    Write {
        /// Addressed station
        station: u8,
        /// First register
        start: u16,
        /// Register values in order
        values: Vec<u16>,
    },
}

impl Request {
    /// Addressed station
    pub fn station(&self) -> u8 {
        match self {
            Request::Read { station, .. } | Request::Write { station, .. } => *station,
        }
    }
}

/// Decode a request frame
pub fn parse_request(frame: &[u8]) -> AppResult<Request> {
    check_crc(frame)?;
    if frame.len() < 8 {
        return Err(DaqError::Protocol(format!("request too short: {} bytes", frame.len())));
    }
    let station = frame[0];
    let start = u16::from_be_bytes([frame[2], frame[3]]);
    let count = u16::from_be_bytes([frame[4], frame[5]]);
    match frame[1] {
        READ_HOLDING_REGISTERS => Ok(Request::Read {
            station,
            start,
            count,
        }),
        WRITE_MULTIPLE_REGISTERS => {
            let byte_count = usize::from(frame[6]);
            if byte_count != usize::from(count) * 2 || frame.len() != 9 + byte_count {
                return Err(DaqError::Protocol("malformed write request".to_string()));
            }
            let values = bytes_to_registers(&frame[7..7 + byte_count]);
            Ok(Request::Write {
                station,
                start,
                values,
            })
        }
        other => Err(DaqError::Protocol(format!("unsupported function 0x{other:02X}"))),
    }
}

/// Build a successful read response
pub fn read_response(station: u8, registers: &[u16]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5 + registers.len() * 2);
    frame.push(station);
    frame.push(READ_HOLDING_REGISTERS);
    frame.push((registers.len() * 2) as u8);
    frame.extend(registers_to_bytes(registers));
    seal(frame)
}

/// Build a write acknowledgement
pub fn write_response(station: u8, start: u16, count: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(WRITE_RESPONSE_LEN);
    frame.push(station);
    frame.push(WRITE_MULTIPLE_REGISTERS);
    frame.extend_from_slice(&start.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    seal(frame)
}

/// Build an exception response
pub fn exception_response(station: u8, function: u8, code: u8) -> Vec<u8> {
    seal(vec![station, function | EXCEPTION_FLAG, code])
}
