//! Wire formats spoken by the instruments
//!
//! - [`register_codec`]: floats packed into Modbus holding registers
//! - [`modbus_rtu`]: RTU request/response framing with CRC-16
//! - [`line_parser`]: ASCII status lines from the hygrometer and temperature probe

pub mod line_parser;
pub mod modbus_rtu;
pub mod register_codec;

pub use line_parser::{parse_hygrometer_line, parse_probe_line, HygrometerSample};
pub use register_codec::{decode_f32, encode_f32};
