//! IEEE-754 single-precision floats packed into two 16-bit registers.
//!
//! Bytes are always big-endian within the 32-bit word. The `swap` flag reverses
//! the register order for instruments that put the low word first. Conversion
//! goes through the raw bit pattern, so NaN payloads, infinities, signed zeros and
//! subnormals survive a round trip unchanged.

/// Split `value` into `[first, second]` registers.
pub fn encode_f32(value: f32, swap: bool) -> [u16; 2] {
    let bits = value.to_bits();
    let hi = (bits >> 16) as u16;
    let lo = (bits & 0xFFFF) as u16;
    if swap {
        [lo, hi]
    } else {
        [hi, lo]
    }
}

/// Reassemble a float from two registers as read from the wire.
pub fn decode_f32(registers: [u16; 2], swap: bool) -> f32 {
    let [hi, lo] = if swap {
        [registers[1], registers[0]]
    } else {
        registers
    };
    f32::from_bits((u32::from(hi) << 16) | u32::from(lo))
}

/// Registers as big-endian bytes, in wire order.
pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
    registers.iter().flat_map(|r| r.to_be_bytes()).collect()
}

/// Big-endian byte pairs as registers. A trailing odd byte is ignored.
pub fn bytes_to_registers(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}
