//! Single-precision float <-> holding register pair conversion.
//!
//! The meter publishes every measured quantity as an IEEE-754 `f32` spread
//! over two registers, high word first. Register one carries the upper 16
//! bits of the bit pattern and register two the lower 16 bits.

use byteorder::{BigEndian, ByteOrder};

pub fn encode_f32(value: f32) -> [u16; 2] {
    // -0.0 would otherwise leave the sign bit set in register one
    let value = if value == 0.0 { 0.0 } else { value };

    let mut buf = [0u8; 4];
    BigEndian::write_f32(&mut buf, value);
    [BigEndian::read_u16(&buf[0..2]), BigEndian::read_u16(&buf[2..4])]
}

pub fn decode_f32(registers: [u16; 2]) -> f32 {
    let mut buf = [0u8; 4];
    BigEndian::write_u16_into(&registers, &mut buf);
    BigEndian::read_f32(&buf)
}
