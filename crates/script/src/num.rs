//! Minimal script-number encoding.

use crate::{OP_0, OP_1, OP_1NEGATE};

/// Serialize an integer the way script push operations do: little-endian
/// magnitude with a sign bit in the top byte.
pub fn script_num_bytes(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let mut out = Vec::new();
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    // The most significant bit carries the sign; spill into an extra byte
    // when the magnitude already uses it.
    if out.last().map(|byte| byte & 0x80 != 0).unwrap_or(false) {
        out.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        let last = out.len() - 1;
        out[last] |= 0x80;
    }
    out
}

/// The exact byte prefix a coinbase script carries for a block height
/// (the push a script builder emits for that integer).
pub fn serialized_height(height: i32) -> Vec<u8> {
    let value = height as i64;
    if value == 0 {
        return vec![OP_0];
    }
    if value == -1 {
        return vec![OP_1NEGATE];
    }
    if (1..=16).contains(&value) {
        return vec![OP_1 + (value as u8) - 1];
    }
    let bytes = script_num_bytes(value);
    let mut out = Vec::with_capacity(bytes.len() + 1);
    out.push(bytes.len() as u8);
    out.extend_from_slice(&bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_heights_use_single_opcodes() {
        assert_eq!(serialized_height(0), vec![0x00]);
        assert_eq!(serialized_height(1), vec![0x51]);
        assert_eq!(serialized_height(16), vec![0x60]);
    }

    #[test]
    fn larger_heights_use_minimal_pushes() {
        assert_eq!(serialized_height(17), vec![0x01, 0x11]);
        assert_eq!(serialized_height(128), vec![0x02, 0x80, 0x00]);
        assert_eq!(serialized_height(1000), vec![0x02, 0xe8, 0x03]);
        assert_eq!(serialized_height(100_000), vec![0x03, 0xa0, 0x86, 0x01]);
    }
}
