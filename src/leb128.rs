//! ULEB128 primitives shared by every stream dialect.
//!
//! All unsigned integers on the wire are ULEB128: little-endian base-128
//! groups of 7 bits, the high bit of each byte flagging a continuation.

/// Worst case for a `u64`: ceil(64 / 7) groups.
pub const MAX_LEN: usize = 10;

/// Encodes `value` into the head of `dst`, returning the number of bytes
/// written. The caller guarantees at least [`MAX_LEN`] bytes of room; the
/// encoder itself never writes past that bound.
pub fn write_u64(dst: &mut [u8], mut value: u64) -> usize {
    debug_assert!(dst.len() >= MAX_LEN);

    let mut n = 0;
    while value >= 0x80 {
        dst[n] = (value as u8 & 0x7f) | 0x80;
        value >>= 7;
        n += 1;
    }
    dst[n] = value as u8;
    n + 1
}

/// Decodes one ULEB128 integer from the head of `src`.
///
/// Returns the value and the number of bytes consumed, or `None` if the
/// input ends mid-integer or the encoding does not fit into 64 bits.
pub fn read_u64(src: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0;

    for (i, &byte) in src.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        if shift == 63 && (byte & 0x7f) > 1 {
            // The tenth byte may only carry the single remaining bit.
            return None;
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }

    None
}
