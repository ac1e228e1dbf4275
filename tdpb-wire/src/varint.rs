//! Encode and decode varints.
//!
//! Variable length integers (_varints_) are the default encoding of integers
//! in Protocol Buffers messages, including field tags and numbers.
//!
//! See <https://protobuf.dev/programming-guides/encoding/#varints>.

/// Maximum number of bytes for an encoded varint.
///
/// A decoded varint is a u64 value. Each byte contains 7 value bits and one
/// continuation bit. Hence we need 9 "full" bytes plus one bit from the 10th byte.
pub const MAX_VARINT_LEN: usize = 10;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VarintError {
    /// The input ended before the final byte of the varint.
    Truncated,
    /// The varint length exceeds 10 bytes or the value exceeds 64 bits.
    Malformed,
}

/// Decode a varint from the start of `buf`.
///
/// Returns the value and the number of bytes it occupied.
#[inline]
pub fn decode_varint(buf: &[u8]) -> Result<(u64, usize), VarintError> {
    match buf.first() {
        Some(&byte) if byte < 0x80 => return Ok((byte as u64, 1)),
        Some(_) => {}
        None => return Err(VarintError::Truncated),
    }
    decode_varint_slow(buf)
}

#[cold]
fn decode_varint_slow(buf: &[u8]) -> Result<(u64, usize), VarintError> {
    let mut value = 0;
    for (i, byte) in buf.iter().copied().take(MAX_VARINT_LEN).enumerate() {
        // High bit is continuation bit. Low 7 bits are the payload.
        value |= ((byte & 0x7f) as u64) << (i * 7);
        if byte < 0x80 {
            // Only one value bit from the last byte may be used.
            if i + 1 == MAX_VARINT_LEN && byte > 0x01 {
                return Err(VarintError::Malformed);
            }
            return Ok((value, i + 1));
        }
    }

    if buf.len() < MAX_VARINT_LEN {
        Err(VarintError::Truncated)
    } else {
        Err(VarintError::Malformed)
    }
}

/// Append the varint encoding of `val` to `out`.
pub fn encode_varint(mut val: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (val & 0x7f) as u8;
        if val <= 0x7f {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
        val >>= 7;
    }
}

/// Return the number of bytes [`encode_varint`] would produce for `val`.
pub fn varint_len(val: u64) -> usize {
    let bits = 64 - (val | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

/// Decode a zig-zag encoded `sint32` value.
#[inline]
pub fn zigzag_decode32(val: u32) -> i32 {
    ((val >> 1) as i32) ^ -((val & 1) as i32)
}

/// Decode a zig-zag encoded `sint64` value.
#[inline]
pub fn zigzag_decode64(val: u64) -> i64 {
    ((val >> 1) as i64) ^ -((val & 1) as i64)
}

/// Zig-zag encode an `sint32` value.
#[inline]
pub fn zigzag_encode32(val: i32) -> u32 {
    ((val << 1) ^ (val >> 31)) as u32
}

/// Zig-zag encode an `sint64` value.
#[inline]
pub fn zigzag_encode64(val: i64) -> u64 {
    ((val << 1) ^ (val >> 63)) as u64
}

#[cfg(test)]
mod tests {
    use super::{
        VarintError, decode_varint, encode_varint, varint_len, zigzag_decode32, zigzag_decode64,
        zigzag_encode32, zigzag_encode64,
    };

    fn encode(val: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_varint(val, &mut buf);
        buf
    }

    #[test]
    fn test_decode_varint() {
        let mut values: Vec<u64> = (0..1024).collect();
        values.push(u32::MAX as u64);
        values.push(u64::MAX);
        for val in values {
            let buf = encode(val);
            assert_eq!(buf.len(), varint_len(val));
            let (decoded_val, len) = decode_varint(&buf).unwrap();
            assert_eq!(decoded_val, val);
            assert_eq!(len, buf.len());
        }
    }

    #[test]
    fn test_decode_varint_sequence() {
        // Example from https://protobuf.dev/programming-guides/encoding/#simple.
        let buf = [0x08, 0x96, 0x01];
        let (val, len) = decode_varint(&buf).unwrap();
        assert_eq!((val, len), (8, 1));

        let (val, len) = decode_varint(&buf[1..]).unwrap();
        assert_eq!((val, len), (150, 2));

        assert_eq!(decode_varint(&buf[3..]), Err(VarintError::Truncated));
    }

    #[test]
    fn test_truncated_varint() {
        let buf = encode(u64::MAX);
        for len in 0..buf.len() {
            assert_eq!(decode_varint(&buf[..len]), Err(VarintError::Truncated));
        }
    }

    #[test]
    fn test_invalid_varint() {
        // Too many value bits in the final byte.
        let mut buf = encode(u64::MAX);
        assert_eq!(buf.len(), 10);
        buf[9] += 1;
        assert_eq!(decode_varint(&buf), Err(VarintError::Malformed));

        // Eleven bytes.
        let buf = [0xff; 11];
        assert_eq!(decode_varint(&buf), Err(VarintError::Malformed));
    }

    #[test]
    fn test_zigzag() {
        assert_eq!(zigzag_decode32(0), 0);
        assert_eq!(zigzag_decode32(1), -1);
        assert_eq!(zigzag_decode32(2), 1);
        assert_eq!(zigzag_decode32(u32::MAX), i32::MIN);
        assert_eq!(zigzag_decode64(u64::MAX - 1), i64::MAX);

        for val in [0, 1, -1, 12345, -12345, i32::MIN, i32::MAX] {
            assert_eq!(zigzag_decode32(zigzag_encode32(val)), val);
            assert_eq!(zigzag_decode64(zigzag_encode64(val as i64)), val as i64);
        }
    }
}
