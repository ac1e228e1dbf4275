//! Bounds-checked decoding of wire values from a byte slice.
//!
//! A [`ReadCursor`] reads from a window `[pos, end)` of an input buffer.
//! Positions are always absolute offsets into the whole buffer, so that
//! values read by nested cursors can be related back to the original input.

use std::ops::Range;

use crate::errors::{ErrorKind, WireError};
use crate::varint::decode_varint;

/// Largest valid field number.
pub const MAX_FIELD_NUMBER: u32 = (1 << 29) - 1;

/// Wire type of a field.
///
/// See <https://protobuf.dev/programming-guides/encoding/#structure>.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WireType {
    /// Integer value encoded as a varint.
    Varint = 0,

    /// 64-bit fixed-width value.
    I64 = 1,

    /// A variable-length value with a size specified in bytes.
    Len = 2,

    /// Deprecated start-of-group type.
    SGroup = 3,

    /// Deprecated end-of-group type.
    EGroup = 4,

    /// 32-bit fixed-width value.
    I32 = 5,
}

impl WireType {
    /// Convert the low 3 bits of a tag into a wire type.
    pub fn from_bits(bits: u8) -> Option<WireType> {
        match bits {
            0 => Some(Self::Varint),
            1 => Some(Self::I64),
            2 => Some(Self::Len),
            3 => Some(Self::SGroup),
            4 => Some(Self::EGroup),
            5 => Some(Self::I32),
            _ => None,
        }
    }
}

/// Combine a field number and wire type into a tag.
#[inline]
pub const fn make_tag(number: u32, wire_type: WireType) -> u32 {
    (number << 3) | wire_type as u32
}

/// Reads primitive wire values from a window of an input buffer.
#[derive(Clone, Debug)]
pub struct ReadCursor<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,

    /// True if this window is the payload of a length-delimited field, so
    /// reaching its end does not mean the input was cut short.
    nested: bool,
}

impl<'a> ReadCursor<'a> {
    /// Create a cursor which reads the whole of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            end: buf.len(),
            nested: false,
        }
    }

    /// Create a cursor which reads `range` of `buf`.
    ///
    /// Panics if the range is out of bounds.
    pub fn with_range(buf: &'a [u8], range: Range<usize>) -> Self {
        assert!(range.start <= range.end && range.end <= buf.len());
        Self {
            buf,
            pos: range.start,
            end: range.end,
            nested: range.end < buf.len(),
        }
    }

    /// Return the whole underlying buffer.
    pub fn buffer(&self) -> &'a [u8] {
        self.buf
    }

    /// Absolute offset of the next byte to be read.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Absolute offset of the end of this cursor's window.
    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    /// Number of bytes left in this cursor's window.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.end - self.pos
    }

    #[inline]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.end
    }

    /// Return true if this cursor reads the payload of a length-delimited
    /// field rather than the whole input.
    #[inline]
    pub fn is_nested(&self) -> bool {
        self.nested
    }

    /// Create a cursor over the next `len` bytes and advance past them.
    ///
    /// The caller must have checked `len <= self.remaining()`.
    pub fn split(&mut self, len: usize) -> ReadCursor<'a> {
        debug_assert!(len <= self.remaining());
        let sub = ReadCursor {
            buf: self.buf,
            pos: self.pos,
            end: self.pos + len,
            nested: true,
        };
        self.pos += len;
        sub
    }

    fn error(&self, kind: ErrorKind) -> WireError {
        WireError::new(kind).at(self.pos)
    }

    /// Read an LEB128-encoded varint.
    #[inline]
    pub fn read_varint(&mut self) -> Result<u64, WireError> {
        let (val, len) =
            decode_varint(&self.buf[self.pos..self.end]).map_err(|e| WireError::from(e).at(self.pos))?;
        self.pos += len;
        Ok(val)
    }

    /// Read a field tag and split it into a field number and wire type.
    ///
    /// Tags with a field number of zero, or which do not fit in 32 bits, are
    /// rejected. The wire type is returned as raw bits since values 6 and 7
    /// are handled by the caller.
    #[inline]
    pub fn read_tag(&mut self) -> Result<(u32, u8), WireError> {
        let start = self.pos;
        let tag = self.read_varint()?;
        if tag > u32::MAX as u64 || (tag >> 3) == 0 {
            return Err(WireError::new(ErrorKind::MalformedTag).at(start));
        }
        Ok(((tag >> 3) as u32, (tag & 0x7) as u8))
    }

    /// Read a 4-byte little-endian value.
    #[inline]
    pub fn read_fixed32(&mut self) -> Result<u32, WireError> {
        let bytes = self.read_array::<4>()?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Read an 8-byte little-endian value.
    #[inline]
    pub fn read_fixed64(&mut self) -> Result<u64, WireError> {
        let bytes = self.read_array::<8>()?;
        Ok(u64::from_le_bytes(bytes))
    }

    #[inline]
    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        match self.buf[self.pos..self.end].first_chunk::<N>() {
            Some(bytes) => {
                self.pos += N;
                Ok(*bytes)
            }
            None => Err(self.error(ErrorKind::TruncatedInput)),
        }
    }

    /// Read the length prefix of a length-delimited value.
    ///
    /// Fails with [`ErrorKind::Overflow`] if the length exceeds the remaining
    /// input.
    #[inline]
    pub fn read_len(&mut self) -> Result<usize, WireError> {
        let start = self.pos;
        let len = self.read_varint()?;
        if len > self.remaining() as u64 {
            return Err(WireError::new(ErrorKind::Overflow).at(start));
        }
        Ok(len as usize)
    }

    /// Read `len` bytes.
    #[inline]
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if len > self.remaining() {
            return Err(self.error(ErrorKind::TruncatedInput));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Read a length-delimited value and return its absolute range in the
    /// buffer.
    #[inline]
    pub fn read_len_range(&mut self) -> Result<Range<usize>, WireError> {
        let len = self.read_len()?;
        let start = self.pos;
        self.pos += len;
        Ok(start..start + len)
    }

    /// Skip over the value of a field whose tag has just been read.
    ///
    /// For start-group fields this skips the whole group including the
    /// matching end-group tag. `max_depth` bounds the nesting of groups.
    ///
    /// Returns the number of fields skipped. This is 1 plus, for a group,
    /// the number of fields nested inside it.
    pub fn skip_field(
        &mut self,
        number: u32,
        wire_type: u8,
        max_depth: u32,
    ) -> Result<usize, WireError> {
        match WireType::from_bits(wire_type) {
            Some(WireType::Varint) => {
                self.read_varint()?;
            }
            Some(WireType::I64) => {
                self.read_array::<8>()?;
            }
            Some(WireType::Len) => {
                let len = self.read_len()?;
                self.pos += len;
            }
            Some(WireType::SGroup) => return self.skip_group(number, max_depth).map(|n| n + 1),
            Some(WireType::I32) => {
                self.read_array::<4>()?;
            }
            Some(WireType::EGroup) => return Err(self.error(ErrorKind::MalformedGroup)),
            None => return Err(self.error(ErrorKind::InvalidWireType)),
        }
        Ok(1)
    }

    /// Skip the body of a group whose start tag has been read, up to and
    /// including the end-group tag for `number`.
    ///
    /// Returns the number of fields inside the group, counting nested groups
    /// and their contents.
    pub fn skip_group(&mut self, number: u32, max_depth: u32) -> Result<usize, WireError> {
        // Stack of open group numbers. Groups are rare, so the stack is only
        // grown when groups are nested.
        let mut open = smallvec::SmallVec::<[u32; 4]>::new();
        open.push(number);
        let mut fields = 0;
        loop {
            if self.is_at_end() {
                // A window that ends inside a group is malformed. The end of
                // the whole input means it was truncated.
                let kind = if self.nested {
                    ErrorKind::MalformedGroup
                } else {
                    ErrorKind::TruncatedInput
                };
                return Err(self.error(kind));
            }
            let (field, wire_type) = self.read_tag()?;
            match WireType::from_bits(wire_type) {
                Some(WireType::SGroup) => {
                    if open.len() as u32 >= max_depth {
                        return Err(self.error(ErrorKind::NestingTooDeep));
                    }
                    open.push(field);
                    fields += 1;
                }
                Some(WireType::EGroup) => {
                    if open.pop() != Some(field) {
                        return Err(self.error(ErrorKind::MalformedGroup));
                    }
                    if open.is_empty() {
                        return Ok(fields);
                    }
                }
                _ => {
                    self.skip_field(field, wire_type, max_depth)?;
                    fields += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ReadCursor, WireType, make_tag};
    use crate::ErrorKind;
    use crate::varint::encode_varint;

    #[test]
    fn test_read_values() {
        let mut buf = Vec::new();
        buf.extend((42u32).to_le_bytes());
        buf.extend((84u64).to_le_bytes());
        encode_varint(1234, &mut buf);
        encode_varint(4, &mut buf);
        buf.extend([1, 2, 3, 4]);

        let mut cur = ReadCursor::new(&buf);
        assert_eq!(cur.read_fixed32().unwrap(), 42);
        assert_eq!(cur.position(), 4);
        assert_eq!(cur.read_fixed64().unwrap(), 84);
        assert_eq!(cur.position(), 12);
        assert_eq!(cur.read_varint().unwrap(), 1234);
        assert_eq!(cur.position(), 14);
        let range = cur.read_len_range().unwrap();
        assert_eq!(&buf[range], [1, 2, 3, 4]);
        assert!(cur.is_at_end());
    }

    #[test]
    fn test_truncated_fixed() {
        let buf = [1, 2, 3];
        let mut cur = ReadCursor::new(&buf);
        let err = cur.read_fixed32().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::TruncatedInput);
        assert_eq!(err.offset(), Some(0));
    }

    #[test]
    fn test_length_overflow() {
        let buf = [0x05, 1, 2];
        let mut cur = ReadCursor::new(&buf);
        let err = cur.read_len().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Overflow);
    }

    #[test]
    fn test_window_limits_reads() {
        let buf = [0x01, 0x02, 0x03, 0x04];
        let mut cur = ReadCursor::with_range(&buf, 1..3);
        assert_eq!(cur.remaining(), 2);
        let err = cur.read_fixed32().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::TruncatedInput);
        assert_eq!(cur.read_bytes(2).unwrap(), [0x02, 0x03]);
    }

    #[test]
    fn test_read_tag() {
        let buf = [0x08, 0x00, 0x07];
        let mut cur = ReadCursor::new(&buf);
        assert_eq!(cur.read_tag().unwrap(), (1, 0));

        // Field number zero.
        let err = cur.read_tag().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::MalformedTag);
    }

    #[test]
    fn test_skip_group() {
        let mut buf = Vec::new();
        encode_varint(make_tag(1, WireType::Varint) as u64, &mut buf);
        encode_varint(5, &mut buf);
        // Nested group 2 inside the outer group.
        encode_varint(make_tag(2, WireType::SGroup) as u64, &mut buf);
        encode_varint(make_tag(3, WireType::I32) as u64, &mut buf);
        buf.extend([0; 4]);
        encode_varint(make_tag(2, WireType::EGroup) as u64, &mut buf);
        // End of outer group 7.
        encode_varint(make_tag(7, WireType::EGroup) as u64, &mut buf);
        buf.push(0xaa);

        let mut cur = ReadCursor::new(&buf);
        assert_eq!(cur.skip_group(7, 10).unwrap(), 3);
        assert_eq!(cur.remaining(), 1);

        // The nested group and its field count as skipped fields.
        let mut cur = ReadCursor::new(&buf);
        assert_eq!(cur.skip_field(7, WireType::SGroup as u8, 10).unwrap(), 4);

        // Group not closed before the end of the input.
        let open = &buf[..buf.len() - 2];
        let mut cur = ReadCursor::new(open);
        let err = cur.skip_group(7, 10).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::TruncatedInput);

        // Group not closed before the end of an enclosing field's payload.
        let mut outer = ReadCursor::new(&buf);
        let mut window = outer.split(open.len());
        assert!(window.is_nested());
        let err = window.skip_group(7, 10).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::MalformedGroup);

        // Mismatched end tag.
        let mut cur = ReadCursor::new(&buf);
        let err = cur.skip_group(8, 10).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::MalformedGroup);

        // Nesting limit.
        let mut cur = ReadCursor::new(&buf);
        let err = cur.skip_group(7, 1).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NestingTooDeep);
    }

    #[test]
    fn test_skip_field_invalid_wire_type() {
        let buf = [0x00];
        let mut cur = ReadCursor::new(&buf);
        let err = cur.skip_field(1, 6, 10).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidWireType);
    }
}
