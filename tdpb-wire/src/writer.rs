use crate::cursor::{WireType, make_tag};
use crate::varint::{encode_varint, varint_len};

/// Encodes message fields into a byte buffer.
///
/// Length-delimited values are written with [`bytes`](Self::bytes). Nested
/// messages can be written either from an already-encoded buffer, or by
/// reserving the length prefix with [`begin_len`](Self::begin_len) and
/// patching it in with [`end_len`](Self::end_len).
#[derive(Clone, Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

/// Marker returned by [`WireWriter::begin_len`].
#[derive(Debug)]
#[must_use]
pub struct LenMarker {
    start: usize,
}

/// Number of bytes reserved for a length prefix by [`WireWriter::begin_len`].
///
/// Five bytes are enough for any length that fits in 32 bits.
const RESERVED_LEN_BYTES: usize = 5;

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the number of bytes written.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn tag(&mut self, number: u32, wire_type: WireType) {
        encode_varint(make_tag(number, wire_type) as u64, &mut self.buf);
    }

    pub fn varint(&mut self, number: u32, val: u64) {
        self.tag(number, WireType::Varint);
        encode_varint(val, &mut self.buf);
    }

    pub fn fixed32(&mut self, number: u32, val: u32) {
        self.tag(number, WireType::I32);
        self.buf.extend(val.to_le_bytes());
    }

    pub fn fixed64(&mut self, number: u32, val: u64) {
        self.tag(number, WireType::I64);
        self.buf.extend(val.to_le_bytes());
    }

    pub fn bytes(&mut self, number: u32, val: &[u8]) {
        self.tag(number, WireType::Len);
        encode_varint(val.len() as u64, &mut self.buf);
        self.buf.extend_from_slice(val);
    }

    /// Append a raw varint without a tag, eg. an element of a packed field.
    pub fn raw_varint(&mut self, val: u64) {
        encode_varint(val, &mut self.buf);
    }

    /// Append bytes verbatim.
    pub fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Write the tag of a length-delimited field and reserve space for its
    /// length, which is filled in by [`end_len`](Self::end_len).
    pub fn begin_len(&mut self, number: u32) -> LenMarker {
        self.tag(number, WireType::Len);
        let start = self.buf.len();
        self.buf.extend([0; RESERVED_LEN_BYTES]);
        LenMarker { start }
    }

    /// Fill in the length reserved by [`begin_len`](Self::begin_len),
    /// compacting the prefix to its minimal encoding.
    pub fn end_len(&mut self, marker: LenMarker) {
        let body_start = marker.start + RESERVED_LEN_BYTES;
        let len = (self.buf.len() - body_start) as u64;
        let mut prefix = Vec::with_capacity(varint_len(len));
        encode_varint(len, &mut prefix);
        self.buf
            .splice(marker.start..body_start, prefix)
            .for_each(drop);
    }
}
