use tdpb_wire::{WireType, WireWriter};
use tdpb_wire::varint::{zigzag_encode32, zigzag_encode64};

/// Builder for encoded messages.
///
/// ```
/// use tdpb_testing::Wire;
///
/// let buf = Wire::new()
///     .varint(1, 42)
///     .message(2, |inner| inner.string(1, "abc"))
///     .finish();
/// assert_eq!(buf, [0x08, 0x2a, 0x12, 0x05, 0x0a, 0x03, b'a', b'b', b'c']);
/// ```
#[derive(Clone, Debug, Default)]
pub struct Wire {
    writer: WireWriter,
}

impl Wire {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a bare tag.
    pub fn tag(mut self, number: u32, wire_type: WireType) -> Self {
        self.writer.tag(number, wire_type);
        self
    }

    pub fn varint(mut self, number: u32, val: u64) -> Self {
        self.writer.varint(number, val);
        self
    }

    /// Append an `int32` or `int64` value. Negative values are sign-extended
    /// to 10 bytes, as conforming encoders do.
    pub fn int(self, number: u32, val: i64) -> Self {
        self.varint(number, val as u64)
    }

    pub fn sint32(self, number: u32, val: i32) -> Self {
        self.varint(number, zigzag_encode32(val) as u64)
    }

    pub fn sint64(self, number: u32, val: i64) -> Self {
        self.varint(number, zigzag_encode64(val))
    }

    pub fn bool(self, number: u32, val: bool) -> Self {
        self.varint(number, val as u64)
    }

    pub fn fixed32(mut self, number: u32, val: u32) -> Self {
        self.writer.fixed32(number, val);
        self
    }

    pub fn fixed64(mut self, number: u32, val: u64) -> Self {
        self.writer.fixed64(number, val);
        self
    }

    pub fn float(self, number: u32, val: f32) -> Self {
        self.fixed32(number, val.to_bits())
    }

    pub fn double(self, number: u32, val: f64) -> Self {
        self.fixed64(number, val.to_bits())
    }

    pub fn bytes(mut self, number: u32, val: &[u8]) -> Self {
        self.writer.bytes(number, val);
        self
    }

    pub fn string(self, number: u32, val: &str) -> Self {
        self.bytes(number, val.as_bytes())
    }

    /// Append a length-delimited sub-message built by `f`.
    pub fn message(self, number: u32, f: impl FnOnce(Wire) -> Wire) -> Self {
        let body = f(Wire::new()).finish();
        self.bytes(number, &body)
    }

    /// Append a group whose body is built by `f`.
    pub fn group(mut self, number: u32, f: impl FnOnce(Wire) -> Wire) -> Self {
        let body = f(Wire::new()).finish();
        self.writer.tag(number, WireType::SGroup);
        self.writer.raw(&body);
        self.writer.tag(number, WireType::EGroup);
        self
    }

    pub fn packed_varints(self, number: u32, vals: &[u64]) -> Self {
        let mut body = WireWriter::new();
        for &val in vals {
            body.raw_varint(val);
        }
        self.bytes(number, &body.into_bytes())
    }

    pub fn packed_fixed32(self, number: u32, vals: &[u32]) -> Self {
        let body: Vec<u8> = vals.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.bytes(number, &body)
    }

    pub fn packed_fixed64(self, number: u32, vals: &[u64]) -> Self {
        let body: Vec<u8> = vals.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.bytes(number, &body)
    }

    /// Append bytes verbatim.
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.writer.raw(bytes);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.writer.into_bytes()
    }
}
