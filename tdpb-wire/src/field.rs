use crate::cursor::{ReadCursor, WireType};
use crate::errors::{ErrorKind, WireError};
use crate::message::DecodeMessage;
use crate::varint::{zigzag_decode32, zigzag_decode64};

/// Maximum group nesting when skipping over groups in [`Fields`].
const MAX_GROUP_DEPTH: u32 = 100;

/// Wire-type and associated value of a field.
///
/// See <https://protobuf.dev/programming-guides/encoding/#structure>.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum FieldValue<'a> {
    /// Integer value encoded as a varint.
    Varint(u64),

    /// 64-bit fixed-width value.
    I64(u64),

    /// A variable-length value.
    Len(&'a [u8]),

    /// The body of a group, excluding the start and end tags.
    Group(&'a [u8]),

    /// 32-bit fixed-width value.
    I32(u32),
}

/// A single field of a message.
///
/// `Field`s are produced by iterating over fields of a message using
/// [`Fields`].
///
/// # Repeated fields
///
/// Repeated fields with a primitive type may have either a packed or un-packed
/// representation. The `read_repeated_*` methods return iterators which handle
/// both cases. The returned iterators will yield a single value if the field
/// is unpacked, or all values in a packed block if the field is packed.
#[derive(Copy, Clone, Debug)]
pub struct Field<'a> {
    number: u32,
    value: FieldValue<'a>,

    /// Debug name of the message type this field belongs to.
    context: Option<&'static str>,
}

impl<'a> Field<'a> {
    /// Return the field number.
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Return the field value.
    pub fn value(&self) -> FieldValue<'a> {
        self.value
    }

    /// Read the bytes in this field.
    pub fn read_bytes(&self) -> Result<&'a [u8], WireError> {
        match self.value {
            FieldValue::Len(bytes) => Ok(bytes),
            _ => Err(self.error(ErrorKind::FieldTypeMismatch)),
        }
    }

    /// Read the UTF-8 encoded string in this field.
    pub fn read_string(&self) -> Result<String, WireError> {
        let bytes = self.read_bytes()?;
        std::str::from_utf8(bytes)
            .map(|s| s.to_string())
            .map_err(|_| self.error(ErrorKind::InvalidUtf8))
    }

    /// Decode the embedded message in this field.
    ///
    /// Both length-delimited and group encodings are accepted.
    pub fn read_message<M: DecodeMessage>(&self) -> Result<M, WireError> {
        match self.value {
            FieldValue::Len(bytes) | FieldValue::Group(bytes) => {
                let ctx = Some(std::any::type_name::<M>());
                M::decode_fields(Fields::new(bytes, ctx))
            }
            _ => Err(self.error(ErrorKind::FieldTypeMismatch)),
        }
    }

    fn get_varint(&self) -> Result<u64, WireError> {
        match self.value {
            FieldValue::Varint(val) => Ok(val),
            _ => Err(self.error(ErrorKind::FieldTypeMismatch)),
        }
    }

    /// Get the value of a field with schema type `int32`.
    pub fn get_int32(&self) -> Result<i32, WireError> {
        self.get_varint().map(|v| v as i32)
    }

    /// Get the value of a field where the schema type is an enum.
    pub fn get_enum(&self) -> Result<i32, WireError> {
        self.get_int32()
    }

    /// Get the value of a field with schema type `int64`.
    pub fn get_int64(&self) -> Result<i64, WireError> {
        self.get_varint().map(|v| v as i64)
    }

    /// Get the value of a field with schema type `uint64`.
    pub fn get_uint64(&self) -> Result<u64, WireError> {
        self.get_varint()
    }

    /// Get the value of a field with schema type `sint32`.
    pub fn get_sint32(&self) -> Result<i32, WireError> {
        self.get_varint().map(|v| zigzag_decode32(v as u32))
    }

    /// Get the value of a field with schema type `sint64`.
    pub fn get_sint64(&self) -> Result<i64, WireError> {
        self.get_varint().map(zigzag_decode64)
    }

    /// Get the value of a field with schema type `bool`.
    pub fn get_bool(&self) -> Result<bool, WireError> {
        self.get_varint().map(|v| v != 0)
    }

    /// Get the value of a field with schema type `float`.
    pub fn get_float(&self) -> Result<f32, WireError> {
        match self.value {
            FieldValue::I32(val) => Ok(f32::from_bits(val)),
            _ => Err(self.error(ErrorKind::FieldTypeMismatch)),
        }
    }

    /// Get the value of a field with schema type `double`.
    pub fn get_double(&self) -> Result<f64, WireError> {
        match self.value {
            FieldValue::I64(val) => Ok(f64::from_bits(val)),
            _ => Err(self.error(ErrorKind::FieldTypeMismatch)),
        }
    }

    /// Get one or multiple values from a `repeated int32` field.
    pub fn read_repeated_int32(
        &self,
    ) -> Result<impl Iterator<Item = Result<i32, WireError>> + 'a, WireError> {
        self.read_repeated_varint(|x| x as i32)
    }

    /// Get one or multiple values from a `repeated int64` field.
    pub fn read_repeated_int64(
        &self,
    ) -> Result<impl Iterator<Item = Result<i64, WireError>> + 'a, WireError> {
        self.read_repeated_varint(|x| x as i64)
    }

    /// Get one or multiple values from a `repeated float` field.
    pub fn read_repeated_float(
        &self,
    ) -> Result<impl Iterator<Item = Result<f32, WireError>> + 'a, WireError> {
        match self.value {
            FieldValue::I32(val) => Ok(Repeated::Unpacked(Some(f32::from_bits(val)))),
            FieldValue::Len(bytes) => {
                let mut cur = ReadCursor::new(bytes);
                Ok(Repeated::Packed(std::iter::from_fn(move || {
                    (!cur.is_at_end()).then(|| cur.read_fixed32().map(f32::from_bits))
                })))
            }
            _ => Err(self.error(ErrorKind::FieldTypeMismatch)),
        }
    }

    /// Get the value of a repeated varint field.
    fn read_repeated_varint<T: Copy + 'a>(
        &self,
        from_u64: impl Fn(u64) -> T + 'a,
    ) -> Result<impl Iterator<Item = Result<T, WireError>> + 'a, WireError> {
        let repeated = match self.value {
            FieldValue::Varint(val) => Repeated::Unpacked(Some(from_u64(val))),
            FieldValue::Len(bytes) => {
                let mut cur = ReadCursor::new(bytes);
                Repeated::Packed(std::iter::from_fn(move || {
                    (!cur.is_at_end()).then(|| cur.read_varint().map(&from_u64))
                }))
            }
            _ => {
                return Err(self.error(ErrorKind::FieldTypeMismatch));
            }
        };
        Ok(repeated)
    }

    fn error(&self, kind: ErrorKind) -> WireError {
        WireError::new(kind).with_context(self.context, Some(self.number))
    }
}

/// Iterator over a repeated scalar field.
///
/// Repeated scalar fields may use either a packed or un-packed representation.
/// See https://protobuf.dev/programming-guides/encoding/#repeated.
enum Repeated<T: Copy, I: Iterator<Item = Result<T, WireError>>> {
    Unpacked(Option<T>),
    Packed(I),
}

impl<T: Copy, I: Iterator<Item = Result<T, WireError>>> Iterator for Repeated<T, I> {
    type Item = Result<T, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Unpacked(val) => val.take().map(Ok),
            Self::Packed(packed) => packed.next(),
        }
    }
}

/// Iterator over fields of an encoded message.
///
/// ```
/// use tdpb_wire::Fields;
///
/// let message = [0x08, 0x96, 0x01, 0x12, 0x02, b'h', b'i'];
/// let mut fields = Fields::new(&message, None);
///
/// let first = fields.next().unwrap().unwrap();
/// assert_eq!(first.get_int32().unwrap(), 150);
///
/// let second = fields.next().unwrap().unwrap();
/// assert_eq!(second.read_string().unwrap(), "hi");
///
/// assert!(fields.next().is_none());
/// ```
pub struct Fields<'a> {
    cursor: ReadCursor<'a>,

    /// Debug name of the message type.
    context: Option<&'static str>,

    /// Set after an error so that iteration stops.
    failed: bool,
}

impl<'a> Fields<'a> {
    /// Iterate over the fields in `buf`.
    ///
    /// `context` is the name of the message type being read, for debugging
    /// purposes.
    pub fn new(buf: &'a [u8], context: Option<&'static str>) -> Self {
        Self {
            cursor: ReadCursor::new(buf),
            context,
            failed: false,
        }
    }

    fn read_field(&mut self) -> Result<Field<'a>, WireError> {
        let (number, wire_type) = self.cursor.read_tag()?;
        let cur = &mut self.cursor;
        let value = match WireType::from_bits(wire_type) {
            Some(WireType::Varint) => cur.read_varint().map(FieldValue::Varint),
            Some(WireType::I64) => cur.read_fixed64().map(FieldValue::I64),
            Some(WireType::Len) => {
                let range = cur.read_len_range();
                range.map(|r| FieldValue::Len(&cur.buffer()[r]))
            }
            Some(WireType::SGroup) => {
                let start = cur.position();
                cur.skip_group(number, MAX_GROUP_DEPTH).map(|_| {
                    // Exclude the end-group tag, which is a varint that
                    // precedes the current position.
                    let body = &cur.buffer()[start..cur.position()];
                    let tag_len = crate::varint::varint_len(
                        crate::make_tag(number, WireType::EGroup) as u64,
                    );
                    FieldValue::Group(&body[..body.len() - tag_len])
                })
            }
            Some(WireType::I32) => cur.read_fixed32().map(FieldValue::I32),
            Some(WireType::EGroup) => Err(WireError::new(ErrorKind::MalformedGroup)),
            None => Err(WireError::new(ErrorKind::InvalidWireType)),
        }
        .map_err(|err| err.with_context(self.context, Some(number)))?;

        Ok(Field {
            number,
            value,
            context: self.context,
        })
    }
}

impl<'a> Iterator for Fields<'a> {
    type Item = Result<Field<'a>, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cursor.is_at_end() {
            return None;
        }
        let field = self.read_field();
        self.failed = field.is_err();
        Some(field)
    }
}

#[cfg(test)]
mod tests {
    use tdpb_testing::Wire;

    use super::{FieldValue, Fields};
    use crate::{ErrorKind, WireError};

    fn read_fields(buf: &[u8]) -> Result<Vec<(u32, FieldValue<'_>)>, WireError> {
        Fields::new(buf, Some("TestMessage"))
            .map(|field| field.map(|f| (f.number(), f.value())))
            .collect()
    }

    #[test]
    fn test_iter_fields_simple() {
        let buf = vec![0x08, 0x96, 0x01];
        let fields = read_fields(&buf).unwrap();
        assert_eq!(fields, [(1, FieldValue::Varint(150))]);
    }

    #[test]
    fn test_iter_fields() {
        let buf = Wire::new()
            .varint(1, 1234)
            .fixed32(2, 456)
            .bytes(3, &[1, 2, 3, 4])
            .fixed64(4, 678)
            .group(5, |g| g.varint(1, 1))
            .finish();

        let fields = read_fields(&buf).unwrap();

        assert_eq!(
            fields,
            [
                (1, FieldValue::Varint(1234)),
                (2, FieldValue::I32(456)),
                (3, FieldValue::Len(&[1, 2, 3, 4])),
                (4, FieldValue::I64(678)),
                (5, FieldValue::Group(&[0x08, 0x01])),
            ]
        );
    }

    #[test]
    fn test_stray_end_group() {
        let buf = Wire::new().varint(1, 1).raw(&[0x14]).finish();
        let mut fields = Fields::new(&buf, Some("TestMessage"));
        assert!(fields.next().unwrap().is_ok());
        let err = fields.next().unwrap().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::MalformedGroup);
        assert_eq!(err.context(), Some("TestMessage"));
        assert_eq!(err.field(), Some(2));
        assert!(fields.next().is_none());
    }

    #[test]
    fn test_read_string() {
        let buf = Wire::new().bytes(1, b"hello").bytes(2, &[0xff]).finish();
        let mut fields = Fields::new(&buf, None);
        assert_eq!(fields.next().unwrap().unwrap().read_string().unwrap(), "hello");
        let err = fields.next().unwrap().unwrap().read_string().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidUtf8);
    }

    #[test]
    fn test_type_mismatch() {
        let buf = Wire::new().varint(1, 3).finish();
        let field = Fields::new(&buf, None).next().unwrap().unwrap();
        let err = field.read_bytes().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::FieldTypeMismatch);
        assert_eq!(err.field(), Some(1));
    }

    #[test]
    fn test_read_repeated_varint() {
        let buf = Wire::new()
            .varint(1, 1) // Non-packed repeated
            .packed_varints(1, &[2, 3]) // Packed repeated
            .finish();

        let mut vals = Vec::new();
        for field in Fields::new(&buf, None) {
            for val in field.unwrap().read_repeated_int32().unwrap() {
                vals.push(val.unwrap());
            }
        }
        assert_eq!(vals, [1, 2, 3]);
    }

    #[test]
    fn test_read_repeated_float() {
        let mut packed = Vec::new();
        packed.extend(1.0f32.to_le_bytes());
        packed.extend(2.0f32.to_le_bytes());
        let buf = Wire::new()
            .fixed32(1, 0f32.to_bits())
            .bytes(1, &packed)
            .finish();

        let mut vals = Vec::new();
        for field in Fields::new(&buf, None) {
            for val in field.unwrap().read_repeated_float().unwrap() {
                vals.push(val.unwrap());
            }
        }
        assert_eq!(vals, [0., 1., 2.]);
    }
}
