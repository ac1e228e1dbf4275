use crate::{Field, Fields, WireError};

/// Defines how to deserialize a type from an encoded message.
///
/// # Usage
///
/// Given the Protocol Buffers schema:
///
/// ```proto
/// message Message {
///     int32 int_field = 1;
///     string string_field = 2;
///     repeated int64 ids = 3;
/// }
/// ```
///
/// A decoder could be written as follows:
///
/// ```
/// use tdpb_wire::{DecodeMessage, Fields, WireError};
///
/// #[derive(Default)]
/// struct Message {
///     int_field: i32,
///     string_field: Option<String>,
///     ids: Vec<i64>,
/// }
///
/// impl Message {
///     const INT_FIELD: u32 = 1;
///     const STRING_FIELD: u32 = 2;
///     const IDS: u32 = 3;
/// }
///
/// impl DecodeMessage for Message {
///     fn decode_fields(fields: Fields<'_>) -> Result<Self, WireError> {
///         let mut msg = Message::default();
///         for field in fields {
///             let field = field?;
///             match field.number() {
///                 Self::INT_FIELD => msg.int_field = field.get_int32()?,
///                 Self::STRING_FIELD => msg.string_field = Some(field.read_string()?),
///                 Self::IDS => {
///                     for id in field.read_repeated_int64()? {
///                         msg.ids.push(id?);
///                     }
///                 }
///                 // Fields which are unrecognized or not useful for us.
///                 _ => {}
///             }
///         }
///         Ok(msg)
///     }
/// }
///
/// let message: &[u8] = &[
///     0x08, 0x96, 0x01, // int_field = 150
///     0x12, 0x02, 0x68, 0x69, // string_field = "hi"
///     0x1A, 0x02, 0x01, 0x02, // ids = [1, 2]
/// ];
/// let msg = Message::decode(message).unwrap();
///
/// assert_eq!(msg.int_field, 150);
/// assert_eq!(msg.string_field.unwrap(), "hi");
/// assert_eq!(msg.ids, [1, 2]);
/// ```
pub trait DecodeMessage: Sized {
    /// Decode a message from a buffer.
    fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let ctx = Some(std::any::type_name::<Self>());
        Self::decode_fields(Fields::new(buf, ctx))
    }

    /// Decode a message from an iterator over message fields.
    fn decode_fields(fields: Fields<'_>) -> Result<Self, WireError>;

    /// Decode a message stored in a field in a parent message.
    fn decode_field(field: &Field<'_>) -> Result<Self, WireError> {
        field.read_message()
    }
}
