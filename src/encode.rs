//! Re-encoding of decoded messages.

use tdpb_wire::varint::{zigzag_encode32, zigzag_encode64};
use tdpb_wire::{WireType, WireWriter};

use crate::reflect::{List, Message, Value};
use crate::schema::{FieldDescriptor, Kind};

/// Encode `msg` in the Protocol Buffers wire format.
///
/// Fields are written in field number order, followed by the message's
/// unknown fields. Repeated scalar fields that are packed according to the
/// schema are written packed. Decoding the output with the same type gives a
/// message equal to `msg`.
pub fn encode(msg: &Message) -> Vec<u8> {
    let mut writer = WireWriter::new();
    encode_message(&mut writer, msg);
    writer.into_bytes()
}

fn encode_message(w: &mut WireWriter, msg: &Message) {
    msg.range(|field, value| {
        encode_field(w, field, value);
        true
    });
    w.raw(msg.unknown_fields());
}

fn encode_field(w: &mut WireWriter, field: &FieldDescriptor, value: Value) {
    let number = field.number();
    match value {
        Value::List(list) if field.is_packed() && field.kind().is_packable() => {
            encode_packed(w, number, field.kind(), &list)
        }
        Value::List(list) => {
            for elem in list.iter() {
                encode_value(w, number, field.kind(), elem);
            }
        }
        Value::Map(map) => {
            let (Some(key_field), Some(value_field)) = (field.map_key(), field.map_value()) else {
                return;
            };
            for (key, value) in map.iter() {
                let marker = w.begin_len(number);
                encode_value(w, 1, key_field.kind(), key.into());
                encode_value(w, 2, value_field.kind(), value);
                w.end_len(marker);
            }
        }
        value => encode_value(w, number, field.kind(), value),
    }
}

fn encode_packed(w: &mut WireWriter, number: u32, kind: Kind, list: &List) {
    let marker = w.begin_len(number);
    for elem in list.iter() {
        match (kind, elem) {
            (Kind::Fixed32, Value::U32(v)) => w.raw(&v.to_le_bytes()),
            (Kind::Sfixed32, Value::I32(v)) => w.raw(&v.to_le_bytes()),
            (Kind::Float, Value::F32(v)) => w.raw(&v.to_bits().to_le_bytes()),
            (Kind::Fixed64, Value::U64(v)) => w.raw(&v.to_le_bytes()),
            (Kind::Sfixed64, Value::I64(v)) => w.raw(&v.to_le_bytes()),
            (Kind::Double, Value::F64(v)) => w.raw(&v.to_bits().to_le_bytes()),
            (kind, value) => {
                if let Some(v) = varint_value(kind, value) {
                    w.raw_varint(v);
                }
            }
        }
    }
    w.end_len(marker);
}

/// Return the varint encoding of a value of a varint-typed field.
fn varint_value(kind: Kind, value: Value) -> Option<u64> {
    let v = match (kind, value) {
        (Kind::Bool, Value::Bool(v)) => v as u64,
        // Negative 32-bit values are sign-extended to 64 bits.
        (Kind::Int32, Value::I32(v)) | (Kind::Enum, Value::Enum(v)) => v as i64 as u64,
        (Kind::Int64, Value::I64(v)) => v as u64,
        (Kind::Uint32, Value::U32(v)) => v as u64,
        (Kind::Uint64, Value::U64(v)) => v,
        (Kind::Sint32, Value::I32(v)) => zigzag_encode32(v) as u64,
        (Kind::Sint64, Value::I64(v)) => zigzag_encode64(v),
        _ => return None,
    };
    Some(v)
}

fn encode_value(w: &mut WireWriter, number: u32, kind: Kind, value: Value) {
    match (kind, value) {
        (Kind::Fixed32, Value::U32(v)) => w.fixed32(number, v),
        (Kind::Sfixed32, Value::I32(v)) => w.fixed32(number, v as u32),
        (Kind::Float, Value::F32(v)) => w.fixed32(number, v.to_bits()),
        (Kind::Fixed64, Value::U64(v)) => w.fixed64(number, v),
        (Kind::Sfixed64, Value::I64(v)) => w.fixed64(number, v as u64),
        (Kind::Double, Value::F64(v)) => w.fixed64(number, v.to_bits()),
        (Kind::String | Kind::Bytes, value) => {
            if let Some(bytes) = value.as_bytes() {
                w.bytes(number, bytes);
            }
        }
        (Kind::Message, Value::Message(msg)) => {
            let marker = w.begin_len(number);
            encode_message(w, &msg);
            w.end_len(marker);
        }
        (Kind::Group, Value::Message(msg)) => {
            w.tag(number, WireType::SGroup);
            encode_message(w, &msg);
            w.tag(number, WireType::EGroup);
        }
        (kind, value) => {
            if let Some(v) = varint_value(kind, value) {
                w.varint(number, v);
            }
        }
    }
}
