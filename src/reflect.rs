//! Read-only views of decoded messages.
//!
//! A [`Message`] is a small `Copy` handle holding references to the arena the
//! message was decoded into, the input buffer and the compiled types. Field
//! values are read directly from the record's storage on each access.

use std::fmt;
use std::sync::Arc;

use crate::arena::{Addr, Arena};
use crate::layout::{Presence, Storage};
use crate::message_type::{CompiledType, Library, MessageType};
use crate::schema::{DefaultValue, FieldDescriptor, Kind, MessageDescriptor, OneofDescriptor};
use crate::vm::map_lookup;

/// Data shared by all views of one decoded message tree.
#[derive(Clone, Copy)]
struct Context<'a> {
    arena: &'a Arena,
    input: &'a [u8],
    lib: &'a Arc<Library>,
}

impl<'a> Context<'a> {
    fn compiled(&self, index: u32) -> &'a CompiledType {
        &self.lib.types[index as usize]
    }

    fn payload(&self, slot: Addr) -> &'a [u8] {
        let data = self.arena.read_addr(slot);
        let len = self.arena.read_u64(slot.add(8)) as usize;
        self.arena.payload(self.input, data, len)
    }

    /// Read a single value of type `kind` stored at `addr`.
    fn value(&self, addr: Addr, kind: Kind, child: Option<u32>) -> Value<'a> {
        let arena = self.arena;
        match kind {
            Kind::Bool => Value::Bool(arena.read_u8(addr) != 0),
            Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => Value::I32(arena.read_u32(addr) as i32),
            Kind::Uint32 | Kind::Fixed32 => Value::U32(arena.read_u32(addr)),
            Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => Value::I64(arena.read_u64(addr) as i64),
            Kind::Uint64 | Kind::Fixed64 => Value::U64(arena.read_u64(addr)),
            Kind::Float => Value::F32(f32::from_bits(arena.read_u32(addr))),
            Kind::Double => Value::F64(f64::from_bits(arena.read_u64(addr))),
            Kind::Enum => Value::Enum(arena.read_u32(addr) as i32),
            Kind::String => {
                let bytes = self.payload(addr);
                match std::str::from_utf8(bytes) {
                    Ok(s) => Value::String(s),
                    Err(_) => Value::Bytes(bytes),
                }
            }
            Kind::Bytes => Value::Bytes(self.payload(addr)),
            Kind::Message | Kind::Group => Value::Message(Message {
                ctx: *self,
                index: child.expect("message field has a child type"),
                record: arena.read_addr(addr),
            }),
        }
    }
}

/// A value of a field, list element or map entry.
///
/// Strings and bytes borrow from the arena or, for aliased decodes, the input.
/// A `string` value which is not valid UTF-8 is returned as
/// [`Value::Bytes`]. This can only happen for fields which are not validated,
/// such as `string` fields in proto2 files.
///
/// Floats compare by bit pattern, so a NaN value equals itself.
#[derive(Clone, Copy, Debug)]
pub enum Value<'a> {
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    /// Number of an enum value.
    Enum(i32),
    String(&'a str),
    Bytes(&'a [u8]),
    Message(Message<'a>),
    List(List<'a>),
    Map(Map<'a>),
}

macro_rules! value_accessor {
    ($name:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&self) -> Option<$ty> {
            match *self {
                Value::$variant(v) => Some(v),
                _ => None,
            }
        }
    };
}

impl<'a> Value<'a> {
    value_accessor!(as_bool, Bool, bool);
    value_accessor!(as_i32, I32, i32);
    value_accessor!(as_i64, I64, i64);
    value_accessor!(as_u32, U32, u32);
    value_accessor!(as_u64, U64, u64);
    value_accessor!(as_f32, F32, f32);
    value_accessor!(as_f64, F64, f64);
    value_accessor!(as_enum, Enum, i32);
    value_accessor!(as_str, String, &'a str);
    value_accessor!(as_message, Message, Message<'a>);
    value_accessor!(as_list, List, List<'a>);
    value_accessor!(as_map, Map, Map<'a>);

    /// Return the content of a bytes or string value.
    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match *self {
            Value::Bytes(b) => Some(b),
            Value::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    fn from_default(default: &'a DefaultValue) -> Value<'a> {
        match default {
            DefaultValue::Bool(v) => Value::Bool(*v),
            DefaultValue::I32(v) => Value::I32(*v),
            DefaultValue::I64(v) => Value::I64(*v),
            DefaultValue::U32(v) => Value::U32(*v),
            DefaultValue::U64(v) => Value::U64(*v),
            DefaultValue::F32(v) => Value::F32(*v),
            DefaultValue::F64(v) => Value::F64(*v),
            DefaultValue::String(v) => Value::String(v),
            DefaultValue::Bytes(v) => Value::Bytes(v),
            DefaultValue::Enum(v) => Value::Enum(*v),
        }
    }

    fn zero(kind: Kind) -> Value<'static> {
        match kind {
            Kind::Bool => Value::Bool(false),
            Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => Value::I32(0),
            Kind::Uint32 | Kind::Fixed32 => Value::U32(0),
            Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => Value::I64(0),
            Kind::Uint64 | Kind::Fixed64 => Value::U64(0),
            Kind::Float => Value::F32(0.),
            Kind::Double => Value::F64(0.),
            Kind::Enum => Value::Enum(0),
            Kind::String => Value::String(""),
            Kind::Bytes => Value::Bytes(&[]),
            Kind::Message | Kind::Group => unreachable!("message fields are read from their record"),
        }
    }
}

impl PartialEq for Value<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::U32(a), Value::U32(b)) => a == b,
            (Value::U64(a), Value::U64(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a.to_bits() == b.to_bits(),
            (Value::F64(a), Value::F64(b)) => a.to_bits() == b.to_bits(),
            (Value::Enum(a), Value::Enum(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Message(a), Value::Message(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl<'a> From<MapKey<'a>> for Value<'a> {
    fn from(key: MapKey<'a>) -> Value<'a> {
        match key {
            MapKey::Bool(v) => Value::Bool(v),
            MapKey::I32(v) => Value::I32(v),
            MapKey::I64(v) => Value::I64(v),
            MapKey::U32(v) => Value::U32(v),
            MapKey::U64(v) => Value::U64(v),
            MapKey::String(v) => Value::String(v),
            MapKey::Bytes(v) => Value::Bytes(v),
        }
    }
}

/// A decoded message.
///
/// Messages are read-only. They remain valid until the [`Shared`](crate::Shared)
/// they were decoded with is reset or dropped, which the borrow checker
/// enforces.
///
/// A message whose field was never set reads as an empty message of the
/// field's type, so nested reads do not need to check for presence first.
#[derive(Clone, Copy)]
pub struct Message<'a> {
    ctx: Context<'a>,
    index: u32,

    /// Address of the record, or null for an empty message.
    record: Addr,
}

impl<'a> Message<'a> {
    pub(crate) fn new(
        arena: &'a Arena,
        input: &'a [u8],
        lib: &'a Arc<Library>,
        index: u32,
        record: Addr,
    ) -> Message<'a> {
        Message {
            ctx: Context { arena, input, lib },
            index,
            record,
        }
    }

    fn compiled(&self) -> &'a CompiledType {
        self.ctx.compiled(self.index)
    }

    pub fn descriptor(&self) -> &'a MessageDescriptor {
        &self.compiled().descriptor
    }

    /// Return the compiled type this message was decoded with.
    pub fn message_type(&self) -> MessageType {
        MessageType::new(self.ctx.lib.clone(), self.index)
    }

    /// Return the index of `field` in this message's type, panicking if it
    /// is not a field of the type.
    fn expect_field(&self, field: &FieldDescriptor) -> usize {
        match self.compiled().field_index(field) {
            Some(index) => index,
            None => panic!(
                "field {} does not belong to message {}",
                field.full_name(),
                self.descriptor().full_name()
            ),
        }
    }

    /// Return true if `field` is set.
    ///
    /// For fields without explicit presence this returns true if the value is
    /// not zero or empty. Lists and maps are present if they are not empty.
    ///
    /// Panics if `field` is not a field or known extension of this message.
    pub fn has(&self, field: &FieldDescriptor) -> bool {
        self.has_index(self.expect_field(field))
    }

    fn has_index(&self, index: usize) -> bool {
        if self.record.is_null() {
            return false;
        }
        let arena = self.ctx.arena;
        let compiled = self.compiled();
        let slot = &compiled.layout.fields[index];
        let addr = self.record.add(slot.offset as usize);
        match slot.presence {
            Presence::Bit(bit) => {
                let word = arena.read_u32(self.record.add((bit / 32) as usize * 4));
                word & (1 << (bit % 32)) != 0
            }
            Presence::Oneof { slot, ordinal } => {
                let oneof = &compiled.layout.oneofs[slot as usize];
                arena.read_u32(self.record.add(oneof.offset as usize)) == ordinal + 1
            }
            Presence::Pointer => !arena.read_addr(addr).is_null(),
            Presence::Repeated => match slot.storage {
                Storage::Map => {
                    let header = arena.read_addr(addr);
                    !header.is_null() && arena.read_u32(header.add(8)) > 0
                }
                _ => arena.read_u32(addr.add(8)) > 0,
            },
            Presence::Implicit => match slot.storage {
                Storage::Bool => arena.read_u8(addr) != 0,
                Storage::Word32 => arena.read_u32(addr) != 0,
                Storage::Bytes => arena.read_u64(addr.add(8)) != 0,
                _ => arena.read_u64(addr) != 0,
            },
        }
    }

    /// Return the value of `field`.
    ///
    /// Unset fields return their default value. Unset message fields return
    /// an empty message. Repeated fields return a [`List`] or [`Map`], which
    /// may be empty.
    ///
    /// Panics if `field` is not a field or known extension of this message.
    pub fn get(&self, field: &FieldDescriptor) -> Value<'a> {
        self.value_at(self.expect_field(field))
    }

    fn value_at(&self, index: usize) -> Value<'a> {
        let compiled = self.compiled();
        let field = &compiled.fields[index];
        let slot = &compiled.layout.fields[index];
        let child = compiled.children[index];

        match slot.storage {
            Storage::List { elem_size } => {
                let (data, len) = if self.record.is_null() {
                    (Addr::NULL, 0)
                } else {
                    let header = self.record.add(slot.offset as usize);
                    (
                        self.ctx.arena.read_addr(header),
                        self.ctx.arena.read_u32(header.add(8)),
                    )
                };
                return Value::List(List {
                    ctx: self.ctx,
                    kind: field.kind(),
                    child,
                    data,
                    len,
                    elem_size,
                });
            }
            Storage::Map => {
                let header = if self.record.is_null() {
                    Addr::NULL
                } else {
                    self.ctx.arena.read_addr(self.record.add(slot.offset as usize))
                };
                return Value::Map(Map {
                    ctx: self.ctx,
                    entry: child.expect("map field has an entry type"),
                    header,
                });
            }
            _ => {}
        }

        if field.kind().is_message() {
            let record = if self.has_index(index) {
                self.ctx.arena.read_addr(self.record.add(slot.offset as usize))
            } else {
                Addr::NULL
            };
            return Value::Message(Message {
                ctx: self.ctx,
                index: child.expect("message field has a child type"),
                record,
            });
        }

        let stored = match slot.presence {
            Presence::Bit(_) | Presence::Oneof { .. } => self.has_index(index),
            _ => !self.record.is_null(),
        };
        if stored {
            self.ctx
                .value(self.record.add(slot.offset as usize), field.kind(), child)
        } else {
            match field.default_value() {
                Some(default) => Value::from_default(default),
                None => Value::zero(field.kind()),
            }
        }
    }

    /// Return the value of the field or extension called `name`.
    ///
    /// Extensions are named by their fully qualified name.
    pub fn get_by_name(&self, name: &str) -> Option<Value<'a>> {
        let index = self.compiled().field_by_name(name)?;
        Some(self.value_at(index))
    }

    pub fn get_by_number(&self, number: u32) -> Option<Value<'a>> {
        let index = self.compiled().field_by_number(number)?;
        Some(self.value_at(index))
    }

    /// Return the value of an extension, or `None` if the extension was not
    /// known when this message's type was compiled.
    ///
    /// Occurrences of unknown extensions are preserved in
    /// [`unknown_fields`](Message::unknown_fields).
    pub fn get_extension(&self, extension: &FieldDescriptor) -> Option<Value<'a>> {
        let compiled = self.compiled();
        let index = compiled.field_by_number(extension.number())?;
        let known = &compiled.fields[index];
        if !known.is_extension() || known.full_name() != extension.full_name() {
            return None;
        }
        Some(self.value_at(index))
    }

    /// Call `f` with each populated field and its value, in field number
    /// order, until `f` returns false.
    pub fn range(&self, mut f: impl FnMut(&'a FieldDescriptor, Value<'a>) -> bool) {
        let compiled = self.compiled();
        for &index in &compiled.sorted {
            let index = index as usize;
            if !self.has_index(index) {
                continue;
            }
            if !f(&compiled.fields[index], self.value_at(index)) {
                break;
            }
        }
    }

    /// Return the encoded fields of this message which were not decoded into
    /// known fields, in the order they appeared in the input.
    pub fn unknown_fields(&self) -> &'a [u8] {
        if self.record.is_null() {
            return &[];
        }
        let header = self.record.add(self.compiled().layout.unknown_offset as usize);
        let data = self.ctx.arena.read_addr(header);
        let len = self.ctx.arena.read_u32(header.add(8)) as usize;
        self.ctx.arena.bytes(data, len)
    }

    /// Return the member of `oneof` which is set, if any.
    pub fn which_oneof(&self, oneof: &OneofDescriptor) -> Option<&'a FieldDescriptor> {
        let compiled = self.compiled();
        let member = oneof.fields().next()?;
        let index = self.expect_field(&member);
        let Presence::Oneof { slot, .. } = compiled.layout.fields[index].presence else {
            return None;
        };
        if self.record.is_null() {
            return None;
        }
        let oneof_slot = &compiled.layout.oneofs[slot as usize];
        let discriminant = self.ctx.arena.read_u32(self.record.add(oneof_slot.offset as usize));
        if discriminant == 0 {
            return None;
        }
        let field = oneof_slot.members[discriminant as usize - 1];
        Some(&compiled.fields[field as usize])
    }

    /// Decoded messages are read-only. This always panics.
    pub fn set(&self, field: &FieldDescriptor, _value: Value<'_>) {
        panic!("cannot set field {}: decoded messages are read-only", field.name());
    }

    /// Decoded messages are read-only. This always panics.
    pub fn clear(&self, field: &FieldDescriptor) {
        panic!("cannot clear field {}: decoded messages are read-only", field.name());
    }

    /// Decoded messages are read-only. This always panics.
    pub fn mutable(&self, field: &FieldDescriptor) -> Message<'a> {
        panic!("cannot mutate field {}: decoded messages are read-only", field.name());
    }
}

/// Messages are equal if they have the same type name, the same populated
/// fields with equal values, and equal unknown fields.
///
/// Messages decoded with different compiled types, or different arenas, can
/// be compared.
impl PartialEq for Message<'_> {
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = (self.compiled(), other.compiled());
        if a.descriptor.full_name() != b.descriptor.full_name() || a.fields.len() != b.fields.len()
        {
            return false;
        }
        for (i, field) in a.fields.iter().enumerate() {
            let Some(j) = b.field_by_number(field.number()) else {
                return false;
            };
            let present = self.has_index(i);
            if present != other.has_index(j) {
                return false;
            }
            if present && self.value_at(i) != other.value_at(j) {
                return false;
            }
        }
        self.unknown_fields() == other.unknown_fields()
    }
}

impl fmt::Debug for Message<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.descriptor().full_name())?;
        let mut map = f.debug_map();
        self.range(|field, value| {
            map.entry(&field.name(), &value);
            true
        });
        let unknown = self.unknown_fields();
        if !unknown.is_empty() {
            map.entry(&"<unknown>", &unknown);
        }
        map.finish()
    }
}

/// A repeated field.
#[derive(Clone, Copy)]
pub struct List<'a> {
    ctx: Context<'a>,
    kind: Kind,
    child: Option<u32>,
    data: Addr,
    len: u32,
    elem_size: u32,
}

impl<'a> List<'a> {
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Return the element at `index`.
    pub fn get(&self, index: usize) -> Option<Value<'a>> {
        if index >= self.len() {
            return None;
        }
        let addr = self.data.add(index * self.elem_size as usize);
        Some(self.ctx.value(addr, self.kind, self.child))
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = Value<'a>> + use<'a> {
        let list = *self;
        (0..list.len()).map(move |i| {
            let addr = list.data.add(i * list.elem_size as usize);
            list.ctx.value(addr, list.kind, list.child)
        })
    }
}

impl PartialEq for List<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.iter().zip(other.iter()).all(|(a, b)| a == b)
    }
}

impl fmt::Debug for List<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Key of a map entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MapKey<'a> {
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    String(&'a str),
    /// Key of a `string`-keyed map whose value is not valid UTF-8.
    Bytes(&'a [u8]),
}

impl<'a> MapKey<'a> {
    fn from_value(value: Value<'a>) -> Option<MapKey<'a>> {
        let key = match value {
            Value::Bool(v) => MapKey::Bool(v),
            Value::I32(v) => MapKey::I32(v),
            Value::I64(v) => MapKey::I64(v),
            Value::U32(v) => MapKey::U32(v),
            Value::U64(v) => MapKey::U64(v),
            Value::String(v) => MapKey::String(v),
            Value::Bytes(v) => MapKey::Bytes(v),
            _ => return None,
        };
        Some(key)
    }

    /// Return the bytes the key is stored and hashed as, if it has the type
    /// of the stored keys.
    fn stored_bytes<'b>(&'b self, storage: Storage, buf: &'b mut [u8; 8]) -> Option<&'b [u8]> {
        let len = match (*self, storage) {
            (MapKey::Bool(v), Storage::Bool) => {
                buf[0] = v as u8;
                1
            }
            (MapKey::I32(v), Storage::Word32) => {
                buf[..4].copy_from_slice(&v.to_le_bytes());
                4
            }
            (MapKey::U32(v), Storage::Word32) => {
                buf[..4].copy_from_slice(&v.to_le_bytes());
                4
            }
            (MapKey::I64(v), Storage::Word64) => {
                buf.copy_from_slice(&v.to_le_bytes());
                8
            }
            (MapKey::U64(v), Storage::Word64) => {
                buf.copy_from_slice(&v.to_le_bytes());
                8
            }
            (MapKey::String(s), Storage::Bytes) => return Some(s.as_bytes()),
            (MapKey::Bytes(b), Storage::Bytes) => return Some(b),
            _ => return None,
        };
        Some(&buf[..len])
    }
}

impl<'a> From<&'a str> for MapKey<'a> {
    fn from(val: &'a str) -> Self {
        MapKey::String(val)
    }
}

macro_rules! map_key_from {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for MapKey<'_> {
            fn from(val: $ty) -> Self {
                MapKey::$variant(val)
            }
        }
    };
}

map_key_from!(bool, Bool);
map_key_from!(i32, I32);
map_key_from!(i64, I64);
map_key_from!(u32, U32);
map_key_from!(u64, U64);

/// A map field.
///
/// Entries are kept in the order their keys first appeared in the input. If
/// a key appears more than once, the last entry wins.
#[derive(Clone, Copy)]
pub struct Map<'a> {
    ctx: Context<'a>,

    /// Library index of the entry type.
    entry: u32,

    /// Address of the map header, or null for an empty map.
    header: Addr,
}

impl<'a> Map<'a> {
    pub fn len(&self) -> usize {
        if self.header.is_null() {
            0
        } else {
            self.ctx.arena.read_u32(self.header.add(8)) as usize
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, index: usize) -> Message<'a> {
        let entries = self.ctx.arena.read_addr(self.header);
        Message {
            ctx: self.ctx,
            index: self.entry,
            record: self.ctx.arena.read_addr(entries.add(index * 8)),
        }
    }

    fn entry_parts(&self, index: usize) -> (MapKey<'a>, Value<'a>) {
        let entry = self.entry(index);
        let key = MapKey::from_value(entry.value_at(0)).expect("map key is a scalar or string");
        (key, entry.value_at(1))
    }

    /// Return the value for `key`, or `None` if the map has no such key or
    /// `key` has a different type than the map's keys.
    pub fn get(&self, key: &MapKey<'_>) -> Option<Value<'a>> {
        let entry_type = self.ctx.compiled(self.entry);
        let mut buf = [0u8; 8];
        let bytes = key.stored_bytes(entry_type.layout.fields[0].storage, &mut buf)?;
        let index = map_lookup(self.ctx.arena, self.ctx.input, entry_type, self.header, bytes)?;
        Some(self.entry(index).value_at(1))
    }

    pub fn contains_key(&self, key: &MapKey<'_>) -> bool {
        self.get(key).is_some()
    }

    /// Iterate over entries in insertion order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (MapKey<'a>, Value<'a>)> + use<'a> {
        let map = *self;
        (0..map.len()).map(move |i| map.entry_parts(i))
    }
}

impl PartialEq for Map<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|(key, value)| other.get(&key) == Some(value))
    }
}

impl fmt::Debug for Map<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
