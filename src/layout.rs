//! Placement of a message's fields within an arena record.
//!
//! A record has this structure:
//!
//! ```text
//! [presence bitmap] [unknown fields header] [fields and oneof blocks]
//! ```
//!
//! The presence bitmap is a sequence of `u32` words with one bit per field
//! with explicit presence. The unknown-fields header starts at the next
//! 8-byte boundary and holds the address, length and capacity of a byte
//! buffer. Fields and oneof blocks follow, ordered by alignment and size so
//! that little space is lost to padding.

use crate::schema::{FieldDescriptor, Kind};

/// Size of the unknown-fields header: address (8), length (4), capacity (4).
pub const UNKNOWN_HEADER_SIZE: usize = 16;

/// Size of a list header: data address (8), length (4), capacity (4).
pub const LIST_HEADER_SIZE: usize = 16;

/// Size of a map header, which is allocated separately from the record.
///
/// Layout: entries address (8), entry count (4), entry capacity (4), slots
/// address (8), slot count (4), padding (12).
pub const MAP_HEADER_SIZE: usize = 40;

/// How a field's value is stored in a record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Storage {
    Bool,
    Word32,
    Word64,

    /// Address and 64-bit length of a string or bytes value.
    Bytes,

    /// Address of a child record.
    Message,

    /// Inline list header. Elements are `elem_size` bytes each.
    List { elem_size: u32 },

    /// Address of a map header.
    Map,
}

impl Storage {
    /// Return the storage of a single value of `kind`.
    pub fn for_kind(kind: Kind) -> Storage {
        match kind {
            Kind::Bool => Storage::Bool,
            Kind::Int32
            | Kind::Uint32
            | Kind::Sint32
            | Kind::Fixed32
            | Kind::Sfixed32
            | Kind::Float
            | Kind::Enum => Storage::Word32,
            Kind::Int64
            | Kind::Uint64
            | Kind::Sint64
            | Kind::Fixed64
            | Kind::Sfixed64
            | Kind::Double => Storage::Word64,
            Kind::String | Kind::Bytes => Storage::Bytes,
            Kind::Message | Kind::Group => Storage::Message,
        }
    }

    /// Return the storage used for `field`.
    pub fn for_field(field: &FieldDescriptor) -> Storage {
        if field.is_map() {
            Storage::Map
        } else if field.is_list() {
            Storage::List {
                elem_size: Storage::for_kind(field.kind()).size() as u32,
            }
        } else {
            Storage::for_kind(field.kind())
        }
    }

    pub fn size(self) -> usize {
        match self {
            Storage::Bool => 1,
            Storage::Word32 => 4,
            Storage::Word64 | Storage::Message | Storage::Map => 8,
            Storage::Bytes | Storage::List { .. } => 16,
        }
    }

    pub fn align(self) -> usize {
        match self {
            Storage::Bool => 1,
            Storage::Word32 => 4,
            _ => 8,
        }
    }
}

/// How the presence of a field is determined.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Presence {
    /// Bit in the presence bitmap.
    Bit(u32),

    /// Present if the value is not zero or empty.
    Implicit,

    /// Present if the child record address is not null.
    Pointer,

    /// Present if the discriminant of oneof `slot` is `ordinal + 1`.
    Oneof { slot: u32, ordinal: u32 },

    /// Present if the list or map is not empty.
    Repeated,
}

/// Location of a field in a record.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldSlot {
    pub number: u32,
    pub storage: Storage,
    pub offset: u32,
    pub presence: Presence,
}

/// Location of a oneof in a record.
#[derive(Clone, Debug, PartialEq)]
pub struct OneofSlot {
    /// Offset of the `u32` discriminant.
    pub offset: u32,

    /// Offset of the region shared by the members.
    pub union_offset: u32,
    pub union_size: u32,

    /// Indices of member fields.
    pub members: Vec<u32>,
}

/// Byte-level placement of a message's fields.
#[derive(Clone, Debug, PartialEq)]
pub struct Layout {
    /// Total record size, a multiple of 8.
    pub size: u32,

    /// Number of `u32` words in the presence bitmap.
    pub bitmap_words: u32,

    /// Offset of the unknown-fields header.
    pub unknown_offset: u32,

    /// Slot of each field, in the same order as the fields passed to
    /// [`Layout::plan`].
    pub fields: Vec<FieldSlot>,
    pub oneofs: Vec<OneofSlot>,
}

/// A field or oneof block to be placed.
struct Item {
    align: usize,
    size: usize,
    number: u32,
    kind: ItemKind,
}

enum ItemKind {
    Field(usize),
    Oneof(usize),
}

fn align_up(offset: usize, align: usize) -> usize {
    offset.next_multiple_of(align)
}

impl Layout {
    /// Compute the layout of a record holding `fields`.
    ///
    /// `fields` are the message's regular fields in declaration order,
    /// followed by any extensions. The result depends only on the fields
    /// passed in, so repeated calls return equal layouts.
    pub fn plan(fields: &[FieldDescriptor]) -> Layout {
        let storage: Vec<Storage> = fields.iter().map(Storage::for_field).collect();

        // Group oneof members by their position in the message's oneof list.
        let mut oneof_members: Vec<(usize, Vec<usize>)> = Vec::new();
        let mut oneof_of = vec![None; fields.len()];
        for (i, field) in fields.iter().enumerate() {
            let Some(oneof) = field.containing_oneof() else {
                continue;
            };
            let slot = match oneof_members.iter().position(|(o, _)| *o == oneof.index()) {
                Some(slot) => slot,
                None => {
                    oneof_members.push((oneof.index(), Vec::new()));
                    oneof_members.len() - 1
                }
            };
            oneof_members[slot].1.push(i);
            oneof_of[i] = Some(slot);
        }

        let mut presence = vec![Presence::Implicit; fields.len()];
        let mut bits = 0;
        for (i, field) in fields.iter().enumerate() {
            presence[i] = if let Some(slot) = oneof_of[i] {
                let ordinal = oneof_members[slot].1.iter().position(|&m| m == i).unwrap_or(0);
                Presence::Oneof {
                    slot: slot as u32,
                    ordinal: ordinal as u32,
                }
            } else if matches!(storage[i], Storage::List { .. } | Storage::Map) {
                Presence::Repeated
            } else if storage[i] == Storage::Message {
                Presence::Pointer
            } else if field.has_presence() {
                bits += 1;
                Presence::Bit(bits - 1)
            } else {
                Presence::Implicit
            };
        }
        let bitmap_words = bits.div_ceil(32);
        let unknown_offset = align_up(bitmap_words as usize * 4, 8);

        let mut items = Vec::with_capacity(fields.len());
        for (i, field) in fields.iter().enumerate() {
            if oneof_of[i].is_none() {
                items.push(Item {
                    align: storage[i].align(),
                    size: storage[i].size(),
                    number: field.number(),
                    kind: ItemKind::Field(i),
                });
            }
        }
        for (slot, (_, members)) in oneof_members.iter().enumerate() {
            let union_align = members.iter().map(|&m| storage[m].align()).max().unwrap_or(1);
            let union_size = members.iter().map(|&m| storage[m].size()).max().unwrap_or(0);
            items.push(Item {
                align: union_align.max(4),
                size: align_up(4, union_align) + union_size,
                number: members.iter().map(|&m| fields[m].number()).min().unwrap_or(0),
                kind: ItemKind::Oneof(slot),
            });
        }
        items.sort_by(|a, b| {
            b.align
                .cmp(&a.align)
                .then(b.size.cmp(&a.size))
                .then(a.number.cmp(&b.number))
        });

        let mut offsets = vec![0; fields.len()];
        let mut oneofs: Vec<OneofSlot> = oneof_members
            .iter()
            .map(|(_, members)| OneofSlot {
                offset: 0,
                union_offset: 0,
                union_size: 0,
                members: members.iter().map(|&m| m as u32).collect(),
            })
            .collect();

        let mut offset = unknown_offset + UNKNOWN_HEADER_SIZE;
        for item in &items {
            offset = align_up(offset, item.align);
            match item.kind {
                ItemKind::Field(i) => offsets[i] = offset,
                ItemKind::Oneof(slot) => {
                    let members = &oneof_members[slot].1;
                    let union_align = members.iter().map(|&m| storage[m].align()).max().unwrap_or(1);
                    let union_offset = align_up(offset + 4, union_align);
                    for &m in members {
                        offsets[m] = union_offset;
                    }
                    let oneof = &mut oneofs[slot];
                    oneof.offset = offset as u32;
                    oneof.union_offset = union_offset as u32;
                    oneof.union_size = (offset + item.size - union_offset) as u32;
                }
            }
            offset += item.size;
        }

        let slots = fields
            .iter()
            .enumerate()
            .map(|(i, field)| FieldSlot {
                number: field.number(),
                storage: storage[i],
                offset: offsets[i] as u32,
                presence: presence[i],
            })
            .collect();

        Layout {
            size: align_up(offset, 8) as u32,
            bitmap_words,
            unknown_offset: unknown_offset as u32,
            fields: slots,
            oneofs,
        }
    }
}

#[cfg(test)]
mod tests {
    use tdpb_testing::SchemaBuilder;
    use tdpb_wire::descriptor::FieldType;

    use super::{Layout, Presence, Storage};
    use crate::schema::{DescriptorPool, FieldDescriptor};

    fn fields_of(builder: SchemaBuilder, name: &str) -> Vec<FieldDescriptor> {
        let pool = DescriptorPool::new(&builder.build()).unwrap();
        pool.get_message(name).unwrap().fields().collect()
    }

    #[test]
    fn test_plan_orders_by_alignment_and_size() {
        let fields = fields_of(
            SchemaBuilder::proto2("t.proto").message("M", |m| {
                m.field("flag", 1, FieldType::BOOL)
                    .field("small", 2, FieldType::INT32)
                    .field("name", 3, FieldType::STRING)
                    .field("big", 4, FieldType::INT64)
                    .repeated("list", 5, FieldType::INT32)
            }),
            "M",
        );
        let layout = Layout::plan(&fields);

        // Bits for flag, small, name and big. Lists have no presence bit.
        assert_eq!(layout.bitmap_words, 1);
        assert_eq!(layout.unknown_offset, 8);

        let offsets: Vec<u32> = layout.fields.iter().map(|f| f.offset).collect();
        // 16-byte, 8-aligned fields first (name, then list by number), then
        // big, small and flag.
        assert_eq!(offsets, [68, 64, 24, 56, 40]);
        assert_eq!(layout.size, 72);

        assert_eq!(layout.fields[0].storage, Storage::Bool);
        assert_eq!(layout.fields[4].storage, Storage::List { elem_size: 4 });
        assert_eq!(layout.fields[0].presence, Presence::Bit(0));
        assert_eq!(layout.fields[3].presence, Presence::Bit(3));
        assert_eq!(layout.fields[4].presence, Presence::Repeated);
    }

    #[test]
    fn test_plan_oneof_shares_region() {
        let fields = fields_of(
            SchemaBuilder::proto3("t.proto").message("M", |m| {
                m.field("x", 1, FieldType::INT32).oneof("choice", |o| {
                    o.field("a", 2, FieldType::INT32)
                        .field("b", 3, FieldType::STRING)
                        .field("c", 4, FieldType::BOOL)
                })
            }),
            "M",
        );
        let layout = Layout::plan(&fields);

        assert_eq!(layout.bitmap_words, 0);
        assert_eq!(layout.oneofs.len(), 1);
        let oneof = &layout.oneofs[0];
        assert_eq!(oneof.members, [1, 2, 3]);
        assert_eq!(oneof.offset, 16);
        assert_eq!(oneof.union_offset, 24);
        assert_eq!(oneof.union_size, 16);
        for i in 1..4 {
            assert_eq!(layout.fields[i].offset, 24);
            assert_eq!(
                layout.fields[i].presence,
                Presence::Oneof {
                    slot: 0,
                    ordinal: i as u32 - 1
                }
            );
        }
        assert_eq!(layout.fields[0].presence, Presence::Implicit);
        assert_eq!(layout.fields[0].offset, 40);
        assert_eq!(layout.size, 48);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let builder = SchemaBuilder::proto3("t.proto").message("M", |m| {
            m.field("a", 1, FieldType::DOUBLE)
                .map("m", 2, FieldType::STRING, FieldType::INT32)
                .message_field("child", 3, "M")
        });
        let a = Layout::plan(&fields_of(builder.clone(), "M"));
        let b = Layout::plan(&fields_of(builder, "M"));
        assert_eq!(a, b);
        assert_eq!(a.fields[1].storage, Storage::Map);
        assert_eq!(a.fields[2].presence, Presence::Pointer);
    }
}
