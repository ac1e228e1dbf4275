//! Instruction programs executed by the parser VM.
//!
//! Each field of a message is compiled to an [`Instr`] keyed by the wire tag
//! it expects. Repeated scalar fields get a second instruction so that both
//! the packed and expanded encodings are accepted. The [`Dispatch`] table
//! maps tags to instructions.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tdpb_wire::{WireType, make_tag};

use crate::layout::{Layout, Presence};
use crate::schema::{FieldDescriptor, Kind};

/// Decoding of a single scalar value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScalarKind {
    Bool,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Sint32,
    Sint64,
    Fixed32,
    Fixed64,
    Sfixed32,
    Sfixed64,
    Float,
    Double,
    Enum,
}

impl ScalarKind {
    fn from_kind(kind: Kind) -> Option<ScalarKind> {
        let scalar = match kind {
            Kind::Bool => ScalarKind::Bool,
            Kind::Int32 => ScalarKind::Int32,
            Kind::Int64 => ScalarKind::Int64,
            Kind::Uint32 => ScalarKind::Uint32,
            Kind::Uint64 => ScalarKind::Uint64,
            Kind::Sint32 => ScalarKind::Sint32,
            Kind::Sint64 => ScalarKind::Sint64,
            Kind::Fixed32 => ScalarKind::Fixed32,
            Kind::Fixed64 => ScalarKind::Fixed64,
            Kind::Sfixed32 => ScalarKind::Sfixed32,
            Kind::Sfixed64 => ScalarKind::Sfixed64,
            Kind::Float => ScalarKind::Float,
            Kind::Double => ScalarKind::Double,
            Kind::Enum => ScalarKind::Enum,
            Kind::String | Kind::Bytes | Kind::Message | Kind::Group => return None,
        };
        Some(scalar)
    }

    /// Wire type of an unpacked value.
    pub fn wire_type(self) -> WireType {
        match self {
            ScalarKind::Fixed32 | ScalarKind::Sfixed32 | ScalarKind::Float => WireType::I32,
            ScalarKind::Fixed64 | ScalarKind::Sfixed64 | ScalarKind::Double => WireType::I64,
            _ => WireType::Varint,
        }
    }

    /// Size of the stored value in bytes.
    pub fn width(self) -> usize {
        match self {
            ScalarKind::Bool => 1,
            ScalarKind::Int32
            | ScalarKind::Uint32
            | ScalarKind::Sint32
            | ScalarKind::Fixed32
            | ScalarKind::Sfixed32
            | ScalarKind::Float
            | ScalarKind::Enum => 4,
            _ => 8,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ScalarKind::Bool => "bool",
            ScalarKind::Int32 => "int32",
            ScalarKind::Int64 => "int64",
            ScalarKind::Uint32 => "uint32",
            ScalarKind::Uint64 => "uint64",
            ScalarKind::Sint32 => "sint32",
            ScalarKind::Sint64 => "sint64",
            ScalarKind::Fixed32 => "fixed32",
            ScalarKind::Fixed64 => "fixed64",
            ScalarKind::Sfixed32 => "sfixed32",
            ScalarKind::Sfixed64 => "sfixed64",
            ScalarKind::Float => "float",
            ScalarKind::Double => "double",
            ScalarKind::Enum => "enum",
        }
    }
}

/// Operation performed by an instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Scalar(ScalarKind),
    String,
    Bytes,
    Message,
    Group,
    ScalarList(ScalarKind),
    PackedList(ScalarKind),
    StringList,
    BytesList,
    MessageList,
    GroupList,
    Map,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Scalar(kind) => write!(f, "{}", kind.name()),
            Op::String => write!(f, "string"),
            Op::Bytes => write!(f, "bytes"),
            Op::Message => write!(f, "message"),
            Op::Group => write!(f, "group"),
            Op::ScalarList(kind) => write!(f, "list<{}>", kind.name()),
            Op::PackedList(kind) => write!(f, "packed<{}>", kind.name()),
            Op::StringList => write!(f, "list<string>"),
            Op::BytesList => write!(f, "list<bytes>"),
            Op::MessageList => write!(f, "list<message>"),
            Op::GroupList => write!(f, "list<group>"),
            Op::Map => write!(f, "map"),
        }
    }
}

/// A single decoding instruction.
#[derive(Clone, Debug, PartialEq)]
pub struct Instr {
    /// Tag this instruction handles.
    pub tag: u32,
    pub wire_type: WireType,
    pub op: Op,

    /// Field number.
    pub number: u32,

    /// Index of the field in the compiled type.
    pub field: u32,

    /// Offset of the field's storage in the record.
    pub offset: u32,
    pub presence: Presence,

    /// Index of the child type in the library, for message, group and map
    /// fields.
    pub child: Option<u32>,

    /// Initial capacity of lists and maps.
    pub capacity_hint: u32,

    /// Index of this instruction's hit counter in a profile.
    pub counter: u32,

    /// Sorted values of a closed enum. Other values are stored as unknown
    /// fields.
    pub enum_values: Option<Arc<[i32]>>,
    pub validate_utf8: bool,
}

impl Instr {
    /// Return true if `value` should be stored rather than treated as an
    /// unknown field.
    #[inline]
    pub fn accepts_enum(&self, value: i32) -> bool {
        self.enum_values
            .as_ref()
            .is_none_or(|values| values.binary_search(&value).is_ok())
    }
}

/// Maximum tag for which a dense dispatch table is always used.
const DENSE_ALWAYS: u32 = 128;

/// Maximum tag for which a dense dispatch table may be used.
const DENSE_MAX: u32 = 1024;

/// Multiplier for the tag hash (Fibonacci hashing).
const TAG_HASH: u32 = 0x9E3779B9;

/// Table mapping tags to instruction indices.
#[derive(Clone, Debug, PartialEq)]
pub enum Dispatch {
    /// Table indexed by tag. Entries are an instruction index plus one, or
    /// zero for no instruction.
    Dense(Vec<u32>),

    /// Open-addressed table of `(tag, instruction index)` pairs with linear
    /// probing. A tag of zero marks an empty slot.
    Hashed { slots: Vec<(u32, u32)>, shift: u32 },
}

impl Dispatch {
    /// Build a dispatch table for `entries`, which are `(tag, instruction
    /// index)` pairs in insertion order. Tags must be unique.
    fn build(entries: &[(u32, u32)]) -> Dispatch {
        let max_tag = entries.iter().map(|(tag, _)| *tag).max().unwrap_or(0);
        let count = entries.len() as u32;
        if max_tag < DENSE_ALWAYS || (max_tag <= DENSE_MAX && max_tag <= 8 * count) {
            let mut table = vec![0; max_tag as usize + 1];
            for &(tag, index) in entries {
                table[tag as usize] = index + 1;
            }
            return Dispatch::Dense(table);
        }

        let capacity = (2 * entries.len()).next_power_of_two().max(2);
        let shift = 32 - capacity.trailing_zeros();
        let mut slots = vec![(0, 0); capacity];
        for &(tag, index) in entries {
            let mut pos = Self::hash(tag, shift);
            while slots[pos].0 != 0 {
                pos = (pos + 1) & (capacity - 1);
            }
            slots[pos] = (tag, index);
        }
        Dispatch::Hashed { slots, shift }
    }

    #[inline]
    pub(crate) fn hash(tag: u32, shift: u32) -> usize {
        (tag.wrapping_mul(TAG_HASH) >> shift) as usize
    }

    /// Return the index of the instruction for `tag`.
    #[inline]
    pub fn lookup(&self, tag: u32) -> Option<usize> {
        match self {
            Dispatch::Dense(table) => match table.get(tag as usize) {
                Some(&entry) if entry != 0 => Some(entry as usize - 1),
                _ => None,
            },
            Dispatch::Hashed { slots, shift } => {
                let mask = slots.len() - 1;
                let mut pos = Self::hash(tag, *shift);
                loop {
                    let (slot_tag, index) = slots[pos];
                    if slot_tag == tag {
                        return Some(index as usize);
                    } else if slot_tag == 0 {
                        return None;
                    }
                    pos = (pos + 1) & mask;
                }
            }
        }
    }

    pub fn is_dense(&self) -> bool {
        matches!(self, Dispatch::Dense(_))
    }
}

/// Compile-time hints for one message type, usually derived from a profile.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TypeHints {
    /// Initial capacity of list and map fields, keyed by field number.
    pub capacity: FxHashMap<u32, u32>,

    /// Field numbers ordered from most to least frequently seen.
    pub hot: Vec<u32>,
}

/// Compiled decoding program for one message type.
#[derive(Clone, Debug, PartialEq)]
pub struct Program {
    instrs: Vec<Instr>,
    dispatch: Dispatch,

    /// Indices of instructions for extension fields. These are matched by a
    /// linear scan after a dispatch miss.
    extensions: SmallVec<[u32; 4]>,
}

impl Program {
    /// Assemble the program for a message type.
    ///
    /// `fields` and `layout` describe the type's fields, with extensions
    /// starting at index `extension_start`. `children` gives the library
    /// index of each field's message type, and `enum_tables` the accepted
    /// values of closed enum fields.
    pub fn assemble(
        fields: &[FieldDescriptor],
        extension_start: usize,
        layout: &Layout,
        children: &[Option<u32>],
        enum_tables: &[Option<Arc<[i32]>>],
        hints: Option<&TypeHints>,
    ) -> Program {
        let mut instrs = Vec::with_capacity(fields.len() + 4);
        let mut order: Vec<usize> = (0..fields.len()).collect();
        order.sort_by_key(|&i| fields[i].number());

        for i in order {
            let field = &fields[i];
            let slot = &layout.fields[i];
            let number = field.number();
            let capacity_hint = hints
                .and_then(|h| h.capacity.get(&number).copied())
                .unwrap_or(0);
            let scalar = ScalarKind::from_kind(field.kind());

            let mut push = |op: Op, wire_type: WireType| {
                instrs.push(Instr {
                    tag: make_tag(number, wire_type),
                    wire_type,
                    op,
                    number,
                    field: i as u32,
                    offset: slot.offset,
                    presence: slot.presence,
                    child: children[i],
                    capacity_hint,
                    counter: 0,
                    enum_values: enum_tables[i].clone(),
                    validate_utf8: field.validates_utf8(),
                });
            };

            if field.is_map() {
                push(Op::Map, WireType::Len);
                continue;
            }
            match (field.is_list(), field.kind(), scalar) {
                (false, Kind::String, _) => push(Op::String, WireType::Len),
                (false, Kind::Bytes, _) => push(Op::Bytes, WireType::Len),
                (false, Kind::Message, _) => push(Op::Message, WireType::Len),
                (false, Kind::Group, _) => push(Op::Group, WireType::SGroup),
                (false, _, Some(kind)) => push(Op::Scalar(kind), kind.wire_type()),
                (true, Kind::String, _) => push(Op::StringList, WireType::Len),
                (true, Kind::Bytes, _) => push(Op::BytesList, WireType::Len),
                (true, Kind::Message, _) => push(Op::MessageList, WireType::Len),
                (true, Kind::Group, _) => push(Op::GroupList, WireType::SGroup),
                (true, _, Some(kind)) => {
                    // Both encodings are accepted. The declared encoding
                    // comes first so that it is the predicted instruction.
                    if field.is_packed() {
                        push(Op::PackedList(kind), WireType::Len);
                        push(Op::ScalarList(kind), kind.wire_type());
                    } else {
                        push(Op::ScalarList(kind), kind.wire_type());
                        push(Op::PackedList(kind), WireType::Len);
                    }
                }
                (_, _, None) => {}
            }
        }
        for (i, instr) in instrs.iter_mut().enumerate() {
            instr.counter = i as u32;
        }

        // Pick one instruction per tag, preferring the lower field number.
        let mut by_tag: FxHashMap<u32, u32> = FxHashMap::default();
        let mut extensions = SmallVec::new();
        for (i, instr) in instrs.iter().enumerate() {
            if instr.field as usize >= extension_start {
                extensions.push(i as u32);
                continue;
            }
            by_tag.entry(instr.tag).or_insert(i as u32);
        }

        // Insert hot fields first so they sit in their home slots of a hashed
        // table.
        let mut entries: Vec<(u32, u32)> = by_tag.into_iter().collect();
        let rank = |number: u32| -> usize {
            hints
                .and_then(|h| h.hot.iter().position(|&n| n == number))
                .unwrap_or(usize::MAX)
        };
        entries.sort_by_key(|&(tag, _)| (rank(tag >> 3), tag));

        Program {
            dispatch: Dispatch::build(&entries),
            instrs,
            extensions,
        }
    }

    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Find the instruction for `tag`.
    ///
    /// `last` is the index of the previously executed instruction. Fields
    /// usually appear in number order and repeated fields are usually
    /// contiguous, so the instruction after `last` and `last` itself are
    /// tried before the dispatch table.
    #[inline]
    pub fn find(&self, tag: u32, last: Option<usize>) -> Option<usize> {
        if let Some(last) = last {
            let is_candidate = |i: usize| {
                self.instrs.get(i).is_some_and(|instr| instr.tag == tag)
                    && !self.extensions.contains(&(i as u32))
            };
            if is_candidate(last + 1) {
                return Some(last + 1);
            }
            if is_candidate(last) {
                return Some(last);
            }
        }
        self.dispatch.lookup(tag)
    }

    /// Find an extension instruction for `tag`.
    pub fn find_extension(&self, tag: u32) -> Option<usize> {
        self.extensions
            .iter()
            .map(|&i| i as usize)
            .find(|&i| self.instrs[i].tag == tag)
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dispatch = match &self.dispatch {
            Dispatch::Dense(table) => format!("dense[{}]", table.len()),
            Dispatch::Hashed { slots, .. } => format!("hashed[{}]", slots.len()),
        };
        writeln!(f, "dispatch {}, {} instructions", dispatch, self.instrs.len())?;
        for (i, instr) in self.instrs.iter().enumerate() {
            write!(
                f,
                "{:4}: field {:<5} {:?}:{} @{}",
                i, instr.number, instr.wire_type, instr.op, instr.offset
            )?;
            match instr.presence {
                Presence::Bit(bit) => write!(f, " bit {}", bit)?,
                Presence::Oneof { slot, ordinal } => write!(f, " oneof {}.{}", slot, ordinal)?,
                Presence::Implicit | Presence::Pointer | Presence::Repeated => {}
            }
            if let Some(child) = instr.child {
                write!(f, " type {}", child)?;
            }
            if instr.capacity_hint > 0 {
                write!(f, " cap {}", instr.capacity_hint)?;
            }
            if self.extensions.contains(&(i as u32)) {
                write!(f, " ext")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tdpb_testing::{SchemaBuilder, TestCases};
    use tdpb_wire::WireType;
    use tdpb_wire::descriptor::FieldType;

    use super::{Dispatch, Op, Program, ScalarKind, TypeHints};
    use crate::layout::Layout;
    use crate::schema::{DescriptorPool, FieldDescriptor};

    fn assemble(builder: SchemaBuilder, hints: Option<&TypeHints>) -> Program {
        let pool = DescriptorPool::new(&builder.build()).unwrap();
        let fields: Vec<FieldDescriptor> = pool.get_message("M").unwrap().fields().collect();
        let layout = Layout::plan(&fields);
        let children = vec![None; fields.len()];
        let enums = vec![None; fields.len()];
        Program::assemble(&fields, fields.len(), &layout, &children, &enums, hints)
    }

    #[test]
    fn test_assemble_instructions() {
        let program = assemble(
            SchemaBuilder::proto3("t.proto").message("M", |m| {
                m.repeated("xs", 2, FieldType::INT32)
                    .field("s", 1, FieldType::STRING)
                    .field("d", 3, FieldType::DOUBLE)
            }),
            None,
        );
        let ops: Vec<(u32, Op, WireType)> = program
            .instrs()
            .iter()
            .map(|i| (i.number, i.op, i.wire_type))
            .collect();
        assert_eq!(
            ops,
            [
                (1, Op::String, WireType::Len),
                (2, Op::PackedList(ScalarKind::Int32), WireType::Len),
                (2, Op::ScalarList(ScalarKind::Int32), WireType::Varint),
                (3, Op::Scalar(ScalarKind::Double), WireType::I64),
            ]
        );
        assert!(program.instrs()[0].validate_utf8);
        assert!(program.dispatch().is_dense());
        assert_eq!(program.find(0x12, None), Some(1));
        assert_eq!(program.find(0x10, None), Some(2));
        assert_eq!(program.find(0x19, None), Some(3));
        assert_eq!(program.find(0x18, None), None);

        // Prediction of the next instruction, and repeats of the last one.
        assert_eq!(program.find(0x12, Some(0)), Some(1));
        assert_eq!(program.find(0x10, Some(2)), Some(2));
    }

    #[test]
    fn test_dispatch_kind() {
        #[derive(Debug)]
        struct Case {
            numbers: Vec<i32>,
            dense: bool,
        }

        let cases = [
            Case {
                numbers: vec![1, 2, 3],
                dense: true,
            },
            Case {
                numbers: vec![1, 15],
                dense: true,
            },
            // Tag 800 with 100 instructions is dense enough.
            Case {
                numbers: (1..=100).collect(),
                dense: true,
            },
            Case {
                numbers: vec![1, 1000],
                dense: false,
            },
            Case {
                numbers: vec![5, 100_000, 536_870_911],
                dense: false,
            },
        ];

        cases.test_each(|case| {
            let numbers = case.numbers.clone();
            let program = assemble(
                SchemaBuilder::proto3("t.proto").message("M", move |mut m| {
                    for n in numbers {
                        m = m.field(&format!("f{}", n), n, FieldType::INT64);
                    }
                    m
                }),
                None,
            );
            assert_eq!(program.dispatch().is_dense(), case.dense);
            for (i, &n) in case.numbers.iter().enumerate() {
                let tag = (n as u32) << 3;
                assert_eq!(program.find(tag, None), Some(i));
                assert_eq!(program.find(tag | 1, None), None);
            }
        })
    }

    #[test]
    fn test_hashed_dispatch_probing() {
        let entries: Vec<(u32, u32)> = (0..50).map(|i| ((i * 4096 + 1) << 3, i)).collect();
        let dispatch = Dispatch::build(&entries);
        assert!(!dispatch.is_dense());
        for &(tag, index) in &entries {
            assert_eq!(dispatch.lookup(tag), Some(index as usize));
        }
        assert_eq!(dispatch.lookup(3 << 3), None);
    }

    #[test]
    fn test_hints() {
        let mut hints = TypeHints::default();
        hints.capacity.insert(2, 16);
        hints.hot = vec![2];
        let program = assemble(
            SchemaBuilder::proto3("t.proto").message("M", |m| {
                m.field("a", 1, FieldType::INT32)
                    .repeated("b", 2, FieldType::STRING)
            }),
            Some(&hints),
        );
        assert_eq!(program.instrs()[0].capacity_hint, 0);
        assert_eq!(program.instrs()[1].capacity_hint, 16);
        assert_eq!(program.find(0x12, None), Some(1));
    }

    #[test]
    fn test_display() {
        let program = assemble(
            SchemaBuilder::proto2("t.proto").message("M", |m| {
                m.field("a", 1, FieldType::SINT32)
                    .repeated("b", 2, FieldType::FIXED64)
            }),
            None,
        );
        let text = program.to_string();
        assert!(text.starts_with("dispatch dense[19], 3 instructions\n"));
        assert!(text.contains("field 1     Varint:sint32 @40 bit 0"));
        assert!(text.contains("I64:list<fixed64>"));
        assert!(text.contains("Len:packed<fixed64>"));
    }
}
