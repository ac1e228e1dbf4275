//! Parser VM which executes compiled programs against wire bytes.
//!
//! Decoding makes a single left-to-right pass over the input. Each record is
//! decoded by a loop which reads a tag, finds the instruction for it and
//! executes it. Tags with no instruction, including tags whose wire type does
//! not match the field's type, are copied verbatim into the record's
//! unknown-fields buffer.

use std::hash::Hasher;

use rustc_hash::FxHasher;
use tdpb_wire::varint::{encode_varint, zigzag_decode32, zigzag_decode64};
use tdpb_wire::{ReadCursor, WireError, WireType, make_tag};

use crate::arena::{Addr, Arena};
use crate::env::default_recursion_limit;
use crate::errors::{DecodeError, DecodeErrorKind};
use crate::layout::{MAP_HEADER_SIZE, Presence, Storage};
use crate::message_type::{CompiledType, Library, MessageType};
use crate::profile::Profile;
use crate::schema::Kind;
use crate::program::{Instr, Op, ScalarKind};

/// Capacity of a list when the first element is added, if there is no
/// capacity hint.
const MIN_LIST_CAPACITY: usize = 4;

/// Minimum number of hash slots in a map.
const MIN_MAP_SLOTS: usize = 8;

/// Initial capacity of a record's unknown-fields buffer.
const MIN_UNKNOWN_CAPACITY: usize = 32;

/// Options that control a single decode.
///
/// ```
/// use tdpb::UnmarshalOptions;
///
/// let opts = UnmarshalOptions::new()
///     .recursion_limit(32)
///     .max_decode_misses(100)
///     .allow_alias(true);
/// ```
#[derive(Clone, Debug)]
pub struct UnmarshalOptions<'p> {
    max_decode_misses: Option<u64>,
    profile: Option<(&'p Profile, f64)>,
    allow_alias: bool,
    recursion_limit: u32,
    max_work: Option<u64>,
}

impl Default for UnmarshalOptions<'_> {
    fn default() -> Self {
        UnmarshalOptions {
            max_decode_misses: None,
            profile: None,
            allow_alias: false,
            recursion_limit: default_recursion_limit(),
            max_work: None,
        }
    }
}

impl<'p> UnmarshalOptions<'p> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail with [`DecodeErrorKind::DecodeMissBudgetExceeded`] if the input
    /// contains more than `n` fields which are not in the schema.
    pub fn max_decode_misses(mut self, n: u64) -> Self {
        self.max_decode_misses = Some(n);
        self
    }

    /// Record decode counters in `profile`.
    ///
    /// `rate` is the fraction of decodes which are recorded, in `[0, 1]`.
    /// Whether a decode is recorded is chosen at random when it starts.
    pub fn record_profile(mut self, profile: &'p Profile, rate: f64) -> Self {
        self.profile = Some((profile, rate));
        self
    }

    /// Allow string and bytes values to refer to the input buffer instead of
    /// being copied into the arena.
    pub fn allow_alias(mut self, allow: bool) -> Self {
        self.allow_alias = allow;
        self
    }

    /// Set the maximum nesting depth of messages and groups.
    ///
    /// The default is 100, or the value of the `TDPB_RECURSION_LIMIT`
    /// environment variable.
    pub fn recursion_limit(mut self, limit: u32) -> Self {
        self.recursion_limit = limit;
        self
    }

    /// Fail with [`DecodeErrorKind::WorkLimit`] after `n` units of work.
    ///
    /// Each field counts as one unit, and each element of a packed field as
    /// one more.
    pub fn max_work(mut self, n: u64) -> Self {
        self.max_work = Some(n);
        self
    }
}

/// Hash the key of a map entry.
///
/// `key` is the content of a string key, or the stored bytes of a scalar key.
pub(crate) fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(key);
    hasher.finish()
}

/// Return the stored key of a map entry record.
pub(crate) fn entry_key<'s>(
    arena: &'s Arena,
    input: &'s [u8],
    entry_type: &CompiledType,
    entry: Addr,
) -> &'s [u8] {
    let slot = &entry_type.layout.fields[0];
    let addr = entry.add(slot.offset as usize);
    match slot.storage {
        Storage::Bytes => {
            let data = arena.read_addr(addr);
            let len = arena.read_u64(addr.add(8)) as usize;
            arena.payload(input, data, len)
        }
        storage => arena.bytes(addr, storage.size()),
    }
}

/// Find the index of the entry whose key is `key` in the map at `header`.
pub(crate) fn map_lookup(
    arena: &Arena,
    input: &[u8],
    entry_type: &CompiledType,
    header: Addr,
    key: &[u8],
) -> Option<usize> {
    if header.is_null() {
        return None;
    }
    let slots = arena.read_addr(header.add(16));
    let slot_count = arena.read_u32(header.add(24)) as usize;
    if slot_count == 0 {
        return None;
    }
    let entries = arena.read_addr(header);
    let mask = slot_count - 1;
    let mut pos = hash_key(key) as usize & mask;
    loop {
        let slot = arena.read_u32(slots.add(pos * 4));
        if slot == 0 {
            return None;
        }
        let index = slot as usize - 1;
        let entry = arena.read_addr(entries.add(index * 8));
        if entry_key(arena, input, entry_type, entry) == key {
            return Some(index);
        }
        pos = (pos + 1) & mask;
    }
}

/// Decode `input` as a message of type `ty`, allocating records in `arena`.
///
/// Returns the address of the root record.
pub(crate) fn decode(
    ty: &MessageType,
    arena: &mut Arena,
    input: &[u8],
    opts: &UnmarshalOptions,
) -> Result<Addr, DecodeError> {
    let lib = ty.library();
    let profile = match opts.profile {
        Some((profile, rate)) if profile.is_for(lib) => {
            (rate >= 1. || fastrand::f64() < rate).then_some(profile)
        }
        Some(_) => {
            log::warn!(
                "Not recording profile for {} because it was created for a different type",
                ty.full_name()
            );
            None
        }
        None => None,
    };

    let mut decoder = Decoder {
        lib,
        arena,
        input,
        alias: opts.allow_alias,
        recursion_limit: opts.recursion_limit,
        depth: 0,
        work: 0,
        max_work: opts.max_work,
        misses: 0,
        max_misses: opts.max_decode_misses,
        rejected_enum: false,
        profile,
        profiled: Vec::new(),
    };
    let root = decoder.alloc_record(ty.index());
    let mut cur = ReadCursor::new(input);
    decoder.parse_record(ty.index(), root, &mut cur, None)?;

    // Lengths are recorded once per record, after all occurrences of a
    // sub-message have been merged into it.
    if let Some(profile) = decoder.profile {
        for &(ty, record) in &decoder.profiled {
            decoder.record_lengths(profile, ty, &lib.types[ty as usize], record);
        }
    }
    Ok(root)
}

struct Decoder<'a> {
    lib: &'a Library,
    arena: &'a mut Arena,
    input: &'a [u8],
    alias: bool,

    recursion_limit: u32,
    depth: u32,

    work: u64,
    max_work: Option<u64>,

    /// Number of fields copied to unknown fields after a dispatch miss.
    misses: u64,
    max_misses: Option<u64>,

    /// Set when a singular closed-enum field rejects a value.
    rejected_enum: bool,

    profile: Option<&'a Profile>,

    /// Records allocated during a profiled decode.
    profiled: Vec<(u32, Addr)>,
}

impl<'a> Decoder<'a> {
    /// Decode fields into `record` until `cur` is exhausted or, for a group,
    /// until the end-group tag for `group` is read.
    fn parse_record(
        &mut self,
        ty: u32,
        record: Addr,
        cur: &mut ReadCursor<'a>,
        group: Option<u32>,
    ) -> Result<(), DecodeError> {
        let lib = self.lib;
        let compiled = &lib.types[ty as usize];
        self.parse_fields(ty, compiled, record, cur, group)
            .map_err(|err| err.in_message(compiled.descriptor.full_name()))
    }

    fn parse_fields(
        &mut self,
        ty: u32,
        compiled: &'a CompiledType,
        record: Addr,
        cur: &mut ReadCursor<'a>,
        group: Option<u32>,
    ) -> Result<(), DecodeError> {
        let program = &compiled.program;
        let mut last = None;
        loop {
            if cur.is_at_end() {
                return match group {
                    None => Ok(()),
                    Some(number) => {
                        // Either the input ended, or the enclosing message
                        // ended without closing the group.
                        let kind = if cur.is_nested() {
                            DecodeErrorKind::MalformedGroup
                        } else {
                            DecodeErrorKind::TruncatedInput
                        };
                        Err(DecodeError::new(kind).for_field(number).at(cur.position()))
                    }
                };
            }

            let start = cur.position();
            let (number, wire_type) = cur.read_tag()?;
            match wire_type {
                4 if group == Some(number) => return Ok(()),
                4 => {
                    return Err(DecodeError::new(DecodeErrorKind::MalformedGroup)
                        .for_field(number)
                        .at(start));
                }
                6 | 7 => {
                    return Err(DecodeError::new(DecodeErrorKind::InvalidWireType)
                        .for_field(number)
                        .at(start));
                }
                _ => {}
            }
            self.spend_work(1, start)?;

            let tag = (number << 3) | wire_type as u32;
            let index = program
                .find(tag, last)
                .or_else(|| program.find_extension(tag));
            let Some(index) = index else {
                self.misses += 1;
                if self.max_misses.is_some_and(|max| self.misses > max) {
                    return Err(DecodeError::new(DecodeErrorKind::DecodeMissBudgetExceeded)
                        .for_field(number)
                        .at(start));
                }
                let max_depth = self.recursion_limit.saturating_sub(self.depth);
                let skipped = cur
                    .skip_field(number, wire_type, max_depth)
                    .map_err(|err| DecodeError::from(err).for_field(number))?;
                // Fields inside an unknown group cost work like any other.
                self.spend_work(skipped as u64 - 1, start)?;
                let input = self.input;
                self.append_unknown(compiled, record, &input[start..cur.position()]);
                continue;
            };

            let instr = &program.instrs()[index];
            self.execute(compiled, instr, record, cur, start)
                .map_err(|err| err.for_field(number))?;
            if let Some(profile) = self.profile {
                profile.record_hit(ty, instr.counter);
            }
            last = Some(index);
        }
    }

    fn execute(
        &mut self,
        compiled: &'a CompiledType,
        instr: &'a Instr,
        record: Addr,
        cur: &mut ReadCursor<'a>,
        start: usize,
    ) -> Result<(), DecodeError> {
        let slot = record.add(instr.offset as usize);
        match instr.op {
            Op::Scalar(kind) => {
                let value = read_scalar(cur, kind)?;
                if kind == ScalarKind::Enum && !instr.accepts_enum(value as u32 as i32) {
                    let input = self.input;
                    self.append_unknown(compiled, record, &input[start..cur.position()]);
                    self.rejected_enum = true;
                    return Ok(());
                }
                self.set_present(compiled, record, instr);
                self.write_scalar(slot, kind, value);
            }
            Op::String | Op::Bytes => {
                let (data, len) = self.read_bytes(cur, instr)?;
                self.set_present(compiled, record, instr);
                self.arena.write_addr(slot, data);
                self.arena.write_u64(slot.add(8), len as u64);
            }
            Op::Message => {
                let len = cur.read_len()?;
                let mut sub = cur.split(len);
                let child = self.child_record(compiled, record, instr);
                self.enter(start)?;
                self.parse_record(instr_child(instr), child, &mut sub, None)?;
                self.depth -= 1;
            }
            Op::Group => {
                let child = self.child_record(compiled, record, instr);
                self.enter(start)?;
                self.parse_record(instr_child(instr), child, cur, Some(instr.number))?;
                self.depth -= 1;
            }
            Op::ScalarList(kind) => {
                let value = read_scalar(cur, kind)?;
                if kind == ScalarKind::Enum && !instr.accepts_enum(value as u32 as i32) {
                    let input = self.input;
                    self.append_unknown(compiled, record, &input[start..cur.position()]);
                    return Ok(());
                }
                let elem = self.list_push(slot, kind.width(), instr.capacity_hint);
                self.write_scalar(elem, kind, value);
            }
            Op::PackedList(kind) => self.read_packed(compiled, instr, record, cur, kind)?,
            Op::StringList | Op::BytesList => {
                let (data, len) = self.read_bytes(cur, instr)?;
                let elem = self.list_push(slot, 16, instr.capacity_hint);
                self.arena.write_addr(elem, data);
                self.arena.write_u64(elem.add(8), len as u64);
            }
            Op::MessageList => {
                let len = cur.read_len()?;
                let mut sub = cur.split(len);
                let child_ty = instr_child(instr);
                let child = self.alloc_record(child_ty);
                self.enter(start)?;
                self.parse_record(child_ty, child, &mut sub, None)?;
                self.depth -= 1;
                let elem = self.list_push(slot, 8, instr.capacity_hint);
                self.arena.write_addr(elem, child);
            }
            Op::GroupList => {
                let child_ty = instr_child(instr);
                let child = self.alloc_record(child_ty);
                self.enter(start)?;
                self.parse_record(child_ty, child, cur, Some(instr.number))?;
                self.depth -= 1;
                let elem = self.list_push(slot, 8, instr.capacity_hint);
                self.arena.write_addr(elem, child);
            }
            Op::Map => {
                let len = cur.read_len()?;
                let mut sub = cur.split(len);
                let entry_ty = instr_child(instr);
                let entry = self.alloc_record(entry_ty);
                self.enter(start)?;
                self.rejected_enum = false;
                self.parse_record(entry_ty, entry, &mut sub, None)?;
                self.depth -= 1;

                // An entry whose closed-enum value is unknown is kept whole
                // in the parent's unknown fields instead of the map.
                let enum_value = self.lib.types[entry_ty as usize]
                    .fields
                    .get(1)
                    .is_some_and(|f| f.kind() == Kind::Enum);
                if enum_value && self.rejected_enum {
                    if self.profile.is_some() {
                        self.profiled.pop();
                    }
                    let input = self.input;
                    self.append_unknown(compiled, record, &input[start..cur.position()]);
                    return Ok(());
                }
                self.map_insert(slot, entry_ty, entry, instr.capacity_hint);
            }
        }
        Ok(())
    }

    fn read_packed(
        &mut self,
        compiled: &'a CompiledType,
        instr: &'a Instr,
        record: Addr,
        cur: &mut ReadCursor<'a>,
        kind: ScalarKind,
    ) -> Result<(), DecodeError> {
        let len = cur.read_len()?;
        let mut sub = cur.split(len);
        let slot = record.add(instr.offset as usize);
        let width = kind.width();

        let encoded_width = match kind.wire_type() {
            WireType::I32 => Some(4),
            WireType::I64 => Some(8),
            _ => None,
        };
        if let Some(encoded_width) = encoded_width {
            if len % encoded_width != 0 {
                return Err(DecodeError::new(DecodeErrorKind::TruncatedInput)
                    .at(sub.position() + len - len % encoded_width));
            }
            let count = len / encoded_width;
            self.spend_work(count as u64, sub.position())?;
            self.list_reserve(slot, width, count, instr.capacity_hint);
            while !sub.is_at_end() {
                let value = read_scalar(&mut sub, kind)?;
                let elem = self.list_push(slot, width, instr.capacity_hint);
                self.write_scalar(elem, kind, value);
            }
            return Ok(());
        }

        while !sub.is_at_end() {
            let elem_start = sub.position();
            self.spend_work(1, elem_start)?;
            let value = read_scalar(&mut sub, kind)?;
            if kind == ScalarKind::Enum && !instr.accepts_enum(value as u32 as i32) {
                // Store the value as an unpacked field, which is how it would
                // have been encoded if it were unknown to the writer.
                let mut field = Vec::with_capacity(16);
                encode_varint(make_tag(instr.number, WireType::Varint) as u64, &mut field);
                field.extend_from_slice(&self.input[elem_start..sub.position()]);
                self.append_unknown(compiled, record, &field);
                continue;
            }
            let elem = self.list_push(slot, width, instr.capacity_hint);
            self.write_scalar(elem, kind, value);
        }
        Ok(())
    }

    fn enter(&mut self, offset: usize) -> Result<(), DecodeError> {
        if self.depth + 1 > self.recursion_limit {
            return Err(DecodeError::new(DecodeErrorKind::RecursionLimit).at(offset));
        }
        self.depth += 1;
        Ok(())
    }

    fn spend_work(&mut self, units: u64, offset: usize) -> Result<(), DecodeError> {
        self.work += units;
        if self.max_work.is_some_and(|max| self.work > max) {
            return Err(DecodeError::new(DecodeErrorKind::WorkLimit).at(offset));
        }
        Ok(())
    }

    fn alloc_record(&mut self, ty: u32) -> Addr {
        let size = self.lib.types[ty as usize].layout.size as usize;
        let record = self.arena.alloc(size, 8);
        if self.profile.is_some() {
            self.profiled.push((ty, record));
        }
        record
    }

    /// Mark the field of `instr` as present.
    ///
    /// For a oneof member, this clears the storage of the previously set
    /// member.
    fn set_present(&mut self, compiled: &CompiledType, record: Addr, instr: &Instr) {
        match instr.presence {
            Presence::Bit(bit) => {
                let word = record.add((bit / 32) as usize * 4);
                let bits = self.arena.read_u32(word);
                self.arena.write_u32(word, bits | (1 << (bit % 32)));
            }
            Presence::Oneof { slot, ordinal } => {
                let oneof = &compiled.layout.oneofs[slot as usize];
                let discriminant = record.add(oneof.offset as usize);
                let current = self.arena.read_u32(discriminant);
                if current != ordinal + 1 {
                    if current != 0 {
                        self.arena.zero(
                            record.add(oneof.union_offset as usize),
                            oneof.union_size as usize,
                        );
                    }
                    self.arena.write_u32(discriminant, ordinal + 1);
                }
            }
            Presence::Implicit | Presence::Pointer | Presence::Repeated => {}
        }
    }

    /// Return the record of a singular message field, allocating it if the
    /// field is not yet set. Repeated occurrences of the field merge into the
    /// same record.
    fn child_record(&mut self, compiled: &CompiledType, record: Addr, instr: &Instr) -> Addr {
        self.set_present(compiled, record, instr);
        let slot = record.add(instr.offset as usize);
        let existing = self.arena.read_addr(slot);
        if !existing.is_null() {
            return existing;
        }
        let child = self.alloc_record(instr_child(instr));
        self.arena.write_addr(slot, child);
        child
    }

    fn read_bytes(
        &mut self,
        cur: &mut ReadCursor<'a>,
        instr: &Instr,
    ) -> Result<(Addr, usize), DecodeError> {
        let range = cur.read_len_range()?;
        let input = self.input;
        let bytes = &input[range.clone()];
        if instr.validate_utf8 && std::str::from_utf8(bytes).is_err() {
            return Err(DecodeError::new(DecodeErrorKind::InvalidUtf8).at(range.start));
        }
        let addr = if self.alias {
            Addr::aliased(range.start)
        } else {
            self.arena.alloc_bytes(bytes)
        };
        Ok((addr, bytes.len()))
    }

    fn write_scalar(&mut self, addr: Addr, kind: ScalarKind, value: u64) {
        match kind.width() {
            1 => self.arena.write_u8(addr, value as u8),
            4 => self.arena.write_u32(addr, value as u32),
            _ => self.arena.write_u64(addr, value),
        }
    }

    /// Append an element to the list whose header is at `header` and return
    /// the address of the new element.
    fn list_push(&mut self, header: Addr, elem_size: usize, hint: u32) -> Addr {
        let mut data = self.arena.read_addr(header);
        let len = self.arena.read_u32(header.add(8)) as usize;
        let cap = self.arena.read_u32(header.add(12)) as usize;
        if len == cap {
            data = self.grow_list(header, elem_size, len + 1, hint);
        }
        self.arena.write_u32(header.add(8), len as u32 + 1);
        data.add(len * elem_size)
    }

    /// Ensure the list at `header` has room for `additional` more elements.
    fn list_reserve(&mut self, header: Addr, elem_size: usize, additional: usize, hint: u32) {
        let len = self.arena.read_u32(header.add(8)) as usize;
        let cap = self.arena.read_u32(header.add(12)) as usize;
        if len + additional > cap {
            self.grow_list(header, elem_size, len + additional, hint);
        }
    }

    fn grow_list(&mut self, header: Addr, elem_size: usize, min_cap: usize, hint: u32) -> Addr {
        let data = self.arena.read_addr(header);
        let cap = self.arena.read_u32(header.add(12)) as usize;
        let new_cap = if cap == 0 {
            (hint as usize).max(MIN_LIST_CAPACITY)
        } else {
            cap * 2
        }
        .max(min_cap);
        let align = elem_size.min(8);
        let new_data = if data.is_null() {
            self.arena.alloc(new_cap * elem_size, align)
        } else {
            self.arena
                .grow(data, cap * elem_size, new_cap * elem_size, align)
        };
        self.arena.write_addr(header, new_data);
        self.arena.write_u32(header.add(12), new_cap as u32);
        new_data
    }

    /// Insert a decoded entry into the map whose header address is stored at
    /// `slot`. An existing entry with the same key is replaced in place.
    fn map_insert(&mut self, slot: Addr, entry_ty: u32, entry: Addr, hint: u32) {
        let lib = self.lib;
        let entry_type = &lib.types[entry_ty as usize];

        let mut header = self.arena.read_addr(slot);
        if header.is_null() {
            header = self.arena.alloc(MAP_HEADER_SIZE, 8);
            self.arena.write_addr(slot, header);
        }

        let key = entry_key(self.arena, self.input, entry_type, entry);
        let hash = hash_key(key);
        if let Some(index) = map_lookup(self.arena, self.input, entry_type, header, key) {
            let entries = self.arena.read_addr(header);
            self.arena.write_addr(entries.add(index * 8), entry);
            return;
        }

        let len = self.arena.read_u32(header.add(8)) as usize;
        let slot_count = self.arena.read_u32(header.add(24)) as usize;
        if (len + 1) * 4 > slot_count * 3 {
            self.rehash_map(header, entry_type, len + 1, hint);
        }
        let elem = self.list_push(header, 8, hint);
        self.arena.write_addr(elem, entry);
        self.insert_map_slot(header, hash, len);
    }

    fn insert_map_slot(&mut self, header: Addr, hash: u64, index: usize) {
        let slots = self.arena.read_addr(header.add(16));
        let mask = self.arena.read_u32(header.add(24)) as usize - 1;
        let mut pos = hash as usize & mask;
        while self.arena.read_u32(slots.add(pos * 4)) != 0 {
            pos = (pos + 1) & mask;
        }
        self.arena.write_u32(slots.add(pos * 4), index as u32 + 1);
    }

    /// Replace the hash slots of a map with a larger table that can hold
    /// `needed` entries.
    fn rehash_map(&mut self, header: Addr, entry_type: &CompiledType, needed: usize, hint: u32) {
        let old_count = self.arena.read_u32(header.add(24)) as usize;
        let mut slot_count = if old_count == 0 {
            (2 * hint as usize).next_power_of_two().max(MIN_MAP_SLOTS)
        } else {
            old_count * 2
        };
        while needed * 4 > slot_count * 3 {
            slot_count *= 2;
        }
        let slots = self.arena.alloc(slot_count * 4, 4);
        self.arena.write_addr(header.add(16), slots);
        self.arena.write_u32(header.add(24), slot_count as u32);

        let entries = self.arena.read_addr(header);
        let len = self.arena.read_u32(header.add(8)) as usize;
        for index in 0..len {
            let entry = self.arena.read_addr(entries.add(index * 8));
            let hash = hash_key(entry_key(self.arena, self.input, entry_type, entry));
            self.insert_map_slot(header, hash, index);
        }
    }

    /// Append `bytes` to the unknown-fields buffer of `record`.
    fn append_unknown(&mut self, compiled: &CompiledType, record: Addr, bytes: &[u8]) {
        let header = record.add(compiled.layout.unknown_offset as usize);
        let mut data = self.arena.read_addr(header);
        let len = self.arena.read_u32(header.add(8)) as usize;
        let cap = self.arena.read_u32(header.add(12)) as usize;
        let needed = len + bytes.len();
        if needed > cap {
            let new_cap = needed.max(cap * 2).max(MIN_UNKNOWN_CAPACITY);
            data = if data.is_null() {
                self.arena.alloc(new_cap, 1)
            } else {
                self.arena.grow(data, cap, new_cap, 1)
            };
            self.arena.write_addr(header, data);
            self.arena.write_u32(header.add(12), new_cap as u32);
        }
        self.arena
            .bytes_mut(data.add(len), bytes.len())
            .copy_from_slice(bytes);
        self.arena.write_u32(header.add(8), needed as u32);
    }

    /// Record the lengths of non-empty list and map fields of a decoded
    /// record.
    fn record_lengths(&self, profile: &Profile, ty: u32, compiled: &CompiledType, record: Addr) {
        profile.record_message(ty);
        for (i, field) in compiled.layout.fields.iter().enumerate() {
            let slot = record.add(field.offset as usize);
            let len = match field.storage {
                Storage::List { .. } => self.arena.read_u32(slot.add(8)),
                Storage::Map => {
                    let header = self.arena.read_addr(slot);
                    if header.is_null() {
                        0
                    } else {
                        self.arena.read_u32(header.add(8))
                    }
                }
                _ => continue,
            };
            if len > 0 {
                profile.record_length(ty, i as u32, len);
            }
        }
    }
}

/// Return the library index of the child type of a message, group or map
/// instruction.
fn instr_child(instr: &Instr) -> u32 {
    instr.child.expect("message instruction has a child type")
}

/// Read a scalar value and convert it to its stored representation.
#[inline]
fn read_scalar(cur: &mut ReadCursor, kind: ScalarKind) -> Result<u64, WireError> {
    let value = match kind {
        ScalarKind::Bool => (cur.read_varint()? != 0) as u64,
        ScalarKind::Int32 | ScalarKind::Uint32 | ScalarKind::Enum => {
            cur.read_varint()? as u32 as u64
        }
        ScalarKind::Int64 | ScalarKind::Uint64 => cur.read_varint()?,
        ScalarKind::Sint32 => zigzag_decode32(cur.read_varint()? as u32) as u32 as u64,
        ScalarKind::Sint64 => zigzag_decode64(cur.read_varint()?) as u64,
        ScalarKind::Fixed32 | ScalarKind::Sfixed32 | ScalarKind::Float => {
            cur.read_fixed32()? as u64
        }
        ScalarKind::Fixed64 | ScalarKind::Sfixed64 | ScalarKind::Double => cur.read_fixed64()?,
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use tdpb_testing::{SchemaBuilder, TestCases, Wire};
    use tdpb_wire::WireType;
    use tdpb_wire::descriptor::FieldType;

    use crate::errors::DecodeErrorKind;
    use crate::{CompileOptions, MessageType, Shared, UnmarshalOptions, Value, compile_file_set};

    fn compile(builder: SchemaBuilder, name: &str) -> MessageType {
        compile_file_set(&builder.build(), name, &CompileOptions::default()).unwrap()
    }

    fn scalars() -> MessageType {
        compile(
            SchemaBuilder::proto2("t.proto").message("M", |m| {
                m.field("i32", 1, FieldType::INT32)
                    .field("i64", 2, FieldType::INT64)
                    .field("u32", 3, FieldType::UINT32)
                    .field("u64", 4, FieldType::UINT64)
                    .field("s32", 5, FieldType::SINT32)
                    .field("s64", 6, FieldType::SINT64)
                    .field("f32", 7, FieldType::FIXED32)
                    .field("f64", 8, FieldType::FIXED64)
                    .field("sf32", 9, FieldType::SFIXED32)
                    .field("sf64", 10, FieldType::SFIXED64)
                    .field("flt", 11, FieldType::FLOAT)
                    .field("dbl", 12, FieldType::DOUBLE)
                    .field("b", 13, FieldType::BOOL)
            }),
            "M",
        )
    }

    #[test]
    fn test_decode_scalars() {
        #[derive(Debug)]
        struct Case {
            input: Vec<u8>,
            field: &'static str,
            expected: Value<'static>,
        }

        let cases = [
            Case {
                input: Wire::new().int(1, -5).finish(),
                field: "i32",
                expected: Value::I32(-5),
            },
            Case {
                input: Wire::new().int(2, -1 << 40).finish(),
                field: "i64",
                expected: Value::I64(-1 << 40),
            },
            Case {
                input: Wire::new().varint(3, u32::MAX as u64).finish(),
                field: "u32",
                expected: Value::U32(u32::MAX),
            },
            Case {
                input: Wire::new().varint(4, u64::MAX).finish(),
                field: "u64",
                expected: Value::U64(u64::MAX),
            },
            Case {
                input: Wire::new().sint32(5, -3).finish(),
                field: "s32",
                expected: Value::I32(-3),
            },
            Case {
                input: Wire::new().sint64(6, i64::MIN).finish(),
                field: "s64",
                expected: Value::I64(i64::MIN),
            },
            Case {
                input: Wire::new().fixed32(7, 7).finish(),
                field: "f32",
                expected: Value::U32(7),
            },
            Case {
                input: Wire::new().fixed64(8, 8).finish(),
                field: "f64",
                expected: Value::U64(8),
            },
            Case {
                input: Wire::new().fixed32(9, -9i32 as u32).finish(),
                field: "sf32",
                expected: Value::I32(-9),
            },
            Case {
                input: Wire::new().fixed64(10, -10i64 as u64).finish(),
                field: "sf64",
                expected: Value::I64(-10),
            },
            Case {
                input: Wire::new().float(11, 1.5).finish(),
                field: "flt",
                expected: Value::F32(1.5),
            },
            Case {
                input: Wire::new().double(12, -2.25).finish(),
                field: "dbl",
                expected: Value::F64(-2.25),
            },
            Case {
                input: Wire::new().varint(13, 300).finish(),
                field: "b",
                expected: Value::Bool(true),
            },
        ];

        let ty = scalars();
        cases.test_each(|case| {
            let mut shared = Shared::new();
            let msg = shared
                .unmarshal(&ty, &case.input, &UnmarshalOptions::default())
                .unwrap();
            let value = msg.get_by_name(case.field).unwrap();
            assert_eq!(value, case.expected);
            assert!(msg.has(msg.descriptor().get_field_by_name(case.field).as_ref().unwrap()));
        })
    }

    #[test]
    fn test_decode_errors() {
        #[derive(Debug)]
        struct Case {
            input: Vec<u8>,
            kind: DecodeErrorKind,
        }

        let cases = [
            // Truncated varint.
            Case {
                input: vec![0x08, 0x80],
                kind: DecodeErrorKind::TruncatedInput,
            },
            // Varint longer than 10 bytes.
            Case {
                input: [0x08].into_iter().chain([0xFF; 11]).collect(),
                kind: DecodeErrorKind::MalformedVarint,
            },
            // Length exceeds the remaining input.
            Case {
                input: vec![0x1A, 0x05, 0x01],
                kind: DecodeErrorKind::Overflow,
            },
            // Wire type 7.
            Case {
                input: vec![0x0F],
                kind: DecodeErrorKind::InvalidWireType,
            },
            // Field number zero.
            Case {
                input: vec![0x00, 0x01],
                kind: DecodeErrorKind::MalformedTag,
            },
            // End-group tag outside a group.
            Case {
                input: vec![0x0C],
                kind: DecodeErrorKind::MalformedGroup,
            },
            // Unknown group that is never closed.
            Case {
                input: Wire::new().tag(9, WireType::SGroup).varint(1, 1).finish(),
                kind: DecodeErrorKind::TruncatedInput,
            },
            // Truncated fixed32.
            Case {
                input: vec![0x0D, 0x01, 0x02],
                kind: DecodeErrorKind::TruncatedInput,
            },
        ];

        let ty = compile(
            SchemaBuilder::proto3("t.proto").message("M", |m| {
                m.field("x", 1, FieldType::INT32)
                    .field("s", 3, FieldType::STRING)
            }),
            "M",
        );
        cases.test_each(|case| {
            let mut shared = Shared::new();
            let err = shared
                .unmarshal(&ty, &case.input, &UnmarshalOptions::default())
                .err()
                .unwrap();
            assert_eq!(err.kind(), case.kind);
            assert_eq!(err.message_name(), Some("M"));
        })
    }

    #[test]
    fn test_wire_type_mismatch_is_unknown() {
        let ty = compile(
            SchemaBuilder::proto3("t.proto").message("M", |m| m.field("x", 1, FieldType::INT32)),
            "M",
        );
        let input = Wire::new().fixed32(1, 5).varint(1, 3).finish();
        let mut shared = Shared::new();
        let msg = shared
            .unmarshal(&ty, &input, &UnmarshalOptions::default())
            .unwrap();
        assert_eq!(msg.get_by_name("x"), Some(Value::I32(3)));
        assert_eq!(msg.unknown_fields(), &input[..5]);
    }

    #[test]
    fn test_invalid_utf8() {
        let input = Wire::new().bytes(1, &[0xFF, 0xFE]).finish();

        let proto3 = compile(
            SchemaBuilder::proto3("t.proto").message("M", |m| m.field("s", 1, FieldType::STRING)),
            "M",
        );
        let mut shared = Shared::new();
        let err = shared
            .unmarshal(&proto3, &input, &UnmarshalOptions::default())
            .err()
            .unwrap();
        assert_eq!(err.kind(), DecodeErrorKind::InvalidUtf8);
        assert_eq!(err.field(), Some(1));
        assert_eq!(err.offset(), Some(2));

        // proto2 strings are not validated. Invalid values read as bytes.
        let proto2 = compile(
            SchemaBuilder::proto2("t.proto").message("M", |m| m.field("s", 1, FieldType::STRING)),
            "M",
        );
        let mut shared = Shared::new();
        let msg = shared
            .unmarshal(&proto2, &input, &UnmarshalOptions::default())
            .unwrap();
        assert_eq!(msg.get_by_name("s"), Some(Value::Bytes(&[0xFF, 0xFE])));
    }

    #[test]
    fn test_recursion_limit() {
        let ty = compile(
            SchemaBuilder::proto3("t.proto").message("Node", |m| {
                m.message_field("child", 1, "Node")
                    .field("depth", 2, FieldType::INT32)
            }),
            "Node",
        );

        fn nested(depth: usize) -> Vec<u8> {
            let wire = if depth > 0 {
                Wire::new().bytes(1, &nested(depth - 1))
            } else {
                Wire::new()
            };
            wire.varint(2, depth as u64).finish()
        }

        let input = nested(10);
        let mut shared = Shared::new();
        assert!(
            shared
                .unmarshal(&ty, &input, &UnmarshalOptions::new().recursion_limit(10))
                .is_ok()
        );

        let mut shared = Shared::new();
        let err = shared
            .unmarshal(&ty, &input, &UnmarshalOptions::new().recursion_limit(9))
            .err()
            .unwrap();
        assert_eq!(err.kind(), DecodeErrorKind::RecursionLimit);
    }

    #[test]
    fn test_unknown_group_depth() {
        let ty = compile(
            SchemaBuilder::proto3("t.proto").message("M", |m| m.field("x", 1, FieldType::INT32)),
            "M",
        );
        let mut wire = Wire::new();
        for _ in 0..5 {
            wire = wire.tag(2, WireType::SGroup);
        }
        for _ in 0..5 {
            wire = wire.tag(2, WireType::EGroup);
        }
        let input = wire.finish();

        let mut shared = Shared::new();
        let msg = shared
            .unmarshal(&ty, &input, &UnmarshalOptions::new().recursion_limit(5))
            .unwrap();
        assert_eq!(msg.unknown_fields(), &input[..]);

        let mut shared = Shared::new();
        let err = shared
            .unmarshal(&ty, &input, &UnmarshalOptions::new().recursion_limit(4))
            .err()
            .unwrap();
        assert_eq!(err.kind(), DecodeErrorKind::RecursionLimit);
    }

    #[test]
    fn test_budgets() {
        let ty = compile(
            SchemaBuilder::proto3("t.proto").message("M", |m| m.repeated("xs", 1, FieldType::INT32)),
            "M",
        );

        let unknown = Wire::new().varint(2, 1).varint(3, 1).varint(4, 1).finish();
        let mut shared = Shared::new();
        assert!(
            shared
                .unmarshal(&ty, &unknown, &UnmarshalOptions::new().max_decode_misses(3))
                .is_ok()
        );
        let mut shared = Shared::new();
        let err = shared
            .unmarshal(&ty, &unknown, &UnmarshalOptions::new().max_decode_misses(2))
            .err()
            .unwrap();
        assert_eq!(err.kind(), DecodeErrorKind::DecodeMissBudgetExceeded);
        assert_eq!(err.field(), Some(4));

        // One unit for the field and one per packed element.
        let packed = Wire::new().packed_varints(1, &[1, 2, 3, 4]).finish();
        let mut shared = Shared::new();
        assert!(
            shared
                .unmarshal(&ty, &packed, &UnmarshalOptions::new().max_work(5))
                .is_ok()
        );
        let mut shared = Shared::new();
        let err = shared
            .unmarshal(&ty, &packed, &UnmarshalOptions::new().max_work(4))
            .err()
            .unwrap();
        assert_eq!(err.kind(), DecodeErrorKind::WorkLimit);
    }

    #[test]
    fn test_unknown_group_work() {
        let ty = compile(
            SchemaBuilder::proto3("t.proto").message("M", |m| m.field("x", 1, FieldType::INT32)),
            "M",
        );
        let mut wire = Wire::new().tag(9, WireType::SGroup);
        for i in 0..1000 {
            wire = wire.varint(1, i);
        }
        let input = wire.tag(9, WireType::EGroup).finish();

        // The group tag and each field inside it cost one unit.
        let mut shared = Shared::new();
        assert!(
            shared
                .unmarshal(&ty, &input, &UnmarshalOptions::new().max_work(1001))
                .is_ok()
        );
        let mut shared = Shared::new();
        let err = shared
            .unmarshal(&ty, &input, &UnmarshalOptions::new().max_work(100))
            .err()
            .unwrap();
        assert_eq!(err.kind(), DecodeErrorKind::WorkLimit);

        // The whole group is one unknown field for the miss budget.
        let mut shared = Shared::new();
        assert!(
            shared
                .unmarshal(&ty, &input, &UnmarshalOptions::new().max_decode_misses(1))
                .is_ok()
        );
    }

    #[test]
    fn test_unterminated_groups() {
        #[derive(Debug)]
        struct Case {
            input: Vec<u8>,
            expected: DecodeErrorKind,
        }

        let open_unknown = Wire::new().tag(5, WireType::SGroup).varint(1, 1).finish();
        let open_known = Wire::new().tag(3, WireType::SGroup).varint(2, 1).finish();

        let cases = [
            // The input ends inside the group.
            Case {
                input: open_unknown.clone(),
                expected: DecodeErrorKind::TruncatedInput,
            },
            // A sub-message's payload ends inside the group, even though the
            // payload runs to the end of the input.
            Case {
                input: Wire::new().bytes(1, &open_unknown).finish(),
                expected: DecodeErrorKind::MalformedGroup,
            },
            Case {
                input: Wire::new().bytes(1, &open_known).finish(),
                expected: DecodeErrorKind::MalformedGroup,
            },
            Case {
                input: Wire::new().bytes(1, &open_known).varint(2, 1).finish(),
                expected: DecodeErrorKind::MalformedGroup,
            },
        ];

        let ty = compile(
            SchemaBuilder::proto2("t.proto")
                .message("M", |m| {
                    m.message_field("inner", 1, "Inner")
                        .field("x", 2, FieldType::INT32)
                })
                .message("Inner", |m| {
                    m.nested("G", |g| g.field("a", 2, FieldType::INT32))
                        .group_field("g", 3, "G")
                }),
            "M",
        );

        cases.test_each(|case| {
            let mut shared = Shared::new();
            let err = shared
                .unmarshal(&ty, &case.input, &UnmarshalOptions::default())
                .err()
                .unwrap();
            assert_eq!(err.kind(), case.expected);
        })
    }

    #[test]
    fn test_repeated_encodings() {
        let ty = compile(
            SchemaBuilder::proto2("t.proto").message("M", |m| {
                m.repeated("xs", 1, FieldType::SINT32)
                    .repeated("fs", 2, FieldType::FIXED64)
                    .repeated("bs", 3, FieldType::BOOL)
            }),
            "M",
        );
        let input = Wire::new()
            .sint32(1, -1)
            .packed_varints(1, &[2, 3])
            .sint32(1, 4)
            .packed_fixed64(2, &[10, 20, 30, 40, 50])
            .fixed64(2, 60)
            .packed_varints(3, &[1, 0, 1])
            .finish();
        let mut shared = Shared::new();
        let msg = shared
            .unmarshal(&ty, &input, &UnmarshalOptions::default())
            .unwrap();

        let xs: Vec<_> = msg.get_by_name("xs").unwrap().as_list().unwrap().iter().collect();
        assert_eq!(
            xs,
            [Value::I32(-1), Value::I32(1), Value::I32(-2), Value::I32(4)]
        );
        let fs = msg.get_by_name("fs").unwrap().as_list().unwrap();
        assert_eq!(fs.len(), 6);
        assert_eq!(fs.get(5), Some(Value::U64(60)));
        let bs: Vec<_> = msg.get_by_name("bs").unwrap().as_list().unwrap().iter().collect();
        assert_eq!(bs, [Value::Bool(true), Value::Bool(false), Value::Bool(true)]);
    }

    #[test]
    fn test_packed_fixed_length_mismatch() {
        let ty = compile(
            SchemaBuilder::proto3("t.proto").message("M", |m| m.repeated("xs", 1, FieldType::FIXED32)),
            "M",
        );
        let input = Wire::new().bytes(1, &[1, 2, 3, 4, 5]).finish();
        let mut shared = Shared::new();
        let err = shared
            .unmarshal(&ty, &input, &UnmarshalOptions::default())
            .err()
            .unwrap();
        assert_eq!(err.kind(), DecodeErrorKind::TruncatedInput);
    }

    #[test]
    fn test_closed_enum_unknown_values() {
        let ty = compile(
            SchemaBuilder::proto2("t.proto")
                .enumeration("Color", &[("RED", 1), ("GREEN", 2)])
                .message("M", |m| {
                    m.enum_field("c", 1, "Color")
                        .repeated_enum("cs", 2, "Color")
                }),
            "M",
        );
        let input = Wire::new()
            .varint(1, 7)
            .packed_varints(2, &[1, 9, 2])
            .finish();
        let mut shared = Shared::new();
        let msg = shared
            .unmarshal(&ty, &input, &UnmarshalOptions::default())
            .unwrap();

        let c = msg.descriptor().get_field_by_name("c").unwrap();
        assert!(!msg.has(&c));
        assert_eq!(msg.get(&c), Value::Enum(1));
        let cs: Vec<_> = msg.get_by_name("cs").unwrap().as_list().unwrap().iter().collect();
        assert_eq!(cs, [Value::Enum(1), Value::Enum(2)]);
        assert_eq!(
            msg.unknown_fields(),
            Wire::new().varint(1, 7).varint(2, 9).finish()
        );
    }

    #[test]
    fn test_closed_enum_map_values() {
        let ty = compile(
            SchemaBuilder::proto2("t.proto")
                .enumeration("Color", &[("RED", 1), ("GREEN", 2)])
                .message("M", |m| {
                    m.map_of("m", 1, FieldType::INT32, FieldType::ENUM, "Color")
                }),
            "M",
        );
        let unknown_entry = Wire::new().message(1, |e| e.varint(1, 5).varint(2, 9)).finish();
        let input = Wire::new()
            .message(1, |e| e.varint(1, 4).varint(2, 2))
            .raw(&unknown_entry)
            .finish();
        let mut shared = Shared::new();
        let msg = shared
            .unmarshal(&ty, &input, &UnmarshalOptions::default())
            .unwrap();

        let m = msg.get_by_name("m").unwrap().as_map().unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m.get(&4i32.into()), Some(Value::Enum(2)));
        assert_eq!(m.get(&5i32.into()), None);
        assert_eq!(msg.unknown_fields(), unknown_entry);
    }

    #[test]
    fn test_oneof_switch() {
        let ty = compile(
            SchemaBuilder::proto3("t.proto")
                .message("Inner", |m| {
                    m.field("a", 1, FieldType::INT32)
                        .field("b", 2, FieldType::INT32)
                })
                .message("M", |m| {
                    m.oneof("choice", |o| {
                        o.field("num", 1, FieldType::INT64)
                            .field("text", 2, FieldType::STRING)
                            .message_field("inner", 3, "Inner")
                    })
                }),
            "M",
        );
        let desc = ty.descriptor().clone();
        let choice = desc.oneofs().next().unwrap();
        let num = desc.get_field_by_name("num").unwrap();
        let text = desc.get_field_by_name("text").unwrap();
        let inner = desc.get_field_by_name("inner").unwrap();

        let input = Wire::new()
            .string(2, "hello")
            .varint(1, 9)
            .finish();
        let mut shared = Shared::new();
        let msg = shared
            .unmarshal(&ty, &input, &UnmarshalOptions::default())
            .unwrap();
        assert_eq!(msg.which_oneof(&choice), Some(&num));
        assert!(!msg.has(&text));
        assert_eq!(msg.get(&text), Value::String(""));
        assert_eq!(msg.get(&num), Value::I64(9));

        // Occurrences of the same message member merge.
        let input = Wire::new()
            .message(3, |m| m.varint(1, 1))
            .message(3, |m| m.varint(2, 2))
            .finish();
        let mut shared = Shared::new();
        let msg = shared
            .unmarshal(&ty, &input, &UnmarshalOptions::default())
            .unwrap();
        assert_eq!(msg.which_oneof(&choice), Some(&inner));
        let inner_msg = msg.get(&inner).as_message().unwrap();
        assert_eq!(inner_msg.get_by_name("a"), Some(Value::I32(1)));
        assert_eq!(inner_msg.get_by_name("b"), Some(Value::I32(2)));
    }

    #[test]
    fn test_groups() {
        let ty = compile(
            SchemaBuilder::proto2("t.proto")
                .message("M", |m| {
                    m.nested("G", |g| g.field("a", 2, FieldType::INT32))
                        .group_field("g", 1, "G")
                        .repeated("gs", 3, FieldType::GROUP)
                        .with_last(|f| f.type_name = Some("G".to_string()))
                }),
            "M",
        );
        let input = Wire::new()
            .group(1, |g| g.varint(2, 5))
            .group(3, |g| g.varint(2, 6))
            .group(3, |g| g.varint(2, 7))
            .finish();
        let mut shared = Shared::new();
        let msg = shared
            .unmarshal(&ty, &input, &UnmarshalOptions::default())
            .unwrap();
        let g = msg.get_by_name("g").unwrap().as_message().unwrap();
        assert_eq!(g.get_by_name("a"), Some(Value::I32(5)));
        let gs = msg.get_by_name("gs").unwrap().as_list().unwrap();
        assert_eq!(gs.len(), 2);
        let second = gs.get(1).unwrap().as_message().unwrap();
        assert_eq!(second.get_by_name("a"), Some(Value::I32(7)));

        // Mismatched end-group number.
        let input = Wire::new()
            .tag(1, WireType::SGroup)
            .tag(2, WireType::EGroup)
            .finish();
        let mut shared = Shared::new();
        let err = shared
            .unmarshal(&ty, &input, &UnmarshalOptions::default())
            .err()
            .unwrap();
        assert_eq!(err.kind(), DecodeErrorKind::MalformedGroup);
        assert_eq!(err.message_name(), Some("M.G"));
    }

    #[test]
    fn test_maps() {
        let ty = compile(
            SchemaBuilder::proto3("t.proto").message("M", |m| {
                m.map("counts", 1, FieldType::STRING, FieldType::INT32)
                    .map("flags", 2, FieldType::INT64, FieldType::BOOL)
            }),
            "M",
        );
        let mut wire = Wire::new();
        for i in 0..20 {
            wire = wire.message(1, |e| e.string(1, &format!("k{}", i)).varint(2, i));
        }
        // Replaces the value of an existing key.
        wire = wire.message(1, |e| e.string(1, "k3").varint(2, 100));
        // Entry with neither key nor value.
        wire = wire.message(2, |e| e);
        let input = wire.finish();

        let mut shared = Shared::new();
        let msg = shared
            .unmarshal(&ty, &input, &UnmarshalOptions::default())
            .unwrap();
        let counts = msg.get_by_name("counts").unwrap().as_map().unwrap();
        assert_eq!(counts.len(), 20);
        assert_eq!(counts.get(&"k3".into()), Some(Value::I32(100)));
        assert_eq!(counts.get(&"k19".into()), Some(Value::I32(19)));
        assert_eq!(counts.get(&"k20".into()), None);

        let keys: Vec<_> = counts.iter().map(|(k, _)| k).collect();
        assert_eq!(keys[3], "k3".into());

        let flags = msg.get_by_name("flags").unwrap().as_map().unwrap();
        assert_eq!(flags.get(&0i64.into()), Some(Value::Bool(false)));
    }

    #[test]
    fn test_alias() {
        let ty = compile(
            SchemaBuilder::proto3("t.proto").message("M", |m| {
                m.field("s", 1, FieldType::STRING)
                    .repeated("bs", 2, FieldType::BYTES)
            }),
            "M",
        );
        let input = Wire::new()
            .string(1, "abc")
            .bytes(2, b"xy")
            .finish();
        let mut shared = Shared::new();
        let before = shared.allocated_bytes();
        let msg = shared
            .unmarshal(&ty, &input, &UnmarshalOptions::new().allow_alias(true))
            .unwrap();
        assert_eq!(msg.get_by_name("s"), Some(Value::String("abc")));
        let bs = msg.get_by_name("bs").unwrap().as_list().unwrap();
        assert_eq!(bs.get(0), Some(Value::Bytes(b"xy")));
        let Some(Value::String(s)) = msg.get_by_name("s") else {
            panic!("expected string");
        };
        assert!(std::ptr::eq(s.as_ptr(), input[2..].as_ptr()));
        assert!(shared.allocated_bytes() > before);
    }
}
