//! Counters collected while decoding, used to tune recompiled types.
//!
//! A [`Profile`] is created with
//! [`MessageType::new_profile`](crate::MessageType::new_profile) and passed
//! to decodes with
//! [`UnmarshalOptions::record_profile`](crate::UnmarshalOptions::record_profile).
//! It counts, for every type in the compiled library:
//!
//! - The number of records decoded
//! - How often each instruction was executed
//! - For list and map fields, how many records contained the field and the
//!   total number of elements
//!
//! Counters are relaxed atomics. Concurrent decodes may record into the same
//! profile, but the counts are only approximate in that case.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashMap;

use crate::message_type::Library;
use crate::program::TypeHints;
use crate::schema::DescKey;

/// Largest initial capacity chosen for lists and maps.
pub const MAX_CAPACITY_HINT: u32 = 1024;

#[derive(Default)]
struct LengthCounters {
    occurrences: AtomicU64,
    elements: AtomicU64,
}

struct TypeCounters {
    records: AtomicU64,

    /// Hit count per instruction.
    hits: Vec<AtomicU64>,

    /// Length counters per field.
    lengths: Vec<LengthCounters>,
}

/// Decode counters for all types of a compiled library.
pub struct Profile {
    lib: Arc<Library>,
    types: Vec<TypeCounters>,
}

impl Profile {
    pub(crate) fn new(lib: Arc<Library>) -> Profile {
        let types = lib
            .types
            .iter()
            .map(|ty| TypeCounters {
                records: AtomicU64::new(0),
                hits: (0..ty.program.instrs().len())
                    .map(|_| AtomicU64::new(0))
                    .collect(),
                lengths: (0..ty.fields.len())
                    .map(|_| LengthCounters::default())
                    .collect(),
            })
            .collect();
        Profile { lib, types }
    }

    /// Return true if this profile records decodes of types from `lib`.
    pub(crate) fn is_for(&self, lib: &Arc<Library>) -> bool {
        Arc::ptr_eq(&self.lib, lib)
    }

    #[inline]
    pub(crate) fn record_hit(&self, ty: u32, counter: u32) {
        self.types[ty as usize].hits[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message(&self, ty: u32) {
        self.types[ty as usize]
            .records
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_length(&self, ty: u32, field: u32, len: u32) {
        let counters = &self.types[ty as usize].lengths[field as usize];
        counters.occurrences.fetch_add(1, Ordering::Relaxed);
        counters.elements.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Return the total number of records decoded while recording.
    pub fn total_records(&self) -> u64 {
        self.types
            .iter()
            .map(|ty| ty.records.load(Ordering::Relaxed))
            .sum()
    }

    /// Return a snapshot of the counters with derived statistics.
    pub fn stats(&self) -> ProfileStats {
        let types = self
            .lib
            .types
            .iter()
            .zip(&self.types)
            .map(|(ty, counters)| {
                let records = counters.records.load(Ordering::Relaxed);

                let mut hits = vec![0; ty.fields.len()];
                for (instr, count) in ty.program.instrs().iter().zip(&counters.hits) {
                    hits[instr.field as usize] += count.load(Ordering::Relaxed);
                }

                let fields = ty
                    .fields
                    .iter()
                    .enumerate()
                    .map(|(i, field)| {
                        let lengths = &counters.lengths[i];
                        let occurrences = lengths.occurrences.load(Ordering::Relaxed);
                        let elements = lengths.elements.load(Ordering::Relaxed);
                        FieldStats {
                            name: field.name().to_string(),
                            number: field.number(),
                            hits: hits[i],
                            hit_rate: if records > 0 {
                                hits[i] as f64 / records as f64
                            } else {
                                0.
                            },
                            mean_len: (occurrences > 0)
                                .then(|| elements as f64 / occurrences as f64),
                        }
                    })
                    .collect();

                TypeStats {
                    name: ty.descriptor.full_name().to_string(),
                    records,
                    fields,
                }
            })
            .collect();
        ProfileStats { types }
    }

    /// Derive compile hints for each profiled type.
    pub(crate) fn hints(&self) -> FxHashMap<DescKey, TypeHints> {
        let stats = self.stats();
        self.lib
            .types
            .iter()
            .zip(stats.types)
            .filter(|(_, stats)| stats.records > 0)
            .map(|(ty, stats)| {
                let mut hints = TypeHints::default();
                for field in &stats.fields {
                    if let Some(mean) = field.mean_len {
                        hints.capacity.insert(field.number, capacity_for_mean(mean));
                    }
                }
                let mut hot: Vec<&FieldStats> =
                    stats.fields.iter().filter(|f| f.hits > 0).collect();
                hot.sort_by(|a, b| b.hits.cmp(&a.hits).then(a.number.cmp(&b.number)));
                hints.hot = hot.into_iter().map(|f| f.number).collect();
                (ty.descriptor.key(), hints)
            })
            .collect()
    }
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profile")
            .field("library", &self.lib.id)
            .field("records", &self.total_records())
            .finish()
    }
}

/// Round a mean observed length up to a power of two, clamped to
/// [`MAX_CAPACITY_HINT`].
fn capacity_for_mean(mean: f64) -> u32 {
    let len = mean.ceil().clamp(1., MAX_CAPACITY_HINT as f64) as u32;
    len.next_power_of_two().min(MAX_CAPACITY_HINT)
}

/// Snapshot of a [`Profile`].
#[derive(Clone, Debug, PartialEq)]
pub struct ProfileStats {
    pub types: Vec<TypeStats>,
}

impl ProfileStats {
    /// Return the statistics for the type with the given full name.
    pub fn get(&self, name: &str) -> Option<&TypeStats> {
        self.types.iter().find(|ty| ty.name == name)
    }
}

impl fmt::Display for ProfileStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for ty in self.types.iter().filter(|ty| ty.records > 0) {
            writeln!(f, "{} ({} records)", ty.name, ty.records)?;
            for field in ty.fields.iter().filter(|field| field.hits > 0) {
                write!(
                    f,
                    "  {:>5} {:<24} hits {:<8} rate {:.2}",
                    field.number, field.name, field.hits, field.hit_rate
                )?;
                if let Some(mean) = field.mean_len {
                    write!(f, " mean len {:.1}", mean)?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

/// Statistics for one message type.
#[derive(Clone, Debug, PartialEq)]
pub struct TypeStats {
    /// Fully qualified name of the message type.
    pub name: String,
    pub records: u64,
    pub fields: Vec<FieldStats>,
}

impl TypeStats {
    pub fn field(&self, name: &str) -> Option<&FieldStats> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Statistics for one field.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldStats {
    pub name: String,
    pub number: u32,

    /// Number of times a value of the field was decoded. Each element of a
    /// packed list counts once per packed run.
    pub hits: u64,

    /// Mean number of hits per decoded record.
    pub hit_rate: f64,

    /// Mean length of the list or map in records where it was non-empty.
    pub mean_len: Option<f64>,
}

#[cfg(test)]
mod tests {
    use tdpb_testing::{SchemaBuilder, TestCases, Wire};
    use tdpb_wire::descriptor::FieldType;

    use super::capacity_for_mean;
    use crate::program::Dispatch;
    use crate::{CompileOptions, MessageType, Shared, UnmarshalOptions, compile_file_set};

    fn compile(builder: SchemaBuilder) -> MessageType {
        compile_file_set(&builder.build(), "M", &CompileOptions::default()).unwrap()
    }

    fn decode_all(ty: &MessageType, inputs: &[Vec<u8>], opts: &UnmarshalOptions) {
        for input in inputs {
            let mut shared = Shared::new();
            shared.unmarshal(ty, input, opts).unwrap();
        }
    }

    #[test]
    fn test_stats_and_capacity_hints() {
        let ty = compile(
            SchemaBuilder::proto3("t.proto")
                .message("M", |m| {
                    m.message_field("i", 1, "Inner")
                        .repeated("xs", 2, FieldType::INT32)
                })
                .message("Inner", |m| m.repeated("c", 1, FieldType::INT32)),
        );
        let inputs = [
            // Two occurrences of `i` which merge into one record.
            Wire::new()
                .message(1, |w| w.packed_varints(1, &[1, 2]))
                .message(1, |w| w.packed_varints(1, &[3, 4]))
                .packed_varints(2, &[1, 2, 3])
                .finish(),
            Wire::new().packed_varints(2, &[5]).finish(),
        ];

        let profile = ty.new_profile();
        decode_all(&ty, &inputs, &UnmarshalOptions::new().record_profile(&profile, 1.0));

        let stats = profile.stats();
        let m = stats.get("M").unwrap();
        assert_eq!(m.records, 2);
        let i = m.field("i").unwrap();
        assert_eq!((i.hits, i.hit_rate, i.mean_len), (2, 1.0, None));
        let xs = m.field("xs").unwrap();
        assert_eq!((xs.hits, xs.hit_rate, xs.mean_len), (2, 1.0, Some(2.0)));

        let inner = stats.get("Inner").unwrap();
        assert_eq!(inner.records, 1);
        let c = inner.field("c").unwrap();
        assert_eq!((c.hits, c.hit_rate, c.mean_len), (2, 2.0, Some(4.0)));
        assert_eq!(profile.total_records(), 3);

        let recompiled = ty.recompile(&profile).unwrap();
        for instr in recompiled.program().instrs() {
            let expected = if instr.number == 2 { 2 } else { 0 };
            assert_eq!(instr.capacity_hint, expected, "field {}", instr.number);
        }
        let i_field = recompiled.descriptor().get_field_by_name("i").unwrap();
        let inner_ty = recompiled.child_type(&i_field).unwrap();
        assert!(
            inner_ty
                .program()
                .instrs()
                .iter()
                .all(|instr| instr.capacity_hint == 4)
        );

        // Hints are not applied to the original type.
        assert!(ty.program().instrs().iter().all(|instr| instr.capacity_hint == 0));
    }

    #[test]
    fn test_hot_fields_take_home_slots() {
        // Two fields whose tags hash to the same slot of a hashed dispatch
        // table with 4 slots.
        const SHIFT: u32 = 30;
        let low = 2000u32;
        let high = (low + 1..)
            .find(|n| Dispatch::hash(n << 3, SHIFT) == Dispatch::hash(low << 3, SHIFT))
            .unwrap();
        let ty = compile(SchemaBuilder::proto3("t.proto").message("M", |m| {
            m.field("low", low as i32, FieldType::INT32)
                .field("high", high as i32, FieldType::INT32)
        }));

        let home_slot_tag = |ty: &MessageType| match ty.program().dispatch() {
            Dispatch::Hashed { slots, shift } => {
                assert_eq!(*shift, SHIFT);
                slots[Dispatch::hash(low << 3, SHIFT)].0
            }
            Dispatch::Dense(_) => panic!("expected hashed dispatch"),
        };

        // Without a profile, lower tags are inserted first.
        assert_eq!(home_slot_tag(&ty), low << 3);

        let input = Wire::new().varint(high, 1).varint(high, 2).varint(low, 3).finish();
        let profile = ty.new_profile();
        decode_all(&ty, &[input], &UnmarshalOptions::new().record_profile(&profile, 1.0));
        let stats = profile.stats();
        let m = stats.get("M").unwrap();
        assert_eq!(m.field("high").unwrap().hits, 2);
        assert_eq!(m.field("low").unwrap().hits, 1);

        let recompiled = ty.recompile(&profile).unwrap();
        assert_eq!(home_slot_tag(&recompiled), high << 3);
        assert_eq!(recompiled.program().dispatch().lookup(low << 3), Some(0));
        assert_eq!(recompiled.program().dispatch().lookup(high << 3), Some(1));
    }

    #[test]
    fn test_capacity_for_mean() {
        #[derive(Debug)]
        struct Case {
            mean: f64,
            expected: u32,
        }

        let cases = [
            Case {
                mean: 0.5,
                expected: 1,
            },
            Case {
                mean: 3.0,
                expected: 4,
            },
            Case {
                mean: 4.2,
                expected: 8,
            },
            Case {
                mean: 16.0,
                expected: 16,
            },
            Case {
                mean: 5000.0,
                expected: 1024,
            },
        ];

        cases.test_each(|case| {
            assert_eq!(capacity_for_mean(case.mean), case.expected);
        })
    }
}
