use crate::arena::{Arena, ArenaOptions};
use crate::errors::DecodeError;
use crate::message_type::MessageType;
use crate::reflect::Message;
use crate::vm::{UnmarshalOptions, decode};

/// Reusable decoding state.
///
/// A `Shared` owns the arena which decoded messages are allocated in. A
/// message borrows the `Shared` it was decoded with, so the next decode,
/// [`reset`](Shared::reset) or [`release`](Shared::release) can only happen
/// once the message is no longer used.
///
/// Memory is not freed between decodes until the `Shared` is reset. A
/// service decoding a stream of requests would typically call `reset` before
/// each one, which keeps a small number of arena chunks for reuse.
///
/// Decodes on different threads need separate `Shared`s. They can share one
/// [`MessageType`].
///
/// ```
/// use tdpb::{Shared, UnmarshalOptions, compile_file_set_bytes, CompileOptions};
/// # fn decode_all(schema: &[u8], inputs: &[Vec<u8>]) -> Result<(), Box<dyn std::error::Error>> {
/// let ty = compile_file_set_bytes(schema, "pkg.Request", &CompileOptions::default())?;
/// let mut shared = Shared::new();
/// for input in inputs {
///     shared.reset();
///     let msg = shared.unmarshal(&ty, input, &UnmarshalOptions::default())?;
///     println!("{:?}", msg);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct Shared {
    arena: Arena,
}

impl Shared {
    pub fn new() -> Shared {
        Self::default()
    }

    /// Create a `Shared` whose arena uses the given growth and retention
    /// settings.
    pub fn with_options(options: ArenaOptions) -> Shared {
        Shared {
            arena: Arena::new(options),
        }
    }

    /// Allocate an empty message of type `ty`.
    pub fn new_message<'a>(&'a mut self, ty: &'a MessageType) -> Message<'a> {
        let record = self.arena.alloc(ty.layout().size as usize, 8);
        Message::new(&self.arena, &[], ty.library(), ty.index(), record)
    }

    /// Decode `input` as a message of type `ty`.
    ///
    /// If decoding fails, memory allocated before the failure stays in the
    /// arena until the next [`reset`](Shared::reset).
    pub fn unmarshal<'a>(
        &'a mut self,
        ty: &'a MessageType,
        input: &'a [u8],
        options: &UnmarshalOptions,
    ) -> Result<Message<'a>, DecodeError> {
        let record = decode(ty, &mut self.arena, input, options)?;
        Ok(Message::new(&self.arena, input, ty.library(), ty.index(), record))
    }

    /// Free all decoded messages, keeping some arena memory for reuse.
    pub fn reset(&mut self) {
        self.arena.reset();
    }

    /// Free all decoded messages and all arena memory.
    pub fn release(&mut self) {
        self.arena.release();
    }

    /// Return the number of arena bytes used since the last reset.
    pub fn allocated_bytes(&self) -> usize {
        self.arena.allocated_bytes()
    }

    /// Return the total size of the arena's chunks.
    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }
}

#[cfg(test)]
mod tests {
    use tdpb_testing::{SchemaBuilder, Wire};
    use tdpb_wire::descriptor::FieldType;

    use super::Shared;
    use crate::arena::ArenaOptions;
    use crate::{CompileOptions, MessageType, UnmarshalOptions, Value, compile_file_set};

    fn string_type() -> MessageType {
        let set = SchemaBuilder::proto3("t.proto")
            .message("M", |m| m.repeated("names", 1, FieldType::STRING))
            .build();
        compile_file_set(&set, "M", &CompileOptions::default()).unwrap()
    }

    #[test]
    fn test_new_message() {
        let ty = string_type();
        let mut shared = Shared::new();
        let msg = shared.new_message(&ty);
        assert_eq!(msg.get_by_name("names").unwrap().as_list().unwrap().len(), 0);
        assert!(msg.unknown_fields().is_empty());
    }

    #[test]
    fn test_reset_reuses_memory() {
        let ty = string_type();
        let mut wire = Wire::new();
        for i in 0..200 {
            wire = wire.string(1, &format!("name-{}", i));
        }
        let input = wire.finish();

        let mut shared = Shared::with_options(
            ArenaOptions::default()
                .initial_chunk_size(256)
                .retain_chunks(8),
        );
        let msg = shared
            .unmarshal(&ty, &input, &UnmarshalOptions::default())
            .unwrap();
        let names = msg.get_by_name("names").unwrap().as_list().unwrap();
        assert_eq!(names.get(199), Some(Value::String("name-199")));
        let used = shared.allocated_bytes();
        let capacity = shared.capacity();
        assert!(used > 0);

        shared.reset();
        assert_eq!(shared.allocated_bytes(), 0);
        assert!(shared.capacity() > 0);

        let msg = shared
            .unmarshal(&ty, &input, &UnmarshalOptions::default())
            .unwrap();
        assert_eq!(msg.get_by_name("names").unwrap().as_list().unwrap().len(), 200);
        assert_eq!(shared.allocated_bytes(), used);
        assert!(shared.capacity() <= capacity);

        shared.release();
        assert_eq!(shared.capacity(), 0);
    }

    #[test]
    fn test_failed_decode_leaves_shared_usable() {
        let ty = string_type();
        let mut shared = Shared::new();
        assert!(
            shared
                .unmarshal(&ty, &[0x0A, 0x05, b'a'], &UnmarshalOptions::default())
                .is_err()
        );
        shared.reset();
        let input = Wire::new().string(1, "ok").finish();
        let msg = shared
            .unmarshal(&ty, &input, &UnmarshalOptions::default())
            .unwrap();
        let names = msg.get_by_name("names").unwrap().as_list().unwrap();
        assert_eq!(names.get(0), Some(Value::String("ok")));
    }
}
