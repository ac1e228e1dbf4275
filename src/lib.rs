//! tdpb decodes [Protocol Buffers](https://protobuf.dev) messages whose schema
//! is only known at runtime.
//!
//! Instead of generating code for each message type, tdpb compiles message
//! descriptors into a compact record layout and a table-driven program. A
//! small parser VM executes the program against the encoded bytes and writes
//! fields into records allocated from an arena. Decoded messages are read
//! through a reflection API.
//!
//! # Workflow
//!
//! 1. Obtain a schema as a `FileDescriptorSet`, for example by running
//!    `protoc --include_imports --descriptor_set_out=schema.pb`.
//! 2. Compile the root message type with [`compile_file_set_bytes`],
//!    [`compile_file_set`] or, given a [`MessageDescriptor`] from a
//!    [`DescriptorPool`], [`compile`]. Use a [`Compiler`] to compile several
//!    types which share nested types.
//! 3. Create a [`Shared`] per thread and decode messages with
//!    [`Shared::unmarshal`].
//! 4. Read fields of the returned [`Message`] using [`Message::get`],
//!    [`Message::range`] and related methods.
//!
//! ```
//! use tdpb::{CompileOptions, Shared, UnmarshalOptions, Value, compile_file_set};
//! use tdpb_testing::{SchemaBuilder, Wire};
//! use tdpb_wire::descriptor::FieldType;
//!
//! let schema = SchemaBuilder::proto3("person.proto")
//!     .package("example")
//!     .message("Person", |m| {
//!         m.field("name", 1, FieldType::STRING)
//!             .field("id", 2, FieldType::INT32)
//!     })
//!     .build();
//! let ty = compile_file_set(&schema, "example.Person", &CompileOptions::default()).unwrap();
//!
//! let input = Wire::new().string(1, "Ada").varint(2, 42).finish();
//! let mut shared = Shared::new();
//! let person = shared.unmarshal(&ty, &input, &UnmarshalOptions::default()).unwrap();
//! assert_eq!(person.get_by_name("name"), Some(Value::String("Ada")));
//! assert_eq!(person.get_by_name("id"), Some(Value::I32(42)));
//! ```
//!
//! # Profile-guided recompilation
//!
//! A decode can record counters into a [`Profile`], sampling a fraction of
//! decodes. [`MessageType::recompile`] uses the counters to choose initial
//! capacities of lists and maps and to put frequently seen fields first in
//! the dispatch tables. Recompiling produces a new type. Types compiled
//! earlier remain valid.
//!
//! # Untrusted input
//!
//! Decoding never panics on malformed input. Nesting depth is limited (see
//! [`UnmarshalOptions::recursion_limit`]), and the amount of work and the
//! number of unknown fields can be bounded with
//! [`UnmarshalOptions::max_work`] and
//! [`UnmarshalOptions::max_decode_misses`].
//!
//! # Environment variables
//!
//! - `TDPB_DUMP_PROGRAMS`: log the program of each compiled type at trace
//!   level.
//! - `TDPB_RECURSION_LIMIT`: default recursion limit for decoding.

// Decoders parse untrusted input, so avoid unsafe code.
#![forbid(unsafe_code)]

mod arena;
mod compile;
mod encode;
mod env;
mod errors;
mod message_type;
mod reflect;
mod shared;
mod vm;

pub mod layout;
pub mod profile;
pub mod program;
pub mod schema;

pub use arena::ArenaOptions;
pub use compile::{CompileOptions, Compiler, compile, compile_file_set, compile_file_set_bytes};
pub use encode::encode;
pub use errors::{CompileError, CompileErrorKind, DecodeError, DecodeErrorKind};
pub use message_type::MessageType;
pub use profile::{FieldStats, Profile, ProfileStats, TypeStats};
pub use reflect::{List, Map, MapKey, Message, Value};
pub use schema::{
    Cardinality, DescriptorPool, EnumDescriptor, ExtensionResolver, FieldDescriptor, Kind,
    MessageDescriptor, OneofDescriptor,
};
pub use shared::Shared;
pub use vm::UnmarshalOptions;
