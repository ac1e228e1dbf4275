//! Protocol Buffers wire format primitives.
//!
//! This crate contains the low-level pieces used by `tdpb` to read and write
//! [Protocol Buffers](https://protobuf.dev/) messages:
//!
//! - [`varint`] and [`cursor`] decode varints, fixed-width values,
//!   length-delimited values and whole fields from a byte slice. All decoders
//!   are bounds-checked against the end of the input and never allocate.
//! - [`Fields`] is an iterator over the fields of an encoded message, and
//!   [`DecodeMessage`] is a trait for types that can be decoded from one.
//! - [`WireWriter`] encodes fields.
//! - [`descriptor`] contains types for the messages in
//!   [descriptor.proto](https://github.com/protocolbuffers/protobuf/blob/main/src/google/protobuf/descriptor.proto)
//!   together with decoders for them. These are used to load the schemas
//!   that `tdpb` compiles.
//!
//! # Prerequisites
//!
//! To use this crate, it is helpful to have an understanding of how Protocol
//! Buffers messages are encoded. See
//! <https://protobuf.dev/programming-guides/encoding/> for a guide.
//!
//! # Example
//!
//! ```
//! use tdpb_wire::{Fields, FieldValue};
//!
//! // Field 1, varint 150.
//! let message = [0x08, 0x96, 0x01];
//!
//! let mut numbers = Vec::new();
//! for field in Fields::new(&message, None) {
//!     let field = field.unwrap();
//!     numbers.push((field.number(), field.value()));
//! }
//! assert_eq!(numbers, [(1, FieldValue::Varint(150))]);
//! ```

// This crate parses untrusted input, so it is preferable to avoid unsafe code.
#![forbid(unsafe_code)]

pub mod cursor;
pub mod descriptor;
mod errors;
mod field;
mod message;
pub mod varint;
mod writer;

pub use cursor::{ReadCursor, WireType, make_tag};
pub use errors::{ErrorKind, WireError};
pub use field::{Field, FieldValue, Fields};
pub use message::DecodeMessage;
pub use writer::WireWriter;
