use std::error::Error;
use std::fmt::{Display, Formatter};

use tdpb_wire::{ErrorKind as WireErrorKind, WireError};

/// Errors that occur when decoding a message.
///
/// When a decode fails, no partially decoded message is returned. Memory
/// already allocated in the [`Shared`](crate::Shared) arena is reclaimed by
/// the next reset.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodeError {
    kind: DecodeErrorKind,
    message: Option<String>,
    field: Option<u32>,
    offset: Option<usize>,
}

impl DecodeError {
    pub(crate) fn new(kind: DecodeErrorKind) -> Self {
        Self {
            kind,
            message: None,
            field: None,
            offset: None,
        }
    }

    /// Return the category of error.
    pub fn kind(&self) -> DecodeErrorKind {
        self.kind
    }

    /// Full name of the message type that was being decoded when the error
    /// occurred.
    pub fn message_name(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Number of the field that was being decoded, if known.
    pub fn field(&self) -> Option<u32> {
        self.field
    }

    /// Byte offset in the input at which the error was detected.
    pub fn offset(&self) -> Option<usize> {
        self.offset
    }

    pub(crate) fn at(mut self, offset: usize) -> Self {
        self.offset.get_or_insert(offset);
        self
    }

    pub(crate) fn for_field(mut self, field: u32) -> Self {
        self.field.get_or_insert(field);
        self
    }

    /// Attach the innermost message name. Outer frames leave an existing
    /// name alone.
    pub(crate) fn in_message(mut self, name: &str) -> Self {
        if self.message.is_none() {
            self.message = Some(name.to_string());
        }
        self
    }
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (self.message.as_deref(), self.field) {
            (Some(msg), Some(field)) => write!(f, "in message {msg} field {field}: ")?,
            (Some(msg), None) => write!(f, "in message {msg}: ")?,
            (None, Some(field)) => write!(f, "in field {field}: ")?,
            (None, None) => {}
        }
        write!(f, "{}", self.kind)?;
        if let Some(offset) = self.offset {
            write!(f, " at offset {offset}")?;
        }
        Ok(())
    }
}

impl Error for DecodeError {}

impl From<DecodeErrorKind> for DecodeError {
    fn from(val: DecodeErrorKind) -> Self {
        Self::new(val)
    }
}

impl From<WireError> for DecodeError {
    fn from(val: WireError) -> Self {
        type Kind = DecodeErrorKind;

        let kind = match val.kind() {
            WireErrorKind::TruncatedInput => Kind::TruncatedInput,
            WireErrorKind::MalformedVarint => Kind::MalformedVarint,
            WireErrorKind::Overflow => Kind::Overflow,
            WireErrorKind::InvalidWireType => Kind::InvalidWireType,
            WireErrorKind::MalformedTag => Kind::MalformedTag,
            WireErrorKind::MalformedGroup => Kind::MalformedGroup,
            WireErrorKind::NestingTooDeep => Kind::RecursionLimit,
            WireErrorKind::InvalidUtf8 => Kind::InvalidUtf8,
            _ => Kind::InvalidWireType,
        };
        let mut err = DecodeError::new(kind);
        err.field = val.field();
        err.offset = val.offset();
        err
    }
}

/// Categories of error when decoding a message.
///
/// See [`DecodeError::kind`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum DecodeErrorKind {
    /// The input ended in the middle of a field.
    TruncatedInput,

    /// A varint was longer than 10 bytes.
    MalformedVarint,

    /// A length prefix exceeded the remaining input.
    Overflow,

    /// A tag used one of the unassigned wire types 6 or 7.
    InvalidWireType,

    /// A tag had field number zero or did not fit in 32 bits.
    MalformedTag,

    /// An end-group tag did not match the open group, or a group was not
    /// closed before its enclosing message ended.
    MalformedGroup,

    /// A string field that requires UTF-8 validation contained invalid UTF-8.
    InvalidUtf8,

    /// Messages or groups were nested more deeply than the configured limit.
    RecursionLimit,

    /// Decoding exceeded the configured work budget.
    WorkLimit,

    /// The input contained more unknown fields than the configured budget.
    DecodeMissBudgetExceeded,
}

impl Display for DecodeErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TruncatedInput => write!(f, "input truncated"),
            Self::MalformedVarint => write!(f, "malformed varint"),
            Self::Overflow => write!(f, "length exceeds remaining input"),
            Self::InvalidWireType => write!(f, "invalid wire type"),
            Self::MalformedTag => write!(f, "malformed tag"),
            Self::MalformedGroup => write!(f, "malformed group"),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 in string field"),
            Self::RecursionLimit => write!(f, "recursion limit exceeded"),
            Self::WorkLimit => write!(f, "work limit exceeded"),
            Self::DecodeMissBudgetExceeded => write!(f, "too many unknown fields"),
        }
    }
}

/// Errors that occur when compiling a message type.
#[derive(Debug)]
pub struct CompileError {
    kind: CompileErrorKind,
    message: String,
    source: Option<WireError>,
}

impl CompileError {
    pub(crate) fn new(kind: CompileErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Return the category of error.
    pub fn kind(&self) -> CompileErrorKind {
        self.kind
    }
}

impl Display for CompileError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            CompileErrorKind::SchemaInvalid => write!(f, "invalid schema: {}", self.message),
            CompileErrorKind::NotFound => write!(f, "message not found: {}", self.message),
            CompileErrorKind::ProfileMismatch => {
                write!(f, "profile mismatch: {}", self.message)
            }
            CompileErrorKind::DescriptorDecode => {
                write!(f, "failed to decode descriptor set: {}", self.message)
            }
        }
    }
}

impl Error for CompileError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_ref().map(|err| err as &(dyn Error + 'static))
    }
}

impl From<WireError> for CompileError {
    fn from(val: WireError) -> Self {
        Self {
            kind: CompileErrorKind::DescriptorDecode,
            message: val.to_string(),
            source: Some(val),
        }
    }
}

/// Categories of error when compiling a message type.
///
/// See [`CompileError::kind`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum CompileErrorKind {
    /// The descriptor is structurally invalid or references an unknown type.
    SchemaInvalid,

    /// The named message does not exist in the descriptor set.
    NotFound,

    /// A profile was recorded against a different compiled type.
    ProfileMismatch,

    /// A serialized descriptor set could not be decoded.
    DescriptorDecode,
}

/// Create a [`CompileError`] with kind `SchemaInvalid`.
macro_rules! schema_error {
    ($($arg:tt)*) => {{
        $crate::errors::CompileError::new(
            $crate::errors::CompileErrorKind::SchemaInvalid,
            format!($($arg)*),
        )
    }};
}

pub(crate) use schema_error;

#[cfg(test)]
mod tests {
    use tdpb_wire::{ErrorKind, WireError};

    use super::{CompileError, CompileErrorKind, DecodeError, DecodeErrorKind};

    #[test]
    fn test_decode_error_display() {
        let err = DecodeError::new(DecodeErrorKind::TruncatedInput)
            .for_field(3)
            .at(12)
            .in_message("pkg.Inner")
            .in_message("pkg.Outer");
        assert_eq!(
            err.to_string(),
            "in message pkg.Inner field 3: input truncated at offset 12"
        );
    }

    #[test]
    fn test_decode_error_from_wire_error() {
        let err: DecodeError = WireError::new(ErrorKind::NestingTooDeep).at(4).into();
        assert_eq!(err.kind(), DecodeErrorKind::RecursionLimit);
        assert_eq!(err.offset(), Some(4));
    }

    #[test]
    fn test_compile_error_from_wire_error() {
        let err: CompileError = WireError::new(ErrorKind::InvalidUtf8).into();
        assert_eq!(err.kind(), CompileErrorKind::DescriptorDecode);
        assert!(std::error::Error::source(&err).is_some());
    }
}
