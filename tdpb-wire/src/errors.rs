use std::error::Error;
use std::fmt::{Display, Formatter};

use crate::varint::VarintError;

/// Errors decoding Protocol Buffers wire data.
#[derive(Clone, Debug, PartialEq)]
pub struct WireError {
    kind: ErrorKind,
    context: Option<&'static str>,
    field: Option<u32>,
    offset: Option<usize>,
}

impl WireError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            field: None,
            offset: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Return the message type associated with this error.
    pub fn context(&self) -> Option<&str> {
        self.context
    }

    /// Return the field number associated with this error.
    pub fn field(&self) -> Option<u32> {
        self.field
    }

    /// Return the byte offset in the input at which the error was detected.
    pub fn offset(&self) -> Option<usize> {
        self.offset
    }

    /// Associate a message type and/or field number with this error.
    pub fn with_context(mut self, context: Option<&'static str>, field: Option<u32>) -> Self {
        self.context = context;
        self.field = field;
        self
    }

    /// Record the input offset at which this error occurred.
    pub fn at(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

impl Display for WireError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (self.context, self.field) {
            (Some(ctx), Some(field)) => write!(f, "error in message {ctx} field {field}: ")?,
            (Some(ctx), None) => write!(f, "error in message {ctx}: ")?,
            (None, Some(field)) => write!(f, "error in field {field}: ")?,
            (None, None) => {}
        }
        write!(f, "{}", self.kind)?;
        if let Some(offset) = self.offset {
            write!(f, " at offset {offset}")?;
        }
        Ok(())
    }
}

impl Error for WireError {}

impl From<ErrorKind> for WireError {
    fn from(val: ErrorKind) -> Self {
        Self::new(val)
    }
}

impl From<VarintError> for WireError {
    fn from(val: VarintError) -> Self {
        match val {
            VarintError::Truncated => Self::new(ErrorKind::TruncatedInput),
            VarintError::Malformed => Self::new(ErrorKind::MalformedVarint),
        }
    }
}

/// Enum describing the kind of a [`WireError`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The input ended in the middle of a field.
    TruncatedInput,

    /// A varint was encoded with more than 10 bytes, or its value does not
    /// fit in 64 bits.
    MalformedVarint,

    /// A length prefix exceeds the remaining input.
    Overflow,

    /// A field has an invalid wire type.
    ///
    /// Protocol Buffers defines 6 wire types, but uses 3 bits to encode them.
    /// Hence there are two unused values.
    InvalidWireType,

    /// A tag had field number zero or a number that does not fit in 29 bits.
    MalformedTag,

    /// A group was not terminated by the matching end-group tag, or an
    /// end-group tag appeared outside a group.
    MalformedGroup,

    /// Groups were nested more deeply than allowed while skipping them.
    NestingTooDeep,

    /// Attempted to read a field value of a type that doesn't match the wire
    /// type.
    FieldTypeMismatch,

    /// A string field contained invalid UTF-8.
    InvalidUtf8,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::TruncatedInput => write!(f, "input truncated"),
            ErrorKind::MalformedVarint => write!(f, "malformed varint"),
            ErrorKind::Overflow => write!(f, "length exceeds remaining input"),
            ErrorKind::InvalidWireType => write!(f, "invalid wire type"),
            ErrorKind::MalformedTag => write!(f, "malformed tag"),
            ErrorKind::MalformedGroup => write!(f, "malformed group"),
            ErrorKind::NestingTooDeep => write!(f, "groups nested too deeply"),
            ErrorKind::FieldTypeMismatch => write!(f, "field type mismatch"),
            ErrorKind::InvalidUtf8 => write!(f, "invalid UTF-8 in string"),
        }
    }
}
