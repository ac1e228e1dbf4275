//! Protocol Buffers schema descriptor types.
//!
//! The types in this module correspond to messages defined in
//! [descriptor.proto](https://github.com/protocolbuffers/protobuf/blob/main/src/google/protobuf/descriptor.proto).
//! See the `.proto` file for detailed information on each type and field.
//!
//! These types are not complete. They only contain messages and fields which
//! affect how a message is laid out and decoded. A serialized
//! `FileDescriptorSet`, as produced by `protoc --descriptor_set_out` or
//! `buf build -o`, can be loaded with [`FileDescriptorSet::decode`].

use crate::{DecodeMessage, Fields, WireError};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct FieldType(pub i32);

impl FieldType {
    pub const DOUBLE: Self = Self(1);
    pub const FLOAT: Self = Self(2);
    pub const INT64: Self = Self(3);
    pub const UINT64: Self = Self(4);
    pub const INT32: Self = Self(5);
    pub const FIXED64: Self = Self(6);
    pub const FIXED32: Self = Self(7);
    pub const BOOL: Self = Self(8);
    pub const STRING: Self = Self(9);
    pub const GROUP: Self = Self(10);
    pub const MESSAGE: Self = Self(11);
    pub const BYTES: Self = Self(12);
    pub const UINT32: Self = Self(13);
    pub const ENUM: Self = Self(14);
    pub const SFIXED32: Self = Self(15);
    pub const SFIXED64: Self = Self(16);
    pub const SINT32: Self = Self(17);
    pub const SINT64: Self = Self(18);
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct FieldLabel(pub i32);

impl FieldLabel {
    pub const OPTIONAL: Self = Self(1);
    pub const REQUIRED: Self = Self(2);
    pub const REPEATED: Self = Self(3);
}

/// Protobuf edition, as used by `FileDescriptorProto.edition`.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Edition(pub i32);

impl Edition {
    pub const UNKNOWN: Self = Self(0);
    pub const PROTO2: Self = Self(998);
    pub const PROTO3: Self = Self(999);
    pub const EDITION_2023: Self = Self(1000);
    pub const EDITION_2024: Self = Self(1001);
}

/// Subset of `google.protobuf.FeatureSet` that affects decoding.
///
/// Each field is an enum value as defined in descriptor.proto. `None` means
/// the feature is inherited from the enclosing scope.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeatureSet {
    /// 1 = EXPLICIT, 2 = IMPLICIT, 3 = LEGACY_REQUIRED.
    pub field_presence: Option<i32>,
    /// 1 = OPEN, 2 = CLOSED.
    pub enum_type: Option<i32>,
    /// 1 = PACKED, 2 = EXPANDED.
    pub repeated_field_encoding: Option<i32>,
    /// 2 = VERIFY, 3 = NONE.
    pub utf8_validation: Option<i32>,
    /// 1 = LENGTH_PREFIXED, 2 = DELIMITED.
    pub message_encoding: Option<i32>,
}

impl FeatureSet {
    const FIELD_PRESENCE: u32 = 1;
    const ENUM_TYPE: u32 = 2;
    const REPEATED_FIELD_ENCODING: u32 = 3;
    const UTF8_VALIDATION: u32 = 4;
    const MESSAGE_ENCODING: u32 = 5;

    pub const PRESENCE_EXPLICIT: i32 = 1;
    pub const PRESENCE_IMPLICIT: i32 = 2;
    pub const PRESENCE_LEGACY_REQUIRED: i32 = 3;
    pub const ENUM_OPEN: i32 = 1;
    pub const ENUM_CLOSED: i32 = 2;
    pub const ENCODING_PACKED: i32 = 1;
    pub const ENCODING_EXPANDED: i32 = 2;
    pub const UTF8_VERIFY: i32 = 2;
    pub const UTF8_NONE: i32 = 3;
    pub const MESSAGE_LENGTH_PREFIXED: i32 = 1;
    pub const MESSAGE_DELIMITED: i32 = 2;

    /// Return a copy of `self` with unset features taken from `parent`.
    pub fn inherit(&self, parent: &FeatureSet) -> FeatureSet {
        FeatureSet {
            field_presence: self.field_presence.or(parent.field_presence),
            enum_type: self.enum_type.or(parent.enum_type),
            repeated_field_encoding: self
                .repeated_field_encoding
                .or(parent.repeated_field_encoding),
            utf8_validation: self.utf8_validation.or(parent.utf8_validation),
            message_encoding: self.message_encoding.or(parent.message_encoding),
        }
    }
}

impl DecodeMessage for FeatureSet {
    fn decode_fields(fields: Fields<'_>) -> Result<Self, WireError> {
        let mut msg = Self::default();
        for field in fields {
            let field = field?;
            match field.number() {
                Self::FIELD_PRESENCE => msg.field_presence = Some(field.get_enum()?),
                Self::ENUM_TYPE => msg.enum_type = Some(field.get_enum()?),
                Self::REPEATED_FIELD_ENCODING => {
                    msg.repeated_field_encoding = Some(field.get_enum()?)
                }
                Self::UTF8_VALIDATION => msg.utf8_validation = Some(field.get_enum()?),
                Self::MESSAGE_ENCODING => msg.message_encoding = Some(field.get_enum()?),
                _ => {}
            }
        }
        Ok(msg)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FieldOptions {
    pub packed: Option<bool>,
    pub features: Option<FeatureSet>,
}

impl FieldOptions {
    const PACKED: u32 = 2;
    const FEATURES: u32 = 21;
}

impl DecodeMessage for FieldOptions {
    fn decode_fields(fields: Fields<'_>) -> Result<Self, WireError> {
        let mut msg = Self::default();
        for field in fields {
            let field = field?;
            match field.number() {
                Self::PACKED => msg.packed = Some(field.get_bool()?),
                Self::FEATURES => msg.features = Some(FeatureSet::decode_field(&field)?),
                _ => {}
            }
        }
        Ok(msg)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessageOptions {
    pub map_entry: Option<bool>,
    pub features: Option<FeatureSet>,
}

impl MessageOptions {
    const MAP_ENTRY: u32 = 7;
    const FEATURES: u32 = 12;
}

impl DecodeMessage for MessageOptions {
    fn decode_fields(fields: Fields<'_>) -> Result<Self, WireError> {
        let mut msg = Self::default();
        for field in fields {
            let field = field?;
            match field.number() {
                Self::MAP_ENTRY => msg.map_entry = Some(field.get_bool()?),
                Self::FEATURES => msg.features = Some(FeatureSet::decode_field(&field)?),
                _ => {}
            }
        }
        Ok(msg)
    }
}

/// Options messages which only carry features for this crate's purposes
/// (`FileOptions`, `EnumOptions`, `OneofOptions`).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeatureOptions {
    pub features: Option<FeatureSet>,
}

impl FeatureOptions {
    const FILE_FEATURES: u32 = 50;
    const ENUM_FEATURES: u32 = 7;

    fn decode_with(fields: Fields<'_>, number: u32) -> Result<Self, WireError> {
        let mut msg = Self::default();
        for field in fields {
            let field = field?;
            if field.number() == number {
                msg.features = Some(FeatureSet::decode_field(&field)?);
            }
        }
        Ok(msg)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FieldDescriptorProto {
    pub name: Option<String>,
    pub number: Option<i32>,
    pub label: Option<FieldLabel>,
    pub r#type: Option<FieldType>,
    pub type_name: Option<String>,
    pub extendee: Option<String>,
    pub default_value: Option<String>,
    pub oneof_index: Option<i32>,
    pub json_name: Option<String>,
    pub options: Option<FieldOptions>,
    pub proto3_optional: Option<bool>,
}

impl FieldDescriptorProto {
    const NAME: u32 = 1;
    const EXTENDEE: u32 = 2;
    const NUMBER: u32 = 3;
    const LABEL: u32 = 4;
    const TYPE: u32 = 5;
    const TYPE_NAME: u32 = 6;
    const DEFAULT_VALUE: u32 = 7;
    const OPTIONS: u32 = 8;
    const ONEOF_INDEX: u32 = 9;
    const JSON_NAME: u32 = 10;
    const PROTO3_OPTIONAL: u32 = 17;
}

impl DecodeMessage for FieldDescriptorProto {
    fn decode_fields(fields: Fields<'_>) -> Result<Self, WireError> {
        let mut msg = Self::default();
        for field in fields {
            let field = field?;
            match field.number() {
                Self::NAME => msg.name = Some(field.read_string()?),
                Self::EXTENDEE => msg.extendee = Some(field.read_string()?),
                Self::NUMBER => msg.number = Some(field.get_int32()?),
                Self::LABEL => msg.label = Some(FieldLabel(field.get_enum()?)),
                Self::TYPE => msg.r#type = Some(FieldType(field.get_enum()?)),
                Self::TYPE_NAME => msg.type_name = Some(field.read_string()?),
                Self::DEFAULT_VALUE => msg.default_value = Some(field.read_string()?),
                Self::OPTIONS => msg.options = Some(FieldOptions::decode_field(&field)?),
                Self::ONEOF_INDEX => msg.oneof_index = Some(field.get_int32()?),
                Self::JSON_NAME => msg.json_name = Some(field.read_string()?),
                Self::PROTO3_OPTIONAL => msg.proto3_optional = Some(field.get_bool()?),
                _ => {}
            }
        }
        Ok(msg)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct OneofDescriptorProto {
    pub name: Option<String>,
}

impl OneofDescriptorProto {
    const NAME: u32 = 1;
}

impl DecodeMessage for OneofDescriptorProto {
    fn decode_fields(fields: Fields<'_>) -> Result<Self, WireError> {
        let mut msg = Self::default();
        for field in fields {
            let field = field?;
            if field.number() == Self::NAME {
                msg.name = Some(field.read_string()?);
            }
        }
        Ok(msg)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EnumValueDescriptorProto {
    pub name: Option<String>,
    pub number: Option<i32>,
}

impl EnumValueDescriptorProto {
    const NAME: u32 = 1;
    const NUMBER: u32 = 2;
}

impl DecodeMessage for EnumValueDescriptorProto {
    fn decode_fields(fields: Fields<'_>) -> Result<Self, WireError> {
        let mut msg = Self::default();
        for field in fields {
            let field = field?;
            match field.number() {
                Self::NAME => msg.name = Some(field.read_string()?),
                Self::NUMBER => msg.number = Some(field.get_int32()?),
                _ => {}
            }
        }
        Ok(msg)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EnumDescriptorProto {
    pub name: Option<String>,
    pub value: Vec<EnumValueDescriptorProto>,
    pub options: Option<FeatureOptions>,
}

impl EnumDescriptorProto {
    const NAME: u32 = 1;
    const VALUE: u32 = 2;
    const OPTIONS: u32 = 3;
}

impl DecodeMessage for EnumDescriptorProto {
    fn decode_fields(fields: Fields<'_>) -> Result<Self, WireError> {
        let mut msg = Self::default();
        for field in fields {
            let field = field?;
            match field.number() {
                Self::NAME => msg.name = Some(field.read_string()?),
                Self::VALUE => msg
                    .value
                    .push(EnumValueDescriptorProto::decode_field(&field)?),
                Self::OPTIONS => {
                    let body = field.read_bytes()?;
                    msg.options = Some(FeatureOptions::decode_with(
                        Fields::new(body, Some("EnumOptions")),
                        FeatureOptions::ENUM_FEATURES,
                    )?);
                }
                _ => {}
            }
        }
        Ok(msg)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct ExtensionRange {
    pub start: Option<i32>,
    pub end: Option<i32>,
}

impl ExtensionRange {
    const START: u32 = 1;
    const END: u32 = 2;
}

impl DecodeMessage for ExtensionRange {
    fn decode_fields(fields: Fields<'_>) -> Result<Self, WireError> {
        let mut msg = Self::default();
        for field in fields {
            let field = field?;
            match field.number() {
                Self::START => msg.start = Some(field.get_int32()?),
                Self::END => msg.end = Some(field.get_int32()?),
                _ => {}
            }
        }
        Ok(msg)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DescriptorProto {
    pub name: Option<String>,
    pub field: Vec<FieldDescriptorProto>,
    pub extension: Vec<FieldDescriptorProto>,
    pub nested_type: Vec<DescriptorProto>,
    pub enum_type: Vec<EnumDescriptorProto>,
    pub extension_range: Vec<ExtensionRange>,
    pub oneof_decl: Vec<OneofDescriptorProto>,
    pub options: Option<MessageOptions>,
}

impl DescriptorProto {
    const NAME: u32 = 1;
    const FIELD: u32 = 2;
    const NESTED_TYPE: u32 = 3;
    const ENUM_TYPE: u32 = 4;
    const EXTENSION_RANGE: u32 = 5;
    const EXTENSION: u32 = 6;
    const OPTIONS: u32 = 7;
    const ONEOF_DECL: u32 = 8;
}

impl DecodeMessage for DescriptorProto {
    fn decode_fields(fields: Fields<'_>) -> Result<Self, WireError> {
        let mut msg = Self::default();
        for field in fields {
            let field = field?;
            match field.number() {
                Self::NAME => msg.name = Some(field.read_string()?),
                Self::FIELD => msg.field.push(FieldDescriptorProto::decode_field(&field)?),
                Self::NESTED_TYPE => msg
                    .nested_type
                    .push(DescriptorProto::decode_field(&field)?),
                Self::ENUM_TYPE => msg
                    .enum_type
                    .push(EnumDescriptorProto::decode_field(&field)?),
                Self::EXTENSION_RANGE => msg
                    .extension_range
                    .push(ExtensionRange::decode_field(&field)?),
                Self::EXTENSION => msg
                    .extension
                    .push(FieldDescriptorProto::decode_field(&field)?),
                Self::OPTIONS => msg.options = Some(MessageOptions::decode_field(&field)?),
                Self::ONEOF_DECL => msg
                    .oneof_decl
                    .push(OneofDescriptorProto::decode_field(&field)?),
                _ => {}
            }
        }
        Ok(msg)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FileDescriptorProto {
    pub name: Option<String>,
    pub package: Option<String>,
    pub dependency: Vec<String>,
    pub message_type: Vec<DescriptorProto>,
    pub enum_type: Vec<EnumDescriptorProto>,
    pub extension: Vec<FieldDescriptorProto>,
    pub options: Option<FeatureOptions>,
    pub syntax: Option<String>,
    pub edition: Option<Edition>,
}

impl FileDescriptorProto {
    const NAME: u32 = 1;
    const PACKAGE: u32 = 2;
    const DEPENDENCY: u32 = 3;
    const MESSAGE_TYPE: u32 = 4;
    const ENUM_TYPE: u32 = 5;
    const EXTENSION: u32 = 7;
    const OPTIONS: u32 = 8;
    const SYNTAX: u32 = 12;
    const EDITION: u32 = 14;

    /// Return the edition this file uses, mapping the legacy `syntax` field
    /// to the equivalent edition.
    pub fn effective_edition(&self) -> Edition {
        match self.syntax.as_deref() {
            Some("proto3") => Edition::PROTO3,
            Some("editions") => self.edition.unwrap_or(Edition::EDITION_2023),
            _ => Edition::PROTO2,
        }
    }
}

impl DecodeMessage for FileDescriptorProto {
    fn decode_fields(fields: Fields<'_>) -> Result<Self, WireError> {
        let mut msg = Self::default();
        for field in fields {
            let field = field?;
            match field.number() {
                Self::NAME => msg.name = Some(field.read_string()?),
                Self::PACKAGE => msg.package = Some(field.read_string()?),
                Self::DEPENDENCY => msg.dependency.push(field.read_string()?),
                Self::MESSAGE_TYPE => msg
                    .message_type
                    .push(DescriptorProto::decode_field(&field)?),
                Self::ENUM_TYPE => msg
                    .enum_type
                    .push(EnumDescriptorProto::decode_field(&field)?),
                Self::EXTENSION => msg
                    .extension
                    .push(FieldDescriptorProto::decode_field(&field)?),
                Self::OPTIONS => {
                    let body = field.read_bytes()?;
                    msg.options = Some(FeatureOptions::decode_with(
                        Fields::new(body, Some("FileOptions")),
                        FeatureOptions::FILE_FEATURES,
                    )?);
                }
                Self::SYNTAX => msg.syntax = Some(field.read_string()?),
                Self::EDITION => msg.edition = Some(Edition(field.get_enum()?)),
                _ => {}
            }
        }
        Ok(msg)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FileDescriptorSet {
    pub file: Vec<FileDescriptorProto>,
}

impl FileDescriptorSet {
    const FILE: u32 = 1;
}

impl DecodeMessage for FileDescriptorSet {
    fn decode_fields(fields: Fields<'_>) -> Result<Self, WireError> {
        let mut msg = Self::default();
        for field in fields {
            let field = field?;
            if field.number() == Self::FILE {
                msg.file.push(FileDescriptorProto::decode_field(&field)?);
            }
        }
        Ok(msg)
    }
}
