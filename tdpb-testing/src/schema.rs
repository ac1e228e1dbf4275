use tdpb_wire::descriptor::{
    DescriptorProto, Edition, EnumDescriptorProto, EnumValueDescriptorProto, ExtensionRange,
    FeatureOptions, FeatureSet, FieldDescriptorProto, FieldLabel, FieldOptions, FieldType,
    FileDescriptorProto, FileDescriptorSet, MessageOptions, OneofDescriptorProto,
};

use crate::Wire;

/// Builder for descriptor sets containing a single file.
///
/// Type names passed to the builder may be relative (`"Inner"`) or fully
/// qualified (`".pkg.Inner"`).
///
/// ```
/// use tdpb_testing::SchemaBuilder;
/// use tdpb_wire::descriptor::FieldType;
///
/// let set = SchemaBuilder::proto3("test.proto")
///     .package("test")
///     .message("M", |m| m.field("x", 1, FieldType::INT32))
///     .build();
/// assert_eq!(set.file[0].message_type[0].field.len(), 1);
/// ```
#[derive(Clone, Debug)]
pub struct SchemaBuilder {
    file: FileDescriptorProto,
}

impl SchemaBuilder {
    fn new(name: &str, syntax: Option<&str>, edition: Option<Edition>) -> Self {
        Self {
            file: FileDescriptorProto {
                name: Some(name.to_string()),
                syntax: syntax.map(|s| s.to_string()),
                edition,
                ..Default::default()
            },
        }
    }

    pub fn proto2(name: &str) -> Self {
        Self::new(name, None, None)
    }

    pub fn proto3(name: &str) -> Self {
        Self::new(name, Some("proto3"), None)
    }

    pub fn edition(name: &str, edition: Edition) -> Self {
        Self::new(name, Some("editions"), Some(edition))
    }

    pub fn package(mut self, package: &str) -> Self {
        self.file.package = Some(package.to_string());
        self
    }

    /// Set file-level features.
    pub fn features(mut self, features: FeatureSet) -> Self {
        self.file.options = Some(FeatureOptions {
            features: Some(features),
        });
        self
    }

    pub fn message(mut self, name: &str, f: impl FnOnce(MessageBuilder) -> MessageBuilder) -> Self {
        let builder = MessageBuilder::new(name, self.is_proto3());
        self.file.message_type.push(f(builder).msg);
        self
    }

    pub fn enumeration(mut self, name: &str, values: &[(&str, i32)]) -> Self {
        self.file.enum_type.push(enum_proto(name, values));
        self
    }

    /// Declare an optional extension of `extendee`.
    pub fn extension(
        mut self,
        extendee: &str,
        name: &str,
        number: i32,
        ty: FieldType,
        type_name: Option<&str>,
    ) -> Self {
        let mut field = field_proto(name, number, FieldLabel::OPTIONAL, ty);
        field.extendee = Some(extendee.to_string());
        field.type_name = type_name.map(|t| t.to_string());
        self.file.extension.push(field);
        self
    }

    pub fn build(self) -> FileDescriptorSet {
        FileDescriptorSet {
            file: vec![self.file],
        }
    }

    /// Build the descriptor set and serialize it.
    pub fn build_bytes(self) -> Vec<u8> {
        encode_file_set(&self.build())
    }

    fn is_proto3(&self) -> bool {
        self.file.syntax.as_deref() == Some("proto3")
    }
}

/// Builder for a message type within a [`SchemaBuilder`].
#[derive(Clone, Debug)]
pub struct MessageBuilder {
    msg: DescriptorProto,
    proto3: bool,
}

impl MessageBuilder {
    fn new(name: &str, proto3: bool) -> Self {
        Self {
            msg: DescriptorProto {
                name: Some(name.to_string()),
                ..Default::default()
            },
            proto3,
        }
    }

    fn push(mut self, field: FieldDescriptorProto) -> Self {
        self.msg.field.push(field);
        self
    }

    /// Add a singular field. In proto3 files this has implicit presence.
    pub fn field(self, name: &str, number: i32, ty: FieldType) -> Self {
        self.push(field_proto(name, number, FieldLabel::OPTIONAL, ty))
    }

    /// Add a singular field with explicit presence.
    ///
    /// In proto3 files this is an `optional` field, which `protoc` represents
    /// as the only member of a synthetic oneof.
    pub fn optional(mut self, name: &str, number: i32, ty: FieldType) -> Self {
        let mut field = field_proto(name, number, FieldLabel::OPTIONAL, ty);
        if self.proto3 {
            field.proto3_optional = Some(true);
            field.oneof_index = Some(self.msg.oneof_decl.len() as i32);
            self.msg.oneof_decl.push(OneofDescriptorProto {
                name: Some(format!("_{}", name)),
            });
        }
        self.push(field)
    }

    pub fn required(self, name: &str, number: i32, ty: FieldType) -> Self {
        self.push(field_proto(name, number, FieldLabel::REQUIRED, ty))
    }

    pub fn repeated(self, name: &str, number: i32, ty: FieldType) -> Self {
        self.push(field_proto(name, number, FieldLabel::REPEATED, ty))
    }

    pub fn message_field(self, name: &str, number: i32, type_name: &str) -> Self {
        self.typed(name, number, FieldLabel::OPTIONAL, FieldType::MESSAGE, type_name)
    }

    pub fn repeated_message(self, name: &str, number: i32, type_name: &str) -> Self {
        self.typed(name, number, FieldLabel::REPEATED, FieldType::MESSAGE, type_name)
    }

    pub fn group_field(self, name: &str, number: i32, type_name: &str) -> Self {
        self.typed(name, number, FieldLabel::OPTIONAL, FieldType::GROUP, type_name)
    }

    pub fn enum_field(self, name: &str, number: i32, type_name: &str) -> Self {
        self.typed(name, number, FieldLabel::OPTIONAL, FieldType::ENUM, type_name)
    }

    pub fn repeated_enum(self, name: &str, number: i32, type_name: &str) -> Self {
        self.typed(name, number, FieldLabel::REPEATED, FieldType::ENUM, type_name)
    }

    fn typed(
        self,
        name: &str,
        number: i32,
        label: FieldLabel,
        ty: FieldType,
        type_name: &str,
    ) -> Self {
        let mut field = field_proto(name, number, label, ty);
        field.type_name = Some(type_name.to_string());
        self.push(field)
    }

    /// Add a map field with scalar values.
    pub fn map(self, name: &str, number: i32, key: FieldType, value: FieldType) -> Self {
        self.map_entry(name, number, key, value, None)
    }

    /// Add a map field whose values are messages or enums named `value_type`.
    pub fn map_of(
        self,
        name: &str,
        number: i32,
        key: FieldType,
        value: FieldType,
        value_type: &str,
    ) -> Self {
        self.map_entry(name, number, key, value, Some(value_type))
    }

    fn map_entry(
        mut self,
        name: &str,
        number: i32,
        key: FieldType,
        value: FieldType,
        value_type: Option<&str>,
    ) -> Self {
        let entry_name = format!("{}Entry", camel_case(name));
        let mut value_field = field_proto("value", 2, FieldLabel::OPTIONAL, value);
        value_field.type_name = value_type.map(|t| t.to_string());
        self.msg.nested_type.push(DescriptorProto {
            name: Some(entry_name.clone()),
            field: vec![field_proto("key", 1, FieldLabel::OPTIONAL, key), value_field],
            options: Some(MessageOptions {
                map_entry: Some(true),
                features: None,
            }),
            ..Default::default()
        });
        self.typed(name, number, FieldLabel::REPEATED, FieldType::MESSAGE, &entry_name)
    }

    /// Add a oneof. Fields added by `f` become its members.
    pub fn oneof(mut self, name: &str, f: impl FnOnce(MessageBuilder) -> MessageBuilder) -> Self {
        let index = self.msg.oneof_decl.len() as i32;
        self.msg.oneof_decl.push(OneofDescriptorProto {
            name: Some(name.to_string()),
        });
        let first_member = self.msg.field.len();
        let mut builder = f(self);
        for field in &mut builder.msg.field[first_member..] {
            field.oneof_index = Some(index);
        }
        builder
    }

    pub fn nested(mut self, name: &str, f: impl FnOnce(MessageBuilder) -> MessageBuilder) -> Self {
        let nested = f(MessageBuilder::new(name, self.proto3));
        self.msg.nested_type.push(nested.msg);
        self
    }

    pub fn nested_enum(mut self, name: &str, values: &[(&str, i32)]) -> Self {
        self.msg.enum_type.push(enum_proto(name, values));
        self
    }

    /// Declare the extension range `[start, end)`.
    pub fn extension_range(mut self, start: i32, end: i32) -> Self {
        self.msg.extension_range.push(ExtensionRange {
            start: Some(start),
            end: Some(end),
        });
        self
    }

    /// Modify the most recently added field.
    pub fn with_last(mut self, f: impl FnOnce(&mut FieldDescriptorProto)) -> Self {
        if let Some(field) = self.msg.field.last_mut() {
            f(field);
        }
        self
    }

    /// Set the `packed` option on the most recently added field.
    pub fn packed(self, packed: bool) -> Self {
        self.with_last(|field| {
            field.options.get_or_insert_with(FieldOptions::default).packed = Some(packed);
        })
    }

    /// Set the default value of the most recently added field.
    pub fn default_value(self, value: &str) -> Self {
        self.with_last(|field| field.default_value = Some(value.to_string()))
    }

    /// Set features on the most recently added field.
    pub fn field_features(self, features: FeatureSet) -> Self {
        self.with_last(|field| {
            field.options.get_or_insert_with(FieldOptions::default).features = Some(features);
        })
    }
}

fn field_proto(name: &str, number: i32, label: FieldLabel, ty: FieldType) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        label: Some(label),
        r#type: Some(ty),
        ..Default::default()
    }
}

fn enum_proto(name: &str, values: &[(&str, i32)]) -> EnumDescriptorProto {
    EnumDescriptorProto {
        name: Some(name.to_string()),
        value: values
            .iter()
            .map(|&(name, number)| EnumValueDescriptorProto {
                name: Some(name.to_string()),
                number: Some(number),
            })
            .collect(),
        options: None,
    }
}

/// Convert a field name such as `foo_bar` to `FooBar`.
fn camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for ch in name.chars() {
        if ch == '_' {
            upper = true;
        } else if upper {
            out.extend(ch.to_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Serialize a descriptor set in the format produced by
/// `protoc --descriptor_set_out`.
pub fn encode_file_set(set: &FileDescriptorSet) -> Vec<u8> {
    set.file
        .iter()
        .fold(Wire::new(), |w, file| w.message(1, |m| encode_file(m, file)))
        .finish()
}

fn opt_string(w: Wire, number: u32, val: &Option<String>) -> Wire {
    match val {
        Some(s) => w.string(number, s),
        None => w,
    }
}

fn opt_int(w: Wire, number: u32, val: Option<i32>) -> Wire {
    match val {
        Some(v) => w.int(number, v as i64),
        None => w,
    }
}

fn encode_features(w: Wire, f: &FeatureSet) -> Wire {
    let w = opt_int(w, 1, f.field_presence);
    let w = opt_int(w, 2, f.enum_type);
    let w = opt_int(w, 3, f.repeated_field_encoding);
    let w = opt_int(w, 4, f.utf8_validation);
    opt_int(w, 5, f.message_encoding)
}

fn encode_feature_options(w: Wire, number: u32, opts: &Option<FeatureOptions>, features_field: u32) -> Wire {
    match opts {
        Some(FeatureOptions { features }) => w.message(number, |o| match features {
            Some(f) => o.message(features_field, |fw| encode_features(fw, f)),
            None => o,
        }),
        None => w,
    }
}

fn encode_field(w: Wire, f: &FieldDescriptorProto) -> Wire {
    let w = opt_string(w, 1, &f.name);
    let w = opt_string(w, 2, &f.extendee);
    let w = opt_int(w, 3, f.number);
    let w = opt_int(w, 4, f.label.map(|l| l.0));
    let w = opt_int(w, 5, f.r#type.map(|t| t.0));
    let w = opt_string(w, 6, &f.type_name);
    let w = opt_string(w, 7, &f.default_value);
    let w = match &f.options {
        Some(opts) => w.message(8, |o| {
            let o = match opts.packed {
                Some(p) => o.bool(2, p),
                None => o,
            };
            match &opts.features {
                Some(features) => o.message(21, |fw| encode_features(fw, features)),
                None => o,
            }
        }),
        None => w,
    };
    let w = opt_int(w, 9, f.oneof_index);
    let w = opt_string(w, 10, &f.json_name);
    match f.proto3_optional {
        Some(p) => w.bool(17, p),
        None => w,
    }
}

fn encode_enum(w: Wire, e: &EnumDescriptorProto) -> Wire {
    let w = opt_string(w, 1, &e.name);
    let w = e.value.iter().fold(w, |w, v| {
        w.message(2, |vw| opt_int(opt_string(vw, 1, &v.name), 2, v.number))
    });
    encode_feature_options(w, 3, &e.options, 7)
}

fn encode_message(w: Wire, m: &DescriptorProto) -> Wire {
    let w = opt_string(w, 1, &m.name);
    let w = m.field.iter().fold(w, |w, f| w.message(2, |fw| encode_field(fw, f)));
    let w = m
        .nested_type
        .iter()
        .fold(w, |w, n| w.message(3, |nw| encode_message(nw, n)));
    let w = m.enum_type.iter().fold(w, |w, e| w.message(4, |ew| encode_enum(ew, e)));
    let w = m.extension_range.iter().fold(w, |w, r| {
        w.message(5, |rw| opt_int(opt_int(rw, 1, r.start), 2, r.end))
    });
    let w = m.extension.iter().fold(w, |w, f| w.message(6, |fw| encode_field(fw, f)));
    let w = match &m.options {
        Some(opts) => w.message(7, |o| {
            let o = match opts.map_entry {
                Some(v) => o.bool(7, v),
                None => o,
            };
            match &opts.features {
                Some(features) => o.message(12, |fw| encode_features(fw, features)),
                None => o,
            }
        }),
        None => w,
    };
    m.oneof_decl
        .iter()
        .fold(w, |w, o| w.message(8, |ow| opt_string(ow, 1, &o.name)))
}

fn encode_file(w: Wire, f: &FileDescriptorProto) -> Wire {
    let w = opt_string(w, 1, &f.name);
    let w = opt_string(w, 2, &f.package);
    let w = f.dependency.iter().fold(w, |w, d| w.string(3, d));
    let w = f
        .message_type
        .iter()
        .fold(w, |w, m| w.message(4, |mw| encode_message(mw, m)));
    let w = f.enum_type.iter().fold(w, |w, e| w.message(5, |ew| encode_enum(ew, e)));
    let w = f.extension.iter().fold(w, |w, e| w.message(7, |ew| encode_field(ew, e)));
    let w = encode_feature_options(w, 8, &f.options, 50);
    let w = opt_string(w, 12, &f.syntax);
    opt_int(w, 14, f.edition.map(|e| e.0))
}

#[cfg(test)]
mod tests {
    use tdpb_wire::DecodeMessage;
    use tdpb_wire::descriptor::{Edition, FeatureSet, FieldType, FileDescriptorSet};

    use super::{SchemaBuilder, camel_case};

    #[test]
    fn test_encode_decode_file_set() {
        let builder = SchemaBuilder::proto3("test.proto")
            .package("test")
            .enumeration("Color", &[("RED", 0), ("GREEN", 1)])
            .message("M", |m| {
                m.field("x", 1, FieldType::INT32)
                    .optional("y", 2, FieldType::STRING)
                    .map("counts", 3, FieldType::STRING, FieldType::INT64)
                    .oneof("choice", |o| {
                        o.field("a", 4, FieldType::BOOL)
                            .message_field("b", 5, "M")
                    })
                    .repeated("xs", 6, FieldType::INT32)
                    .packed(false)
            });
        let set = builder.clone().build();
        let decoded = FileDescriptorSet::decode(&builder.build_bytes()).unwrap();
        assert_eq!(decoded, set);

        let msg = &set.file[0].message_type[0];
        assert_eq!(msg.oneof_decl.len(), 2);
        assert_eq!(msg.field[1].oneof_index, Some(0));
        assert_eq!(msg.field[3].oneof_index, Some(1));
        assert_eq!(msg.nested_type[0].name.as_deref(), Some("CountsEntry"));
    }

    #[test]
    fn test_encode_editions_features() {
        let builder = SchemaBuilder::edition("e.proto", Edition::EDITION_2023)
            .features(FeatureSet {
                field_presence: Some(FeatureSet::PRESENCE_IMPLICIT),
                ..Default::default()
            })
            .message("M", |m| {
                m.field("x", 1, FieldType::INT32).field_features(FeatureSet {
                    field_presence: Some(FeatureSet::PRESENCE_EXPLICIT),
                    ..Default::default()
                })
            });
        let set = builder.clone().build();
        let decoded = FileDescriptorSet::decode(&builder.build_bytes()).unwrap();
        assert_eq!(decoded, set);
        assert_eq!(decoded.file[0].effective_edition(), Edition::EDITION_2023);
    }

    #[test]
    fn test_camel_case() {
        assert_eq!(camel_case("m"), "M");
        assert_eq!(camel_case("foo_bar"), "FooBar");
    }
}
