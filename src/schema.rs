//! Resolved and validated message schemas.
//!
//! A [`DescriptorPool`] is built from a [`FileDescriptorSet`]. Building the
//! pool resolves type names, applies the presence, packing and UTF-8 rules of
//! each file's syntax or edition, and rejects descriptors which are not
//! structurally valid. The resulting [`MessageDescriptor`],
//! [`FieldDescriptor`] and [`EnumDescriptor`] handles are cheap to clone and
//! are the input to [`compile`](crate::compile).

use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::RefUnwindSafe;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tdpb_wire::DecodeMessage;
use tdpb_wire::cursor::MAX_FIELD_NUMBER;
use tdpb_wire::descriptor::{
    DescriptorProto, Edition, EnumDescriptorProto, FeatureSet, FieldDescriptorProto, FieldLabel,
    FieldType, FileDescriptorProto, FileDescriptorSet,
};

use crate::errors::{CompileError, schema_error};

/// Field numbers reserved for the Protocol Buffers implementation.
const RESERVED_NUMBERS: std::ops::RangeInclusive<u32> = 19000..=19999;

/// Type of a field's value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Double,
    Float,
    Int64,
    Uint64,
    Int32,
    Fixed64,
    Fixed32,
    Bool,
    String,
    Bytes,
    Uint32,
    Sfixed32,
    Sfixed64,
    Sint32,
    Sint64,
    Enum,
    Message,
    Group,
}

impl Kind {
    fn from_field_type(ty: FieldType) -> Option<Kind> {
        let kind = match ty {
            FieldType::DOUBLE => Kind::Double,
            FieldType::FLOAT => Kind::Float,
            FieldType::INT64 => Kind::Int64,
            FieldType::UINT64 => Kind::Uint64,
            FieldType::INT32 => Kind::Int32,
            FieldType::FIXED64 => Kind::Fixed64,
            FieldType::FIXED32 => Kind::Fixed32,
            FieldType::BOOL => Kind::Bool,
            FieldType::STRING => Kind::String,
            FieldType::GROUP => Kind::Group,
            FieldType::MESSAGE => Kind::Message,
            FieldType::BYTES => Kind::Bytes,
            FieldType::UINT32 => Kind::Uint32,
            FieldType::ENUM => Kind::Enum,
            FieldType::SFIXED32 => Kind::Sfixed32,
            FieldType::SFIXED64 => Kind::Sfixed64,
            FieldType::SINT32 => Kind::Sint32,
            FieldType::SINT64 => Kind::Sint64,
            _ => return None,
        };
        Some(kind)
    }

    /// Return true if repeated fields of this kind may use the packed
    /// encoding.
    pub fn is_packable(self) -> bool {
        !matches!(self, Kind::String | Kind::Bytes | Kind::Message | Kind::Group)
    }

    /// Return true for message and group kinds.
    pub fn is_message(self) -> bool {
        matches!(self, Kind::Message | Kind::Group)
    }

    /// Name of the kind as written in `.proto` files.
    pub fn name(self) -> &'static str {
        match self {
            Kind::Double => "double",
            Kind::Float => "float",
            Kind::Int64 => "int64",
            Kind::Uint64 => "uint64",
            Kind::Int32 => "int32",
            Kind::Fixed64 => "fixed64",
            Kind::Fixed32 => "fixed32",
            Kind::Bool => "bool",
            Kind::String => "string",
            Kind::Bytes => "bytes",
            Kind::Uint32 => "uint32",
            Kind::Sfixed32 => "sfixed32",
            Kind::Sfixed64 => "sfixed64",
            Kind::Sint32 => "sint32",
            Kind::Sint64 => "sint64",
            Kind::Enum => "enum",
            Kind::Message => "message",
            Kind::Group => "group",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Cardinality {
    Optional,
    Required,
    Repeated,
}

/// Declared default of a singular field.
#[derive(Clone, Debug, PartialEq)]
pub enum DefaultValue {
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    Enum(i32),
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Syntax {
    Proto2,
    Proto3,
    Editions,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum TypeRef {
    Message(usize),
    Enum(usize),
}

#[derive(Debug)]
struct FieldInfo {
    name: String,
    full_name: String,
    json_name: Option<String>,
    number: u32,
    kind: Kind,
    cardinality: Cardinality,
    explicit_presence: bool,
    packed: bool,
    validate_utf8: bool,

    /// Index of the containing non-synthetic oneof.
    oneof: Option<usize>,

    /// Containing message, or the extended message for extensions.
    containing: usize,
    is_extension: bool,

    message_type: Option<usize>,
    enum_type: Option<usize>,
    default: Option<DefaultValue>,
}

#[derive(Debug)]
struct OneofInfo {
    name: String,
    fields: Vec<usize>,
}

#[derive(Debug)]
struct MessageInfo {
    name: String,
    full_name: String,
    fields: Vec<usize>,
    oneofs: Vec<OneofInfo>,

    /// Extension ranges as half-open `[start, end)` pairs.
    extension_ranges: Vec<(u32, u32)>,
    map_entry: bool,

    /// Extension fields which extend this message.
    extensions: Vec<usize>,
}

#[derive(Debug)]
struct EnumInfo {
    name: String,
    full_name: String,
    values: Vec<(String, i32)>,
    closed: bool,
}

#[derive(Debug, Default)]
struct PoolInner {
    messages: Vec<MessageInfo>,
    enums: Vec<EnumInfo>,
    fields: Vec<FieldInfo>,
    names: FxHashMap<String, TypeRef>,
}

impl PoolInner {
    /// Resolve a type name as written in a descriptor, relative to `scope`.
    ///
    /// Names starting with "." are fully qualified. Other names are searched
    /// for in `scope` and then each enclosing scope.
    fn resolve(&self, name: &str, scope: &str) -> Option<TypeRef> {
        if let Some(full) = name.strip_prefix('.') {
            return self.names.get(full).copied();
        }
        let mut scope = scope;
        loop {
            let found = if scope.is_empty() {
                self.names.get(name)
            } else {
                self.names.get(&format!("{}.{}", scope, name))
            };
            if let Some(found) = found {
                return Some(*found);
            }
            if scope.is_empty() {
                return None;
            }
            scope = scope.rfind('.').map(|i| &scope[..i]).unwrap_or("");
        }
    }
}

/// A set of resolved message and enum types.
#[derive(Clone, Debug)]
pub struct DescriptorPool {
    inner: Arc<PoolInner>,
}

impl DescriptorPool {
    /// Build a pool from the files in `set`.
    ///
    /// Files may appear in any order. All type references must resolve to
    /// types defined somewhere in the set.
    pub fn new(set: &FileDescriptorSet) -> Result<DescriptorPool, CompileError> {
        let inner = PoolBuilder::default().build(set)?;
        Ok(DescriptorPool {
            inner: Arc::new(inner),
        })
    }

    /// Decode a serialized `FileDescriptorSet` and build a pool from it.
    pub fn decode(bytes: &[u8]) -> Result<DescriptorPool, CompileError> {
        let set = FileDescriptorSet::decode(bytes)?;
        Self::new(&set)
    }

    /// Look up a message by its fully qualified name. A leading "." is
    /// optional.
    pub fn get_message(&self, name: &str) -> Option<MessageDescriptor> {
        let name = name.strip_prefix('.').unwrap_or(name);
        match self.inner.names.get(name) {
            Some(TypeRef::Message(index)) => Some(MessageDescriptor {
                pool: self.inner.clone(),
                index: *index,
            }),
            _ => None,
        }
    }

    /// Look up an enum by its fully qualified name.
    pub fn get_enum(&self, name: &str) -> Option<EnumDescriptor> {
        let name = name.strip_prefix('.').unwrap_or(name);
        match self.inner.names.get(name) {
            Some(TypeRef::Enum(index)) => Some(EnumDescriptor {
                pool: self.inner.clone(),
                index: *index,
            }),
            _ => None,
        }
    }

    /// Iterate over all message types in the pool, including map entries.
    pub fn messages(&self) -> impl ExactSizeIterator<Item = MessageDescriptor> + '_ {
        (0..self.inner.messages.len()).map(|index| MessageDescriptor {
            pool: self.inner.clone(),
            index,
        })
    }

    /// Iterate over all extension fields declared in the pool.
    pub fn extensions(&self) -> impl Iterator<Item = FieldDescriptor> + '_ {
        self.inner
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_extension)
            .map(|(index, _)| FieldDescriptor {
                pool: self.inner.clone(),
                index,
            })
    }
}

/// Lookup of extension fields, used when compiling a message type that
/// declares extension ranges.
///
/// Resolvers are shared by compiled types, which can be used from any thread.
pub trait ExtensionResolver: Send + Sync + RefUnwindSafe {
    /// Return the extensions of `extendee` that compiled types should decode.
    fn extensions_of(&self, extendee: &MessageDescriptor) -> Vec<FieldDescriptor>;

    /// Find the extension of `extendee` with field number `number`.
    fn find_extension(&self, extendee: &MessageDescriptor, number: u32) -> Option<FieldDescriptor> {
        self.extensions_of(extendee)
            .into_iter()
            .find(|ext| ext.number() == number)
    }
}

impl ExtensionResolver for DescriptorPool {
    fn extensions_of(&self, extendee: &MessageDescriptor) -> Vec<FieldDescriptor> {
        let local = if Arc::ptr_eq(&extendee.pool, &self.inner) {
            Some(extendee.clone())
        } else {
            self.get_message(extendee.full_name())
        };
        let Some(local) = local else {
            return Vec::new();
        };
        local.info()
            .extensions
            .iter()
            .map(|&index| FieldDescriptor {
                pool: self.inner.clone(),
                index,
            })
            .collect()
    }
}

/// Identity of a descriptor handle, used to memoize compiled types.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct DescKey(usize, usize);

macro_rules! impl_handle_identity {
    ($type:ident) => {
        impl PartialEq for $type {
            fn eq(&self, other: &Self) -> bool {
                Arc::ptr_eq(&self.pool, &other.pool) && self.index == other.index
            }
        }

        impl Eq for $type {}

        impl Hash for $type {
            fn hash<H: Hasher>(&self, state: &mut H) {
                (Arc::as_ptr(&self.pool) as usize).hash(state);
                self.index.hash(state);
            }
        }
    };
}

/// Handle to a message type in a [`DescriptorPool`].
#[derive(Clone)]
pub struct MessageDescriptor {
    pool: Arc<PoolInner>,
    index: usize,
}

impl_handle_identity!(MessageDescriptor);

impl MessageDescriptor {
    fn info(&self) -> &MessageInfo {
        &self.pool.messages[self.index]
    }

    pub(crate) fn key(&self) -> DescKey {
        DescKey(Arc::as_ptr(&self.pool) as usize, self.index)
    }

    pub fn name(&self) -> &str {
        &self.info().name
    }

    /// Fully qualified name, without a leading ".".
    pub fn full_name(&self) -> &str {
        &self.info().full_name
    }

    /// Iterate over fields in declaration order. Extensions are not included.
    pub fn fields(&self) -> impl ExactSizeIterator<Item = FieldDescriptor> + '_ {
        self.info().fields.iter().map(|&index| FieldDescriptor {
            pool: self.pool.clone(),
            index,
        })
    }

    pub fn get_field_by_number(&self, number: u32) -> Option<FieldDescriptor> {
        self.fields().find(|f| f.number() == number)
    }

    pub fn get_field_by_name(&self, name: &str) -> Option<FieldDescriptor> {
        self.fields().find(|f| f.name() == name)
    }

    /// Iterate over oneofs. Synthetic oneofs of proto3 `optional` fields are
    /// not included.
    pub fn oneofs(&self) -> impl ExactSizeIterator<Item = OneofDescriptor> + '_ {
        (0..self.info().oneofs.len()).map(|index| OneofDescriptor {
            pool: self.pool.clone(),
            message: self.index,
            index,
        })
    }

    /// Return true if this is the synthetic entry type of a map field.
    pub fn is_map_entry(&self) -> bool {
        self.info().map_entry
    }

    /// Return the declared extension ranges as half-open `[start, end)`
    /// pairs.
    pub fn extension_ranges(&self) -> &[(u32, u32)] {
        &self.info().extension_ranges
    }

    /// Return true if `number` lies in one of the extension ranges.
    pub fn is_extension_number(&self, number: u32) -> bool {
        self.extension_ranges()
            .iter()
            .any(|&(start, end)| number >= start && number < end)
    }

    pub fn pool(&self) -> DescriptorPool {
        DescriptorPool {
            inner: self.pool.clone(),
        }
    }
}

impl fmt::Debug for MessageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageDescriptor({})", self.full_name())
    }
}

/// Handle to a field or extension in a [`DescriptorPool`].
#[derive(Clone)]
pub struct FieldDescriptor {
    pool: Arc<PoolInner>,
    index: usize,
}

impl_handle_identity!(FieldDescriptor);

impl FieldDescriptor {
    fn info(&self) -> &FieldInfo {
        &self.pool.fields[self.index]
    }

    pub fn name(&self) -> &str {
        &self.info().name
    }

    pub fn full_name(&self) -> &str {
        &self.info().full_name
    }

    pub fn json_name(&self) -> Option<&str> {
        self.info().json_name.as_deref()
    }

    pub fn number(&self) -> u32 {
        self.info().number
    }

    pub fn kind(&self) -> Kind {
        self.info().kind
    }

    pub fn cardinality(&self) -> Cardinality {
        self.info().cardinality
    }

    /// Return true for repeated fields that are not maps.
    pub fn is_list(&self) -> bool {
        self.cardinality() == Cardinality::Repeated && !self.is_map()
    }

    pub fn is_map(&self) -> bool {
        self.cardinality() == Cardinality::Repeated
            && self
                .message_type()
                .is_some_and(|msg| msg.is_map_entry())
    }

    /// Return true if the field tracks whether it was set, separately from
    /// its value.
    pub fn has_presence(&self) -> bool {
        self.info().explicit_presence
    }

    /// Return true if this repeated field is written using the packed
    /// encoding. Decoding accepts both encodings either way.
    pub fn is_packed(&self) -> bool {
        self.info().packed
    }

    /// Return true if string values must be valid UTF-8.
    pub fn validates_utf8(&self) -> bool {
        self.info().validate_utf8
    }

    pub fn is_extension(&self) -> bool {
        self.info().is_extension
    }

    /// Return the message containing this field, or the extended message for
    /// an extension.
    pub fn containing_message(&self) -> MessageDescriptor {
        MessageDescriptor {
            pool: self.pool.clone(),
            index: self.info().containing,
        }
    }

    pub fn containing_oneof(&self) -> Option<OneofDescriptor> {
        let info = self.info();
        info.oneof.map(|index| OneofDescriptor {
            pool: self.pool.clone(),
            message: info.containing,
            index,
        })
    }

    /// Return the type of a message or group field.
    pub fn message_type(&self) -> Option<MessageDescriptor> {
        self.info().message_type.map(|index| MessageDescriptor {
            pool: self.pool.clone(),
            index,
        })
    }

    /// Return the type of an enum field.
    pub fn enum_type(&self) -> Option<EnumDescriptor> {
        self.info().enum_type.map(|index| EnumDescriptor {
            pool: self.pool.clone(),
            index,
        })
    }

    /// Return the declared default, or the first value of an enum field's
    /// type if no default was declared.
    pub fn default_value(&self) -> Option<&DefaultValue> {
        self.info().default.as_ref()
    }

    /// Return the key field of a map field's entry type.
    pub fn map_key(&self) -> Option<FieldDescriptor> {
        self.map_entry_field(1)
    }

    /// Return the value field of a map field's entry type.
    pub fn map_value(&self) -> Option<FieldDescriptor> {
        self.map_entry_field(2)
    }

    fn map_entry_field(&self, number: u32) -> Option<FieldDescriptor> {
        if !self.is_map() {
            return None;
        }
        self.message_type()?.get_field_by_number(number)
    }
}

impl fmt::Debug for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldDescriptor({} = {})", self.full_name(), self.number())
    }
}

/// Handle to a oneof in a [`DescriptorPool`].
#[derive(Clone)]
pub struct OneofDescriptor {
    pool: Arc<PoolInner>,
    message: usize,
    index: usize,
}

impl OneofDescriptor {
    fn info(&self) -> &OneofInfo {
        &self.pool.messages[self.message].oneofs[self.index]
    }

    pub fn name(&self) -> &str {
        &self.info().name
    }

    /// Position of this oneof among the containing message's oneofs.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn fields(&self) -> impl ExactSizeIterator<Item = FieldDescriptor> + '_ {
        self.info().fields.iter().map(|&index| FieldDescriptor {
            pool: self.pool.clone(),
            index,
        })
    }
}

impl PartialEq for OneofDescriptor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.pool, &other.pool)
            && self.message == other.message
            && self.index == other.index
    }
}

impl fmt::Debug for OneofDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OneofDescriptor({})", self.name())
    }
}

/// Handle to an enum type in a [`DescriptorPool`].
#[derive(Clone)]
pub struct EnumDescriptor {
    pool: Arc<PoolInner>,
    index: usize,
}

impl_handle_identity!(EnumDescriptor);

impl EnumDescriptor {
    fn info(&self) -> &EnumInfo {
        &self.pool.enums[self.index]
    }

    pub fn name(&self) -> &str {
        &self.info().name
    }

    pub fn full_name(&self) -> &str {
        &self.info().full_name
    }

    /// Iterate over `(name, number)` pairs in declaration order.
    pub fn values(&self) -> impl ExactSizeIterator<Item = (&str, i32)> + '_ {
        self.info().values.iter().map(|(name, n)| (name.as_str(), *n))
    }

    /// Return the name of the first value with the given number.
    pub fn value_name(&self, number: i32) -> Option<&str> {
        self.values().find(|(_, n)| *n == number).map(|(name, _)| name)
    }

    pub fn value_by_name(&self, name: &str) -> Option<i32> {
        self.values().find(|(n, _)| *n == name).map(|(_, number)| number)
    }

    /// Return true if values outside the declared set are treated as unknown
    /// fields when decoding.
    pub fn is_closed(&self) -> bool {
        self.info().closed
    }
}

impl fmt::Debug for EnumDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnumDescriptor({})", self.full_name())
    }
}

/// Defaults of editions features for the 2023 edition.
fn edition_defaults() -> FeatureSet {
    FeatureSet {
        field_presence: Some(FeatureSet::PRESENCE_EXPLICIT),
        enum_type: Some(FeatureSet::ENUM_OPEN),
        repeated_field_encoding: Some(FeatureSet::ENCODING_PACKED),
        utf8_validation: Some(FeatureSet::UTF8_VERIFY),
        message_encoding: Some(FeatureSet::MESSAGE_LENGTH_PREFIXED),
    }
}

fn merge_features(features: Option<&FeatureSet>, parent: &FeatureSet) -> FeatureSet {
    match features {
        Some(f) => f.inherit(parent),
        None => parent.clone(),
    }
}

/// Context in which a field or nested type is declared.
#[derive(Clone)]
struct Scope {
    syntax: Syntax,
    features: FeatureSet,

    /// Fully qualified name of the enclosing message or package.
    name: String,
}

struct PendingMessage<'a> {
    proto: &'a DescriptorProto,
    scope: Scope,
    index: usize,
}

struct PendingExtension<'a> {
    proto: &'a FieldDescriptorProto,
    scope: Scope,
}

#[derive(Default)]
struct PoolBuilder {
    inner: PoolInner,
}

impl PoolBuilder {
    fn build(mut self, set: &FileDescriptorSet) -> Result<PoolInner, CompileError> {
        let mut messages = Vec::new();
        let mut extensions = Vec::new();

        for file in &set.file {
            self.register_file(file, &mut messages, &mut extensions)?;
        }
        for pending in &messages {
            self.add_fields(pending)?;
        }
        for ext in &extensions {
            self.add_extension(ext)?;
        }
        self.validate_maps()?;

        Ok(self.inner)
    }

    fn register_name(&mut self, full_name: &str, ty: TypeRef) -> Result<(), CompileError> {
        if self.inner.names.insert(full_name.to_string(), ty).is_some() {
            return Err(schema_error!("duplicate type name \"{}\"", full_name));
        }
        Ok(())
    }

    fn register_file<'a>(
        &mut self,
        file: &'a FileDescriptorProto,
        messages: &mut Vec<PendingMessage<'a>>,
        extensions: &mut Vec<PendingExtension<'a>>,
    ) -> Result<(), CompileError> {
        let (syntax, features) = match file.effective_edition() {
            Edition::PROTO2 => (Syntax::Proto2, FeatureSet::default()),
            Edition::PROTO3 => (Syntax::Proto3, FeatureSet::default()),
            _ => {
                let file_features = file.options.as_ref().and_then(|o| o.features.as_ref());
                (
                    Syntax::Editions,
                    merge_features(file_features, &edition_defaults()),
                )
            }
        };
        let scope = Scope {
            syntax,
            features,
            name: file.package.clone().unwrap_or_default(),
        };

        for proto in &file.enum_type {
            self.register_enum(proto, &scope)?;
        }
        for proto in &file.message_type {
            self.register_message(proto, &scope, messages, extensions)?;
        }
        for proto in &file.extension {
            extensions.push(PendingExtension {
                proto,
                scope: scope.clone(),
            });
        }
        Ok(())
    }

    fn register_enum(&mut self, proto: &EnumDescriptorProto, scope: &Scope) -> Result<(), CompileError> {
        let name = proto
            .name
            .clone()
            .ok_or_else(|| schema_error!("enum in \"{}\" has no name", scope.name))?;
        let full_name = qualify(&scope.name, &name);
        if proto.value.is_empty() {
            return Err(schema_error!("enum \"{}\" has no values", full_name));
        }
        let closed = match scope.syntax {
            Syntax::Proto2 => true,
            Syntax::Proto3 => false,
            Syntax::Editions => {
                let features = proto.options.as_ref().and_then(|o| o.features.as_ref());
                merge_features(features, &scope.features).enum_type
                    == Some(FeatureSet::ENUM_CLOSED)
            }
        };
        let mut values = Vec::with_capacity(proto.value.len());
        for value in &proto.value {
            let (Some(name), Some(number)) = (&value.name, value.number) else {
                return Err(schema_error!("enum \"{}\" has an incomplete value", full_name));
            };
            values.push((name.clone(), number));
        }
        if !closed && values[0].1 != 0 {
            return Err(schema_error!(
                "first value of open enum \"{}\" must be zero",
                full_name
            ));
        }

        let index = self.inner.enums.len();
        self.register_name(&full_name, TypeRef::Enum(index))?;
        self.inner.enums.push(EnumInfo {
            name,
            full_name,
            values,
            closed,
        });
        Ok(())
    }

    fn register_message<'a>(
        &mut self,
        proto: &'a DescriptorProto,
        parent: &Scope,
        messages: &mut Vec<PendingMessage<'a>>,
        extensions: &mut Vec<PendingExtension<'a>>,
    ) -> Result<(), CompileError> {
        let name = proto
            .name
            .clone()
            .ok_or_else(|| schema_error!("message in \"{}\" has no name", parent.name))?;
        let full_name = qualify(&parent.name, &name);

        let options = proto.options.as_ref();
        let features = match parent.syntax {
            Syntax::Editions => {
                merge_features(options.and_then(|o| o.features.as_ref()), &parent.features)
            }
            _ => FeatureSet::default(),
        };

        let mut extension_ranges = Vec::with_capacity(proto.extension_range.len());
        for range in &proto.extension_range {
            let (Some(start), Some(end)) = (range.start, range.end) else {
                return Err(schema_error!("incomplete extension range in \"{}\"", full_name));
            };
            if start < 1 || end <= start || end as u32 > MAX_FIELD_NUMBER + 1 {
                return Err(schema_error!(
                    "invalid extension range {}..{} in \"{}\"",
                    start,
                    end,
                    full_name
                ));
            }
            extension_ranges.push((start as u32, end as u32));
        }

        let index = self.inner.messages.len();
        self.register_name(&full_name, TypeRef::Message(index))?;
        self.inner.messages.push(MessageInfo {
            name,
            full_name: full_name.clone(),
            fields: Vec::new(),
            oneofs: Vec::new(),
            extension_ranges,
            map_entry: options.and_then(|o| o.map_entry).unwrap_or(false),
            extensions: Vec::new(),
        });

        let scope = Scope {
            syntax: parent.syntax,
            features,
            name: full_name,
        };
        for nested in &proto.enum_type {
            self.register_enum(nested, &scope)?;
        }
        for nested in &proto.nested_type {
            self.register_message(nested, &scope, messages, extensions)?;
        }
        for ext in &proto.extension {
            extensions.push(PendingExtension {
                proto: ext,
                scope: scope.clone(),
            });
        }
        messages.push(PendingMessage {
            proto,
            scope,
            index,
        });
        Ok(())
    }

    fn add_fields(&mut self, pending: &PendingMessage) -> Result<(), CompileError> {
        let proto = pending.proto;
        let scope = &pending.scope;

        // Oneofs whose members are all proto3 `optional` fields are synthetic.
        // Their members are ordinary fields with explicit presence.
        let mut oneof_map: Vec<Option<usize>> = vec![None; proto.oneof_decl.len()];
        let mut oneofs = Vec::new();
        for (i, decl) in proto.oneof_decl.iter().enumerate() {
            let synthetic = proto
                .field
                .iter()
                .filter(|f| f.oneof_index == Some(i as i32))
                .all(|f| f.proto3_optional == Some(true));
            if !synthetic {
                oneof_map[i] = Some(oneofs.len());
                oneofs.push(OneofInfo {
                    name: decl.name.clone().unwrap_or_default(),
                    fields: Vec::new(),
                });
            }
        }

        let mut numbers = FxHashMap::default();
        let mut field_ids = Vec::with_capacity(proto.field.len());
        for field_proto in &proto.field {
            let mut info = self.resolve_field(field_proto, scope, pending.index)?;

            if let Some(oneof_index) = field_proto.oneof_index {
                let slot = oneof_map
                    .get(oneof_index as usize)
                    .filter(|_| oneof_index >= 0)
                    .ok_or_else(|| {
                        schema_error!("field \"{}\" has invalid oneof index", info.full_name)
                    })?;
                if let Some(slot) = *slot {
                    if info.cardinality != Cardinality::Optional {
                        return Err(schema_error!(
                            "oneof member \"{}\" must be singular",
                            info.full_name
                        ));
                    }
                    info.oneof = Some(slot);
                    info.explicit_presence = true;
                    oneofs[slot].fields.push(self.inner.fields.len());
                }
            }

            if let Some(prev) = numbers.insert(info.number, info.name.clone()) {
                return Err(schema_error!(
                    "fields \"{}\" and \"{}\" in \"{}\" share number {}",
                    prev,
                    info.name,
                    scope.name,
                    info.number
                ));
            }
            if self.inner.messages[pending.index].is_extension_number(info.number) {
                return Err(schema_error!(
                    "field \"{}\" uses number {} from an extension range",
                    info.full_name,
                    info.number
                ));
            }

            field_ids.push(self.inner.fields.len());
            self.inner.fields.push(info);
        }

        let msg = &mut self.inner.messages[pending.index];
        msg.fields = field_ids;
        msg.oneofs = oneofs;
        Ok(())
    }

    fn add_extension(&mut self, pending: &PendingExtension) -> Result<(), CompileError> {
        let proto = pending.proto;
        let extendee_name = proto
            .extendee
            .as_deref()
            .ok_or_else(|| schema_error!("extension in \"{}\" has no extendee", pending.scope.name))?;
        let extendee = match self.inner.resolve(extendee_name, &pending.scope.name) {
            Some(TypeRef::Message(index)) => index,
            _ => {
                return Err(schema_error!(
                    "extendee \"{}\" is not a known message",
                    extendee_name
                ));
            }
        };

        let mut info = self.resolve_field(proto, &pending.scope, extendee)?;
        info.is_extension = true;
        if info.cardinality == Cardinality::Required {
            return Err(schema_error!("extension \"{}\" cannot be required", info.full_name));
        }
        if info.cardinality != Cardinality::Repeated {
            info.explicit_presence = true;
        }
        let msg = &self.inner.messages[extendee];
        if !msg.is_extension_number(info.number) {
            return Err(schema_error!(
                "extension \"{}\" number {} is outside the extension ranges of \"{}\"",
                info.full_name,
                info.number,
                msg.full_name
            ));
        }
        let duplicate = msg
            .extensions
            .iter()
            .any(|&id| self.inner.fields[id].number == info.number);
        if duplicate {
            return Err(schema_error!(
                "duplicate extension number {} for \"{}\"",
                info.number,
                msg.full_name
            ));
        }

        let id = self.inner.fields.len();
        self.inner.fields.push(info);
        self.inner.messages[extendee].extensions.push(id);
        Ok(())
    }

    fn resolve_field(
        &self,
        proto: &FieldDescriptorProto,
        scope: &Scope,
        containing: usize,
    ) -> Result<FieldInfo, CompileError> {
        let name = proto
            .name
            .clone()
            .ok_or_else(|| schema_error!("field in \"{}\" has no name", scope.name))?;
        let full_name = qualify(&scope.name, &name);

        let number = proto
            .number
            .filter(|&n| n >= 1 && n as u32 <= MAX_FIELD_NUMBER)
            .ok_or_else(|| schema_error!("field \"{}\" has an invalid number", full_name))?
            as u32;
        if RESERVED_NUMBERS.contains(&number) {
            return Err(schema_error!(
                "field \"{}\" uses reserved number {}",
                full_name,
                number
            ));
        }

        let options = proto.options.as_ref();
        let features = match scope.syntax {
            Syntax::Editions => {
                merge_features(options.and_then(|o| o.features.as_ref()), &scope.features)
            }
            _ => FeatureSet::default(),
        };

        // Resolve the referenced type, if any, and check it agrees with the
        // declared kind.
        let type_ref = match proto.type_name.as_deref() {
            Some(type_name) => Some(self.inner.resolve(type_name, &scope.name).ok_or_else(|| {
                schema_error!("field \"{}\" has unknown type \"{}\"", full_name, type_name)
            })?),
            None => None,
        };
        let mut kind = match (proto.r#type, type_ref) {
            (Some(ty), _) => Kind::from_field_type(ty).ok_or_else(|| {
                schema_error!("field \"{}\" has invalid type {}", full_name, ty.0)
            })?,
            (None, Some(TypeRef::Message(_))) => Kind::Message,
            (None, Some(TypeRef::Enum(_))) => Kind::Enum,
            (None, None) => return Err(schema_error!("field \"{}\" has no type", full_name)),
        };
        let (message_type, enum_type) = match (kind, type_ref) {
            (Kind::Message | Kind::Group, Some(TypeRef::Message(index))) => (Some(index), None),
            (Kind::Enum, Some(TypeRef::Enum(index))) => (None, Some(index)),
            (Kind::Message | Kind::Group | Kind::Enum, _) => {
                return Err(schema_error!(
                    "field \"{}\" of kind {} does not reference a matching type",
                    full_name,
                    kind.name()
                ));
            }
            (_, None) => (None, None),
            (_, Some(_)) => {
                return Err(schema_error!(
                    "scalar field \"{}\" must not have a type name",
                    full_name
                ));
            }
        };
        if scope.syntax == Syntax::Editions
            && kind == Kind::Message
            && features.message_encoding == Some(FeatureSet::MESSAGE_DELIMITED)
        {
            kind = Kind::Group;
        }

        let label = proto.label.unwrap_or(FieldLabel::OPTIONAL);
        let cardinality = match label {
            FieldLabel::REPEATED => Cardinality::Repeated,
            FieldLabel::REQUIRED => Cardinality::Required,
            FieldLabel::OPTIONAL
                if scope.syntax == Syntax::Editions
                    && features.field_presence == Some(FeatureSet::PRESENCE_LEGACY_REQUIRED) =>
            {
                Cardinality::Required
            }
            FieldLabel::OPTIONAL => Cardinality::Optional,
            _ => {
                return Err(schema_error!(
                    "field \"{}\" has invalid label {}",
                    full_name,
                    label.0
                ));
            }
        };
        if cardinality == Cardinality::Required && scope.syntax == Syntax::Proto3 {
            return Err(schema_error!("proto3 field \"{}\" cannot be required", full_name));
        }

        let explicit_presence = match cardinality {
            Cardinality::Repeated => false,
            _ if kind.is_message() => true,
            _ => match scope.syntax {
                Syntax::Proto2 => true,
                Syntax::Proto3 => proto.proto3_optional == Some(true),
                Syntax::Editions => {
                    features.field_presence != Some(FeatureSet::PRESENCE_IMPLICIT)
                }
            },
        };

        let packed_option = options.and_then(|o| o.packed);
        if packed_option.is_some() && !(cardinality == Cardinality::Repeated && kind.is_packable())
        {
            return Err(schema_error!(
                "\"packed\" is only valid for repeated scalar fields (\"{}\")",
                full_name
            ));
        }
        let packed = cardinality == Cardinality::Repeated
            && kind.is_packable()
            && match scope.syntax {
                Syntax::Proto2 => packed_option == Some(true),
                Syntax::Proto3 => packed_option != Some(false),
                Syntax::Editions => packed_option.unwrap_or(
                    features.repeated_field_encoding != Some(FeatureSet::ENCODING_EXPANDED),
                ),
            };

        let validate_utf8 = kind == Kind::String
            && match scope.syntax {
                Syntax::Proto2 => false,
                Syntax::Proto3 => true,
                Syntax::Editions => features.utf8_validation != Some(FeatureSet::UTF8_NONE),
            };

        let default = match (&proto.default_value, cardinality) {
            (Some(_), Cardinality::Repeated) => {
                return Err(schema_error!(
                    "repeated field \"{}\" cannot have a default",
                    full_name
                ));
            }
            (Some(_), _) if scope.syntax == Syntax::Proto3 => {
                return Err(schema_error!(
                    "proto3 field \"{}\" cannot have a default",
                    full_name
                ));
            }
            (Some(text), _) => Some(self.parse_default(text, kind, enum_type, &full_name)?),
            (None, Cardinality::Repeated) => None,
            (None, _) => enum_type.map(|e| DefaultValue::Enum(self.inner.enums[e].values[0].1)),
        };

        Ok(FieldInfo {
            name,
            full_name,
            json_name: proto.json_name.clone(),
            number,
            kind,
            cardinality,
            explicit_presence,
            packed,
            validate_utf8,
            oneof: None,
            containing,
            is_extension: false,
            message_type,
            enum_type,
            default,
        })
    }

    fn parse_default(
        &self,
        text: &str,
        kind: Kind,
        enum_type: Option<usize>,
        field: &str,
    ) -> Result<DefaultValue, CompileError> {
        let invalid = || schema_error!("invalid default \"{}\" for field \"{}\"", text, field);
        let value = match kind {
            Kind::Bool => match text {
                "true" => DefaultValue::Bool(true),
                "false" => DefaultValue::Bool(false),
                _ => return Err(invalid()),
            },
            Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => {
                DefaultValue::I32(text.parse().map_err(|_| invalid())?)
            }
            Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => {
                DefaultValue::I64(text.parse().map_err(|_| invalid())?)
            }
            Kind::Uint32 | Kind::Fixed32 => DefaultValue::U32(text.parse().map_err(|_| invalid())?),
            Kind::Uint64 | Kind::Fixed64 => DefaultValue::U64(text.parse().map_err(|_| invalid())?),
            Kind::Float => DefaultValue::F32(parse_float(text).ok_or_else(invalid)? as f32),
            Kind::Double => DefaultValue::F64(parse_float(text).ok_or_else(invalid)?),
            Kind::String => DefaultValue::String(text.to_string()),
            Kind::Bytes => DefaultValue::Bytes(unescape_bytes(text).ok_or_else(invalid)?),
            Kind::Enum => {
                let info = enum_type.map(|e| &self.inner.enums[e]).ok_or_else(invalid)?;
                let number = info
                    .values
                    .iter()
                    .find(|(name, _)| name == text)
                    .map(|(_, n)| *n)
                    .ok_or_else(invalid)?;
                DefaultValue::Enum(number)
            }
            Kind::Message | Kind::Group => return Err(invalid()),
        };
        Ok(value)
    }

    /// Check the entry types of map fields.
    fn validate_maps(&self) -> Result<(), CompileError> {
        for field in &self.inner.fields {
            let Some(entry) = field.message_type.map(|m| &self.inner.messages[m]) else {
                continue;
            };
            if !entry.map_entry {
                continue;
            }
            if field.cardinality != Cardinality::Repeated || field.kind != Kind::Message {
                return Err(schema_error!(
                    "map entry type \"{}\" used by non-map field \"{}\"",
                    entry.full_name,
                    field.full_name
                ));
            }
            let entry_fields: Vec<&FieldInfo> =
                entry.fields.iter().map(|&id| &self.inner.fields[id]).collect();
            let valid_shape = entry_fields.len() == 2
                && entry_fields[0].number == 1
                && entry_fields[1].number == 2
                && entry_fields[0].name == "key"
                && entry_fields[1].name == "value"
                && entry_fields
                    .iter()
                    .all(|f| f.cardinality == Cardinality::Optional);
            if !valid_shape {
                return Err(schema_error!("malformed map entry \"{}\"", entry.full_name));
            }
            let key_kind = entry_fields[0].kind;
            if matches!(
                key_kind,
                Kind::Float | Kind::Double | Kind::Bytes | Kind::Enum | Kind::Message | Kind::Group
            ) {
                return Err(schema_error!(
                    "map entry \"{}\" has invalid key kind {}",
                    entry.full_name,
                    key_kind.name()
                ));
            }
        }
        Ok(())
    }
}

impl MessageInfo {
    fn is_extension_number(&self, number: u32) -> bool {
        self.extension_ranges
            .iter()
            .any(|&(start, end)| number >= start && number < end)
    }
}

fn qualify(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", scope, name)
    }
}

fn parse_float(text: &str) -> Option<f64> {
    match text {
        "inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        "nan" => Some(f64::NAN),
        _ => text.parse().ok(),
    }
}

/// Decode the C-style escapes `protoc` uses for `bytes` defaults.
fn unescape_bytes(text: &str) -> Option<Vec<u8>> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let esc = *bytes.get(i + 1)?;
        i += 2;
        match esc {
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'\\' => out.push(b'\\'),
            b'\'' => out.push(b'\''),
            b'"' => out.push(b'"'),
            b'?' => out.push(b'?'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'v' => out.push(0x0b),
            b'x' => {
                let digits = bytes[i..]
                    .iter()
                    .take(2)
                    .take_while(|b| b.is_ascii_hexdigit())
                    .count();
                if digits == 0 {
                    return None;
                }
                let hex = std::str::from_utf8(&bytes[i..i + digits]).ok()?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += digits;
            }
            b'0'..=b'7' => {
                let start = i - 1;
                let digits = bytes[start..]
                    .iter()
                    .take(3)
                    .take_while(|b| (b'0'..=b'7').contains(b))
                    .count();
                let oct = std::str::from_utf8(&bytes[start..start + digits]).ok()?;
                out.push(u16::from_str_radix(oct, 8).ok()? as u8);
                i = start + digits;
            }
            _ => return None,
        }
    }
    Some(out)
}
