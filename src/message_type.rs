use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::compile::build_library;
use crate::errors::{CompileError, CompileErrorKind};
use crate::layout::Layout;
use crate::profile::Profile;
use crate::program::Program;
use crate::schema::{ExtensionResolver, FieldDescriptor, MessageDescriptor};

/// A message type whose layout and program have been compiled.
pub(crate) struct CompiledType {
    pub descriptor: MessageDescriptor,
    pub layout: Layout,
    pub program: Program,

    /// Regular fields in declaration order, followed by extensions.
    pub fields: Vec<FieldDescriptor>,

    /// Index of the first extension in `fields`.
    pub extension_start: usize,

    /// Library index of each field's message type.
    pub children: Vec<Option<u32>>,

    /// Field indices in field number order.
    pub sorted: Vec<u32>,

    by_number: FxHashMap<u32, u32>,
    by_name: FxHashMap<String, u32>,
}

impl CompiledType {
    pub fn new(
        descriptor: MessageDescriptor,
        layout: Layout,
        program: Program,
        fields: Vec<FieldDescriptor>,
        extension_start: usize,
        children: Vec<Option<u32>>,
    ) -> CompiledType {
        let mut sorted: Vec<u32> = (0..fields.len() as u32).collect();
        sorted.sort_by_key(|&i| fields[i as usize].number());

        let by_number = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.number(), i as u32))
            .collect();

        // Extensions are looked up by their full name, as in `.proto` text
        // format.
        let by_name = fields
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let name = if f.is_extension() {
                    f.full_name()
                } else {
                    f.name()
                };
                (name.to_string(), i as u32)
            })
            .collect();

        CompiledType {
            descriptor,
            layout,
            program,
            fields,
            extension_start,
            children,
            sorted,
            by_number,
            by_name,
        }
    }

    /// Return the index of `field` in this type, if it belongs to it.
    pub fn field_index(&self, field: &FieldDescriptor) -> Option<usize> {
        let index = *self.by_number.get(&field.number())? as usize;
        (self.fields[index] == *field).then_some(index)
    }

    pub fn field_by_number(&self, number: u32) -> Option<usize> {
        self.by_number.get(&number).map(|&i| i as usize)
    }

    pub fn field_by_name(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).map(|&i| i as usize)
    }
}

/// The set of types produced by one compilation.
///
/// Types refer to each other by index, so recursive and mutually recursive
/// message types are represented without reference cycles.
pub(crate) struct Library {
    /// Identifier used in log messages.
    pub id: u64,
    pub types: Vec<CompiledType>,

    /// Resolver used to compile this library, reused when recompiling.
    pub resolver: Option<Arc<dyn ExtensionResolver>>,
}

/// A compiled message type.
///
/// A `MessageType` is a cheap handle which can be cloned and shared between
/// threads. It is immutable. Recompiling with a profile produces a new type
/// and leaves the existing one valid.
///
/// Create a `MessageType` with [`compile`](crate::compile()),
/// [`Compiler`](crate::Compiler) or
/// [`compile_file_set`](crate::compile_file_set), then decode messages with
/// [`Shared::unmarshal`](crate::Shared::unmarshal).
#[derive(Clone)]
pub struct MessageType {
    lib: Arc<Library>,
    index: u32,
}

impl MessageType {
    pub(crate) fn new(lib: Arc<Library>, index: u32) -> MessageType {
        MessageType { lib, index }
    }

    pub(crate) fn library(&self) -> &Arc<Library> {
        &self.lib
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn compiled(&self) -> &CompiledType {
        &self.lib.types[self.index as usize]
    }

    pub fn descriptor(&self) -> &MessageDescriptor {
        &self.compiled().descriptor
    }

    /// Fully qualified name of the message type.
    pub fn full_name(&self) -> &str {
        self.descriptor().full_name()
    }

    pub fn layout(&self) -> &Layout {
        &self.compiled().layout
    }

    pub fn program(&self) -> &Program {
        &self.compiled().program
    }

    /// Return the fields decoded by this type: the message's fields in
    /// declaration order followed by extensions known at compile time.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.compiled().fields
    }

    /// Return the compiled type of a message-typed field.
    pub fn child_type(&self, field: &FieldDescriptor) -> Option<MessageType> {
        let ty = self.compiled();
        let index = ty.field_index(field)?;
        ty.children[index].map(|child| MessageType::new(self.lib.clone(), child))
    }

    /// Return the number of types compiled together with this one.
    pub fn library_size(&self) -> usize {
        self.lib.types.len()
    }

    /// Create an empty profile for decodes of this type and the types it
    /// references.
    pub fn new_profile(&self) -> Profile {
        Profile::new(self.lib.clone())
    }

    /// Compile this type again, using counters in `profile` to choose initial
    /// list and map capacities and to order the dispatch tables.
    ///
    /// Fails with [`CompileErrorKind::ProfileMismatch`] if `profile` was not
    /// created from this type or another type compiled together with it.
    pub fn recompile(&self, profile: &Profile) -> Result<MessageType, CompileError> {
        if !profile.is_for(&self.lib) {
            return Err(CompileError::new(
                CompileErrorKind::ProfileMismatch,
                format!("profile was not recorded for {}", self.full_name()),
            ));
        }
        let hints = profile.hints();
        for (key, type_hints) in &hints {
            let Some(ty) = self.lib.types.iter().find(|ty| ty.descriptor.key() == *key) else {
                continue;
            };
            if !type_hints.capacity.is_empty() {
                let mut capacity: Vec<_> = type_hints.capacity.iter().collect();
                capacity.sort();
                log::debug!(
                    "Recompiling {} with capacity hints {:?}",
                    ty.descriptor.full_name(),
                    capacity
                );
            }
        }
        let lib = build_library(self.descriptor(), self.lib.resolver.clone(), Some(&hints))?;
        Ok(MessageType::new(Arc::new(lib), 0))
    }
}

impl PartialEq for MessageType {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.lib, &other.lib) && self.index == other.index
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageType({})", self.full_name())
    }
}

#[cfg(test)]
mod tests {
    use tdpb_testing::SchemaBuilder;
    use tdpb_wire::descriptor::FieldType;

    use crate::{CompileOptions, compile_file_set};

    #[test]
    fn test_recursive_types() {
        let set = SchemaBuilder::proto2("t.proto")
            .message("Node", |m| {
                m.field("value", 1, FieldType::INT32)
                    .repeated_message("children", 2, "Node")
                    .message_field("meta", 3, "Meta")
            })
            .message("Meta", |m| m.message_field("owner", 1, "Node"))
            .build();
        let ty = compile_file_set(&set, "Node", &CompileOptions::default()).unwrap();

        assert_eq!(ty.full_name(), "Node");
        assert_eq!(ty.library_size(), 2);

        let children = ty.descriptor().get_field_by_name("children").unwrap();
        assert_eq!(ty.child_type(&children), Some(ty.clone()));

        let meta_field = ty.descriptor().get_field_by_name("meta").unwrap();
        let meta = ty.child_type(&meta_field).unwrap();
        assert_eq!(meta.full_name(), "Meta");
        let owner = meta.descriptor().get_field_by_name("owner").unwrap();
        assert_eq!(meta.child_type(&owner), Some(ty.clone()));

        let value = ty.descriptor().get_field_by_name("value").unwrap();
        assert_eq!(ty.child_type(&value), None);
    }
}
