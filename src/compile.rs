//! Compilation of message descriptors into [`MessageType`]s.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashMap;
use tdpb_wire::DecodeMessage;
use tdpb_wire::descriptor::FileDescriptorSet;

use crate::env::dump_programs;
use crate::errors::{CompileError, CompileErrorKind, schema_error};
use crate::layout::Layout;
use crate::message_type::{CompiledType, Library, MessageType};
use crate::program::{Program, TypeHints};
use crate::schema::{
    DescKey, DescriptorPool, ExtensionResolver, FieldDescriptor, Kind, MessageDescriptor,
};

static NEXT_LIBRARY_ID: AtomicU64 = AtomicU64::new(1);

/// Options that control compilation.
#[derive(Clone, Default)]
pub struct CompileOptions {
    extension_resolver: Option<Arc<dyn ExtensionResolver>>,
}

impl CompileOptions {
    /// Set the resolver used to find extensions of message types that
    /// declare extension ranges.
    ///
    /// Extensions returned by the resolver are decoded like regular fields.
    /// Fields in extension ranges that the resolver does not know about are
    /// kept as unknown fields.
    pub fn with_extension_resolver<R: ExtensionResolver + 'static>(mut self, resolver: R) -> Self {
        self.extension_resolver = Some(Arc::new(resolver));
        self
    }
}

impl fmt::Debug for CompileOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileOptions")
            .field("extension_resolver", &self.extension_resolver.is_some())
            .finish()
    }
}

/// Compile `descriptor` and all message types reachable from it.
pub fn compile(
    descriptor: &MessageDescriptor,
    options: &CompileOptions,
) -> Result<MessageType, CompileError> {
    let lib = build_library(descriptor, options.extension_resolver.clone(), None)?;
    Ok(MessageType::new(Arc::new(lib), 0))
}

/// Build a descriptor pool from `set` and compile the message named `name`.
///
/// `name` is a fully qualified message name such as `"pkg.Message"`. If
/// `options` has no extension resolver, extensions declared in `set` are
/// used.
pub fn compile_file_set(
    set: &FileDescriptorSet,
    name: &str,
    options: &CompileOptions,
) -> Result<MessageType, CompileError> {
    let pool = DescriptorPool::new(set)?;
    let descriptor = pool
        .get_message(name)
        .ok_or_else(|| CompileError::new(CompileErrorKind::NotFound, name))?;
    let mut resolver = options.extension_resolver.clone();
    if resolver.is_none() {
        resolver = Some(Arc::new(pool));
    }
    let lib = build_library(&descriptor, resolver, None)?;
    Ok(MessageType::new(Arc::new(lib), 0))
}

/// Variant of [`compile_file_set`] which takes a serialized
/// `FileDescriptorSet`, as produced by `protoc --descriptor_set_out`.
pub fn compile_file_set_bytes(
    set: &[u8],
    name: &str,
    options: &CompileOptions,
) -> Result<MessageType, CompileError> {
    let set = FileDescriptorSet::decode(set)?;
    compile_file_set(&set, name, options)
}

/// Compiles message types, reusing types compiled by earlier calls.
///
/// Each call to [`compile`] builds a new library of types. A `Compiler`
/// remembers every type it has built, so compiling a type that was already
/// reachable from an earlier one returns the existing type.
pub struct Compiler {
    options: CompileOptions,
    compiled: FxHashMap<DescKey, MessageType>,
}

impl Compiler {
    pub fn new(options: CompileOptions) -> Compiler {
        Compiler {
            options,
            compiled: FxHashMap::default(),
        }
    }

    pub fn compile(&mut self, descriptor: &MessageDescriptor) -> Result<MessageType, CompileError> {
        if let Some(ty) = self.compiled.get(&descriptor.key()) {
            return Ok(ty.clone());
        }
        let ty = compile(descriptor, &self.options)?;
        for (index, compiled) in ty.library().types.iter().enumerate() {
            self.compiled
                .entry(compiled.descriptor.key())
                .or_insert_with(|| MessageType::new(ty.library().clone(), index as u32));
        }
        Ok(ty)
    }

    /// Return the number of types compiled so far.
    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(CompileOptions::default())
    }
}

/// Return the extensions of `descriptor` known to `resolver`, ordered by
/// field number.
fn resolve_extensions(
    descriptor: &MessageDescriptor,
    regular: &[FieldDescriptor],
    resolver: &dyn ExtensionResolver,
) -> Result<Vec<FieldDescriptor>, CompileError> {
    let mut extensions = resolver.extensions_of(descriptor);
    extensions.sort_by_key(|ext| ext.number());
    for (i, ext) in extensions.iter().enumerate() {
        if !ext.is_extension() || ext.containing_message().full_name() != descriptor.full_name()
        {
            return Err(schema_error!(
                "\"{}\" is not an extension of \"{}\"",
                ext.full_name(),
                descriptor.full_name()
            ));
        }
        if !descriptor.is_extension_number(ext.number()) {
            return Err(schema_error!(
                "extension \"{}\" number {} is outside the extension ranges of \"{}\"",
                ext.full_name(),
                ext.number(),
                descriptor.full_name()
            ));
        }
        let clashes = regular.iter().any(|f| f.number() == ext.number())
            || (i > 0 && extensions[i - 1].number() == ext.number());
        if clashes {
            return Err(schema_error!(
                "extension \"{}\" reuses field number {}",
                ext.full_name(),
                ext.number()
            ));
        }
    }
    Ok(extensions)
}

/// Return the sorted values of a closed enum field.
fn closed_enum_values(field: &FieldDescriptor) -> Option<Arc<[i32]>> {
    if field.kind() != Kind::Enum {
        return None;
    }
    let enum_type = field.enum_type()?;
    if !enum_type.is_closed() {
        return None;
    }
    let mut values: Vec<i32> = enum_type.values().map(|(_, n)| n).collect();
    values.sort();
    values.dedup();
    Some(values.into())
}

/// Compile `root` and every message type reachable from it into a library.
///
/// Compilation has two phases so that recursive types can refer to each
/// other. The first phase assigns an index to each reachable type. The
/// second plans layouts and assembles programs, referring to child types by
/// index.
pub(crate) fn build_library(
    root: &MessageDescriptor,
    resolver: Option<Arc<dyn ExtensionResolver>>,
    hints: Option<&FxHashMap<DescKey, TypeHints>>,
) -> Result<Library, CompileError> {
    let mut descriptors = vec![root.clone()];
    let mut indices: FxHashMap<DescKey, u32> = FxHashMap::default();
    indices.insert(root.key(), 0);

    let mut type_fields = Vec::new();
    let mut next = 0;
    while next < descriptors.len() {
        let descriptor = descriptors[next].clone();
        let mut fields: Vec<FieldDescriptor> = descriptor.fields().collect();
        let extension_start = fields.len();
        if let Some(resolver) = resolver.as_deref() {
            if !descriptor.extension_ranges().is_empty() {
                let extensions = resolve_extensions(&descriptor, &fields, resolver)?;
                fields.extend(extensions);
            }
        }

        for field in &fields {
            if let Some(child) = field.message_type() {
                indices.entry(child.key()).or_insert_with(|| {
                    descriptors.push(child.clone());
                    descriptors.len() as u32 - 1
                });
            }
        }
        type_fields.push((fields, extension_start));
        next += 1;
    }

    let dump = dump_programs();
    let mut types = Vec::with_capacity(descriptors.len());
    for (descriptor, (fields, extension_start)) in descriptors.into_iter().zip(type_fields) {
        let layout = Layout::plan(&fields);
        let children: Vec<Option<u32>> = fields
            .iter()
            .map(|f| f.message_type().map(|child| indices[&child.key()]))
            .collect();
        let enum_tables: Vec<Option<Arc<[i32]>>> = fields.iter().map(closed_enum_values).collect();
        let type_hints = hints.and_then(|hints| hints.get(&descriptor.key()));
        let program = Program::assemble(
            &fields,
            extension_start,
            &layout,
            &children,
            &enum_tables,
            type_hints,
        );
        if dump {
            log::trace!("Program for {}:\n{}", descriptor.full_name(), program);
        }
        types.push(CompiledType::new(
            descriptor,
            layout,
            program,
            fields,
            extension_start,
            children,
        ));
    }

    let id = NEXT_LIBRARY_ID.fetch_add(1, Ordering::Relaxed);
    let hashed = types
        .iter()
        .filter(|ty| !ty.program.dispatch().is_dense())
        .count();
    log::debug!(
        "Compiled library {} for {}: {} types, {} with hashed dispatch",
        id,
        root.full_name(),
        types.len(),
        hashed
    );

    Ok(Library {
        id,
        types,
        resolver,
    })
}

#[cfg(test)]
mod tests {
    use tdpb_testing::SchemaBuilder;
    use tdpb_wire::descriptor::FieldType;

    use super::{CompileOptions, Compiler, compile, compile_file_set, compile_file_set_bytes};
    use crate::errors::CompileErrorKind;
    use crate::schema::DescriptorPool;

    fn schema() -> SchemaBuilder {
        SchemaBuilder::proto2("t.proto")
            .package("pkg")
            .message("Outer", |m| {
                m.message_field("inner", 1, "Inner")
                    .extension_range(100, 200)
            })
            .message("Inner", |m| m.field("a", 1, FieldType::INT32))
            .message("Other", |m| m.message_field("inner", 1, "Inner"))
            .extension("Outer", "tag", 100, FieldType::STRING, None)
    }

    #[test]
    fn test_compile_file_set() {
        let ty = compile_file_set(&schema().build(), "pkg.Outer", &CompileOptions::default())
            .unwrap();
        assert_eq!(ty.full_name(), "pkg.Outer");
        assert_eq!(ty.library_size(), 2);

        // Extensions in the set are compiled in after the regular fields.
        let names: Vec<_> = ty.fields().iter().map(|f| f.full_name().to_string()).collect();
        assert_eq!(names, ["pkg.Outer.inner", "pkg.tag"]);

        let err = compile_file_set(&schema().build(), "pkg.Missing", &CompileOptions::default())
            .err()
            .unwrap();
        assert_eq!(err.kind(), CompileErrorKind::NotFound);
    }

    #[test]
    fn test_compile_file_set_bytes() {
        let bytes = schema().build_bytes();
        let ty = compile_file_set_bytes(&bytes, "pkg.Inner", &CompileOptions::default()).unwrap();
        assert_eq!(ty.full_name(), "pkg.Inner");

        let err = compile_file_set_bytes(&[0x0A, 0x05], "pkg.Inner", &CompileOptions::default())
            .err()
            .unwrap();
        assert_eq!(err.kind(), CompileErrorKind::DescriptorDecode);
    }

    #[test]
    fn test_compile_without_resolver() {
        let pool = DescriptorPool::new(&schema().build()).unwrap();
        let outer = pool.get_message("pkg.Outer").unwrap();
        let ty = compile(&outer, &CompileOptions::default()).unwrap();
        assert_eq!(ty.fields().len(), 1);

        let ty = compile(&outer, &CompileOptions::default().with_extension_resolver(pool)).unwrap();
        assert_eq!(ty.fields().len(), 2);
    }

    #[test]
    fn test_compiler_reuses_types() {
        let pool = DescriptorPool::new(&schema().build()).unwrap();
        let mut compiler = Compiler::default();

        let outer = compiler.compile(&pool.get_message("pkg.Outer").unwrap()).unwrap();
        assert_eq!(compiler.len(), 2);

        let inner = compiler.compile(&pool.get_message("pkg.Inner").unwrap()).unwrap();
        let inner_field = outer.descriptor().get_field_by_name("inner").unwrap();
        assert_eq!(outer.child_type(&inner_field), Some(inner.clone()));

        let again = compiler.compile(&pool.get_message("pkg.Outer").unwrap()).unwrap();
        assert_eq!(again, outer);

        let other = compiler.compile(&pool.get_message("pkg.Other").unwrap()).unwrap();
        assert_eq!(compiler.len(), 3);
        assert_ne!(other, outer);
    }
}
