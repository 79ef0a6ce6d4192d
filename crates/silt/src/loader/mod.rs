//! Module loading and linking.
//!
//! A loader ingests a parsed [`Module`] and produces an executable form:
//! struct descriptors gain sizes, alignments, field offsets and GC layout
//! ids; imports are resolved (recursively loading the owning modules);
//! function locals get a byte-packed frame layout; and the on-disk
//! instruction stream is rewritten into [`Instruction`]s with every symbolic
//! operand replaced by a directly usable value (see [`code`]).

mod code;

use std::collections::HashMap;

use tracing::debug;

use crate::bytecode::Instruction;
use crate::context::{Context, NativeFn};
use crate::error::{ErrorKind, Result};
use crate::module::{
    make_type_name, struct_flags, BaseType, Constant, Export, ExportDescriptor, FunctionBody,
    FunctionSignature, Import, Module, StructDescriptor, SymbolKind, VariableType,
};

pub type ModuleId = usize;
pub type FunctionId = usize;

/// One argument or local variable of a stack frame.
#[derive(Debug, Clone)]
pub struct LocalSlot {
    pub ty: VariableType,
    pub size: usize,
    /// Byte offset into the frame's locals area. Slots are byte-packed.
    pub offset: usize,
    /// Whether the slot holds a managed reference and takes part in root
    /// bookkeeping.
    pub is_ref: bool,
}

/// Executable details of an interpreted function.
#[derive(Debug, Clone)]
pub struct BytecodeBody {
    /// Absolute instruction index of the entry point in the module's code.
    pub entry: usize,
    /// Instruction count.
    pub len: usize,
    /// Arguments first, then locals.
    pub locals: Vec<LocalSlot>,
    /// Byte size of the arguments area (prefix of the locals area).
    pub args_size: usize,
    /// Byte size of the whole locals area.
    pub locals_size: usize,
    /// Byte size of the return value on the operand stack.
    pub return_size: usize,
    /// Operand stack capacity computed by the rewrite pass.
    pub stack_size: usize,
}

pub enum FunctionKind {
    Native { library: String, callback: NativeFn },
    Bytecode(BytecodeBody),
}

impl std::fmt::Debug for FunctionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native { library, .. } => {
                f.debug_struct("Native").field("library", library).finish()
            }
            Self::Bytecode(body) => f.debug_tuple("Bytecode").field(body).finish(),
        }
    }
}

#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub signature: FunctionSignature,
    pub kind: FunctionKind,
}

impl Function {
    #[must_use]
    pub fn is_native(&self) -> bool {
        matches!(self.kind, FunctionKind::Native { .. })
    }
}

/// A loaded module: decoded types, rewritten code and published functions.
#[derive(Debug)]
pub struct ModuleLoader {
    pub name: String,
    pub constants: Vec<Constant>,
    structs: HashMap<String, StructDescriptor>,
    export_kinds: HashMap<String, SymbolKind>,
    pub code: Vec<Instruction>,
    functions: Vec<Function>,
    function_names: HashMap<String, FunctionId>,
    /// Label id to absolute instruction index, published after the rewrite.
    pub labels: HashMap<i64, usize>,
}

impl ModuleLoader {
    /// Empty loader occupying an arena slot while its module is linked.
    pub(crate) fn placeholder(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            constants: Vec::new(),
            structs: HashMap::new(),
            export_kinds: HashMap::new(),
            code: Vec::new(),
            functions: Vec::new(),
            function_names: HashMap::new(),
            labels: HashMap::new(),
        }
    }

    #[must_use]
    pub fn has_function(&self, name: &str) -> bool {
        self.function_names.contains_key(name)
    }

    pub fn function_id(&self, name: &str) -> Result<FunctionId> {
        self.function_names.get(name).copied().ok_or_else(|| {
            ErrorKind::FunctionNotFound {
                module: self.name.clone(),
                function: name.to_owned(),
            }
            .into()
        })
    }

    #[must_use]
    pub fn function(&self, id: FunctionId) -> &Function {
        &self.functions[id]
    }

    #[must_use]
    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    #[must_use]
    pub fn struct_descriptor(&self, name: &str) -> Option<&StructDescriptor> {
        self.structs.get(name)
    }

    /// Resolve an entry point back to a function name, for stack traces.
    #[must_use]
    pub fn resolve_entry_point(&self, entry: usize) -> Option<&str> {
        self.functions.iter().find_map(|f| match &f.kind {
            FunctionKind::Bytecode(body) if body.entry == entry => Some(f.name.as_str()),
            _ => None,
        })
    }
}

fn align_up(value: usize, alignment: usize) -> usize {
    let alignment = alignment.max(1);
    value.div_ceil(alignment) * alignment
}

/// Link a parsed module into an executable loader. `self_id` is the arena
/// slot reserved for this module by the context.
pub(crate) fn link(
    ctx: &mut Context,
    self_id: ModuleId,
    name: &str,
    module: Module,
) -> Result<ModuleLoader> {
    debug!(target: "loader", module = name, "linking");

    let mut export_kinds = HashMap::new();
    for export in &module.header.exports {
        export_kinds.insert(export.name.clone(), export.desc.kind());
    }

    // Declaration-ordered struct map.
    let mut struct_order = Vec::new();
    let mut structs = HashMap::new();
    for export in &module.header.exports {
        if let ExportDescriptor::Type(desc) = &export.desc {
            if structs.insert(export.name.clone(), desc.clone()).is_some() {
                return Err(ErrorKind::MalformedModule(format!(
                    "type '{}' exported twice",
                    export.name
                ))
                .into());
            }
            struct_order.push(export.name.clone());
        }
    }

    decode_structs(ctx, name, &module.header.imports, &mut structs, &struct_order)?;

    let resolved_packages = resolve_imports(ctx, name, &module.header)?;

    // Locals frame layout and function table, in export order.
    let mut infos = Vec::new();
    let mut export_fids = HashMap::new();
    for (export_index, export) in module.header.exports.iter().enumerate() {
        if let ExportDescriptor::Function(desc) = &export.desc {
            export_fids.insert(export_index, infos.len());
            infos.push(decode_function(ctx, name, export, desc)?);
        }
    }

    // Rewrite the instruction stream.
    let local_signatures: Vec<FunctionSignature> =
        infos.iter().map(|info| info.signature.clone()).collect();
    let mut decoder = code::CodeDecoder::new(
        ctx,
        self_id,
        &module,
        &structs,
        &resolved_packages,
        &export_fids,
        &local_signatures,
    );
    for info in &mut infos {
        if let FnBody::Bytecode(body) = &mut info.body {
            decoder.decode_function(body)?;
        }
    }
    let (rewritten, labels) = decoder.finish();

    // Resolve layout ids in signatures; they validate host-supplied
    // arguments when functions are called from native code.
    for info in &mut infos {
        resolve_type(ctx, name, &module.header.imports, &mut info.signature.return_type)?;
        for arg in &mut info.signature.arg_types {
            resolve_type(ctx, name, &module.header.imports, arg)?;
        }
    }

    let mut functions = Vec::new();
    let mut function_names = HashMap::new();
    for info in infos {
        if function_names.contains_key(&info.name) {
            return Err(ErrorKind::MalformedModule(format!(
                "function '{}' already exists in exports",
                info.name
            ))
            .into());
        }
        let kind = match info.body {
            FnBody::Native { library } => {
                let callback = ctx.native_callback(&library, &info.name).ok_or_else(|| {
                    ErrorKind::UnresolvedImport(format!(
                        "native function '{}.{}' is not registered",
                        library, info.name
                    ))
                })?;
                FunctionKind::Native { library, callback }
            }
            FnBody::Bytecode(body) => FunctionKind::Bytecode(body.runtime),
        };
        function_names.insert(info.name.clone(), functions.len());
        functions.push(Function {
            name: info.name,
            signature: info.signature,
            kind,
        });
    }

    debug!(
        target: "loader",
        module = name,
        functions = functions.len(),
        types = structs.len(),
        instructions = rewritten.len(),
        "linked"
    );

    Ok(ModuleLoader {
        name: name.to_owned(),
        constants: module.header.constants,
        structs,
        export_kinds,
        code: rewritten,
        functions,
        function_names,
        labels,
    })
}

pub(crate) struct FnInfo {
    name: String,
    signature: FunctionSignature,
    body: FnBody,
}

pub(crate) enum FnBody {
    Native { library: String },
    Bytecode(BytecodeFn),
}

pub(crate) struct BytecodeFn {
    /// Byte range in the on-disk blob.
    disk_entry: usize,
    disk_size: usize,
    runtime: BytecodeBody,
}

fn decode_function(
    ctx: &Context,
    module_name: &str,
    export: &Export,
    desc: &crate::module::FunctionDescriptor,
) -> Result<FnInfo> {
    let signature = desc.signature.clone();
    let body = match &desc.body {
        FunctionBody::Native { library } => {
            // Surface unknown natives as early as possible.
            if ctx.native_callback(library, &export.name).is_none() {
                return Err(ErrorKind::UnresolvedImport(format!(
                    "native function '{}.{}' is not registered",
                    library, export.name
                ))
                .into());
            }
            FnBody::Native {
                library: library.clone(),
            }
        }
        FunctionBody::Bytecode {
            entry,
            size,
            locals,
        } => {
            let arg_count = signature.arg_types.len();
            if arg_count > locals.len() {
                return Err(ErrorKind::MalformedModule(format!(
                    "function '{}.{}': argument count exceeds locals count",
                    module_name, export.name
                ))
                .into());
            }

            // Arguments first, then locals; offsets are byte-packed.
            let mut slots = Vec::with_capacity(locals.len());
            let mut offset = 0;
            let mut args_size = 0;
            for (i, ty) in locals.iter().enumerate() {
                let size = ty.stack_width();
                slots.push(LocalSlot {
                    ty: ty.clone(),
                    size,
                    offset,
                    is_ref: ty.is_gc(),
                });
                offset += size;
                if i + 1 == arg_count {
                    args_size = offset;
                }
            }
            if arg_count == 0 {
                args_size = 0;
            }

            FnBody::Bytecode(BytecodeFn {
                disk_entry: *entry,
                disk_size: *size,
                runtime: BytecodeBody {
                    entry: 0,
                    len: 0,
                    locals: slots,
                    args_size,
                    locals_size: offset,
                    return_size: signature.return_type.stack_width(),
                    stack_size: 0,
                },
            })
        }
    };

    Ok(FnInfo {
        name: export.name.clone(),
        signature,
        body,
    })
}

/// Compute struct sizes, alignments, field offsets and GC layouts, in
/// declaration order, and register (or check) the layouts with the GC.
fn decode_structs(
    ctx: &mut Context,
    module_name: &str,
    imports: &[Import],
    structs: &mut HashMap<String, StructDescriptor>,
    order: &[String],
) -> Result<()> {
    let struct_names: Vec<String> = order.to_vec();

    for name in order {
        let mut size = 0usize;
        let mut alignment = 0usize;
        let mut layout = Vec::new();

        let desc = structs.get(name).expect("struct map covers declaration order");
        let mut fields = desc.fields.clone();
        let flags = desc.flags;

        for field in &mut fields {
            if field.ty.is_void() {
                return Err(ErrorKind::MalformedModule(format!(
                    "struct '{module_name}.{name}': field '{}' has type void",
                    field.name
                ))
                .into());
            }

            // Struct-typed fields are references; the referenced type must
            // exist, locally or in an imported module.
            if let BaseType::Struct(target) = &field.ty.base {
                if !struct_names.contains(target) {
                    verify_imported_type(ctx, module_name, imports, &field.ty, target)?;
                }
            }

            let field_size = field.ty.field_size();
            let field_alignment = field.ty.field_alignment();

            let offset = align_up(size, field_alignment);
            field.offset = offset;
            field.size = field_size;
            size = offset + field_size;
            alignment = alignment.max(field_alignment);

            if field.ty.is_gc() {
                layout.push(offset);
            }
        }

        size = align_up(size, alignment);

        let qualified = make_type_name(module_name, name);
        let layout_id = if flags & struct_flags::NATIVE != 0 {
            ctx.gc().check_type_layout(&qualified, &layout)?
        } else {
            ctx.gc_mut().register_type_layout(qualified, layout)?
        };

        let desc = structs.get_mut(name).expect("struct map covers declaration order");
        desc.fields = fields;
        desc.size = size;
        desc.alignment = alignment.max(1);
        desc.layout_id = layout_id;
    }

    Ok(())
}

/// Verify that a struct-typed field refers to a type exported by an imported
/// module, loading the module if needed.
fn verify_imported_type(
    ctx: &mut Context,
    module_name: &str,
    imports: &[Import],
    ty: &VariableType,
    target: &str,
) -> Result<()> {
    let index = ty.import_index.ok_or_else(|| {
        ErrorKind::UnresolvedImport(format!(
            "cannot resolve type '{target}' in module '{module_name}': type not found"
        ))
    })?;
    let import = imports.get(index).ok_or_else(|| {
        ErrorKind::MalformedModule(format!("invalid import index {index} for type '{target}'"))
    })?;
    if import.kind != SymbolKind::Type {
        return Err(ErrorKind::MalformedModule(format!(
            "import table entry {index} is not a type"
        ))
        .into());
    }
    let package = package_of(imports, import)?;
    let mid = ctx.resolve_module(&package.name)?;
    if ctx.loader(mid).structs.contains_key(&import.name) {
        Ok(())
    } else {
        Err(ErrorKind::UnresolvedImport(format!(
            "type '{}' is not exported by module '{}'",
            import.name, package.name
        ))
        .into())
    }
}

fn package_of<'a>(imports: &'a [Import], import: &Import) -> Result<&'a Import> {
    let package_index = import.package.ok_or_else(|| {
        ErrorKind::MalformedModule(format!(
            "import symbol '{}' has no package index",
            import.name
        ))
    })?;
    let package = imports.get(package_index).ok_or_else(|| {
        ErrorKind::MalformedModule(format!(
            "import symbol '{}' has invalid package index {package_index}",
            import.name
        ))
    })?;
    if package.kind != SymbolKind::Package {
        return Err(ErrorKind::MalformedModule(format!(
            "import symbol '{}' refers to a non-package import entry",
            import.name
        ))
        .into());
    }
    Ok(package)
}

/// Resolve every non-package import: load the owning module and verify the
/// symbol exists there with the right kind. Returns the loaded module id per
/// import-table index (package entries only).
fn resolve_imports(
    ctx: &mut Context,
    module_name: &str,
    header: &crate::module::ModuleHeader,
) -> Result<Vec<Option<ModuleId>>> {
    let imports = &header.imports;
    let mut resolved = vec![None; imports.len()];

    for import in imports {
        if import.kind == SymbolKind::Package {
            // Packages are loaded while resolving the symbols that use them.
            continue;
        }

        let package_index = import.package.ok_or_else(|| {
            ErrorKind::MalformedModule(format!(
                "error while resolving imports for '{module_name}': \
                 import symbol '{}' has no package index",
                import.name
            ))
        })?;
        let package = package_of(imports, import)?;
        let mid = ctx.resolve_module(&package.name)?;
        resolved[package_index] = Some(mid);

        let target = ctx.loader(mid);
        let exported = target.export_kinds.get(&import.name).copied();
        match exported {
            None => {
                return Err(ErrorKind::UnresolvedImport(format!(
                    "symbol '{}' is not exported by module '{}'",
                    import.name, package.name
                ))
                .into());
            }
            Some(kind) if kind != import.kind => {
                return Err(ErrorKind::UnresolvedImport(format!(
                    "symbol '{}' from module '{}' has wrong kind \
                     (expected '{}', got '{}')",
                    import.name,
                    package.name,
                    import.kind.name(),
                    kind.name()
                ))
                .into());
            }
            Some(_) => {}
        }
    }

    Ok(resolved)
}

/// Resolve a type's GC layout id. Built-in types must not carry an import
/// index; struct types get the layout id registered under their qualified
/// name.
fn resolve_type(
    ctx: &Context,
    module_name: &str,
    imports: &[Import],
    ty: &mut VariableType,
) -> Result<()> {
    if !matches!(ty.base, BaseType::Struct(_)) {
        if ty.import_index.is_some() {
            return Err(ErrorKind::MalformedModule(format!(
                "built-in type '{}' cannot have an import index",
                ty.base.name()
            ))
            .into());
        }
        return Ok(());
    }

    let qualified = match ty.import_index {
        Some(index) => {
            let import = imports.get(index).ok_or_else(|| {
                ErrorKind::MalformedModule(format!("invalid import index {index} in signature"))
            })?;
            let package = package_of(imports, import)?;
            make_type_name(&package.name, &import.name)
        }
        None => make_type_name(module_name, ty.base.name()),
    };

    ty.layout_id = Some(ctx.gc().layout_id(&qualified)?);
    Ok(())
}
