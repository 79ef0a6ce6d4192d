//! Test harness for silt unit and integration tests.
//!
//! Provides a programmatic [`ModuleBuilder`] plus a small assembler emitting
//! the on-disk operand encodings, so tests can express end-to-end scenarios
//! without a compiler front-end, and a [`MemorySource`] serving module bytes
//! from a map.
//!
//! Only available when running tests or with the `test-harness` feature.

#![allow(clippy::missing_panics_doc, clippy::must_use_candidate)]

use std::collections::HashMap;

use crate::bytecode::{ArrayKind, Opcode};
use crate::context::{Context, ModuleSource};
use crate::error::{ErrorKind, Result};
use crate::module::rw::Writer;
use crate::module::{
    Constant, Export, ExportDescriptor, FieldDescriptor, FunctionBody, FunctionDescriptor,
    FunctionSignature, Import, Module, StructDescriptor, SymbolKind, VariableType,
};

/// Serves modules from an in-memory name to bytes map.
#[derive(Default)]
pub struct MemorySource {
    modules: HashMap<String, Vec<u8>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, bytes: Vec<u8>) {
        self.modules.insert(name.to_owned(), bytes);
    }
}

impl ModuleSource for MemorySource {
    fn load_module(&self, name: &str) -> Result<Vec<u8>> {
        self.modules
            .get(name)
            .cloned()
            .ok_or_else(|| ErrorKind::ModuleNotFound(name.to_owned()).into())
    }
}

/// Build a context over the given serialized modules with the `std` runtime
/// registered.
pub fn context_with(modules: impl IntoIterator<Item = (&'static str, Vec<u8>)>) -> Context {
    let mut source = MemorySource::new();
    for (name, bytes) in modules {
        source.insert(name, bytes);
    }
    let mut ctx = Context::new(Box::new(source));
    crate::runtime::register(&mut ctx).expect("std runtime registers once");
    ctx
}

/// Assembles one function's on-disk instruction stream.
pub struct Asm {
    w: Writer,
    next_label: i64,
}

impl Asm {
    fn new(next_label: i64) -> Self {
        Self {
            w: Writer::new(),
            next_label,
        }
    }

    /// Emit an opcode without operands.
    pub fn op(&mut self, opcode: Opcode) -> &mut Self {
        self.w.u8(opcode as u8);
        self
    }

    /// Emit a raw byte, e.g. to craft malformed streams.
    pub fn raw_u8(&mut self, byte: u8) -> &mut Self {
        self.w.u8(byte);
        self
    }

    pub fn iconst(&mut self, v: i32) -> &mut Self {
        self.op(Opcode::IConst);
        #[allow(clippy::cast_sign_loss)]
        self.w.u32(v as u32);
        self
    }

    pub fn lconst(&mut self, v: i64) -> &mut Self {
        self.op(Opcode::LConst);
        #[allow(clippy::cast_sign_loss)]
        self.w.u64(v as u64);
        self
    }

    pub fn fconst(&mut self, v: f32) -> &mut Self {
        self.op(Opcode::FConst);
        self.w.f32(v);
        self
    }

    pub fn dconst(&mut self, v: f64) -> &mut Self {
        self.op(Opcode::DConst);
        self.w.f64(v);
        self
    }

    pub fn sconst(&mut self, pool_index: usize) -> &mut Self {
        self.op(Opcode::SConst);
        self.w.vle_index(pool_index);
        self
    }

    /// Emit a load or store with a local-variable index operand.
    pub fn local(&mut self, opcode: Opcode, index: usize) -> &mut Self {
        self.op(opcode);
        self.w.vle_index(index);
        self
    }

    /// Allocate a fresh label id.
    pub fn label(&mut self) -> i64 {
        let label = self.next_label;
        self.next_label += 1;
        label
    }

    /// Mark the current position with a label.
    pub fn place(&mut self, label: i64) -> &mut Self {
        self.op(Opcode::Label);
        self.w.vle(label);
        self
    }

    pub fn jmp(&mut self, label: i64) -> &mut Self {
        self.op(Opcode::Jmp);
        self.w.vle(label);
        self
    }

    pub fn jnz(&mut self, then_label: i64, else_label: i64) -> &mut Self {
        self.op(Opcode::Jnz);
        self.w.vle(then_label);
        self.w.vle(else_label);
        self
    }

    pub fn newarray(&mut self, kind: ArrayKind) -> &mut Self {
        self.op(Opcode::NewArray);
        self.w.u8(kind as u8);
        self
    }

    /// `invoke`/`new`/`anewarray`/`checkcast` reference: a non-negative
    /// export index, or [`import_ref`] for imported symbols.
    pub fn symbol(&mut self, opcode: Opcode, reference: i64) -> &mut Self {
        self.op(opcode);
        self.w.vle(reference);
        self
    }

    pub fn field(&mut self, opcode: Opcode, struct_ref: i64, field_index: usize) -> &mut Self {
        self.op(opcode);
        self.w.vle(struct_ref);
        self.w.vle_index(field_index);
        self
    }

    pub fn dup_x1(&mut self, t1: &VariableType, t2: &VariableType) -> &mut Self {
        self.op(Opcode::DupX1);
        t1.write(&mut self.w);
        t2.write(&mut self.w);
        self
    }

    pub fn dup_x2(&mut self, t1: &VariableType, t2: &VariableType, t3: &VariableType) -> &mut Self {
        self.op(Opcode::DupX2);
        t1.write(&mut self.w);
        t2.write(&mut self.w);
        t3.write(&mut self.w);
        self
    }
}

/// Encode an import-table index as a symbol reference (`-index - 1`).
pub fn import_ref(import_index: usize) -> i64 {
    -i64::try_from(import_index).expect("import index fits in i64") - 1
}

/// Builds persisted modules programmatically.
#[derive(Default)]
pub struct ModuleBuilder {
    module: Module,
    bodies: Vec<(usize, Vec<u8>)>,
    next_label: i64,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start assembling a function body. Label ids are unique across the
    /// module, so pass the assembler back through [`ModuleBuilder::function`].
    pub fn asm(&mut self) -> Asm {
        Asm::new(self.next_label)
    }

    pub fn constant_i32(&mut self, v: i32) -> usize {
        self.module.header.constants.push(Constant::I32(v));
        self.module.header.constants.len() - 1
    }

    pub fn constant_f32(&mut self, v: f32) -> usize {
        self.module.header.constants.push(Constant::F32(v));
        self.module.header.constants.len() - 1
    }

    pub fn constant_str(&mut self, s: &str) -> usize {
        self.module.header.constants.push(Constant::Str(s.to_owned()));
        self.module.header.constants.len() - 1
    }

    pub fn import_package(&mut self, name: &str) -> usize {
        self.import(SymbolKind::Package, name, None)
    }

    pub fn import_function(&mut self, package: usize, name: &str) -> usize {
        self.import(SymbolKind::Function, name, Some(package))
    }

    pub fn import_type(&mut self, package: usize, name: &str) -> usize {
        self.import(SymbolKind::Type, name, Some(package))
    }

    fn import(&mut self, kind: SymbolKind, name: &str, package: Option<usize>) -> usize {
        self.module.header.imports.push(Import {
            kind,
            name: name.to_owned(),
            package,
        });
        self.module.header.imports.len() - 1
    }

    /// Export a struct type; returns its export-table reference.
    pub fn struct_type(
        &mut self,
        name: &str,
        flags: u8,
        fields: &[(&str, VariableType)],
    ) -> i64 {
        let fields = fields
            .iter()
            .map(|(name, ty)| FieldDescriptor {
                name: (*name).to_owned(),
                ty: ty.clone(),
                size: 0,
                offset: 0,
            })
            .collect();
        self.export(
            name,
            ExportDescriptor::Type(StructDescriptor {
                flags,
                fields,
                size: 0,
                alignment: 0,
                layout_id: 0,
            }),
        )
    }

    /// Export a native function binding; returns its export-table reference.
    pub fn native_function(
        &mut self,
        name: &str,
        library: &str,
        return_type: VariableType,
        arg_types: Vec<VariableType>,
    ) -> i64 {
        self.export(
            name,
            ExportDescriptor::Function(FunctionDescriptor {
                signature: FunctionSignature {
                    return_type,
                    arg_types,
                },
                body: FunctionBody::Native {
                    library: library.to_owned(),
                },
            }),
        )
    }

    /// Export an interpreted function; `locals` lists the argument types
    /// first, then the extra locals. Returns its export-table reference.
    pub fn function(
        &mut self,
        name: &str,
        return_type: VariableType,
        arg_types: Vec<VariableType>,
        extra_locals: Vec<VariableType>,
        asm: Asm,
    ) -> i64 {
        self.next_label = asm.next_label;

        let mut locals = arg_types.clone();
        locals.extend(extra_locals);

        let export = self.export(
            name,
            ExportDescriptor::Function(FunctionDescriptor {
                signature: FunctionSignature {
                    return_type,
                    arg_types,
                },
                body: FunctionBody::Bytecode {
                    entry: 0,
                    size: 0,
                    locals,
                },
            }),
        );
        #[allow(clippy::cast_sign_loss)]
        self.bodies.push((export as usize, asm.w.into_bytes()));
        export
    }

    pub fn export_constant(&mut self, name: &str, pool_index: usize) -> i64 {
        self.export(name, ExportDescriptor::Constant(pool_index))
    }

    fn export(&mut self, name: &str, desc: ExportDescriptor) -> i64 {
        self.module.header.exports.push(Export {
            name: name.to_owned(),
            desc,
        });
        i64::try_from(self.module.header.exports.len() - 1).expect("export count fits in i64")
    }

    /// Concatenate the function bodies into the code blob and serialize.
    pub fn build(mut self) -> Vec<u8> {
        let mut code = Vec::new();
        for (export_index, bytes) in self.bodies {
            let entry = code.len();
            code.extend_from_slice(&bytes);
            let Export { desc, .. } = &mut self.module.header.exports[export_index];
            let ExportDescriptor::Function(desc) = desc else {
                unreachable!("bodies reference function exports");
            };
            let FunctionBody::Bytecode { entry: e, size, .. } = &mut desc.body else {
                unreachable!("bodies reference interpreted functions");
            };
            *e = entry;
            *size = bytes.len();
        }
        self.module.code = code;
        self.module.encode()
    }
}
