//! Persisted module model and its binary format.
//!
//! A module is serialized as: magic, format version, constant pool, import
//! table, export table, and the code blob in its unrewritten on-disk form.
//! Loading (import resolution, struct layout computation, instruction
//! rewriting) happens in [`crate::loader`]; this module only maps between
//! bytes and the structured header.

pub mod rw;
mod types;

pub use types::{make_type_name, BaseType, VariableType, REF_SIZE};

use rw::{Reader, Writer};

use crate::error::ErrorKind;

pub const MAGIC: &[u8; 4] = b"SILT";
pub const FORMAT_VERSION: i64 = 1;

/// Struct descriptor flags.
pub mod struct_flags {
    /// Layout is pre-registered by host code; the loader checks instead of
    /// registering.
    pub const NATIVE: u8 = 1;
    /// `checkcast` on this struct always succeeds.
    pub const ALLOW_CAST: u8 = 2;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    I32(i32),
    F32(f32),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SymbolKind {
    Package = 0,
    Type = 1,
    Function = 2,
    Constant = 3,
    Macro = 4,
}

impl SymbolKind {
    fn from_byte(byte: u8) -> Result<Self, ErrorKind> {
        match byte {
            0 => Ok(Self::Package),
            1 => Ok(Self::Type),
            2 => Ok(Self::Function),
            3 => Ok(Self::Constant),
            4 => Ok(Self::Macro),
            _ => Err(ErrorKind::MalformedModule(format!(
                "unknown symbol kind '{byte}'"
            ))),
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Package => "package",
            Self::Type => "type",
            Self::Function => "function",
            Self::Constant => "constant",
            Self::Macro => "macro",
        }
    }
}

/// Entry of the import table. Non-package entries carry the index of their
/// owning package entry.
#[derive(Debug, Clone)]
pub struct Import {
    pub kind: SymbolKind,
    pub name: String,
    pub package: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub ty: VariableType,
    /// Computed at load time.
    pub size: usize,
    /// Computed at load time.
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub struct StructDescriptor {
    pub flags: u8,
    pub fields: Vec<FieldDescriptor>,
    /// Computed at load time.
    pub size: usize,
    /// Computed at load time.
    pub alignment: usize,
    /// Computed at load time.
    pub layout_id: usize,
}

#[derive(Debug, Clone)]
pub struct FunctionSignature {
    pub return_type: VariableType,
    pub arg_types: Vec<VariableType>,
}

#[derive(Debug, Clone)]
pub enum FunctionBody {
    Native {
        library: String,
    },
    Bytecode {
        /// Byte offset of the function's code in the on-disk blob.
        entry: usize,
        /// Byte size of the function's code in the on-disk blob.
        size: usize,
        /// Argument types first, then local variable types.
        locals: Vec<VariableType>,
    },
}

#[derive(Debug, Clone)]
pub struct FunctionDescriptor {
    pub signature: FunctionSignature,
    pub body: FunctionBody,
}

#[derive(Debug, Clone)]
pub enum ExportDescriptor {
    Function(FunctionDescriptor),
    Type(StructDescriptor),
    /// Index into the constant pool.
    Constant(usize),
    /// Compiler-facing payload; opaque to the runtime.
    Macro(Vec<u8>),
}

impl ExportDescriptor {
    #[must_use]
    pub fn kind(&self) -> SymbolKind {
        match self {
            Self::Function(_) => SymbolKind::Function,
            Self::Type(_) => SymbolKind::Type,
            Self::Constant(_) => SymbolKind::Constant,
            Self::Macro(_) => SymbolKind::Macro,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Export {
    pub name: String,
    pub desc: ExportDescriptor,
}

#[derive(Debug, Clone, Default)]
pub struct ModuleHeader {
    pub constants: Vec<Constant>,
    pub imports: Vec<Import>,
    pub exports: Vec<Export>,
}

/// A parsed module, before loading.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub header: ModuleHeader,
    /// Unrewritten instruction stream.
    pub code: Vec<u8>,
}

impl Module {
    pub fn parse(bytes: &[u8]) -> Result<Self, ErrorKind> {
        let mut r = Reader::new(bytes);

        if r.bytes(4)? != MAGIC {
            return Err(ErrorKind::MalformedModule("bad magic".into()));
        }
        let version = r.vle()?;
        if version != FORMAT_VERSION {
            return Err(ErrorKind::MalformedModule(format!(
                "unsupported format version {version}"
            )));
        }

        let mut constants = Vec::new();
        for _ in 0..r.vle_index()? {
            constants.push(read_constant(&mut r)?);
        }

        let mut imports = Vec::new();
        for _ in 0..r.vle_index()? {
            let kind = SymbolKind::from_byte(r.u8()?)?;
            let name = r.string()?;
            let package = r.vle()?;
            let package = if package >= 0 {
                Some(usize::try_from(package).expect("non-negative"))
            } else {
                None
            };
            imports.push(Import {
                kind,
                name,
                package,
            });
        }

        let mut exports = Vec::new();
        for _ in 0..r.vle_index()? {
            exports.push(read_export(&mut r)?);
        }

        let code_len = r.vle_index()?;
        let code = r.bytes(code_len)?.to_vec();

        if !r.is_at_end() {
            return Err(ErrorKind::MalformedModule(
                "trailing bytes after code blob".into(),
            ));
        }

        Ok(Self {
            header: ModuleHeader {
                constants,
                imports,
                exports,
            },
            code,
        })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.raw(MAGIC);
        w.vle(FORMAT_VERSION);

        w.vle_index(self.header.constants.len());
        for c in &self.header.constants {
            write_constant(&mut w, c);
        }

        w.vle_index(self.header.imports.len());
        for imp in &self.header.imports {
            w.u8(imp.kind as u8);
            w.string(&imp.name);
            match imp.package {
                Some(idx) => w.vle_index(idx),
                None => w.vle(-1),
            }
        }

        w.vle_index(self.header.exports.len());
        for exp in &self.header.exports {
            write_export(&mut w, exp);
        }

        w.vle_index(self.code.len());
        w.raw(&self.code);
        w.into_bytes()
    }
}

fn read_constant(r: &mut Reader<'_>) -> Result<Constant, ErrorKind> {
    match r.u8()? {
        0 => Ok(Constant::I32(r.u32()? as i32)),
        1 => Ok(Constant::F32(r.f32()?)),
        2 => Ok(Constant::Str(r.string()?)),
        tag => Err(ErrorKind::MalformedModule(format!(
            "unknown constant tag '{tag}'"
        ))),
    }
}

fn write_constant(w: &mut Writer, c: &Constant) {
    match c {
        Constant::I32(v) => {
            w.u8(0);
            w.u32(*v as u32);
        }
        Constant::F32(v) => {
            w.u8(1);
            w.f32(*v);
        }
        Constant::Str(s) => {
            w.u8(2);
            w.string(s);
        }
    }
}

fn read_export(r: &mut Reader<'_>) -> Result<Export, ErrorKind> {
    let kind = SymbolKind::from_byte(r.u8()?)?;
    let name = r.string()?;
    let desc = match kind {
        SymbolKind::Function => {
            let return_type = VariableType::read(r)?;
            let mut arg_types = Vec::new();
            for _ in 0..r.vle_index()? {
                arg_types.push(VariableType::read(r)?);
            }
            let native = r.u8()? != 0;
            let body = if native {
                FunctionBody::Native {
                    library: r.string()?,
                }
            } else {
                let entry = r.vle_index()?;
                let size = r.vle_index()?;
                let mut locals = Vec::new();
                for _ in 0..r.vle_index()? {
                    locals.push(VariableType::read(r)?);
                }
                FunctionBody::Bytecode {
                    entry,
                    size,
                    locals,
                }
            };
            ExportDescriptor::Function(FunctionDescriptor {
                signature: FunctionSignature {
                    return_type,
                    arg_types,
                },
                body,
            })
        }
        SymbolKind::Type => {
            let flags = r.u8()?;
            let mut fields = Vec::new();
            for _ in 0..r.vle_index()? {
                let name = r.string()?;
                let ty = VariableType::read(r)?;
                fields.push(FieldDescriptor {
                    name,
                    ty,
                    size: 0,
                    offset: 0,
                });
            }
            ExportDescriptor::Type(StructDescriptor {
                flags,
                fields,
                size: 0,
                alignment: 0,
                layout_id: 0,
            })
        }
        SymbolKind::Constant => ExportDescriptor::Constant(r.vle_index()?),
        SymbolKind::Macro => {
            let len = r.vle_index()?;
            ExportDescriptor::Macro(r.bytes(len)?.to_vec())
        }
        SymbolKind::Package => {
            return Err(ErrorKind::MalformedModule(
                "package entries are not valid exports".into(),
            ));
        }
    };
    Ok(Export { name, desc })
}

fn write_export(w: &mut Writer, exp: &Export) {
    w.u8(exp.desc.kind() as u8);
    w.string(&exp.name);
    match &exp.desc {
        ExportDescriptor::Function(desc) => {
            desc.signature.return_type.write(w);
            w.vle_index(desc.signature.arg_types.len());
            for ty in &desc.signature.arg_types {
                ty.write(w);
            }
            match &desc.body {
                FunctionBody::Native { library } => {
                    w.u8(1);
                    w.string(library);
                }
                FunctionBody::Bytecode {
                    entry,
                    size,
                    locals,
                } => {
                    w.u8(0);
                    w.vle_index(*entry);
                    w.vle_index(*size);
                    w.vle_index(locals.len());
                    for ty in locals {
                        ty.write(w);
                    }
                }
            }
        }
        ExportDescriptor::Type(desc) => {
            w.u8(desc.flags);
            w.vle_index(desc.fields.len());
            for field in &desc.fields {
                w.string(&field.name);
                field.ty.write(w);
            }
        }
        ExportDescriptor::Constant(idx) => w.vle_index(*idx),
        ExportDescriptor::Macro(payload) => {
            w.vle_index(payload.len());
            w.raw(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_module_round_trip() {
        let module = Module::default();
        let bytes = module.encode();
        let parsed = Module::parse(&bytes).unwrap();
        assert!(parsed.header.constants.is_empty());
        assert!(parsed.header.imports.is_empty());
        assert!(parsed.header.exports.is_empty());
        assert!(parsed.code.is_empty());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let err = Module::parse(b"NOPE\x01").unwrap_err();
        assert!(matches!(err, ErrorKind::MalformedModule(_)));
    }

    #[test]
    fn test_header_round_trip() {
        let mut module = Module::default();
        module.header.constants.push(Constant::I32(42));
        module.header.constants.push(Constant::Str("hi".into()));
        module.header.imports.push(Import {
            kind: SymbolKind::Package,
            name: "std".into(),
            package: None,
        });
        module.header.imports.push(Import {
            kind: SymbolKind::Function,
            name: "string_concat".into(),
            package: Some(0),
        });
        module.header.exports.push(Export {
            name: "f".into(),
            desc: ExportDescriptor::Function(FunctionDescriptor {
                signature: FunctionSignature {
                    return_type: VariableType::scalar(BaseType::I32),
                    arg_types: vec![VariableType::scalar(BaseType::I32)],
                },
                body: FunctionBody::Bytecode {
                    entry: 0,
                    size: 3,
                    locals: vec![VariableType::scalar(BaseType::I32)],
                },
            }),
        });
        module.code = vec![1, 2, 3];

        let parsed = Module::parse(&module.encode()).unwrap();
        assert_eq!(parsed.header.constants, module.header.constants);
        assert_eq!(parsed.header.imports.len(), 2);
        assert_eq!(parsed.header.imports[1].package, Some(0));
        assert_eq!(parsed.header.exports.len(), 1);
        assert_eq!(parsed.code, vec![1, 2, 3]);
    }

    #[test]
    fn test_struct_export_round_trip() {
        let mut module = Module::default();
        module.header.exports.push(Export {
            name: "point".into(),
            desc: ExportDescriptor::Type(StructDescriptor {
                flags: struct_flags::ALLOW_CAST,
                fields: vec![
                    FieldDescriptor {
                        name: "x".into(),
                        ty: VariableType::scalar(BaseType::I32),
                        size: 0,
                        offset: 0,
                    },
                    FieldDescriptor {
                        name: "label".into(),
                        ty: VariableType::scalar(BaseType::Str),
                        size: 0,
                        offset: 0,
                    },
                ],
                size: 0,
                alignment: 0,
                layout_id: 0,
            }),
        });

        let parsed = Module::parse(&module.encode()).unwrap();
        let Export { name, desc } = &parsed.header.exports[0];
        assert_eq!(name, "point");
        let ExportDescriptor::Type(desc) = desc else {
            panic!("expected type export");
        };
        assert_eq!(desc.flags, struct_flags::ALLOW_CAST);
        assert_eq!(desc.fields.len(), 2);
        assert_eq!(desc.fields[1].ty, VariableType::scalar(BaseType::Str));
    }
}
