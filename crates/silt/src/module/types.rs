//! Source-language type representation and its wire encoding.
//!
//! A type serializes as zero or more `[` bytes (one per array dimension),
//! followed by a single-letter tag for built-ins or `C<name>;` for structs,
//! followed by a VLE import index (`-1` for types local to the module).

use std::fmt;

use super::rw::{Reader, Writer};
use crate::error::ErrorKind;

/// Width of a managed reference on the operand stack and in object memory.
pub const REF_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BaseType {
    Void,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Str,
    Struct(String),
}

impl BaseType {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Void => "void",
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::Str => "str",
            Self::Struct(name) => name,
        }
    }

    fn tag(&self) -> Option<u8> {
        match self {
            Self::Void => Some(b'v'),
            Self::I8 => Some(b'b'),
            Self::I16 => Some(b's'),
            Self::I32 => Some(b'i'),
            Self::I64 => Some(b'l'),
            Self::F32 => Some(b'f'),
            Self::F64 => Some(b'd'),
            Self::Str => Some(b'a'),
            Self::Struct(_) => None,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'v' => Some(Self::Void),
            b'b' => Some(Self::I8),
            b's' => Some(Self::I16),
            b'i' => Some(Self::I32),
            b'l' => Some(Self::I64),
            b'f' => Some(Self::F32),
            b'd' => Some(Self::F64),
            b'a' => Some(Self::Str),
            _ => None,
        }
    }
}

/// A variable type: base type, array dimension count, optional owning import
/// and optional GC layout id.
///
/// Two types are equal iff their encoded forms and layout ids agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariableType {
    pub base: BaseType,
    pub array_dims: usize,
    pub import_index: Option<usize>,
    pub layout_id: Option<usize>,
}

impl VariableType {
    #[must_use]
    pub fn scalar(base: BaseType) -> Self {
        Self {
            base,
            array_dims: 0,
            import_index: None,
            layout_id: None,
        }
    }

    #[must_use]
    pub fn array(base: BaseType, dims: usize) -> Self {
        Self {
            base,
            array_dims: dims,
            import_index: None,
            layout_id: None,
        }
    }

    #[must_use]
    pub fn imported(base: BaseType, import_index: usize) -> Self {
        Self {
            base,
            array_dims: 0,
            import_index: Some(import_index),
            layout_id: None,
        }
    }

    #[must_use]
    pub fn is_array(&self) -> bool {
        self.array_dims > 0
    }

    #[must_use]
    pub fn is_void(&self) -> bool {
        !self.is_array() && self.base == BaseType::Void
    }

    /// Whether values of this type are managed references.
    #[must_use]
    pub fn is_gc(&self) -> bool {
        if self.is_void() {
            return false;
        }
        self.is_array() || matches!(self.base, BaseType::Str | BaseType::Struct(_))
    }

    /// Byte size of a field of this type inside a raw object.
    #[must_use]
    pub fn field_size(&self) -> usize {
        if self.is_gc() {
            return REF_SIZE;
        }
        match self.base {
            BaseType::Void => 0,
            BaseType::I8 => 1,
            BaseType::I16 => 2,
            BaseType::I32 | BaseType::F32 => 4,
            BaseType::I64 | BaseType::F64 => 8,
            BaseType::Str | BaseType::Struct(_) => REF_SIZE,
        }
    }

    /// Byte alignment of a field of this type inside a raw object.
    #[must_use]
    pub fn field_alignment(&self) -> usize {
        self.field_size().max(1)
    }

    /// Byte width a value of this type occupies on the operand stack and in
    /// the locals area. Small integers widen to a full category-1 slot.
    #[must_use]
    pub fn stack_width(&self) -> usize {
        if self.is_gc() {
            return REF_SIZE;
        }
        match self.base {
            BaseType::Void => 0,
            BaseType::I8 | BaseType::I16 | BaseType::I32 | BaseType::F32 => 4,
            BaseType::I64 | BaseType::F64 => 8,
            BaseType::Str | BaseType::Struct(_) => REF_SIZE,
        }
    }

    /// Encode into the wire form (without the trailing import index).
    #[must_use]
    pub fn encode(&self) -> String {
        let mut s = String::new();
        for _ in 0..self.array_dims {
            s.push('[');
        }
        match &self.base {
            BaseType::Struct(name) => {
                s.push('C');
                s.push_str(name);
                s.push(';');
            }
            base => s.push(char::from(base.tag().expect("built-in type has a tag"))),
        }
        s
    }

    pub fn write(&self, w: &mut Writer) {
        w.raw(self.encode().as_bytes());
        match self.import_index {
            Some(idx) => w.vle(i64::try_from(idx).expect("import index fits in i64")),
            None => w.vle(-1),
        }
    }

    pub fn read(r: &mut Reader<'_>) -> Result<Self, ErrorKind> {
        let mut array_dims = 0;
        let mut tag = r.u8()?;
        while tag == b'[' {
            array_dims += 1;
            tag = r.u8()?;
        }

        let base = if tag == b'C' {
            let mut name = String::new();
            loop {
                let c = r.u8()?;
                if c == b';' {
                    break;
                }
                name.push(char::from(c));
            }
            if name.is_empty() {
                return Err(ErrorKind::MalformedModule("empty struct name".into()));
            }
            BaseType::Struct(name)
        } else {
            BaseType::from_tag(tag).ok_or_else(|| {
                ErrorKind::MalformedModule(format!("unknown type tag '{}'", char::from(tag)))
            })?
        };

        let import = r.vle()?;
        let import_index = if import >= 0 {
            Some(usize::try_from(import).expect("non-negative"))
        } else {
            None
        };

        Ok(Self {
            base,
            array_dims,
            import_index,
            layout_id: None,
        })
    }
}

impl fmt::Display for VariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base.name())?;
        for _ in 0..self.array_dims {
            write!(f, "[]")?;
        }
        Ok(())
    }
}

/// Qualified name of a type for the GC layout registry.
#[must_use]
pub fn make_type_name(module: &str, ty: &str) -> String {
    format!("{module}.{ty}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(ty: &VariableType) -> VariableType {
        let mut w = Writer::new();
        ty.write(&mut w);
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        let decoded = VariableType::read(&mut r).unwrap();
        assert!(r.is_at_end());
        decoded
    }

    #[test]
    fn test_builtin_encoding() {
        assert_eq!(VariableType::scalar(BaseType::I32).encode(), "i");
        assert_eq!(VariableType::array(BaseType::F64, 2).encode(), "[[d");
        assert_eq!(
            VariableType::scalar(BaseType::Struct("point".into())).encode(),
            "Cpoint;"
        );
    }

    #[test]
    fn test_wire_round_trip() {
        let types = [
            VariableType::scalar(BaseType::Void),
            VariableType::scalar(BaseType::I64),
            VariableType::array(BaseType::Str, 1),
            VariableType::imported(BaseType::Struct("vec2".into()), 3),
            VariableType::array(BaseType::Struct("node".into()), 2),
        ];
        for ty in &types {
            assert_eq!(&round_trip(ty), ty);
        }
    }

    #[test]
    fn test_gc_classification() {
        assert!(!VariableType::scalar(BaseType::I32).is_gc());
        assert!(!VariableType::scalar(BaseType::Void).is_gc());
        assert!(VariableType::scalar(BaseType::Str).is_gc());
        assert!(VariableType::array(BaseType::I32, 1).is_gc());
        assert!(VariableType::scalar(BaseType::Struct("s".into())).is_gc());
    }

    #[test]
    fn test_widths() {
        assert_eq!(VariableType::scalar(BaseType::I8).stack_width(), 4);
        assert_eq!(VariableType::scalar(BaseType::I8).field_size(), 1);
        assert_eq!(VariableType::scalar(BaseType::I64).stack_width(), 8);
        assert_eq!(VariableType::array(BaseType::I8, 1).stack_width(), REF_SIZE);
        assert_eq!(VariableType::scalar(BaseType::Str).field_size(), REF_SIZE);
    }
}
