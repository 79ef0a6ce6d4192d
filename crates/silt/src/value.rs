//! Typed values crossing the host/VM boundary.
//!
//! A [`Value`] either owns host data that is materialized as managed memory
//! when it enters a call (strings and arrays), carries a plain scalar, or
//! borrows a managed handle obtained from an earlier invocation. Owned
//! allocations enter the temporary multiset so a collection cycle during the
//! call cannot reclaim them; the argument scope releases the count when the
//! call returns.

use crate::bytecode::ArrayKind;
use crate::error::ErrorKind;
use crate::gc::{gc_flags, Gc, Ref};
use crate::module::{BaseType, VariableType};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Void,
    I32(i32),
    F32(f32),
    Str(String),
    I32Array(Vec<i32>),
    F32Array(Vec<f32>),
    StrArray(Vec<String>),
    /// A managed struct handle with its GC layout.
    Object { layout_id: usize, handle: Ref },
    /// A typed managed handle, e.g. a value returned from `invoke`.
    Typed {
        ty: VariableType,
        handle: Option<Ref>,
    },
}

impl Value {
    /// Byte size of this value's representation in a locals slot.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::Void => 0,
            Self::I32(_) | Self::F32(_) => 4,
            _ => 8,
        }
    }

    /// Layout id for values that carry one.
    #[must_use]
    pub fn layout_id(&self) -> Option<usize> {
        match self {
            Self::Object { layout_id, .. } => Some(*layout_id),
            Self::Typed { ty, .. } => ty.layout_id,
            _ => None,
        }
    }

    /// Whether the VM representation is a managed reference.
    #[must_use]
    pub fn is_gc(&self) -> bool {
        !matches!(self, Self::Void | Self::I32(_) | Self::F32(_))
    }

    /// The managed handle this value borrows, if any. Owned strings and
    /// arrays have no handle until they are created in a call.
    #[must_use]
    pub fn borrowed_handle(&self) -> Option<Ref> {
        match self {
            Self::Object { handle, .. } => Some(*handle),
            Self::Typed { handle, .. } => *handle,
            _ => None,
        }
    }

    /// Base type name and array flag, for signature validation.
    #[must_use]
    pub fn type_shape(&self) -> (&str, bool) {
        match self {
            Self::Void => ("void", false),
            Self::I32(_) => ("i32", false),
            Self::F32(_) => ("f32", false),
            Self::Str(_) => ("str", false),
            Self::I32Array(_) => ("i32", true),
            Self::F32Array(_) => ("f32", true),
            Self::StrArray(_) => ("str", true),
            Self::Object { .. } => ("@addr", false),
            Self::Typed { ty, .. } => (ty.base.name(), ty.is_array()),
        }
    }

    /// Validate this value against an expected argument type.
    pub fn check_against(&self, index: usize, expected: &VariableType) -> Result<(), ErrorKind> {
        let mismatch = |got: String| ErrorKind::ArgumentType {
            index,
            expected: expected.to_string(),
            got,
        };

        if let Some(layout_id) = self.layout_id() {
            if expected.layout_id != Some(layout_id) {
                return Err(mismatch(format!("layout id {layout_id}")));
            }
            return Ok(());
        }

        let (base, is_array) = self.type_shape();
        if expected.base.name() != base || expected.is_array() != is_array {
            let mut got = base.to_owned();
            if is_array {
                got.push_str("[]");
            }
            return Err(mismatch(got));
        }
        Ok(())
    }

    /// Write the VM representation into a locals slot, allocating managed
    /// memory for owned strings and arrays. Returns the bytes written plus
    /// the handle now living in the slot (if any).
    pub fn create_into(
        &self,
        gc: &mut Gc,
        slot: &mut [u8],
    ) -> Result<(usize, Option<Ref>), ErrorKind> {
        let size = self.size();
        if slot.len() < size {
            return Err(ErrorKind::Runtime(
                "argument does not fit into the locals area".into(),
            ));
        }

        let handle = match self {
            Self::Void => {
                return Err(ErrorKind::UnsupportedBoundaryType("void".into()));
            }
            Self::I32(v) => {
                slot[..4].copy_from_slice(&v.to_le_bytes());
                None
            }
            Self::F32(v) => {
                slot[..4].copy_from_slice(&v.to_le_bytes());
                None
            }
            Self::Str(s) => {
                let r = gc.alloc_str(gc_flags::TEMPORARY);
                *gc.string_mut(r)? = s.clone();
                Some(r)
            }
            Self::I32Array(values) => {
                let r = gc.alloc_array(ArrayKind::I32, values.len(), gc_flags::TEMPORARY)?;
                gc.i32_array_mut(r)?.copy_from_slice(values);
                Some(r)
            }
            Self::F32Array(values) => {
                let r = gc.alloc_array(ArrayKind::F32, values.len(), gc_flags::TEMPORARY)?;
                gc.f32_array_mut(r)?.copy_from_slice(values);
                Some(r)
            }
            Self::StrArray(values) => {
                let r = gc.alloc_array(ArrayKind::Str, values.len(), gc_flags::TEMPORARY)?;
                let elements: Vec<u64> = gc.handles(r)?.to_vec();
                for (bits, value) in elements.iter().zip(values) {
                    let element =
                        Ref::from_bits(*bits).ok_or_else(|| {
                            ErrorKind::Gc("string array element missing".into())
                        })?;
                    *gc.string_mut(element)? = value.clone();
                }
                Some(r)
            }
            Self::Object { handle, .. } => Some(*handle),
            Self::Typed { handle, .. } => *handle,
        };

        if self.is_gc() {
            slot[..8].copy_from_slice(&Ref::to_bits(handle).to_le_bytes());
        }
        Ok((size, handle))
    }

    /// Erase the VM representation from a locals slot. The GC reclaims the
    /// referenced memory once its counts drop.
    pub fn destroy_in(&self, slot: &mut [u8]) -> Result<usize, ErrorKind> {
        let size = self.size();
        if slot.len() < size {
            return Err(ErrorKind::Runtime(
                "argument does not fit into the locals area".into(),
            ));
        }
        slot[..size].fill(0);
        Ok(size)
    }

    /* host-side accessors */

    #[must_use]
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::I32(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Self::F32(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Typed { handle: None, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_create_into() {
        let mut gc = Gc::default();
        let mut slot = [0u8; 4];
        let (size, handle) = Value::I32(-5).create_into(&mut gc, &mut slot).unwrap();
        assert_eq!(size, 4);
        assert_eq!(handle, None);
        assert_eq!(i32::from_le_bytes(slot), -5);
    }

    #[test]
    fn test_string_create_allocates_temporary() {
        let mut gc = Gc::default();
        let mut slot = [0u8; 8];
        let (size, handle) = Value::Str("hi".into())
            .create_into(&mut gc, &mut slot)
            .unwrap();
        assert_eq!(size, 8);
        let handle = handle.unwrap();
        assert!(gc.is_temporary(handle));
        assert_eq!(gc.string(handle).unwrap(), "hi");
        assert_eq!(u64::from_le_bytes(slot), handle.bits());
    }

    #[test]
    fn test_str_array_create() {
        let mut gc = Gc::default();
        let mut slot = [0u8; 8];
        let value = Value::StrArray(vec!["a".into(), "b".into()]);
        let (_, handle) = value.create_into(&mut gc, &mut slot).unwrap();
        let handle = handle.unwrap();
        let elements = gc.handles(handle).unwrap().to_vec();
        assert_eq!(elements.len(), 2);
        let first = Ref::from_bits(elements[0]).unwrap();
        assert_eq!(gc.string(first).unwrap(), "a");
    }

    #[test]
    fn test_check_against() {
        let i32_ty = VariableType::scalar(BaseType::I32);
        let str_ty = VariableType::scalar(BaseType::Str);
        let i32_array_ty = VariableType::array(BaseType::I32, 1);

        assert!(Value::I32(1).check_against(0, &i32_ty).is_ok());
        assert!(Value::I32(1).check_against(0, &str_ty).is_err());
        assert!(Value::I32Array(vec![]).check_against(0, &i32_array_ty).is_ok());
        assert!(Value::I32Array(vec![]).check_against(0, &i32_ty).is_err());
    }

    #[test]
    fn test_destroy_zeroes_slot() {
        let mut slot = [0xffu8; 8];
        let value = Value::Str("x".into());
        value.destroy_in(&mut slot).unwrap();
        assert_eq!(slot, [0u8; 8]);
    }
}
