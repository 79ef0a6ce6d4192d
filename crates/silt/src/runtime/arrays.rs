//! Runtime array support.

use super::{pop_object, release, LIBRARY};
use crate::context::Context;
use crate::error::{ErrorKind, Result};
use crate::gc::{Gc, GcKind};
use crate::stack::OperandStack;

pub(super) fn register(ctx: &mut Context) -> Result<()> {
    ctx.register_native(LIBRARY, "array_copy", array_copy)?;
    Ok(())
}

/// `array_copy(from: array, to: array)`
///
/// Copies all of `from` into the start of `to`. The arrays must have the
/// same element kind and `to` must be at least as long as `from`. Reference
/// arrays copy handles, so both arrays alias the same elements afterwards.
fn array_copy(gc: &mut Gc, stack: &mut OperandStack) -> Result<()> {
    let to = pop_object(gc, stack, "array_copy")?;
    let from = pop_object(gc, stack, "array_copy")?;

    let from_kind = gc.kind_of(from)?;
    let to_kind = gc.kind_of(to)?;
    if from_kind != to_kind {
        return Err(ErrorKind::Runtime("array_copy: type mismatch".into()).into());
    }

    let too_small = || ErrorKind::Runtime("array_copy: destination array is too small".into());

    match from_kind {
        GcKind::ArrayI8 => {
            let source = gc.i8_array(from)?.to_vec();
            let dest = gc.i8_array_mut(to)?;
            dest.get_mut(..source.len())
                .ok_or_else(too_small)?
                .copy_from_slice(&source);
        }
        GcKind::ArrayI16 => {
            let source = gc.i16_array(from)?.to_vec();
            let dest = gc.i16_array_mut(to)?;
            dest.get_mut(..source.len())
                .ok_or_else(too_small)?
                .copy_from_slice(&source);
        }
        GcKind::ArrayI32 => {
            let source = gc.i32_array(from)?.to_vec();
            let dest = gc.i32_array_mut(to)?;
            dest.get_mut(..source.len())
                .ok_or_else(too_small)?
                .copy_from_slice(&source);
        }
        GcKind::ArrayI64 => {
            let source = gc.i64_array(from)?.to_vec();
            let dest = gc.i64_array_mut(to)?;
            dest.get_mut(..source.len())
                .ok_or_else(too_small)?
                .copy_from_slice(&source);
        }
        GcKind::ArrayF32 => {
            let source = gc.f32_array(from)?.to_vec();
            let dest = gc.f32_array_mut(to)?;
            dest.get_mut(..source.len())
                .ok_or_else(too_small)?
                .copy_from_slice(&source);
        }
        GcKind::ArrayF64 => {
            let source = gc.f64_array(from)?.to_vec();
            let dest = gc.f64_array_mut(to)?;
            dest.get_mut(..source.len())
                .ok_or_else(too_small)?
                .copy_from_slice(&source);
        }
        GcKind::ArrayStr | GcKind::ArrayRef => {
            let source = gc.handles(from)?.to_vec();
            let dest = gc.handles_mut(to)?;
            dest.get_mut(..source.len())
                .ok_or_else(too_small)?
                .copy_from_slice(&source);
        }
        GcKind::Str | GcKind::Raw => {
            return Err(ErrorKind::Runtime("array_copy: unsupported type".into()).into());
        }
    }

    release(gc, to)?;
    release(gc, from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ArrayKind;
    use crate::gc::gc_flags;

    #[test]
    fn test_array_copy_i32() {
        let mut gc = Gc::default();
        let mut stack = OperandStack::new(32);

        let from = gc
            .alloc_array(ArrayKind::I32, 2, gc_flags::TEMPORARY)
            .unwrap();
        gc.i32_array_mut(from).unwrap().copy_from_slice(&[7, 9]);
        let to = gc
            .alloc_array(ArrayKind::I32, 3, gc_flags::TEMPORARY)
            .unwrap();

        stack.push_ref(Some(from)).unwrap();
        stack.push_ref(Some(to)).unwrap();
        array_copy(&mut gc, &mut stack).unwrap();

        assert_eq!(gc.i32_array(to).unwrap(), &[7, 9, 0]);
        assert!(!gc.is_temporary(to));
    }

    #[test]
    fn test_array_copy_rejects_short_destination() {
        let mut gc = Gc::default();
        let mut stack = OperandStack::new(32);

        let from = gc
            .alloc_array(ArrayKind::I32, 3, gc_flags::TEMPORARY)
            .unwrap();
        let to = gc
            .alloc_array(ArrayKind::I32, 1, gc_flags::TEMPORARY)
            .unwrap();

        stack.push_ref(Some(from)).unwrap();
        stack.push_ref(Some(to)).unwrap();
        assert!(array_copy(&mut gc, &mut stack).is_err());
    }

    #[test]
    fn test_array_copy_rejects_kind_mismatch() {
        let mut gc = Gc::default();
        let mut stack = OperandStack::new(32);

        let from = gc
            .alloc_array(ArrayKind::I32, 1, gc_flags::TEMPORARY)
            .unwrap();
        let to = gc
            .alloc_array(ArrayKind::F32, 1, gc_flags::TEMPORARY)
            .unwrap();

        stack.push_ref(Some(from)).unwrap();
        stack.push_ref(Some(to)).unwrap();
        assert!(array_copy(&mut gc, &mut stack).is_err());
    }
}
