//! Standard native library, registered under the `std` library name.
//!
//! Callbacks follow the VM's native calling convention: arguments are popped
//! in reverse declaration order, each managed argument's temporary refcount
//! is released once the argument is no longer needed (after any allocation
//! that could trigger a collection), and managed results are pushed as
//! temporaries.

mod arrays;
mod math;
mod strings;

use crate::context::Context;
use crate::error::{ErrorKind, Result};
use crate::gc::{Gc, GcKind, Ref};
use crate::stack::OperandStack;

/// Library name for the standard runtime.
pub const LIBRARY: &str = "std";

/// Layout names of the runtime-visible types constructed by native helpers.
pub const RESULT_TYPE: &str = "std.result";
pub const I32S_TYPE: &str = "std.i32s";
pub const F32S_TYPE: &str = "std.f32s";

/// `std.result`: `{ ok: i32 @ 0, value: ref @ 8 }`.
pub const RESULT_SIZE: usize = 16;
pub const RESULT_ALIGN: usize = 8;
pub const RESULT_VALUE_OFFSET: usize = 8;

/// `std.i32s` / `std.f32s`: a boxed scalar `{ value @ 0 }`.
pub const BOX_SIZE: usize = 4;
pub const BOX_ALIGN: usize = 4;

/// Register the built-in GC layouts and the whole `std` native library.
/// Must run before any module referencing `std` is loaded, and only once
/// per context.
pub fn register(ctx: &mut Context) -> Result<()> {
    ctx.gc_mut()
        .register_type_layout(RESULT_TYPE.into(), vec![RESULT_VALUE_OFFSET])?;
    ctx.gc_mut().register_type_layout(I32S_TYPE.into(), vec![])?;
    ctx.gc_mut().register_type_layout(F32S_TYPE.into(), vec![])?;

    strings::register(ctx)?;
    arrays::register(ctx)?;
    math::register(ctx)?;

    ctx.register_native(LIBRARY, "assert", assert)?;
    Ok(())
}

/// Pop a managed reference without touching its temporary count; the caller
/// releases it via [`release`] once the value is no longer needed.
fn pop_object(
    gc: &Gc,
    stack: &mut OperandStack,
    what: &'static str,
) -> Result<Ref> {
    let r = stack.pop_ref()?.ok_or(ErrorKind::NullReference(what))?;
    // Fail early for handles the collector does not know.
    gc.kind_of(r)?;
    Ok(r)
}

fn pop_string(gc: &Gc, stack: &mut OperandStack, what: &'static str) -> Result<Ref> {
    let r = pop_object(gc, stack, what)?;
    if gc.kind_of(r)? != GcKind::Str {
        return Err(ErrorKind::Runtime(format!("{what}: argument is not a string")).into());
    }
    Ok(r)
}

fn release(gc: &mut Gc, r: Ref) -> Result<()> {
    gc.remove_temporary(Some(r))?;
    Ok(())
}

/// `assert(condition: i32, message: str)`
fn assert(gc: &mut Gc, stack: &mut OperandStack) -> Result<()> {
    let message = pop_string(gc, stack, "assert")?;
    let condition = stack.pop_i32()?;
    if condition == 0 {
        return Err(ErrorKind::Runtime(format!(
            "assertion failed: {}",
            gc.string(message)?
        ))
        .into());
    }
    release(gc, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::gc_flags;

    #[test]
    fn test_assert_passes_and_fails() {
        let mut gc = Gc::default();
        let mut stack = OperandStack::new(32);

        let message = gc.alloc_str(gc_flags::TEMPORARY);
        *gc.string_mut(message).unwrap() = "boom".into();
        stack.push_i32(1).unwrap();
        stack.push_ref(Some(message)).unwrap();
        assert!(assert(&mut gc, &mut stack).is_ok());

        let message = gc.alloc_str(gc_flags::TEMPORARY);
        *gc.string_mut(message).unwrap() = "boom".into();
        stack.push_i32(0).unwrap();
        stack.push_ref(Some(message)).unwrap();
        let err = assert(&mut gc, &mut stack).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
