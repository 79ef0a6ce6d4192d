//! Runtime string support.

use super::{pop_string, release, LIBRARY};
use crate::context::Context;
use crate::error::{ErrorKind, Result};
use crate::gc::{gc_flags, Gc, Ref};
use crate::stack::OperandStack;

pub(super) fn register(ctx: &mut Context) -> Result<()> {
    ctx.register_native(LIBRARY, "string_length", string_length)?;
    ctx.register_native(LIBRARY, "string_equals", string_equals)?;
    ctx.register_native(LIBRARY, "string_concat", string_concat)?;
    ctx.register_native(LIBRARY, "i32_to_string", i32_to_string)?;
    ctx.register_native(LIBRARY, "f32_to_string", f32_to_string)?;
    ctx.register_native(LIBRARY, "parse_i32", parse_i32)?;
    ctx.register_native(LIBRARY, "parse_f32", parse_f32)?;
    Ok(())
}

/// `string_length(s: str) -> i32`
fn string_length(gc: &mut Gc, stack: &mut OperandStack) -> Result<()> {
    let s = pop_string(gc, stack, "string_length")?;
    let length = i32::try_from(gc.string(s)?.len())
        .map_err(|_| ErrorKind::Runtime("string_length: length overflow".into()))?;
    release(gc, s)?;
    stack.push_i32(length)?;
    Ok(())
}

/// `string_equals(s1: str, s2: str) -> i32`
fn string_equals(gc: &mut Gc, stack: &mut OperandStack) -> Result<()> {
    let s2 = pop_string(gc, stack, "string_equals")?;
    let s1 = pop_string(gc, stack, "string_equals")?;
    let equal = gc.string(s1)? == gc.string(s2)?;
    release(gc, s2)?;
    release(gc, s1)?;
    stack.push_i32(i32::from(equal))?;
    Ok(())
}

/// `string_concat(s1: str, s2: str) -> str`
fn string_concat(gc: &mut Gc, stack: &mut OperandStack) -> Result<()> {
    let s2 = pop_string(gc, stack, "string_concat")?;
    let s1 = pop_string(gc, stack, "string_concat")?;

    let mut combined = gc.string(s1)?.to_owned();
    combined.push_str(gc.string(s2)?);

    // The arguments keep their temporary counts across this allocation, so
    // a collection cycle here cannot reclaim them.
    let result = gc.alloc_str(gc_flags::TEMPORARY);
    *gc.string_mut(result)? = combined;

    release(gc, s2)?;
    release(gc, s1)?;
    stack.push_ref(Some(result))?;
    Ok(())
}

/// `i32_to_string(value: i32) -> str`
fn i32_to_string(gc: &mut Gc, stack: &mut OperandStack) -> Result<()> {
    let value = stack.pop_i32()?;
    let s = gc.alloc_str(gc_flags::TEMPORARY);
    *gc.string_mut(s)? = value.to_string();
    stack.push_ref(Some(s))?;
    Ok(())
}

/// `f32_to_string(value: f32) -> str`
fn f32_to_string(gc: &mut Gc, stack: &mut OperandStack) -> Result<()> {
    let value = stack.pop_f32()?;
    let s = gc.alloc_str(gc_flags::TEMPORARY);
    *gc.string_mut(s)? = value.to_string();
    stack.push_ref(Some(s))?;
    Ok(())
}

/// `parse_i32(s: str) -> std.result`
fn parse_i32(gc: &mut Gc, stack: &mut OperandStack) -> Result<()> {
    let s = pop_string(gc, stack, "parse_i32")?;
    let parsed = gc.string(s)?.trim().parse::<i32>().ok();
    let result = make_result(gc, super::I32S_TYPE, parsed.map(i32::to_le_bytes))?;
    release(gc, s)?;
    stack.push_ref(Some(result))?;
    Ok(())
}

/// `parse_f32(s: str) -> std.result`
fn parse_f32(gc: &mut Gc, stack: &mut OperandStack) -> Result<()> {
    let s = pop_string(gc, stack, "parse_f32")?;
    let parsed = gc.string(s)?.trim().parse::<f32>().ok();
    let result = make_result(gc, super::F32S_TYPE, parsed.map(f32::to_le_bytes))?;
    release(gc, s)?;
    stack.push_ref(Some(result))?;
    Ok(())
}

/// Build a `std.result` object holding an optional boxed scalar payload.
/// The payload layout is looked up in the registry rather than hard-coded.
fn make_result(gc: &mut Gc, box_type: &str, payload: Option<[u8; 4]>) -> Result<Ref> {
    let result_layout = gc.layout_id(super::RESULT_TYPE)?;
    let result = gc.alloc_raw(
        result_layout,
        super::RESULT_SIZE,
        super::RESULT_ALIGN,
        gc_flags::TEMPORARY,
    )?;

    let (ok, value_bits) = match payload {
        Some(bytes) => {
            let box_layout = gc.layout_id(box_type)?;
            let boxed = gc.alloc_raw(
                box_layout,
                super::BOX_SIZE,
                super::BOX_ALIGN,
                gc_flags::TEMPORARY,
            )?;
            gc.raw_mut(boxed)?[..4].copy_from_slice(&bytes);
            (1i32, Some(boxed))
        }
        None => (0i32, None),
    };

    let raw = gc.raw_mut(result)?;
    raw[..4].copy_from_slice(&ok.to_le_bytes());
    raw[super::RESULT_VALUE_OFFSET..super::RESULT_VALUE_OFFSET + 8]
        .copy_from_slice(&Ref::to_bits(value_bits).to_le_bytes());

    // The payload is now reachable through the result object.
    if let Some(boxed) = value_bits {
        gc.remove_temporary(Some(boxed))?;
    }
    Ok(result)
}
