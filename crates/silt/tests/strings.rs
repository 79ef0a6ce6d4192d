//! String constants and the `std` string natives, from bytecode and from
//! the host.

use silt::bytecode::Opcode;
use silt::harness::{context_with, ModuleBuilder};
use silt::module::{BaseType, VariableType};
use silt::Value;

fn i32_ty() -> VariableType {
    VariableType::scalar(BaseType::I32)
}

fn str_ty() -> VariableType {
    VariableType::scalar(BaseType::Str)
}

#[test]
fn test_sconst_returns_fresh_string() {
    let mut b = ModuleBuilder::new();
    let pool = b.constant_str("hello");
    let mut asm = b.asm();
    asm.sconst(pool).op(Opcode::SRet);
    b.function("hello", str_ty(), vec![], vec![], asm);

    let mut ctx = context_with([("m", b.build())]);
    assert_eq!(
        ctx.invoke("m", "hello", &[]).unwrap(),
        Value::Str("hello".into())
    );
    assert_eq!(ctx.gc().object_count(), 0);
}

#[test]
fn test_concat_and_equals_via_natives() {
    // fn k() -> i32 { let s = string_concat("a", "b"); return string_equals(s, "ab"); }
    let mut b = ModuleBuilder::new();
    let a = b.constant_str("a");
    let bee = b.constant_str("b");
    let ab = b.constant_str("ab");

    let concat = b.native_function(
        "string_concat",
        "std",
        str_ty(),
        vec![str_ty(), str_ty()],
    );
    let equals = b.native_function(
        "string_equals",
        "std",
        i32_ty(),
        vec![str_ty(), str_ty()],
    );

    let mut asm = b.asm();
    asm.sconst(a)
        .sconst(bee)
        .symbol(Opcode::Invoke, concat)
        .sconst(ab)
        .symbol(Opcode::Invoke, equals)
        .op(Opcode::IRet);
    b.function("k", i32_ty(), vec![], vec![], asm);

    let mut ctx = context_with([("m", b.build())]);
    assert_eq!(ctx.invoke("m", "k", &[]).unwrap(), Value::I32(1));
    assert_eq!(ctx.gc().object_count(), 0);
}

#[test]
fn test_i32_to_string() {
    let mut b = ModuleBuilder::new();
    let to_string = b.native_function("i32_to_string", "std", str_ty(), vec![i32_ty()]);
    let mut asm = b.asm();
    asm.iconst(42).symbol(Opcode::Invoke, to_string).op(Opcode::SRet);
    b.function("f", str_ty(), vec![], vec![], asm);

    let mut ctx = context_with([("m", b.build())]);
    assert_eq!(ctx.invoke("m", "f", &[]).unwrap(), Value::Str("42".into()));
}

#[test]
fn test_string_length_via_bytecode() {
    let mut b = ModuleBuilder::new();
    let pool = b.constant_str("four");
    let length = b.native_function("string_length", "std", i32_ty(), vec![str_ty()]);
    let mut asm = b.asm();
    asm.sconst(pool).symbol(Opcode::Invoke, length).op(Opcode::IRet);
    b.function("f", i32_ty(), vec![], vec![], asm);

    let mut ctx = context_with([("m", b.build())]);
    assert_eq!(ctx.invoke("m", "f", &[]).unwrap(), Value::I32(4));
}

#[test]
fn test_native_invoked_directly_from_host() {
    let mut b = ModuleBuilder::new();
    b.native_function(
        "string_concat",
        "std",
        str_ty(),
        vec![str_ty(), str_ty()],
    );

    let mut ctx = context_with([("m", b.build())]);
    let result = ctx
        .invoke(
            "m",
            "string_concat",
            &[Value::Str("x".into()), Value::Str("y".into())],
        )
        .unwrap();
    assert_eq!(result, Value::Str("xy".into()));
    assert_eq!(ctx.gc().object_count(), 0);
}
