//! Jumps, conditional branches, loops and the call-depth limit.

use silt::bytecode::Opcode;
use silt::harness::{context_with, MemorySource, ModuleBuilder};
use silt::module::{BaseType, VariableType};
use silt::{Context, ErrorKind, Value};

fn i32_ty() -> VariableType {
    VariableType::scalar(BaseType::I32)
}

#[test]
fn test_branching_abs() {
    let mut b = ModuleBuilder::new();
    let mut asm = b.asm();
    let negative = asm.label();
    let positive = asm.label();
    asm.local(Opcode::ILoad, 0)
        .iconst(0)
        .op(Opcode::ICmpL)
        .jnz(negative, positive);
    asm.place(negative)
        .iconst(0)
        .local(Opcode::ILoad, 0)
        .op(Opcode::ISub)
        .op(Opcode::IRet);
    asm.place(positive).local(Opcode::ILoad, 0).op(Opcode::IRet);
    b.function("abs", i32_ty(), vec![i32_ty()], vec![], asm);

    let mut ctx = context_with([("m", b.build())]);
    assert_eq!(
        ctx.invoke("m", "abs", &[Value::I32(-9)]).unwrap(),
        Value::I32(9)
    );
    assert_eq!(
        ctx.invoke("m", "abs", &[Value::I32(4)]).unwrap(),
        Value::I32(4)
    );
}

#[test]
fn test_loop_sum() {
    // sum(n) = 1 + 2 + ... + n, with a backward jump.
    let mut b = ModuleBuilder::new();
    let mut asm = b.asm();
    let top = asm.label();
    let body = asm.label();
    let done = asm.label();

    // i = 1; acc = 0;
    asm.iconst(1).local(Opcode::IStore, 1);
    asm.iconst(0).local(Opcode::IStore, 2);
    asm.place(top)
        .local(Opcode::ILoad, 1)
        .local(Opcode::ILoad, 0)
        .op(Opcode::ICmpLe)
        .jnz(body, done);
    // acc += i; i += 1;
    asm.place(body)
        .local(Opcode::ILoad, 2)
        .local(Opcode::ILoad, 1)
        .op(Opcode::IAdd)
        .local(Opcode::IStore, 2)
        .local(Opcode::ILoad, 1)
        .iconst(1)
        .op(Opcode::IAdd)
        .local(Opcode::IStore, 1)
        .jmp(top);
    asm.place(done).local(Opcode::ILoad, 2).op(Opcode::IRet);

    b.function(
        "sum",
        i32_ty(),
        vec![i32_ty()],
        vec![i32_ty(), i32_ty()],
        asm,
    );

    let mut ctx = context_with([("m", b.build())]);
    assert_eq!(
        ctx.invoke("m", "sum", &[Value::I32(5)]).unwrap(),
        Value::I32(15)
    );
    assert_eq!(
        ctx.invoke("m", "sum", &[Value::I32(0)]).unwrap(),
        Value::I32(0)
    );
}

#[test]
fn test_call_depth_limit() {
    let mut b = ModuleBuilder::new();
    let mut asm = b.asm();
    asm.symbol(Opcode::Invoke, 0).op(Opcode::Ret);
    b.function("forever", VariableType::scalar(BaseType::Void), vec![], vec![], asm);

    let mut source = MemorySource::new();
    source.insert("m", b.build());
    let mut ctx = Context::with_limits(Box::new(source), 16);
    silt::runtime::register(&mut ctx).unwrap();

    let err = ctx.invoke("m", "forever", &[]).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::CallDepthExceeded(16)));
    assert!(err.to_string().contains("in m.forever"));
}
