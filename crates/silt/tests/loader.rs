//! Module loading failures: malformed streams, label resolution, the
//! dataflow stack-height validation, import cycles and native struct layout
//! checks.

use silt::bytecode::Opcode;
use silt::harness::{context_with, ModuleBuilder};
use silt::module::{struct_flags, BaseType, VariableType};
use silt::ErrorKind;

fn i32_ty() -> VariableType {
    VariableType::scalar(BaseType::I32)
}

fn void_ty() -> VariableType {
    VariableType::scalar(BaseType::Void)
}

#[test]
fn test_unknown_opcode_rejected() {
    let mut b = ModuleBuilder::new();
    let mut asm = b.asm();
    asm.raw_u8(0xee);
    b.function("f", void_ty(), vec![], vec![], asm);

    let mut ctx = context_with([("m", b.build())]);
    let err = ctx.resolve_module("m").unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::UnknownOpcode(0xee)));
}

#[test]
fn test_unresolved_label_rejected() {
    let mut b = ModuleBuilder::new();
    let mut asm = b.asm();
    asm.jmp(99).op(Opcode::Ret);
    b.function("f", void_ty(), vec![], vec![], asm);

    let mut ctx = context_with([("m", b.build())]);
    let err = ctx.resolve_module("m").unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Decode(_)));
    assert!(err.to_string().contains("unresolved label"));
}

#[test]
fn test_divergent_branch_heights_rejected() {
    // One branch pushes two values, the other one; the join point would see
    // two different stack heights.
    let mut b = ModuleBuilder::new();
    let mut asm = b.asm();
    let two = asm.label();
    let one = asm.label();
    let join = asm.label();
    asm.iconst(1).jnz(two, one);
    asm.place(two).iconst(1).iconst(2).jmp(join);
    asm.place(one).iconst(3).jmp(join);
    asm.place(join).op(Opcode::Pop).op(Opcode::Ret);
    b.function("f", void_ty(), vec![], vec![], asm);

    let mut ctx = context_with([("m", b.build())]);
    let err = ctx.resolve_module("m").unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InconsistentStackHeight(_)));
}

#[test]
fn test_negative_stack_height_rejected() {
    let mut b = ModuleBuilder::new();
    let mut asm = b.asm();
    asm.op(Opcode::Pop).op(Opcode::Ret);
    b.function("f", void_ty(), vec![], vec![], asm);

    let mut ctx = context_with([("m", b.build())]);
    let err = ctx.resolve_module("m").unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::NegativeStackHeight));
}

#[test]
fn test_missing_return_rejected() {
    let mut b = ModuleBuilder::new();
    let mut asm = b.asm();
    asm.iconst(1);
    b.function("f", i32_ty(), vec![], vec![], asm);

    let mut ctx = context_with([("m", b.build())]);
    let err = ctx.resolve_module("m").unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Decode(_)));
}

#[test]
fn test_empty_function_rejected() {
    let mut b = ModuleBuilder::new();
    let asm = b.asm();
    b.function("f", void_ty(), vec![], vec![], asm);

    let mut ctx = context_with([("m", b.build())]);
    let err = ctx.resolve_module("m").unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Decode(_)));
}

#[test]
fn test_import_cycle_rejected() {
    let mut a = ModuleBuilder::new();
    let pkg_b = a.import_package("b");
    a.import_function(pkg_b, "g");

    let mut b = ModuleBuilder::new();
    let pkg_a = b.import_package("a");
    b.import_function(pkg_a, "f");

    let mut ctx = context_with([("a", a.build()), ("b", b.build())]);
    let err = ctx.resolve_module("a").unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::ImportCycle(_)));
}

#[test]
fn test_native_struct_layout_checked() {
    // A `native`-flagged struct checks against a layout registered by host
    // code before the module loads.
    let mut b = ModuleBuilder::new();
    b.struct_type(
        "handle",
        struct_flags::NATIVE,
        &[
            ("id", i32_ty()),
            ("name", VariableType::scalar(BaseType::Str)),
        ],
    );
    let bytes = b.build();

    // Matching layout: the str field sits at offset 8.
    let mut ctx = context_with([("m", bytes.clone())]);
    ctx.gc_mut()
        .register_type_layout("m.handle".into(), vec![8])
        .unwrap();
    ctx.resolve_module("m").unwrap();

    // Mismatching layout.
    let mut ctx = context_with([("m", bytes.clone())]);
    ctx.gc_mut()
        .register_type_layout("m.handle".into(), vec![0])
        .unwrap();
    assert!(matches!(
        ctx.resolve_module("m").unwrap_err().kind(),
        ErrorKind::Gc(_)
    ));

    // No pre-registered layout at all.
    let mut ctx = context_with([("m", bytes)]);
    assert!(matches!(
        ctx.resolve_module("m").unwrap_err().kind(),
        ErrorKind::Gc(_)
    ));
}

#[test]
fn test_unregistered_native_function_rejected() {
    let mut b = ModuleBuilder::new();
    b.native_function("frobnicate", "exotic", void_ty(), vec![]);

    let mut ctx = context_with([("m", b.build())]);
    let err = ctx.resolve_module("m").unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::UnresolvedImport(_)));
}

#[test]
fn test_truncated_module_rejected() {
    let mut b = ModuleBuilder::new();
    let mut asm = b.asm();
    asm.iconst(1).op(Opcode::IRet);
    b.function("f", i32_ty(), vec![], vec![], asm);
    let mut bytes = b.build();
    bytes.truncate(bytes.len() - 3);

    let mut ctx = context_with([("m", bytes)]);
    let err = ctx.resolve_module("m").unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::MalformedModule(_)));
}

#[test]
fn test_labels_published_after_load() {
    let mut b = ModuleBuilder::new();
    let mut asm = b.asm();
    let skip = asm.label();
    asm.jmp(skip);
    asm.place(skip).op(Opcode::Ret);
    b.function("f", void_ty(), vec![], vec![], asm);

    let mut ctx = context_with([("m", b.build())]);
    let mid = ctx.resolve_module("m").unwrap();
    let loader = ctx.loader(mid);
    assert_eq!(loader.labels.get(&skip).copied(), Some(1));
}
