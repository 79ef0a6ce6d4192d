//! Per-instruction decode of the on-disk stream into executable form.
//!
//! Symbolic operands are resolved while decoding: labels become absolute
//! instruction indices, `invoke` gets a `(module, function)` index pair,
//! `new`/`anewarray`/`checkcast` get size/alignment/layout operands, and
//! field accesses get `(size, offset, needs_gc)` triples. Alongside, every
//! instruction's operand-stack byte delta is recorded and a worklist
//! dataflow over the instruction-level control flow graph computes the
//! function's operand-stack capacity; any join disagreement or negative
//! height is a decode error.

use std::collections::HashMap;

use super::{BytecodeFn, FunctionId, ModuleId};
use crate::bytecode::{ArrayKind, Instruction, Opcode, RetKind};
use crate::context::Context;
use crate::error::{ErrorKind, Result};
use crate::module::rw::Reader;
use crate::module::{
    struct_flags, Constant, Export, ExportDescriptor, FunctionSignature, Import, Module,
    StructDescriptor, SymbolKind, VariableType, REF_SIZE,
};

const CAT1: i32 = 4;
const CAT2: i32 = 8;
const REF: i32 = REF_SIZE as i32;

/// Resolved operands of a type reference in the instruction stream.
struct TypeProperties {
    size: usize,
    alignment: usize,
    layout_id: usize,
    flags: u8,
}

struct FieldProperties {
    size: usize,
    offset: usize,
    needs_gc: bool,
}

pub(crate) struct CodeDecoder<'a> {
    ctx: &'a Context,
    self_id: ModuleId,
    module: &'a Module,
    structs: &'a HashMap<String, StructDescriptor>,
    resolved_packages: &'a [Option<ModuleId>],
    export_fids: &'a HashMap<usize, FunctionId>,
    local_signatures: &'a [FunctionSignature],
    code: Vec<Instruction>,
    labels: HashMap<i64, usize>,
}

impl<'a> CodeDecoder<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ctx: &'a Context,
        self_id: ModuleId,
        module: &'a Module,
        structs: &'a HashMap<String, StructDescriptor>,
        resolved_packages: &'a [Option<ModuleId>],
        export_fids: &'a HashMap<usize, FunctionId>,
        local_signatures: &'a [FunctionSignature],
    ) -> Self {
        Self {
            ctx,
            self_id,
            module,
            structs,
            resolved_packages,
            export_fids,
            local_signatures,
            code: Vec::new(),
            labels: HashMap::new(),
        }
    }

    pub(crate) fn finish(self) -> (Vec<Instruction>, HashMap<i64, usize>) {
        (self.code, self.labels)
    }

    /// Rewrite one function's code, filling in its runtime entry point,
    /// length and operand-stack capacity.
    pub(crate) fn decode_function(&mut self, body: &mut BytecodeFn) -> Result<()> {
        let entry = self.code.len();
        let end = body
            .disk_entry
            .checked_add(body.disk_size)
            .filter(|end| *end <= self.module.code.len())
            .ok_or_else(|| {
                ErrorKind::Decode(format!(
                    "function code range {}+{} is outside the code blob",
                    body.disk_entry, body.disk_size
                ))
            })?;

        let mut r = Reader::new(&self.module.code);
        r.seek(body.disk_entry)?;

        let mut deltas = Vec::new();
        let mut fixups: Vec<(usize, u8, i64)> = Vec::new();

        while r.pos() < end {
            let opcode = Opcode::from_byte(r.u8()?)?;
            if let Some((instr, delta)) =
                self.decode_instruction(opcode, &mut r, body, &mut fixups)?
            {
                self.code.push(instr);
                deltas.push(delta);
            }
            if r.pos() > end {
                return Err(ErrorKind::Decode(format!(
                    "instruction '{}' crosses the function boundary",
                    opcode.mnemonic()
                ))
                .into());
            }
        }

        let len = self.code.len() - entry;
        if len == 0 {
            return Err(ErrorKind::Decode("function has no instructions".into()).into());
        }

        // Resolve jump targets now that every label of the function is known.
        for (index, slot, label) in fixups {
            let target = *self
                .labels
                .get(&label)
                .ok_or_else(|| ErrorKind::Decode(format!("unresolved label {label}")))?;
            if target < entry || target >= self.code.len() {
                return Err(ErrorKind::Decode(format!(
                    "label {label} resolves outside the function"
                ))
                .into());
            }
            match &mut self.code[index] {
                Instruction::Jmp { target: t } => *t = target,
                Instruction::Jnz {
                    then_target,
                    else_target,
                } => {
                    if slot == 0 {
                        *then_target = target;
                    } else {
                        *else_target = target;
                    }
                }
                _ => unreachable!("fixups only reference jump instructions"),
            }
        }

        body.runtime.entry = entry;
        body.runtime.len = len;
        body.runtime.stack_size = compute_stack_size(&self.code[entry..], &deltas, entry)?;
        Ok(())
    }

    /// Decode one instruction, returning its executable form and stack
    /// delta. Labels produce no instruction.
    #[allow(clippy::too_many_lines)]
    fn decode_instruction(
        &mut self,
        opcode: Opcode,
        r: &mut Reader<'_>,
        body: &BytecodeFn,
        fixups: &mut Vec<(usize, u8, i64)>,
    ) -> Result<Option<(Instruction, i32)>> {
        use Instruction as I;
        use Opcode as Op;

        let decoded = match opcode {
            /* stack shape */
            Op::Dup => (I::Dup, CAT1),
            Op::Dup2 => (I::Dup2, CAT2),
            Op::ADup => (I::ADup, REF),
            Op::Pop => (I::Pop, -CAT1),
            Op::Pop2 => (I::Pop2, -CAT2),
            Op::APop => (I::APop, -REF),
            Op::DupX1 => {
                let (size1, needs_gc) = dup_operand(r)?;
                let (size2, _) = dup_operand(r)?;
                let delta = i32::try_from(size1).expect("slot sizes are small");
                (
                    I::DupX1 {
                        size1,
                        size2,
                        needs_gc,
                    },
                    delta,
                )
            }
            Op::DupX2 => {
                let (size1, needs_gc) = dup_operand(r)?;
                let (size2, _) = dup_operand(r)?;
                let (size3, _) = dup_operand(r)?;
                let delta = i32::try_from(size1).expect("slot sizes are small");
                (
                    I::DupX2 {
                        size1,
                        size2,
                        size3,
                        needs_gc,
                    },
                    delta,
                )
            }

            /* constants */
            Op::AConstNull => (I::AConstNull, REF),
            Op::IConst => (I::IConst(r.u32()? as i32), CAT1),
            Op::LConst => (I::LConst(r.u64()? as i64), CAT2),
            Op::FConst => (I::FConst(r.f32()?), CAT1),
            Op::DConst => (I::DConst(r.f64()?), CAT2),
            Op::SConst => {
                let index = r.vle_index()?;
                match self.module.header.constants.get(index) {
                    Some(Constant::Str(_)) => {}
                    Some(_) => {
                        return Err(ErrorKind::Decode(format!(
                            "entry {index} of the constant table is not a string"
                        ))
                        .into());
                    }
                    None => {
                        return Err(ErrorKind::Decode(format!(
                            "invalid index '{index}' into constant table"
                        ))
                        .into());
                    }
                }
                (I::SConst(index), REF)
            }

            /* locals */
            Op::ILoad => (I::ILoad { offset: local_offset(r, body)? }, CAT1),
            Op::FLoad => (I::FLoad { offset: local_offset(r, body)? }, CAT1),
            Op::LLoad => (I::LLoad { offset: local_offset(r, body)? }, CAT2),
            Op::DLoad => (I::DLoad { offset: local_offset(r, body)? }, CAT2),
            Op::ALoad => (I::ALoad { offset: local_offset(r, body)? }, REF),
            Op::IStore => (I::IStore { offset: local_offset(r, body)? }, -CAT1),
            Op::FStore => (I::FStore { offset: local_offset(r, body)? }, -CAT1),
            Op::LStore => (I::LStore { offset: local_offset(r, body)? }, -CAT2),
            Op::DStore => (I::DStore { offset: local_offset(r, body)? }, -CAT2),
            Op::AStore => (I::AStore { offset: local_offset(r, body)? }, -REF),

            /* i32 arithmetic and logic */
            Op::IAdd => (I::IAdd, -CAT1),
            Op::ISub => (I::ISub, -CAT1),
            Op::IMul => (I::IMul, -CAT1),
            Op::IDiv => (I::IDiv, -CAT1),
            Op::IMod => (I::IMod, -CAT1),
            Op::IAnd => (I::IAnd, -CAT1),
            Op::IOr => (I::IOr, -CAT1),
            Op::IXor => (I::IXor, -CAT1),
            Op::IShl => (I::IShl, -CAT1),
            Op::IShr => (I::IShr, -CAT1),
            Op::LAnd => (I::LAnd, -CAT1),
            Op::LOr => (I::LOr, -CAT1),

            /* i64 arithmetic */
            Op::LAdd => (I::LAdd, -CAT2),
            Op::LSub => (I::LSub, -CAT2),
            Op::LMul => (I::LMul, -CAT2),
            Op::LDiv => (I::LDiv, -CAT2),
            Op::LMod => (I::LMod, -CAT2),
            Op::LShl => (I::LShl, -CAT1),
            Op::LShr => (I::LShr, -CAT1),

            /* floating point arithmetic */
            Op::FAdd => (I::FAdd, -CAT1),
            Op::FSub => (I::FSub, -CAT1),
            Op::FMul => (I::FMul, -CAT1),
            Op::FDiv => (I::FDiv, -CAT1),
            Op::DAdd => (I::DAdd, -CAT2),
            Op::DSub => (I::DSub, -CAT2),
            Op::DMul => (I::DMul, -CAT2),
            Op::DDiv => (I::DDiv, -CAT2),

            /* conversions */
            Op::I2C => (I::I2C, 0),
            Op::I2S => (I::I2S, 0),
            Op::I2L => (I::I2L, CAT2 - CAT1),
            Op::I2F => (I::I2F, 0),
            Op::I2D => (I::I2D, CAT2 - CAT1),
            Op::L2I => (I::L2I, CAT1 - CAT2),
            Op::L2F => (I::L2F, CAT1 - CAT2),
            Op::L2D => (I::L2D, 0),
            Op::F2I => (I::F2I, 0),
            Op::F2L => (I::F2L, CAT2 - CAT1),
            Op::F2D => (I::F2D, CAT2 - CAT1),
            Op::D2I => (I::D2I, CAT1 - CAT2),
            Op::D2L => (I::D2L, 0),
            Op::D2F => (I::D2F, CAT1 - CAT2),

            /* comparisons */
            Op::ICmpL => (I::ICmpL, -CAT1),
            Op::ICmpLe => (I::ICmpLe, -CAT1),
            Op::ICmpG => (I::ICmpG, -CAT1),
            Op::ICmpGe => (I::ICmpGe, -CAT1),
            Op::ICmpEq => (I::ICmpEq, -CAT1),
            Op::ICmpNe => (I::ICmpNe, -CAT1),
            Op::LCmpL => (I::LCmpL, CAT1 - 2 * CAT2),
            Op::LCmpLe => (I::LCmpLe, CAT1 - 2 * CAT2),
            Op::LCmpG => (I::LCmpG, CAT1 - 2 * CAT2),
            Op::LCmpGe => (I::LCmpGe, CAT1 - 2 * CAT2),
            Op::LCmpEq => (I::LCmpEq, CAT1 - 2 * CAT2),
            Op::LCmpNe => (I::LCmpNe, CAT1 - 2 * CAT2),
            Op::FCmpL => (I::FCmpL, -CAT1),
            Op::FCmpLe => (I::FCmpLe, -CAT1),
            Op::FCmpG => (I::FCmpG, -CAT1),
            Op::FCmpGe => (I::FCmpGe, -CAT1),
            Op::FCmpEq => (I::FCmpEq, -CAT1),
            Op::FCmpNe => (I::FCmpNe, -CAT1),
            Op::DCmpL => (I::DCmpL, CAT1 - 2 * CAT2),
            Op::DCmpLe => (I::DCmpLe, CAT1 - 2 * CAT2),
            Op::DCmpG => (I::DCmpG, CAT1 - 2 * CAT2),
            Op::DCmpGe => (I::DCmpGe, CAT1 - 2 * CAT2),
            Op::DCmpEq => (I::DCmpEq, CAT1 - 2 * CAT2),
            Op::DCmpNe => (I::DCmpNe, CAT1 - 2 * CAT2),
            Op::ACmpEq => (I::ACmpEq, CAT1 - 2 * REF),
            Op::ACmpNe => (I::ACmpNe, CAT1 - 2 * REF),

            /* arrays */
            Op::NewArray => {
                let kind = ArrayKind::from_byte(r.u8()?)?;
                (I::NewArray { kind }, REF - CAT1)
            }
            Op::ANewArray => {
                let properties = self.type_operand(r)?;
                (
                    I::ANewArray {
                        layout_id: properties.layout_id,
                    },
                    REF - CAT1,
                )
            }
            Op::ArrayLength => (I::ArrayLength, CAT1 - REF),
            Op::CALoad => (I::CALoad, -REF),
            Op::SALoad => (I::SALoad, -REF),
            Op::IALoad => (I::IALoad, -REF),
            Op::LALoad => (I::LALoad, CAT2 - CAT1 - REF),
            Op::FALoad => (I::FALoad, -REF),
            Op::DALoad => (I::DALoad, CAT2 - CAT1 - REF),
            Op::AALoad => (I::AALoad, -CAT1),
            Op::CAStore => (I::CAStore, -REF - 2 * CAT1),
            Op::SAStore => (I::SAStore, -REF - 2 * CAT1),
            Op::IAStore => (I::IAStore, -REF - 2 * CAT1),
            Op::LAStore => (I::LAStore, -REF - CAT1 - CAT2),
            Op::FAStore => (I::FAStore, -REF - 2 * CAT1),
            Op::DAStore => (I::DAStore, -REF - CAT1 - CAT2),
            Op::AAStore => (I::AAStore, -2 * REF - CAT1),

            /* objects */
            Op::New => {
                let properties = self.type_operand(r)?;
                (
                    I::New {
                        size: properties.size,
                        alignment: properties.alignment,
                        layout_id: properties.layout_id,
                    },
                    REF,
                )
            }
            Op::GetField => {
                let properties = self.field_operand(r)?;
                let width = field_stack_width(properties.size);
                (
                    I::GetField {
                        size: properties.size,
                        offset: properties.offset,
                        needs_gc: properties.needs_gc,
                    },
                    width - REF,
                )
            }
            Op::SetField => {
                let properties = self.field_operand(r)?;
                let width = field_stack_width(properties.size);
                (
                    I::SetField {
                        size: properties.size,
                        offset: properties.offset,
                        needs_gc: properties.needs_gc,
                    },
                    -width - REF,
                )
            }
            Op::CheckCast => {
                let properties = self.type_operand(r)?;
                (
                    I::CheckCast {
                        layout_id: properties.layout_id,
                        allow_cast: properties.flags & struct_flags::ALLOW_CAST != 0,
                    },
                    0,
                )
            }

            /* control flow */
            Op::Label => {
                let id = r.vle()?;
                if self.labels.insert(id, self.code.len()).is_some() {
                    return Err(ErrorKind::Decode(format!("duplicate label {id}")).into());
                }
                return Ok(None);
            }
            Op::Jmp => {
                let label = r.vle()?;
                fixups.push((self.code.len(), 0, label));
                (I::Jmp { target: 0 }, 0)
            }
            Op::Jnz => {
                let then_label = r.vle()?;
                let else_label = r.vle()?;
                fixups.push((self.code.len(), 0, then_label));
                fixups.push((self.code.len(), 1, else_label));
                (
                    I::Jnz {
                        then_target: 0,
                        else_target: 0,
                    },
                    -CAT1,
                )
            }
            Op::Ret => (I::Ret(RetKind::Void), 0),
            Op::IRet => (I::Ret(RetKind::I32), 0),
            Op::LRet => (I::Ret(RetKind::I64), 0),
            Op::FRet => (I::Ret(RetKind::F32), 0),
            Op::DRet => (I::Ret(RetKind::F64), 0),
            Op::SRet => (I::Ret(RetKind::Str), 0),
            Op::ARet => (I::Ret(RetKind::Ref), 0),

            /* calls */
            Op::Invoke => {
                let index = r.vle()?;
                let (loader, function, signature) = self.resolve_invoke(index)?;
                let delta = signature_stack_delta(&signature);
                (I::Invoke { loader, function }, delta)
            }
        };

        Ok(Some(decoded))
    }

    /// Resolve a type reference operand (`new`, `anewarray`, `checkcast`).
    /// Positive values index the export table, negative values encode
    /// `-index - 1` into the import table.
    fn type_operand(&self, r: &mut Reader<'_>) -> Result<TypeProperties> {
        let index = r.vle()?;
        let desc = self.struct_operand(index)?;
        Ok(TypeProperties {
            size: desc.size,
            alignment: desc.alignment,
            layout_id: desc.layout_id,
            flags: desc.flags,
        })
    }

    /// Resolve a `getfield`/`setfield` operand pair into `(size, offset,
    /// needs_gc)`.
    fn field_operand(&self, r: &mut Reader<'_>) -> Result<FieldProperties> {
        let struct_index = r.vle()?;
        let field_index = r.vle_index()?;

        let desc = self.struct_operand(struct_index)?;
        let field = desc.fields.get(field_index).ok_or_else(|| {
            ErrorKind::Decode(format!(
                "field index {field_index} outside the type's fields"
            ))
        })?;

        Ok(FieldProperties {
            size: field.size,
            offset: field.offset,
            needs_gc: field.ty.is_gc(),
        })
    }

    fn struct_operand(&self, index: i64) -> Result<&StructDescriptor> {
        if index < 0 {
            let (import, mid) = self.import_entry(-index - 1, SymbolKind::Type)?;
            return self
                .ctx
                .loader(mid)
                .structs
                .get(&import.name)
                .ok_or_else(|| {
                    ErrorKind::Decode(format!(
                        "cannot resolve type '{}': not found in imported module",
                        import.name
                    ))
                    .into()
                });
        }

        let export = self.export_entry(index)?;
        if export.desc.kind() != SymbolKind::Type {
            return Err(ErrorKind::Decode(format!(
                "export table entry '{}' is not a type",
                export.name
            ))
            .into());
        }
        self.structs.get(&export.name).ok_or_else(|| {
            ErrorKind::Decode(format!("type '{}' was not decoded", export.name)).into()
        })
    }

    /// Resolve an `invoke` operand into a `(module, function)` pair plus the
    /// callee signature for the stack delta.
    fn resolve_invoke(&self, index: i64) -> Result<(ModuleId, FunctionId, FunctionSignature)> {
        if index < 0 {
            let (import, mid) = self.import_entry(-index - 1, SymbolKind::Function)?;
            let target = self.ctx.loader(mid);
            let fid = target.function_id(&import.name)?;
            return Ok((mid, fid, target.function(fid).signature.clone()));
        }

        let export = self.export_entry(index)?;
        let index = usize::try_from(index).expect("non-negative");
        let fid = *self.export_fids.get(&index).ok_or_else(|| {
            ErrorKind::Decode(format!(
                "export table entry '{}' is not a function",
                export.name
            ))
        })?;
        Ok((self.self_id, fid, self.local_signatures[fid].clone()))
    }

    fn export_entry(&self, index: i64) -> Result<&'a Export> {
        let exports = &self.module.header.exports;
        usize::try_from(index)
            .ok()
            .and_then(|i| exports.get(i))
            .ok_or_else(|| {
                ErrorKind::Decode(format!(
                    "export index {index} out of range ({index} >= {})",
                    exports.len()
                ))
                .into()
            })
    }

    /// Look up an import-table entry by decoded index and yield it together
    /// with its already-resolved owning module.
    fn import_entry(&self, index: i64, expected: SymbolKind) -> Result<(&'a Import, ModuleId)> {
        let imports = &self.module.header.imports;
        let import = usize::try_from(index)
            .ok()
            .and_then(|i| imports.get(i))
            .ok_or_else(|| {
                ErrorKind::Decode(format!(
                    "import index {index} out of range ({index} >= {})",
                    imports.len()
                ))
            })?;
        if import.kind != expected {
            return Err(ErrorKind::Decode(format!(
                "import table entry {index} is not a {}",
                expected.name()
            ))
            .into());
        }
        let package_index = import.package.ok_or_else(|| {
            ErrorKind::Decode(format!(
                "import symbol '{}' has no package index",
                import.name
            ))
        })?;
        let mid = self
            .resolved_packages
            .get(package_index)
            .copied()
            .flatten()
            .ok_or_else(|| {
                ErrorKind::Decode(format!(
                    "unresolved package import for symbol '{}'",
                    import.name
                ))
            })?;
        Ok((import, mid))
    }
}

/// Read a local-variable index and rewrite it into a byte offset.
fn local_offset(r: &mut Reader<'_>, body: &BytecodeFn) -> Result<usize> {
    let index = r.vle()?;
    let locals = &body.runtime.locals;
    let slot = usize::try_from(index)
        .ok()
        .and_then(|i| locals.get(i))
        .ok_or_else(|| {
            ErrorKind::Decode(format!(
                "index '{index}' for argument or local outside of valid range 0-{}",
                locals.len()
            ))
        })?;
    Ok(slot.offset)
}

/// Decode a `dup_x1`/`dup_x2` type argument into its stack width.
fn dup_operand(r: &mut Reader<'_>) -> Result<(usize, bool)> {
    let ty = VariableType::read(r)?;
    if ty.is_void() {
        return Err(ErrorKind::Decode("invalid argument type 'void' for dup".into()).into());
    }
    Ok((ty.stack_width(), ty.is_gc()))
}

/// Operand stack width of a field value: small integers widen to a full
/// category-1 slot.
fn field_stack_width(field_size: usize) -> i32 {
    if field_size <= 4 {
        CAT1
    } else {
        CAT2
    }
}

/// Stack delta of a call, from the callee's signature.
fn signature_stack_delta(signature: &FunctionSignature) -> i32 {
    let ret = i32::try_from(signature.return_type.stack_width()).expect("widths are small");
    let args: i32 = signature
        .arg_types
        .iter()
        .map(|ty| i32::try_from(ty.stack_width()).expect("widths are small"))
        .sum();
    ret - args
}

/// Compute the operand-stack capacity by joining per-instruction stack
/// heights over the control flow graph.
fn compute_stack_size(code: &[Instruction], deltas: &[i32], entry: usize) -> Result<usize> {
    debug_assert_eq!(code.len(), deltas.len());
    let len = code.len();
    let mut heights: Vec<Option<i32>> = vec![None; len];
    heights[0] = Some(0);
    let mut worklist = vec![0usize];
    let mut max_height = 0i32;

    while let Some(i) = worklist.pop() {
        let height = heights[i].expect("worklist entries have a height");
        let out = height + deltas[i];
        if out < 0 {
            return Err(ErrorKind::NegativeStackHeight.into());
        }
        max_height = max_height.max(out);

        let mut successors: [Option<usize>; 2] = [None, None];
        match &code[i] {
            Instruction::Ret(_) => {}
            Instruction::Jmp { target } => successors[0] = Some(*target - entry),
            Instruction::Jnz {
                then_target,
                else_target,
            } => {
                successors[0] = Some(*then_target - entry);
                successors[1] = Some(*else_target - entry);
            }
            _ => {
                if i + 1 >= len {
                    return Err(ErrorKind::Decode(
                        "control flow reaches the end of the function".into(),
                    )
                    .into());
                }
                successors[0] = Some(i + 1);
            }
        }

        for successor in successors.into_iter().flatten() {
            match heights[successor] {
                None => {
                    heights[successor] = Some(out);
                    worklist.push(successor);
                }
                Some(previous) if previous != out => {
                    return Err(ErrorKind::InconsistentStackHeight(entry + successor).into());
                }
                Some(_) => {}
            }
        }
    }

    Ok(usize::try_from(max_height).expect("non-negative"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_size_straight_line() {
        let code = vec![
            Instruction::IConst(1),
            Instruction::IConst(2),
            Instruction::IAdd,
            Instruction::Ret(RetKind::I32),
        ];
        let deltas = vec![4, 4, -4, 0];
        assert_eq!(compute_stack_size(&code, &deltas, 0).unwrap(), 8);
    }

    #[test]
    fn test_stack_size_joins_branches() {
        let code = vec![
            Instruction::IConst(0),
            Instruction::Jnz {
                then_target: 2,
                else_target: 4,
            },
            Instruction::IConst(1),
            Instruction::Jmp { target: 5 },
            Instruction::IConst(2),
            Instruction::Ret(RetKind::I32),
        ];
        let deltas = vec![4, -4, 4, 0, 4, 0];
        assert_eq!(compute_stack_size(&code, &deltas, 0).unwrap(), 4);
    }

    #[test]
    fn test_stack_size_rejects_divergent_join() {
        // One branch pushes twice, the other once; both jump to the return.
        let code = vec![
            Instruction::IConst(0),
            Instruction::Jnz {
                then_target: 2,
                else_target: 5,
            },
            Instruction::IConst(1),
            Instruction::IConst(2),
            Instruction::Jmp { target: 6 },
            Instruction::IConst(3),
            Instruction::Ret(RetKind::I32),
        ];
        let deltas = vec![4, -4, 4, 4, 0, 4, 0];
        assert!(matches!(
            compute_stack_size(&code, &deltas, 0).unwrap_err().kind(),
            ErrorKind::InconsistentStackHeight(_)
        ));
    }

    #[test]
    fn test_stack_size_rejects_negative_height() {
        let code = vec![Instruction::Pop, Instruction::Ret(RetKind::Void)];
        let deltas = vec![-4, 0];
        assert!(matches!(
            compute_stack_size(&code, &deltas, 0).unwrap_err().kind(),
            ErrorKind::NegativeStackHeight
        ));
    }

    #[test]
    fn test_stack_size_rejects_missing_return() {
        let code = vec![Instruction::IConst(1)];
        let deltas = vec![4];
        assert!(compute_stack_size(&code, &deltas, 0).is_err());
    }

    #[test]
    fn test_stack_size_handles_loops() {
        // iconst; label; dup-free loop body: jnz back or to the return.
        let code = vec![
            Instruction::IConst(1),
            Instruction::Dup,
            Instruction::Jnz {
                then_target: 1,
                else_target: 3,
            },
            Instruction::Ret(RetKind::I32),
        ];
        let deltas = vec![4, 4, -4, 0];
        assert_eq!(compute_stack_size(&code, &deltas, 0).unwrap(), 8);
    }
}
