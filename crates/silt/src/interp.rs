//! The interpreter loop.
//!
//! A [`Machine`] executes rewritten bytecode against a stack frame. It
//! borrows the context's loader arena immutably and its garbage collector
//! mutably; the call-depth counter lives on the machine and spans one
//! top-level invocation.
//!
//! Reference discipline: every opcode that consumes a managed pointer from
//! the operand stack releases exactly one temporary refcount for it, and
//! every opcode that produces one either allocates with the temporary flag
//! or adds a temporary for the loaded value. `astore` additionally moves the
//! reference's root count to mirror the locals slot it overwrites.

use tracing::trace;

use crate::bytecode::Instruction;
use crate::error::{ErrorKind, Result};
use crate::gc::{gc_flags, Gc, Ref};
use crate::loader::{BytecodeBody, ModuleId, ModuleLoader};
use crate::module::{Constant, REF_SIZE};
use crate::stack::OperandStack;

/// A stack frame: byte-packed locals plus the operand stack sized to the
/// function's computed capacity.
pub struct Frame {
    pub locals: Vec<u8>,
    pub stack: OperandStack,
}

impl Frame {
    #[must_use]
    pub fn new(locals_size: usize, stack_size: usize) -> Self {
        Self {
            locals: vec![0; locals_size],
            stack: OperandStack::new(stack_size),
        }
    }
}

fn read_local<const N: usize>(locals: &[u8], offset: usize) -> Result<[u8; N], ErrorKind> {
    let end = offset + N;
    if end > locals.len() {
        return Err(ErrorKind::Runtime(format!(
            "invalid locals access at offset {offset}"
        )));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&locals[offset..end]);
    Ok(out)
}

fn write_local(locals: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), ErrorKind> {
    let end = offset + bytes.len();
    if end > locals.len() {
        return Err(ErrorKind::Runtime(format!(
            "invalid locals access at offset {offset}"
        )));
    }
    locals[offset..end].copy_from_slice(bytes);
    Ok(())
}

fn local_ref(locals: &[u8], offset: usize) -> Result<Option<Ref>, ErrorKind> {
    Ok(Ref::from_bits(u64::from_le_bytes(read_local::<REF_SIZE>(
        locals, offset,
    )?)))
}

/* binary operation helpers; the right operand is popped first */

fn binop_i32(
    stack: &mut OperandStack,
    f: impl FnOnce(i32, i32) -> Result<i32, ErrorKind>,
) -> Result<(), ErrorKind> {
    let b = stack.pop_i32()?;
    let a = stack.pop_i32()?;
    stack.push_i32(f(a, b)?)
}

fn binop_i64(
    stack: &mut OperandStack,
    f: impl FnOnce(i64, i64) -> Result<i64, ErrorKind>,
) -> Result<(), ErrorKind> {
    let b = stack.pop_i64()?;
    let a = stack.pop_i64()?;
    stack.push_i64(f(a, b)?)
}

fn binop_f32(
    stack: &mut OperandStack,
    f: impl FnOnce(f32, f32) -> Result<f32, ErrorKind>,
) -> Result<(), ErrorKind> {
    let b = stack.pop_f32()?;
    let a = stack.pop_f32()?;
    stack.push_f32(f(a, b)?)
}

fn binop_f64(
    stack: &mut OperandStack,
    f: impl FnOnce(f64, f64) -> Result<f64, ErrorKind>,
) -> Result<(), ErrorKind> {
    let b = stack.pop_f64()?;
    let a = stack.pop_f64()?;
    stack.push_f64(f(a, b)?)
}

fn cmp_i32(stack: &mut OperandStack, f: impl FnOnce(i32, i32) -> bool) -> Result<(), ErrorKind> {
    let b = stack.pop_i32()?;
    let a = stack.pop_i32()?;
    stack.push_i32(i32::from(f(a, b)))
}

fn cmp_i64(stack: &mut OperandStack, f: impl FnOnce(i64, i64) -> bool) -> Result<(), ErrorKind> {
    let b = stack.pop_i64()?;
    let a = stack.pop_i64()?;
    stack.push_i32(i32::from(f(a, b)))
}

fn cmp_f32(stack: &mut OperandStack, f: impl FnOnce(f32, f32) -> bool) -> Result<(), ErrorKind> {
    let b = stack.pop_f32()?;
    let a = stack.pop_f32()?;
    stack.push_i32(i32::from(f(a, b)))
}

fn cmp_f64(stack: &mut OperandStack, f: impl FnOnce(f64, f64) -> bool) -> Result<(), ErrorKind> {
    let b = stack.pop_f64()?;
    let a = stack.pop_f64()?;
    stack.push_i32(i32::from(f(a, b)))
}

fn shift_count(stack: &mut OperandStack, mask: u32) -> Result<u32, ErrorKind> {
    let count = stack.pop_i32()?;
    if count < 0 {
        return Err(ErrorKind::NegativeShift);
    }
    #[allow(clippy::cast_sign_loss)]
    Ok(count as u32 & mask)
}

fn array_index(index: i32, len: usize) -> Result<usize, ErrorKind> {
    usize::try_from(index)
        .ok()
        .filter(|i| *i < len)
        .ok_or(ErrorKind::OutOfBounds {
            index: i64::from(index),
            len,
        })
}

pub struct Machine<'a> {
    loaders: &'a [ModuleLoader],
    gc: &'a mut Gc,
    max_depth: usize,
    depth: usize,
}

impl<'a> Machine<'a> {
    pub fn new(loaders: &'a [ModuleLoader], gc: &'a mut Gc, max_depth: usize) -> Self {
        Self {
            loaders,
            gc,
            max_depth,
            depth: 0,
        }
    }

    /// Execute an interpreted function in the given frame. On failure the
    /// error is annotated with a stack-trace entry for this frame; root
    /// bookkeeping is not unwound, the top-level invoke resets the GC.
    pub fn execute(
        &mut self,
        mid: ModuleId,
        body: &'a BytecodeBody,
        frame: &mut Frame,
    ) -> Result<()> {
        let module_name = &self.loaders[mid].name;

        self.depth += 1;
        if self.depth > self.max_depth {
            let mut err = crate::error::Error::from(ErrorKind::CallDepthExceeded(self.max_depth));
            err.push_frame(module_name.clone(), body.entry, body.entry);
            return Err(err);
        }

        let mut pc = body.entry;
        match self.run(mid, body, frame, &mut pc) {
            Ok(()) => {
                self.depth -= 1;
                Ok(())
            }
            Err(mut err) => {
                err.push_frame(self.loaders[mid].name.clone(), body.entry, pc);
                Err(err)
            }
        }
    }

    /// Locals scope exit: drop the root count of every non-null reference
    /// slot, then collect to release out-of-scope values.
    fn teardown_locals(&mut self, body: &BytecodeBody, frame: &Frame) -> Result<()> {
        for slot in &body.locals {
            if slot.is_ref {
                if let Some(r) = local_ref(&frame.locals, slot.offset)? {
                    self.gc.remove_root(r)?;
                }
            }
        }
        self.gc.collect();
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn run(
        &mut self,
        mid: ModuleId,
        body: &'a BytecodeBody,
        frame: &mut Frame,
        pc: &mut usize,
    ) -> Result<()> {
        use Instruction as I;

        let loaders = self.loaders;
        let code = &loaders[mid].code;
        let end = body.entry + body.len;

        // Locals scope entry: every non-null reference slot becomes a root.
        // Argument slots are populated by the caller; plain locals are still
        // zero here.
        for slot in &body.locals {
            if slot.is_ref {
                if let Some(r) = local_ref(&frame.locals, slot.offset)? {
                    self.gc.add_root(r);
                }
            }
        }

        loop {
            if *pc < body.entry || *pc >= end {
                return Err(
                    ErrorKind::Runtime("execution reached function boundary".into()).into(),
                );
            }
            let instr = &code[*pc];
            trace!(target: "interp", pc = *pc, %instr, "step");

            match instr {
                I::Dup => frame.stack.dup()?,
                I::Dup2 => frame.stack.dup2()?,
                I::ADup => {
                    frame.stack.dup_ref()?;
                    let top = frame.stack.peek_ref(REF_SIZE)?;
                    self.gc.add_temporary(top);
                }
                I::Pop => {
                    frame.stack.pop_i32()?;
                }
                I::Pop2 => {
                    frame.stack.pop_i64()?;
                }
                I::APop => {
                    let r = frame.stack.pop_ref()?;
                    self.gc.remove_temporary(r)?;
                }
                I::DupX1 {
                    size1,
                    size2,
                    needs_gc,
                } => {
                    frame.stack.dup_x1(*size1, *size2)?;
                    if *needs_gc {
                        let copy = frame.stack.peek_ref(2 * size1 + size2)?;
                        self.gc.add_temporary(copy);
                    }
                }
                I::DupX2 {
                    size1,
                    size2,
                    size3,
                    needs_gc,
                } => {
                    frame.stack.dup_x2(*size1, *size2, *size3)?;
                    if *needs_gc {
                        let copy = frame.stack.peek_ref(2 * size1 + size2 + size3)?;
                        self.gc.add_temporary(copy);
                    }
                }

                I::AConstNull => frame.stack.push_ref(None)?,
                I::IConst(v) => frame.stack.push_i32(*v)?,
                I::LConst(v) => frame.stack.push_i64(*v)?,
                I::FConst(v) => frame.stack.push_f32(*v)?,
                I::DConst(v) => frame.stack.push_f64(*v)?,
                I::SConst(index) => {
                    let content = match loaders[mid].constants.get(*index) {
                        Some(Constant::Str(s)) => s.clone(),
                        Some(_) => {
                            return Err(ErrorKind::Runtime(format!(
                                "entry {index} of constant table is not a string"
                            ))
                            .into());
                        }
                        None => {
                            return Err(ErrorKind::Runtime(format!(
                                "invalid index '{index}' into constant table"
                            ))
                            .into());
                        }
                    };
                    let s = self.gc.alloc_str(gc_flags::TEMPORARY);
                    *self.gc.string_mut(s)? = content;
                    frame.stack.push_ref(Some(s))?;
                }

                I::ILoad { offset } | I::FLoad { offset } => {
                    let bytes = read_local::<4>(&frame.locals, *offset)?;
                    frame.stack.push_i32(i32::from_le_bytes(bytes))?;
                }
                I::LLoad { offset } | I::DLoad { offset } => {
                    let bytes = read_local::<8>(&frame.locals, *offset)?;
                    frame.stack.push_i64(i64::from_le_bytes(bytes))?;
                }
                I::ALoad { offset } => {
                    let r = local_ref(&frame.locals, *offset)?;
                    self.gc.add_temporary(r);
                    frame.stack.push_ref(r)?;
                }
                I::IStore { offset } | I::FStore { offset } => {
                    let v = frame.stack.pop_i32()?;
                    write_local(&mut frame.locals, *offset, &v.to_le_bytes())?;
                }
                I::LStore { offset } | I::DStore { offset } => {
                    let v = frame.stack.pop_i64()?;
                    write_local(&mut frame.locals, *offset, &v.to_le_bytes())?;
                }
                I::AStore { offset } => {
                    let r = frame.stack.pop_ref()?;
                    self.gc.remove_temporary(r)?;

                    let previous = local_ref(&frame.locals, *offset)?;
                    if r != previous {
                        if let Some(previous) = previous {
                            self.gc.remove_root(previous)?;
                        }
                        if let Some(r) = r {
                            self.gc.add_root(r);
                        }
                    }
                    write_local(&mut frame.locals, *offset, &Ref::to_bits(r).to_le_bytes())?;
                }

                I::IAdd => binop_i32(&mut frame.stack, |a, b| Ok(a.wrapping_add(b)))?,
                I::ISub => binop_i32(&mut frame.stack, |a, b| Ok(a.wrapping_sub(b)))?,
                I::IMul => binop_i32(&mut frame.stack, |a, b| Ok(a.wrapping_mul(b)))?,
                I::IDiv => binop_i32(&mut frame.stack, |a, b| {
                    if b == 0 {
                        Err(ErrorKind::DivisionByZero)
                    } else {
                        Ok(a.wrapping_div(b))
                    }
                })?,
                I::IMod => binop_i32(&mut frame.stack, |a, b| {
                    if b == 0 {
                        Err(ErrorKind::DivisionByZero)
                    } else {
                        Ok(a.wrapping_rem(b))
                    }
                })?,
                I::IAnd => binop_i32(&mut frame.stack, |a, b| Ok(a & b))?,
                I::IOr => binop_i32(&mut frame.stack, |a, b| Ok(a | b))?,
                I::IXor => binop_i32(&mut frame.stack, |a, b| Ok(a ^ b))?,
                I::LAnd => binop_i32(&mut frame.stack, |a, b| Ok(i32::from(a != 0 && b != 0)))?,
                I::LOr => binop_i32(&mut frame.stack, |a, b| Ok(i32::from(a != 0 || b != 0)))?,
                I::IShl => {
                    let count = shift_count(&mut frame.stack, 0x1f)?;
                    let v = frame.stack.pop_i32()?;
                    #[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
                    frame.stack.push_i32(((v as u32) << count) as i32)?;
                }
                I::IShr => {
                    let count = shift_count(&mut frame.stack, 0x1f)?;
                    let v = frame.stack.pop_i32()?;
                    #[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
                    frame.stack.push_i32(((v as u32) >> count) as i32)?;
                }
                I::LShl => {
                    let count = shift_count(&mut frame.stack, 0x3f)?;
                    let v = frame.stack.pop_i64()?;
                    #[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
                    frame.stack.push_i64(((v as u64) << count) as i64)?;
                }
                I::LShr => {
                    let count = shift_count(&mut frame.stack, 0x3f)?;
                    let v = frame.stack.pop_i64()?;
                    #[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
                    frame.stack.push_i64(((v as u64) >> count) as i64)?;
                }

                I::LAdd => binop_i64(&mut frame.stack, |a, b| Ok(a.wrapping_add(b)))?,
                I::LSub => binop_i64(&mut frame.stack, |a, b| Ok(a.wrapping_sub(b)))?,
                I::LMul => binop_i64(&mut frame.stack, |a, b| Ok(a.wrapping_mul(b)))?,
                I::LDiv => binop_i64(&mut frame.stack, |a, b| {
                    if b == 0 {
                        Err(ErrorKind::DivisionByZero)
                    } else {
                        Ok(a.wrapping_div(b))
                    }
                })?,
                I::LMod => binop_i64(&mut frame.stack, |a, b| {
                    if b == 0 {
                        Err(ErrorKind::DivisionByZero)
                    } else {
                        Ok(a.wrapping_rem(b))
                    }
                })?,

                I::FAdd => binop_f32(&mut frame.stack, |a, b| Ok(a + b))?,
                I::FSub => binop_f32(&mut frame.stack, |a, b| Ok(a - b))?,
                I::FMul => binop_f32(&mut frame.stack, |a, b| Ok(a * b))?,
                I::FDiv => binop_f32(&mut frame.stack, |a, b| {
                    if b == 0.0 {
                        Err(ErrorKind::DivisionByZero)
                    } else {
                        Ok(a / b)
                    }
                })?,
                I::DAdd => binop_f64(&mut frame.stack, |a, b| Ok(a + b))?,
                I::DSub => binop_f64(&mut frame.stack, |a, b| Ok(a - b))?,
                I::DMul => binop_f64(&mut frame.stack, |a, b| Ok(a * b))?,
                I::DDiv => binop_f64(&mut frame.stack, |a, b| {
                    if b == 0.0 {
                        Err(ErrorKind::DivisionByZero)
                    } else {
                        Ok(a / b)
                    }
                })?,

                I::I2C => {
                    let v = frame.stack.pop_i32()?;
                    #[allow(clippy::cast_possible_truncation)]
                    frame.stack.push_i32(i32::from(v as i8))?;
                }
                I::I2S => {
                    let v = frame.stack.pop_i32()?;
                    #[allow(clippy::cast_possible_truncation)]
                    frame.stack.push_i32(i32::from(v as i16))?;
                }
                I::I2L => {
                    let v = frame.stack.pop_i32()?;
                    frame.stack.push_i64(i64::from(v))?;
                }
                I::I2F => {
                    let v = frame.stack.pop_i32()?;
                    #[allow(clippy::cast_precision_loss)]
                    frame.stack.push_f32(v as f32)?;
                }
                I::I2D => {
                    let v = frame.stack.pop_i32()?;
                    frame.stack.push_f64(f64::from(v))?;
                }
                I::L2I => {
                    let v = frame.stack.pop_i64()?;
                    #[allow(clippy::cast_possible_truncation)]
                    frame.stack.push_i32(v as i32)?;
                }
                I::L2F => {
                    let v = frame.stack.pop_i64()?;
                    #[allow(clippy::cast_precision_loss)]
                    frame.stack.push_f32(v as f32)?;
                }
                I::L2D => {
                    let v = frame.stack.pop_i64()?;
                    #[allow(clippy::cast_precision_loss)]
                    frame.stack.push_f64(v as f64)?;
                }
                I::F2I => {
                    let v = frame.stack.pop_f32()?;
                    #[allow(clippy::cast_possible_truncation)]
                    frame.stack.push_i32(v as i32)?;
                }
                I::F2L => {
                    let v = frame.stack.pop_f32()?;
                    #[allow(clippy::cast_possible_truncation)]
                    frame.stack.push_i64(v as i64)?;
                }
                I::F2D => {
                    let v = frame.stack.pop_f32()?;
                    frame.stack.push_f64(f64::from(v))?;
                }
                I::D2I => {
                    let v = frame.stack.pop_f64()?;
                    #[allow(clippy::cast_possible_truncation)]
                    frame.stack.push_i32(v as i32)?;
                }
                I::D2L => {
                    let v = frame.stack.pop_f64()?;
                    #[allow(clippy::cast_possible_truncation)]
                    frame.stack.push_i64(v as i64)?;
                }
                I::D2F => {
                    let v = frame.stack.pop_f64()?;
                    #[allow(clippy::cast_possible_truncation)]
                    frame.stack.push_f32(v as f32)?;
                }

                I::ICmpL => cmp_i32(&mut frame.stack, |a, b| a < b)?,
                I::ICmpLe => cmp_i32(&mut frame.stack, |a, b| a <= b)?,
                I::ICmpG => cmp_i32(&mut frame.stack, |a, b| a > b)?,
                I::ICmpGe => cmp_i32(&mut frame.stack, |a, b| a >= b)?,
                I::ICmpEq => cmp_i32(&mut frame.stack, |a, b| a == b)?,
                I::ICmpNe => cmp_i32(&mut frame.stack, |a, b| a != b)?,
                I::LCmpL => cmp_i64(&mut frame.stack, |a, b| a < b)?,
                I::LCmpLe => cmp_i64(&mut frame.stack, |a, b| a <= b)?,
                I::LCmpG => cmp_i64(&mut frame.stack, |a, b| a > b)?,
                I::LCmpGe => cmp_i64(&mut frame.stack, |a, b| a >= b)?,
                I::LCmpEq => cmp_i64(&mut frame.stack, |a, b| a == b)?,
                I::LCmpNe => cmp_i64(&mut frame.stack, |a, b| a != b)?,
                I::FCmpL => cmp_f32(&mut frame.stack, |a, b| a < b)?,
                I::FCmpLe => cmp_f32(&mut frame.stack, |a, b| a <= b)?,
                I::FCmpG => cmp_f32(&mut frame.stack, |a, b| a > b)?,
                I::FCmpGe => cmp_f32(&mut frame.stack, |a, b| a >= b)?,
                #[allow(clippy::float_cmp)]
                I::FCmpEq => cmp_f32(&mut frame.stack, |a, b| a == b)?,
                #[allow(clippy::float_cmp)]
                I::FCmpNe => cmp_f32(&mut frame.stack, |a, b| a != b)?,
                I::DCmpL => cmp_f64(&mut frame.stack, |a, b| a < b)?,
                I::DCmpLe => cmp_f64(&mut frame.stack, |a, b| a <= b)?,
                I::DCmpG => cmp_f64(&mut frame.stack, |a, b| a > b)?,
                I::DCmpGe => cmp_f64(&mut frame.stack, |a, b| a >= b)?,
                #[allow(clippy::float_cmp)]
                I::DCmpEq => cmp_f64(&mut frame.stack, |a, b| a == b)?,
                #[allow(clippy::float_cmp)]
                I::DCmpNe => cmp_f64(&mut frame.stack, |a, b| a != b)?,
                I::ACmpEq => {
                    let a = frame.stack.pop_ref()?;
                    let b = frame.stack.pop_ref()?;
                    self.gc.remove_temporary(a)?;
                    self.gc.remove_temporary(b)?;
                    frame.stack.push_i32(i32::from(b == a))?;
                }
                I::ACmpNe => {
                    let a = frame.stack.pop_ref()?;
                    let b = frame.stack.pop_ref()?;
                    self.gc.remove_temporary(a)?;
                    self.gc.remove_temporary(b)?;
                    frame.stack.push_i32(i32::from(b != a))?;
                }

                I::NewArray { kind } => {
                    let len = frame.stack.pop_i32()?;
                    let len = usize::try_from(len)
                        .map_err(|_| ErrorKind::Runtime(format!("invalid array size '{len}'")))?;
                    let array = self.gc.alloc_array(*kind, len, gc_flags::TEMPORARY)?;
                    frame.stack.push_ref(Some(array))?;
                }
                I::ANewArray { layout_id } => {
                    let len = frame.stack.pop_i32()?;
                    let len = usize::try_from(len)
                        .map_err(|_| ErrorKind::Runtime(format!("invalid array length '{len}'")))?;
                    let array = self
                        .gc
                        .alloc_ref_array(*layout_id, len, gc_flags::TEMPORARY)?;
                    frame.stack.push_ref(Some(array))?;
                }
                I::ArrayLength => {
                    let array = frame
                        .stack
                        .pop_ref()?
                        .ok_or(ErrorKind::NullReference("arraylength"))?;
                    self.gc.remove_temporary(Some(array))?;
                    let len = self.gc.array_len(array)?;
                    frame.stack.push_i32(
                        i32::try_from(len)
                            .map_err(|_| ErrorKind::Runtime("array length overflow".into()))?,
                    )?;
                }

                I::CALoad => {
                    let (array, index) = self.pop_array_access(frame, "caload")?;
                    let values = self.gc.i8_array(array)?;
                    let index = array_index(index, values.len())?;
                    frame.stack.push_i32(i32::from(values[index]))?;
                }
                I::SALoad => {
                    let (array, index) = self.pop_array_access(frame, "saload")?;
                    let values = self.gc.i16_array(array)?;
                    let index = array_index(index, values.len())?;
                    frame.stack.push_i32(i32::from(values[index]))?;
                }
                I::IALoad => {
                    let (array, index) = self.pop_array_access(frame, "iaload")?;
                    let values = self.gc.i32_array(array)?;
                    let index = array_index(index, values.len())?;
                    frame.stack.push_i32(values[index])?;
                }
                I::LALoad => {
                    let (array, index) = self.pop_array_access(frame, "laload")?;
                    let values = self.gc.i64_array(array)?;
                    let index = array_index(index, values.len())?;
                    frame.stack.push_i64(values[index])?;
                }
                I::FALoad => {
                    let (array, index) = self.pop_array_access(frame, "faload")?;
                    let values = self.gc.f32_array(array)?;
                    let index = array_index(index, values.len())?;
                    frame.stack.push_f32(values[index])?;
                }
                I::DALoad => {
                    let (array, index) = self.pop_array_access(frame, "daload")?;
                    let values = self.gc.f64_array(array)?;
                    let index = array_index(index, values.len())?;
                    frame.stack.push_f64(values[index])?;
                }
                I::AALoad => {
                    let (array, index) = self.pop_array_access(frame, "aaload")?;
                    let elements = self.gc.handles(array)?;
                    let index = array_index(index, elements.len())?;
                    let element = Ref::from_bits(elements[index]);
                    self.gc.add_temporary(element);
                    frame.stack.push_ref(element)?;
                }

                I::CAStore => {
                    let v = frame.stack.pop_i32()?;
                    let (array, index) = self.pop_array_access(frame, "castore")?;
                    let values = self.gc.i8_array_mut(array)?;
                    let index = array_index(index, values.len())?;
                    #[allow(clippy::cast_possible_truncation)]
                    {
                        values[index] = v as i8;
                    }
                }
                I::SAStore => {
                    let v = frame.stack.pop_i32()?;
                    let (array, index) = self.pop_array_access(frame, "sastore")?;
                    let values = self.gc.i16_array_mut(array)?;
                    let index = array_index(index, values.len())?;
                    #[allow(clippy::cast_possible_truncation)]
                    {
                        values[index] = v as i16;
                    }
                }
                I::IAStore => {
                    let v = frame.stack.pop_i32()?;
                    let (array, index) = self.pop_array_access(frame, "iastore")?;
                    let values = self.gc.i32_array_mut(array)?;
                    let index = array_index(index, values.len())?;
                    values[index] = v;
                }
                I::LAStore => {
                    let v = frame.stack.pop_i64()?;
                    let (array, index) = self.pop_array_access(frame, "lastore")?;
                    let values = self.gc.i64_array_mut(array)?;
                    let index = array_index(index, values.len())?;
                    values[index] = v;
                }
                I::FAStore => {
                    let v = frame.stack.pop_f32()?;
                    let (array, index) = self.pop_array_access(frame, "fastore")?;
                    let values = self.gc.f32_array_mut(array)?;
                    let index = array_index(index, values.len())?;
                    values[index] = v;
                }
                I::DAStore => {
                    let v = frame.stack.pop_f64()?;
                    let (array, index) = self.pop_array_access(frame, "dastore")?;
                    let values = self.gc.f64_array_mut(array)?;
                    let index = array_index(index, values.len())?;
                    values[index] = v;
                }
                I::AAStore => {
                    let value = frame.stack.pop_ref()?;
                    let (array, index) = self.pop_array_access(frame, "aastore")?;
                    self.gc.remove_temporary(value)?;
                    let elements = self.gc.handles_mut(array)?;
                    let index = array_index(index, elements.len())?;
                    elements[index] = Ref::to_bits(value);
                }

                I::New {
                    size,
                    alignment,
                    layout_id,
                } => {
                    let object =
                        self.gc
                            .alloc_raw(*layout_id, *size, *alignment, gc_flags::TEMPORARY)?;
                    frame.stack.push_ref(Some(object))?;
                }
                I::GetField {
                    size,
                    offset,
                    needs_gc,
                } => {
                    let receiver = frame
                        .stack
                        .pop_ref()?
                        .ok_or(ErrorKind::NullReference("getfield"))?;
                    self.gc.remove_temporary(Some(receiver))?;
                    let bytes = field_bytes(self.gc.raw(receiver)?, *offset, *size)?;
                    match (*size, *needs_gc) {
                        (8, true) => {
                            let mut bits = [0u8; 8];
                            bits.copy_from_slice(bytes);
                            let value = Ref::from_bits(u64::from_le_bytes(bits));
                            self.gc.add_temporary(value);
                            frame.stack.push_ref(value)?;
                        }
                        (8, false) => {
                            let mut raw = [0u8; 8];
                            raw.copy_from_slice(bytes);
                            frame.stack.push_i64(i64::from_le_bytes(raw))?;
                        }
                        (4, _) => {
                            let mut raw = [0u8; 4];
                            raw.copy_from_slice(bytes);
                            frame.stack.push_i32(i32::from_le_bytes(raw))?;
                        }
                        (2, _) => {
                            #[allow(clippy::cast_possible_wrap)]
                            let v = i16::from_le_bytes([bytes[0], bytes[1]]);
                            frame.stack.push_i32(i32::from(v))?;
                        }
                        (1, _) => {
                            #[allow(clippy::cast_possible_wrap)]
                            frame.stack.push_i32(i32::from(bytes[0] as i8))?;
                        }
                        _ => {
                            return Err(ErrorKind::Runtime(format!(
                                "invalid field size {size} encountered in getfield"
                            ))
                            .into());
                        }
                    }
                }
                I::SetField {
                    size,
                    offset,
                    needs_gc,
                } => {
                    enum FieldValue {
                        Ref(Option<Ref>),
                        Cat1(i32),
                        Cat2(i64),
                    }

                    let value = match (*size, *needs_gc) {
                        (8, true) => FieldValue::Ref(frame.stack.pop_ref()?),
                        (8, false) => FieldValue::Cat2(frame.stack.pop_i64()?),
                        (1 | 2 | 4, _) => FieldValue::Cat1(frame.stack.pop_i32()?),
                        _ => {
                            return Err(ErrorKind::Runtime(format!(
                                "invalid field size {size} encountered in setfield"
                            ))
                            .into());
                        }
                    };

                    let receiver = frame
                        .stack
                        .pop_ref()?
                        .ok_or(ErrorKind::NullReference("setfield"))?;
                    self.gc.remove_temporary(Some(receiver))?;
                    if let FieldValue::Ref(value) = &value {
                        self.gc.remove_temporary(*value)?;
                    }

                    let bytes = field_bytes_mut(self.gc.raw_mut(receiver)?, *offset, *size)?;
                    match value {
                        FieldValue::Ref(r) => {
                            bytes.copy_from_slice(&Ref::to_bits(r).to_le_bytes());
                        }
                        FieldValue::Cat2(v) => bytes.copy_from_slice(&v.to_le_bytes()),
                        FieldValue::Cat1(v) => match *size {
                            4 => bytes.copy_from_slice(&v.to_le_bytes()),
                            #[allow(clippy::cast_possible_truncation)]
                            2 => bytes.copy_from_slice(&(v as i16).to_le_bytes()),
                            #[allow(clippy::cast_possible_truncation)]
                            _ => bytes.copy_from_slice(&(v as i8).to_le_bytes()),
                        },
                    }
                }
                I::CheckCast {
                    layout_id,
                    allow_cast,
                } => {
                    if !allow_cast {
                        let object = frame
                            .stack
                            .pop_ref()?
                            .ok_or(ErrorKind::NullReference("checkcast"))?;
                        let source = self.gc.layout_id_of(object)?;
                        if source != *layout_id {
                            return Err(ErrorKind::CastFailed {
                                from: self.gc.layout_name(source)?.to_owned(),
                                to: self.gc.layout_name(*layout_id)?.to_owned(),
                            }
                            .into());
                        }
                        frame.stack.push_ref(Some(object))?;
                    }
                }

                I::Jmp { target } => {
                    *pc = *target;
                    continue;
                }
                I::Jnz {
                    then_target,
                    else_target,
                } => {
                    let condition = frame.stack.pop_i32()?;
                    *pc = if condition != 0 {
                        *then_target
                    } else {
                        *else_target
                    };
                    continue;
                }
                I::Ret(_) => {
                    self.teardown_locals(body, frame)?;
                    return Ok(());
                }

                I::Invoke { loader, function } => self.invoke(loaders, *loader, *function, frame)?,
            }

            *pc += 1;
        }
    }

    fn pop_array_access(
        &mut self,
        frame: &mut Frame,
        op: &'static str,
    ) -> Result<(Ref, i32), ErrorKind> {
        let index = frame.stack.pop_i32()?;
        let array = frame.stack.pop_ref()?.ok_or(ErrorKind::NullReference(op))?;
        self.gc.remove_temporary(Some(array))?;
        Ok((array, index))
    }

    /// Execute an `invoke`: a native callback runs against the caller's
    /// operand stack; an interpreted callee gets a fresh frame with the
    /// caller's top `args_size` bytes copied into its locals. The argument
    /// temporaries move with the bytes: the caller releases them and the
    /// callee roots its reference locals on entry.
    fn invoke(
        &mut self,
        loaders: &'a [ModuleLoader],
        target_mid: ModuleId,
        function: usize,
        frame: &mut Frame,
    ) -> Result<()> {
        let callee = loaders[target_mid].function(function);
        trace!(target: "interp", callee = %callee.name, "invoke");

        match &callee.kind {
            crate::loader::FunctionKind::Native { callback, .. } => {
                (callback.as_ref())(self.gc, &mut frame.stack)
            }
            crate::loader::FunctionKind::Bytecode(body) => {
                let mut callee_frame = Frame::new(body.locals_size, body.stack_size);

                let args = frame.stack.view(body.args_size, body.args_size)?;
                callee_frame.locals[..body.args_size].copy_from_slice(args);
                frame.stack.discard(body.args_size)?;

                let arg_count = callee.signature.arg_types.len();
                for slot in &body.locals[..arg_count] {
                    if slot.is_ref {
                        let r = local_ref(&callee_frame.locals, slot.offset)?;
                        self.gc.remove_temporary(r)?;
                    }
                }

                self.execute(target_mid, body, &mut callee_frame)?;

                if callee_frame.stack.len() != body.return_size {
                    return Err(ErrorKind::Runtime(format!(
                        "expected {} bytes to be returned from function call, got {}",
                        body.return_size,
                        callee_frame.stack.len()
                    ))
                    .into());
                }
                frame.stack.push_stack(&callee_frame.stack)?;
                Ok(())
            }
        }
    }
}

fn field_bytes(raw: &[u8], offset: usize, size: usize) -> Result<&[u8], ErrorKind> {
    raw.get(offset..offset + size)
        .ok_or_else(|| ErrorKind::Runtime(format!("field access at {offset} outside object")))
}

fn field_bytes_mut(raw: &mut [u8], offset: usize, size: usize) -> Result<&mut [u8], ErrorKind> {
    raw.get_mut(offset..offset + size)
        .ok_or_else(|| ErrorKind::Runtime(format!("field access at {offset} outside object")))
}
