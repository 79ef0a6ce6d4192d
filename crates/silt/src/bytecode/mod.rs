mod instruction;
mod opcode;

pub use instruction::Instruction;
pub use opcode::{ArrayKind, Opcode, RetKind};
