//! Byte-addressable operand stack.
//!
//! Slots follow the category-1/category-2 discipline: `i32`/`f32` take four
//! bytes, `i64`/`f64` take eight, managed references take [`REF_SIZE`] bytes
//! (null is all zeroes). The capacity is the per-function maximum computed by
//! the loader's rewrite pass; exceeding it in either direction is fatal to
//! the invocation.

use crate::error::ErrorKind;
use crate::gc::Ref;
use crate::module::REF_SIZE;

#[derive(Debug, Clone)]
pub struct OperandStack {
    bytes: Vec<u8>,
    capacity: usize,
}

impl OperandStack {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            capacity,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<(), ErrorKind> {
        if self.bytes.len() + bytes.len() > self.capacity {
            return Err(ErrorKind::StackOverflow);
        }
        self.bytes.extend_from_slice(bytes);
        Ok(())
    }

    fn pop_bytes<const N: usize>(&mut self) -> Result<[u8; N], ErrorKind> {
        if self.bytes.len() < N {
            return Err(ErrorKind::StackUnderflow);
        }
        let at = self.bytes.len() - N;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[at..]);
        self.bytes.truncate(at);
        Ok(out)
    }

    pub fn push_i32(&mut self, v: i32) -> Result<(), ErrorKind> {
        self.push_bytes(&v.to_le_bytes())
    }

    pub fn pop_i32(&mut self) -> Result<i32, ErrorKind> {
        Ok(i32::from_le_bytes(self.pop_bytes::<4>()?))
    }

    pub fn push_f32(&mut self, v: f32) -> Result<(), ErrorKind> {
        self.push_bytes(&v.to_le_bytes())
    }

    pub fn pop_f32(&mut self) -> Result<f32, ErrorKind> {
        Ok(f32::from_le_bytes(self.pop_bytes::<4>()?))
    }

    pub fn push_i64(&mut self, v: i64) -> Result<(), ErrorKind> {
        self.push_bytes(&v.to_le_bytes())
    }

    pub fn pop_i64(&mut self) -> Result<i64, ErrorKind> {
        Ok(i64::from_le_bytes(self.pop_bytes::<8>()?))
    }

    pub fn push_f64(&mut self, v: f64) -> Result<(), ErrorKind> {
        self.push_bytes(&v.to_le_bytes())
    }

    pub fn pop_f64(&mut self) -> Result<f64, ErrorKind> {
        Ok(f64::from_le_bytes(self.pop_bytes::<8>()?))
    }

    pub fn push_ref(&mut self, r: Option<Ref>) -> Result<(), ErrorKind> {
        self.push_bytes(&Ref::to_bits(r).to_le_bytes())
    }

    pub fn pop_ref(&mut self) -> Result<Option<Ref>, ErrorKind> {
        Ok(Ref::from_bits(u64::from_le_bytes(self.pop_bytes::<8>()?)))
    }

    /// Read the reference `depth` bytes below the top without popping.
    pub fn peek_ref(&self, depth: usize) -> Result<Option<Ref>, ErrorKind> {
        if depth < REF_SIZE || depth > self.bytes.len() {
            return Err(ErrorKind::StackUnderflow);
        }
        let at = self.bytes.len() - depth;
        let mut bits = [0u8; REF_SIZE];
        bits.copy_from_slice(&self.bytes[at..at + REF_SIZE]);
        Ok(Ref::from_bits(u64::from_le_bytes(bits)))
    }

    /// Duplicate the top category-1 slot.
    pub fn dup(&mut self) -> Result<(), ErrorKind> {
        self.dup_top(4)
    }

    /// Duplicate the top category-2 slot.
    pub fn dup2(&mut self) -> Result<(), ErrorKind> {
        self.dup_top(8)
    }

    /// Duplicate the top reference slot. The caller is responsible for the
    /// duplicated reference's temporary refcount.
    pub fn dup_ref(&mut self) -> Result<(), ErrorKind> {
        self.dup_top(REF_SIZE)
    }

    fn dup_top(&mut self, size: usize) -> Result<(), ErrorKind> {
        if self.bytes.len() < size {
            return Err(ErrorKind::StackUnderflow);
        }
        if self.bytes.len() + size > self.capacity {
            return Err(ErrorKind::StackOverflow);
        }
        let at = self.bytes.len() - size;
        self.bytes.extend_from_within(at..);
        Ok(())
    }

    /// Copy the top `size1` bytes to the position `size1 + size2` below the
    /// top.
    pub fn dup_x1(&mut self, size1: usize, size2: usize) -> Result<(), ErrorKind> {
        self.dup_under(size1, size1 + size2)
    }

    /// Copy the top `size1` bytes to the position `size1 + size2 + size3`
    /// below the top.
    pub fn dup_x2(&mut self, size1: usize, size2: usize, size3: usize) -> Result<(), ErrorKind> {
        self.dup_under(size1, size1 + size2 + size3)
    }

    fn dup_under(&mut self, size: usize, depth: usize) -> Result<(), ErrorKind> {
        if self.bytes.len() < depth {
            return Err(ErrorKind::StackUnderflow);
        }
        if self.bytes.len() + size > self.capacity {
            return Err(ErrorKind::StackOverflow);
        }
        let top: Vec<u8> = self.bytes[self.bytes.len() - size..].to_vec();
        let at = self.bytes.len() - depth;
        self.bytes.splice(at..at, top);
        Ok(())
    }

    /// Append another stack's contents (return-value handoff).
    pub fn push_stack(&mut self, other: &OperandStack) -> Result<(), ErrorKind> {
        self.push_bytes(&other.bytes)
    }

    /// Read `len` bytes starting `depth` bytes below the top.
    pub fn view(&self, depth: usize, len: usize) -> Result<&[u8], ErrorKind> {
        if depth > self.bytes.len() || len > depth {
            return Err(ErrorKind::StackUnderflow);
        }
        let at = self.bytes.len() - depth;
        Ok(&self.bytes[at..at + len])
    }

    /// Discard the top `count` bytes.
    pub fn discard(&mut self, count: usize) -> Result<(), ErrorKind> {
        if count > self.bytes.len() {
            return Err(ErrorKind::StackUnderflow);
        }
        self.bytes.truncate(self.bytes.len() - count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_round_trip() {
        let mut stack = OperandStack::new(64);
        stack.push_i32(-7).unwrap();
        stack.push_f32(1.5).unwrap();
        stack.push_i64(1 << 40).unwrap();
        stack.push_f64(-0.25).unwrap();
        assert_eq!(stack.len(), 24);
        assert_eq!(stack.pop_f64().unwrap(), -0.25);
        assert_eq!(stack.pop_i64().unwrap(), 1 << 40);
        assert_eq!(stack.pop_f32().unwrap(), 1.5);
        assert_eq!(stack.pop_i32().unwrap(), -7);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_null_ref_round_trip() {
        let mut stack = OperandStack::new(16);
        stack.push_ref(None).unwrap();
        assert_eq!(stack.pop_ref().unwrap(), None);
    }

    #[test]
    fn test_underflow() {
        let mut stack = OperandStack::new(16);
        assert!(matches!(stack.pop_i32(), Err(ErrorKind::StackUnderflow)));
        stack.push_i32(1).unwrap();
        assert!(matches!(stack.pop_i64(), Err(ErrorKind::StackUnderflow)));
    }

    #[test]
    fn test_overflow() {
        let mut stack = OperandStack::new(6);
        stack.push_i32(1).unwrap();
        assert!(matches!(stack.push_i32(2), Err(ErrorKind::StackOverflow)));
    }

    #[test]
    fn test_dup() {
        let mut stack = OperandStack::new(16);
        stack.push_i32(9).unwrap();
        stack.dup().unwrap();
        assert_eq!(stack.pop_i32().unwrap(), 9);
        assert_eq!(stack.pop_i32().unwrap(), 9);
    }

    #[test]
    fn test_dup_x1() {
        // [a, b] -> [b, a, b] with 4-byte slots.
        let mut stack = OperandStack::new(32);
        stack.push_i32(1).unwrap();
        stack.push_i32(2).unwrap();
        stack.dup_x1(4, 4).unwrap();
        assert_eq!(stack.pop_i32().unwrap(), 2);
        assert_eq!(stack.pop_i32().unwrap(), 1);
        assert_eq!(stack.pop_i32().unwrap(), 2);
    }

    #[test]
    fn test_dup_x2() {
        // [a, b, c] -> [c, a, b, c].
        let mut stack = OperandStack::new(32);
        stack.push_i32(1).unwrap();
        stack.push_i32(2).unwrap();
        stack.push_i32(3).unwrap();
        stack.dup_x2(4, 4, 4).unwrap();
        assert_eq!(stack.pop_i32().unwrap(), 3);
        assert_eq!(stack.pop_i32().unwrap(), 2);
        assert_eq!(stack.pop_i32().unwrap(), 1);
        assert_eq!(stack.pop_i32().unwrap(), 3);
    }

    #[test]
    fn test_push_stack_handoff() {
        let mut callee = OperandStack::new(8);
        callee.push_i32(42).unwrap();
        let mut caller = OperandStack::new(8);
        caller.push_stack(&callee).unwrap();
        assert_eq!(caller.pop_i32().unwrap(), 42);
    }

    #[test]
    fn test_discard() {
        let mut stack = OperandStack::new(16);
        stack.push_i32(1).unwrap();
        stack.push_i32(2).unwrap();
        stack.discard(4).unwrap();
        assert_eq!(stack.pop_i32().unwrap(), 1);
        assert!(stack.discard(1).is_err());
    }
}
