//! Operand stack and local variable slots for a single call frame.
use crate::heap::HeapRef;
use crate::runtime::{Result, RuntimeError, RuntimeErrorKind};

/// Tagged run-time value. Every entry on the operand stack, every local
/// variable slot and every object field slot carries one of these; the tag
/// travels with the payload so consumers can check the kind they pop.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Value {
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    /// A handle into the heap arena, `None` for the null reference.
    Ref(Option<HeapRef>),
    /// An empty slot; also the result of a void method.
    None,
}

impl Value {
    /// Returns the widened 64-bit payload for any integer-kind value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Byte(v) => Some(i64::from(*v)),
            Self::Short(v) => Some(i64::from(*v)),
            Self::Int(v) => Some(i64::from(*v)),
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Byte(_) => "byte",
            Self::Short(_) => "short",
            Self::Int(_) => "int",
            Self::Long(_) => "long",
            Self::Ref(_) => "reference",
            Self::None => "none",
        }
    }
}

/// The per-call LIFO value stack instructions operate on. Capacity comes
/// from the method's `max_stack`; pushing past it only costs a reallocation.
#[derive(Debug)]
pub struct OperandStack {
    store: Vec<Value>,
}

impl OperandStack {
    pub fn new(max_stack: u16) -> Self {
        Self {
            store: Vec::with_capacity(max_stack as usize),
        }
    }

    pub fn push(&mut self, value: Value) {
        self.store.push(value);
    }

    pub fn push_byte(&mut self, value: i8) {
        self.store.push(Value::Byte(value));
    }

    pub fn push_short(&mut self, value: i16) {
        self.store.push(Value::Short(value));
    }

    pub fn push_int(&mut self, value: i32) {
        self.store.push(Value::Int(value));
    }

    pub fn push_long(&mut self, value: i64) {
        self.store.push(Value::Long(value));
    }

    pub fn push_ref(&mut self, value: Option<HeapRef>) {
        self.store.push(Value::Ref(value));
    }

    pub fn pop(&mut self) -> Result<Value> {
        self.store
            .pop()
            .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::StackUnderflow))
    }

    /// Pops an integer-kind entry and widens it to 64 bits regardless of
    /// whether the tag is byte, short, int or long.
    pub fn pop_int(&mut self) -> Result<i64> {
        let value = self.pop()?;
        value.as_int().ok_or_else(|| {
            RuntimeError::new(RuntimeErrorKind::TypeMismatch {
                expected: "integer",
                found: value.kind_name(),
            })
        })
    }

    /// Pops a reference entry; the tag must be a reference.
    pub fn pop_ref(&mut self) -> Result<Option<HeapRef>> {
        let value = self.pop()?;
        match value {
            Value::Ref(reference) => Ok(reference),
            other => Err(RuntimeError::new(RuntimeErrorKind::TypeMismatch {
                expected: "reference",
                found: other.kind_name(),
            })),
        }
    }

    /// Peeks at the top entry without removing it.
    pub fn top(&self) -> Result<Value> {
        self.store
            .last()
            .copied()
            .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::StackUnderflow))
    }

    /// Pops one entry into the given local slot, preserving its tag.
    pub fn pop_to_local(&mut self, locals: &mut [Value], index: usize) -> Result<()> {
        locals[index] = self.pop()?;
        Ok(())
    }

    pub fn dup(&mut self) -> Result<()> {
        let top = self.top()?;
        self.store.push(top);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeErrorKind;

    #[test]
    fn pop_int_widens_any_integer_kind() {
        let mut stack = OperandStack::new(4);
        stack.push_byte(-3);
        stack.push_short(700);
        stack.push_int(-70_000);
        stack.push_long(1 << 40);
        assert_eq!(stack.pop_int().unwrap(), 1 << 40);
        assert_eq!(stack.pop_int().unwrap(), -70_000);
        assert_eq!(stack.pop_int().unwrap(), 700);
        assert_eq!(stack.pop_int().unwrap(), -3);
    }

    #[test]
    fn pop_ref_rejects_integer_entries() {
        let mut stack = OperandStack::new(1);
        stack.push_int(42);
        let err = stack.pop_ref().unwrap_err();
        assert!(matches!(
            err.kind(),
            RuntimeErrorKind::TypeMismatch { expected: "reference", .. }
        ));
    }

    #[test]
    fn pop_on_empty_stack_underflows() {
        let mut stack = OperandStack::new(0);
        let err = stack.pop().unwrap_err();
        assert!(matches!(err.kind(), RuntimeErrorKind::StackUnderflow));
    }

    #[test]
    fn pop_to_local_preserves_the_tag() {
        let mut stack = OperandStack::new(2);
        let mut locals = vec![Value::None; 2];
        stack.push_long(9);
        stack.push_byte(1);
        stack.pop_to_local(&mut locals, 1).unwrap();
        stack.pop_to_local(&mut locals, 0).unwrap();
        assert_eq!(locals[0], Value::Long(9));
        assert_eq!(locals[1], Value::Byte(1));
    }

    #[test]
    fn dup_copies_the_top_entry() {
        let mut stack = OperandStack::new(2);
        stack.push_int(5);
        stack.dup().unwrap();
        assert_eq!(stack.pop_int().unwrap(), 5);
        assert_eq!(stack.pop_int().unwrap(), 5);
        assert!(stack.is_empty());
    }
}
