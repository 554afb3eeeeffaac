use std::sync::Arc;

use crate::{EngineError, Handle, MethodInfo};

/// One activation record.
///
/// Locals occupy `slots[..max_locals]`, the operand stack follows. The
/// reference bitmap tells the collector and the state serializer which
/// slots hold handles. Frames form a chain through `previous`; a thread
/// snapshot shares that chain, and the first write to a shared frame
/// copies it.
#[derive(Debug, Clone)]
pub struct StackFrame {
    method: Arc<MethodInfo>,
    pc: usize,
    slots: Vec<i32>,
    refs: Vec<u64>,
    top: usize,
    /// Monitor entered on behalf of a synchronized method.
    lock: Handle,
    previous: Option<Arc<StackFrame>>,
}

impl StackFrame {
    pub fn new(method: Arc<MethodInfo>, previous: Option<Arc<StackFrame>>) -> Self {
        let len = method.max_locals + method.max_stack;
        Self {
            slots: vec![0; len],
            refs: vec![0; len.div_ceil(64)],
            pc: 0,
            top: 0,
            lock: Handle::NULL,
            method,
            previous,
        }
    }

    #[inline]
    pub fn method(&self) -> &Arc<MethodInfo> {
        &self.method
    }

    #[inline]
    pub fn pc(&self) -> usize {
        self.pc
    }

    #[inline]
    pub fn set_pc(&mut self, pc: usize) {
        self.pc = pc;
    }

    #[inline]
    pub fn previous(&self) -> Option<&Arc<StackFrame>> {
        self.previous.as_ref()
    }

    #[inline]
    pub(crate) fn take_previous(&mut self) -> Option<Arc<StackFrame>> {
        self.previous.take()
    }

    #[inline]
    pub(crate) fn link(&mut self, previous: Option<Arc<StackFrame>>) {
        self.previous = previous;
    }

    #[inline]
    pub fn lock(&self) -> Handle {
        self.lock
    }

    #[inline]
    pub fn set_lock(&mut self, handle: Handle) {
        self.lock = handle;
    }

    #[inline]
    pub fn operand_count(&self) -> usize {
        self.top
    }

    #[inline]
    fn max_locals(&self) -> usize {
        self.method.max_locals
    }

    #[inline]
    pub fn is_reference(&self, slot: usize) -> bool {
        self.refs
            .get(slot / 64)
            .is_some_and(|word| word & (1 << (slot % 64)) != 0)
    }

    #[inline]
    fn set_slot(&mut self, slot: usize, value: i32, is_ref: bool) {
        self.slots[slot] = value;
        let bit = 1u64 << (slot % 64);
        if is_ref {
            self.refs[slot / 64] |= bit;
        } else {
            self.refs[slot / 64] &= !bit;
        }
    }

    /// Used slots, locals first, with their reference flag.
    pub fn used_slots(&self) -> impl Iterator<Item = (i32, bool)> + '_ {
        (0..self.max_locals() + self.top).map(|i| (self.slots[i], self.is_reference(i)))
    }

    pub fn for_each_reference(&self, mut f: impl FnMut(Handle)) {
        for (value, is_ref) in self.used_slots() {
            if is_ref && value >= 0 {
                f(Handle::new(value));
            }
        }
    }

    // ── Locals ────────────────────────────────────────────────────────

    fn check_local(&self, index: usize, width: usize) -> Result<(), EngineError> {
        if index + width > self.max_locals() {
            return Err(EngineError::Inconsistent(format!(
                "local {index} out of range in `{}`",
                self.method.name
            )));
        }
        Ok(())
    }

    pub fn local(&self, index: usize) -> Result<i32, EngineError> {
        self.check_local(index, 1)?;
        Ok(self.slots[index])
    }

    pub fn local_ref(&self, index: usize) -> Result<Handle, EngineError> {
        self.local(index).map(Handle::from_slot)
    }

    pub fn local_long(&self, index: usize) -> Result<i64, EngineError> {
        self.check_local(index, 2)?;
        Ok(join_long(self.slots[index], self.slots[index + 1]))
    }

    pub fn set_local(&mut self, index: usize, value: i32) -> Result<(), EngineError> {
        self.check_local(index, 1)?;
        self.set_slot(index, value, false);
        Ok(())
    }

    pub fn set_local_ref(&mut self, index: usize, value: Handle) -> Result<(), EngineError> {
        self.check_local(index, 1)?;
        self.set_slot(index, value.raw(), true);
        Ok(())
    }

    pub fn set_local_long(&mut self, index: usize, value: i64) -> Result<(), EngineError> {
        self.check_local(index, 2)?;
        let (lo, hi) = split_long(value);
        self.set_slot(index, lo, false);
        self.set_slot(index + 1, hi, false);
        Ok(())
    }

    // ── Operand stack ─────────────────────────────────────────────────

    pub fn push(&mut self, value: i32, is_ref: bool) -> Result<(), EngineError> {
        if self.top >= self.method.max_stack {
            return Err(EngineError::OperandOverflow(self.method.name.clone()));
        }
        let slot = self.max_locals() + self.top;
        self.set_slot(slot, value, is_ref);
        self.top += 1;
        Ok(())
    }

    #[inline]
    pub fn push_int(&mut self, value: i32) -> Result<(), EngineError> {
        self.push(value, false)
    }

    #[inline]
    pub fn push_ref(&mut self, value: Handle) -> Result<(), EngineError> {
        self.push(value.raw(), true)
    }

    pub fn push_long(&mut self, value: i64) -> Result<(), EngineError> {
        let (lo, hi) = split_long(value);
        self.push(lo, false)?;
        self.push(hi, false)
    }

    /// Pops one slot with its reference flag.
    pub fn pop(&mut self) -> Result<(i32, bool), EngineError> {
        if self.top == 0 {
            return Err(EngineError::OperandUnderflow(self.method.name.clone()));
        }
        self.top -= 1;
        let slot = self.max_locals() + self.top;
        let entry = (self.slots[slot], self.is_reference(slot));
        // stale slots must not look like references
        self.set_slot(slot, 0, false);
        Ok(entry)
    }

    #[inline]
    pub fn pop_int(&mut self) -> Result<i32, EngineError> {
        self.pop().map(|(v, _)| v)
    }

    #[inline]
    pub fn pop_ref(&mut self) -> Result<Handle, EngineError> {
        self.pop().map(|(v, _)| Handle::from_slot(v))
    }

    pub fn pop_long(&mut self) -> Result<i64, EngineError> {
        let hi = self.pop_int()?;
        let lo = self.pop_int()?;
        Ok(join_long(lo, hi))
    }

    /// Slot `depth` below the top, 0 being the top itself.
    pub fn peek(&self, depth: usize) -> Result<(i32, bool), EngineError> {
        if depth >= self.top {
            return Err(EngineError::OperandUnderflow(self.method.name.clone()));
        }
        let slot = self.max_locals() + self.top - 1 - depth;
        Ok((self.slots[slot], self.is_reference(slot)))
    }

    pub fn peek_ref(&self, depth: usize) -> Result<Handle, EngineError> {
        self.peek(depth).map(|(v, _)| Handle::from_slot(v))
    }

    pub fn dup(&mut self) -> Result<(), EngineError> {
        let (value, is_ref) = self.peek(0)?;
        self.push(value, is_ref)
    }

    pub fn clear_operands(&mut self) {
        while self.top > 0 {
            self.top -= 1;
            let slot = self.max_locals() + self.top;
            self.set_slot(slot, 0, false);
        }
    }
}

#[inline]
fn split_long(value: i64) -> (i32, i32) {
    (value as i32, (value >> 32) as i32)
}

#[inline]
fn join_long(lo: i32, hi: i32) -> i64 {
    ((hi as i64) << 32) | (lo as u32 as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(max_locals: usize, max_stack: usize) -> StackFrame {
        let mut method = MethodInfo::new("test", Vec::new());
        method.max_locals = max_locals;
        method.max_stack = max_stack;
        StackFrame::new(Arc::new(method), None)
    }

    #[test]
    fn operand_stack_tracks_references() {
        let mut f = frame(1, 4);
        f.push_int(3).unwrap();
        f.push_ref(Handle::new(9)).unwrap();
        assert!(f.is_reference(2));
        assert_eq!(f.pop_ref().unwrap(), Handle::new(9));
        assert!(!f.is_reference(2), "popped slot is scrubbed");
        assert_eq!(f.pop_int().unwrap(), 3);
        assert!(matches!(f.pop(), Err(EngineError::OperandUnderflow(_))));
    }

    #[test]
    fn overflow_is_reported() {
        let mut f = frame(0, 1);
        f.push_int(1).unwrap();
        assert!(matches!(
            f.push_int(2),
            Err(EngineError::OperandOverflow(_))
        ));
    }

    #[test]
    fn longs_round_trip_through_locals_and_stack() {
        let mut f = frame(2, 4);
        f.set_local_long(0, i64::MIN + 7).unwrap();
        assert_eq!(f.local_long(0).unwrap(), i64::MIN + 7);
        f.push_long(-2).unwrap();
        assert_eq!(f.operand_count(), 2);
        assert_eq!(f.pop_long().unwrap(), -2);
    }

    #[test]
    fn references_cover_locals_and_used_operands() {
        let mut f = frame(2, 3);
        f.set_local_ref(1, Handle::new(4)).unwrap();
        f.set_local_ref(0, Handle::NULL).unwrap();
        f.push_ref(Handle::new(5)).unwrap();
        let mut seen = Vec::new();
        f.for_each_reference(|h| seen.push(h));
        assert_eq!(seen, vec![Handle::new(4), Handle::new(5)]);
    }

    #[test]
    fn cloned_frame_is_independent() {
        let mut f = frame(1, 2);
        f.set_local(0, 1).unwrap();
        let shared = Arc::new(f);
        let mut copy = shared.clone();
        Arc::make_mut(&mut copy).set_local(0, 2).unwrap();
        assert_eq!(shared.local(0).unwrap(), 1);
        assert_eq!(copy.local(0).unwrap(), 2);
    }
}
