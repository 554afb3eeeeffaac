use std::{fmt, sync::Arc};

use crate::{ExecContext, ExecError, MethodId};

/// Outcome of executing one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionResult {
    /// Continue at this pc of the current top frame.
    Advanced(usize),
    /// Run the same instruction again when this thread is next scheduled.
    Repeat,
    /// The frame that executed the instruction was popped.
    FrameReturned,
}

/// A single executable step of a method body.
pub trait Instruction: fmt::Debug + Send + Sync {
    fn execute(&self, ctx: &mut ExecContext<'_>) -> Result<InstructionResult, ExecError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// First covered pc.
    pub begin: usize,
    /// First pc past the covered range.
    pub end: usize,
    pub handler: usize,
    /// Class name the handler catches, `None` catches everything.
    pub filter: Option<String>,
}

impl ExceptionHandler {
    #[inline]
    pub fn covers(&self, pc: usize) -> bool {
        self.begin <= pc && pc < self.end
    }
}

#[derive(Debug)]
pub struct MethodInfo {
    pub id: MethodId,
    pub name: String,
    pub instructions: Vec<Arc<dyn Instruction>>,
    pub max_locals: usize,
    pub max_stack: usize,
    /// Leading locals filled from the caller's operand stack.
    pub arg_slots: usize,
    /// Which argument slots hold references.
    pub arg_refs: Vec<bool>,
    pub handlers: Vec<ExceptionHandler>,
    /// Exceptions never propagate past a firewall frame.
    pub firewall: bool,
    /// Locks the receiver in local 0 for the duration of the call.
    pub synchronized: bool,
}

impl MethodInfo {
    pub fn new(name: impl Into<String>, instructions: Vec<Arc<dyn Instruction>>) -> Self {
        Self {
            id: MethodId(u32::MAX),
            name: name.into(),
            instructions,
            max_locals: 0,
            max_stack: 8,
            arg_slots: 0,
            arg_refs: Vec::new(),
            handlers: Vec::new(),
            firewall: false,
            synchronized: false,
        }
    }

    #[inline]
    pub fn instruction(&self, pc: usize) -> Option<&Arc<dyn Instruction>> {
        self.instructions.get(pc)
    }

    /// First handler covering `pc` whose filter accepts the thrown class.
    pub fn find_handler(
        &self,
        pc: usize,
        mut accepts: impl FnMut(Option<&str>) -> bool,
    ) -> Option<&ExceptionHandler> {
        self.handlers
            .iter()
            .find(|h| h.covers(pc) && accepts(h.filter.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(begin: usize, end: usize, filter: Option<&str>) -> ExceptionHandler {
        ExceptionHandler {
            begin,
            end,
            handler: 10,
            filter: filter.map(str::to_owned),
        }
    }

    #[test]
    fn handler_range_is_half_open() {
        let h = handler(2, 5, None);
        assert!(!h.covers(1));
        assert!(h.covers(2));
        assert!(h.covers(4));
        assert!(!h.covers(5));
    }

    #[test]
    fn find_handler_respects_filter_order() {
        let mut method = MethodInfo::new("m", Vec::new());
        method.handlers = vec![
            handler(0, 4, Some("ArithmeticException")),
            handler(0, 4, None),
        ];
        let found = method
            .find_handler(1, |filter| filter == Some("NullPointerException") || filter.is_none())
            .unwrap();
        assert_eq!(found.filter, None, "catch-all should be chosen");
        assert!(method.find_handler(7, |_| true).is_none());
    }
}
