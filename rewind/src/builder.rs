use std::sync::Arc;

use crate::{BuildError, ClassRegistry, ExceptionHandler, Instruction, MethodInfo, Op};

/// A branch target inside the method being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug)]
struct Fixup {
    pc: usize,
    label: Label,
    make: fn(usize) -> Op,
}

#[derive(Debug)]
struct PendingHandler {
    begin: Label,
    end: Label,
    handler: Label,
    filter: Option<String>,
}

/// Assembles a [`MethodInfo`] from [`Op`]s with symbolic branch targets.
///
/// Labels may be bound before or after the branches that use them; targets
/// are patched in [`build`](Self::build).
#[derive(Debug)]
pub struct MethodBuilder {
    name: String,
    ops: Vec<Op>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
    handlers: Vec<PendingHandler>,
    max_locals: usize,
    max_stack: usize,
    args: Vec<bool>,
    firewall: bool,
    synchronized: bool,
}

impl MethodBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ops: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            handlers: Vec::new(),
            max_locals: 0,
            max_stack: 16,
            args: Vec::new(),
            firewall: false,
            synchronized: false,
        }
    }

    /// Minimum local slot count. Locals touched by the ops are counted
    /// automatically.
    pub fn locals(&mut self, count: usize) -> &mut Self {
        self.max_locals = count;
        self
    }

    pub fn stack(&mut self, depth: usize) -> &mut Self {
        self.max_stack = depth;
        self
    }

    /// Argument slots, `true` for references.
    pub fn args(&mut self, refs: &[bool]) -> &mut Self {
        self.args = refs.to_vec();
        self
    }

    pub fn synchronized(&mut self) -> &mut Self {
        self.synchronized = true;
        self
    }

    pub fn firewall(&mut self) -> &mut Self {
        self.firewall = true;
        self
    }

    /// Pc of the next op.
    #[inline]
    pub fn pc(&self) -> usize {
        self.ops.len()
    }

    pub fn op(&mut self, op: Op) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn ops(&mut self, ops: impl IntoIterator<Item = Op>) -> &mut Self {
        self.ops.extend(ops);
        self
    }

    pub fn create_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds `label` to the next op.
    pub fn bind(&mut self, label: Label) -> Result<&mut Self, BuildError> {
        let Some(slot) = self.labels.get_mut(label.0) else {
            return Err(BuildError::LabelUnbound {
                method: self.name.clone(),
                label: label.0,
            });
        };
        if slot.is_some() {
            return Err(BuildError::LabelAlreadyBound {
                method: self.name.clone(),
                label: label.0,
            });
        }
        *slot = Some(self.ops.len());
        Ok(self)
    }

    /// Emits a branch built by `make` (e.g. `Op::IfZero`) towards `label`.
    pub fn jump(&mut self, make: fn(usize) -> Op, label: Label) -> &mut Self {
        self.fixups.push(Fixup {
            pc: self.ops.len(),
            label,
            make,
        });
        self.ops.push(make(usize::MAX));
        self
    }

    pub fn goto(&mut self, label: Label) -> &mut Self {
        self.jump(Op::Goto, label)
    }

    /// Covers `begin..end` with a handler at `handler`. `None` catches all.
    pub fn handler(
        &mut self,
        begin: Label,
        end: Label,
        handler: Label,
        filter: Option<&str>,
    ) -> &mut Self {
        self.handlers.push(PendingHandler {
            begin,
            end,
            handler,
            filter: filter.map(str::to_owned),
        });
        self
    }

    fn resolve(&self, label: Label) -> Result<usize, BuildError> {
        self.labels
            .get(label.0)
            .copied()
            .flatten()
            .ok_or_else(|| BuildError::LabelUnbound {
                method: self.name.clone(),
                label: label.0,
            })
    }

    fn locals_used(&self) -> usize {
        self.ops
            .iter()
            .filter_map(|op| match *op {
                Op::Load(i) | Op::LoadRef(i) | Op::Store(i) | Op::StoreRef(i) | Op::Inc(i, _) => {
                    Some(i + 1)
                }
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    pub fn build(mut self) -> Result<MethodInfo, BuildError> {
        if self.ops.is_empty() {
            return Err(BuildError::EmptyMethod(self.name));
        }
        for fixup in &self.fixups {
            let target = self.resolve(fixup.label)?;
            self.ops[fixup.pc] = (fixup.make)(target);
        }
        let handlers = self
            .handlers
            .iter()
            .map(|h| {
                Ok(ExceptionHandler {
                    begin: self.resolve(h.begin)?,
                    end: self.resolve(h.end)?,
                    handler: self.resolve(h.handler)?,
                    filter: h.filter.clone(),
                })
            })
            .collect::<Result<Vec<_>, BuildError>>()?;

        let max_locals = self
            .max_locals
            .max(self.args.len())
            .max(self.locals_used());
        let instructions: Vec<Arc<dyn Instruction>> = std::mem::take(&mut self.ops)
            .into_iter()
            .map(|op| Arc::new(op) as Arc<dyn Instruction>)
            .collect();
        let mut method = MethodInfo::new(self.name, instructions);
        method.max_locals = max_locals;
        method.max_stack = self.max_stack;
        method.arg_slots = self.args.len();
        method.arg_refs = self.args;
        method.handlers = handlers;
        method.firewall = self.firewall;
        method.synchronized = self.synchronized;
        Ok(method)
    }

    /// Builds the method and installs it in `registry`.
    pub fn register(self, registry: &ClassRegistry) -> Result<Arc<MethodInfo>, BuildError> {
        Ok(registry.register_method(self.build()?))
    }
}
