use crate::{EngineError, KernelMemento, RestorableState, StateId, SystemMemento, SystemState};

/// Snapshot stack of the search.
///
/// Every forward step pushes the kernel state from before the transition
/// and the system state from after it. Backtracking pops both and lands in
/// the pre-transition state with the generator that drove the transition
/// still current.
#[derive(Debug, Default)]
pub struct Backtracker {
    kernel_states: Vec<KernelMemento>,
    system_states: Vec<SystemMemento>,
}

impl Backtracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_kernel_state(&mut self, state: &mut SystemState) {
        self.kernel_states.push(state.kernel_mut().memento());
    }

    pub fn push_system_state(&mut self, state: &SystemState, parent: StateId) -> Result<(), EngineError> {
        if self.system_states.len() + 1 != self.kernel_states.len() {
            return Err(EngineError::Inconsistent(format!(
                "system snapshot {} without matching kernel snapshot ({} kernel snapshots)",
                self.system_states.len(),
                self.kernel_states.len()
            )));
        }
        self.system_states.push(state.memento(parent));
        Ok(())
    }

    /// Undoes the last transition. Returns false once nothing is left.
    pub fn backtrack(&mut self, state: &mut SystemState) -> bool {
        let (Some(system), Some(kernel)) = (self.system_states.pop(), self.kernel_states.pop())
        else {
            return false;
        };
        log::debug!("backtrack from {} to depth {}", system.id(), system.depth().saturating_sub(1));
        state.backtrack_to(&kernel, system);
        true
    }

    /// Drops a kernel snapshot whose transition produced no system snapshot.
    pub fn discard_kernel_state(&mut self) {
        if self.kernel_states.len() > self.system_states.len() {
            self.kernel_states.pop();
        }
    }

    /// Reinstalls `restorable` and makes it the bottom of the stack.
    pub fn restore_state(&mut self, state: &mut SystemState, restorable: &RestorableState) {
        self.kernel_states.clear();
        self.system_states.clear();
        state.restore(restorable);
    }

    pub fn depth(&self) -> usize {
        self.system_states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.system_states.is_empty()
    }
}
