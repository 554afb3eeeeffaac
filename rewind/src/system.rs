use std::sync::Arc;

use crate::{
    ChoiceGenerator, ChoiceSpec, ClassRegistry, Control, EngineCreateInfo, EngineError, EventBus,
    ExecContext, GcStats, HeapSettings, KernelMemento, KernelState, MethodInfo, SchedulingPolicy,
    SearchSettings, StateId, StateView, ThreadId, ThreadState, TransitionRecord, UncaughtException,
    interpreter::Step,
};

/// Search-level part of a snapshot. Choice generators are kept by value:
/// the alternatives are shared, the position is copied.
#[derive(Debug, Clone)]
pub struct SystemMemento {
    id: StateId,
    parent: StateId,
    depth: usize,
    cur_cg: Option<ChoiceGenerator>,
    next_cg: Option<ChoiceGenerator>,
    scheduled: Option<ThreadId>,
    is_end: bool,
    uncaught: Option<UncaughtException>,
}

impl SystemMemento {
    pub fn id(&self) -> StateId {
        self.id
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// Everything needed to jump back to a state outside the backtrack order.
#[derive(Debug, Clone)]
pub struct RestorableState {
    kernel: KernelMemento,
    system: SystemMemento,
}

impl RestorableState {
    pub fn id(&self) -> StateId {
        self.system.id
    }
}

/// Kernel state plus the choice generators and bookkeeping of the search.
#[derive(Debug)]
pub struct SystemState {
    kernel: KernelState,
    policy: Box<dyn SchedulingPolicy>,
    settings: SearchSettings,
    id: StateId,
    depth: usize,
    /// Generator whose current choice drives the running transition.
    cur_cg: Option<ChoiceGenerator>,
    /// Generator registered by the last transition.
    next_cg: Option<ChoiceGenerator>,
    scheduled: Option<ThreadId>,
    is_new: bool,
    is_end: bool,
    uncaught: Option<UncaughtException>,
    control: Control,
    instructions: usize,
}

impl SystemState {
    pub fn new(
        classes: ClassRegistry,
        info: &EngineCreateInfo,
        policy: Box<dyn SchedulingPolicy>,
    ) -> Result<Self, EngineError> {
        let heap = HeapSettings::from_create_info(&info.heap)?;
        info.search.validate()?;
        Ok(Self {
            kernel: KernelState::new(classes, heap),
            policy,
            settings: info.search.clone(),
            id: StateId(0),
            depth: 0,
            cur_cg: None,
            next_cg: None,
            scheduled: None,
            is_new: true,
            is_end: false,
            uncaught: None,
            control: Control::default(),
            instructions: 0,
        })
    }

    /// Creates the main thread and the root scheduling choice.
    pub fn initialize(&mut self, entry: Arc<MethodInfo>) -> Result<ThreadId, EngineError> {
        let main = self.kernel.create_main_thread(entry)?;
        self.next_cg = Some(ChoiceGenerator::scheduling("root", main, &[main]));
        Ok(main)
    }

    // ── Queries ───────────────────────────────────────────────────────

    #[inline]
    pub fn kernel(&self) -> &KernelState {
        &self.kernel
    }

    #[inline]
    pub fn kernel_mut(&mut self) -> &mut KernelState {
        &mut self.kernel
    }

    #[inline]
    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    #[inline]
    pub fn policy(&self) -> &dyn SchedulingPolicy {
        self.policy.as_ref()
    }

    #[inline]
    pub fn id(&self) -> StateId {
        self.id
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    #[inline]
    pub fn is_end(&self) -> bool {
        self.is_end
    }

    #[inline]
    pub fn control(&self) -> &Control {
        &self.control
    }

    pub fn choice_generator(&self) -> Option<&ChoiceGenerator> {
        self.cur_cg.as_ref()
    }

    pub fn next_choice_generator(&self) -> Option<&ChoiceGenerator> {
        self.next_cg.as_ref()
    }

    pub fn scheduled_thread(&self) -> Option<ThreadId> {
        self.scheduled
    }

    pub fn uncaught_exception(&self) -> Option<&UncaughtException> {
        self.uncaught.as_ref()
    }

    /// Instructions executed by the last transition.
    pub fn instructions(&self) -> usize {
        self.instructions
    }

    pub fn is_deadlocked(&self) -> bool {
        self.next_cg.is_none()
            && self.uncaught.is_none()
            && self.kernel.threads.has_alive_non_daemon()
            && self.policy.candidates(&self.kernel).is_empty()
    }

    pub(crate) fn set_classification(&mut self, id: StateId, is_new: bool) {
        self.id = id;
        self.is_new = is_new;
    }

    /// The thread and choices of the last transition.
    pub fn transition_record(&self) -> TransitionRecord {
        TransitionRecord {
            thread: self.scheduled.unwrap_or(ThreadId(0)),
            choices: self
                .cur_cg
                .as_ref()
                .map(ChoiceGenerator::specs)
                .unwrap_or_default(),
        }
    }

    // ── Transitions ───────────────────────────────────────────────────

    /// Promotes the pending generator and advances to its next choice.
    /// Returns false when the current generator is exhausted.
    pub fn initialize_next_transition(&mut self, bus: &mut EventBus) -> bool {
        if let Some(next) = self.next_cg.take() {
            self.cur_cg = Some(next);
        }
        let advanced = match self.cur_cg.as_mut() {
            Some(cg) if cg.has_more() => cg.advance(),
            _ => false,
        };
        if let Some(cg) = self.cur_cg.as_ref() {
            let view = StateView::new(self);
            if advanced {
                log::debug!("{} advances {cg}", self.id);
                bus.choice_generator_advanced(&view, cg);
            } else {
                bus.choice_generator_processed(&view, cg);
            }
        }
        advanced
    }

    /// Runs the scheduled thread until the transition ends.
    pub fn execute_transition(&mut self, bus: &mut EventBus) -> Result<(), EngineError> {
        let thread = self
            .cur_cg
            .as_ref()
            .map(ChoiceGenerator::scheduled_thread)
            .ok_or(EngineError::NoScheduledThread)?;
        self.scheduled = Some(thread);
        self.depth += 1;
        self.control.reset();
        self.uncaught = None;
        self.is_end = false;
        self.instructions = 0;

        let info = self.kernel.threads.require(thread)?;
        let (state, runnable) = (info.state(), info.is_runnable());
        match state {
            ThreadState::TimeoutWaiting => self.kernel.timeout(thread)?,
            ThreadState::Sleeping => self.kernel.set_thread_state(thread, ThreadState::Running)?,
            _ if !runnable => {
                return Err(EngineError::Inconsistent(format!(
                    "scheduled {thread} is not runnable ({state})"
                )));
            }
            _ => {}
        }
        self.dispatch_events(bus);

        loop {
            let (method, pc) = {
                let frame = self
                    .kernel
                    .threads
                    .require(thread)?
                    .top()
                    .ok_or_else(|| EngineError::Inconsistent(format!("{thread} has no frame")))?;
                (Arc::clone(frame.method()), frame.pc())
            };
            let step = ExecContext::new(
                &mut self.kernel,
                thread,
                self.policy.as_ref(),
                &self.settings,
                self.cur_cg.as_ref(),
                &mut self.next_cg,
            )
            .step()?;
            self.instructions += 1;
            bus.instruction_executed(&StateView::new(self), thread, &method, pc);
            self.dispatch_events(bus);

            let backjump = match step {
                Step::Repeat => break,
                Step::Uncaught(exception) => {
                    self.next_cg = None;
                    self.uncaught = Some(exception);
                    break;
                }
                Step::Continue { backjump } => backjump,
            };
            if self.next_cg.is_some() || !self.kernel.threads.require(thread)?.is_runnable() {
                break;
            }
            let over_budget = backjump && self.instructions >= self.settings.max_transition_length;
            if over_budget || self.control.is_break_requested() {
                log::debug!("{thread} breaks after {} instructions", self.instructions);
                self.control.clear_break();
                let candidates = self.policy.candidates(&self.kernel);
                if !candidates.is_empty() {
                    self.next_cg = Some(ChoiceGenerator::scheduling("break", thread, &candidates));
                }
                break;
            }
        }

        self.is_end = self.next_cg.is_none();
        if let Some(cg) = self.next_cg.as_ref() {
            bus.choice_generator_registered(&StateView::new(self), cg);
        }
        Ok(())
    }

    fn dispatch_events(&mut self, bus: &mut EventBus) {
        let events = self.kernel.drain_events();
        if !events.is_empty() {
            bus.dispatch(&StateView::new(self), &events);
        }
    }

    pub fn collect_garbage(&mut self, bus: &mut EventBus) -> GcStats {
        let stats = self.kernel.collect_garbage();
        self.dispatch_events(bus);
        stats
    }

    /// Pins the pending generator chain to the recorded choices.
    pub fn force_next(&mut self, choices: &[ChoiceSpec], transition: usize) -> Result<(), EngineError> {
        let diverged = |reason: String| EngineError::ReplayDiverged {
            index: transition,
            reason,
        };
        let next = self
            .next_cg
            .as_mut()
            .ok_or_else(|| diverged("no choice generator pending".to_owned()))?;
        next.force_specs(choices).map_err(diverged)
    }

    // ── Snapshots ─────────────────────────────────────────────────────

    pub fn memento(&self, parent: StateId) -> SystemMemento {
        SystemMemento {
            id: self.id,
            parent,
            depth: self.depth,
            cur_cg: self.cur_cg.clone(),
            next_cg: self.next_cg.clone(),
            scheduled: self.scheduled,
            is_end: self.is_end,
            uncaught: self.uncaught.clone(),
        }
    }

    /// Goes back to the state before the transition `system` recorded. The
    /// generator that drove it stays current so the next forward step picks
    /// its next choice.
    pub(crate) fn backtrack_to(&mut self, kernel: &KernelMemento, system: SystemMemento) {
        self.kernel.restore(kernel);
        self.cur_cg = system.cur_cg;
        self.next_cg = None;
        self.id = system.parent;
        self.depth = system.depth.saturating_sub(1);
        self.scheduled = None;
        self.uncaught = None;
        self.is_new = false;
        self.is_end = false;
        self.control.reset();
    }

    pub fn restorable_state(&mut self, parent: StateId) -> RestorableState {
        RestorableState {
            kernel: self.kernel.memento(),
            system: self.memento(parent),
        }
    }

    /// Reinstalls a state captured by [`Self::restorable_state`] exactly.
    pub(crate) fn restore(&mut self, state: &RestorableState) {
        let system = state.system.clone();
        self.kernel.restore(&state.kernel);
        self.id = system.id;
        self.depth = system.depth;
        self.cur_cg = system.cur_cg;
        self.next_cg = system.next_cg;
        self.scheduled = system.scheduled;
        self.is_end = system.is_end;
        self.uncaught = system.uncaught;
        self.control.reset();
    }
}
