use std::sync::Arc;

use crate::{
    ARITHMETIC_EXCEPTION, ArrayType, Choice, ChoiceGenerator, ClassInfo, ElementInfo, EngineError,
    Event, ExecError, Fields, Handle, ILLEGAL_THREAD_STATE, INTERRUPTED_EXCEPTION,
    InstructionResult, KernelState, MethodInfo, NEGATIVE_ARRAY_SIZE, NULL_POINTER_EXCEPTION,
    OUT_OF_MEMORY_ERROR, STACK_OVERFLOW_ERROR, SchedulingPolicy, SearchSettings, StackFrame,
    ThreadId, ThreadState, UncaughtException,
};

/// How the interpreter left one instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    Continue { backjump: bool },
    /// The instruction runs again when its thread is next scheduled.
    Repeat,
    /// The thread died of an exception nobody caught.
    Uncaught(UncaughtException),
}

/// Everything an instruction may touch while it executes.
///
/// The monitor and thread operations here implement the scheduling points:
/// they register choice generators and, where the instruction has to finish
/// after the choice, set the thread's resuming flag and ask for a repeat.
pub struct ExecContext<'a> {
    kernel: &'a mut KernelState,
    thread: ThreadId,
    policy: &'a dyn SchedulingPolicy,
    settings: &'a SearchSettings,
    current: Option<&'a ChoiceGenerator>,
    next: &'a mut Option<ChoiceGenerator>,
}

impl<'a> ExecContext<'a> {
    pub(crate) fn new(
        kernel: &'a mut KernelState,
        thread: ThreadId,
        policy: &'a dyn SchedulingPolicy,
        settings: &'a SearchSettings,
        current: Option<&'a ChoiceGenerator>,
        next: &'a mut Option<ChoiceGenerator>,
    ) -> Self {
        Self {
            kernel,
            thread,
            policy,
            settings,
            current,
            next,
        }
    }

    #[inline]
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    #[inline]
    pub fn kernel(&self) -> &KernelState {
        self.kernel
    }

    #[inline]
    pub fn kernel_mut(&mut self) -> &mut KernelState {
        self.kernel
    }

    #[inline]
    pub fn settings(&self) -> &SearchSettings {
        self.settings
    }

    // ── Frame access ──────────────────────────────────────────────────

    pub fn frame(&self) -> Result<&StackFrame, EngineError> {
        self.kernel
            .threads
            .require(self.thread)?
            .top()
            .map(Arc::as_ref)
            .ok_or_else(|| EngineError::Inconsistent(format!("{} has no frame", self.thread)))
    }

    pub fn frame_mut(&mut self) -> Result<&mut StackFrame, EngineError> {
        self.kernel.threads.modifiable(self.thread)?.top_mut()
    }

    pub fn pc(&self) -> Result<usize, EngineError> {
        self.frame().map(StackFrame::pc)
    }

    pub fn push_int(&mut self, value: i32) -> Result<(), EngineError> {
        self.frame_mut()?.push_int(value)
    }

    pub fn push_ref(&mut self, value: Handle) -> Result<(), EngineError> {
        self.frame_mut()?.push_ref(value)
    }

    pub fn push_long(&mut self, value: i64) -> Result<(), EngineError> {
        self.frame_mut()?.push_long(value)
    }

    pub fn pop_int(&mut self) -> Result<i32, EngineError> {
        self.frame_mut()?.pop_int()
    }

    pub fn pop_ref(&mut self) -> Result<Handle, EngineError> {
        self.frame_mut()?.pop_ref()
    }

    pub fn pop_long(&mut self) -> Result<i64, EngineError> {
        self.frame_mut()?.pop_long()
    }

    /// Pushes a reference read out of the heap. The thread now holds a
    /// handle to the object, which counts towards sharing.
    pub fn load_ref(&mut self, value: Handle) -> Result<(), ExecError> {
        if !value.is_null() {
            self.kernel.heap.touch(value, self.thread)?;
        }
        Ok(self.push_ref(value)?)
    }

    pub fn peek_int(&self, depth: usize) -> Result<i32, EngineError> {
        self.frame()?.peek(depth).map(|(v, _)| v)
    }

    pub fn peek_ref(&self, depth: usize) -> Result<Handle, EngineError> {
        self.frame()?.peek_ref(depth)
    }

    // ── Resumption and choices ────────────────────────────────────────

    /// The current instruction already ran its first half and is now
    /// re-executed after a choice.
    pub fn is_resuming(&self) -> bool {
        self.kernel
            .threads
            .get(self.thread)
            .is_some_and(|t| t.data().resuming)
    }

    fn current_is_runnable(&self) -> bool {
        self.kernel
            .threads
            .get(self.thread)
            .is_some_and(|t| t.is_runnable())
    }

    pub(crate) fn set_resuming(&mut self, resuming: bool) -> Result<(), EngineError> {
        if self.is_resuming() != resuming {
            self.kernel.threads.modifiable(self.thread)?.data_mut().resuming = resuming;
        }
        Ok(())
    }

    /// Registers a generator that ends the transition after this
    /// instruction. Empty generators are dropped.
    pub fn register_choice(&mut self, cg: ChoiceGenerator) -> bool {
        if cg.total() == 0 {
            return false;
        }
        log::debug!("{} registers {cg}", self.thread);
        match self.next.as_mut() {
            Some(next) => next.register(cg),
            None => *self.next = Some(cg),
        }
        true
    }

    /// Choice made for generator `id` at the start of this transition.
    pub fn choice(&self, id: &str) -> Option<Choice> {
        self.current.and_then(|cg| cg.choice_of(id))
    }

    /// Offers the other threads a chance to run. Returns false when there
    /// is nobody to switch to. A thread that stopped being runnable (a
    /// timed waiter) still gets a choice when it is its own only candidate.
    pub fn reschedule(&mut self, id: &str) -> bool {
        let candidates = self.policy.candidates(self.kernel);
        if candidates.is_empty() {
            return false;
        }
        if candidates == [self.thread] && self.current_is_runnable() {
            return false;
        }
        self.register_choice(ChoiceGenerator::scheduling(id, self.thread, &candidates))
    }

    /// Data choice over `min..=max`; `None` means the generator was just
    /// registered and the instruction has to repeat.
    pub fn choose_int(&mut self, id: &str, min: i32, max: i32) -> Result<Option<i32>, ExecError> {
        if self.is_resuming() {
            return self
                .choice(id)
                .and_then(Choice::int)
                .map(Some)
                .ok_or_else(|| missing_choice(id).into());
        }
        if min > max {
            return Err(ExecError::throw(
                ARITHMETIC_EXCEPTION,
                format!("empty choice range {min}..={max}"),
            ));
        }
        self.register_choice(ChoiceGenerator::int_range(id, self.thread, min, max));
        self.set_resuming(true)?;
        Ok(None)
    }

    pub fn choose_bool(&mut self, id: &str) -> Result<Option<bool>, ExecError> {
        if self.is_resuming() {
            return match self.choice(id) {
                Some(Choice::Bool(b)) => Ok(Some(b)),
                _ => Err(missing_choice(id).into()),
            };
        }
        self.register_choice(ChoiceGenerator::boolean(id, self.thread));
        self.set_resuming(true)?;
        Ok(None)
    }

    // ── Objects ───────────────────────────────────────────────────────

    pub fn non_null(&self, handle: Handle) -> Result<Handle, ExecError> {
        if handle.is_null() {
            return Err(ExecError::throw(NULL_POINTER_EXCEPTION, "null dereference"));
        }
        Ok(handle)
    }

    pub fn object(&self, handle: Handle) -> Result<&ElementInfo, ExecError> {
        let handle = self.non_null(handle)?;
        Ok(self.kernel.heap.require(handle)?)
    }

    /// Records the access and consults the access-break policy. Returns
    /// false when the transition breaks here and the instruction repeats.
    pub fn access(&mut self, object: Handle) -> Result<bool, ExecError> {
        let object = self.non_null(object)?;
        self.kernel.heap.touch(object, self.thread)?;
        if self.is_resuming() {
            return Ok(true);
        }
        let ei = self.kernel.heap.require(object)?;
        if self.policy.break_on_access(ei, self.thread) && self.reschedule("access") {
            self.set_resuming(true)?;
            return Ok(false);
        }
        Ok(true)
    }

    pub fn fields(&self, object: Handle) -> Result<&Fields, ExecError> {
        self.object(object).map(ElementInfo::fields)
    }

    pub fn fields_mut(&mut self, object: Handle) -> Result<&mut Fields, ExecError> {
        let object = self.non_null(object)?;
        Ok(self.kernel.heap.modifiable(object)?.fields_mut())
    }

    pub fn static_fields(&mut self, class: &Arc<ClassInfo>) -> Result<&Fields, ExecError> {
        self.kernel.heap.initialize_statics(class);
        self.kernel
            .heap
            .statics(class.id)
            .map(ElementInfo::fields)
            .ok_or_else(|| missing_statics(class).into())
    }

    pub fn static_fields_mut(&mut self, class: &Arc<ClassInfo>) -> Result<&mut Fields, ExecError> {
        self.kernel.heap.initialize_statics(class);
        self.kernel
            .heap
            .statics_mut(class.id)
            .map(ElementInfo::fields_mut)
            .ok_or_else(|| missing_statics(class).into())
    }

    pub fn new_object(&mut self, class: &Arc<ClassInfo>) -> Result<Handle, ExecError> {
        let handle = self.kernel.new_object(class, self.thread)?;
        self.kernel.heap.set_constructed(handle)?;
        Ok(handle)
    }

    pub fn new_array(&mut self, ty: ArrayType, length: i32) -> Result<Handle, ExecError> {
        let Ok(length) = usize::try_from(length) else {
            return Err(ExecError::throw(NEGATIVE_ARRAY_SIZE, length.to_string()));
        };
        Ok(self.kernel.new_array(ty, length, self.thread)?)
    }

    pub fn intern(&mut self, text: &str) -> Result<Handle, ExecError> {
        Ok(self.kernel.intern(text, self.thread)?)
    }

    // ── Monitors ──────────────────────────────────────────────────────

    /// Enters the monitor of `object`. Returns false when the thread
    /// blocked or gave way first; the instruction repeats.
    pub fn lock(&mut self, object: Handle) -> Result<bool, ExecError> {
        let object = self.non_null(object)?;
        if !self.is_resuming() {
            let ei = self.kernel.heap.require(object)?;
            if self.policy.break_on_lock(self.kernel, self.thread, ei) && self.reschedule("lock") {
                self.set_resuming(true)?;
                return Ok(false);
            }
        }
        if !self.kernel.can_lock(self.thread, object)? {
            self.kernel.block(self.thread, object)?;
            self.reschedule("blocked");
            self.set_resuming(true)?;
            return Ok(false);
        }
        self.kernel.lock(self.thread, object)?;
        Ok(true)
    }

    pub fn unlock(&mut self, object: Handle) -> Result<(), ExecError> {
        let object = self.non_null(object)?;
        let unblocked = self.kernel.unlock(self.thread, object)?;
        if self.policy.break_on_unlock(self.kernel, self.thread, unblocked) {
            self.reschedule("unlock");
        }
        Ok(())
    }

    /// `wait` on `object`. Returns true once the monitor is owned again.
    pub fn wait(&mut self, object: Handle, timed: bool) -> Result<bool, ExecError> {
        let object = self.non_null(object)?;
        if !self.is_resuming() {
            self.kernel.wait(self.thread, object, timed)?;
            self.reschedule("wait");
            self.set_resuming(true)?;
            return Ok(false);
        }
        if !self.kernel.reacquire_after_wait(self.thread, object)? {
            self.reschedule("relock");
            return Ok(false);
        }
        self.take_interrupt()?;
        Ok(true)
    }

    /// `notify` or `notifyAll`. With several waiters `notify` is a choice
    /// point and returns false until the choice is made.
    pub fn notify(&mut self, object: Handle, all: bool) -> Result<bool, ExecError> {
        let object = self.non_null(object)?;
        self.kernel.check_monitor_owner(self.thread, object)?;
        if all {
            self.kernel.notify_all(self.thread, object)?;
            return Ok(true);
        }
        let waiters = self.kernel.waiters(object)?;
        let woken = match waiters.as_slice() {
            [] => return Ok(true),
            [only] => *only,
            _ if self.is_resuming() => self
                .choice("notify")
                .and_then(Choice::thread)
                .ok_or_else(|| missing_choice("notify"))?,
            _ => {
                self.register_choice(ChoiceGenerator::notify("notify", self.thread, &waiters));
                self.set_resuming(true)?;
                return Ok(false);
            }
        };
        self.kernel.notify_thread(self.thread, object, woken)?;
        Ok(true)
    }

    // ── Threads ───────────────────────────────────────────────────────

    fn thread_of(&self, object: Handle) -> Result<ThreadId, ExecError> {
        let object = self.non_null(object)?;
        self.kernel
            .threads
            .by_object(object)
            .map(|t| t.id())
            .ok_or_else(|| ExecError::throw(ILLEGAL_THREAD_STATE, format!("{object} is not a thread")))
    }

    /// Clears a pending interrupt and throws `InterruptedException` for it.
    fn take_interrupt(&mut self) -> Result<(), ExecError> {
        if self.kernel.threads.require(self.thread)?.data().interrupted {
            self.kernel.threads.modifiable(self.thread)?.data_mut().interrupted = false;
            return Err(ExecError::throw(INTERRUPTED_EXCEPTION, "interrupted"));
        }
        Ok(())
    }

    pub fn start_thread(&mut self, object: Handle) -> Result<(), ExecError> {
        let target = self.thread_of(object)?;
        self.kernel.start_thread(target)?;
        let runnable = self.kernel.threads.require(target)?.runnable();
        for handle in [object, runnable] {
            if !handle.is_null() {
                self.kernel.heap.touch(handle, target)?;
            }
        }
        if self.policy.break_on_start(self.kernel, self.thread, target) {
            self.reschedule("start");
        }
        Ok(())
    }

    /// Waits until the thread of `object` terminated.
    pub fn join(&mut self, object: Handle) -> Result<bool, ExecError> {
        let target = self.thread_of(object)?;
        let object = self.kernel.threads.require(target)?.object();
        if self.is_resuming() {
            self.kernel.withdraw_contender(self.thread, object)?;
            self.kernel.set_thread_state(self.thread, ThreadState::Running)?;
        }
        self.take_interrupt()?;
        if !self.kernel.threads.require(target)?.is_alive() {
            return Ok(true);
        }
        self.kernel.wait_unlocked(self.thread, object)?;
        self.reschedule("join");
        self.set_resuming(true)?;
        Ok(false)
    }

    pub fn sleep(&mut self) -> Result<(), ExecError> {
        self.take_interrupt()?;
        self.kernel
            .set_thread_state(self.thread, ThreadState::Sleeping)?;
        if !self.reschedule("sleep") {
            self.kernel
                .set_thread_state(self.thread, ThreadState::Running)?;
        }
        Ok(())
    }

    pub fn yield_now(&mut self) {
        if self.policy.break_on_yield(self.kernel, self.thread) {
            self.reschedule("yield");
        }
    }

    pub fn interrupt(&mut self, object: Handle) -> Result<(), ExecError> {
        let target = self.thread_of(object)?;
        self.kernel.interrupt(target)?;
        Ok(())
    }

    // ── Calls ─────────────────────────────────────────────────────────

    /// Pushes a frame for `method`, moving its arguments off the operand
    /// stack. The caller continues after the invoking instruction.
    pub fn invoke(&mut self, method: &Arc<MethodInfo>) -> Result<InstructionResult, ExecError> {
        let depth = self.kernel.threads.require(self.thread)?.depth();
        if depth >= self.settings.max_call_depth {
            return Err(ExecError::throw(
                STACK_OVERFLOW_ERROR,
                format!("call depth {depth} entering `{}`", method.name),
            ));
        }
        let mut lock = Handle::NULL;
        if method.synchronized {
            let receiver = self.peek_ref(method.arg_slots.saturating_sub(1))?;
            if !self.lock(receiver)? {
                return Ok(InstructionResult::Repeat);
            }
            lock = receiver;
        }
        let caller = self.frame_mut()?;
        let mut args = Vec::with_capacity(method.arg_slots);
        for _ in 0..method.arg_slots {
            args.push(caller.pop()?);
        }
        caller.set_pc(caller.pc() + 1);

        let mut frame = StackFrame::new(Arc::clone(method), None);
        for (slot, (value, is_ref)) in args.into_iter().rev().enumerate() {
            if is_ref {
                frame.set_local_ref(slot, Handle::from_slot(value))?;
            } else {
                frame.set_local(slot, value)?;
            }
        }
        frame.set_lock(lock);
        self.kernel.threads.modifiable(self.thread)?.push_frame(frame);
        Ok(InstructionResult::Advanced(0))
    }

    /// Pops the current frame and hands `values` to the caller. Returning
    /// from the last frame terminates the thread.
    pub fn return_value(&mut self, values: &[(i32, bool)]) -> Result<InstructionResult, ExecError> {
        let frame = self
            .kernel
            .threads
            .modifiable(self.thread)?
            .pop_frame()
            .ok_or_else(|| EngineError::Inconsistent(format!("{} returned without frame", self.thread)))?;
        if !frame.lock().is_null() {
            self.unlock(frame.lock())?;
        }
        if self.kernel.threads.require(self.thread)?.depth() == 0 {
            self.kernel.terminate_thread(self.thread)?;
            self.reschedule("terminate");
            return Ok(InstructionResult::FrameReturned);
        }
        let caller = self.frame_mut()?;
        for &(value, is_ref) in values {
            caller.push(value, is_ref)?;
        }
        Ok(InstructionResult::FrameReturned)
    }

    // ── Exceptions ────────────────────────────────────────────────────

    /// Turns an instruction failure into a thrown exception and unwinds.
    pub(crate) fn raise(&mut self, err: ExecError) -> Result<Step, EngineError> {
        let exception = match err {
            ExecError::Engine(e) => return Err(e),
            ExecError::Exception(handle) => handle,
            ExecError::Throw { class, message } => {
                match self.allocate_exception(&class, &message)? {
                    Some(handle) => handle,
                    None => return self.uncaught(class, message),
                }
            }
            ExecError::Resource(e) => {
                log::warn!("{}: {e}", self.thread);
                let message = e.to_string();
                match self.allocate_exception(OUT_OF_MEMORY_ERROR, &message)? {
                    Some(handle) => handle,
                    None => return self.uncaught(OUT_OF_MEMORY_ERROR.to_owned(), message),
                }
            }
        };
        let class = self.kernel.heap.require(exception)?.class().name.clone();
        log::debug!("{} throws {class} ({exception})", self.thread);
        self.kernel.emit(Event::ExceptionThrown {
            thread: self.thread,
            handle: exception,
            class,
        });
        self.unwind(exception)
    }

    /// `None` when the heap has no room left even for the exception.
    fn allocate_exception(
        &mut self,
        class: &str,
        message: &str,
    ) -> Result<Option<Handle>, EngineError> {
        let info = self.kernel.classes().by_name(class)?;
        let exception = match self.kernel.new_object(&info, self.thread) {
            Ok(handle) => handle,
            Err(e) if e.is_resource_exhaustion() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        self.kernel.heap.set_constructed(exception)?;
        let Some(field) = info.instance_field("message").filter(|_| !message.is_empty()) else {
            return Ok(Some(exception));
        };
        let offset = field.offset;
        let text = match self.kernel.new_string(message, self.thread) {
            Ok(handle) => handle,
            Err(EngineError::Heap(e)) if e.is_resource_exhaustion() => return Ok(Some(exception)),
            Err(e) => return Err(e),
        };
        self.kernel
            .heap
            .modifiable(exception)?
            .fields_mut()
            .set_ref(offset, text);
        Ok(Some(exception))
    }

    fn unwind(&mut self, exception: Handle) -> Result<Step, EngineError> {
        let registry = self.kernel.classes().clone();
        let class = self.kernel.heap.require(exception)?.class().id;
        let mut top = true;
        loop {
            let thread = self.kernel.threads.require(self.thread)?;
            let Some(frame) = thread.top() else {
                break;
            };
            // callers already point past their invoke
            let pc = if top {
                frame.pc()
            } else {
                frame.pc().saturating_sub(1)
            };
            let handler = frame
                .method()
                .find_handler(pc, |filter| match filter {
                    None => true,
                    Some(name) => registry
                        .class_id(name)
                        .is_some_and(|f| registry.is_subclass_of(class, f)),
                })
                .map(|h| h.handler);
            let firewall = frame.method().firewall;
            if let Some(target) = handler {
                let frame = self.frame_mut()?;
                frame.clear_operands();
                frame.push_ref(exception)?;
                frame.set_pc(target);
                return Ok(Step::Continue { backjump: false });
            }
            if firewall {
                break;
            }
            self.pop_frame_unlocking()?;
            top = false;
        }
        let ei = self.kernel.heap.require(exception)?;
        let class = ei.class().name.clone();
        let message = ei
            .class()
            .instance_field("message")
            .map(|f| ei.fields().get_ref(f.offset))
            .and_then(|h| self.kernel.string_value(h))
            .unwrap_or_default();
        self.uncaught(class, message)
    }

    fn pop_frame_unlocking(&mut self) -> Result<(), EngineError> {
        let frame = self
            .kernel
            .threads
            .modifiable(self.thread)?
            .pop_frame()
            .ok_or_else(|| EngineError::Inconsistent(format!("{} unwound past its stack", self.thread)))?;
        if !frame.lock().is_null() {
            match self.kernel.unlock(self.thread, frame.lock()) {
                Ok(_) => {}
                Err(ExecError::Engine(e)) => return Err(e),
                Err(e) => {
                    return Err(EngineError::Inconsistent(format!(
                        "unwinding `{}`: {e}",
                        frame.method().name
                    )));
                }
            }
        }
        Ok(())
    }

    fn uncaught(&mut self, class: String, message: String) -> Result<Step, EngineError> {
        while self.kernel.threads.require(self.thread)?.top().is_some() {
            self.pop_frame_unlocking()?;
        }
        self.kernel.terminate_thread(self.thread)?;
        log::warn!("uncaught {class} in {}", self.thread);
        Ok(Step::Uncaught(UncaughtException {
            thread: self.thread,
            class,
            message,
        }))
    }

    // ── Stepping ──────────────────────────────────────────────────────

    /// Executes the instruction at the top frame's pc.
    pub(crate) fn step(&mut self) -> Result<Step, EngineError> {
        let thread = self.kernel.threads.require(self.thread)?;
        let depth = thread.depth();
        let frame = thread
            .top()
            .ok_or_else(|| EngineError::Inconsistent(format!("{} has no frame", self.thread)))?;
        let method = Arc::clone(frame.method());
        let pc = frame.pc();
        let instruction = method
            .instruction(pc)
            .cloned()
            .ok_or_else(|| EngineError::InvalidPc {
                method: method.name.clone(),
                pc,
            })?;
        log::trace!("{} {}:{pc} {instruction:?}", self.thread, method.name);

        match instruction.execute(self) {
            Ok(InstructionResult::Advanced(next)) => {
                self.set_resuming(false)?;
                self.frame_mut()?.set_pc(next);
                let same_frame = self.kernel.threads.require(self.thread)?.depth() == depth;
                Ok(Step::Continue {
                    backjump: same_frame && next <= pc,
                })
            }
            Ok(InstructionResult::Repeat) => Ok(Step::Repeat),
            Ok(InstructionResult::FrameReturned) => {
                self.set_resuming(false)?;
                Ok(Step::Continue { backjump: false })
            }
            Err(err) => {
                self.set_resuming(false)?;
                self.raise(err)
            }
        }
    }
}

fn missing_choice(id: &str) -> EngineError {
    EngineError::Inconsistent(format!("resumed without a choice for `{id}`"))
}

fn missing_statics(class: &ClassInfo) -> EngineError {
    EngineError::Inconsistent(format!("no static storage for `{}`", class.name))
}
