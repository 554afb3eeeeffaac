use std::cell::{Cell, RefCell};

use serde::{Deserialize, Serialize};

use crate::{
    ChoiceGenerator, ElementInfo, Fields, GcStats, Handle, Heap, KernelState, MethodInfo,
    StateId, SystemState, ThreadId, ThreadList, ThreadState,
};

/// Notifications produced by the kernel while instructions run. They are
/// buffered in the kernel and handed to the listeners after each
/// instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ObjectCreated { thread: ThreadId, handle: Handle },
    ObjectReleased { handle: Handle },
    ObjectLocked { thread: ThreadId, handle: Handle },
    ObjectUnlocked { thread: ThreadId, handle: Handle },
    ObjectWait { thread: ThreadId, handle: Handle },
    ObjectNotify { thread: ThreadId, handle: Handle, woken: ThreadId },
    ObjectNotifyAll { thread: ThreadId, handle: Handle },
    ThreadStateChanged { thread: ThreadId, from: ThreadState, to: ThreadState },
    ThreadStarted { thread: ThreadId },
    ThreadTerminated { thread: ThreadId },
    ExceptionThrown { thread: ThreadId, handle: Handle, class: String },
    GcBegin,
    GcEnd(GcStats),
}

/// A property failure, reported by a [`Property`] or a listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub property: String,
    pub message: String,
}

/// Exception that left the stack of its thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UncaughtException {
    pub thread: ThreadId,
    pub class: String,
    pub message: String,
}

/// Requests listeners can make while observing a transition. Reset before
/// every transition.
#[derive(Debug, Default)]
pub struct Control {
    ignore: Cell<bool>,
    backtrack: Cell<bool>,
    break_transition: Cell<bool>,
    terminate: Cell<bool>,
    violations: RefCell<Vec<Violation>>,
}

impl Control {
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_ignored(&self) -> bool {
        self.ignore.get()
    }

    pub fn is_backtrack_requested(&self) -> bool {
        self.backtrack.get()
    }

    pub fn is_break_requested(&self) -> bool {
        self.break_transition.get()
    }

    pub(crate) fn clear_break(&self) {
        self.break_transition.set(false);
    }

    pub fn is_terminate_requested(&self) -> bool {
        self.terminate.get()
    }

    pub(crate) fn report(&self, violation: Violation) {
        self.violations.borrow_mut().push(violation);
    }

    pub(crate) fn take_violations(&self) -> Vec<Violation> {
        self.violations.take()
    }
}

/// Read-only query surface over the system state, plus the control
/// requests a listener may issue.
#[derive(Clone, Copy)]
pub struct StateView<'a> {
    system: &'a SystemState,
}

impl<'a> StateView<'a> {
    pub fn new(system: &'a SystemState) -> Self {
        Self { system }
    }

    pub fn state_id(&self) -> StateId {
        self.system.id()
    }

    pub fn depth(&self) -> usize {
        self.system.depth()
    }

    pub fn is_new(&self) -> bool {
        self.system.is_new()
    }

    pub fn is_visited(&self) -> bool {
        !self.system.is_new()
    }

    pub fn is_end(&self) -> bool {
        self.system.is_end()
    }

    pub fn is_ignored(&self) -> bool {
        self.system.control().is_ignored()
    }

    /// No thread can run, yet a non-daemon thread is still alive.
    pub fn is_deadlocked(&self) -> bool {
        self.system.is_deadlocked()
    }

    pub fn kernel(&self) -> &'a KernelState {
        self.system.kernel()
    }

    pub fn heap(&self) -> &'a Heap {
        &self.system.kernel().heap
    }

    pub fn threads(&self) -> &'a ThreadList {
        &self.system.kernel().threads
    }

    pub fn object(&self, handle: Handle) -> Option<&'a ElementInfo> {
        self.heap().get(handle)
    }

    pub fn fields(&self, handle: Handle) -> Option<&'a Fields> {
        self.object(handle).map(ElementInfo::fields)
    }

    pub fn choice_generator(&self) -> Option<&'a ChoiceGenerator> {
        self.system.choice_generator()
    }

    pub fn next_choice_generator(&self) -> Option<&'a ChoiceGenerator> {
        self.system.next_choice_generator()
    }

    pub fn scheduled_thread(&self) -> Option<ThreadId> {
        self.system.scheduled_thread()
    }

    pub fn uncaught_exception(&self) -> Option<&'a UncaughtException> {
        self.system.uncaught_exception()
    }

    // ── Control ───────────────────────────────────────────────────────

    /// Prunes the current transition: it is not stored and backtracked
    /// right away.
    pub fn ignore_transition(&self) {
        self.system.control().ignore.set(true);
    }

    pub fn request_backtrack(&self) {
        self.system.control().backtrack.set(true);
    }

    /// Ends the running transition after the current instruction.
    pub fn break_transition(&self) {
        self.system.control().break_transition.set(true);
    }

    pub fn terminate_search(&self) {
        self.system.control().terminate.set(true);
    }

    pub fn report_violation(&self, property: impl Into<String>, message: impl Into<String>) {
        self.system.control().report(Violation {
            property: property.into(),
            message: message.into(),
        });
    }
}

/// Observer of the engine. All methods default to doing nothing.
#[allow(unused_variables)]
pub trait Listener {
    fn object_created(&mut self, view: &StateView<'_>, thread: ThreadId, handle: Handle) {}
    fn object_released(&mut self, view: &StateView<'_>, handle: Handle) {}
    fn object_locked(&mut self, view: &StateView<'_>, thread: ThreadId, handle: Handle) {}
    fn object_unlocked(&mut self, view: &StateView<'_>, thread: ThreadId, handle: Handle) {}
    fn object_wait(&mut self, view: &StateView<'_>, thread: ThreadId, handle: Handle) {}
    fn object_notify(
        &mut self,
        view: &StateView<'_>,
        thread: ThreadId,
        handle: Handle,
        woken: ThreadId,
    ) {
    }
    fn object_notify_all(&mut self, view: &StateView<'_>, thread: ThreadId, handle: Handle) {}
    fn thread_state_changed(
        &mut self,
        view: &StateView<'_>,
        thread: ThreadId,
        from: ThreadState,
        to: ThreadState,
    ) {
    }
    fn thread_started(&mut self, view: &StateView<'_>, thread: ThreadId) {}
    fn thread_terminated(&mut self, view: &StateView<'_>, thread: ThreadId) {}
    fn exception_thrown(
        &mut self,
        view: &StateView<'_>,
        thread: ThreadId,
        handle: Handle,
        class: &str,
    ) {
    }
    fn instruction_executed(
        &mut self,
        view: &StateView<'_>,
        thread: ThreadId,
        method: &MethodInfo,
        pc: usize,
    ) {
    }
    fn choice_generator_registered(&mut self, view: &StateView<'_>, cg: &ChoiceGenerator) {}
    fn choice_generator_advanced(&mut self, view: &StateView<'_>, cg: &ChoiceGenerator) {}
    fn choice_generator_processed(&mut self, view: &StateView<'_>, cg: &ChoiceGenerator) {}
    fn gc_begin(&mut self, view: &StateView<'_>) {}
    fn gc_end(&mut self, view: &StateView<'_>, stats: &GcStats) {}
    fn state_advanced(&mut self, view: &StateView<'_>) {}
    fn state_backtracked(&mut self, view: &StateView<'_>) {}
    fn state_restored(&mut self, view: &StateView<'_>) {}
    fn search_started(&mut self, view: &StateView<'_>) {}
    fn search_finished(&mut self, view: &StateView<'_>) {}
    fn property_violated(&mut self, view: &StateView<'_>, violation: &Violation) {}
}

/// Synchronous fan-out to the registered listeners, in registration order.
#[derive(Default)]
pub struct EventBus {
    listeners: Vec<Box<dyn Listener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Box<dyn Listener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    fn each(&mut self, mut f: impl FnMut(&mut dyn Listener)) {
        for listener in &mut self.listeners {
            f(listener.as_mut());
        }
    }

    pub fn dispatch(&mut self, view: &StateView<'_>, events: &[Event]) {
        if self.listeners.is_empty() {
            return;
        }
        for event in events {
            self.each(|l| match *event {
                Event::ObjectCreated { thread, handle } => l.object_created(view, thread, handle),
                Event::ObjectReleased { handle } => l.object_released(view, handle),
                Event::ObjectLocked { thread, handle } => l.object_locked(view, thread, handle),
                Event::ObjectUnlocked { thread, handle } => l.object_unlocked(view, thread, handle),
                Event::ObjectWait { thread, handle } => l.object_wait(view, thread, handle),
                Event::ObjectNotify {
                    thread,
                    handle,
                    woken,
                } => l.object_notify(view, thread, handle, woken),
                Event::ObjectNotifyAll { thread, handle } => {
                    l.object_notify_all(view, thread, handle)
                }
                Event::ThreadStateChanged { thread, from, to } => {
                    l.thread_state_changed(view, thread, from, to)
                }
                Event::ThreadStarted { thread } => l.thread_started(view, thread),
                Event::ThreadTerminated { thread } => l.thread_terminated(view, thread),
                Event::ExceptionThrown {
                    thread,
                    handle,
                    ref class,
                } => l.exception_thrown(view, thread, handle, class),
                Event::GcBegin => l.gc_begin(view),
                Event::GcEnd(ref stats) => l.gc_end(view, stats),
            });
        }
    }

    pub fn instruction_executed(
        &mut self,
        view: &StateView<'_>,
        thread: ThreadId,
        method: &MethodInfo,
        pc: usize,
    ) {
        self.each(|l| l.instruction_executed(view, thread, method, pc));
    }

    pub fn choice_generator_registered(&mut self, view: &StateView<'_>, cg: &ChoiceGenerator) {
        self.each(|l| l.choice_generator_registered(view, cg));
    }

    pub fn choice_generator_advanced(&mut self, view: &StateView<'_>, cg: &ChoiceGenerator) {
        self.each(|l| l.choice_generator_advanced(view, cg));
    }

    pub fn choice_generator_processed(&mut self, view: &StateView<'_>, cg: &ChoiceGenerator) {
        self.each(|l| l.choice_generator_processed(view, cg));
    }

    pub fn state_advanced(&mut self, view: &StateView<'_>) {
        self.each(|l| l.state_advanced(view));
    }

    pub fn state_backtracked(&mut self, view: &StateView<'_>) {
        self.each(|l| l.state_backtracked(view));
    }

    pub fn state_restored(&mut self, view: &StateView<'_>) {
        self.each(|l| l.state_restored(view));
    }

    pub fn search_started(&mut self, view: &StateView<'_>) {
        self.each(|l| l.search_started(view));
    }

    pub fn search_finished(&mut self, view: &StateView<'_>) {
        self.each(|l| l.search_finished(view));
    }

    pub fn property_violated(&mut self, view: &StateView<'_>, violation: &Violation) {
        self.each(|l| l.property_violated(view, violation));
    }
}

/// A condition checked after every transition.
pub trait Property {
    fn name(&self) -> &str;

    /// Returns a message when the current state violates the property.
    fn check(&mut self, view: &StateView<'_>) -> Option<String>;
}

#[derive(Debug, Default)]
pub struct NoDeadlock;

impl Property for NoDeadlock {
    fn name(&self) -> &str {
        "no-deadlock"
    }

    fn check(&mut self, view: &StateView<'_>) -> Option<String> {
        if !view.is_deadlocked() {
            return None;
        }
        let blocked: Vec<String> = view
            .threads()
            .iter()
            .filter(|t| t.is_alive())
            .map(|t| format!("{} {} on {}", t.id(), t.state(), t.data().blocking))
            .collect();
        Some(format!("deadlock: {}", blocked.join(", ")))
    }
}

#[derive(Debug, Default)]
pub struct NoUncaughtException;

impl Property for NoUncaughtException {
    fn name(&self) -> &str {
        "no-uncaught-exception"
    }

    fn check(&mut self, view: &StateView<'_>) -> Option<String> {
        view.uncaught_exception().map(|e| {
            if e.message.is_empty() {
                format!("uncaught {} in {}", e.class, e.thread)
            } else {
                format!("uncaught {}: {} in {}", e.class, e.message, e.thread)
            }
        })
    }
}
