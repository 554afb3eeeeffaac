use std::fmt;

use crate::{AccessBreakMode, ElementInfo, KernelState, SearchSettings, ThreadId};

/// Decides when a field access ends the running transition.
pub enum AccessBreak {
    Never,
    /// Break before accessing objects more than one thread has seen.
    SharedObjects,
    Custom(Box<dyn Fn(&ElementInfo, ThreadId) -> bool + Send + Sync>),
}

impl AccessBreak {
    pub fn should_break(&self, object: &ElementInfo, thread: ThreadId) -> bool {
        match self {
            AccessBreak::Never => false,
            AccessBreak::SharedObjects => object.is_shared(),
            AccessBreak::Custom(predicate) => predicate(object, thread),
        }
    }
}

impl From<AccessBreakMode> for AccessBreak {
    fn from(mode: AccessBreakMode) -> Self {
        match mode {
            AccessBreakMode::Never => AccessBreak::Never,
            AccessBreakMode::SharedObjects => AccessBreak::SharedObjects,
        }
    }
}

impl fmt::Debug for AccessBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessBreak::Never => f.write_str("Never"),
            AccessBreak::SharedObjects => f.write_str("SharedObjects"),
            AccessBreak::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Where the running thread gives other threads a chance, and who they are.
pub trait SchedulingPolicy: fmt::Debug {
    /// Threads a scheduling choice offers, in id order.
    fn candidates(&self, kernel: &KernelState) -> Vec<ThreadId>;

    fn break_on_start(&self, _kernel: &KernelState, _thread: ThreadId, _started: ThreadId) -> bool {
        true
    }

    fn break_on_lock(&self, _kernel: &KernelState, _thread: ThreadId, object: &ElementInfo) -> bool {
        object.is_shared()
    }

    /// `unblocked` tells whether the release made a contender runnable.
    fn break_on_unlock(&self, _kernel: &KernelState, _thread: ThreadId, unblocked: bool) -> bool {
        unblocked
    }

    fn break_on_yield(&self, _kernel: &KernelState, _thread: ThreadId) -> bool {
        true
    }

    fn break_on_access(&self, object: &ElementInfo, thread: ThreadId) -> bool;
}

/// Offers every runnable thread, plus timed waiters when timeouts are
/// modelled.
#[derive(Debug)]
pub struct AllRunnables {
    timeout_choices: bool,
    access: AccessBreak,
}

impl AllRunnables {
    pub fn new(timeout_choices: bool, access: AccessBreak) -> Self {
        Self {
            timeout_choices,
            access,
        }
    }

    pub fn from_settings(settings: &SearchSettings) -> Self {
        Self::new(settings.timeout_choices, settings.access_break.into())
    }
}

impl Default for AllRunnables {
    fn default() -> Self {
        Self::from_settings(&SearchSettings::default())
    }
}

impl SchedulingPolicy for AllRunnables {
    fn candidates(&self, kernel: &KernelState) -> Vec<ThreadId> {
        kernel
            .threads
            .iter()
            .filter(|t| t.is_runnable() || (self.timeout_choices && t.is_timeout_candidate()))
            .map(|t| t.id())
            .collect()
    }

    fn break_on_access(&self, object: &ElementInfo, thread: ThreadId) -> bool {
        self.access.should_break(object, thread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClassRegistry, Handle, HeapSettings, MethodInfo, OBJECT};
    use std::sync::Arc;

    fn create_kernel() -> (KernelState, ThreadId, ThreadId) {
        let mut kernel = KernelState::new(ClassRegistry::new(), HeapSettings::default());
        let mut entry = MethodInfo::new("run", Vec::new());
        entry.max_locals = 1;
        let entry = Arc::new(entry);
        let main = kernel.create_main_thread(entry.clone()).unwrap();
        let (worker, _) = kernel.new_thread(entry, Handle::NULL, false, main).unwrap();
        (kernel, main, worker)
    }

    #[test]
    fn new_threads_are_not_candidates() {
        let (mut kernel, main, worker) = create_kernel();
        let policy = AllRunnables::default();
        assert_eq!(policy.candidates(&kernel), vec![main]);
        kernel.start_thread(worker).unwrap();
        assert_eq!(policy.candidates(&kernel), vec![main, worker]);
    }

    #[test]
    fn timed_waiters_are_offered_only_when_enabled() {
        let (mut kernel, main, worker) = create_kernel();
        kernel.start_thread(worker).unwrap();
        let class = kernel.classes().by_name(OBJECT).unwrap();
        let obj = kernel.new_object(&class, worker).unwrap();
        kernel.lock(worker, obj).unwrap();
        kernel.wait(worker, obj, true).unwrap();

        let with = AllRunnables::new(true, AccessBreak::Never);
        let without = AllRunnables::new(false, AccessBreak::Never);
        assert_eq!(with.candidates(&kernel), vec![main, worker]);
        assert_eq!(without.candidates(&kernel), vec![main]);
    }

    #[test]
    fn suspended_threads_are_skipped() {
        let (mut kernel, main, worker) = create_kernel();
        kernel.start_thread(worker).unwrap();
        kernel.suspend(main).unwrap();
        assert_eq!(AllRunnables::default().candidates(&kernel), vec![worker]);
        kernel.resume(main).unwrap();
        assert_eq!(AllRunnables::default().candidates(&kernel).len(), 2);
    }

    #[test]
    fn access_break_follows_sharing() {
        let (mut kernel, main, worker) = create_kernel();
        let class = kernel.classes().by_name(OBJECT).unwrap();
        let obj = kernel.new_object(&class, main).unwrap();
        let shared = AccessBreak::SharedObjects;
        assert!(!shared.should_break(kernel.heap.require(obj).unwrap(), main));
        kernel.heap.touch(obj, worker).unwrap();
        assert!(shared.should_break(kernel.heap.require(obj).unwrap(), main));

        let custom = AccessBreak::Custom(Box::new(|_, t| t == ThreadId(1)));
        assert!(custom.should_break(kernel.heap.require(obj).unwrap(), worker));
        assert!(!AccessBreak::Never.should_break(kernel.heap.require(obj).unwrap(), worker));
    }
}
