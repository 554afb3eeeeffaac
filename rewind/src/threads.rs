use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{EngineError, Handle, MethodInfo, StackFrame, ThreadId};

/// Scheduling state of an execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThreadState {
    New,
    Running,
    /// Failed to acquire a lock and waits for it to be released.
    Blocked,
    /// The lock it waits for got released; it may proceed when scheduled.
    Unblocked,
    Waiting,
    TimeoutWaiting,
    /// Woken from a wait but still has to reacquire the lock.
    Notified,
    /// Interrupted while waiting, still has to reacquire the lock.
    Interrupted,
    TimedOut,
    Sleeping,
    Terminated,
}

impl ThreadState {
    #[inline]
    pub fn is_runnable_state(self) -> bool {
        matches!(
            self,
            ThreadState::Running
                | ThreadState::Unblocked
                | ThreadState::Sleeping
                | ThreadState::TimedOut
        )
    }

    /// States in which the thread names the object it waits on.
    #[inline]
    pub fn has_blocking_object(self) -> bool {
        matches!(
            self,
            ThreadState::Blocked
                | ThreadState::Waiting
                | ThreadState::TimeoutWaiting
                | ThreadState::Notified
        )
    }

    #[inline]
    pub fn is_waiting(self) -> bool {
        matches!(self, ThreadState::Waiting | ThreadState::TimeoutWaiting)
    }

    #[inline]
    pub fn is_alive(self) -> bool {
        !matches!(self, ThreadState::New | ThreadState::Terminated)
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThreadState::New => "NEW",
            ThreadState::Running => "RUNNING",
            ThreadState::Blocked => "BLOCKED",
            ThreadState::Unblocked => "UNBLOCKED",
            ThreadState::Waiting => "WAITING",
            ThreadState::TimeoutWaiting => "TIMEOUT_WAITING",
            ThreadState::Notified => "NOTIFIED",
            ThreadState::Interrupted => "INTERRUPTED",
            ThreadState::TimedOut => "TIMEDOUT",
            ThreadState::Sleeping => "SLEEPING",
            ThreadState::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

/// Scheduling fields of a thread, shared with its snapshot until written.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThreadData {
    pub state: ThreadState,
    pub suspend_count: u32,
    /// Object the thread is blocked or waiting on.
    pub blocking: Handle,
    /// Monitors currently owned, in acquisition order.
    pub locked_objects: Vec<Handle>,
    /// Recursion depth given up by `wait`, restored on reacquisition.
    pub lock_count_before_wait: u32,
    pub interrupted: bool,
    pub daemon: bool,
    /// The top instruction did its first half and runs again on resumption.
    pub resuming: bool,
    pub name: Arc<str>,
}

impl ThreadData {
    fn new(name: Arc<str>, daemon: bool) -> Self {
        Self {
            state: ThreadState::New,
            suspend_count: 0,
            blocking: Handle::NULL,
            locked_objects: Vec::new(),
            lock_count_before_wait: 0,
            interrupted: false,
            daemon,
            resuming: false,
            name,
        }
    }
}

/// Immutable capture of one thread.
#[derive(Debug, Clone)]
pub struct ThreadMemento {
    id: ThreadId,
    object: Handle,
    runnable: Handle,
    entry: Option<Arc<MethodInfo>>,
    data: Arc<ThreadData>,
    top: Option<Arc<StackFrame>>,
    depth: usize,
}

impl ThreadMemento {
    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        self.data.state
    }
}

/// Per-thread record: scheduling state plus the call stack.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    id: ThreadId,
    object: Handle,
    runnable: Handle,
    /// Method the thread starts with; cleared once started.
    entry: Option<Arc<MethodInfo>>,
    data: Arc<ThreadData>,
    top: Option<Arc<StackFrame>>,
    depth: usize,
    changed: bool,
    cached: Option<Arc<ThreadMemento>>,
}

impl ThreadInfo {
    pub fn new(
        id: ThreadId,
        object: Handle,
        runnable: Handle,
        entry: Arc<MethodInfo>,
        name: Arc<str>,
        daemon: bool,
    ) -> Self {
        Self {
            id,
            object,
            runnable,
            entry: Some(entry),
            data: Arc::new(ThreadData::new(name, daemon)),
            top: None,
            depth: 0,
            changed: true,
            cached: None,
        }
    }

    pub fn from_memento(memento: &Arc<ThreadMemento>) -> Self {
        Self {
            id: memento.id,
            object: memento.object,
            runnable: memento.runnable,
            entry: memento.entry.clone(),
            data: Arc::clone(&memento.data),
            top: memento.top.clone(),
            depth: memento.depth,
            changed: false,
            cached: Some(Arc::clone(memento)),
        }
    }

    pub fn memento(&mut self) -> Arc<ThreadMemento> {
        if let Some(cached) = self.cached.as_ref().filter(|_| !self.changed) {
            return Arc::clone(cached);
        }
        let memento = Arc::new(ThreadMemento {
            id: self.id,
            object: self.object,
            runnable: self.runnable,
            entry: self.entry.clone(),
            data: Arc::clone(&self.data),
            top: self.top.clone(),
            depth: self.depth,
        });
        self.changed = false;
        self.cached = Some(Arc::clone(&memento));
        memento
    }

    pub fn is_restored_from(&self, memento: &Arc<ThreadMemento>) -> bool {
        !self.changed
            && self
                .cached
                .as_ref()
                .is_some_and(|cached| Arc::ptr_eq(cached, memento))
    }

    // ── Queries ───────────────────────────────────────────────────────

    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    #[inline]
    pub fn object(&self) -> Handle {
        self.object
    }

    #[inline]
    pub fn runnable(&self) -> Handle {
        self.runnable
    }

    #[inline]
    pub fn entry(&self) -> Option<&Arc<MethodInfo>> {
        self.entry.as_ref()
    }

    #[inline]
    pub fn data(&self) -> &ThreadData {
        &self.data
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        self.data.state
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.data.name
    }

    #[inline]
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Runnable iff not suspended and in a state that can execute.
    #[inline]
    pub fn is_runnable(&self) -> bool {
        self.data.suspend_count == 0 && self.data.state.is_runnable_state()
    }

    /// A timed waiter whose timeout may elapse if it gets scheduled.
    #[inline]
    pub fn is_timeout_candidate(&self) -> bool {
        self.data.suspend_count == 0 && self.data.state == ThreadState::TimeoutWaiting
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.data.state == ThreadState::Terminated
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.data.state.is_alive()
    }

    #[inline]
    pub fn top(&self) -> Option<&Arc<StackFrame>> {
        self.top.as_ref()
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Frames from the top down.
    pub fn frames(&self) -> impl Iterator<Item = &StackFrame> {
        std::iter::successors(self.top.as_deref(), |f| f.previous().map(Arc::as_ref))
    }

    pub fn for_each_root(&self, mut f: impl FnMut(Handle)) {
        for handle in [self.object, self.runnable, self.data.blocking] {
            if !handle.is_null() {
                f(handle);
            }
        }
        for frame in self.frames() {
            frame.for_each_reference(&mut f);
        }
    }

    // ── Mutators ──────────────────────────────────────────────────────

    pub(crate) fn data_mut(&mut self) -> &mut ThreadData {
        self.changed = true;
        Arc::make_mut(&mut self.data)
    }

    pub(crate) fn take_entry(&mut self) -> Option<Arc<MethodInfo>> {
        self.changed = true;
        self.entry.take()
    }

    /// Top frame for writing; copies it if a snapshot still shares it.
    pub fn top_mut(&mut self) -> Result<&mut StackFrame, EngineError> {
        self.changed = true;
        let id = self.id;
        self.top
            .as_mut()
            .map(Arc::make_mut)
            .ok_or_else(|| EngineError::Inconsistent(format!("{id} has no frame")))
    }

    pub fn push_frame(&mut self, mut frame: StackFrame) {
        frame.link(self.top.take());
        self.top = Some(Arc::new(frame));
        self.depth += 1;
        self.changed = true;
    }

    /// Pops the top frame and returns it.
    pub fn pop_frame(&mut self) -> Option<StackFrame> {
        let top = self.top.take()?;
        let mut frame = Arc::unwrap_or_clone(top);
        self.top = frame.take_previous();
        self.depth -= 1;
        self.changed = true;
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> Arc<MethodInfo> {
        let mut method = MethodInfo::new("run", Vec::new());
        method.max_locals = 1;
        Arc::new(method)
    }

    fn thread() -> ThreadInfo {
        ThreadInfo::new(ThreadId(1), Handle::new(3), Handle::NULL, entry(), "t1".into(), false)
    }

    #[test]
    fn runnable_requires_state_and_no_suspension() {
        let mut t = thread();
        assert!(!t.is_runnable(), "new threads do not run");
        t.data_mut().state = ThreadState::Running;
        assert!(t.is_runnable());
        t.data_mut().suspend_count = 1;
        assert!(!t.is_runnable());
        t.data_mut().suspend_count = 0;
        t.data_mut().state = ThreadState::Blocked;
        assert!(!t.is_runnable());
        t.data_mut().state = ThreadState::TimedOut;
        assert!(t.is_runnable());
    }

    #[test]
    fn frames_are_shared_with_snapshot_until_written() {
        let mut t = thread();
        t.push_frame(StackFrame::new(entry(), None));
        let snapshot = t.memento();
        t.top_mut().unwrap().set_local(0, 42).unwrap();
        let restored = ThreadInfo::from_memento(&snapshot);
        assert_eq!(restored.top().unwrap().local(0).unwrap(), 0);
        assert_eq!(t.top().unwrap().local(0).unwrap(), 42);
    }

    #[test]
    fn unchanged_thread_reuses_memento() {
        let mut t = thread();
        let a = t.memento();
        let b = t.memento();
        assert!(Arc::ptr_eq(&a, &b));
        t.data_mut().interrupted = true;
        assert!(!Arc::ptr_eq(&a, &t.memento()));
    }

    #[test]
    fn push_and_pop_maintain_depth() {
        let mut t = thread();
        t.push_frame(StackFrame::new(entry(), None));
        t.push_frame(StackFrame::new(entry(), None));
        assert_eq!(t.depth(), 2);
        assert_eq!(t.frames().count(), 2);
        assert!(t.pop_frame().is_some());
        assert_eq!(t.depth(), 1);
        assert!(t.pop_frame().is_some());
        assert!(t.top().is_none());
        assert!(t.pop_frame().is_none());
    }

    #[test]
    fn roots_include_thread_object_and_frame_references() {
        let mut t = thread();
        let mut frame = StackFrame::new(entry(), None);
        frame.set_local_ref(0, Handle::new(7)).unwrap();
        t.push_frame(frame);
        let mut roots = Vec::new();
        t.for_each_root(|h| roots.push(h));
        assert_eq!(roots, vec![Handle::new(3), Handle::new(7)]);
    }
}
