use std::sync::Arc;

use crate::{EngineError, Handle, RootProvider, ThreadId, ThreadInfo, ThreadMemento};

#[derive(Debug)]
pub struct ThreadListMemento {
    threads: Vec<Arc<ThreadMemento>>,
}

impl ThreadListMemento {
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

/// All threads of the run, indexed by id. Terminated threads stay in the
/// list so ids are never handed out twice.
#[derive(Debug, Default)]
pub struct ThreadList {
    threads: Vec<ThreadInfo>,
    changed: bool,
    cached: Option<Arc<ThreadListMemento>>,
}

impl ThreadList {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn next_id(&self) -> ThreadId {
        ThreadId(self.threads.len() as u32)
    }

    pub fn add(&mut self, thread: ThreadInfo) -> Result<ThreadId, EngineError> {
        let id = thread.id();
        if id != self.next_id() {
            return Err(EngineError::Inconsistent(format!(
                "thread {id} added out of order, expected {}",
                self.next_id()
            )));
        }
        self.threads.push(thread);
        self.changed = true;
        Ok(id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    #[inline]
    pub fn get(&self, id: ThreadId) -> Option<&ThreadInfo> {
        self.threads.get(id.index())
    }

    pub fn require(&self, id: ThreadId) -> Result<&ThreadInfo, EngineError> {
        self.get(id).ok_or(EngineError::UnknownThread(id))
    }

    /// Mutable access marks the list for re-snapshotting.
    pub fn modifiable(&mut self, id: ThreadId) -> Result<&mut ThreadInfo, EngineError> {
        let thread = self
            .threads
            .get_mut(id.index())
            .ok_or(EngineError::UnknownThread(id))?;
        self.changed = true;
        Ok(thread)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ThreadInfo> {
        self.threads.iter()
    }

    pub fn by_object(&self, object: Handle) -> Option<&ThreadInfo> {
        self.threads.iter().find(|t| t.object() == object)
    }

    pub fn runnable(&self) -> impl Iterator<Item = &ThreadInfo> {
        self.threads.iter().filter(|t| t.is_runnable())
    }

    pub fn has_runnable(&self) -> bool {
        self.threads.iter().any(ThreadInfo::is_runnable)
    }

    /// Alive threads that keep the program from ending.
    pub fn has_alive_non_daemon(&self) -> bool {
        self.threads
            .iter()
            .any(|t| t.is_alive() && !t.data().daemon)
    }

    pub fn memento(&mut self) -> Arc<ThreadListMemento> {
        if let Some(cached) = self.cached.as_ref().filter(|_| !self.changed) {
            return Arc::clone(cached);
        }
        let memento = Arc::new(ThreadListMemento {
            threads: self.threads.iter_mut().map(ThreadInfo::memento).collect(),
        });
        self.changed = false;
        self.cached = Some(Arc::clone(&memento));
        memento
    }

    pub fn restore(&mut self, memento: &Arc<ThreadListMemento>) {
        self.threads.truncate(memento.threads.len());
        for (index, tm) in memento.threads.iter().enumerate() {
            match self.threads.get_mut(index) {
                Some(thread) if thread.is_restored_from(tm) => {}
                Some(thread) => *thread = ThreadInfo::from_memento(tm),
                None => self.threads.push(ThreadInfo::from_memento(tm)),
            }
        }
        self.changed = false;
        self.cached = Some(Arc::clone(memento));
    }

    pub fn check_consistency(&self) -> Result<(), EngineError> {
        for (index, thread) in self.threads.iter().enumerate() {
            if thread.id().index() != index {
                return Err(EngineError::Inconsistent(format!(
                    "{} stored at index {index}",
                    thread.id()
                )));
            }
            if thread.is_changed() && !self.changed {
                return Err(EngineError::Inconsistent(format!(
                    "{} has pending changes but the thread list is clean",
                    thread.id()
                )));
            }
            let data = thread.data();
            if data.state.has_blocking_object() == data.blocking.is_null() {
                return Err(EngineError::Inconsistent(format!(
                    "{} is {} with blocking object {}",
                    thread.id(),
                    data.state,
                    data.blocking
                )));
            }
            if thread.is_terminated() && thread.top().is_some() {
                return Err(EngineError::Inconsistent(format!(
                    "terminated {} still has frames",
                    thread.id()
                )));
            }
        }
        Ok(())
    }
}

impl RootProvider for ThreadList {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Handle, Option<ThreadId>)) {
        for thread in self.threads.iter().filter(|t| !t.is_terminated()) {
            let id = thread.id();
            thread.for_each_root(|handle| visitor(handle, Some(id)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MethodInfo, ThreadState};

    fn create_list(count: u32) -> ThreadList {
        let entry = Arc::new(MethodInfo::new("run", Vec::new()));
        let mut list = ThreadList::new();
        for i in 0..count {
            let thread = ThreadInfo::new(
                ThreadId(i),
                Handle::new(i as i32),
                Handle::NULL,
                entry.clone(),
                format!("t{i}").into(),
                false,
            );
            list.add(thread).unwrap();
        }
        list
    }

    #[test]
    fn ids_must_be_dense() {
        let mut list = create_list(1);
        let entry = Arc::new(MethodInfo::new("run", Vec::new()));
        let stray = ThreadInfo::new(ThreadId(5), Handle::NULL, Handle::NULL, entry, "x".into(), false);
        assert!(list.add(stray).is_err());
    }

    #[test]
    fn restore_drops_threads_created_later() {
        let mut list = create_list(2);
        let snapshot = list.memento();
        list.modifiable(ThreadId(0)).unwrap().data_mut().state = ThreadState::Running;
        let entry = Arc::new(MethodInfo::new("run", Vec::new()));
        list.add(ThreadInfo::new(ThreadId(2), Handle::new(9), Handle::NULL, entry, "t2".into(), false))
            .unwrap();

        list.restore(&snapshot);
        assert_eq!(list.len(), 2);
        assert_eq!(list.require(ThreadId(0)).unwrap().state(), ThreadState::New);
        list.check_consistency().unwrap();
    }

    #[test]
    fn unchanged_list_reuses_memento() {
        let mut list = create_list(3);
        let a = list.memento();
        assert!(Arc::ptr_eq(&a, &list.memento()));
        list.modifiable(ThreadId(1)).unwrap().data_mut().daemon = true;
        let b = list.memento();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(b.len(), 3);
    }

    #[test]
    fn terminated_threads_are_not_roots() {
        let mut list = create_list(2);
        list.modifiable(ThreadId(1)).unwrap().data_mut().state = ThreadState::Terminated;
        let mut roots = Vec::new();
        list.visit_roots(&mut |h, t| roots.push((h, t)));
        assert_eq!(roots, vec![(Handle::new(0), Some(ThreadId(0)))]);
    }

    #[test]
    fn blocked_thread_without_object_is_inconsistent() {
        let mut list = create_list(1);
        list.modifiable(ThreadId(0)).unwrap().data_mut().state = ThreadState::Blocked;
        assert!(list.check_consistency().is_err());
    }
}
