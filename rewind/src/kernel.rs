use std::{mem, sync::Arc};

use crate::{
    ArrayType, ClassInfo, ClassRegistry, EngineError, Event, Fields, GcStats, Handle, Heap,
    HeapError, HeapMemento, HeapSettings, MethodInfo, STRING, StackFrame, THREAD, ThreadId,
    ThreadInfo, ThreadList, ThreadListMemento, ThreadState,
};

/// Snapshot of heap and thread list taken together.
#[derive(Debug, Clone)]
pub struct KernelMemento {
    heap: Arc<HeapMemento>,
    threads: Arc<ThreadListMemento>,
}

impl KernelMemento {
    pub fn heap(&self) -> &Arc<HeapMemento> {
        &self.heap
    }

    pub fn threads(&self) -> &Arc<ThreadListMemento> {
        &self.threads
    }
}

/// The program state that instructions operate on.
#[derive(Debug)]
pub struct KernelState {
    pub heap: Heap,
    pub threads: ThreadList,
    classes: ClassRegistry,
    events: Vec<Event>,
}

impl KernelState {
    pub fn new(classes: ClassRegistry, settings: HeapSettings) -> Self {
        Self {
            heap: Heap::new(settings),
            threads: ThreadList::new(),
            classes,
            events: Vec::new(),
        }
    }

    #[inline]
    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    #[inline]
    pub(crate) fn emit(&mut self, event: Event) {
        self.events.push(event);
    }

    pub(crate) fn drain_events(&mut self) -> Vec<Event> {
        mem::take(&mut self.events)
    }

    // ── Snapshots ─────────────────────────────────────────────────────

    pub fn memento(&mut self) -> KernelMemento {
        KernelMemento {
            heap: self.heap.memento(),
            threads: self.threads.memento(),
        }
    }

    pub fn restore(&mut self, memento: &KernelMemento) {
        self.heap.restore(&memento.heap);
        self.threads.restore(&memento.threads);
        self.events.clear();
    }

    // ── Allocation ────────────────────────────────────────────────────

    pub fn new_object(
        &mut self,
        class: &Arc<ClassInfo>,
        thread: ThreadId,
    ) -> Result<Handle, HeapError> {
        let handle = self.heap.new_object(class, thread)?;
        self.emit(Event::ObjectCreated { thread, handle });
        Ok(handle)
    }

    pub fn new_array(
        &mut self,
        ty: ArrayType,
        length: usize,
        thread: ThreadId,
    ) -> Result<Handle, EngineError> {
        let class = self.classes.array_class(ty)?;
        let handle = self.heap.new_array(&class, length, thread)?;
        self.emit(Event::ObjectCreated { thread, handle });
        Ok(handle)
    }

    /// Fresh `String` object backed by a char array.
    pub fn new_string(&mut self, text: &str, thread: ThreadId) -> Result<Handle, EngineError> {
        let string_class = self.classes.by_name(STRING)?;
        let chars_class = self.classes.array_class(ArrayType::Char)?;
        let value = string_class
            .instance_field("value")
            .ok_or_else(|| EngineError::UnknownField {
                class: STRING.to_owned(),
                field: "value".to_owned(),
            })?
            .offset;
        let chars = self
            .heap
            .allocate(chars_class, Fields::from_chars(text), thread)?;
        self.emit(Event::ObjectCreated {
            thread,
            handle: chars,
        });
        let string = self.heap.new_object(&string_class, thread)?;
        self.heap
            .modifiable(string)?
            .fields_mut()
            .set_ref(value, chars);
        self.heap.set_constructed(string)?;
        self.emit(Event::ObjectCreated {
            thread,
            handle: string,
        });
        Ok(string)
    }

    /// Canonical pinned `String` object for `text`.
    pub fn intern(&mut self, text: &str, thread: ThreadId) -> Result<Handle, EngineError> {
        if let Some(handle) = self.heap.interned(text) {
            return Ok(handle);
        }
        let string = self.new_string(text, thread)?;
        self.heap.add_interned(text, string)?;
        Ok(string)
    }

    /// Text of a `String` object or a char array.
    pub fn string_value(&self, handle: Handle) -> Option<String> {
        let ei = self.heap.get(handle)?;
        if let Some(text) = ei.fields().chars() {
            return Some(text);
        }
        let value = ei.class().instance_field("value")?.offset;
        self.heap.get(ei.fields().get_ref(value))?.fields().chars()
    }

    // ── Threads ───────────────────────────────────────────────────────

    /// Creates the thread object and a `NEW` thread running `entry` once
    /// started.
    pub fn new_thread(
        &mut self,
        entry: Arc<MethodInfo>,
        runnable: Handle,
        daemon: bool,
        creator: ThreadId,
    ) -> Result<(ThreadId, Handle), EngineError> {
        let thread_class = self.classes.by_name(THREAD)?;
        let id = self.threads.next_id();
        let object = self.heap.new_object(&thread_class, creator)?;
        if let Some(target) = thread_class.instance_field("target") {
            self.heap
                .modifiable(object)?
                .fields_mut()
                .set_ref(target.offset, runnable);
        }
        self.heap.set_constructed(object)?;
        self.emit(Event::ObjectCreated {
            thread: creator,
            handle: object,
        });
        let name: Arc<str> = format!("Thread-{}", id.0).into();
        self.threads
            .add(ThreadInfo::new(id, object, runnable, entry, name, daemon))?;
        log::debug!("created {id} with object {object}");
        Ok((id, object))
    }

    /// Creates and starts thread 0.
    pub fn create_main_thread(&mut self, entry: Arc<MethodInfo>) -> Result<ThreadId, EngineError> {
        if !self.threads.is_empty() {
            return Err(EngineError::Inconsistent(
                "main thread must be created first".to_owned(),
            ));
        }
        let thread_class = self.classes.by_name(THREAD)?;
        let id = self.threads.next_id();
        let object = self.heap.new_object(&thread_class, id)?;
        self.heap.set_constructed(object)?;
        let thread = ThreadInfo::new(id, object, Handle::NULL, entry, "main".into(), false);
        self.threads.add(thread)?;
        self.start_frame(id)?;
        self.set_thread_state(id, ThreadState::Running)?;
        Ok(id)
    }

    /// Pushes the entry frame of a `NEW` thread.
    pub(crate) fn start_frame(&mut self, id: ThreadId) -> Result<(), EngineError> {
        let thread = self.threads.modifiable(id)?;
        let entry = thread
            .take_entry()
            .ok_or_else(|| EngineError::Inconsistent(format!("{id} started twice")))?;
        let receiver = if thread.runnable().is_null() {
            thread.object()
        } else {
            thread.runnable()
        };
        let mut frame = StackFrame::new(Arc::clone(&entry), None);
        if entry.arg_slots > 0 {
            frame.set_local_ref(0, receiver)?;
        }
        thread.push_frame(frame);
        Ok(())
    }

    // ── Collection ────────────────────────────────────────────────────

    pub fn collect_garbage(&mut self) -> GcStats {
        self.emit(Event::GcBegin);
        let mut released = Vec::new();
        let stats = self
            .heap
            .collect(&self.threads, &mut |handle| released.push(handle));
        self.events
            .extend(released.into_iter().map(|handle| Event::ObjectReleased { handle }));
        self.emit(Event::GcEnd(stats));
        stats
    }

    // ── Consistency ───────────────────────────────────────────────────

    /// Cross-checks heap, thread list and the lock bookkeeping between them.
    pub fn check_consistency(&self) -> Result<(), EngineError> {
        self.heap.check_consistency()?;
        self.threads.check_consistency()?;
        for thread in self.threads.iter() {
            let id = thread.id();
            for &locked in &thread.data().locked_objects {
                let ei = self.heap.get(locked).ok_or_else(|| {
                    EngineError::Inconsistent(format!("{id} holds the lock of dead {locked}"))
                })?;
                if !ei.monitor().is_locked_by(id) {
                    return Err(EngineError::Inconsistent(format!(
                        "{id} lists {locked} as locked, monitor owner is {:?}",
                        ei.monitor().owner()
                    )));
                }
            }
            let data = thread.data();
            if data.state == ThreadState::Blocked {
                let blocked_on = self.heap.get(data.blocking);
                if !blocked_on.is_some_and(|ei| ei.monitor().has_contender(id)) {
                    return Err(EngineError::Inconsistent(format!(
                        "{id} is blocked on {} without being a contender",
                        data.blocking
                    )));
                }
            }
        }
        for ei in self.heap.iter() {
            let Some(owner) = ei.monitor().owner() else {
                continue;
            };
            let listed = self
                .threads
                .get(owner)
                .is_some_and(|t| t.data().locked_objects.contains(&ei.handle()));
            if !listed {
                return Err(EngineError::Inconsistent(format!(
                    "{} is owned by {owner}, which does not list it",
                    ei.handle()
                )));
            }
        }
        Ok(())
    }

    /// Human readable dump of threads and heap for fatal diagnostics.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for thread in self.threads.iter() {
            let data = thread.data();
            out.push_str(&format!(
                "{} {:?} state={} blocking={} locks={:?} depth={}\n",
                thread.id(),
                thread.name(),
                data.state,
                data.blocking,
                data.locked_objects,
                thread.depth()
            ));
            for frame in thread.frames() {
                out.push_str(&format!("    at {}:{}\n", frame.method().name, frame.pc()));
            }
        }
        for ei in self.heap.iter() {
            let monitor = ei.monitor();
            out.push_str(&format!(
                "{} {} fields={:?} lock={}/{:?} blocked={:?} waiting={:?} refs={:?}\n",
                ei.handle(),
                ei.class().name,
                ei.fields().values(),
                monitor.lock_count(),
                monitor.owner(),
                monitor.blocked(),
                monitor.waiting(),
                ei.referencing_threads()
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_kernel() -> KernelState {
        let registry = ClassRegistry::new();
        KernelState::new(registry, HeapSettings::default())
    }

    fn entry() -> Arc<MethodInfo> {
        let mut method = MethodInfo::new("main", Vec::new());
        method.max_locals = 1;
        Arc::new(method)
    }

    #[test]
    fn interning_returns_the_same_pinned_string() {
        let mut kernel = create_kernel();
        let main = kernel.create_main_thread(entry()).unwrap();
        let a = kernel.intern("hello", main).unwrap();
        let b = kernel.intern("hello", main).unwrap();
        assert_eq!(a, b);
        assert!(kernel.heap.require(a).unwrap().is_pinned());
        assert_eq!(kernel.string_value(a).as_deref(), Some("hello"));
    }

    #[test]
    fn interned_strings_survive_collection() {
        let mut kernel = create_kernel();
        let main = kernel.create_main_thread(entry()).unwrap();
        let s = kernel.intern("keep", main).unwrap();
        kernel.collect_garbage();
        assert_eq!(kernel.string_value(s).as_deref(), Some("keep"));
        kernel.check_consistency().unwrap();
    }

    #[test]
    fn main_thread_starts_running_with_a_frame() {
        let mut kernel = create_kernel();
        let main = kernel.create_main_thread(entry()).unwrap();
        let thread = kernel.threads.require(main).unwrap();
        assert_eq!(thread.state(), ThreadState::Running);
        assert_eq!(thread.depth(), 1);
        assert!(thread.entry().is_none());
    }

    #[test]
    fn kernel_round_trips_through_memento() {
        let mut kernel = create_kernel();
        let main = kernel.create_main_thread(entry()).unwrap();
        let snapshot = kernel.memento();
        let (worker, _) = kernel.new_thread(entry(), Handle::NULL, false, main).unwrap();
        assert_eq!(kernel.threads.len(), 2);
        kernel.restore(&snapshot);
        assert_eq!(kernel.threads.len(), 1);
        assert!(kernel.threads.get(worker).is_none());
        assert_eq!(kernel.heap.live_count(), 1, "only the main thread object");
        kernel.check_consistency().unwrap();
    }

    #[test]
    fn collection_reports_released_objects() {
        let mut kernel = create_kernel();
        let main = kernel.create_main_thread(entry()).unwrap();
        let object = kernel.classes().by_name(crate::OBJECT).unwrap();
        let garbage = kernel.new_object(&object, main).unwrap();
        kernel.drain_events();
        let stats = kernel.collect_garbage();
        assert_eq!(stats.released, 1);
        let events = kernel.drain_events();
        assert!(events.contains(&Event::ObjectReleased { handle: garbage }));
        assert!(matches!(events.last(), Some(Event::GcEnd(_))));
    }
}
