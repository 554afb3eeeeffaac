use std::sync::Arc;

use bitflags::bitflags;

use crate::{ClassInfo, Fields, FieldsLayout, Handle, HeapError, Monitor, ThreadId};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Attributes: u32 {
        /// Reached during the current mark phase.
        const MARKED = 1 << 0;
        /// Equals the heap's live bit for records that survived the last cycle.
        const ALIVE = 1 << 1;
        const CONSTRUCTED = 1 << 2;

        const FIELDS_CHANGED = 1 << 8;
        const MONITOR_CHANGED = 1 << 9;
        const REFTHREADS_CHANGED = 1 << 10;
        const ATTRIBUTES_CHANGED = 1 << 11;

        const PIN_MASK = 0xff << 16;
    }
}

impl Attributes {
    const PIN_SHIFT: u32 = 16;
    pub const MAX_PIN_COUNT: u32 = 0xff;

    const TRANSIENT: Attributes = Attributes::MARKED.union(Attributes::ALIVE);
    const DIRTY: Attributes = Attributes::FIELDS_CHANGED
        .union(Attributes::MONITOR_CHANGED)
        .union(Attributes::REFTHREADS_CHANGED)
        .union(Attributes::ATTRIBUTES_CHANGED);

    #[inline]
    pub fn pin_count(self) -> u32 {
        (self.bits() & Self::PIN_MASK.bits()) >> Self::PIN_SHIFT
    }

    #[inline]
    fn with_pin_count(self, count: u32) -> Self {
        let bits = (self.bits() & !Self::PIN_MASK.bits()) | (count << Self::PIN_SHIFT);
        Self::from_bits_retain(bits)
    }

    /// The part of the attributes that belongs into a snapshot.
    #[inline]
    pub fn persistent(self) -> Self {
        self.difference(Self::TRANSIENT.union(Self::DIRTY))
    }
}

/// Immutable capture of one object record.
#[derive(Debug, Clone)]
pub struct ObjectMemento {
    class: Arc<ClassInfo>,
    fields: Arc<Fields>,
    monitor: Arc<Monitor>,
    ref_threads: Arc<[ThreadId]>,
    attributes: Attributes,
}

impl ObjectMemento {
    #[inline]
    pub fn class(&self) -> &Arc<ClassInfo> {
        &self.class
    }

    #[inline]
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    #[inline]
    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }
}

/// Mutable state of one managed object.
///
/// Sub-components are shared with the cached memento until the first
/// write, which clones them and sets the matching change bit. Mutation
/// goes through the owning [`crate::Heap`] so the enclosing cluster learns
/// that it has to be re-snapshotted.
#[derive(Debug, Clone)]
pub struct ElementInfo {
    handle: Handle,
    class: Arc<ClassInfo>,
    fields: Arc<Fields>,
    monitor: Arc<Monitor>,
    ref_threads: Arc<[ThreadId]>,
    attributes: Attributes,
    cached: Option<Arc<ObjectMemento>>,
}

impl ElementInfo {
    pub fn new(
        handle: Handle,
        class: Arc<ClassInfo>,
        fields: Fields,
        owner: Option<ThreadId>,
        live_bit: bool,
    ) -> Self {
        let mut attributes = Attributes::DIRTY;
        attributes.set(Attributes::ALIVE, live_bit);
        Self {
            handle,
            class,
            fields: Arc::new(fields),
            monitor: Arc::new(Monitor::default()),
            ref_threads: owner.into_iter().collect(),
            attributes,
            cached: None,
        }
    }

    pub fn from_memento(handle: Handle, memento: &Arc<ObjectMemento>, live_bit: bool) -> Self {
        let mut attributes = memento.attributes;
        attributes.set(Attributes::ALIVE, live_bit);
        Self {
            handle,
            class: Arc::clone(&memento.class),
            fields: Arc::clone(&memento.fields),
            monitor: Arc::clone(&memento.monitor),
            ref_threads: Arc::clone(&memento.ref_threads),
            attributes,
            cached: Some(Arc::clone(memento)),
        }
    }

    /// Returns the cached memento, creating a new one if anything changed
    /// since the last call.
    pub fn memento(&mut self) -> Arc<ObjectMemento> {
        if let Some(cached) = self.cached.as_ref().filter(|_| !self.is_dirty()) {
            return Arc::clone(cached);
        }
        let memento = Arc::new(ObjectMemento {
            class: Arc::clone(&self.class),
            fields: Arc::clone(&self.fields),
            monitor: Arc::clone(&self.monitor),
            ref_threads: Arc::clone(&self.ref_threads),
            attributes: self.attributes.persistent(),
        });
        self.attributes.remove(Attributes::DIRTY);
        self.cached = Some(Arc::clone(&memento));
        memento
    }

    /// Whether this record already mirrors `memento` without local edits.
    pub fn is_restored_from(&self, memento: &Arc<ObjectMemento>) -> bool {
        !self.is_dirty()
            && self
                .cached
                .as_ref()
                .is_some_and(|cached| Arc::ptr_eq(cached, memento))
    }

    // ── Queries ───────────────────────────────────────────────────────

    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[inline]
    pub fn class(&self) -> &Arc<ClassInfo> {
        &self.class
    }

    #[inline]
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    #[inline]
    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    #[inline]
    pub fn referencing_threads(&self) -> &[ThreadId] {
        &self.ref_threads
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        self.ref_threads.len() > 1
    }

    #[inline]
    pub fn attributes(&self) -> Attributes {
        self.attributes
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.attributes.intersects(Attributes::DIRTY)
    }

    #[inline]
    pub fn is_marked(&self) -> bool {
        self.attributes.contains(Attributes::MARKED)
    }

    #[inline]
    pub fn is_alive(&self, live_bit: bool) -> bool {
        self.attributes.contains(Attributes::ALIVE) == live_bit
    }

    #[inline]
    pub fn is_constructed(&self) -> bool {
        self.attributes.contains(Attributes::CONSTRUCTED)
    }

    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.attributes.pin_count()
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    #[inline]
    pub fn is_array(&self) -> bool {
        self.class.is_array()
    }

    /// Handles stored in traced reference slots. Weak referents are skipped.
    pub fn for_each_strong_reference(&self, mut f: impl FnMut(Handle)) {
        let weak = self.class.weak_referent_offset();
        let offsets = match self.fields.layout() {
            FieldsLayout::Array(_) => &[][..],
            FieldsLayout::Statics => self.class.static_reference_offsets(),
            FieldsLayout::Instance => self.class.instance_reference_offsets(),
        };
        self.fields.for_each_reference_slot(offsets, |offset| {
            if Some(offset) == weak {
                return;
            }
            let handle = self.fields.get_ref(offset);
            if !handle.is_null() {
                f(handle);
            }
        });
    }

    // ── Copy-on-write mutators ────────────────────────────────────────

    /// Field storage for writing. Reach it through [`crate::Heap::modifiable`]
    /// so the owning cluster is re-snapshotted.
    pub fn fields_mut(&mut self) -> &mut Fields {
        self.attributes.insert(Attributes::FIELDS_CHANGED);
        Arc::make_mut(&mut self.fields)
    }

    pub(crate) fn monitor_mut(&mut self) -> &mut Monitor {
        self.attributes.insert(Attributes::MONITOR_CHANGED);
        Arc::make_mut(&mut self.monitor)
    }

    /// Returns whether the set grew.
    pub(crate) fn add_referencing_thread(&mut self, thread: ThreadId) -> bool {
        if self.ref_threads.contains(&thread) {
            return false;
        }
        let mut threads = self.ref_threads.to_vec();
        let at = threads.partition_point(|&t| t < thread);
        threads.insert(at, thread);
        self.ref_threads = threads.into();
        self.attributes.insert(Attributes::REFTHREADS_CHANGED);
        true
    }

    pub(crate) fn set_constructed(&mut self) {
        if !self.is_constructed() {
            self.attributes
                .insert(Attributes::CONSTRUCTED | Attributes::ATTRIBUTES_CHANGED);
        }
    }

    pub(crate) fn increment_pin(&mut self) -> Result<u32, HeapError> {
        let count = self.pin_count();
        if count >= Attributes::MAX_PIN_COUNT {
            return Err(HeapError::PinOverflow(self.handle));
        }
        self.attributes = self.attributes.with_pin_count(count + 1);
        self.attributes.insert(Attributes::ATTRIBUTES_CHANGED);
        Ok(count + 1)
    }

    /// Returns the remaining count.
    pub(crate) fn decrement_pin(&mut self) -> u32 {
        let count = self.pin_count().saturating_sub(1);
        self.attributes = self.attributes.with_pin_count(count);
        self.attributes.insert(Attributes::ATTRIBUTES_CHANGED);
        count
    }

    // GC bits are transient and never make a record dirty.

    #[inline]
    pub(crate) fn set_marked(&mut self) {
        self.attributes.insert(Attributes::MARKED);
    }

    #[inline]
    pub(crate) fn set_unmarked_alive(&mut self, live_bit: bool) {
        self.attributes.remove(Attributes::MARKED);
        self.attributes.set(Attributes::ALIVE, live_bit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClassDef, ClassRegistry, FieldType};

    fn make_record() -> ElementInfo {
        let registry = ClassRegistry::new();
        registry
            .define(
                ClassDef::new("Pair")
                    .field("left", FieldType::Reference)
                    .field("count", FieldType::Int),
            )
            .unwrap();
        let class = registry.by_name("Pair").unwrap();
        let fields = Fields::instance(class.instance_size, class.instance_reference_offsets());
        ElementInfo::new(Handle::new(0), class, fields, Some(ThreadId(0)), false)
    }

    #[test]
    fn memento_is_cached_until_mutation() {
        let mut ei = make_record();
        let first = ei.memento();
        assert!(!ei.is_dirty(), "snapshot clears change bits");
        let second = ei.memento();
        assert!(Arc::ptr_eq(&first, &second), "unchanged record reuses snapshot");

        ei.fields_mut().set_int(1, 7);
        let third = ei.memento();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(first.fields().get_int(1), 0, "old snapshot is untouched");
        assert_eq!(third.fields().get_int(1), 7);
    }

    #[test]
    fn restored_record_copies_on_first_write() {
        let mut ei = make_record();
        let memento = ei.memento();
        let mut restored = ElementInfo::from_memento(Handle::new(0), &memento, false);
        assert!(restored.is_restored_from(&memento));
        restored.fields_mut().set_int(1, 42);
        assert_eq!(memento.fields().get_int(1), 0);
        assert!(!restored.is_restored_from(&memento));
    }

    #[test]
    fn pin_count_lives_in_attribute_bits() {
        let mut ei = make_record();
        assert_eq!(ei.increment_pin().unwrap(), 1);
        assert_eq!(ei.increment_pin().unwrap(), 2);
        assert!(ei.is_pinned());
        assert_eq!(ei.decrement_pin(), 1);
        assert!(ei.attributes().contains(Attributes::ATTRIBUTES_CHANGED));
        assert_eq!(ei.attributes().persistent().pin_count(), 1);
    }

    #[test]
    fn referencing_threads_stay_sorted() {
        let mut ei = make_record();
        assert!(!ei.is_shared());
        assert!(ei.add_referencing_thread(ThreadId(4)));
        assert!(ei.add_referencing_thread(ThreadId(2)));
        assert!(!ei.add_referencing_thread(ThreadId(2)));
        assert_eq!(
            ei.referencing_threads(),
            &[ThreadId(0), ThreadId(2), ThreadId(4)]
        );
        assert!(ei.is_shared());
    }
}
