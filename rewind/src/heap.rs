use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use crate::{
    ClassId, ClassInfo, ElementInfo, EngineError, Fields, Handle, HeapError, HeapSettings,
    ObjectMemento, ThreadId,
};

// ── Clusters ──────────────────────────────────────────────────────────

/// Snapshot of one cluster: its live records sorted by slot offset.
#[derive(Debug, Default)]
pub struct ClusterMemento {
    objects: Vec<(u32, Arc<ObjectMemento>)>,
}

impl ClusterMemento {
    #[inline]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Handle range reserved for one execution unit.
///
/// Also used for the static area, where the slot index is the class id.
#[derive(Debug, Default)]
pub(crate) struct Cluster {
    pub(crate) slots: Vec<Option<ElementInfo>>,
    live: usize,
    first_free: usize,
    pub(crate) changed: bool,
    cached: Option<Arc<ClusterMemento>>,
}

impl Cluster {
    fn allocate_slot(&mut self, capacity: usize) -> Option<usize> {
        let index = (self.first_free..self.slots.len())
            .find(|&i| self.slots[i].is_none())
            .unwrap_or(self.slots.len());
        if index >= capacity {
            return None;
        }
        if index == self.slots.len() {
            self.slots.push(None);
        }
        self.first_free = index + 1;
        Some(index)
    }

    fn install(&mut self, index: usize, record: ElementInfo) {
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || None);
        }
        if self.slots[index].replace(record).is_none() {
            self.live += 1;
        }
        self.changed = true;
    }

    #[inline]
    fn get(&self, index: usize) -> Option<&ElementInfo> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    #[inline]
    fn get_mut(&mut self, index: usize) -> Option<&mut ElementInfo> {
        let record = self.slots.get_mut(index).and_then(Option::as_mut)?;
        self.changed = true;
        Some(record)
    }

    pub(crate) fn free(&mut self, index: usize) -> Option<ElementInfo> {
        let record = self.slots.get_mut(index).and_then(Option::take)?;
        self.live -= 1;
        self.changed = true;
        self.first_free = self.first_free.min(index);
        Some(record)
    }

    /// Drops trailing empty slots. Indices below the new length are kept.
    pub(crate) fn trim(&mut self) {
        while self.slots.last().is_some_and(Option::is_none) {
            self.slots.pop();
        }
    }

    fn memento(&mut self) -> Arc<ClusterMemento> {
        if let Some(cached) = self.cached.as_ref().filter(|_| !self.changed) {
            return Arc::clone(cached);
        }
        let objects = self
            .slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|ei| (i as u32, ei.memento())))
            .collect();
        let memento = Arc::new(ClusterMemento { objects });
        self.changed = false;
        self.cached = Some(Arc::clone(&memento));
        memento
    }

    /// Reinstalls the records of `memento`. Live records missing from the
    /// snapshot are dropped, untouched ones are kept as they are.
    fn restore(
        &mut self,
        memento: &Arc<ClusterMemento>,
        live_bit: bool,
        handle_of: impl Fn(usize) -> Handle,
    ) {
        let mut next = 0;
        for (offset, object) in &memento.objects {
            let offset = *offset as usize;
            // clear the live gap in front of this entry
            let gap_end = offset.min(self.slots.len());
            for slot in &mut self.slots[next.min(gap_end)..gap_end] {
                *slot = None;
            }
            if self.slots.len() <= offset {
                self.slots.resize_with(offset + 1, || None);
            }
            let slot = &mut self.slots[offset];
            if !slot.as_ref().is_some_and(|ei| ei.is_restored_from(object)) {
                *slot = Some(ElementInfo::from_memento(handle_of(offset), object, live_bit));
            }
            next = offset + 1;
        }
        self.slots.truncate(next);
        self.live = memento.objects.len();
        self.first_free = self
            .slots
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.slots.len());
        self.changed = false;
        self.cached = Some(Arc::clone(memento));
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.live = 0;
        self.first_free = 0;
        self.changed = true;
        self.cached = None;
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = &ElementInfo> {
        self.slots.iter().filter_map(Option::as_ref)
    }
}

// ── Heap ──────────────────────────────────────────────────────────────

/// Snapshot of the whole object store.
#[derive(Debug)]
pub struct HeapMemento {
    clusters: Vec<Arc<ClusterMemento>>,
    statics: Arc<ClusterMemento>,
    pinned: Arc<BTreeSet<Handle>>,
    interned: Arc<BTreeMap<String, Handle>>,
    allocations: usize,
}

impl HeapMemento {
    pub fn object_count(&self) -> usize {
        self.clusters.iter().map(|c| c.len()).sum()
    }
}

/// Handle-indexed store of all managed objects.
///
/// The handle space is split into one cluster per execution unit; a thread
/// allocates at the lowest free slot of its own cluster, so replaying the
/// same allocations after a backtrack yields the same handles.
#[derive(Debug)]
pub struct Heap {
    pub(crate) settings: HeapSettings,
    pub(crate) clusters: Vec<Cluster>,
    pub(crate) statics: Cluster,
    pub(crate) pinned: Arc<BTreeSet<Handle>>,
    pub(crate) interned: Arc<BTreeMap<String, Handle>>,
    pub(crate) meta_changed: bool,
    pub(crate) live_bit: bool,
    pub(crate) allocations: usize,
    gc_enabled: bool,
    cached: Option<Arc<HeapMemento>>,
}

impl Heap {
    pub fn new(settings: HeapSettings) -> Self {
        let gc_enabled = settings.gc_enabled;
        Self {
            settings,
            clusters: Vec::new(),
            statics: Cluster::default(),
            pinned: Arc::default(),
            interned: Arc::default(),
            meta_changed: true,
            live_bit: false,
            allocations: 0,
            gc_enabled,
            cached: None,
        }
    }

    #[inline]
    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    #[inline]
    pub fn live_bit(&self) -> bool {
        self.live_bit
    }

    #[inline]
    pub fn is_gc_enabled(&self) -> bool {
        self.gc_enabled
    }

    pub fn set_gc_enabled(&mut self, enabled: bool) {
        self.gc_enabled = enabled;
    }

    /// Allocation count since the last collection.
    #[inline]
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    pub fn should_collect(&self) -> bool {
        self.gc_enabled
            && self.settings.gc_interval > 0
            && self.allocations >= self.settings.gc_interval
    }

    #[inline]
    fn split(&self, handle: Handle) -> Option<(usize, usize)> {
        let index = handle.index()?;
        let per = self.settings.handles_per_thread;
        Some((index / per, index % per))
    }

    #[inline]
    fn join(&self, cluster: usize, offset: usize) -> Handle {
        Handle::new((cluster * self.settings.handles_per_thread + offset) as i32)
    }

    // ── Allocation ────────────────────────────────────────────────────

    pub fn allocate(
        &mut self,
        class: Arc<ClassInfo>,
        fields: Fields,
        thread: ThreadId,
    ) -> Result<Handle, HeapError> {
        let cluster_index = thread.index();
        if cluster_index >= self.settings.max_threads {
            return Err(HeapError::TooManyThreads {
                thread,
                max: self.settings.max_threads,
            });
        }
        if self.clusters.len() <= cluster_index {
            self.clusters.resize_with(cluster_index + 1, Cluster::default);
        }
        let capacity = self.settings.handles_per_thread;
        let offset = self.clusters[cluster_index]
            .allocate_slot(capacity)
            .ok_or(HeapError::OutOfHandles { thread, capacity })?;
        let handle = self.join(cluster_index, offset);
        let record = ElementInfo::new(handle, class, fields, Some(thread), self.live_bit);
        self.clusters[cluster_index].install(offset, record);
        self.allocations += 1;
        log::trace!("allocated {handle} in cluster of {thread}");
        Ok(handle)
    }

    pub fn new_object(
        &mut self,
        class: &Arc<ClassInfo>,
        thread: ThreadId,
    ) -> Result<Handle, HeapError> {
        if class.is_array() {
            return Err(HeapError::WrongKind(class.name.clone()));
        }
        let fields = Fields::instance(class.instance_size, class.instance_reference_offsets());
        self.allocate(Arc::clone(class), fields, thread)
    }

    pub fn new_array(
        &mut self,
        class: &Arc<ClassInfo>,
        length: usize,
        thread: ThreadId,
    ) -> Result<Handle, HeapError> {
        let ty = class
            .array_type
            .ok_or_else(|| HeapError::WrongKind(class.name.clone()))?;
        let max_slots = self.settings.max_array_slots;
        if length
            .checked_mul(ty.slot_size())
            .is_none_or(|slots| slots > max_slots)
        {
            return Err(HeapError::ArrayTooLarge { length, max_slots });
        }
        self.allocate(Arc::clone(class), Fields::array(ty, length), thread)
    }

    // ── Access ────────────────────────────────────────────────────────

    pub fn get(&self, handle: Handle) -> Option<&ElementInfo> {
        let (cluster, offset) = self.split(handle)?;
        self.clusters.get(cluster)?.get(offset)
    }

    pub fn require(&self, handle: Handle) -> Result<&ElementInfo, HeapError> {
        self.get(handle).ok_or(HeapError::UnknownHandle(handle))
    }

    /// Mutable access; the owning cluster is marked for re-snapshotting.
    pub fn modifiable(&mut self, handle: Handle) -> Result<&mut ElementInfo, HeapError> {
        let (cluster, offset) = self
            .split(handle)
            .ok_or(HeapError::UnknownHandle(handle))?;
        self.clusters
            .get_mut(cluster)
            .and_then(|c| c.get_mut(offset))
            .ok_or(HeapError::UnknownHandle(handle))
    }

    #[inline]
    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    pub fn is_alive(&self, handle: Handle) -> bool {
        self.get(handle)
            .is_some_and(|ei| ei.is_alive(self.live_bit))
    }

    pub fn live_count(&self) -> usize {
        self.clusters.iter().map(|c| c.live).sum()
    }

    /// Live records in handle order.
    pub fn iter(&self) -> impl Iterator<Item = &ElementInfo> {
        self.clusters.iter().flat_map(Cluster::records)
    }

    /// Records that `thread` now holds a handle to `handle`. Returns true
    /// when this made the object shared.
    pub fn touch(&mut self, handle: Handle, thread: ThreadId) -> Result<bool, HeapError> {
        if self
            .require(handle)?
            .referencing_threads()
            .contains(&thread)
        {
            return Ok(false);
        }
        let ei = self.modifiable(handle)?;
        ei.add_referencing_thread(thread);
        Ok(ei.referencing_threads().len() == 2)
    }

    pub fn set_constructed(&mut self, handle: Handle) -> Result<(), HeapError> {
        self.modifiable(handle)?.set_constructed();
        Ok(())
    }

    // ── Pinning and interning ─────────────────────────────────────────

    pub fn pin(&mut self, handle: Handle) -> Result<(), HeapError> {
        let count = self.modifiable(handle)?.increment_pin()?;
        if count == 1 {
            Arc::make_mut(&mut self.pinned).insert(handle);
            self.meta_changed = true;
        }
        Ok(())
    }

    pub fn unpin(&mut self, handle: Handle) -> Result<(), HeapError> {
        let ei = self.modifiable(handle)?;
        if !ei.is_pinned() {
            return Ok(());
        }
        if ei.decrement_pin() == 0 {
            Arc::make_mut(&mut self.pinned).remove(&handle);
            self.meta_changed = true;
        }
        Ok(())
    }

    pub fn pinned(&self) -> impl Iterator<Item = Handle> + '_ {
        self.pinned.iter().copied()
    }

    pub fn interned(&self, text: &str) -> Option<Handle> {
        self.interned.get(text).copied()
    }

    /// Registers and pins the canonical object for `text`.
    pub fn add_interned(&mut self, text: &str, handle: Handle) -> Result<(), HeapError> {
        self.pin(handle)?;
        Arc::make_mut(&mut self.interned).insert(text.to_owned(), handle);
        self.meta_changed = true;
        Ok(())
    }

    // ── Static area ───────────────────────────────────────────────────

    /// Creates the static record of `class` on first use. Returns whether
    /// it was created now.
    pub fn initialize_statics(&mut self, class: &Arc<ClassInfo>) -> bool {
        if self.statics.get(class.id.index()).is_some() {
            return false;
        }
        let fields = Fields::statics(class.static_size, class.static_reference_offsets());
        let record = ElementInfo::new(Handle::NULL, Arc::clone(class), fields, None, self.live_bit);
        self.statics.install(class.id.index(), record);
        true
    }

    pub fn statics(&self, class: ClassId) -> Option<&ElementInfo> {
        self.statics.get(class.index())
    }

    pub fn statics_mut(&mut self, class: ClassId) -> Option<&mut ElementInfo> {
        self.statics.get_mut(class.index())
    }

    pub fn static_records(&self) -> impl Iterator<Item = &ElementInfo> {
        self.statics.records()
    }

    // ── Snapshots ─────────────────────────────────────────────────────

    fn is_changed(&self) -> bool {
        self.meta_changed || self.statics.changed || self.clusters.iter().any(|c| c.changed)
    }

    /// Cost is proportional to the records changed since the last call.
    pub fn memento(&mut self) -> Arc<HeapMemento> {
        if let Some(cached) = self.cached.as_ref().filter(|_| !self.is_changed()) {
            return Arc::clone(cached);
        }
        let memento = Arc::new(HeapMemento {
            clusters: self.clusters.iter_mut().map(Cluster::memento).collect(),
            statics: self.statics.memento(),
            pinned: Arc::clone(&self.pinned),
            interned: Arc::clone(&self.interned),
            allocations: self.allocations,
        });
        self.meta_changed = false;
        self.cached = Some(Arc::clone(&memento));
        memento
    }

    pub fn restore(&mut self, memento: &Arc<HeapMemento>) {
        if self.clusters.len() < memento.clusters.len() {
            self.clusters
                .resize_with(memento.clusters.len(), Cluster::default);
        }
        let per = self.settings.handles_per_thread;
        let live_bit = self.live_bit;
        for (index, cluster) in self.clusters.iter_mut().enumerate() {
            match memento.clusters.get(index) {
                Some(cm) => cluster.restore(cm, live_bit, |offset| {
                    Handle::new((index * per + offset) as i32)
                }),
                None => cluster.clear(),
            }
        }
        self.statics
            .restore(&memento.statics, live_bit, |_| Handle::NULL);
        self.pinned = Arc::clone(&memento.pinned);
        self.interned = Arc::clone(&memento.interned);
        self.allocations = memento.allocations;
        self.meta_changed = false;
        // clusters beyond the snapshot were just cleared
        self.cached = (self.clusters.len() == memento.clusters.len()).then(|| Arc::clone(memento));
    }

    // ── Consistency ───────────────────────────────────────────────────

    /// Verifies change tracking and pin bookkeeping.
    pub fn check_consistency(&self) -> Result<(), EngineError> {
        let mut pinned = BTreeSet::new();
        for (index, cluster) in self.clusters.iter().enumerate() {
            let mut live = 0;
            for (offset, slot) in cluster.slots.iter().enumerate() {
                let Some(ei) = slot else { continue };
                live += 1;
                let expected = self.join(index, offset);
                if ei.handle() != expected {
                    return Err(EngineError::Inconsistent(format!(
                        "record {} stored at {expected}",
                        ei.handle()
                    )));
                }
                if ei.is_dirty() && !cluster.changed {
                    return Err(EngineError::Inconsistent(format!(
                        "{expected} has pending changes but its cluster is clean"
                    )));
                }
                let monitor = ei.monitor();
                if monitor.is_locked() && monitor.owner().is_none() {
                    return Err(EngineError::Inconsistent(format!(
                        "{expected} is locked without an owner"
                    )));
                }
                if ei.is_pinned() {
                    pinned.insert(expected);
                }
            }
            if live != cluster.live {
                return Err(EngineError::Inconsistent(format!(
                    "cluster {index} counts {} live records, found {live}",
                    cluster.live
                )));
            }
        }
        for ei in self.statics.records() {
            if ei.is_dirty() && !self.statics.changed {
                return Err(EngineError::Inconsistent(format!(
                    "statics of `{}` have pending changes but the static area is clean",
                    ei.class().name
                )));
            }
        }
        if pinned != *self.pinned {
            return Err(EngineError::Inconsistent(format!(
                "pin-down list {:?} disagrees with pinned records {:?}",
                self.pinned, pinned
            )));
        }
        for (text, handle) in self.interned.iter() {
            if !self.contains(*handle) {
                return Err(EngineError::Inconsistent(format!(
                    "interned {text:?} refers to dead {handle}"
                )));
            }
        }
        Ok(())
    }
}
