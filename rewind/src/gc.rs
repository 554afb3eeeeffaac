use std::{collections::BTreeSet, sync::Arc};

use crate::{Handle, Heap, ThreadId};

/// Discovers the roots outside the heap (thread stacks, thread objects).
///
/// The visitor is the mark-root operation. Roots reached through a thread
/// carry its id so the collector can record which threads reference what.
pub trait RootProvider {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Handle, Option<ThreadId>));
}

/// A plain list of roots, for callers that hold handles outside any thread.
#[derive(Debug, Default, Clone)]
pub struct RootSet {
    roots: Vec<(Handle, Option<ThreadId>)>,
}

impl RootSet {
    pub fn mark_root(&mut self, handle: Handle) {
        self.roots.push((handle, None));
    }

    pub fn mark_thread_root(&mut self, handle: Handle, thread: ThreadId) {
        self.roots.push((handle, Some(thread)));
    }
}

impl RootProvider for RootSet {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Handle, Option<ThreadId>)) {
        for &(handle, thread) in &self.roots {
            visitor(handle, thread);
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub marked: usize,
    pub released: usize,
    pub weak_cleared: usize,
}

impl Heap {
    /// Synchronous mark-sweep over all records.
    ///
    /// `on_release` is called with every handle after its release actions
    /// ran and its record is gone.
    pub fn collect(
        &mut self,
        roots: &dyn RootProvider,
        on_release: &mut dyn FnMut(Handle),
    ) -> GcStats {
        let mut stats = GcStats::default();
        if !self.is_gc_enabled() {
            return stats;
        }
        self.live_bit = !self.live_bit;

        let weak_refs = self.mark(roots, &mut stats);
        self.sweep(&mut stats, on_release);
        self.clear_weak_references(&weak_refs, &mut stats);

        if self.interned.values().any(|&h| !self.contains(h)) {
            let clusters = &self.clusters;
            let per = self.settings.handles_per_thread;
            Arc::make_mut(&mut self.interned).retain(|_, h| {
                h.index().is_some_and(|i| {
                    clusters
                        .get(i / per)
                        .and_then(|c| c.slots.get(i % per))
                        .is_some_and(Option::is_some)
                })
            });
            self.meta_changed = true;
        }
        self.allocations = 0;
        log::debug!(
            "gc: marked {} released {} weak cleared {}",
            stats.marked,
            stats.released,
            stats.weak_cleared
        );
        stats
    }

    /// Everything a collection with `roots` would keep.
    pub fn reachable_set(&self, roots: &dyn RootProvider) -> BTreeSet<Handle> {
        let mut seen = BTreeSet::new();
        let mut queue = self.seed(roots);
        while let Some((handle, _)) = queue.pop() {
            let Some(ei) = self.get(handle) else { continue };
            if seen.insert(handle) {
                ei.for_each_strong_reference(|child| queue.push((child, None)));
            }
        }
        seen
    }

    pub fn is_reachable(&self, roots: &dyn RootProvider, handle: Handle) -> bool {
        self.reachable_set(roots).contains(&handle)
    }

    fn seed(&self, roots: &dyn RootProvider) -> Vec<(Handle, Option<ThreadId>)> {
        let mut queue: Vec<(Handle, Option<ThreadId>)> = self.pinned().map(|h| (h, None)).collect();
        roots.visit_roots(&mut |handle, thread| {
            if !handle.is_null() {
                queue.push((handle, thread));
            }
        });
        for statics in self.static_records() {
            statics.for_each_strong_reference(|h| queue.push((h, None)));
        }
        queue
    }

    // ── Marking ───────────────────────────────────────────────────────

    fn mark(&mut self, roots: &dyn RootProvider, stats: &mut GcStats) -> Vec<Handle> {
        let mut weak_refs = Vec::new();
        // Visit all roots
        let mut queue = self.seed(roots);

        // Drain worklist
        while let Some((handle, thread)) = queue.pop() {
            let Some(ei) = self.get(handle) else {
                log::warn!("gc: dangling reference to {handle}");
                continue;
            };
            let first_visit = !ei.is_marked();
            let new_thread = thread.filter(|t| !ei.referencing_threads().contains(t));
            if !first_visit && new_thread.is_none() {
                continue;
            }
            if first_visit && ei.class().weak_referent_offset().is_some() {
                weak_refs.push(handle);
            }
            ei.for_each_strong_reference(|child| queue.push((child, thread)));

            if first_visit {
                stats.marked += 1;
                if let Some(ei) = self.untracked_mut(handle) {
                    ei.set_marked();
                }
            }
            // sharing information is part of the record and gets snapshotted
            if let Some(thread) = new_thread {
                if let Ok(ei) = self.modifiable(handle) {
                    ei.add_referencing_thread(thread);
                }
            }
        }
        weak_refs
    }

    /// Access for transient GC bits, which must not dirty the cluster.
    fn untracked_mut(&mut self, handle: Handle) -> Option<&mut crate::ElementInfo> {
        let index = handle.index()?;
        let per = self.settings.handles_per_thread;
        self.clusters
            .get_mut(index / per)?
            .slots
            .get_mut(index % per)?
            .as_mut()
    }

    // ── Sweeping ──────────────────────────────────────────────────────

    fn sweep(&mut self, stats: &mut GcStats, on_release: &mut dyn FnMut(Handle)) {
        let live_bit = self.live_bit;
        for cluster in &mut self.clusters {
            for offset in 0..cluster.slots.len() {
                let marked = match &mut cluster.slots[offset] {
                    Some(ei) if ei.is_marked() => {
                        ei.set_unmarked_alive(live_bit);
                        true
                    }
                    Some(_) => false,
                    None => continue,
                };
                if marked {
                    continue;
                }
                if let Some(ei) = cluster.free(offset) {
                    for action in &ei.class().release_actions {
                        action.release(ei.handle(), ei.fields());
                    }
                    log::trace!("gc: released {}", ei.handle());
                    stats.released += 1;
                    on_release(ei.handle());
                }
            }
            cluster.trim();
        }
    }

    fn clear_weak_references(&mut self, weak_refs: &[Handle], stats: &mut GcStats) {
        for &handle in weak_refs {
            let Some(ei) = self.get(handle) else { continue };
            let Some(offset) = ei.class().weak_referent_offset() else {
                continue;
            };
            let referent = ei.fields().get_ref(offset);
            if referent.is_null() || self.is_alive(referent) {
                continue;
            }
            if let Ok(ei) = self.modifiable(handle) {
                ei.fields_mut().set_ref(offset, Handle::NULL);
                stats.weak_cleared += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ClassDef, ClassInfo, ClassRegistry, FieldType, Fields, HeapCreateInfo, HeapSettings,
        ReleaseAction, WEAK_REFERENCE,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingRelease(AtomicUsize);

    impl ReleaseAction for CountingRelease {
        fn release(&self, _handle: Handle, _fields: &Fields) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct TestEnv {
        heap: Heap,
        registry: ClassRegistry,
        node: Arc<ClassInfo>,
        releases: Arc<CountingRelease>,
    }

    fn create_test_env() -> TestEnv {
        let settings = HeapSettings::from_create_info(&HeapCreateInfo {
            max_threads: Some(4),
            handles_per_thread: Some(64),
            ..Default::default()
        })
        .unwrap();
        let registry = ClassRegistry::new();
        let releases = Arc::new(CountingRelease::default());
        registry
            .define(
                ClassDef::new("Node")
                    .field("next", FieldType::Reference)
                    .field("value", FieldType::Int)
                    .on_release(releases.clone()),
            )
            .unwrap();
        let node = registry.by_name("Node").unwrap();
        TestEnv {
            heap: Heap::new(settings),
            registry,
            node,
            releases,
        }
    }

    fn link(heap: &mut Heap, from: Handle, to: Handle) {
        heap.modifiable(from)
            .unwrap()
            .fields_mut()
            .set_ref(0, to);
    }

    fn collect(heap: &mut Heap, roots: &RootSet) -> (GcStats, Vec<Handle>) {
        let mut released = Vec::new();
        let stats = heap.collect(roots, &mut |h| released.push(h));
        (stats, released)
    }

    #[test]
    fn unreachable_cycle_is_collected() {
        let mut env = create_test_env();
        let t = ThreadId(0);
        let a = env.heap.new_object(&env.node, t).unwrap();
        let b = env.heap.new_object(&env.node, t).unwrap();
        let c = env.heap.new_object(&env.node, t).unwrap();
        link(&mut env.heap, a, b);
        link(&mut env.heap, b, a);

        let mut roots = RootSet::default();
        roots.mark_thread_root(c, t);
        let (stats, released) = collect(&mut env.heap, &roots);

        assert_eq!(stats.marked, 1);
        assert_eq!(stats.released, 2);
        assert!(released.contains(&a) && released.contains(&b));
        assert!(env.heap.contains(c));
        assert_eq!(env.releases.0.load(Ordering::Relaxed), 2, "release hooks ran");
    }

    #[test]
    fn reachable_cycle_survives_repeated_collections() {
        let mut env = create_test_env();
        let t = ThreadId(0);
        let a = env.heap.new_object(&env.node, t).unwrap();
        let b = env.heap.new_object(&env.node, t).unwrap();
        link(&mut env.heap, a, b);
        link(&mut env.heap, b, a);

        let mut roots = RootSet::default();
        roots.mark_thread_root(a, t);
        for _ in 0..3 {
            let (stats, _) = collect(&mut env.heap, &roots);
            assert_eq!(stats.released, 0);
            assert_eq!(stats.marked, 2);
        }
        assert!(env.heap.contains(a) && env.heap.contains(b));
        assert!(env.heap.is_alive(b));
    }

    #[test]
    fn unreachable_tail_above_a_hole_is_swept() {
        let mut env = create_test_env();
        let t = ThreadId(0);
        let a = env.heap.new_object(&env.node, t).unwrap();
        let b = env.heap.new_object(&env.node, t).unwrap();
        let c = env.heap.new_object(&env.node, t).unwrap();

        let mut roots = RootSet::default();
        roots.mark_thread_root(a, t);
        roots.mark_thread_root(c, t);
        let (_, released) = collect(&mut env.heap, &roots);
        assert_eq!(released, vec![b]);

        let mut roots = RootSet::default();
        roots.mark_thread_root(a, t);
        let (stats, released) = collect(&mut env.heap, &roots);
        assert_eq!(released, vec![c]);
        assert_eq!(stats.released, 1);
        assert_eq!(env.heap.live_count(), 1);
        env.heap.check_consistency().unwrap();

        assert_eq!(env.heap.new_object(&env.node, t).unwrap(), b, "lowest hole reused");
    }

    #[test]
    fn pinned_objects_survive_without_references() {
        let mut env = create_test_env();
        let a = env.heap.new_object(&env.node, ThreadId(1)).unwrap();
        env.heap.pin(a).unwrap();
        collect(&mut env.heap, &RootSet::default());
        assert!(env.heap.contains(a));
        env.heap.unpin(a).unwrap();
        collect(&mut env.heap, &RootSet::default());
        assert!(!env.heap.contains(a), "unpinned garbage is reclaimed");
    }

    #[test]
    fn weak_referent_is_cleared_when_otherwise_unreachable() {
        let mut env = create_test_env();
        let t = ThreadId(0);
        let weak_class = env.registry.by_name(WEAK_REFERENCE).unwrap();
        let weak = env.heap.new_object(&weak_class, t).unwrap();
        let target = env.heap.new_object(&env.node, t).unwrap();
        link(&mut env.heap, weak, target);

        let mut roots = RootSet::default();
        roots.mark_thread_root(weak, t);
        let (stats, _) = collect(&mut env.heap, &roots);

        assert_eq!(stats.weak_cleared, 1);
        assert!(!env.heap.contains(target));
        assert_eq!(
            env.heap.require(weak).unwrap().fields().get_ref(0),
            Handle::NULL,
            "weak slot reads as no object"
        );
    }

    #[test]
    fn weak_referent_with_strong_path_is_kept() {
        let mut env = create_test_env();
        let t = ThreadId(0);
        let weak_class = env.registry.by_name(WEAK_REFERENCE).unwrap();
        let weak = env.heap.new_object(&weak_class, t).unwrap();
        let target = env.heap.new_object(&env.node, t).unwrap();
        link(&mut env.heap, weak, target);

        let mut roots = RootSet::default();
        roots.mark_thread_root(weak, t);
        roots.mark_thread_root(target, t);
        let (stats, _) = collect(&mut env.heap, &roots);
        assert_eq!(stats.weak_cleared, 0);
        assert_eq!(env.heap.require(weak).unwrap().fields().get_ref(0), target);
    }

    #[test]
    fn marking_propagates_referencing_threads() {
        let mut env = create_test_env();
        let a = env.heap.new_object(&env.node, ThreadId(0)).unwrap();
        let b = env.heap.new_object(&env.node, ThreadId(0)).unwrap();
        link(&mut env.heap, a, b);

        let mut roots = RootSet::default();
        roots.mark_thread_root(a, ThreadId(0));
        roots.mark_thread_root(a, ThreadId(1));
        collect(&mut env.heap, &roots);
        assert!(env.heap.require(b).unwrap().is_shared(), "b is reachable from both threads");
    }

    #[test]
    fn gc_marks_do_not_dirty_clean_clusters() {
        let mut env = create_test_env();
        let a = env.heap.new_object(&env.node, ThreadId(0)).unwrap();
        let before = env.heap.memento();
        let mut roots = RootSet::default();
        roots.mark_thread_root(a, ThreadId(0));
        collect(&mut env.heap, &roots);
        let after = env.heap.memento();
        assert!(Arc::ptr_eq(&before, &after));
        env.heap.check_consistency().unwrap();
    }

    #[test]
    fn reachability_query_matches_collection() {
        let mut env = create_test_env();
        let t = ThreadId(0);
        let a = env.heap.new_object(&env.node, t).unwrap();
        let b = env.heap.new_object(&env.node, t).unwrap();
        let garbage = env.heap.new_object(&env.node, t).unwrap();
        link(&mut env.heap, a, b);
        let mut roots = RootSet::default();
        roots.mark_root(a);
        assert!(env.heap.is_reachable(&roots, b));
        assert!(!env.heap.is_reachable(&roots, garbage));
        let reachable = env.heap.reachable_set(&roots);
        collect(&mut env.heap, &roots);
        let survivors: BTreeSet<_> = env.heap.iter().map(|ei| ei.handle()).collect();
        assert_eq!(reachable, survivors);
    }
}
