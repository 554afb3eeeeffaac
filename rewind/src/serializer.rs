use std::{
    collections::{HashMap, VecDeque},
    fmt,
    hash::BuildHasher,
};

use crate::{
    Choice, ChoiceGenerator, ChoiceKind, ElementInfo, FieldsLayout, Handle, KernelState,
    ThreadInfo,
};

/// 64-bit digest of a canonical state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub u64);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

const NULL_REF: i32 = -1;
const DEAD_REF: i32 = -2;
const SEPARATOR: i32 = i32::MIN;

/// Turns a kernel state into a canonical slot sequence.
///
/// Handles are renumbered in the order a breadth-first walk from the roots
/// reaches them: threads (by id), static storage (by class id), then pinned
/// objects (by handle). Two states that differ only in which free slots the
/// allocator picked, or in unreachable garbage, serialize identically.
#[derive(Debug)]
pub struct StateSerializer {
    canonical: HashMap<Handle, i32, ahash::RandomState>,
    queue: VecDeque<Handle>,
    out: Vec<i32>,
    hasher: ahash::RandomState,
}

impl Default for StateSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl StateSerializer {
    pub fn new() -> Self {
        Self {
            canonical: HashMap::with_hasher(ahash::RandomState::new()),
            queue: VecDeque::new(),
            out: Vec::new(),
            // fixed seeds keep fingerprints comparable between runs
            hasher: ahash::RandomState::with_seeds(
                0x7265_7769_6e64_0001,
                0x9e37_79b9_7f4a_7c15,
                0xc2b2_ae3d_27d4_eb4f,
                0x1656_67b1_9e37_79f9,
            ),
        }
    }

    pub fn serialize(&mut self, kernel: &KernelState, next: Option<&ChoiceGenerator>) -> &[i32] {
        self.canonical.clear();
        self.queue.clear();
        self.out.clear();

        for thread in kernel.threads.iter() {
            self.write_thread(thread);
        }
        self.out.push(SEPARATOR);

        let mut statics: Vec<&ElementInfo> = kernel.heap.static_records().collect();
        statics.sort_by_key(|ei| ei.class().id);
        for ei in statics {
            self.out.push(ei.class().id.0 as i32);
            self.write_fields(ei);
        }
        self.out.push(SEPARATOR);

        let mut pinned: Vec<Handle> = kernel.heap.pinned().collect();
        pinned.sort_unstable();
        for handle in pinned {
            let id = self.canonicalize(handle);
            self.out.push(id);
        }
        self.out.push(SEPARATOR);

        while let Some(handle) = self.queue.pop_front() {
            match kernel.heap.get(handle) {
                Some(ei) => self.write_object(ei),
                None => self.out.push(DEAD_REF),
            }
        }
        self.out.push(SEPARATOR);

        if let Some(cg) = next {
            self.write_choice_generator(cg);
        }
        &self.out
    }

    pub fn fingerprint(&mut self, kernel: &KernelState, next: Option<&ChoiceGenerator>) -> Fingerprint {
        self.serialize(kernel, next);
        Fingerprint(self.hash(&self.out))
    }

    pub fn hash(&self, values: &[i32]) -> u64 {
        BuildHasher::hash_one(&self.hasher, values)
    }

    fn canonicalize(&mut self, handle: Handle) -> i32 {
        if handle.is_null() {
            return NULL_REF;
        }
        let next = self.canonical.len() as i32;
        *self.canonical.entry(handle).or_insert_with(|| {
            self.queue.push_back(handle);
            next
        })
    }

    fn write_thread(&mut self, thread: &ThreadInfo) {
        let data = thread.data();
        self.out.extend([
            thread.id().0 as i32,
            data.state.as_i32(),
            data.suspend_count as i32,
            data.lock_count_before_wait as i32,
            i32::from(data.interrupted),
            i32::from(data.daemon),
            i32::from(data.resuming),
            thread.entry().map_or(-1, |m| m.id.0 as i32),
        ]);
        for handle in [thread.object(), thread.runnable(), data.blocking] {
            let id = self.canonicalize(handle);
            self.out.push(id);
        }
        self.out.push(data.locked_objects.len() as i32);
        for &locked in &data.locked_objects {
            let id = self.canonicalize(locked);
            self.out.push(id);
        }
        self.out.push(thread.depth() as i32);
        for frame in thread.frames() {
            self.out.extend([
                frame.method().id.0 as i32,
                frame.pc() as i32,
                frame.operand_count() as i32,
            ]);
            let lock = self.canonicalize(frame.lock());
            self.out.push(lock);
            for (value, is_ref) in frame.used_slots() {
                if is_ref {
                    let id = self.canonicalize(Handle::from_slot(value));
                    self.out.extend([1, id]);
                } else {
                    self.out.extend([0, value]);
                }
            }
        }
    }

    fn write_fields(&mut self, ei: &ElementInfo) {
        let fields = ei.fields();
        let offsets = match fields.layout() {
            FieldsLayout::Instance => ei.class().instance_reference_offsets(),
            FieldsLayout::Statics => ei.class().static_reference_offsets(),
            FieldsLayout::Array(_) => &[][..],
        };
        let mut is_ref = vec![false; fields.len()];
        fields.for_each_reference_slot(offsets, |offset| is_ref[offset] = true);
        self.out.push(fields.len() as i32);
        for (offset, &value) in fields.values().iter().enumerate() {
            if is_ref[offset] {
                let id = self.canonicalize(Handle::from_slot(value));
                self.out.push(id);
            } else {
                self.out.push(value);
            }
        }
    }

    fn write_object(&mut self, ei: &ElementInfo) {
        let monitor = ei.monitor();
        self.out.extend([
            ei.class().id.0 as i32,
            i32::from(ei.is_constructed()),
            i32::from(ei.is_shared()),
            ei.pin_count() as i32,
            monitor.lock_count() as i32,
            monitor.owner().map_or(-1, |t| t.0 as i32),
            monitor.blocked().len() as i32,
        ]);
        self.out.extend(monitor.blocked().iter().map(|t| t.0 as i32));
        self.out.push(monitor.waiting().len() as i32);
        self.out.extend(monitor.waiting().iter().map(|t| t.0 as i32));
        self.write_fields(ei);
    }

    fn write_choice_generator(&mut self, cg: &ChoiceGenerator) {
        for level in cg.levels() {
            let kind = match level.kind() {
                ChoiceKind::Scheduling => 0,
                ChoiceKind::Notify => 1,
                ChoiceKind::Data => 2,
            };
            self.out.extend([kind, level.owner().0 as i32, level.total() as i32]);
            self.out.extend(level.choices().iter().map(|choice| match *choice {
                Choice::Thread(t) => t.0 as i32,
                Choice::Int(v) => v,
                Choice::Bool(b) => i32::from(b),
            }));
            let id = self.hash_str(level.id());
            self.out.push(id);
        }
    }

    fn hash_str(&self, text: &str) -> i32 {
        BuildHasher::hash_one(&self.hasher, text) as i32
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{ClassDef, ClassRegistry, FieldType, HeapSettings, MethodInfo, OBJECT, ThreadId};

    fn create_kernel() -> (KernelState, ThreadId) {
        let registry = ClassRegistry::new();
        registry
            .define(ClassDef::new("Holder").static_field("slot", FieldType::Reference))
            .unwrap();
        let mut kernel = KernelState::new(registry, HeapSettings::default());
        let mut entry = MethodInfo::new("main", Vec::new());
        entry.max_locals = 1;
        let main = kernel.create_main_thread(Arc::new(entry)).unwrap();
        (kernel, main)
    }

    fn store_static(kernel: &mut KernelState, value: Handle) {
        let holder = kernel.classes().by_name("Holder").unwrap();
        let offset = holder.static_field("slot").unwrap().offset;
        kernel.heap.initialize_statics(&holder);
        kernel
            .heap
            .statics_mut(holder.id)
            .unwrap()
            .fields_mut()
            .set_ref(offset, value);
    }

    #[test]
    fn handle_numbering_and_garbage_do_not_matter() {
        let (mut a, main_a) = create_kernel();
        let object = a.classes().by_name(OBJECT).unwrap();
        let kept = a.new_object(&object, main_a).unwrap();
        store_static(&mut a, kept);

        let (mut b, main_b) = create_kernel();
        let garbage = b.new_object(&object, main_b).unwrap();
        let kept_b = b.new_object(&object, main_b).unwrap();
        assert_ne!(kept, kept_b, "allocation order should differ");
        assert_ne!(garbage, kept_b);
        store_static(&mut b, kept_b);

        let mut serializer = StateSerializer::new();
        let fa = serializer.fingerprint(&a, None);
        let fb = serializer.fingerprint(&b, None);
        assert_eq!(fa, fb, "states differ only in handles and garbage");
    }

    #[test]
    fn field_values_change_the_fingerprint() {
        let (mut kernel, main) = create_kernel();
        let holder = kernel.classes().by_name("Holder").unwrap();
        let object = kernel.classes().by_name(OBJECT).unwrap();
        let kept = kernel.new_object(&object, main).unwrap();
        store_static(&mut kernel, kept);
        let mut serializer = StateSerializer::new();
        let before = serializer.fingerprint(&kernel, None);

        store_static(&mut kernel, Handle::NULL);
        let after = serializer.fingerprint(&kernel, None);
        assert_ne!(before, after, "clearing the static must be visible");
        assert!(kernel.heap.statics(holder.id).is_some());
    }

    #[test]
    fn pending_choice_generator_is_part_of_the_state() {
        let (kernel, main) = create_kernel();
        let mut serializer = StateSerializer::new();
        let bare = serializer.fingerprint(&kernel, None);
        let cg = ChoiceGenerator::boolean("flag", main);
        let with_cg = serializer.fingerprint(&kernel, Some(&cg));
        assert_ne!(bare, with_cg);
        assert_eq!(with_cg, serializer.fingerprint(&kernel, Some(&cg.clone())));
    }

    #[test]
    fn fingerprint_displays_as_hex() {
        assert_eq!(Fingerprint(0xab).to_string(), "00000000000000ab");
    }
}
