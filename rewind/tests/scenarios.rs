use std::{cell::RefCell, collections::BTreeSet, rc::Rc, sync::Arc};

use rewind::*;

// ── Helpers ───────────────────────────────────────────────────────────

fn exhaustive() -> EngineCreateInfo {
    EngineCreateInfo {
        search: SearchSettings {
            check_consistency: true,
            stop_on_violation: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn scenario_search(scenario: Scenario, info: &EngineCreateInfo) -> Search {
    let classes = ClassRegistry::new();
    let entry = scenario.build(&classes).unwrap();
    Search::new(classes, entry, info).unwrap()
}

fn program_search(
    info: &EngineCreateInfo,
    build: impl FnOnce(&ClassRegistry) -> Arc<MethodInfo>,
) -> Search {
    let classes = ClassRegistry::new();
    let entry = build(&classes);
    Search::new(classes, entry, info).unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BlockedSnapshot {
    thread: ThreadId,
    blocking: Handle,
    owner: Option<ThreadId>,
    lock_count: u32,
}

#[derive(Debug, Default)]
struct Recorded {
    state_changes: Vec<(ThreadId, ThreadState, ThreadState)>,
    blocked: Vec<BlockedSnapshot>,
    woken: BTreeSet<ThreadId>,
    notify_generators: Vec<usize>,
    picks: Vec<i32>,
    advanced: Vec<(StateId, bool, bool)>,
}

#[derive(Clone, Default)]
struct Recorder(Rc<RefCell<Recorded>>);

impl Listener for Recorder {
    fn thread_state_changed(
        &mut self,
        view: &StateView<'_>,
        thread: ThreadId,
        from: ThreadState,
        to: ThreadState,
    ) {
        let mut rec = self.0.borrow_mut();
        rec.state_changes.push((thread, from, to));
        if to == ThreadState::Blocked {
            let blocking = view.threads().get(thread).unwrap().data().blocking;
            let monitor = view.object(blocking).unwrap().monitor();
            rec.blocked.push(BlockedSnapshot {
                thread,
                blocking,
                owner: monitor.owner(),
                lock_count: monitor.lock_count(),
            });
        }
    }

    fn object_notify(
        &mut self,
        _view: &StateView<'_>,
        _thread: ThreadId,
        _handle: Handle,
        woken: ThreadId,
    ) {
        self.0.borrow_mut().woken.insert(woken);
    }

    fn choice_generator_registered(&mut self, _view: &StateView<'_>, cg: &ChoiceGenerator) {
        let mut rec = self.0.borrow_mut();
        for level in cg.levels().filter(|l| l.kind() == ChoiceKind::Notify) {
            rec.notify_generators.push(level.total());
        }
    }

    fn choice_generator_advanced(&mut self, _view: &StateView<'_>, cg: &ChoiceGenerator) {
        if let Some(value) = cg.choice_of("pick").and_then(Choice::int) {
            self.0.borrow_mut().picks.push(value);
        }
    }

    fn state_advanced(&mut self, view: &StateView<'_>) {
        self.0
            .borrow_mut()
            .advanced
            .push((view.state_id(), view.is_new(), view.is_end()));
    }
}

fn fingerprint(search: &Search) -> Fingerprint {
    StateSerializer::new().fingerprint(
        search.state().kernel(),
        search.state().next_choice_generator(),
    )
}

// ── Lock contention ───────────────────────────────────────────────────

#[test]
fn lock_contention_blocks_then_unblocks_the_second_thread() {
    let mut search = scenario_search(Scenario::LockContention, &exhaustive());
    let recorder = Recorder::default();
    search.add_listener(Box::new(recorder.clone()));
    let report = search.run().unwrap();
    assert!(report.is_ok(), "guarded counter never loses an update: {:?}", report.violations);

    let rec = recorder.0.borrow();
    assert!(!rec.blocked.is_empty(), "some interleaving makes a thread contend");
    for blocked in &rec.blocked {
        let owner = blocked.owner.expect("a blocked thread waits for a held lock");
        assert_ne!(owner, blocked.thread, "owner cannot block on its own lock");
        assert_eq!(blocked.lock_count, 1, "the owner holds the lock once");
        assert!(!blocked.blocking.is_null());
    }
    assert!(
        rec.state_changes
            .iter()
            .any(|&(_, from, to)| from == ThreadState::Blocked && to == ThreadState::Unblocked),
        "the contender is unblocked when the lock is released"
    );
    assert!(report.stats.end_states > 0);
}

#[test]
fn lock_protocol_holds_in_every_state() {
    struct LockChecker(Rc<RefCell<usize>>);

    impl Listener for LockChecker {
        fn state_advanced(&mut self, view: &StateView<'_>) {
            for object in view.heap().iter() {
                let monitor = object.monitor();
                if monitor.lock_count() > 0 {
                    assert!(monitor.owner().is_some(), "{} counted without owner", object.handle());
                    *self.0.borrow_mut() += 1;
                }
            }
        }
    }

    let locked = Rc::new(RefCell::new(0));
    let mut search = scenario_search(Scenario::LockContention, &exhaustive());
    search.add_listener(Box::new(LockChecker(Rc::clone(&locked))));
    search.run().unwrap();
    assert!(*locked.borrow() > 0, "some state holds the lock");
}

// ── Notify ────────────────────────────────────────────────────────────

#[test]
fn notify_with_two_waiters_explores_both_wakeups() {
    let mut search = scenario_search(Scenario::NotifyRace, &exhaustive());
    let recorder = Recorder::default();
    search.add_listener(Box::new(recorder.clone()));
    let report = search.run().unwrap();

    let rec = recorder.0.borrow();
    assert!(rec.notify_generators.contains(&2), "two waiters give a 2-way choice");
    assert_eq!(rec.woken.len(), 2, "both waiters get woken in some path: {:?}", rec.woken);
    assert!(
        report
            .violations
            .iter()
            .all(|c| c.violation.property == "no-deadlock"),
        "the waiter left behind is the only failure"
    );
    assert!(!report.is_ok());
}

fn lone_timed_waiter(classes: &ClassRegistry) -> Arc<MethodInfo> {
    let mut b = MethodBuilder::new("main");
    b.ops([
        Op::New(OBJECT.to_owned()),
        Op::Dup,
        Op::MonitorEnter,
        Op::Dup,
        Op::TimedWait,
        Op::MonitorExit,
        Op::PushInt(0),
        Op::Assert("woke up after the timeout".to_owned()),
        Op::Return,
    ]);
    b.register(classes).unwrap()
}

#[test]
fn lone_timed_waiter_times_out() {
    let mut search = program_search(&exhaustive(), lone_timed_waiter);
    let recorder = Recorder::default();
    search.add_listener(Box::new(recorder.clone()));
    let report = search.run().unwrap();

    assert!(
        recorder.0.borrow().state_changes.iter().any(|&(_, from, to)| {
            from == ThreadState::TimeoutWaiting && to == ThreadState::TimedOut
        }),
        "the timeout is offered as a scheduling choice"
    );
    assert_eq!(report.violations.len(), 1, "{:?}", report.violations);
    let found = &report.violations[0];
    assert_eq!(found.violation.property, "no-uncaught-exception");
    assert!(found.violation.message.contains(ASSERTION_ERROR), "{}", found.violation.message);
}

#[test]
fn lone_waiter_without_timeouts_is_a_deadlock() {
    let info = EngineCreateInfo {
        search: SearchSettings {
            timeout_choices: false,
            ..exhaustive().search
        },
        ..Default::default()
    };
    let report = program_search(&info, lone_timed_waiter).run().unwrap();
    assert_eq!(report.violations.len(), 1, "{:?}", report.violations);
    assert_eq!(report.violations[0].violation.property, "no-deadlock");
}

// ── Weak references ───────────────────────────────────────────────────

#[test]
fn weak_reference_is_cleared_once_referent_is_unreachable() {
    let mut search = program_search(&exhaustive(), |classes| {
        let mut b = MethodBuilder::new("main");
        let cleared = b.create_label();
        b.ops([
            Op::New(OBJECT.to_owned()),
            Op::NewWeakRef,
            Op::StoreRef(0),
            Op::Collect,
            Op::LoadRef(0),
            Op::GetField {
                class: WEAK_REFERENCE.to_owned(),
                field: "referent".to_owned(),
            },
        ])
        .jump(Op::IfNull, cleared);
        b.op(Op::PushInt(0)).op(Op::Assert("referent survived".to_owned()));
        b.bind(cleared).unwrap();
        b.op(Op::Return);
        b.register(classes).unwrap()
    });
    let report = search.run().unwrap();
    assert!(report.is_ok(), "{:?}", report.violations);
    assert!(report.stats.collections > 0);
}

#[test]
fn weak_reference_keeps_a_strongly_held_referent() {
    let mut search = program_search(&exhaustive(), |classes| {
        let mut b = MethodBuilder::new("main");
        let kept = b.create_label();
        b.ops([
            Op::New(OBJECT.to_owned()),
            Op::StoreRef(1),
            Op::LoadRef(1),
            Op::NewWeakRef,
            Op::StoreRef(0),
            Op::Collect,
            Op::LoadRef(0),
            Op::GetField {
                class: WEAK_REFERENCE.to_owned(),
                field: "referent".to_owned(),
            },
            Op::LoadRef(1),
        ])
        .jump(Op::IfRefEq, kept);
        b.op(Op::PushInt(0)).op(Op::Assert("referent lost".to_owned()));
        b.bind(kept).unwrap();
        b.op(Op::Return);
        b.register(classes).unwrap()
    });
    assert!(search.run().unwrap().is_ok());
}

// ── State matching ────────────────────────────────────────────────────

#[test]
fn revisit_detection_classifies_the_second_occurrence_as_visited() {
    // both coin values lead to the same end state
    let mut search = program_search(&exhaustive(), |classes| {
        let mut b = MethodBuilder::new("main");
        b.ops([Op::ChooseBool { id: "coin".to_owned() }, Op::Pop, Op::Return]);
        b.register(classes).unwrap()
    });
    let recorder = Recorder::default();
    search.add_listener(Box::new(recorder.clone()));
    let report = search.run().unwrap();

    let rec = recorder.0.borrow();
    let ends: Vec<_> = rec.advanced.iter().filter(|(_, _, end)| *end).collect();
    assert_eq!(ends.len(), 2, "one end state per coin value");
    assert_eq!(ends[0].0, ends[1].0, "same fingerprint, same state id");
    assert!(ends[0].1, "first occurrence is new");
    assert!(!ends[1].1, "second occurrence is visited");
    assert_eq!(report.stats.visited_states, 1);
}

#[test]
fn stateless_search_never_reports_a_revisit() {
    let info = EngineCreateInfo {
        search: SearchSettings {
            stateless: true,
            ..exhaustive().search
        },
        ..Default::default()
    };
    let mut search = program_search(&info, |classes| {
        let mut b = MethodBuilder::new("main");
        b.ops([Op::ChooseBool { id: "coin".to_owned() }, Op::Pop, Op::Return]);
        b.register(classes).unwrap()
    });
    let report = search.run().unwrap();
    assert_eq!(report.stats.visited_states, 0);
    assert_eq!(report.stats.end_states, 2);
}

#[test]
fn exact_and_hashed_matching_agree() {
    let run = |exact_matching: bool| {
        let info = EngineCreateInfo {
            search: SearchSettings {
                exact_matching,
                ..exhaustive().search
            },
            ..Default::default()
        };
        scenario_search(Scenario::LockContention, &info).run().unwrap().stats
    };
    let (hashed, exact) = (run(false), run(true));
    assert_eq!(hashed.new_states, exact.new_states);
    assert_eq!(hashed.visited_states, exact.visited_states);
}

// ── Choices ───────────────────────────────────────────────────────────

#[test]
fn every_choice_is_taken_exactly_once() {
    let mut search = program_search(&exhaustive(), |classes| {
        classes
            .define(ClassDef::new("Data").static_field("value", FieldType::Int))
            .unwrap();
        let mut b = MethodBuilder::new("main");
        b.ops([
            Op::ChooseInt {
                id: "pick".to_owned(),
                min: 0,
                max: 2,
            },
            Op::PutStatic {
                class: "Data".to_owned(),
                field: "value".to_owned(),
            },
            Op::Return,
        ]);
        b.register(classes).unwrap()
    });
    let recorder = Recorder::default();
    search.add_listener(Box::new(recorder.clone()));
    let report = search.run().unwrap();

    let picks = &recorder.0.borrow().picks;
    assert_eq!(picks.len(), 3, "one round trip per choice: {picks:?}");
    let distinct: BTreeSet<_> = picks.iter().copied().collect();
    assert_eq!(distinct, BTreeSet::from([0, 1, 2]));
    assert_eq!(report.stats.end_states, 3, "each value is a distinct end state");
}

#[test]
fn depth_limit_cuts_the_search() {
    let info = EngineCreateInfo {
        search: SearchSettings {
            max_depth: 2,
            ..exhaustive().search
        },
        ..Default::default()
    };
    let report = scenario_search(Scenario::LockContention, &info).run().unwrap();
    assert!(report.stats.max_depth <= 2);
    assert_eq!(report.stats.end_states, 0, "no path finishes within two transitions");
}

// ── Snapshots ─────────────────────────────────────────────────────────

#[test]
fn restoring_a_checkpoint_reproduces_the_state() {
    let mut search = scenario_search(Scenario::LockContention, &exhaustive());
    assert!(search.forward().unwrap());
    let checkpoint = search.checkpoint();
    let before = fingerprint(&search);
    let handles: Vec<Handle> = search.state().kernel().heap.iter().map(|o| o.handle()).collect();
    let states: Vec<ThreadState> = search
        .state()
        .kernel()
        .threads
        .iter()
        .map(|t| t.state())
        .collect();

    for _ in 0..3 {
        if !search.forward().unwrap() {
            break;
        }
    }
    assert_ne!(fingerprint(&search), before, "the program moved on");

    search.restore_checkpoint(&checkpoint);
    assert_eq!(search.state().id(), checkpoint.id());
    assert_eq!(fingerprint(&search), before);
    let restored: Vec<Handle> = search.state().kernel().heap.iter().map(|o| o.handle()).collect();
    assert_eq!(restored, handles, "handles are stable across restore");
    let restored_states: Vec<ThreadState> = search
        .state()
        .kernel()
        .threads
        .iter()
        .map(|t| t.state())
        .collect();
    assert_eq!(restored_states, states);
    assert_eq!(search.path().len(), checkpoint.path().len());

    // exploration continues from the checkpoint
    assert!(search.run().unwrap().is_ok());
}

#[test]
fn mutating_a_restored_object_leaves_the_snapshot_intact() {
    let classes = ClassRegistry::new();
    classes
        .define(ClassDef::new("Cell").field("value", FieldType::Int))
        .unwrap();
    let class = classes.by_name("Cell").unwrap();
    let mut kernel = KernelState::new(classes, HeapSettings::default());
    let cell = kernel.new_object(&class, ThreadId(0)).unwrap();
    kernel.heap.pin(cell).unwrap();
    let snapshot = kernel.memento();

    for value in [7, 9] {
        kernel.heap.modifiable(cell).unwrap().fields_mut().set_int(0, value);
        assert_eq!(kernel.heap.require(cell).unwrap().fields().get_int(0), value);
        kernel.restore(&snapshot);
        assert_eq!(
            kernel.heap.require(cell).unwrap().fields().get_int(0),
            0,
            "snapshot still holds the original value"
        );
    }
}

// ── Collector ─────────────────────────────────────────────────────────

#[test]
fn collector_keeps_exactly_the_reachable_objects() {
    let classes = ClassRegistry::new();
    classes
        .define(
            ClassDef::new("Node")
                .field("next", FieldType::Reference)
                .field("other", FieldType::Reference),
        )
        .unwrap();
    let node = classes.by_name("Node").unwrap();
    let next = node.instance_field("next").unwrap().offset;
    let other = node.instance_field("other").unwrap().offset;
    let mut heap = Heap::new(HeapSettings::default());
    let alloc = |heap: &mut Heap, thread: u32| heap.new_object(&node, ThreadId(thread)).unwrap();

    // a <-> b cycle from a root, c -> d garbage cycle, e pinned -> f shared
    let (a, b, c, d, e, f) = (
        alloc(&mut heap, 0),
        alloc(&mut heap, 0),
        alloc(&mut heap, 0),
        alloc(&mut heap, 1),
        alloc(&mut heap, 1),
        alloc(&mut heap, 1),
    );
    let link = |heap: &mut Heap, from: Handle, offset: usize, to: Handle| {
        heap.modifiable(from).unwrap().fields_mut().set_ref(offset, to);
    };
    link(&mut heap, a, next, b);
    link(&mut heap, b, next, a);
    link(&mut heap, b, other, f);
    link(&mut heap, c, next, d);
    link(&mut heap, d, next, c);
    link(&mut heap, e, next, f);
    heap.pin(e).unwrap();

    let mut roots = RootSet::default();
    roots.mark_thread_root(a, ThreadId(0));
    let mut released = Vec::new();
    let stats = heap.collect(&roots, &mut |h| released.push(h));

    for live in [a, b, e, f] {
        assert!(heap.contains(live), "{live} is reachable and must survive");
    }
    for dead in [c, d] {
        assert!(!heap.contains(dead), "{dead} is garbage");
    }
    released.sort();
    assert_eq!(released, vec![c, d]);
    assert_eq!(stats.released, 2);
    assert!(heap.require(f).unwrap().is_shared(), "f is reached from two threads");
}

#[test]
fn oversized_array_throws_out_of_memory_into_the_program() {
    let mut search = program_search(&exhaustive(), |classes| {
        let mut b = MethodBuilder::new("main");
        b.ops([
            Op::PushInt(i32::MAX),
            Op::NewArray(ArrayType::Long),
            Op::Pop,
            Op::Return,
        ]);
        b.register(classes).unwrap()
    });
    let report = search.run().unwrap();
    assert_eq!(report.violations.len(), 1, "{:?}", report.violations);
    let found = &report.violations[0];
    assert_eq!(found.violation.property, "no-uncaught-exception");
    assert!(
        found.violation.message.contains(OUT_OF_MEMORY_ERROR),
        "{}",
        found.violation.message
    );
}

// ── Violations and traces ─────────────────────────────────────────────

#[test]
fn opposite_lock_order_is_reported_as_deadlock() {
    let report = scenario_search(Scenario::Deadlock, &EngineCreateInfo::default())
        .run()
        .unwrap();
    assert!(report.stopped_early, "stops on the first violation by default");
    assert_eq!(report.violations.len(), 1);
    let found = &report.violations[0];
    assert_eq!(found.violation.property, "no-deadlock");
    assert!(!found.trace.is_empty());
}

#[test]
fn lost_update_is_found_and_replays_from_its_trace() {
    let report = scenario_search(Scenario::RacyCounter, &EngineCreateInfo::default())
        .run()
        .unwrap();
    let found = report.violations.first().expect("lost update is reachable");
    assert_eq!(found.violation.property, "no-uncaught-exception");
    assert!(found.violation.message.contains(ASSERTION_ERROR), "{}", found.violation.message);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("racy.json");
    found.trace.save(&path).unwrap();
    let trace = Trace::load(&path).unwrap();
    assert_eq!(trace, found.trace);

    let mut replay = scenario_search(Scenario::RacyCounter, &EngineCreateInfo::default());
    let replayed = replay.replay(&trace).unwrap();
    assert_eq!(replayed.violations.len(), 1, "the replay hits the same failure");
    assert_eq!(replayed.violations[0].violation, found.violation);
    assert_eq!(replay.path(), &trace);
}

#[test]
fn replay_rejects_a_choice_the_program_does_not_offer() {
    let mut trace = Trace::new();
    trace.push(TransitionRecord {
        thread: ThreadId(5),
        choices: vec![ChoiceSpec {
            generator: "root".to_owned(),
            kind: ChoiceKind::Scheduling,
            index: 0,
            total: 1,
            choice: Choice::Thread(ThreadId(5)),
        }],
    });
    let mut search = scenario_search(Scenario::Deadlock, &EngineCreateInfo::default());
    assert!(matches!(
        search.replay(&trace),
        Err(EngineError::ReplayDiverged { index: 0, .. })
    ));
}

#[test]
fn listener_violation_is_recorded_with_its_path() {
    struct NoThreads;

    impl Listener for NoThreads {
        fn thread_started(&mut self, view: &StateView<'_>, thread: ThreadId) {
            view.report_violation("no-threads", format!("{thread} started"));
        }
    }

    let mut search = scenario_search(Scenario::LockContention, &EngineCreateInfo::default());
    search.add_listener(Box::new(NoThreads));
    let report = search.run().unwrap();
    assert!(report.stopped_early);
    let found = &report.violations[0];
    assert_eq!(found.violation.property, "no-threads");
    assert_eq!(found.trace.len(), 1, "main starts the worker in the first transition");
}
