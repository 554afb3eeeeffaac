use std::{fmt, str::FromStr, sync::Arc};

use crate::{ClassDef, ClassRegistry, EngineError, FieldType, MethodBuilder, MethodInfo, OBJECT, Op};

/// Small concurrent programs bundled with the checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scenario {
    /// Two threads increment a counter under one lock. Clean.
    LockContention,
    /// Two waiters, a single notify. One waiter is never woken.
    NotifyRace,
    /// Two threads take two locks in opposite order.
    Deadlock,
    /// Two threads increment a counter without locking, then main asserts
    /// the total.
    RacyCounter,
}

impl Scenario {
    pub const ALL: [Scenario; 4] = [
        Scenario::LockContention,
        Scenario::NotifyRace,
        Scenario::Deadlock,
        Scenario::RacyCounter,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Scenario::LockContention => "lock-contention",
            Scenario::NotifyRace => "notify-race",
            Scenario::Deadlock => "deadlock",
            Scenario::RacyCounter => "racy-counter",
        }
    }

    /// Whether exploring the scenario finds a property violation.
    pub fn is_buggy(self) -> bool {
        !matches!(self, Scenario::LockContention)
    }

    /// Defines the scenario's classes and methods in `classes` and returns
    /// the entry method of the main thread.
    pub fn build(self, classes: &ClassRegistry) -> Result<Arc<MethodInfo>, EngineError> {
        match self {
            Scenario::LockContention => lock_contention(classes),
            Scenario::NotifyRace => notify_race(classes),
            Scenario::Deadlock => deadlock(classes),
            Scenario::RacyCounter => racy_counter(classes),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scenario::ALL
            .into_iter()
            .find(|scenario| scenario.name() == s)
            .ok_or_else(|| {
                let known: Vec<_> = Scenario::ALL.iter().map(|s| s.name()).collect();
                format!("unknown scenario `{s}`, expected one of {}", known.join(", "))
            })
    }
}

fn get_static(class: &str, field: &str) -> Op {
    Op::GetStatic {
        class: class.to_owned(),
        field: field.to_owned(),
    }
}

fn put_static(class: &str, field: &str) -> Op {
    Op::PutStatic {
        class: class.to_owned(),
        field: field.to_owned(),
    }
}

fn new_thread(method: &str) -> [Op; 2] {
    [
        Op::PushNull,
        Op::NewThread {
            method: method.to_owned(),
            daemon: false,
        },
    ]
}

/// Pops an int and fails with `AssertionError` unless it equals `expected`.
fn expect_int(b: &mut MethodBuilder, expected: i32, message: &str) -> Result<(), EngineError> {
    let ok = b.create_label();
    b.op(Op::PushInt(expected)).jump(Op::IfEq, ok);
    b.op(Op::PushInt(0)).op(Op::Assert(message.to_owned()));
    b.bind(ok)?;
    Ok(())
}

// ── Lock contention ───────────────────────────────────────────────────

const SHARED: &str = "Shared";

fn lock_contention(classes: &ClassRegistry) -> Result<Arc<MethodInfo>, EngineError> {
    classes.define(
        ClassDef::new(SHARED)
            .static_field("lock", FieldType::Reference)
            .static_field("counter", FieldType::Int),
    )?;

    // Yields while holding the lock so the other thread can contend.
    let mut critical = MethodBuilder::new("critical");
    critical.ops([
        get_static(SHARED, "lock"),
        Op::MonitorEnter,
        get_static(SHARED, "counter"),
        Op::Yield,
        Op::PushInt(1),
        Op::Add,
        put_static(SHARED, "counter"),
        get_static(SHARED, "lock"),
        Op::MonitorExit,
        Op::Return,
    ]);
    critical.register(classes)?;

    let mut worker = MethodBuilder::new("worker");
    worker.op(Op::Invoke("critical".to_owned())).op(Op::Return);
    worker.register(classes)?;

    let mut main = MethodBuilder::new("main");
    main.op(Op::New(OBJECT.to_owned()))
        .op(put_static(SHARED, "lock"))
        .ops(new_thread("worker"))
        .ops([
            Op::StoreRef(0),
            Op::LoadRef(0),
            Op::Start,
            Op::Invoke("critical".to_owned()),
            Op::LoadRef(0),
            Op::Join,
            get_static(SHARED, "counter"),
        ]);
    expect_int(&mut main, 2, "both increments are visible")?;
    main.op(Op::Return);
    Ok(main.register(classes)?)
}

// ── Notify race ───────────────────────────────────────────────────────

const MAILBOX: &str = "Mailbox";

fn notify_race(classes: &ClassRegistry) -> Result<Arc<MethodInfo>, EngineError> {
    classes.define(ClassDef::new(MAILBOX).static_field("lock", FieldType::Reference))?;

    let mut waiter = MethodBuilder::new("waiter");
    waiter.ops([
        get_static(MAILBOX, "lock"),
        Op::Dup,
        Op::MonitorEnter,
        Op::Dup,
        Op::Wait,
        Op::MonitorExit,
        Op::Return,
    ]);
    waiter.register(classes)?;

    let mut main = MethodBuilder::new("main");
    main.op(Op::New(OBJECT.to_owned()))
        .op(put_static(MAILBOX, "lock"))
        .ops(new_thread("waiter"))
        .op(Op::Start)
        .ops(new_thread("waiter"))
        .op(Op::Start)
        .ops([
            get_static(MAILBOX, "lock"),
            Op::Dup,
            Op::MonitorEnter,
            Op::Dup,
            Op::Notify,
            Op::MonitorExit,
            Op::Return,
        ]);
    Ok(main.register(classes)?)
}

// ── Deadlock ──────────────────────────────────────────────────────────

const LOCKS: &str = "Locks";

fn nested_locking(
    classes: &ClassRegistry,
    name: &str,
    outer: &str,
    inner: &str,
) -> Result<(), EngineError> {
    let mut b = MethodBuilder::new(name);
    b.ops([
        get_static(LOCKS, outer),
        Op::MonitorEnter,
        get_static(LOCKS, inner),
        Op::MonitorEnter,
        get_static(LOCKS, inner),
        Op::MonitorExit,
        get_static(LOCKS, outer),
        Op::MonitorExit,
        Op::Return,
    ]);
    b.register(classes)?;
    Ok(())
}

fn deadlock(classes: &ClassRegistry) -> Result<Arc<MethodInfo>, EngineError> {
    classes.define(
        ClassDef::new(LOCKS)
            .static_field("a", FieldType::Reference)
            .static_field("b", FieldType::Reference),
    )?;
    nested_locking(classes, "lock_ab", "a", "b")?;
    nested_locking(classes, "lock_ba", "b", "a")?;

    let mut main = MethodBuilder::new("main");
    main.ops([
        Op::New(OBJECT.to_owned()),
        put_static(LOCKS, "a"),
        Op::New(OBJECT.to_owned()),
        put_static(LOCKS, "b"),
    ])
    .ops(new_thread("lock_ab"))
    .op(Op::Start)
    .ops(new_thread("lock_ba"))
    .op(Op::Start)
    .op(Op::Return);
    Ok(main.register(classes)?)
}

// ── Racy counter ──────────────────────────────────────────────────────

const COUNTER: &str = "Counter";

fn racy_counter(classes: &ClassRegistry) -> Result<Arc<MethodInfo>, EngineError> {
    classes.define(ClassDef::new(COUNTER).static_field("value", FieldType::Int))?;

    // Read, yield, write back: the update can be lost.
    let mut increment = MethodBuilder::new("increment");
    increment.ops([
        get_static(COUNTER, "value"),
        Op::Yield,
        Op::PushInt(1),
        Op::Add,
        put_static(COUNTER, "value"),
        Op::Return,
    ]);
    increment.register(classes)?;

    let mut main = MethodBuilder::new("main");
    main.ops(new_thread("increment"))
        .ops([Op::StoreRef(0), Op::LoadRef(0), Op::Start])
        .ops(new_thread("increment"))
        .ops([
            Op::StoreRef(1),
            Op::LoadRef(1),
            Op::Start,
            Op::LoadRef(0),
            Op::Join,
            Op::LoadRef(1),
            Op::Join,
            get_static(COUNTER, "value"),
        ]);
    expect_int(&mut main, 2, "lost update")?;
    main.op(Op::Return);
    Ok(main.register(classes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse_back() {
        for scenario in Scenario::ALL {
            assert_eq!(scenario.name().parse::<Scenario>(), Ok(scenario));
        }
        let err = "livelock".parse::<Scenario>().unwrap_err();
        assert!(err.contains("racy-counter"), "lists the known names: {err}");
    }

    #[test]
    fn every_scenario_builds_its_main_method() {
        for scenario in Scenario::ALL {
            let classes = ClassRegistry::new();
            let entry = scenario.build(&classes).unwrap();
            assert_eq!(entry.name, "main", "{scenario}");
            assert_eq!(classes.method_by_name("main").unwrap().id, entry.id);
        }
    }

    #[test]
    fn scenario_classes_are_defined_once_per_registry() {
        let classes = ClassRegistry::new();
        Scenario::Deadlock.build(&classes).unwrap();
        assert!(Scenario::Deadlock.build(&classes).is_err());
    }
}
