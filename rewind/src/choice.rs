use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::ThreadId;

/// One alternative at a decision point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Choice {
    Thread(ThreadId),
    Int(i32),
    Bool(bool),
}

impl Choice {
    pub fn thread(self) -> Option<ThreadId> {
        match self {
            Choice::Thread(t) => Some(t),
            _ => None,
        }
    }

    pub fn int(self) -> Option<i32> {
        match self {
            Choice::Int(v) => Some(v),
            Choice::Bool(b) => Some(b as i32),
            Choice::Thread(_) => None,
        }
    }
}

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Choice::Thread(t) => write!(f, "{t}"),
            Choice::Int(v) => write!(f, "{v}"),
            Choice::Bool(b) => write!(f, "{b}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChoiceKind {
    /// Which runnable thread executes the next transition.
    Scheduling,
    /// Which waiter a `notify` wakes.
    Notify,
    /// A data value requested by the program.
    Data,
}

/// The choice a generator had made, as recorded in traces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceSpec {
    pub generator: String,
    pub kind: ChoiceKind,
    pub index: usize,
    pub total: usize,
    pub choice: Choice,
}

/// Enumerates the alternatives at one decision point.
///
/// Generators registered by the same instruction are cascaded behind the
/// first one and enumerated as a product: the last generator varies
/// fastest. The generator is cloned into the system memento, so the
/// position survives backtracking while the alternatives are shared.
#[derive(Debug, Clone)]
pub struct ChoiceGenerator {
    id: Arc<str>,
    kind: ChoiceKind,
    owner: ThreadId,
    choices: Arc<[Choice]>,
    current: Option<usize>,
    /// Pinned position during replay.
    forced: Option<usize>,
    cascaded: bool,
    cascade: Vec<ChoiceGenerator>,
}

impl ChoiceGenerator {
    pub fn new(
        id: impl Into<Arc<str>>,
        kind: ChoiceKind,
        owner: ThreadId,
        choices: impl Into<Arc<[Choice]>>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            owner,
            choices: choices.into(),
            current: None,
            forced: None,
            cascaded: false,
            cascade: Vec::new(),
        }
    }

    pub fn scheduling(id: impl Into<Arc<str>>, owner: ThreadId, threads: &[ThreadId]) -> Self {
        let choices: Vec<Choice> = threads.iter().copied().map(Choice::Thread).collect();
        Self::new(id, ChoiceKind::Scheduling, owner, choices)
    }

    pub fn notify(id: impl Into<Arc<str>>, owner: ThreadId, waiters: &[ThreadId]) -> Self {
        let choices: Vec<Choice> = waiters.iter().copied().map(Choice::Thread).collect();
        Self::new(id, ChoiceKind::Notify, owner, choices)
    }

    /// Every integer in `min..=max`.
    pub fn int_range(id: impl Into<Arc<str>>, owner: ThreadId, min: i32, max: i32) -> Self {
        let choices: Vec<Choice> = (min..=max).map(Choice::Int).collect();
        Self::new(id, ChoiceKind::Data, owner, choices)
    }

    pub fn boolean(id: impl Into<Arc<str>>, owner: ThreadId) -> Self {
        Self::new(
            id,
            ChoiceKind::Data,
            owner,
            vec![Choice::Bool(false), Choice::Bool(true)],
        )
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn kind(&self) -> ChoiceKind {
        self.kind
    }

    /// Thread that registered the generator.
    #[inline]
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    #[inline]
    pub fn choices(&self) -> &[Choice] {
        &self.choices
    }

    #[inline]
    pub fn total(&self) -> usize {
        self.choices.len()
    }

    #[inline]
    pub fn is_cascaded(&self) -> bool {
        self.cascaded
    }

    #[inline]
    pub fn cascade(&self) -> &[ChoiceGenerator] {
        &self.cascade
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn current_choice(&self) -> Option<Choice> {
        self.current.and_then(|i| self.choices.get(i).copied())
    }

    /// Number of choices handed out so far.
    pub fn processed(&self) -> usize {
        self.current.map_or(0, |i| i + 1)
    }

    /// Adds a generator that is enumerated together with this one.
    pub fn add_cascaded(&mut self, mut cg: ChoiceGenerator) {
        cg.cascaded = true;
        self.cascade.push(cg);
    }

    /// Adds `cg` to the chain. A later scheduling generator replaces an
    /// earlier one, its candidate set is the current one.
    pub fn register(&mut self, mut cg: ChoiceGenerator) {
        if cg.kind == ChoiceKind::Scheduling {
            if self.kind == ChoiceKind::Scheduling {
                cg.cascade = std::mem::take(&mut self.cascade);
                *self = cg;
                return;
            }
            if let Some(slot) = self
                .cascade
                .iter_mut()
                .find(|c| c.kind == ChoiceKind::Scheduling)
            {
                cg.cascaded = true;
                *slot = cg;
                return;
            }
        }
        self.add_cascaded(cg);
    }

    fn level_has_more(&self) -> bool {
        match (self.forced, self.current) {
            (Some(_), current) => current.is_none(),
            (None, None) => !self.choices.is_empty(),
            (None, Some(i)) => i + 1 < self.choices.len(),
        }
    }

    fn level_advance(&mut self) -> bool {
        if !self.level_has_more() {
            return false;
        }
        self.current = Some(match (self.forced, self.current) {
            (Some(forced), _) => forced,
            (None, None) => 0,
            (None, Some(i)) => i + 1,
        });
        true
    }

    fn level_reset(&mut self) {
        self.current = None;
    }

    /// Whether another combination of this generator and its cascade is left.
    pub fn has_more(&self) -> bool {
        self.level_has_more() || self.cascade.iter().any(ChoiceGenerator::level_has_more)
    }

    /// Moves to the next combination. Returns false when exhausted.
    pub fn advance(&mut self) -> bool {
        if self.current.is_none() {
            return self.level_advance()
                && self.cascade.iter_mut().all(ChoiceGenerator::level_advance);
        }
        // odometer: bump the last level that still has choices, restart the rest
        let Some(level) = (0..=self.cascade.len())
            .rev()
            .find(|&l| self.level(l).level_has_more())
        else {
            return false;
        };
        self.level_mut(level).level_advance();
        for l in level + 1..=self.cascade.len() {
            let cg = self.level_mut(l);
            cg.level_reset();
            cg.level_advance();
        }
        true
    }

    fn level(&self, level: usize) -> &ChoiceGenerator {
        if level == 0 { self } else { &self.cascade[level - 1] }
    }

    fn level_mut(&mut self, level: usize) -> &mut ChoiceGenerator {
        if level == 0 {
            self
        } else {
            &mut self.cascade[level - 1]
        }
    }

    /// The generator and its cascade, primary first.
    pub fn levels(&self) -> impl Iterator<Item = &ChoiceGenerator> {
        std::iter::once(self).chain(self.cascade.iter())
    }

    /// Choice of the generator named `id` in this chain.
    pub fn choice_of(&self, id: &str) -> Option<Choice> {
        self.levels().find(|cg| cg.id() == id)?.current_choice()
    }

    /// Thread the current combination schedules: the first scheduling
    /// choice in the chain, otherwise the owner.
    pub fn scheduled_thread(&self) -> ThreadId {
        self.levels()
            .filter(|cg| cg.kind == ChoiceKind::Scheduling)
            .find_map(|cg| cg.current_choice().and_then(Choice::thread))
            .unwrap_or(self.owner)
    }

    /// Pins every level of the chain to a recorded choice for replay.
    pub fn force_specs(&mut self, specs: &[ChoiceSpec]) -> Result<(), String> {
        let levels = self.cascade.len() + 1;
        if specs.len() != levels {
            return Err(format!(
                "trace records {} choices, the program registered {levels} generators",
                specs.len()
            ));
        }
        for (level, spec) in specs.iter().enumerate() {
            let cg = self.level_mut(level);
            if *cg.id != *spec.generator || cg.kind != spec.kind {
                return Err(format!(
                    "trace expects generator `{}`, the program registered `{}`",
                    spec.generator, cg.id
                ));
            }
            if cg.choices.get(spec.index) != Some(&spec.choice) {
                return Err(format!(
                    "choice {} of `{}` is not {}",
                    spec.index, cg.id, spec.choice
                ));
            }
            cg.forced = Some(spec.index);
            cg.current = None;
        }
        Ok(())
    }

    /// Current position of every level, for traces.
    pub fn specs(&self) -> Vec<ChoiceSpec> {
        self.levels()
            .filter_map(|cg| {
                Some(ChoiceSpec {
                    generator: cg.id.to_string(),
                    kind: cg.kind,
                    index: cg.current?,
                    total: cg.total(),
                    choice: cg.current_choice()?,
                })
            })
            .collect()
    }
}

impl fmt::Display for ChoiceGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{:?}", self.id, self.kind)?;
        match self.current_choice() {
            Some(c) => write!(f, " {}/{} -> {c}]", self.processed(), self.total())?,
            None => write!(f, " 0/{}]", self.total())?,
        }
        for cg in &self.cascade {
            write!(f, " + {cg}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(cg: &mut ChoiceGenerator) -> Vec<Vec<Choice>> {
        let mut seen = Vec::new();
        while cg.has_more() {
            assert!(cg.advance());
            seen.push(cg.levels().filter_map(|l| l.current_choice()).collect());
        }
        assert!(!cg.advance(), "exhausted generator must not advance");
        seen
    }

    #[test]
    fn every_choice_is_produced_once() {
        let mut cg = ChoiceGenerator::scheduling("sched", ThreadId(0), &[ThreadId(0), ThreadId(2)]);
        let seen = drain(&mut cg);
        assert_eq!(
            seen,
            vec![
                vec![Choice::Thread(ThreadId(0))],
                vec![Choice::Thread(ThreadId(2))]
            ]
        );
    }

    #[test]
    fn cascade_enumerates_the_product() {
        let mut cg = ChoiceGenerator::int_range("a", ThreadId(0), 0, 2);
        cg.add_cascaded(ChoiceGenerator::boolean("b", ThreadId(0)));
        let seen = drain(&mut cg);
        assert_eq!(seen.len(), 6);
        assert_eq!(seen[0], vec![Choice::Int(0), Choice::Bool(false)]);
        assert_eq!(seen[1], vec![Choice::Int(0), Choice::Bool(true)]);
        assert_eq!(seen[5], vec![Choice::Int(2), Choice::Bool(true)]);
        assert!(cg.cascade()[0].is_cascaded());
    }

    #[test]
    fn clone_keeps_position_independently() {
        let mut cg = ChoiceGenerator::int_range("a", ThreadId(0), 1, 3);
        cg.advance();
        let saved = cg.clone();
        cg.advance();
        assert_eq!(saved.current_choice(), Some(Choice::Int(1)));
        assert_eq!(cg.current_choice(), Some(Choice::Int(2)));
    }

    #[test]
    fn forced_generator_yields_exactly_one_choice() {
        let mut cg = ChoiceGenerator::int_range("a", ThreadId(0), 0, 9);
        let spec = ChoiceSpec {
            generator: "a".to_owned(),
            kind: ChoiceKind::Data,
            index: 7,
            total: 10,
            choice: Choice::Int(7),
        };
        cg.force_specs(std::slice::from_ref(&spec)).unwrap();
        assert_eq!(drain(&mut cg), vec![vec![Choice::Int(7)]]);

        let wrong = ChoiceSpec {
            choice: Choice::Int(3),
            ..spec
        };
        assert!(cg.force_specs(&[wrong]).is_err());
    }

    #[test]
    fn scheduled_thread_prefers_scheduling_choice() {
        let mut notify = ChoiceGenerator::notify("notify", ThreadId(1), &[ThreadId(2), ThreadId(3)]);
        notify.advance();
        assert_eq!(notify.scheduled_thread(), ThreadId(1), "owner keeps running");

        let mut sched = ChoiceGenerator::scheduling("sched", ThreadId(1), &[ThreadId(3)]);
        sched.advance();
        assert_eq!(sched.scheduled_thread(), ThreadId(3));
    }

    #[test]
    fn later_scheduling_generator_replaces_earlier() {
        let mut cg = ChoiceGenerator::scheduling("unlock", ThreadId(0), &[ThreadId(0), ThreadId(1)]);
        cg.register(ChoiceGenerator::boolean("flag", ThreadId(0)));
        cg.register(ChoiceGenerator::scheduling("terminate", ThreadId(0), &[ThreadId(1)]));
        assert_eq!(cg.id(), "terminate");
        assert_eq!(cg.cascade().len(), 1, "data generator kept");
        assert_eq!(drain(&mut cg).len(), 2);
    }

    #[test]
    fn specs_describe_every_level() {
        let mut cg = ChoiceGenerator::boolean("flag", ThreadId(0));
        cg.add_cascaded(ChoiceGenerator::int_range("n", ThreadId(0), 5, 6));
        cg.advance();
        cg.advance();
        let specs = cg.specs();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].choice, Choice::Bool(false));
        assert_eq!(specs[1].choice, Choice::Int(6));
        assert_eq!(specs[1].total, 2);
    }
}
