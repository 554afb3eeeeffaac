use std::sync::Arc;

use serde::Serialize;

use crate::{
    AllRunnables, Backtracker, ClassRegistry, EngineCreateInfo, EngineError, EventBus,
    ExactStateSet, HashedStateSet, Listener, MethodInfo, NoDeadlock, NoUncaughtException,
    Property, RestorableState, SchedulingPolicy, StateId, StateSerializer, StateSet, StateView,
    StatelessCounter, SystemState, Trace, Violation,
};

/// Counters collected while the search runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SearchStats {
    pub new_states: usize,
    pub visited_states: usize,
    pub ignored_states: usize,
    pub end_states: usize,
    pub backtracks: usize,
    pub max_depth: usize,
    pub transitions: usize,
    pub instructions: usize,
    pub collections: usize,
    pub released_objects: usize,
}

/// A violation together with the path that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Counterexample {
    pub violation: Violation,
    pub state: StateId,
    pub trace: Trace,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchReport {
    pub stats: SearchStats,
    pub violations: Vec<Counterexample>,
    /// The search stopped before the state space was exhausted.
    pub stopped_early: bool,
}

impl SearchReport {
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }
}

/// A restorable state plus the path that led to it.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    state: RestorableState,
    path: Trace,
}

impl Checkpoint {
    pub fn id(&self) -> StateId {
        self.state.id()
    }

    pub fn path(&self) -> &Trace {
        &self.path
    }
}

/// Depth-first forward/backtrack exploration of one program.
pub struct Search {
    state: SystemState,
    backtracker: Backtracker,
    state_set: Box<dyn StateSet>,
    serializer: StateSerializer,
    bus: EventBus,
    properties: Vec<Box<dyn Property>>,
    path: Trace,
    stats: SearchStats,
    violations: Vec<Counterexample>,
    done: bool,
}

impl Search {
    pub fn new(
        classes: ClassRegistry,
        entry: Arc<MethodInfo>,
        info: &EngineCreateInfo,
    ) -> Result<Self, EngineError> {
        let policy = AllRunnables::from_settings(&info.search);
        Self::with_policy(classes, entry, info, Box::new(policy))
    }

    pub fn with_policy(
        classes: ClassRegistry,
        entry: Arc<MethodInfo>,
        info: &EngineCreateInfo,
        policy: Box<dyn SchedulingPolicy>,
    ) -> Result<Self, EngineError> {
        let mut state = SystemState::new(classes, info, policy)?;
        state.initialize(entry)?;
        let settings = state.settings();
        let state_set: Box<dyn StateSet> = if settings.stateless {
            Box::new(StatelessCounter::new())
        } else if settings.exact_matching {
            Box::new(ExactStateSet::new())
        } else {
            Box::new(HashedStateSet::new())
        };
        Ok(Self {
            state,
            backtracker: Backtracker::new(),
            state_set,
            serializer: StateSerializer::new(),
            bus: EventBus::new(),
            properties: vec![Box::new(NoDeadlock), Box::new(NoUncaughtException)],
            path: Trace::new(),
            stats: SearchStats::default(),
            violations: Vec::new(),
            done: false,
        })
    }

    pub fn add_listener(&mut self, listener: Box<dyn Listener>) {
        self.bus.add(listener);
    }

    pub fn add_property(&mut self, property: Box<dyn Property>) {
        self.properties.push(property);
    }

    /// Removes the built-in deadlock and uncaught exception checks.
    pub fn clear_properties(&mut self) {
        self.properties.clear();
    }

    #[inline]
    pub fn state(&self) -> &SystemState {
        &self.state
    }

    #[inline]
    pub fn stats(&self) -> &SearchStats {
        &self.stats
    }

    /// Path from the initial state to the current one.
    #[inline]
    pub fn path(&self) -> &Trace {
        &self.path
    }

    pub fn depth(&self) -> usize {
        self.backtracker.depth()
    }

    // ── Driver ────────────────────────────────────────────────────────

    /// Explores until the state space is exhausted, a limit is hit, or a
    /// violation stops the search.
    pub fn run(&mut self) -> Result<SearchReport, EngineError> {
        log::info!("search started");
        self.bus.search_started(&StateView::new(&self.state));
        while !self.done {
            if self.forward()? {
                if !self.done && self.must_backtrack() && !self.backtrack() {
                    break;
                }
            } else if !self.backtrack() {
                break;
            }
        }
        self.bus.search_finished(&StateView::new(&self.state));
        let report = self.report();
        log::info!(
            "search finished: {} new, {} visited, {} end states, {} backtracks, max depth {}, {} violations",
            report.stats.new_states,
            report.stats.visited_states,
            report.stats.end_states,
            report.stats.backtracks,
            report.stats.max_depth,
            report.violations.len()
        );
        Ok(report)
    }

    pub fn report(&self) -> SearchReport {
        SearchReport {
            stats: self.stats,
            violations: self.violations.clone(),
            stopped_early: self.done,
        }
    }

    fn must_backtrack(&self) -> bool {
        let max_depth = self.state.settings().max_depth;
        let control = self.state.control();
        self.state.is_end()
            || !self.state.is_new()
            || control.is_ignored()
            || control.is_backtrack_requested()
            || (max_depth > 0 && self.state.depth() >= max_depth)
    }

    /// Executes the next transition from the current state. Returns false
    /// when the current choice generator is exhausted.
    pub fn forward(&mut self) -> Result<bool, EngineError> {
        if !self.state.initialize_next_transition(&mut self.bus) {
            return Ok(false);
        }
        let parent = self.state.id();
        self.backtracker.push_kernel_state(&mut self.state);
        if let Err(err) = self.state.execute_transition(&mut self.bus) {
            log::error!("transition from {parent} failed: {err}\n{}", self.state.kernel().dump());
            self.backtracker.discard_kernel_state();
            return Err(err);
        }
        self.stats.transitions += 1;
        self.stats.instructions += self.state.instructions();
        self.path.push(self.state.transition_record());

        let ignored = self.state.control().is_ignored();
        if ignored {
            self.stats.ignored_states += 1;
            self.state.set_classification(parent, false);
        } else {
            let heap = &self.state.kernel().heap;
            let collect = heap.is_gc_enabled()
                && (self.state.settings().gc_after_transition || heap.should_collect());
            if collect {
                let gc = self.state.collect_garbage(&mut self.bus);
                self.stats.collections += 1;
                self.stats.released_objects += gc.released;
            }
            self.classify();
        }
        self.check_consistency()?;
        self.backtracker.push_system_state(&self.state, parent)?;
        self.stats.max_depth = self.stats.max_depth.max(self.state.depth());
        log::debug!(
            "{parent} -> {} by {} ({} instructions){}{}",
            self.state.id(),
            self.state.scheduled_thread().map_or("-".to_owned(), |t| t.to_string()),
            self.state.instructions(),
            if self.state.is_new() { " new" } else { " visited" },
            if self.state.is_end() { " end" } else { "" },
        );

        if !ignored {
            self.check_properties();
        }
        self.bus.state_advanced(&StateView::new(&self.state));

        let max_states = self.state.settings().max_states;
        if max_states > 0 && self.stats.new_states >= max_states {
            log::info!("state limit of {max_states} reached");
            self.done = true;
        }
        if self.state.control().is_terminate_requested() {
            log::info!("search terminated by a listener at {}", self.state.id());
            self.done = true;
        }
        Ok(true)
    }

    fn classify(&mut self) {
        let (id, is_new) = if self.state.settings().stateless {
            self.state_set.add(&[])
        } else {
            let serialized = self
                .serializer
                .serialize(self.state.kernel(), self.state.next_choice_generator());
            self.state_set.add(serialized)
        };
        self.state.set_classification(id, is_new);
        if is_new {
            self.stats.new_states += 1;
        } else {
            self.stats.visited_states += 1;
        }
        if self.state.is_end() {
            self.stats.end_states += 1;
        }
    }

    fn check_consistency(&self) -> Result<(), EngineError> {
        if !self.state.settings().check_consistency {
            return Ok(());
        }
        self.state.kernel().check_consistency().inspect_err(|err| {
            log::error!(
                "consistency check failed at {}: {err}\n{}",
                self.state.id(),
                self.state.kernel().dump()
            );
        })
    }

    fn check_properties(&mut self) {
        let view = StateView::new(&self.state);
        let mut found: Vec<Violation> = self
            .properties
            .iter_mut()
            .filter_map(|p| {
                p.check(&view).map(|message| Violation {
                    property: p.name().to_owned(),
                    message,
                })
            })
            .collect();
        found.extend(self.state.control().take_violations());
        for violation in found {
            log::warn!(
                "{} violated at {}: {}",
                violation.property,
                self.state.id(),
                violation.message
            );
            self.bus
                .property_violated(&StateView::new(&self.state), &violation);
            self.violations.push(Counterexample {
                violation,
                state: self.state.id(),
                trace: self.path.clone(),
            });
            if self.state.settings().stop_on_violation {
                self.done = true;
            }
        }
    }

    /// Undoes the last transition. Returns false when the search is
    /// exhausted.
    pub fn backtrack(&mut self) -> bool {
        if !self.backtracker.backtrack(&mut self.state) {
            return false;
        }
        self.path.pop();
        self.stats.backtracks += 1;
        self.bus.state_backtracked(&StateView::new(&self.state));
        true
    }

    // ── Checkpoints and replay ────────────────────────────────────────

    pub fn checkpoint(&mut self) -> Checkpoint {
        let id = self.state.id();
        Checkpoint {
            state: self.state.restorable_state(id),
            path: self.path.clone(),
        }
    }

    /// Jumps to `checkpoint`. Exploration continues from there, the
    /// snapshots taken since are dropped.
    pub fn restore_checkpoint(&mut self, checkpoint: &Checkpoint) {
        self.backtracker.restore_state(&mut self.state, &checkpoint.state);
        self.path = checkpoint.path.clone();
        self.done = false;
        self.bus.state_restored(&StateView::new(&self.state));
    }

    /// Re-executes `trace` from the initial state, forcing every recorded
    /// choice. Properties are checked along the way.
    pub fn replay(&mut self, trace: &Trace) -> Result<SearchReport, EngineError> {
        if !self.path.is_empty() {
            return Err(EngineError::Inconsistent(
                "replay must start from the initial state".to_owned(),
            ));
        }
        log::info!("replaying {} transitions", trace.len());
        for (index, record) in trace.iter().enumerate() {
            self.state.force_next(&record.choices, index)?;
            if !self.forward()? {
                return Err(EngineError::ReplayDiverged {
                    index,
                    reason: "no transition left".to_owned(),
                });
            }
            let scheduled = self.state.scheduled_thread();
            if scheduled != Some(record.thread) {
                return Err(EngineError::ReplayDiverged {
                    index,
                    reason: format!("expected {}, ran {scheduled:?}", record.thread),
                });
            }
        }
        Ok(self.report())
    }
}

impl std::fmt::Debug for Search {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Search")
            .field("state", &self.state.id())
            .field("depth", &self.backtracker.depth())
            .field("states", &self.state_set.len())
            .field("stats", &self.stats)
            .finish()
    }
}
