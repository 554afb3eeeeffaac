use std::collections::HashMap;

use crate::{Fingerprint, StateId, StateSerializer};

/// Revisit detection over serialized states.
pub trait StateSet: std::fmt::Debug {
    /// Returns the id of `state` and whether it was seen for the first time.
    fn add(&mut self, state: &[i32]) -> (StateId, bool);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps only 64-bit fingerprints. Hash collisions merge states.
#[derive(Debug)]
pub struct HashedStateSet {
    states: HashMap<Fingerprint, StateId, ahash::RandomState>,
    hasher: StateSerializer,
}

impl Default for HashedStateSet {
    fn default() -> Self {
        Self::new()
    }
}

impl HashedStateSet {
    pub fn new() -> Self {
        Self {
            states: HashMap::with_hasher(ahash::RandomState::new()),
            hasher: StateSerializer::new(),
        }
    }
}

impl StateSet for HashedStateSet {
    fn add(&mut self, state: &[i32]) -> (StateId, bool) {
        let fingerprint = Fingerprint(self.hasher.hash(state));
        let next = StateId(self.states.len() as u64 + 1);
        match self.states.get(&fingerprint) {
            Some(&id) => (id, false),
            None => {
                log::trace!("new state {next} fingerprint {fingerprint}");
                self.states.insert(fingerprint, next);
                (next, true)
            }
        }
    }

    fn len(&self) -> usize {
        self.states.len()
    }
}

/// Stores full serialized states. No collisions, more memory.
#[derive(Debug)]
pub struct ExactStateSet {
    states: HashMap<Box<[i32]>, StateId, ahash::RandomState>,
}

impl Default for ExactStateSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ExactStateSet {
    pub fn new() -> Self {
        Self {
            states: HashMap::with_hasher(ahash::RandomState::new()),
        }
    }
}

impl StateSet for ExactStateSet {
    fn add(&mut self, state: &[i32]) -> (StateId, bool) {
        if let Some(&id) = self.states.get(state) {
            return (id, false);
        }
        let id = StateId(self.states.len() as u64 + 1);
        self.states.insert(state.into(), id);
        (id, true)
    }

    fn len(&self) -> usize {
        self.states.len()
    }
}

/// Stateless mode: every state is new and gets the next number.
#[derive(Debug, Default)]
pub struct StatelessCounter {
    count: u64,
}

impl StatelessCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateSet for StatelessCounter {
    fn add(&mut self, _state: &[i32]) -> (StateId, bool) {
        self.count += 1;
        (StateId(self.count), true)
    }

    fn len(&self) -> usize {
        self.count as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashed_set_reports_revisits_with_the_first_id() {
        let mut set = HashedStateSet::new();
        let (a, new_a) = set.add(&[1, 2, 3]);
        let (b, new_b) = set.add(&[1, 2, 4]);
        let (c, new_c) = set.add(&[1, 2, 3]);
        assert!(new_a && new_b, "distinct states are new");
        assert!(!new_c, "repeated state is a revisit");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn exact_set_distinguishes_by_content() {
        let mut set = ExactStateSet::new();
        assert!(set.add(&[7]).1);
        assert!(set.add(&[7, 0]).1);
        assert_eq!(set.add(&[7]), (StateId(1), false));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn stateless_counter_never_matches() {
        let mut set = StatelessCounter::new();
        assert_eq!(set.add(&[1]), (StateId(1), true));
        assert_eq!(set.add(&[1]), (StateId(2), true));
        assert!(!set.is_empty());
    }
}
