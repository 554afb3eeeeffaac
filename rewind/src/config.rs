use crate::ConfigError;

// ── Heap ──────────────────────────────────────────────────────────────

/// User-facing heap overrides. Unset fields keep the [`HeapSettings`]
/// defaults.
#[derive(Debug, Default, Clone)]
pub struct HeapCreateInfo {
    /// Number of handle clusters, one per execution unit.
    pub max_threads: Option<usize>,
    /// Size of the handle range reserved for each execution unit.
    pub handles_per_thread: Option<usize>,
    /// Run the collector after this many allocations, 0 disables the trigger.
    pub gc_interval: Option<usize>,
    pub gc_enabled: Option<bool>,
    /// Largest array, in 32-bit slots, a program may allocate.
    pub max_array_slots: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct HeapSettings {
    pub max_threads: usize,
    pub handles_per_thread: usize,
    pub gc_interval: usize,
    pub gc_enabled: bool,
    pub max_array_slots: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            max_threads: 64,
            handles_per_thread: 1 << 14,
            gc_interval: 0,
            gc_enabled: true,
            max_array_slots: 1 << 20,
        }
    }
}

impl HeapSettings {
    pub fn from_create_info(info: &HeapCreateInfo) -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        info.max_threads.inspect(|&val| settings.max_threads = val);
        info.handles_per_thread
            .inspect(|&val| settings.handles_per_thread = val);
        info.gc_interval.inspect(|&val| settings.gc_interval = val);
        info.gc_enabled.inspect(|&val| settings.gc_enabled = val);
        info.max_array_slots
            .inspect(|&val| settings.max_array_slots = val);
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_threads == 0 || self.handles_per_thread == 0 || self.max_array_slots == 0 {
            return Err(ConfigError::Heap("sizes must be > 0"));
        }
        let total = self
            .max_threads
            .checked_mul(self.handles_per_thread)
            .ok_or(ConfigError::Heap("handle space overflows"))?;
        if total > i32::MAX as usize {
            return Err(ConfigError::Heap(
                "max_threads * handles_per_thread must fit a handle",
            ));
        }
        Ok(())
    }

    #[inline]
    pub fn handle_capacity(&self) -> usize {
        self.max_threads * self.handles_per_thread
    }
}

// ── Search ────────────────────────────────────────────────────────────

/// When a field access forces a transition break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessBreakMode {
    #[default]
    Never,
    /// Break before touching an object more than one thread has referenced.
    SharedObjects,
}

#[derive(Debug, Clone)]
pub struct SearchSettings {
    /// Skip fingerprinting, every transition counts as a new state.
    pub stateless: bool,
    /// Store full serialized states instead of 64-bit fingerprints.
    pub exact_matching: bool,
    /// 0 means unlimited.
    pub max_depth: usize,
    /// 0 means unlimited.
    pub max_states: usize,
    /// Instruction budget after which a transition breaks at the next back-jump.
    pub max_transition_length: usize,
    /// Call depth at which the simulated program sees a `StackOverflowError`.
    pub max_call_depth: usize,
    pub gc_after_transition: bool,
    pub check_consistency: bool,
    pub stop_on_violation: bool,
    /// Offer timed waiters as scheduling candidates (their timeout elapses).
    pub timeout_choices: bool,
    pub access_break: AccessBreakMode,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            stateless: false,
            exact_matching: false,
            max_depth: 0,
            max_states: 0,
            max_transition_length: 5_000,
            max_call_depth: 256,
            gc_after_transition: true,
            check_consistency: cfg!(debug_assertions),
            stop_on_violation: true,
            timeout_choices: true,
            access_break: AccessBreakMode::Never,
        }
    }
}

impl SearchSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_transition_length == 0 {
            return Err(ConfigError::Search("max_transition_length must be > 0"));
        }
        if self.max_call_depth == 0 {
            return Err(ConfigError::Search("max_call_depth must be > 0"));
        }
        if self.stateless && self.exact_matching {
            return Err(ConfigError::Search(
                "exact matching needs a state set, it cannot be combined with stateless mode",
            ));
        }
        Ok(())
    }
}

/// Everything a run is built from.
#[derive(Debug, Default, Clone)]
pub struct EngineCreateInfo {
    pub heap: HeapCreateInfo,
    pub search: SearchSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_info_overrides_defaults() {
        let info = HeapCreateInfo {
            max_threads: Some(4),
            gc_interval: Some(10),
            ..Default::default()
        };
        let settings = HeapSettings::from_create_info(&info).unwrap();
        assert_eq!(settings.max_threads, 4);
        assert_eq!(settings.gc_interval, 10);
        assert_eq!(
            settings.handles_per_thread,
            HeapSettings::default().handles_per_thread
        );
    }

    #[test]
    fn oversized_handle_space_is_rejected() {
        let info = HeapCreateInfo {
            max_threads: Some(1 << 16),
            handles_per_thread: Some(1 << 16),
            ..Default::default()
        };
        assert!(HeapSettings::from_create_info(&info).is_err());
    }

    #[test]
    fn stateless_exact_matching_is_rejected() {
        let settings = SearchSettings {
            stateless: true,
            exact_matching: true,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
