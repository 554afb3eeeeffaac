use crate::ThreadId;

/// Lock and wait-queue state of one object.
///
/// `blocked` holds every thread that competes for the lock, including the
/// ones still waiting. `waiting` is the subset that called `wait` and has
/// not been notified, interrupted or timed out yet; those are not woken by
/// a lock release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Monitor {
    lock_count: u32,
    owner: Option<ThreadId>,
    blocked: Vec<ThreadId>,
    waiting: Vec<ThreadId>,
}

impl Monitor {
    #[inline]
    pub fn lock_count(&self) -> u32 {
        self.lock_count
    }

    #[inline]
    pub fn owner(&self) -> Option<ThreadId> {
        self.owner
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock_count > 0
    }

    #[inline]
    pub fn is_locked_by(&self, thread: ThreadId) -> bool {
        self.lock_count > 0 && self.owner == Some(thread)
    }

    #[inline]
    pub fn can_lock(&self, thread: ThreadId) -> bool {
        self.lock_count == 0 || self.owner == Some(thread)
    }

    #[inline]
    pub fn blocked(&self) -> &[ThreadId] {
        &self.blocked
    }

    #[inline]
    pub fn waiting(&self) -> &[ThreadId] {
        &self.waiting
    }

    #[inline]
    pub fn is_waiting(&self, thread: ThreadId) -> bool {
        self.waiting.contains(&thread)
    }

    #[inline]
    pub fn has_contender(&self, thread: ThreadId) -> bool {
        self.blocked.contains(&thread)
    }

    /// Acquires (or re-enters) the lock. Callers check [`Self::can_lock`].
    pub fn lock(&mut self, thread: ThreadId) {
        debug_assert!(self.can_lock(thread), "{thread} locks a foreign monitor");
        self.owner = Some(thread);
        self.lock_count += 1;
        self.remove_contender(thread);
    }

    /// Reacquires after a wait, restoring the saved recursion depth.
    pub fn relock(&mut self, thread: ThreadId, count: u32) {
        debug_assert_eq!(self.lock_count, 0);
        self.owner = Some(thread);
        self.lock_count = count.max(1);
        self.remove_contender(thread);
    }

    /// Returns the remaining lock count.
    pub fn unlock(&mut self) -> u32 {
        debug_assert!(self.lock_count > 0, "unlock of a free monitor");
        self.lock_count = self.lock_count.saturating_sub(1);
        if self.lock_count == 0 {
            self.owner = None;
        }
        self.lock_count
    }

    /// Drops the lock entirely and returns the recursion depth it had.
    pub fn release(&mut self) -> u32 {
        let count = self.lock_count;
        self.lock_count = 0;
        self.owner = None;
        count
    }

    pub fn add_contender(&mut self, thread: ThreadId) {
        if !self.blocked.contains(&thread) {
            self.blocked.push(thread);
        }
    }

    pub fn remove_contender(&mut self, thread: ThreadId) {
        self.blocked.retain(|&t| t != thread);
        self.waiting.retain(|&t| t != thread);
    }

    pub fn add_waiter(&mut self, thread: ThreadId) {
        self.add_contender(thread);
        if !self.waiting.contains(&thread) {
            self.waiting.push(thread);
        }
    }

    /// The thread stays a lock contender.
    pub fn remove_waiter(&mut self, thread: ThreadId) -> bool {
        let before = self.waiting.len();
        self.waiting.retain(|&t| t != thread);
        before != self.waiting.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recursive_locking_keeps_owner() {
        let mut monitor = Monitor::default();
        monitor.lock(ThreadId(1));
        monitor.lock(ThreadId(1));
        assert_eq!(monitor.lock_count(), 2);
        assert_eq!(monitor.owner(), Some(ThreadId(1)));
        assert!(!monitor.can_lock(ThreadId(2)));
        assert_eq!(monitor.unlock(), 1);
        assert_eq!(monitor.unlock(), 0);
        assert_eq!(monitor.owner(), None, "free monitor has no owner");
    }

    #[test]
    fn waiters_remain_contenders_after_notification() {
        let mut monitor = Monitor::default();
        monitor.add_waiter(ThreadId(3));
        assert!(monitor.is_waiting(ThreadId(3)));
        assert!(monitor.remove_waiter(ThreadId(3)));
        assert!(!monitor.is_waiting(ThreadId(3)));
        assert!(monitor.has_contender(ThreadId(3)));
    }

    #[test]
    fn locking_clears_contender_entry() {
        let mut monitor = Monitor::default();
        monitor.add_contender(ThreadId(2));
        monitor.lock(ThreadId(2));
        assert!(monitor.blocked().is_empty());
    }
}
