use crate::{
    EngineError, Event, ExecError, Handle, ILLEGAL_MONITOR_STATE, ILLEGAL_THREAD_STATE,
    INTERRUPTED_EXCEPTION, KernelState, ThreadId, ThreadState,
};

// Monitor protocol and thread state machine on top of the kernel state.
impl KernelState {
    /// Moves `thread` to `state`. The blocking object is kept for states
    /// that name one and cleared otherwise.
    pub fn set_thread_state(
        &mut self,
        thread: ThreadId,
        state: ThreadState,
    ) -> Result<(), EngineError> {
        let info = self.threads.modifiable(thread)?;
        let from = info.state();
        if from == state {
            return Ok(());
        }
        if from == ThreadState::Terminated {
            return Err(EngineError::Inconsistent(format!(
                "{thread} cannot leave TERMINATED"
            )));
        }
        let data = info.data_mut();
        data.state = state;
        if !state.has_blocking_object() {
            data.blocking = Handle::NULL;
        }
        log::trace!("{thread}: {from} -> {state}");
        self.emit(Event::ThreadStateChanged {
            thread,
            from,
            to: state,
        });
        Ok(())
    }

    fn set_blocked_state(
        &mut self,
        thread: ThreadId,
        state: ThreadState,
        object: Handle,
    ) -> Result<(), EngineError> {
        debug_assert!(state.has_blocking_object());
        self.threads.modifiable(thread)?.data_mut().blocking = object;
        self.set_thread_state(thread, state)
    }

    // ── Locking ───────────────────────────────────────────────────────

    pub fn can_lock(&self, thread: ThreadId, object: Handle) -> Result<bool, EngineError> {
        Ok(self.heap.require(object)?.monitor().can_lock(thread))
    }

    /// Acquires the monitor of `object`. Callers check [`Self::can_lock`].
    pub fn lock(&mut self, thread: ThreadId, object: Handle) -> Result<(), EngineError> {
        let ei = self.heap.modifiable(object)?;
        if !ei.monitor().can_lock(thread) {
            return Err(EngineError::Inconsistent(format!(
                "{thread} locks {object} owned by {:?}",
                ei.monitor().owner()
            )));
        }
        let first = !ei.monitor().is_locked();
        ei.monitor_mut().lock(thread);
        ei.add_referencing_thread(thread);
        if first {
            self.threads
                .modifiable(thread)?
                .data_mut()
                .locked_objects
                .push(object);
        }
        if self.threads.require(thread)?.state() != ThreadState::Running {
            self.set_thread_state(thread, ThreadState::Running)?;
        }
        self.emit(Event::ObjectLocked { thread, handle: object });
        Ok(())
    }

    /// Releases one level of the monitor. Returns whether a contender became
    /// runnable.
    pub fn unlock(&mut self, thread: ThreadId, object: Handle) -> Result<bool, ExecError> {
        let ei = self.heap.modifiable(object)?;
        if !ei.monitor().is_locked_by(thread) {
            return Err(ExecError::throw(
                ILLEGAL_MONITOR_STATE,
                format!("{thread} does not own {object}"),
            ));
        }
        let remaining = ei.monitor_mut().unlock();
        self.emit(Event::ObjectUnlocked { thread, handle: object });
        if remaining > 0 {
            return Ok(false);
        }
        self.threads
            .modifiable(thread)?
            .data_mut()
            .locked_objects
            .retain(|&h| h != object);
        Ok(self.unblock_contenders(object)?)
    }

    /// After a release, every contender that only waited for the lock may
    /// compete again. Waiters stay put.
    fn unblock_contenders(&mut self, object: Handle) -> Result<bool, EngineError> {
        let monitor = self.heap.require(object)?.monitor();
        let candidates: Vec<ThreadId> = monitor
            .blocked()
            .iter()
            .copied()
            .filter(|&t| !monitor.is_waiting(t))
            .collect();
        let mut unblocked = false;
        for thread in candidates {
            let state = self.threads.require(thread)?.state();
            if matches!(
                state,
                ThreadState::Blocked | ThreadState::Notified | ThreadState::Interrupted
            ) {
                self.set_thread_state(thread, ThreadState::Unblocked)?;
                unblocked = true;
            }
        }
        Ok(unblocked)
    }

    /// Announces that `thread` will need the lock of `object` next, without
    /// blocking it.
    pub fn register_lock_contender(
        &mut self,
        thread: ThreadId,
        object: Handle,
    ) -> Result<(), EngineError> {
        let ei = self.heap.modifiable(object)?;
        if !ei.monitor().has_contender(thread) {
            ei.monitor_mut().add_contender(thread);
        }
        Ok(())
    }

    /// Withdraws a contender that no longer needs the lock, as a joiner
    /// does once the joined thread ended.
    pub fn withdraw_contender(&mut self, thread: ThreadId, object: Handle) -> Result<(), EngineError> {
        self.heap.modifiable(object)?.monitor_mut().remove_contender(thread);
        Ok(())
    }

    /// The scheduled thread found the lock taken.
    pub fn block(&mut self, thread: ThreadId, object: Handle) -> Result<(), EngineError> {
        self.register_lock_contender(thread, object)?;
        self.set_blocked_state(thread, ThreadState::Blocked, object)
    }

    // ── Wait / notify ─────────────────────────────────────────────────

    /// Gives up the monitor and parks `thread` in its wait set. Returns
    /// whether a contender became runnable.
    pub fn wait(
        &mut self,
        thread: ThreadId,
        object: Handle,
        timed: bool,
    ) -> Result<bool, ExecError> {
        if !self.heap.require(object)?.monitor().is_locked_by(thread) {
            return Err(ExecError::throw(
                ILLEGAL_MONITOR_STATE,
                format!("{thread} waits on {object} without owning it"),
            ));
        }
        if self.threads.require(thread)?.data().interrupted {
            self.threads.modifiable(thread)?.data_mut().interrupted = false;
            return Err(ExecError::throw(INTERRUPTED_EXCEPTION, "interrupted before wait"));
        }
        let ei = self.heap.modifiable(object)?;
        let count = ei.monitor_mut().release();
        ei.monitor_mut().add_waiter(thread);
        let data = self.threads.modifiable(thread)?.data_mut();
        data.lock_count_before_wait = count;
        data.locked_objects.retain(|&h| h != object);
        let state = if timed {
            ThreadState::TimeoutWaiting
        } else {
            ThreadState::Waiting
        };
        self.set_blocked_state(thread, state, object)?;
        self.emit(Event::ObjectWait { thread, handle: object });
        Ok(self.unblock_contenders(object)?)
    }

    /// Parks `thread` on `object` without owning its monitor (join).
    pub fn wait_unlocked(&mut self, thread: ThreadId, object: Handle) -> Result<(), EngineError> {
        self.heap.modifiable(object)?.monitor_mut().add_waiter(thread);
        self.set_blocked_state(thread, ThreadState::Waiting, object)?;
        self.emit(Event::ObjectWait { thread, handle: object });
        Ok(())
    }

    /// Wakes one specific waiter of `object`.
    pub fn notify_thread(
        &mut self,
        notifier: ThreadId,
        object: Handle,
        waiter: ThreadId,
    ) -> Result<(), EngineError> {
        let ei = self.heap.modifiable(object)?;
        if !ei.monitor_mut().remove_waiter(waiter) {
            return Err(EngineError::Inconsistent(format!(
                "{waiter} is not waiting on {object}"
            )));
        }
        let locked = ei.monitor().is_locked();
        if locked {
            self.set_thread_state(waiter, ThreadState::Notified)?;
        } else {
            // nothing to reacquire against
            self.set_thread_state(waiter, ThreadState::Unblocked)?;
        }
        self.emit(Event::ObjectNotify {
            thread: notifier,
            handle: object,
            woken: waiter,
        });
        Ok(())
    }

    /// Waiters of `object`, in wait order.
    pub fn waiters(&self, object: Handle) -> Result<Vec<ThreadId>, EngineError> {
        Ok(self.heap.require(object)?.monitor().waiting().to_vec())
    }

    pub fn check_monitor_owner(&self, thread: ThreadId, object: Handle) -> Result<(), ExecError> {
        if !self.heap.require(object)?.monitor().is_locked_by(thread) {
            return Err(ExecError::throw(
                ILLEGAL_MONITOR_STATE,
                format!("{thread} does not own {object}"),
            ));
        }
        Ok(())
    }

    pub fn notify_all(&mut self, notifier: ThreadId, object: Handle) -> Result<(), EngineError> {
        for waiter in self.waiters(object)? {
            self.notify_thread(notifier, object, waiter)?;
        }
        self.emit(Event::ObjectNotifyAll {
            thread: notifier,
            handle: object,
        });
        Ok(())
    }

    /// Sets the interrupt flag and pulls `target` out of a wait.
    pub fn interrupt(&mut self, target: ThreadId) -> Result<(), EngineError> {
        let data = self.threads.modifiable(target)?.data_mut();
        data.interrupted = true;
        let state = data.state;
        let object = data.blocking;
        if !state.is_waiting() {
            return Ok(());
        }
        let ei = self.heap.modifiable(object)?;
        ei.monitor_mut().remove_waiter(target);
        if ei.monitor().is_locked() {
            self.set_thread_state(target, ThreadState::Interrupted)?;
        } else {
            self.set_thread_state(target, ThreadState::Unblocked)?;
        }
        Ok(())
    }

    /// The timeout of a timed waiter elapsed.
    pub fn timeout(&mut self, thread: ThreadId) -> Result<(), EngineError> {
        let data = self.threads.require(thread)?.data();
        if data.state != ThreadState::TimeoutWaiting {
            return Err(EngineError::Inconsistent(format!(
                "{thread} times out in state {}",
                data.state
            )));
        }
        let object = data.blocking;
        self.heap
            .modifiable(object)?
            .monitor_mut()
            .remove_waiter(thread);
        self.set_thread_state(thread, ThreadState::TimedOut)
    }

    /// Reacquires the monitor a waiter gave up. Returns false and blocks the
    /// thread if the lock is taken.
    pub fn reacquire_after_wait(
        &mut self,
        thread: ThreadId,
        object: Handle,
    ) -> Result<bool, EngineError> {
        if !self.can_lock(thread, object)? {
            self.block(thread, object)?;
            return Ok(false);
        }
        let count = self.threads.require(thread)?.data().lock_count_before_wait;
        let ei = self.heap.modifiable(object)?;
        ei.monitor_mut().relock(thread, count);
        let data = self.threads.modifiable(thread)?.data_mut();
        data.lock_count_before_wait = 0;
        data.locked_objects.push(object);
        self.set_thread_state(thread, ThreadState::Running)?;
        self.emit(Event::ObjectLocked { thread, handle: object });
        Ok(true)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    pub fn start_thread(&mut self, target: ThreadId) -> Result<(), ExecError> {
        if self.threads.require(target)?.state() != ThreadState::New {
            return Err(ExecError::throw(
                ILLEGAL_THREAD_STATE,
                format!("{target} already started"),
            ));
        }
        self.start_frame(target)?;
        self.set_thread_state(target, ThreadState::Running)?;
        self.emit(Event::ThreadStarted { thread: target });
        Ok(())
    }

    /// Releases every monitor the thread still owns, marks it terminated
    /// and wakes its joiners.
    pub fn terminate_thread(&mut self, thread: ThreadId) -> Result<(), EngineError> {
        while self.threads.modifiable(thread)?.pop_frame().is_some() {}
        let locked = std::mem::take(&mut self.threads.modifiable(thread)?.data_mut().locked_objects);
        for object in locked {
            self.heap.modifiable(object)?.monitor_mut().release();
            self.emit(Event::ObjectUnlocked { thread, handle: object });
            self.unblock_contenders(object)?;
        }
        let object = self.threads.require(thread)?.object();
        self.set_thread_state(thread, ThreadState::Terminated)?;
        if self.heap.contains(object) {
            self.notify_all(thread, object)?;
        }
        self.emit(Event::ThreadTerminated { thread });
        log::debug!("{thread} terminated");
        Ok(())
    }

    pub fn suspend(&mut self, thread: ThreadId) -> Result<(), EngineError> {
        self.threads.modifiable(thread)?.data_mut().suspend_count += 1;
        Ok(())
    }

    pub fn resume(&mut self, thread: ThreadId) -> Result<(), EngineError> {
        let data = self.threads.modifiable(thread)?.data_mut();
        data.suspend_count = data.suspend_count.saturating_sub(1);
        Ok(())
    }
}
