//! # Condition Variable.
//!
//! A [`ConditionVariable`] lets a thread sleep until some state guarded by a
//! [`Mutex`] changes, and another thread wake it up once it did. Waiting
//! releases the mutex and falls asleep in one atomic step, so a signal can
//! never slip in between.
//!
//! Waiters are woken in the order they started waiting:
//! - [`ConditionVariable::signal`] wakes the earliest waiter.
//! - [`ConditionVariable::broadcast`] wakes every waiter, earliest first.
//!
//! Signals are not remembered: signaling a condition nobody waits on does
//! nothing. A woken waiter reacquires the mutex before it returns, so it
//! usually re-checks its predicate, which [`ConditionVariable::wait_while`]
//! does for it:
//!
//! ```rust,ignore
//! let guard = condvar.wait_while(&mutex, |queue| queue.is_empty());
//! ```
//!
//! A condition variable is bound to the first mutex it is used with. Using
//! it with another mutex, or without holding the mutex, is a
//! [`PreconditionViolation`].
use super::mutex::{Mutex, MutexGuard};
use crate::error::{PreconditionViolation, fatal};
use core::sync::atomic::{AtomicUsize, Ordering};
use keos::{
    sync::{InterruptGuard, SpinLock},
    thread::{Current, ParkHandle},
};
use std::collections::VecDeque;

/// A condition variable.
pub struct ConditionVariable {
    waiters: SpinLock<VecDeque<ParkHandle>>,
    mutex: AtomicUsize,
}

impl Default for ConditionVariable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionVariable {
    /// Creates a new condition variable which is ready to be waited on and
    /// signaled.
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(VecDeque::new()),
            mutex: AtomicUsize::new(0),
        }
    }

    /// Bind to `mutex` on first use, and check that the caller holds it.
    fn check<T>(&self, mutex: &Mutex<T>, op: &'static str) {
        let address = mutex as *const Mutex<T> as usize;
        if let Err(bound) =
            self.mutex
                .compare_exchange(0, address, Ordering::SeqCst, Ordering::SeqCst)
            && bound != address
        {
            fatal(PreconditionViolation::ForeignMutex { op });
        }
        if !mutex.is_held_by_current_thread() {
            fatal(PreconditionViolation::MutexNotHeld {
                op,
                tid: Current::try_get_tid().unwrap_or_default(),
            });
        }
    }

    /// Releases the mutex of `guard` and sleeps until signaled, then
    /// reacquires the mutex.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = guard.mutex();
        self.check(mutex, "wait");
        Current::park_with(|handle| {
            let mut waiters = self.waiters.lock();
            waiters.push_back(handle);
            waiters.unlock();
            guard.unlock();
        });
        mutex.lock()
    }

    /// Blocks the current thread while `predicate` returns `true`.
    ///
    /// Locks `mutex`, and sleeps on the condition for as long as the
    /// predicate holds on the guarded data. Returns with the mutex held and
    /// the predicate false.
    pub fn wait_while<'a, T>(
        &self,
        mutex: &'a Mutex<T>,
        predicate: impl Fn(&mut T) -> bool,
    ) -> MutexGuard<'a, T> {
        let mut guard = mutex.lock();
        while predicate(&mut guard) {
            guard = self.wait(guard);
        }
        guard
    }

    /// Wakes up the earliest waiter, if any.
    pub fn signal<T>(&self, guard: &MutexGuard<'_, T>) {
        self.check(guard.mutex(), "signal");
        let _atomic = InterruptGuard::new();
        let mut waiters = self.waiters.lock();
        let waiter = waiters.pop_front();
        waiters.unlock();
        if let Some(waiter) = waiter {
            waiter.unpark();
        }
    }

    /// Wakes up every waiter, earliest first.
    pub fn broadcast<T>(&self, guard: &MutexGuard<'_, T>) {
        self.check(guard.mutex(), "broadcast");
        let _atomic = InterruptGuard::new();
        let mut waiters = self.waiters.lock();
        let woken = core::mem::take(&mut *waiters);
        waiters.unlock();
        for waiter in woken {
            waiter.unpark();
        }
    }

    /// Number of threads waiting on the condition.
    pub fn waiters(&self) -> usize {
        let waiters = self.waiters.lock();
        let len = waiters.len();
        waiters.unlock();
        len
    }
}
