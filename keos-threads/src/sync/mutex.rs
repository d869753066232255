//! # Mutex.
//!
//! A [`Mutex`] lets only one thread at a time into a critical section. Unlike
//! the [`SpinLock`], a thread that finds the mutex held goes to sleep until
//! the holder hands the mutex over.
//!
//! When the [`PriorityScheduler`] is installed, every contended mutex is
//! backed by a [`ThreadQueue`] that transfers priority: sleeping lockers
//! donate their effective priority to the holder, and unlocking hands the
//! mutex directly to the waiter with the highest effective priority, the
//! earliest one among equals. Under any other scheduler, waiters are served
//! first-come first-served.
//!
//! [`SpinLock`]: keos::sync::SpinLock
//! [`PriorityScheduler`]: crate::priority::PriorityScheduler
use crate::{
    error::{PreconditionViolation, fatal},
    priority::{self, ThreadQueue},
};
use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
};
use keos::{
    sync::{SpinLock, WouldBlock},
    thread::{Current, ParkHandle},
};
use std::collections::VecDeque;

struct State {
    holder: Option<u64>,
    queue: Option<ThreadQueue>,
    waiters: VecDeque<ParkHandle>,
}

impl State {
    /// The donation queue of the mutex, created on first contention.
    fn queue(&mut self) -> Option<&ThreadQueue> {
        if self.queue.is_none()
            && let Some(scheduler) = priority::try_scheduler()
        {
            let queue = scheduler.new_thread_queue(true);
            if let Some(holder) = self.holder {
                queue.acquire(holder);
            }
            self.queue = Some(queue);
        }
        self.queue.as_ref()
    }

    /// Pick the thread that receives the mutex next.
    ///
    /// The donation queue and the sleepers must agree on who waits.
    fn take_next(&mut self) -> Result<Option<ParkHandle>, PreconditionViolation> {
        let Some(queue) = self.queue.as_ref() else {
            return Ok(self.waiters.pop_front());
        };
        let Some(next) = queue.next_thread() else {
            return Ok(None);
        };
        match self.waiters.iter().position(|handle| handle.tid() == next) {
            Some(position) => Ok(self.waiters.remove(position)),
            None => Err(PreconditionViolation::NotWaiting {
                op: "unlock",
                tid: next,
            }),
        }
    }
}

/// A mutual exclusion primitive useful for protecting shared data.
///
/// This mutex will block threads waiting for the lock to become available.
/// The data can only be accessed through the guards returned from [`lock`]
/// and [`try_lock`], and the guard must be released with
/// [`MutexGuard::unlock`].
///
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
///
/// # Examples
///
/// ```
/// use keos::thread::ThreadBuilder;
/// use keos_threads::sync::Mutex;
/// use std::sync::Arc;
///
/// keos::boot(
///     |_| {},
///     || {
///         let data = Arc::new(Mutex::new(0));
///         let workers: Vec<_> = (0..4)
///             .map(|_| {
///                 let data = data.clone();
///                 ThreadBuilder::new("work").spawn(move || {
///                     let mut guard = data.lock();
///                     *guard += 1;
///                     guard.unlock();
///                 })
///             })
///             .collect();
///         for worker in workers {
///             worker.join();
///         }
///         let guard = data.lock();
///         assert_eq!(*guard, 4);
///         guard.unlock();
///     },
/// )
/// .unwrap();
/// ```
pub struct Mutex<T> {
    state: SpinLock<State>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> Mutex<T> {
        Mutex {
            state: SpinLock::new(State {
                holder: None,
                queue: None,
                waiters: VecDeque::new(),
            }),
            data: UnsafeCell::new(t),
        }
    }

    /// Acquires the mutex, blocking the current thread until it is able to
    /// do so.
    ///
    /// # Panics
    /// Locking a mutex the current thread already holds is a
    /// [`PreconditionViolation::AlreadyHeld`].
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let tid = Current::get_tid();
        loop {
            let mut state = self.state.lock();
            let holder = state.holder;
            match holder {
                None => {
                    state.holder = Some(tid);
                    if let Some(queue) = state.queue.as_ref() {
                        queue.acquire(tid);
                    }
                    state.unlock();
                    return MutexGuard::new(self);
                }
                Some(holder) if holder == tid => {
                    state.unlock();
                    fatal(PreconditionViolation::AlreadyHeld { op: "lock", tid });
                }
                Some(_) => state.unlock(),
            }

            Current::park_with(|handle| {
                let mut state = self.state.lock();
                if state.holder.is_none() {
                    // Released before we fell asleep.
                    state.unlock();
                    handle.unpark();
                    return;
                }
                if let Some(queue) = state.queue() {
                    queue.wait_for_access(tid);
                }
                state.waiters.push_back(handle);
                state.unlock();
            });

            // The holder hands the mutex over before waking us up.
            let state = self.state.lock();
            let handed_over = state.holder == Some(tid);
            state.unlock();
            if handed_over {
                return MutexGuard::new(self);
            }
        }
    }

    /// Attempts to acquire the mutex without blocking.
    ///
    /// # Errors
    /// Returns [`WouldBlock`] if the mutex is held, including by the current
    /// thread.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, WouldBlock> {
        let tid = Current::get_tid();
        let mut state = self.state.lock();
        if state.holder.is_some() {
            state.unlock();
            return Err(WouldBlock);
        }
        state.holder = Some(tid);
        if let Some(queue) = state.queue.as_ref() {
            queue.acquire(tid);
        }
        state.unlock();
        Ok(MutexGuard::new(self))
    }

    /// Returns true if the current thread holds the mutex.
    pub fn is_held_by_current_thread(&self) -> bool {
        let state = self.state.lock();
        let holder = state.holder;
        state.unlock();
        holder.is_some() && holder == Current::try_get_tid()
    }

    /// Consumes this mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Hand the mutex to the next waiter, or leave it free.
    fn release(&self) {
        let tid = Current::get_tid();
        let mut state = self.state.lock();
        if state.holder != Some(tid) {
            state.unlock();
            fatal(PreconditionViolation::MutexNotHeld { op: "unlock", tid });
        }
        let next = match state.take_next() {
            Ok(next) => next,
            Err(violation) => {
                state.unlock();
                fatal(violation);
            }
        };
        state.holder = next.as_ref().map(ParkHandle::tid);
        if next.is_none()
            && let Some(queue) = state.queue.as_ref()
        {
            queue.release(tid);
        }
        if let Some(next) = next {
            next.unpark();
        }
        state.unlock();
    }
}

impl<T: Default> Default for Mutex<T> {
    /// Creates a `Mutex<T>`, with the `Default` value for T.
    fn default() -> Mutex<T> {
        Mutex::new(Default::default())
    }
}

/// An implementation of a "scoped lock" of a mutex. When this structure
/// is dropped (falls out of scope) without unlocking, the panic occurs.
///
/// The lock must be explicitly unlocked by [`unlock`] method.
///
/// [`unlock`]: MutexGuard::unlock
pub struct MutexGuard<'a, T: 'a> {
    mutex: &'a Mutex<T>,
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: Sync> Sync for MutexGuard<'_, T> {}

impl<'a, T> MutexGuard<'a, T> {
    fn new(mutex: &'a Mutex<T>) -> Self {
        Self {
            mutex,
            _not_send: PhantomData,
        }
    }

    /// The mutex this guard holds.
    pub fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }

    /// Releases the underlying [`Mutex`].
    ///
    /// If threads sleep on the mutex, one of them becomes the holder before
    /// this returns.
    pub fn unlock(self) {
        self.mutex.release();
        core::mem::forget(self);
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            panic!("`.unlock()` must be explicitly called for MutexGuard.");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::priority::PriorityScheduler;
    use keos::sync::InterruptGuard;

    #[test]
    fn next_owner_must_sleep_on_the_mutex() {
        let scheduler = PriorityScheduler::new();
        let _guard = InterruptGuard::new();
        let queue = scheduler.new_thread_queue(true);
        queue.acquire(1);
        queue.wait_for_access(2);
        let mut state = State {
            holder: Some(1),
            queue: Some(queue),
            waiters: VecDeque::new(),
        };
        assert_eq!(
            state.take_next().err(),
            Some(PreconditionViolation::NotWaiting {
                op: "unlock",
                tid: 2
            })
        );
    }

    #[test]
    fn free_of_sleepers_has_no_next_owner() {
        let mut state = State {
            holder: Some(1),
            queue: None,
            waiters: VecDeque::new(),
        };
        assert!(matches!(state.take_next(), Ok(None)));
    }
}
