//! # Sleeping on the timer.
//!
//! A thread that calls [`Alarm::sleep_for`] parks itself until the clock
//! reaches its deadline. Sleepers live in a [`WakeQueue`] ordered by
//! deadline; the timer hook installed by [`Alarm::install`] wakes every
//! sleeper whose deadline has passed. Sleepers with the same deadline wake up
//! in the order they fell asleep.
//!
//! Sleeping never spins: the deadline is also armed on the timer, so an idle
//! processor jumps straight to the interrupt that ends the nap.
//!
//! ```rust
//! use keos_threads::alarm::Alarm;
//! use std::sync::{Arc, OnceLock};
//!
//! let alarm = Arc::new(OnceLock::new());
//! let slot = alarm.clone();
//! let code = keos::boot(
//!     move |config| {
//!         let _ = slot.set(Alarm::install(config));
//!     },
//!     move || {
//!         let alarm = alarm.get().unwrap();
//!         alarm.sleep_for(10);
//!         assert!(keos::timer::now() >= 10);
//!     },
//! );
//! assert_eq!(code, Ok(0));
//! ```
use keos::{
    SystemConfigurationBuilder,
    sync::SpinLock,
    thread::{Current, ParkHandle},
};
use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    sync::Arc,
};

/// Something that can be woken up.
pub trait Wake {
    /// Wake it up.
    fn wake(self);
}

impl Wake for ParkHandle {
    fn wake(self) {
        self.unpark();
    }
}

struct Sleeper<H> {
    deadline: u64,
    seq: u64,
    handle: H,
}

impl<H> Sleeper<H> {
    fn key(&self) -> (u64, u64) {
        (self.deadline, self.seq)
    }
}

impl<H> PartialEq for Sleeper<H> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<H> Eq for Sleeper<H> {}

impl<H> PartialOrd for Sleeper<H> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<H> Ord for Sleeper<H> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Handles waiting for a deadline, earliest first.
pub struct WakeQueue<H: Wake> {
    sleepers: BinaryHeap<Reverse<Sleeper<H>>>,
    seq: u64,
}

impl<H: Wake> Default for WakeQueue<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Wake> WakeQueue<H> {
    /// Creates an empty queue.
    pub const fn new() -> Self {
        Self {
            sleepers: BinaryHeap::new(),
            seq: 0,
        }
    }

    /// Wake `handle` once the clock reaches `deadline`.
    pub fn push(&mut self, deadline: u64, handle: H) {
        let seq = self.seq;
        self.seq += 1;
        self.sleepers.push(Reverse(Sleeper {
            deadline,
            seq,
            handle,
        }));
    }

    /// Wake every handle whose deadline is at or before `now`, earliest
    /// deadline first. Returns how many were woken.
    pub fn wake_due(&mut self, now: u64) -> usize {
        let mut woken = 0;
        while self
            .sleepers
            .peek()
            .is_some_and(|Reverse(sleeper)| sleeper.deadline <= now)
        {
            if let Some(Reverse(sleeper)) = self.sleepers.pop() {
                sleeper.handle.wake();
                woken += 1;
            }
        }
        woken
    }

    /// The earliest deadline in the queue.
    pub fn next_deadline(&self) -> Option<u64> {
        self.sleepers.peek().map(|Reverse(sleeper)| sleeper.deadline)
    }

    /// Number of handles in the queue.
    pub fn len(&self) -> usize {
        self.sleepers.len()
    }

    /// Returns true if nothing waits in the queue.
    pub fn is_empty(&self) -> bool {
        self.sleepers.is_empty()
    }
}

/// The sleep service of the kernel.
pub struct Alarm {
    sleepers: SpinLock<WakeQueue<ParkHandle>>,
}

impl Default for Alarm {
    fn default() -> Self {
        Self::new()
    }
}

impl Alarm {
    /// Creates an alarm with no sleepers.
    pub const fn new() -> Self {
        Self {
            sleepers: SpinLock::new(WakeQueue::new()),
        }
    }

    /// Creates an alarm whose sleepers are woken by the timer of the kernel
    /// being configured.
    pub fn install(config: &mut SystemConfigurationBuilder) -> Arc<Self> {
        let alarm = Arc::new(Self::new());
        let hook = alarm.clone();
        config.register_timer_hook(move || hook.on_tick());
        alarm
    }

    /// Put the current thread to sleep for at least `ticks` ticks.
    ///
    /// Sleeping for zero ticks waits for the next timer interrupt.
    pub fn sleep_for(&self, ticks: u64) {
        Current::park_with(|handle| {
            let deadline = keos::timer::now().saturating_add(ticks);
            keos::debug!("Alarm: thread {} sleeps until {deadline}.", handle.tid());
            let mut sleepers = self.sleepers.lock();
            sleepers.push(deadline, handle);
            sleepers.unlock();
            keos::timer::arm(deadline);
        });
    }

    /// Number of sleeping threads.
    pub fn sleepers(&self) -> usize {
        let sleepers = self.sleepers.lock();
        let len = sleepers.len();
        sleepers.unlock();
        len
    }

    /// Timer hook: wake every thread whose deadline has passed.
    ///
    /// Every tick ends the time slice of the interrupted thread, whether or
    /// not anybody woke up.
    pub fn on_tick(&self) {
        let mut sleepers = self.sleepers.lock();
        sleepers.wake_due(keos::timer::now());
        sleepers.unlock();
        Current::yield_on_return();
    }
}
