//! Virtual clock and the timer device.
//!
//! Time is counted in ticks. The clock advances by one tick at every
//! instruction boundary of the running context (see [`crate::interrupt`]),
//! and the timer device fires every [`period`] ticks.
//!
//! An idle processor does not advance the clock by itself. Instead, kernel
//! code [`arm`]s the deadlines it waits for, and [`fast_forward`] jumps the
//! clock to the first timer interrupt that serves the earliest of them.
use crate::spinlock::SpinLock;
use core::cmp::Reverse;
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::BinaryHeap;

/// Default number of ticks between two timer interrupts.
pub const DEFAULT_PERIOD: u64 = 1;

static TICKS: AtomicU64 = AtomicU64::new(0);
static PERIOD: AtomicU64 = AtomicU64::new(DEFAULT_PERIOD);
static ARMED: SpinLock<BinaryHeap<Reverse<u64>>> = SpinLock::new(BinaryHeap::new());

/// Current value of the virtual clock.
pub fn now() -> u64 {
    TICKS.load(Ordering::SeqCst)
}

/// Number of ticks between two timer interrupts.
pub fn period() -> u64 {
    PERIOD.load(Ordering::SeqCst)
}

/// Power-on reset: zero the clock, disarm every deadline and program the
/// timer to fire every `period` ticks.
///
/// # Panics
/// Panics if `period` is zero.
pub fn reset(period: u64) {
    assert!(period > 0, "Timer period must be positive.");
    let mut armed = ARMED.lock();
    armed.clear();
    TICKS.store(0, Ordering::SeqCst);
    PERIOD.store(period, Ordering::SeqCst);
    armed.unlock();
}

/// Request a wakeup of the idle processor at `deadline`.
///
/// Armed deadlines are one-shot: a deadline is disarmed by the first timer
/// interrupt at or after it.
pub fn arm(deadline: u64) {
    let mut armed = ARMED.lock();
    armed.push(Reverse(deadline));
    armed.unlock();
}

/// Earliest armed deadline, if any.
pub fn next_armed() -> Option<u64> {
    let armed = ARMED.lock();
    let next = armed.peek().map(|Reverse(deadline)| *deadline);
    armed.unlock();
    next
}

fn disarm_until(tick: u64) {
    let mut armed = ARMED.lock();
    while armed.peek().is_some_and(|Reverse(deadline)| *deadline <= tick) {
        armed.pop();
    }
    armed.unlock();
}

/// Advance the clock by one tick. Returns true if the timer fires on this
/// tick.
pub(crate) fn tick() -> bool {
    let now = TICKS.fetch_add(1, Ordering::SeqCst) + 1;
    let fires = now % period() == 0;
    if fires {
        disarm_until(now);
    }
    fires
}

/// Jump the clock to the first timer interrupt that serves the earliest
/// armed deadline.
///
/// Returns the new time, or `None` if nothing is armed. The caller is
/// expected to deliver the timer interrupt afterwards.
pub fn fast_forward() -> Option<u64> {
    let deadline = next_armed()?;
    let period = period();
    let target = deadline.max(now() + 1).div_ceil(period) * period;
    TICKS.store(target, Ordering::SeqCst);
    disarm_until(target);
    Some(target)
}
