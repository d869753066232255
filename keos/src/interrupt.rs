//! Interrupt management.
use crate::thread::{Current, scheduler::scheduler};
use abyss::spinlock::SpinLock;
use std::sync::Arc;

/// A function run on every timer interrupt.
pub type TimerHook = Arc<dyn Fn() + Send + Sync>;

static TIMER_HOOKS: SpinLock<Vec<TimerHook>> = SpinLock::new(Vec::new());

/// Install the interrupt handlers of the kernel.
pub(crate) fn init(hooks: Vec<TimerHook>) {
    let mut guard = TIMER_HOOKS.lock();
    *guard = hooks;
    guard.unlock();
    abyss::interrupt::register_timer_handler(handle_timer_interrupt);
    abyss::interrupt::register_preempt_handler(handle_preempt);
}

/// The timer interrupt: run the hooks in registration order, then let the
/// scheduler account the tick.
fn handle_timer_interrupt() {
    let guard = TIMER_HOOKS.lock();
    let hooks = guard.clone();
    guard.unlock();

    for hook in hooks.iter() {
        hook();
    }
    scheduler().timer_tick();
}

fn handle_preempt() {
    if Current::try_get_tid().is_some() {
        Current::yield_now();
    }
}
