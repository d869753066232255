//! Interrupt
//!
//! The simulated processor has a single interrupt source, the timer. Every
//! execution context (a kernel thread) owns its interrupt-enable flag, saved
//! and restored across context switches like `RFLAGS.IF` on x86_64. The flag
//! is modelled as a nesting counter: [`InterruptGuard::new`] disables
//! interrupts and dropping the outermost guard enables them again.
//!
//! Enabling interrupts is an *instruction boundary*. There the virtual clock
//! advances by one tick and, if the timer fires, the registered timer handler
//! runs with interrupts disabled. A handler may ask for the interrupted
//! context to be preempted on return (see [`request_preempt`]); the preempt
//! handler then runs once the interrupt has been fully handled.
//!
//! Host threads that are not attached to the machine (see
//! [`attach_context`]) can still use guards for mutual exclusion, but never
//! observe interrupts.
#[cfg(doc)]
use crate::spinlock::SpinLockGuard;
use crate::spinlock::SpinLock;
use core::cell::Cell;
use core::marker::PhantomData;

bitflags::bitflags! {
    /// Interrupt work waiting for the next instruction boundary.
    pub struct Pending: u8 {
        /// The interrupted context must yield the processor on return.
        const PREEMPT = 1 << 0;
    }
}

struct InterruptGuardInner {
    cnt: Cell<isize>,
    attached: Cell<bool>,
    delivering: Cell<bool>,
    pending: Cell<Pending>,
}

impl InterruptGuardInner {
    const fn new() -> Self {
        Self {
            cnt: Cell::new(0),
            attached: Cell::new(false),
            delivering: Cell::new(false),
            pending: Cell::new(Pending::empty()),
        }
    }

    fn save_nested_interrupt_state(&self) {
        self.cnt.set(self.cnt.get() + 1);
    }

    fn load_nested_interrupt_state(&self) {
        let prev = self.cnt.get();
        assert!(prev > 0, "Mismatched InterruptGuard drop calls: {prev}");
        if prev > 1 || !self.attached.get() || self.delivering.get() || std::thread::panicking()
        {
            self.cnt.set(prev - 1);
            return;
        }

        // Instruction boundary: the counter stays at 1 while the handler runs.
        self.delivering.set(true);
        if crate::timer::tick()
            && let Some(handler) = load(&TIMER_HANDLER)
        {
            handler();
        }
        self.cnt.set(0);
        if self.take_pending(Pending::PREEMPT)
            && let Some(handler) = load(&PREEMPT_HANDLER)
        {
            handler();
        }
        self.delivering.set(false);
    }

    fn decrement_count(&self) {
        let prev = self.cnt.get();
        assert!(prev > 0, "Mismatched InterruptGuard drop calls: {prev}");
        self.cnt.set(prev - 1);
    }

    fn take_pending(&self, flag: Pending) -> bool {
        let pending = self.pending.get();
        self.pending.set(pending - flag);
        pending.contains(flag)
    }
}

thread_local! {
    static STATE: InterruptGuardInner = const { InterruptGuardInner::new() };
}

static TIMER_HANDLER: SpinLock<Option<fn()>> = SpinLock::new(None);
static PREEMPT_HANDLER: SpinLock<Option<fn()>> = SpinLock::new(None);

fn load(slot: &SpinLock<Option<fn()>>) -> Option<fn()> {
    let guard = slot.lock();
    let handler = *guard;
    guard.unlock();
    handler
}

/// Enumeration representing the interrupt state.
#[derive(PartialEq, Eq, Debug)]
pub enum InterruptState {
    /// Interrupts are enabled.
    On,
    /// Interrupts are disabled.
    Off,
}

impl InterruptState {
    /// Reads the interrupt state of the current context.
    pub fn current() -> Self {
        if InterruptGuard::is_guarded() {
            Self::Off
        } else {
            Self::On
        }
    }
}

/// An RAII-based guard for managing interrupt disabling.
///
/// When an `InterruptGuard` is created, interrupts are disabled. When the
/// outermost guard is dropped, interrupts are enabled again and any due
/// timer interrupt is delivered.
///
/// **Important:**
/// - [`InterruptGuard`] instances **must be dropped in reverse order of their
///   creation** to prevent unintended interrupt state changes.
/// - A guard belongs to the context that created it. It is neither [`Send`]
///   nor [`Sync`].
///
/// Every [`SpinLockGuard`] holds an `InterruptGuard`, so holding a spinlock
/// is always an atomic section.
pub struct InterruptGuard {
    _not_send: PhantomData<*const ()>,
}

impl InterruptGuard {
    /// Creates a new `InterruptGuard`, disabling interrupts.
    ///
    /// # Example
    /// ```rust
    /// let _guard = abyss::interrupt::InterruptGuard::new(); // Disables interrupts
    /// // Critical section...
    /// // Interrupts are restored when `_guard` goes out of scope.
    /// ```
    pub fn new() -> Self {
        STATE.with(|s| s.save_nested_interrupt_state());
        Self {
            _not_send: PhantomData,
        }
    }

    /// Leave the section without enabling interrupts.
    ///
    /// Used by a context that is about to vanish and will never enable its
    /// interrupts again.
    pub fn consume(self) {
        STATE.with(|s| s.decrement_count());
        core::mem::forget(self);
    }

    /// Returns true if the current context has interrupts disabled.
    pub fn is_guarded() -> bool {
        STATE.with(|s| s.cnt.get() > 0)
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        STATE.with(|s| s.load_nested_interrupt_state());
    }
}

/// Attach the calling host thread to the machine as an execution context.
///
/// Only attached contexts advance the clock and receive interrupts.
pub fn attach_context() {
    STATE.with(|s| {
        s.attached.set(true);
        s.pending.set(Pending::empty());
    });
}

/// Detach the calling host thread from the machine.
///
/// A context that finished running kernel code must not drive the clock
/// while it cleans up.
pub fn detach_context() {
    STATE.with(|s| s.attached.set(false));
}

/// Register the handler of the timer interrupt.
pub fn register_timer_handler(handler: fn()) {
    let mut guard = TIMER_HANDLER.lock();
    *guard = Some(handler);
    guard.unlock();
}

/// Register the handler that preempts the interrupted context.
pub fn register_preempt_handler(handler: fn()) {
    let mut guard = PREEMPT_HANDLER.lock();
    *guard = Some(handler);
    guard.unlock();
}

/// Ask the interrupted context to be preempted when the current interrupt
/// returns.
///
/// Outside of interrupt handling, the request is served at the next
/// instruction boundary.
pub fn request_preempt() {
    STATE.with(|s| s.pending.set(s.pending.get() | Pending::PREEMPT));
}

/// Drop any preemption request of the current context.
pub fn clear_preempt() {
    STATE.with(|s| {
        s.take_pending(Pending::PREEMPT);
    });
}

/// Run the timer handler directly, as an idle processor does when the timer
/// wakes it up.
///
/// The caller must have interrupts disabled.
pub fn raise_timer() {
    assert!(
        InterruptGuard::is_guarded(),
        "Timer interrupt raised while interrupts are enabled."
    );
    if let Some(handler) = load(&TIMER_HANDLER) {
        handler();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nesting() {
        assert!(!InterruptGuard::is_guarded());
        let outer = InterruptGuard::new();
        let inner = InterruptGuard::new();
        assert_eq!(InterruptState::current(), InterruptState::Off);
        drop(inner);
        assert!(InterruptGuard::is_guarded());
        drop(outer);
        assert_eq!(InterruptState::current(), InterruptState::On);
    }

    #[test]
    fn consume_leaves_section() {
        let guard = InterruptGuard::new();
        guard.consume();
        assert!(!InterruptGuard::is_guarded());
    }

    #[test]
    fn pending_preempt_is_taken_once() {
        request_preempt();
        STATE.with(|s| {
            assert!(s.take_pending(Pending::PREEMPT));
            assert!(!s.take_pending(Pending::PREEMPT));
        });
        request_preempt();
        clear_preempt();
        STATE.with(|s| assert!(s.pending.get().is_empty()));
    }
}
