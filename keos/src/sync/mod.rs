//! Synchronization primitives of the machine.
//!
//! Disabling interrupts is the only way to make a sequence of operations
//! atomic on the single processor. [`InterruptGuard`] does exactly that, and
//! [`SpinLock`] combines it with a lock word.
pub use abyss::interrupt::InterruptGuard;
pub use abyss::spinlock::{SpinLock, SpinLockGuard, WouldBlock};
