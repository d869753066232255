//! # Sleeping synchronization primitives.
//!
//! The [`SpinLock`] of the kernel busy-waits, which is only acceptable for
//! very short critical sections. The primitives of this module put waiting
//! threads to sleep instead:
//!
//! | Primitive             | Blocks Thread? | Wakeup order                       |
//! |-----------------------|----------------|------------------------------------|
//! | [`SpinLock`]          | No (busy wait) | None                               |
//! | [`Mutex`]             | Yes            | Effective priority, then arrival   |
//! | [`ConditionVariable`] | Yes            | Arrival                            |
//!
//! [`SpinLock`]: keos::sync::SpinLock
pub mod condition_variable;
pub mod mutex;

pub use condition_variable::ConditionVariable;
pub use mutex::{Mutex, MutexGuard};
