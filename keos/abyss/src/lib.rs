//! The abyss of kernel that operates the simulated machine.
//!
//! KeOS-threads runs its kernel on a hosted simulator rather than on bare
//! metal. This crate is the "hardware" of that simulator: it provides exactly
//! the pieces of a uniprocessor that the thread subsystem depends on.
//!
//! - [`interrupt`]: the per-context interrupt-enable flag, exposed as
//!   [`InterruptGuard`], and delivery of the timer interrupt at instruction
//!   boundaries.
//! - [`timer`]: the virtual tick clock and the programmable timer device.
//! - [`spinlock`]: a lock that also masks interrupts while it is held.
//! - [`kprint`]: the kernel console and logger.
//!
//! You are **not** supposed to use the modules of this crate directly when
//! writing kernel code; the [`keos`] crate re-exports the parts that kernel
//! code needs.
//!
//! [`keos`]: ../keos/index.html
//! [`InterruptGuard`]: interrupt::InterruptGuard

#[doc(hidden)]
pub use log;

#[doc(hidden)]
#[macro_use]
pub mod kprint;
pub mod interrupt;
pub mod spinlock;
pub mod timer;

pub use spinlock::SpinLock;
