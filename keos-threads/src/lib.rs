//! # Thread services of KeOS.
//!
//! This crate builds the blocking services of the kernel on top of the
//! thread substrate of [`keos`]:
//!
//! - [`alarm`]: sleeping until the clock reaches a deadline.
//! - [`sync`]: a sleeping [`Mutex`] and a [`ConditionVariable`].
//! - [`priority`]: a priority scheduler with priority donation through every
//!   resource threads wait on.
//!
//! A kernel that wants all of them installs both services while it is being
//! configured:
//!
//! ```rust
//! use keos_threads::{alarm::Alarm, priority::PriorityScheduler};
//!
//! let code = keos::boot(
//!     |config| {
//!         PriorityScheduler::new().install(config);
//!         Alarm::install(config);
//!     },
//!     || {},
//! );
//! assert_eq!(code, Ok(0));
//! ```
//!
//! Misusing any of these services, e.g. unlocking a mutex the caller does not
//! hold, is a [`PreconditionViolation`]: it is logged and halts the machine
//! with a panic.
//!
//! [`Mutex`]: sync::Mutex
//! [`ConditionVariable`]: sync::ConditionVariable
pub mod alarm;
pub mod error;
pub mod priority;
pub mod sync;

pub use error::PreconditionViolation;
