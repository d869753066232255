//! Misuse of the thread subsystem.

use thiserror::Error;

/// A broken precondition of a thread-subsystem operation.
///
/// Violations are programming errors of the caller. They are never returned;
/// [`fatal`] logs the violation and panics, which halts the machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreconditionViolation {
    /// The operation must run inside an atomic section.
    #[error("{op} called with interrupts enabled")]
    NotAtomic { op: &'static str },

    /// Priorities range over [`PRIORITY_MINIMUM`, `PRIORITY_MAXIMUM`].
    ///
    /// [`PRIORITY_MINIMUM`]: crate::priority::PRIORITY_MINIMUM
    /// [`PRIORITY_MAXIMUM`]: crate::priority::PRIORITY_MAXIMUM
    #[error("{op}: priority {priority} of thread {tid} is out of range")]
    PriorityOutOfRange {
        op: &'static str,
        tid: u64,
        priority: u32,
    },

    /// Only the holder of a resource queue may release it.
    #[error("{op}: thread {tid} does not hold queue #{queue}")]
    NotHolder {
        op: &'static str,
        tid: u64,
        queue: usize,
    },

    /// The thread locks a mutex it already holds.
    #[error("{op}: thread {tid} already holds the mutex")]
    AlreadyHeld { op: &'static str, tid: u64 },

    /// Condition operations require the caller to hold the mutex.
    #[error("{op}: thread {tid} does not hold the mutex")]
    MutexNotHeld { op: &'static str, tid: u64 },

    /// A mutex hands itself only to a thread sleeping on it.
    #[error("{op}: thread {tid} does not sleep on the mutex")]
    NotWaiting { op: &'static str, tid: u64 },

    /// A condition variable is bound to the first mutex it is used with.
    #[error("{op}: condition variable is bound to another mutex")]
    ForeignMutex { op: &'static str },

    /// The queue handle does not name a live resource queue.
    #[error("{op}: queue #{queue} does not exist")]
    UnknownQueue { op: &'static str, queue: usize },

    /// Donation chains must be acyclic.
    #[error("donation cycle through node #{node}")]
    DonationCycle { node: usize },
}

/// Report a precondition violation and abort the running simulation.
#[track_caller]
pub fn fatal(violation: PreconditionViolation) -> ! {
    log::error!("Precondition violated: {violation}");
    panic!("{violation}")
}
