//! Thread scheduler

use super::{CPU, Halt, Thread, halt, switch_to, wait_for_turn};
use abyss::spinlock::SpinLock;
use crossbeam_queue::SegQueue;
use std::sync::Arc;

/// A trait for a thread scheduler.
///
/// The [`Scheduler`] trait defines the common functionality expected from a
/// thread scheduler. It provides an interface for managing threads, determining
/// which thread to run next, and handling periodic timer interrupts. A thread
/// scheduler is responsible for controlling the execution of threads in a
/// system. The scheduler determines when each thread is allowed to run and
/// how CPU time is shared among all threads.
///
/// This trait can be implemented by different types of schedulers, such as
/// Round Robin, Priority-based, or Multi-level Queue schedulers. Each
/// implementation may have a unique strategy for selecting the next
/// thread to run and handling thread management.
///
/// Every method is called with interrupts disabled.
pub trait Scheduler: Send + Sync {
    /// Peek a next thread to run.
    ///
    /// This method checks the queue and returns the next thread to run. If no
    /// threads are available, it returns `None`.
    fn next_to_run(&self) -> Option<Box<Thread>>;

    /// Push a thread `th` into scheduling queue.
    ///
    /// This method adds the specified thread to the queue of threads waiting to
    /// be scheduled.
    fn push_to_queue(&self, th: Box<Thread>);

    /// Called on every timer interrupt.
    ///
    /// This method allows the scheduler to manage time slices (for example,
    /// by calling [`Current::yield_on_return`]) or adjust thread priorities
    /// as needed.
    ///
    /// [`Current::yield_on_return`]: super::Current::yield_on_return
    fn timer_tick(&self);

    /// Called when the thread `joiner` goes to sleep until the thread
    /// `joinee` exits.
    ///
    /// A scheduler may let the joiner lend its priority to the joinee until
    /// [`thread_exited`] reports the joinee gone.
    ///
    /// [`thread_exited`]: Scheduler::thread_exited
    fn thread_joining(&self, _joiner: u64, _joinee: u64) {}

    /// Called once when the thread `tid` exits, before its joiners wake up,
    /// so that the scheduler can drop its per-thread bookkeeping.
    fn thread_exited(&self, _tid: u64) {}
}

/// A First-in-first-out scheduler.
///
/// This is the scheduler of the kernel unless another one is configured. It
/// never preempts the running thread.
#[derive(Default)]
pub struct Fifo {
    runqueue: SegQueue<Box<Thread>>,
}

impl Scheduler for Fifo {
    fn next_to_run(&self) -> Option<Box<Thread>> {
        self.runqueue.pop()
    }
    fn push_to_queue(&self, th: Box<Thread>) {
        self.runqueue.push(th);
    }
    fn timer_tick(&self) {}
}

static SCHEDULER: SpinLock<Option<Arc<dyn Scheduler>>> = SpinLock::new(None);

/// Set the scheduler of the kernel.
pub(crate) fn set_scheduler(scheduler: Arc<dyn Scheduler>) {
    let mut guard = SCHEDULER.lock();
    let previous = guard.replace(scheduler);
    guard.unlock();
    drop(previous);
}

/// Get the reference of the kernel scheduler.
pub fn scheduler() -> Arc<dyn Scheduler> {
    let mut guard = SCHEDULER.lock();
    let sched = guard
        .get_or_insert_with(|| Arc::new(Fifo::default()) as Arc<dyn Scheduler>)
        .clone();
    guard.unlock();
    sched
}

/// Run the next thread on the processor.
///
/// `me` is the thread that gives up the processor, if it is going to wait
/// for the processor again; it has already been handed to the scheduler or
/// to a [`ParkHandle`]. When no thread is runnable, the processor idles
/// until the timer wakes somebody up. If nothing can ever wake up, the
/// machine halts with a deadlock.
///
/// Must be called with interrupts disabled.
///
/// [`ParkHandle`]: super::ParkHandle
pub(crate) fn dispatch(me: Option<u64>) {
    let sched = scheduler();
    loop {
        if !CPU.is_halted() {
            if let Some(next) = sched.next_to_run() {
                switch_to(next, me);
                return;
            }
            // Idle.
            if abyss::timer::fast_forward().is_some() {
                abyss::interrupt::raise_timer();
                abyss::interrupt::clear_preempt();
                continue;
            }
            warning!("Machine: every thread is blocked and no wakeup is pending.");
            halt(Halt::Deadlock);
        }
        if let Some(me) = me {
            wait_for_turn(me);
        }
        return;
    }
}
