//! # Priority scheduling with priority donation.
//!
//! The [`PriorityScheduler`] always runs the runnable thread with the highest
//! *effective* priority. Priorities range from [`PRIORITY_MINIMUM`] (0) to
//! [`PRIORITY_MAXIMUM`] (7); a thread starts at [`PRIORITY_DEFAULT`] (1).
//!
//! Strict priorities suffer from *priority inversion*: a low-priority thread
//! holding a lock is never scheduled while a medium-priority thread runs, so
//! a high-priority thread waiting for the lock starves. Priority donation
//! fixes this. Every resource a thread may wait for is a [`ThreadQueue`];
//! when the queue transfers priority, each waiter donates its effective
//! priority to the holder, and donations chain through any number of
//! queues:
//!
//! ```text
//!   H (1) holds A      W (5) waits on A      =>  H runs at 5
//!   H releases A, W acquires it              =>  H back at 1, W at 5
//! ```
//!
//! The ready queue of the scheduler is itself a queue that does not transfer
//! priority: runnable threads wait on it, and [`Scheduler::next_to_run`]
//! hands it to the waiter with the highest effective priority, the earliest
//! one among equals.
//!
//! Joins donate as well: a joined thread holds a transferring queue that its
//! joiners wait on until it exits.
//!
//! Effective priorities are cached and recomputed lazily; see
//! [`donation`] for the bookkeeping.
//!
//! ## Atomicity
//!
//! Every operation of this module, except [`PriorityScheduler::increase_priority`]
//! and [`PriorityScheduler::decrease_priority`], must be called with
//! interrupts disabled, e.g. while holding an [`InterruptGuard`]. Calling one
//! with interrupts enabled is a [`PreconditionViolation::NotAtomic`].
pub mod donation;

pub use donation::{
    DonationGraph, PRIORITY_DEFAULT, PRIORITY_MAXIMUM, PRIORITY_MINIMUM, Priority, QueueId,
};

use crate::error::{PreconditionViolation, fatal};
use keos::{
    Scheduler, SystemConfigurationBuilder,
    sync::{InterruptGuard, SpinLock},
    thread::{Current, JoinHandle, Thread, ThreadBuilder},
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};

struct Inner {
    graph: DonationGraph,
    ready_queue: QueueId,
    runnable: BTreeMap<u64, Box<Thread>>,
    /// Per joined thread, the queue its joiners wait on. The joined thread
    /// holds it.
    joins: BTreeMap<u64, QueueId>,
}

impl Inner {
    fn wait_for_exit(&mut self, joiner: u64, joinee: u64) -> Result<(), PreconditionViolation> {
        let queue = match self.joins.get(&joinee) {
            Some(&queue) => queue,
            None => {
                let queue = self.graph.new_resource_queue(true);
                self.graph.acquire(queue, joinee)?;
                self.joins.insert(joinee, queue);
                queue
            }
        };
        self.graph.wait_for_access(queue, joiner)
    }

    fn forget_thread(&mut self, tid: u64) -> Result<(), PreconditionViolation> {
        if let Some(queue) = self.joins.remove(&tid) {
            self.graph.remove_resource_queue(queue)?;
        }
        self.graph.forget_thread(tid);
        Ok(())
    }
}

/// A scheduler that runs threads in the order of their effective priority.
///
/// The handle is cheap to clone; all clones share one scheduler.
#[derive(Clone)]
pub struct PriorityScheduler {
    inner: Arc<SpinLock<Inner>>,
}

/// The scheduler of the last kernel configured with a priority scheduler. It
/// expires once the kernel drops its scheduler.
static INSTALLED: SpinLock<Weak<SpinLock<Inner>>> = SpinLock::new(Weak::new());

/// The priority scheduler the kernel runs with.
///
/// # Panics
/// Panics if the kernel runs another scheduler.
pub fn scheduler() -> PriorityScheduler {
    try_scheduler().unwrap_or_else(|| panic!("The priority scheduler is not installed."))
}

/// The installed priority scheduler, if any.
pub fn try_scheduler() -> Option<PriorityScheduler> {
    let guard = INSTALLED.lock();
    let inner = guard.upgrade();
    guard.unlock();
    inner.map(|inner| PriorityScheduler { inner })
}

fn ensure_atomic(op: &'static str) {
    if !InterruptGuard::is_guarded() {
        fatal(PreconditionViolation::NotAtomic { op });
    }
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityScheduler {
    /// Creates a scheduler with an empty ready queue.
    pub fn new() -> Self {
        let mut graph = DonationGraph::new();
        let ready_queue = graph.new_resource_queue(false);
        Self {
            inner: Arc::new(SpinLock::new(Inner {
                graph,
                ready_queue,
                runnable: BTreeMap::new(),
                joins: BTreeMap::new(),
            })),
        }
    }

    /// Make this scheduler the scheduler of the kernel being configured, and
    /// the one [`scheduler`] returns.
    pub fn install(&self, config: &mut SystemConfigurationBuilder) {
        config.set_scheduler(self.clone());
        let mut guard = INSTALLED.lock();
        *guard = Arc::downgrade(&self.inner);
        guard.unlock();
    }

    /// Run `f` on the donation graph. A violation reported by the graph is
    /// fatal.
    fn with_graph<R>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut DonationGraph) -> Result<R, PreconditionViolation>,
    ) -> R {
        ensure_atomic(op);
        let mut inner = self.inner.lock();
        let result = f(&mut inner.graph);
        inner.unlock();
        result.unwrap_or_else(|violation| fatal(violation))
    }

    /// Creates a resource queue. If `transfer_priority` is set, its waiters
    /// donate their effective priority to its holder.
    pub fn new_thread_queue(&self, transfer_priority: bool) -> ThreadQueue {
        let id = self.with_graph("new_thread_queue", |graph| {
            Ok(graph.new_resource_queue(transfer_priority))
        });
        ThreadQueue {
            scheduler: self.clone(),
            id,
        }
    }

    /// Base priority of the thread `tid`.
    pub fn get_priority(&self, tid: u64) -> Priority {
        self.with_graph("get_priority", |graph| Ok(graph.priority(tid)))
    }

    /// Effective priority of the thread `tid`.
    pub fn get_effective_priority(&self, tid: u64) -> Priority {
        self.with_graph("get_effective_priority", |graph| {
            Ok(graph.effective_priority(tid))
        })
    }

    /// Sets the base priority of the thread `tid`.
    pub fn set_priority(&self, tid: u64, priority: Priority) {
        self.with_graph("set_priority", |graph| graph.set_priority(tid, priority));
    }

    /// Raise the base priority of the current thread by one.
    ///
    /// Returns `false`, changing nothing, if it is already
    /// [`PRIORITY_MAXIMUM`].
    pub fn increase_priority(&self) -> bool {
        let _guard = InterruptGuard::new();
        let tid = Current::get_tid();
        let priority = self.get_priority(tid);
        if priority == PRIORITY_MAXIMUM {
            return false;
        }
        self.set_priority(tid, priority + 1);
        true
    }

    /// Lower the base priority of the current thread by one.
    ///
    /// Returns `false`, changing nothing, if it is already
    /// [`PRIORITY_MINIMUM`].
    pub fn decrease_priority(&self) -> bool {
        let _guard = InterruptGuard::new();
        let tid = Current::get_tid();
        let priority = self.get_priority(tid);
        if priority == PRIORITY_MINIMUM {
            return false;
        }
        self.set_priority(tid, priority - 1);
        true
    }

    /// Spawn a thread that starts with `priority`.
    ///
    /// The priority is in place before the thread first becomes runnable.
    pub fn spawn<F: FnOnce() + Send + 'static>(
        &self,
        builder: ThreadBuilder,
        priority: Priority,
        thread_fn: F,
    ) -> JoinHandle {
        let _guard = InterruptGuard::new();
        self.set_priority(builder.get_tid(), priority);
        builder.spawn(thread_fn)
    }
}

impl Scheduler for PriorityScheduler {
    fn next_to_run(&self) -> Option<Box<Thread>> {
        let mut inner = self.inner.lock();
        let ready_queue = inner.ready_queue;
        let next = match inner.graph.next_thread(ready_queue) {
            Ok(next) => next.and_then(|tid| inner.runnable.remove(&tid)),
            Err(violation) => {
                inner.unlock();
                fatal(violation);
            }
        };
        inner.unlock();
        next
    }

    fn push_to_queue(&self, th: Box<Thread>) {
        let mut inner = self.inner.lock();
        let ready_queue = inner.ready_queue;
        let tid = th.tid;
        let result = inner.graph.wait_for_access(ready_queue, tid);
        inner.runnable.insert(tid, th);
        inner.unlock();
        if let Err(violation) = result {
            fatal(violation);
        }
    }

    /// Every timer interrupt ends the time slice of the running thread.
    fn timer_tick(&self) {
        Current::yield_on_return();
    }

    /// The joiner donates to the joinee through a queue that transfers
    /// priority, like a lock the joinee holds until it exits.
    fn thread_joining(&self, joiner: u64, joinee: u64) {
        let mut inner = self.inner.lock();
        let result = inner.wait_for_exit(joiner, joinee);
        inner.unlock();
        if let Err(violation) = result {
            fatal(violation);
        }
    }

    fn thread_exited(&self, tid: u64) {
        let mut inner = self.inner.lock();
        let result = inner.forget_thread(tid);
        inner.unlock();
        if let Err(violation) = result {
            fatal(violation);
        }
    }
}

/// A resource that threads wait for, with priority donation from its
/// waiters to its holder when it transfers priority.
///
/// Dropping the handle destroys the queue.
pub struct ThreadQueue {
    scheduler: PriorityScheduler,
    id: QueueId,
}

impl ThreadQueue {
    /// Name of the queue in the donation graph.
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Registers the thread `tid` as a waiter.
    pub fn wait_for_access(&self, tid: u64) {
        self.scheduler
            .with_graph("wait_for_access", |graph| graph.wait_for_access(self.id, tid));
    }

    /// Makes the thread `tid` the holder, without waiting.
    pub fn acquire(&self, tid: u64) {
        self.scheduler
            .with_graph("acquire", |graph| graph.acquire(self.id, tid));
    }

    /// Hands the queue to the waiter with the highest effective priority and
    /// returns it, or `None` if nobody waits.
    pub fn next_thread(&self) -> Option<u64> {
        self.scheduler
            .with_graph("next_thread", |graph| graph.next_thread(self.id))
    }

    /// The waiter [`next_thread`] would pick, without picking it.
    ///
    /// [`next_thread`]: Self::next_thread
    pub fn peek_next(&self) -> Option<u64> {
        self.scheduler
            .with_graph("peek_next", |graph| graph.peek_next(self.id))
    }

    /// Releases the queue held by the thread `tid`.
    pub fn release(&self, tid: u64) {
        self.scheduler
            .with_graph("release", |graph| graph.release(self.id, tid));
    }

    /// Current holder of the queue.
    pub fn holder(&self) -> Option<u64> {
        self.scheduler
            .with_graph("holder", |graph| graph.holder(self.id))
    }

    /// The priority this queue donates to its holder.
    pub fn effective_priority(&self) -> Priority {
        self.scheduler.with_graph("effective_priority", |graph| {
            graph.queue_effective_priority(self.id)
        })
    }

    /// Whether waiters donate to the holder.
    pub fn transfers_priority(&self) -> bool {
        self.scheduler
            .with_graph("transfers_priority", |graph| graph.transfers_priority(self.id))
    }
}

impl Drop for ThreadQueue {
    fn drop(&mut self) {
        let mut inner = self.scheduler.inner.lock();
        let result = inner.graph.remove_resource_queue(self.id);
        inner.unlock();
        if let Err(violation) = result
            && !std::thread::panicking()
        {
            fatal(violation);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ready_queue_order() {
        let scheduler = PriorityScheduler::new();
        let low = Thread::new("low");
        let high = Thread::new("high");
        let other = Thread::new("other");
        let (low_tid, high_tid, other_tid) = (low.tid, high.tid, other.tid);

        let guard = InterruptGuard::new();
        scheduler.set_priority(high_tid, 6);
        scheduler.push_to_queue(low);
        scheduler.push_to_queue(high);
        scheduler.push_to_queue(other);
        drop(guard);

        let order: Vec<u64> = std::iter::from_fn(|| scheduler.next_to_run())
            .map(|th| th.tid)
            .collect();
        assert_eq!(order, vec![high_tid, low_tid, other_tid]);
    }

    #[test]
    fn thread_queue_donates() {
        let scheduler = PriorityScheduler::new();
        let _guard = InterruptGuard::new();
        let lock = scheduler.new_thread_queue(true);
        assert!(lock.transfers_priority());
        scheduler.set_priority(2, 5);
        lock.acquire(1);
        lock.wait_for_access(2);
        assert_eq!(scheduler.get_effective_priority(1), 5);
        assert_eq!(lock.effective_priority(), 5);
        assert_eq!(lock.peek_next(), Some(2));

        assert_eq!(lock.next_thread(), Some(2));
        assert_eq!(lock.holder(), Some(2));
        assert_eq!(scheduler.get_effective_priority(1), PRIORITY_DEFAULT);
        lock.release(2);
        assert_eq!(lock.holder(), None);
    }

    #[test]
    fn dropping_queue_ends_donation() {
        let scheduler = PriorityScheduler::new();
        let _guard = InterruptGuard::new();
        let lock = scheduler.new_thread_queue(true);
        scheduler.set_priority(2, 7);
        lock.acquire(1);
        lock.wait_for_access(2);
        assert_eq!(scheduler.get_effective_priority(1), 7);
        drop(lock);
        assert_eq!(scheduler.get_effective_priority(1), PRIORITY_DEFAULT);
    }

    #[test]
    fn joiner_donates_until_exit() {
        let scheduler = PriorityScheduler::new();
        let _guard = InterruptGuard::new();
        scheduler.set_priority(2, 6);
        scheduler.set_priority(3, 4);
        scheduler.thread_joining(2, 1);
        scheduler.thread_joining(3, 1);
        assert_eq!(scheduler.get_effective_priority(1), 6);
        assert_eq!(scheduler.get_priority(1), PRIORITY_DEFAULT);

        scheduler.thread_exited(1);
        let inner = scheduler.inner.lock();
        let (joins, threads) = (inner.joins.len(), inner.graph.thread_count());
        inner.unlock();
        assert_eq!((joins, threads), (0, 2));
        assert_eq!(scheduler.get_effective_priority(2), 6);
        assert_eq!(scheduler.get_effective_priority(3), 4);
    }

    #[test]
    #[should_panic(expected = "does not exist")]
    fn dropping_a_removed_queue() {
        let scheduler = PriorityScheduler::new();
        let _guard = InterruptGuard::new();
        let lock = scheduler.new_thread_queue(true);
        let mut inner = scheduler.inner.lock();
        inner.graph.remove_resource_queue(lock.id()).unwrap();
        inner.unlock();
        drop(lock);
    }

    #[test]
    #[should_panic(expected = "called with interrupts enabled")]
    fn requires_atomic_section() {
        let scheduler = PriorityScheduler::new();
        scheduler.set_priority(1, 3);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn rejects_out_of_range_priority() {
        let scheduler = PriorityScheduler::new();
        let _guard = InterruptGuard::new();
        scheduler.set_priority(1, PRIORITY_MAXIMUM + 1);
    }

    #[test]
    #[should_panic(expected = "does not hold queue")]
    fn release_by_non_holder() {
        let scheduler = PriorityScheduler::new();
        let _guard = InterruptGuard::new();
        let lock = scheduler.new_thread_queue(true);
        lock.acquire(1);
        lock.release(2);
    }
}
