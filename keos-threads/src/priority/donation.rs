//! # Donation graph.
//!
//! Threads and resource queues form a bipartite graph. A thread *wants* the
//! queues it waits on and *holds* the queues it owns; a queue has at most one
//! holder and an ordered list of waiters. Priority flows against the edges:
//!
//! ```text
//!   effective(thread) = max(base(thread), effective(q) for q in holds)
//!   effective(queue)  = max(effective(t) for t in waiting)   if transfer
//!                     = PRIORITY_MINIMUM                      otherwise
//! ```
//!
//! Every node caches its effective priority next to a dirty flag. Mutations
//! mark the affected node dirty and push the flag along the dependents: from
//! a queue to its holder, and from a thread to every queue it wants. A node
//! that is already dirty stops the walk, because all of its dependents are
//! already dirty. Reads recompute dirty nodes on demand and clear their flag.
//!
//! Both kinds of nodes live in one [`Slab`]. Threads are created lazily the
//! first time their id is used and destroyed by
//! [`DonationGraph::forget_thread`].
use crate::error::PreconditionViolation;
use slab::Slab;
use std::collections::BTreeMap;

/// Priority of a thread. Larger is more urgent.
pub type Priority = u32;

/// Lowest priority.
pub const PRIORITY_MINIMUM: Priority = 0;
/// Highest priority.
pub const PRIORITY_MAXIMUM: Priority = 7;
/// Priority of a thread nobody has configured.
pub const PRIORITY_DEFAULT: Priority = 1;

/// Name of a resource queue in a [`DonationGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueId(usize);

impl QueueId {
    /// Slot of the queue in the graph.
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Clone, Copy, Debug)]
struct Cached {
    value: Priority,
    dirty: bool,
}

#[derive(Debug)]
struct ThreadNode {
    tid: u64,
    base: Priority,
    cached: Cached,
    holds: Vec<usize>,
    wants: Vec<usize>,
}

#[derive(Debug)]
struct QueueNode {
    transfer_priority: bool,
    cached: Cached,
    waiting: Vec<usize>,
    holder: Option<usize>,
}

#[derive(Debug)]
enum Node {
    Thread(ThreadNode),
    Queue(QueueNode),
}

/// Threads, resource queues and the donation edges between them.
#[derive(Debug, Default)]
pub struct DonationGraph {
    nodes: Slab<Node>,
    threads: BTreeMap<u64, usize>,
}

impl DonationGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a resource queue. Waiters of a queue with `transfer_priority`
    /// donate their effective priority to its holder.
    pub fn new_resource_queue(&mut self, transfer_priority: bool) -> QueueId {
        QueueId(self.nodes.insert(Node::Queue(QueueNode {
            transfer_priority,
            cached: Cached {
                value: PRIORITY_MINIMUM,
                dirty: false,
            },
            waiting: Vec::new(),
            holder: None,
        })))
    }

    /// Destroys a resource queue. Its holder stops receiving donations
    /// through it and its waiters stop wanting it.
    pub fn remove_resource_queue(&mut self, queue: QueueId) -> Result<(), PreconditionViolation> {
        self.queue(queue, "remove_resource_queue")?;
        self.release_holder(queue.0);
        let Node::Queue(node) = self.nodes.remove(queue.0) else {
            unreachable!()
        };
        for waiter in node.waiting {
            self.thread_mut(waiter).wants.retain(|&q| q != queue.0);
        }
        Ok(())
    }

    /// Registers `tid` as a waiter of `queue`, at the end of the waiting
    /// order.
    ///
    /// Waiting is idempotent. If `tid` holds the queue, it releases it first.
    pub fn wait_for_access(&mut self, queue: QueueId, tid: u64) -> Result<(), PreconditionViolation> {
        self.queue(queue, "wait_for_access")?;
        let thread = self.thread_slot(tid);
        if self.queue_mut(queue.0).holder == Some(thread) {
            self.release_holder(queue.0);
        }
        let node = self.queue_mut(queue.0);
        if !node.waiting.contains(&thread) {
            node.waiting.push(thread);
            self.thread_mut(thread).wants.push(queue.0);
        }
        self.invalidate(queue.0);
        Ok(())
    }

    /// Makes `tid` the holder of `queue`, replacing the previous holder.
    ///
    /// If `tid` was waiting on the queue, it stops waiting.
    pub fn acquire(&mut self, queue: QueueId, tid: u64) -> Result<(), PreconditionViolation> {
        self.queue(queue, "acquire")?;
        let thread = self.thread_slot(tid);
        self.take(queue.0, thread);
        Ok(())
    }

    /// Picks the waiter with the highest effective priority, the earliest
    /// one among equals, and makes it the holder of `queue`.
    ///
    /// Returns `None`, leaving the holder in place, if nobody waits.
    pub fn next_thread(&mut self, queue: QueueId) -> Result<Option<u64>, PreconditionViolation> {
        self.queue(queue, "next_thread")?;
        let Some(next) = self.pick_next(queue.0) else {
            return Ok(None);
        };
        self.take(queue.0, next);
        Ok(Some(self.thread_mut(next).tid))
    }

    /// The waiter [`next_thread`] would pick, without changing the graph.
    ///
    /// [`next_thread`]: Self::next_thread
    pub fn peek_next(&mut self, queue: QueueId) -> Result<Option<u64>, PreconditionViolation> {
        self.queue(queue, "peek_next")?;
        let next = self.pick_next(queue.0);
        Ok(next.map(|next| self.thread(next).tid))
    }

    /// Releases `queue` held by `tid`. The queue becomes holder-less.
    pub fn release(&mut self, queue: QueueId, tid: u64) -> Result<(), PreconditionViolation> {
        let holder = self.queue(queue, "release")?.holder;
        match self.threads.get(&tid) {
            Some(&thread) if holder == Some(thread) => {
                self.release_holder(queue.0);
                Ok(())
            }
            _ => Err(PreconditionViolation::NotHolder {
                op: "release",
                tid,
                queue: queue.0,
            }),
        }
    }

    /// Current holder of `queue`.
    pub fn holder(&self, queue: QueueId) -> Result<Option<u64>, PreconditionViolation> {
        let holder = self.queue(queue, "holder")?.holder;
        Ok(holder.map(|thread| self.thread(thread).tid))
    }

    /// Waiters of `queue` in the order they started waiting.
    pub fn waiters(&self, queue: QueueId) -> Result<Vec<u64>, PreconditionViolation> {
        let node = self.queue(queue, "waiters")?;
        Ok(node
            .waiting
            .iter()
            .map(|&thread| self.thread(thread).tid)
            .collect())
    }

    /// Whether waiters of `queue` donate to its holder.
    pub fn transfers_priority(&self, queue: QueueId) -> Result<bool, PreconditionViolation> {
        Ok(self.queue(queue, "transfers_priority")?.transfer_priority)
    }

    /// Base priority of `tid`.
    pub fn priority(&self, tid: u64) -> Priority {
        self.threads
            .get(&tid)
            .map_or(PRIORITY_DEFAULT, |&thread| self.thread(thread).base)
    }

    /// Effective priority of `tid`: its base priority raised by every
    /// donation it receives.
    pub fn effective_priority(&mut self, tid: u64) -> Priority {
        let thread = self.thread_slot(tid);
        self.effective(thread, 0)
    }

    /// Effective priority of `queue`: the donation it passes to its holder.
    pub fn queue_effective_priority(&mut self, queue: QueueId) -> Result<Priority, PreconditionViolation> {
        self.queue(queue, "queue_effective_priority")?;
        Ok(self.effective(queue.0, 0))
    }

    /// Sets the base priority of `tid`.
    pub fn set_priority(&mut self, tid: u64, priority: Priority) -> Result<(), PreconditionViolation> {
        if !(PRIORITY_MINIMUM..=PRIORITY_MAXIMUM).contains(&priority) {
            return Err(PreconditionViolation::PriorityOutOfRange {
                op: "set_priority",
                tid,
                priority,
            });
        }
        let thread = self.thread_slot(tid);
        let node = self.thread_mut(thread);
        if node.base != priority {
            node.base = priority;
            self.invalidate(thread);
        }
        Ok(())
    }

    /// Removes `tid` from the graph. Queues it holds become holder-less and
    /// queues it waits on lose it as a waiter.
    pub fn forget_thread(&mut self, tid: u64) {
        let Some(thread) = self.threads.remove(&tid) else {
            return;
        };
        let Node::Thread(node) = self.nodes.remove(thread) else {
            unreachable!()
        };
        for queue in node.holds {
            self.queue_mut(queue).holder = None;
        }
        for queue in node.wants {
            self.queue_mut(queue).waiting.retain(|&t| t != thread);
            self.invalidate(queue);
        }
    }

    /// Number of threads the graph tracks.
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    fn queue(&self, queue: QueueId, op: &'static str) -> Result<&QueueNode, PreconditionViolation> {
        match self.nodes.get(queue.0) {
            Some(Node::Queue(node)) => Ok(node),
            _ => Err(PreconditionViolation::UnknownQueue {
                op,
                queue: queue.0,
            }),
        }
    }

    fn queue_mut(&mut self, slot: usize) -> &mut QueueNode {
        match &mut self.nodes[slot] {
            Node::Queue(node) => node,
            Node::Thread(_) => unreachable!("slot {slot} is not a queue"),
        }
    }

    fn thread(&self, slot: usize) -> &ThreadNode {
        match &self.nodes[slot] {
            Node::Thread(node) => node,
            Node::Queue(_) => unreachable!("slot {slot} is not a thread"),
        }
    }

    fn thread_mut(&mut self, slot: usize) -> &mut ThreadNode {
        match &mut self.nodes[slot] {
            Node::Thread(node) => node,
            Node::Queue(_) => unreachable!("slot {slot} is not a thread"),
        }
    }

    fn thread_slot(&mut self, tid: u64) -> usize {
        let nodes = &mut self.nodes;
        *self.threads.entry(tid).or_insert_with(|| {
            nodes.insert(Node::Thread(ThreadNode {
                tid,
                base: PRIORITY_DEFAULT,
                cached: Cached {
                    value: PRIORITY_DEFAULT,
                    dirty: false,
                },
                holds: Vec::new(),
                wants: Vec::new(),
            }))
        })
    }

    /// Detach the holder of `queue`, if any.
    fn release_holder(&mut self, queue: usize) {
        if let Some(holder) = self.queue_mut(queue).holder.take() {
            self.thread_mut(holder).holds.retain(|&q| q != queue);
            self.invalidate(holder);
        }
    }

    /// Make `thread` the holder of `queue`.
    fn take(&mut self, queue: usize, thread: usize) {
        if self.queue_mut(queue).holder != Some(thread) {
            self.release_holder(queue);
        }
        let node = self.queue_mut(queue);
        let was_waiting = node.waiting.contains(&thread);
        node.waiting.retain(|&t| t != thread);
        node.holder = Some(thread);

        let node = self.thread_mut(thread);
        node.wants.retain(|&q| q != queue);
        if !node.holds.contains(&queue) {
            node.holds.push(queue);
        }
        if was_waiting {
            self.invalidate(queue);
        }
        self.invalidate(thread);
    }

    /// First waiter of the highest effective priority.
    fn pick_next(&mut self, queue: usize) -> Option<usize> {
        let waiting = self.queue_mut(queue).waiting.clone();
        let mut best: Option<(usize, Priority)> = None;
        for thread in waiting {
            let priority = self.effective(thread, 0);
            if best.is_none_or(|(_, top)| priority > top) {
                best = Some((thread, priority));
            }
        }
        best.map(|(thread, _)| thread)
    }

    /// Mark `slot` and everything that depends on it dirty.
    fn invalidate(&mut self, slot: usize) {
        let mut pending = vec![slot];
        while let Some(slot) = pending.pop() {
            match &mut self.nodes[slot] {
                Node::Thread(node) => {
                    if !node.cached.dirty {
                        node.cached.dirty = true;
                        pending.extend(node.wants.iter().copied());
                    }
                }
                Node::Queue(node) => {
                    if node.transfer_priority && !node.cached.dirty {
                        node.cached.dirty = true;
                        pending.extend(node.holder);
                    }
                }
            }
        }
    }

    fn effective(&mut self, slot: usize, depth: usize) -> Priority {
        if cfg!(debug_assertions) && depth > self.nodes.len() {
            crate::error::fatal(PreconditionViolation::DonationCycle { node: slot });
        }
        let (floor, sources) = match &self.nodes[slot] {
            Node::Thread(node) if node.holds.is_empty() => (node.base, Vec::new()),
            Node::Thread(node) if node.cached.dirty => (node.base, node.holds.clone()),
            Node::Thread(node) => return node.cached.value,
            Node::Queue(node) if !node.transfer_priority => return PRIORITY_MINIMUM,
            Node::Queue(node) if node.cached.dirty => (PRIORITY_MINIMUM, node.waiting.clone()),
            Node::Queue(node) => return node.cached.value,
        };
        let value = sources
            .into_iter()
            .fold(floor, |value, source| value.max(self.effective(source, depth + 1)));
        let cached = match &mut self.nodes[slot] {
            Node::Thread(node) => &mut node.cached,
            Node::Queue(node) => &mut node.cached,
        };
        *cached = Cached {
            value,
            dirty: false,
        };
        value
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Effective priority computed from scratch, ignoring every cache.
    fn brute_force(graph: &DonationGraph, slot: usize, depth: usize) -> Priority {
        assert!(depth <= graph.nodes.len(), "cycle in the donation graph");
        match &graph.nodes[slot] {
            Node::Thread(node) => node
                .holds
                .iter()
                .fold(node.base, |v, &q| v.max(brute_force(graph, q, depth + 1))),
            Node::Queue(node) if node.transfer_priority => node
                .waiting
                .iter()
                .fold(PRIORITY_MINIMUM, |v, &t| v.max(brute_force(graph, t, depth + 1))),
            Node::Queue(_) => PRIORITY_MINIMUM,
        }
    }

    fn check_structure(graph: &DonationGraph) {
        for (slot, node) in graph.nodes.iter() {
            match node {
                Node::Thread(node) => {
                    assert_eq!(graph.threads.get(&node.tid), Some(&slot));
                    for &q in node.holds.iter() {
                        assert!(!node.wants.contains(&q));
                        assert_eq!(graph.queue(QueueId(q), "check").unwrap().holder, Some(slot));
                    }
                    for &q in node.wants.iter() {
                        assert!(graph.queue(QueueId(q), "check").unwrap().waiting.contains(&slot));
                    }
                }
                Node::Queue(node) => {
                    if let Some(holder) = node.holder {
                        assert!(!node.waiting.contains(&holder));
                        assert!(graph.thread(holder).holds.contains(&slot));
                    }
                    for &t in node.waiting.iter() {
                        assert!(graph.thread(t).wants.contains(&slot));
                    }
                }
            }
        }
    }

    #[test]
    fn donation_and_reversion() {
        let mut graph = DonationGraph::new();
        let lock = graph.new_resource_queue(true);
        let (h, w) = (1, 2);
        graph.set_priority(w, 5).unwrap();

        graph.acquire(lock, h).unwrap();
        assert_eq!(graph.effective_priority(h), PRIORITY_DEFAULT);

        graph.wait_for_access(lock, w).unwrap();
        assert_eq!(graph.effective_priority(h), 5);
        assert_eq!(graph.queue_effective_priority(lock), Ok(5));

        graph.release(lock, h).unwrap();
        assert_eq!(graph.effective_priority(h), PRIORITY_DEFAULT);
        assert_eq!(graph.holder(lock), Ok(None));

        assert_eq!(graph.next_thread(lock), Ok(Some(w)));
        assert_eq!(graph.holder(lock), Ok(Some(w)));
        assert_eq!(graph.effective_priority(w), 5);
        assert_eq!(graph.queue_effective_priority(lock), Ok(PRIORITY_MINIMUM));
        check_structure(&graph);
    }

    #[test]
    fn handoff_reverts_previous_holder() {
        let mut graph = DonationGraph::new();
        let lock = graph.new_resource_queue(true);
        graph.set_priority(2, 5).unwrap();
        graph.acquire(lock, 1).unwrap();
        graph.wait_for_access(lock, 2).unwrap();
        assert_eq!(graph.effective_priority(1), 5);

        // Handing the queue over detaches the previous holder.
        assert_eq!(graph.next_thread(lock), Ok(Some(2)));
        assert_eq!(graph.effective_priority(1), PRIORITY_DEFAULT);
        assert_eq!(graph.effective_priority(2), 5);
        check_structure(&graph);
    }

    #[test]
    fn non_transfer_queue_does_not_donate() {
        let mut graph = DonationGraph::new();
        let ready = graph.new_resource_queue(false);
        graph.set_priority(2, 7).unwrap();
        graph.acquire(ready, 1).unwrap();
        graph.wait_for_access(ready, 2).unwrap();
        assert_eq!(graph.effective_priority(1), PRIORITY_DEFAULT);
        assert_eq!(graph.queue_effective_priority(ready), Ok(PRIORITY_MINIMUM));
        assert_eq!(graph.peek_next(ready), Ok(Some(2)));
    }

    #[test]
    fn earliest_waiter_wins_ties() {
        let mut graph = DonationGraph::new();
        let queue = graph.new_resource_queue(false);
        for tid in [10, 11, 12] {
            graph.set_priority(tid, 3).unwrap();
            graph.wait_for_access(queue, tid).unwrap();
        }
        graph.set_priority(13, 4).unwrap();
        graph.wait_for_access(queue, 13).unwrap();
        assert_eq!(graph.waiters(queue), Ok(vec![10, 11, 12, 13]));

        assert_eq!(graph.next_thread(queue), Ok(Some(13)));
        assert_eq!(graph.next_thread(queue), Ok(Some(10)));
        assert_eq!(graph.next_thread(queue), Ok(Some(11)));
        assert_eq!(graph.next_thread(queue), Ok(Some(12)));
        assert_eq!(graph.next_thread(queue), Ok(None));
        // An empty queue keeps its last holder.
        assert_eq!(graph.holder(queue), Ok(Some(12)));
    }

    #[test]
    fn waiting_is_idempotent() {
        let mut graph = DonationGraph::new();
        let queue = graph.new_resource_queue(true);
        graph.wait_for_access(queue, 1).unwrap();
        graph.wait_for_access(queue, 1).unwrap();
        assert_eq!(graph.waiters(queue), Ok(vec![1]));
    }

    #[test]
    fn holder_waiting_on_own_queue_releases_it() {
        let mut graph = DonationGraph::new();
        let queue = graph.new_resource_queue(true);
        graph.acquire(queue, 1).unwrap();
        graph.wait_for_access(queue, 1).unwrap();
        assert_eq!(graph.holder(queue), Ok(None));
        assert_eq!(graph.waiters(queue), Ok(vec![1]));
        check_structure(&graph);
    }

    #[test]
    fn set_priority_reaches_the_holder() {
        let mut graph = DonationGraph::new();
        let a = graph.new_resource_queue(true);
        graph.acquire(a, 1).unwrap();
        graph.wait_for_access(a, 2).unwrap();
        assert_eq!(graph.effective_priority(1), PRIORITY_DEFAULT);
        assert_eq!(graph.effective_priority(2), PRIORITY_DEFAULT);

        graph.set_priority(2, 6).unwrap();
        assert_eq!(graph.effective_priority(2), 6);
        assert_eq!(graph.effective_priority(1), 6);

        graph.set_priority(2, 2).unwrap();
        assert_eq!(graph.effective_priority(1), 2);
        assert_eq!(graph.priority(1), PRIORITY_DEFAULT);
    }

    #[test]
    fn transitive_donation_chain() {
        // Thread 1 holds A, thread 2 holds B and waits on A, thread 3 (7)
        // waits on B: 7 flows to 2 and then to 1.
        let mut graph = DonationGraph::new();
        let a = graph.new_resource_queue(true);
        let b = graph.new_resource_queue(true);
        graph.acquire(a, 1).unwrap();
        graph.acquire(b, 2).unwrap();
        graph.wait_for_access(a, 2).unwrap();
        graph.set_priority(3, PRIORITY_MAXIMUM).unwrap();
        graph.wait_for_access(b, 3).unwrap();
        assert_eq!(graph.effective_priority(1), PRIORITY_MAXIMUM);
        assert_eq!(graph.effective_priority(2), PRIORITY_MAXIMUM);

        graph.forget_thread(3);
        assert_eq!(graph.waiters(b), Ok(vec![]));
        assert_eq!(graph.effective_priority(2), PRIORITY_DEFAULT);
        assert_eq!(graph.effective_priority(1), PRIORITY_DEFAULT);
        check_structure(&graph);
    }

    #[test]
    fn classic_self_test() {
        // Four threads, two resources with transfer and one without.
        let mut graph = DonationGraph::new();
        let tq1 = graph.new_resource_queue(true);
        let tq2 = graph.new_resource_queue(true);
        let tq3 = graph.new_resource_queue(false);
        let (k1, k2, k3, k4) = (1, 2, 3, 4);
        graph.set_priority(k1, 6).unwrap();
        graph.set_priority(k2, 4).unwrap();
        graph.set_priority(k3, 2).unwrap();
        graph.set_priority(k4, 1).unwrap();

        graph.acquire(tq1, k4).unwrap();
        graph.acquire(tq2, k3).unwrap();
        graph.acquire(tq3, k2).unwrap();
        graph.wait_for_access(tq1, k3).unwrap();
        graph.wait_for_access(tq2, k2).unwrap();
        graph.wait_for_access(tq3, k1).unwrap();

        // Thread 1 waits on the queue without transfer: nobody gains 6.
        assert_eq!(graph.effective_priority(k4), 4);
        assert_eq!(graph.effective_priority(k3), 4);
        assert_eq!(graph.effective_priority(k2), 4);
        assert_eq!(graph.effective_priority(k1), 6);

        graph.set_priority(k2, 5).unwrap();
        assert_eq!(graph.effective_priority(k4), 5);

        graph.release(tq2, k3).unwrap();
        assert_eq!(graph.effective_priority(k4), 2);
        assert_eq!(graph.next_thread(tq2), Ok(Some(k2)));
        assert_eq!(graph.effective_priority(k2), 5);
        check_structure(&graph);
    }

    #[test]
    fn release_by_non_holder_is_rejected() {
        let mut graph = DonationGraph::new();
        let queue = graph.new_resource_queue(true);
        graph.acquire(queue, 1).unwrap();
        assert_eq!(
            graph.release(queue, 2),
            Err(PreconditionViolation::NotHolder {
                op: "release",
                tid: 2,
                queue: queue.index(),
            })
        );
        assert!(matches!(
            graph.set_priority(1, PRIORITY_MAXIMUM + 1),
            Err(PreconditionViolation::PriorityOutOfRange { .. })
        ));
    }

    #[test]
    fn removed_queue_is_unknown() {
        let mut graph = DonationGraph::new();
        let queue = graph.new_resource_queue(true);
        graph.set_priority(2, 6).unwrap();
        graph.acquire(queue, 1).unwrap();
        graph.wait_for_access(queue, 2).unwrap();
        assert_eq!(graph.effective_priority(1), 6);

        graph.remove_resource_queue(queue).unwrap();
        assert_eq!(graph.effective_priority(1), PRIORITY_DEFAULT);
        assert!(matches!(
            graph.holder(queue),
            Err(PreconditionViolation::UnknownQueue { .. })
        ));
        check_structure(&graph);
    }

    #[test]
    fn random_operations_match_brute_force() {
        const THREADS: u64 = 8;
        const QUEUES: usize = 5;

        for seed in 0..64 {
            let mut rng = fastrand::Rng::with_seed(seed);
            let mut graph = DonationGraph::new();
            let queues: Vec<QueueId> = (0..QUEUES)
                .map(|i| graph.new_resource_queue(i % 4 != 3))
                .collect();

            for _ in 0..200 {
                let tid = rng.u64(0..THREADS);
                let queue = queues[rng.usize(0..QUEUES)];
                match rng.u8(0..6) {
                    0 => {
                        // A blocked thread waits on one queue at a time, and
                        // waiting must not close a cycle.
                        let idle = graph
                            .threads
                            .get(&tid)
                            .is_none_or(|&slot| graph.thread(slot).wants.is_empty());
                        if idle && !reaches(&mut graph, queue, tid) {
                            graph.wait_for_access(queue, tid).unwrap();
                        }
                    }
                    1 => {
                        if graph.next_thread(queue).unwrap().is_none() {
                            if let Some(holder) = graph.holder(queue).unwrap() {
                                graph.release(queue, holder).unwrap();
                            }
                        }
                    }
                    2 => {
                        let priority = rng.u32(PRIORITY_MINIMUM..=PRIORITY_MAXIMUM);
                        graph.set_priority(tid, priority).unwrap();
                    }
                    3 => {
                        if let Some(holder) = graph.holder(queue).unwrap() {
                            graph.release(queue, holder).unwrap();
                        }
                    }
                    4 => {
                        let _ = graph.peek_next(queue).unwrap();
                    }
                    _ => {
                        // Reads in random order exercise partial recomputation.
                        let _ = graph.effective_priority(tid);
                    }
                }
                check_structure(&graph);
                for (&tid, &slot) in graph.threads.clone().iter() {
                    let expected = brute_force(&graph, slot, 0);
                    assert_eq!(graph.effective_priority(tid), expected, "seed {seed}");
                }
                for &queue in queues.iter() {
                    let expected = brute_force(&graph, queue.index(), 0);
                    assert_eq!(graph.queue_effective_priority(queue), Ok(expected));
                }
            }
        }
    }

    /// Whether `tid` is reachable from `queue` along holder and wants edges.
    fn reaches(graph: &mut DonationGraph, queue: QueueId, tid: u64) -> bool {
        let target = graph.thread_slot(tid);
        let mut pending = vec![queue.index()];
        let mut seen = Vec::new();
        while let Some(slot) = pending.pop() {
            if seen.contains(&slot) {
                continue;
            }
            seen.push(slot);
            match &graph.nodes[slot] {
                Node::Queue(node) => pending.extend(node.holder),
                Node::Thread(node) => {
                    if slot == target {
                        return true;
                    }
                    pending.extend(node.wants.iter().copied());
                }
            }
        }
        false
    }
}
