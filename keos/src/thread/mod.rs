//! Thread abstration, an abstraction of a cpu core.
//!
//! ## The threading model
//!
//! An executing kernel consists of a collection of threads, each with their
//! own stack and local state. The machine has a single logical processor, so
//! at most one thread runs at any moment; the others are either runnable
//! (owned by the [`Scheduler`]), parked (owned by a [`ParkHandle`]), or
//! exited.
//!
//! Each kernel thread is backed by a host thread that provides its stack. A
//! context switch hands the processor to the next thread and puts the
//! previous host thread to sleep until the processor is handed back. Host
//! threads are created lazily, when a thread is dispatched for the first time.
//!
//! ## Ownership of a thread
//!
//! A [`Thread`] is always owned by exactly one place: the processor while it
//! runs, the scheduler while it is runnable, or a [`ParkHandle`] while it
//! sleeps. Blocking the current thread is therefore expressed as
//! [`Current::park_with`], which hands the caller a [`ParkHandle`] of itself
//! to store wherever the wakeup will come from.
//!
//! [`Scheduler`]: scheduler::Scheduler
pub mod scheduler;

use crate::KernelError;
use abyss::{interrupt::InterruptGuard, spinlock::SpinLock};
use crossbeam_utils::sync::{Parker, Unparker};
use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::BTreeMap,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

/// Bit of [`Thread::exit_status`] set once the thread has exited.
const EXITED: u64 = 0x8000_0000_0000_0000;

/// A possible state of the thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ThreadState {
    /// Thread is runnable.
    Runnable,
    /// Thread is running.
    Running,
    /// Thread is exited with exitcode.
    Exited(i32),
    /// Thread is parked.
    Parked,
}

static THREAD_STATE_TABLE: SpinLock<BTreeMap<u64, Arc<SpinLock<ThreadState>>>> =
    SpinLock::new(BTreeMap::new());

/// Get specified thread's [`ThreadState`] by TID (Thread ID).
///
/// # Errors
/// Returns [`KernelError::InvalidArgument`] if no live thread has the TID.
pub fn get_state_by_tid(tid: u64) -> Result<ThreadState, KernelError> {
    let tst = THREAD_STATE_TABLE.lock();

    let Some(state) = tst.get(&tid) else {
        tst.unlock();
        return Err(KernelError::InvalidArgument);
    };

    let ts_lock = state.lock();
    let result = *ts_lock;

    ts_lock.unlock();
    tst.unlock();

    Ok(result)
}

pub(crate) fn clear_state_table() {
    let mut tst = THREAD_STATE_TABLE.lock();
    tst.clear();
    tst.unlock();
}

type ThreadFn = Box<dyn FnOnce() + Send + 'static>;

/// An thread abstraction.
pub struct Thread {
    /// Thread id
    pub tid: u64,
    /// Thread name
    pub name: String,
    /// State of the thread.
    pub state: Arc<SpinLock<ThreadState>>,
    /// Mixture of exit state (63th bit) and exit code (lower 32 bits).
    pub exit_status: Arc<AtomicU64>,
    joiners: Arc<SpinLock<Vec<ParkHandle>>>,
    unparker: Unparker,
    entry: Option<(Parker, ThreadFn)>,
}

impl Thread {
    #[doc(hidden)]
    pub fn new<I>(name: I) -> Box<Self>
    where
        String: From<I>,
    {
        static TID: AtomicU64 = AtomicU64::new(1);
        let tid = TID.fetch_add(1, Ordering::SeqCst);

        let state = Arc::new(SpinLock::new(ThreadState::Runnable));
        let mut tst = THREAD_STATE_TABLE.lock();
        tst.insert(tid, state.clone());
        tst.unlock();

        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        Box::new(Self {
            tid,
            name: String::from(name),
            state,
            exit_status: Arc::new(AtomicU64::new(0)),
            joiners: Arc::new(SpinLock::new(Vec::new())),
            unparker,
            entry: Some((parker, Box::new(|| {}))),
        })
    }

    /// Pin current thread not to be scheduled by blocking interrupt.
    ///
    /// When [`ThreadPinGuard`] is dropped, the current thread is unpinned.
    /// When you hold multiple [`ThreadPinGuard`], you **MUST** drops
    /// [`ThreadPinGuard`] as a reverse order of creation.
    pub fn pin() -> ThreadPinGuard {
        ThreadPinGuard::new()
    }

    fn set_state(&self, state: ThreadState) {
        let mut guard = self.state.lock();
        *guard = state;
        guard.unlock();
    }

    /// Start the backing host thread if it does not exist yet, and return
    /// the handle that resumes it.
    fn launch(&mut self) -> Unparker {
        if let Some((parker, entry)) = self.entry.take() {
            let tid = self.tid;
            let host = std::thread::Builder::new()
                .name(self.name.clone())
                .spawn(move || host_main(tid, parker, entry))
                .unwrap_or_else(|e| panic!("Machine: failed to create a host context: {e}"));
            let mut contexts = CPU.contexts.lock();
            contexts.insert(tid, self.unparker.clone());
            contexts.unlock();
            let mut hosts = CPU.hosts.lock();
            hosts.push(host);
            hosts.unlock();
        }
        self.unparker.clone()
    }

    /// Record the exit of this thread and wake up its joiners.
    fn retire(&self, exit_code: i32) {
        let mut tst = THREAD_STATE_TABLE.lock();
        tst.remove(&self.tid);
        tst.unlock();

        self.set_state(ThreadState::Exited(exit_code));
        let mut joiners = self.joiners.lock();
        self.exit_status
            .store(EXITED | (exit_code as u32 as u64), Ordering::SeqCst);
        let joiners_to_wake = core::mem::take(&mut *joiners);
        joiners.unlock();
        for joiner in joiners_to_wake {
            joiner.unpark();
        }
    }
}

/// A RAII implementation of the thread pinning.
pub type ThreadPinGuard = InterruptGuard;

/// A handle to join thread.
pub struct JoinHandle
where
    Self: 'static,
{
    /// Thread id of this handle.
    pub tid: u64,
    exit_status: Arc<AtomicU64>,
    joiners: Arc<SpinLock<Vec<ParkHandle>>>,
}

impl JoinHandle {
    /// Make a join handle for Thread `th`.
    pub fn new_for(th: &Thread) -> Self {
        Self {
            tid: th.tid,
            exit_status: th.exit_status.clone(),
            joiners: th.joiners.clone(),
        }
    }

    /// Returns true if the underlying thread has exited.
    pub fn is_finished(&self) -> bool {
        self.exit_status.load(Ordering::SeqCst) & EXITED != 0
    }

    /// Join this handle and returns exit code.
    ///
    /// The caller sleeps until the thread exits. The scheduler learns about
    /// the wait through [`Scheduler::thread_joining`].
    ///
    /// [`Scheduler::thread_joining`]: scheduler::Scheduler::thread_joining
    pub fn join(self) -> i32 {
        loop {
            let v = self.exit_status.load(Ordering::SeqCst);
            if v & EXITED != 0 {
                return v as i32;
            }
            Current::park_with(|handle| {
                let mut joiners = self.joiners.lock();
                if self.is_finished() {
                    joiners.unlock();
                    handle.unpark();
                } else {
                    scheduler::scheduler().thread_joining(handle.tid(), self.tid);
                    joiners.push(handle);
                    joiners.unlock();
                }
            });
        }
    }
}

/// A handle that represent the parked thread.
pub struct ParkHandle {
    pub(crate) th: Box<Thread>,
}

impl ParkHandle {
    pub(crate) fn new_for(th: Box<Thread>) -> Self {
        th.set_state(ThreadState::Parked);
        Self { th }
    }

    /// Thread id of the parked thread.
    pub fn tid(&self) -> u64 {
        self.th.tid
    }

    /// Consume the handle and unpark the underlying thread.
    pub fn unpark(self) {
        self.th.set_state(ThreadState::Runnable);
        scheduler::scheduler().push_to_queue(self.th);
    }
}

impl core::fmt::Debug for ParkHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ParkHandle")
            .field("tid", &self.th.tid)
            .field("name", &self.th.name)
            .finish()
    }
}

/// The opaque structure indicating the running thread on the current cpu.
pub struct Current {
    _p: (),
}

impl Current {
    /// Run a function `f` with [`ParkHandle`] for current thread, and then park
    /// the current thread.
    ///
    /// `f` runs with interrupts disabled, so registering the handle and
    /// falling asleep is a single atomic step. The thread resumes once
    /// somebody calls [`ParkHandle::unpark`] and the scheduler picks it.
    pub fn park_with(f: impl FnOnce(ParkHandle)) {
        assert!(
            !InterruptGuard::is_guarded(),
            "Try to park a thread while holding a lock."
        );
        let tid = Current::get_tid();
        let _guard = InterruptGuard::new();
        f(ParkHandle::new_for(CPU.take_running()));
        scheduler::dispatch(Some(tid));
    }

    /// Give up the processor, staying runnable.
    ///
    /// Returns immediately if the scheduler picks the current thread again.
    pub fn yield_now() {
        assert!(
            !InterruptGuard::is_guarded(),
            "Try to yield a thread while holding a lock."
        );
        let tid = Current::get_tid();
        let _guard = InterruptGuard::new();
        let th = CPU.take_running();
        th.set_state(ThreadState::Runnable);
        scheduler::scheduler().push_to_queue(th);
        scheduler::dispatch(Some(tid));
    }

    /// Ask the current thread to yield when the interrupt being handled
    /// returns.
    pub fn yield_on_return() {
        abyss::interrupt::request_preempt();
    }

    /// Exit the current thread with `exit_code`.
    pub fn exit(exit_code: i32) -> ! {
        assert!(
            !InterruptGuard::is_guarded(),
            "Try to exit a thread while holding a lock."
        );
        panic::resume_unwind(Box::new(ExitRequest(exit_code)))
    }

    /// Get the current thread's id.
    ///
    /// # Panics
    /// Panics if the caller is not a kernel thread.
    pub fn get_tid() -> u64 {
        Current::try_get_tid()
            .unwrap_or_else(|| panic!("Current::get_tid called outside of a kernel thread."))
    }

    /// Get the current thread's id, if the caller is a kernel thread.
    pub fn try_get_tid() -> Option<u64> {
        CURRENT.get()
    }
}

/// A struct to build a new thread.
pub struct ThreadBuilder {
    th: Box<Thread>,
}

impl ThreadBuilder {
    /// Create a new thread builder for thread `name`.
    pub fn new<I>(name: I) -> Self
    where
        String: From<I>,
    {
        Self {
            th: Thread::new(name),
        }
    }

    /// Spawn the thread as a parked state.
    pub fn spawn_as_parked<F: FnOnce() + Send + 'static>(self, thread_fn: F) -> ParkHandle {
        let th = self.into_thread(thread_fn);
        ParkHandle::new_for(th)
    }

    /// Spawn the thread.
    pub fn spawn<F: FnOnce() + Send + 'static>(self, thread_fn: F) -> JoinHandle {
        let th = self.into_thread(thread_fn);
        let handle = JoinHandle::new_for(&th);
        scheduler::scheduler().push_to_queue(th);
        handle
    }

    /// Get the thread id of this thread.
    pub fn get_tid(&self) -> u64 {
        self.th.tid
    }

    pub(crate) fn into_thread<F: FnOnce() + Send + 'static>(self, thread_fn: F) -> Box<Thread> {
        let Self { mut th } = self;
        if let Some((_, entry)) = th.entry.as_mut() {
            *entry = Box::new(thread_fn);
        }
        th
    }
}

// Context switch related codes.

thread_local! {
    static CURRENT: Cell<Option<u64>> = const { Cell::new(None) };
    static PARKER: RefCell<Option<Parker>> = const { RefCell::new(None) };
}

/// Unwind payload of [`Current::exit`].
struct ExitRequest(i32);

/// Unwind payload that tears down a sleeping context when the machine halts.
struct HaltRequest;

/// Why the machine stopped.
pub(crate) enum Halt {
    Exited(i32),
    Deadlock,
    Panicked(Box<dyn Any + Send>),
}

/// The single logical processor.
pub(crate) struct Processor {
    running: SpinLock<Option<Box<Thread>>>,
    turn: AtomicU64,
    main: AtomicU64,
    halted: AtomicBool,
    outcome: SpinLock<Option<Halt>>,
    contexts: SpinLock<BTreeMap<u64, Unparker>>,
    hosts: SpinLock<Vec<std::thread::JoinHandle<()>>>,
    board: SpinLock<Option<Unparker>>,
}

pub(crate) static CPU: Processor = Processor {
    running: SpinLock::new(None),
    turn: AtomicU64::new(0),
    main: AtomicU64::new(0),
    halted: AtomicBool::new(false),
    outcome: SpinLock::new(None),
    contexts: SpinLock::new(BTreeMap::new()),
    hosts: SpinLock::new(Vec::new()),
    board: SpinLock::new(None),
};

impl Processor {
    /// Reset the processor before running `main`. `board` is woken when the
    /// machine halts.
    pub(crate) fn power_on(&self, main: u64, board: Unparker) {
        let mut running = self.running.lock();
        let stale = running.take();
        running.unlock();
        drop(stale);

        let mut outcome = self.outcome.lock();
        *outcome = None;
        outcome.unlock();
        let mut contexts = self.contexts.lock();
        contexts.clear();
        contexts.unlock();
        let mut slot = self.board.lock();
        *slot = Some(board);
        slot.unlock();

        self.turn.store(0, Ordering::SeqCst);
        self.main.store(main, Ordering::SeqCst);
        self.halted.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Join every host thread that backed a kernel thread, then report why
    /// the machine stopped.
    pub(crate) fn power_off(&self) -> Halt {
        loop {
            let mut hosts = self.hosts.lock();
            let host = hosts.pop();
            hosts.unlock();
            match host {
                Some(host) => {
                    let _ = host.join();
                }
                None => break,
            }
        }
        let mut outcome = self.outcome.lock();
        let reason = outcome.take();
        outcome.unlock();
        reason.unwrap_or(Halt::Deadlock)
    }

    fn take_running(&self) -> Box<Thread> {
        let mut running = self.running.lock();
        let th = running.take();
        running.unlock();
        th.unwrap_or_else(|| unreachable!("No thread is running on the processor."))
    }

    fn set_running(&self, th: Box<Thread>) {
        th.set_state(ThreadState::Running);
        let mut running = self.running.lock();
        *running = Some(th);
        running.unlock();
    }
}

/// Stop the machine. Every sleeping context is woken up to tear itself down.
pub(crate) fn halt(reason: Halt) {
    let mut outcome = CPU.outcome.lock();
    if outcome.is_none() {
        *outcome = Some(reason);
    }
    outcome.unlock();
    CPU.halted.store(true, Ordering::SeqCst);

    let contexts = CPU.contexts.lock();
    for unparker in contexts.values() {
        unparker.unpark();
    }
    contexts.unlock();
    let board = CPU.board.lock();
    if let Some(board) = board.as_ref() {
        board.unpark();
    }
    board.unlock();
}

/// Hand the processor to `next`. If `me` is given, sleep until the
/// processor is handed back to it.
///
/// Must be called with interrupts disabled.
pub(crate) fn switch_to(mut next: Box<Thread>, me: Option<u64>) {
    let tid = next.tid;
    if me == Some(tid) {
        CPU.set_running(next);
        return;
    }
    let unparker = next.launch();
    CPU.set_running(next);
    CPU.turn.store(tid, Ordering::SeqCst);
    unparker.unpark();
    if let Some(me) = me {
        wait_for_turn(me);
    }
}

/// Sleep until the processor belongs to `tid`.
fn wait_for_turn(tid: u64) {
    PARKER.with_borrow(|parker| {
        let Some(parker) = parker.as_ref() else {
            unreachable!("Thread {tid} has no host context.");
        };
        loop {
            if CPU.halted.load(Ordering::SeqCst) {
                panic::resume_unwind(Box::new(HaltRequest));
            }
            if CPU.turn.load(Ordering::SeqCst) == tid {
                return;
            }
            parker.park();
        }
    })
}

/// The very beginning of a host context.
fn host_main(tid: u64, parker: Parker, entry: ThreadFn) {
    CURRENT.set(Some(tid));
    PARKER.set(Some(parker));
    abyss::interrupt::attach_context();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        wait_for_turn(tid);
        entry();
    }));
    abyss::interrupt::detach_context();
    match result {
        Ok(()) => exit_current(tid, 0),
        Err(payload) => match payload.downcast::<ExitRequest>() {
            Ok(request) => exit_current(tid, request.0),
            Err(payload) if payload.is::<HaltRequest>() => {}
            Err(payload) => {
                warning!("Thread {tid} panicked; halting the machine.");
                halt(Halt::Panicked(payload));
            }
        },
    }

    let mut contexts = CPU.contexts.lock();
    contexts.remove(&tid);
    contexts.unlock();
}

/// Tear down the running thread and give the processor away for good.
fn exit_current(tid: u64, exit_code: i32) {
    let guard = InterruptGuard::new();
    let th = CPU.take_running();
    debug_assert_eq!(th.tid, tid);
    debug!("Thread {} ({}) exited with {}.", th.tid, th.name, exit_code);

    scheduler::scheduler().thread_exited(tid);
    th.retire(exit_code);
    drop(th);

    if CPU.main.load(Ordering::SeqCst) == tid {
        halt(Halt::Exited(exit_code));
    } else {
        scheduler::dispatch(None);
    }
    guard.consume();
}
