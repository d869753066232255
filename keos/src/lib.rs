//! # KeOS: KAIST Educational Operating System, thread substrate
//!
//! This crate is the kernel side of a simulated uniprocessor. It provides
//! the pieces every thread-level kernel facility is built on:
//!
//! - [`thread`]: kernel threads, parking, joining and the [`Scheduler`]
//!   interface with a first-in-first-out default.
//! - [`sync`]: atomic sections ([`sync::InterruptGuard`]) and spinlocks.
//! - [`timer`]: the virtual clock.
//!
//! ## Running the machine
//!
//! A machine is brought up with [`boot`]. The first closure configures the
//! system through [`SystemConfigurationBuilder`]; the second one becomes the
//! main kernel thread. The machine halts, and [`boot`] returns, when the main
//! thread exits.
//!
//! ```rust
//! use keos::thread::ThreadBuilder;
//!
//! let code = keos::boot(
//!     |config| config.set_timer_period(10).unwrap(),
//!     || {
//!         let child = ThreadBuilder::new("child").spawn(|| keos::info!("Hello"));
//!         assert_eq!(child.join(), 0);
//!     },
//! );
//! assert_eq!(code, Ok(0));
//! ```
//!
//! ## Time and interrupts
//!
//! The clock advances by one tick each time a thread enables interrupts,
//! i.e. leaves its outermost atomic section. The timer interrupts every
//! `timer period` ticks and first runs the registered timer hooks, then
//! [`Scheduler::timer_tick`]. When every thread sleeps, the processor jumps
//! the clock to the next armed deadline (see [`timer::arm`]). If no deadline
//! is armed either, nothing can ever run again and the machine halts with
//! [`KernelError::Deadlock`].
//!
//! ## Failures
//!
//! A panic in any kernel thread halts the machine, and [`boot`] resumes the
//! panic on the calling host thread.
#[macro_use]
extern crate abyss;

mod interrupt;

pub mod sync;
pub mod thread;

pub use abyss::{debug, info, print, println, warning};
pub use interrupt::TimerHook;
pub use thread::scheduler::Scheduler;

use log::LevelFilter;
use std::sync::{Arc, Mutex, PoisonError};
use thread::{Halt, ThreadBuilder, scheduler::Fifo};

/// The virtual clock.
pub mod timer {
    pub use abyss::timer::{DEFAULT_PERIOD, arm, now, period};
}

/// Enum representing errors that can occur during a kernel operation.
///
/// This enum is used to categorize errors encountered by the kernel operation.
/// Each variant corresponds to a specific type of error that might
/// occur during the handling of a kernel operation.
#[derive(Debug, Eq, PartialEq)]
pub enum KernelError {
    /// Invalid argument. (EINVAL)
    InvalidArgument,
    /// Every thread is blocked and nothing can wake any of them up. (EDEADLK)
    Deadlock,
}

impl KernelError {
    /// Convert the error into the errno-style value returned to users.
    pub fn into_usize(self) -> usize {
        (match self {
            KernelError::InvalidArgument => -22isize,
            KernelError::Deadlock => -35,
        }) as usize
    }
}

/// Environment variable that selects the default log level.
pub const LOG_LEVEL_ENV: &str = "KEOS_LOG";

/// A builder for system configuration settings.
///
/// The [`SystemConfigurationBuilder`] struct provides an interface for
/// configuring various system-wide settings before the machine starts.
/// Settings that are not configured keep their defaults: the [`Fifo`]
/// scheduler, a timer interrupt on every tick, no timer hooks, and the log
/// level named by the `KEOS_LOG` environment variable (`warn` if unset).
pub struct SystemConfigurationBuilder {
    scheduler: Option<Arc<dyn Scheduler>>,
    timer_period: u64,
    log_level: LevelFilter,
    timer_hooks: Vec<TimerHook>,
}

impl SystemConfigurationBuilder {
    fn new() -> Self {
        let log_level = std::env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|level| level.parse().ok())
            .unwrap_or(LevelFilter::Warn);
        Self {
            scheduler: None,
            timer_period: abyss::timer::DEFAULT_PERIOD,
            log_level,
            timer_hooks: Vec::new(),
        }
    }

    /// Set the scheduler of the kernel.
    pub fn set_scheduler(&mut self, scheduler: impl Scheduler + 'static) {
        self.scheduler = Some(Arc::new(scheduler));
    }

    /// Set the number of ticks between two timer interrupts.
    ///
    /// # Errors
    /// Returns [`KernelError::InvalidArgument`] if `ticks` is zero.
    pub fn set_timer_period(&mut self, ticks: u64) -> Result<(), KernelError> {
        if ticks == 0 {
            return Err(KernelError::InvalidArgument);
        }
        self.timer_period = ticks;
        Ok(())
    }

    /// Set the maximum level of kernel messages to display.
    pub fn set_log_level(&mut self, level: LevelFilter) {
        self.log_level = level;
    }

    /// Run `hook` on every timer interrupt, with interrupts disabled.
    ///
    /// Hooks run in registration order, before the scheduler's
    /// [`Scheduler::timer_tick`].
    pub fn register_timer_hook(&mut self, hook: impl Fn() + Send + Sync + 'static) {
        self.timer_hooks.push(Arc::new(hook));
    }
}

/// Bring up the machine, run `main` as the main kernel thread, and return
/// once the machine halts.
///
/// Only one machine runs at a time in a process; concurrent calls wait for
/// each other.
///
/// # Errors
/// Returns [`KernelError::Deadlock`] if every thread blocks with no pending
/// wakeup.
///
/// # Panics
/// Resumes the panic of a kernel thread that panicked.
pub fn boot<F>(
    setup: impl FnOnce(&mut SystemConfigurationBuilder),
    main: F,
) -> Result<i32, KernelError>
where
    F: FnOnce() + Send + 'static,
{
    static POWER: Mutex<()> = Mutex::new(());
    let _power = POWER.lock().unwrap_or_else(PoisonError::into_inner);

    let mut config = SystemConfigurationBuilder::new();
    setup(&mut config);
    let SystemConfigurationBuilder {
        scheduler,
        timer_period,
        log_level,
        timer_hooks,
    } = config;

    abyss::kprint::init(log_level);
    abyss::timer::reset(timer_period);
    thread::clear_state_table();
    thread::scheduler::set_scheduler(
        scheduler.unwrap_or_else(|| Arc::new(Fifo::default()) as Arc<dyn Scheduler>),
    );
    interrupt::init(timer_hooks);

    let main = ThreadBuilder::new("main").into_thread(main);
    let board = crossbeam_utils::sync::Parker::new();
    thread::CPU.power_on(main.tid, board.unparker().clone());
    info!("Machine: boot (timer period: {timer_period} ticks).");
    {
        let _guard = sync::InterruptGuard::new();
        thread::switch_to(main, None);
    }
    while !thread::CPU.is_halted() {
        board.park();
    }

    let reason = thread::CPU.power_off();
    info!("Machine: halted at tick {}.", abyss::timer::now());
    match reason {
        Halt::Exited(code) => Ok(code),
        Halt::Deadlock => Err(KernelError::Deadlock),
        Halt::Panicked(payload) => std::panic::resume_unwind(payload),
    }
}
