use keos::{
    sync::{InterruptGuard, SpinLock},
    thread::{ThreadBuilder, ThreadState, get_state_by_tid},
};
use keos_threads::{
    alarm::Alarm,
    priority::{self, PriorityScheduler},
};
use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicBool, Ordering},
};

type Shared = Arc<OnceLock<Arc<Alarm>>>;

fn alarm(shared: &Shared) -> &Alarm {
    shared.get().expect("alarm is installed at boot")
}

fn record<T>(log: &SpinLock<Vec<T>>, item: T) {
    let mut guard = log.lock();
    guard.push(item);
    guard.unlock();
}

#[test]
fn sleeper_wakes_at_deadline() {
    let shared: Shared = Arc::default();
    let slot = shared.clone();
    let code = keos::boot(
        move |config| {
            let _ = slot.set(Alarm::install(config));
        },
        move || {
            let woke = Arc::new(SpinLock::new(Vec::new()));
            let sleeper = {
                let (shared, woke) = (shared.clone(), woke.clone());
                ThreadBuilder::new("sleeper").spawn(move || {
                    let start = keos::timer::now();
                    alarm(&shared).sleep_for(100);
                    record(&woke, (start, keos::timer::now()));
                })
            };

            alarm(&shared).sleep_for(50);
            let now = keos::timer::now();
            assert!((50..100).contains(&now), "main woke at {now}");
            assert_eq!(get_state_by_tid(sleeper.tid), Ok(ThreadState::Parked));
            assert_eq!(alarm(&shared).sleepers(), 1);

            sleeper.join();
            let mut woke = woke.lock();
            let (start, at) = woke.pop().unwrap();
            woke.unlock();
            assert!(at >= start + 100, "slept from {start} to {at}");
            assert_eq!(alarm(&shared).sleepers(), 0);
        },
    );
    assert_eq!(code, Ok(0));
}

#[test]
fn every_tick_ends_the_time_slice() {
    let code = keos::boot(
        |config| {
            Alarm::install(config);
        },
        || {
            let ran = Arc::new(AtomicBool::new(false));
            let child = {
                let ran = ran.clone();
                ThreadBuilder::new("child").spawn(move || ran.store(true, Ordering::SeqCst))
            };
            // Nobody sleeps, and the FIFO scheduler never preempts on its
            // own: only the alarm hands the processor over.
            let mut ticks = 0;
            while !ran.load(Ordering::SeqCst) && ticks < 100 {
                drop(InterruptGuard::new());
                ticks += 1;
            }
            assert!(ran.load(Ordering::SeqCst), "child never ran");
            assert!(ticks <= 2, "child ran after {ticks} ticks");
            assert_eq!(child.join(), 0);
        },
    );
    assert_eq!(code, Ok(0));
}

#[test]
fn zero_ticks_waits_for_next_interrupt() {
    let shared: Shared = Arc::default();
    let slot = shared.clone();
    let code = keos::boot(
        move |config| {
            config.set_timer_period(8).unwrap();
            let _ = slot.set(Alarm::install(config));
        },
        move || {
            let before = keos::timer::now();
            alarm(&shared).sleep_for(0);
            let after = keos::timer::now();
            // Served by the first timer interrupt after the call.
            assert!(after >= (before / 8 + 1) * 8, "slept from {before} to {after}");
        },
    );
    assert_eq!(code, Ok(0));
}

#[test]
fn sleepers_wake_in_deadline_order() {
    let shared: Shared = Arc::default();
    let slot = shared.clone();
    let code = keos::boot(
        move |config| {
            let _ = slot.set(Alarm::install(config));
        },
        move || {
            let order = Arc::new(SpinLock::new(Vec::new()));
            let sleepers: Vec<_> = [30, 10, 20, 10]
                .into_iter()
                .enumerate()
                .map(|(i, ticks)| {
                    let (shared, order) = (shared.clone(), order.clone());
                    ThreadBuilder::new(format!("sleeper{i}")).spawn(move || {
                        alarm(&shared).sleep_for(ticks);
                        record(&order, i);
                    })
                })
                .collect();
            for sleeper in sleepers {
                sleeper.join();
            }
            let order = order.lock();
            assert_eq!(*order, vec![1, 3, 2, 0]);
            order.unlock();
        },
    );
    assert_eq!(code, Ok(0));
}

#[test]
fn woken_sleeper_preempts_lower_priority() {
    let shared: Shared = Arc::default();
    let slot = shared.clone();
    let code = keos::boot(
        move |config| {
            PriorityScheduler::new().install(config);
            let _ = slot.set(Alarm::install(config));
        },
        move || {
            let woke = Arc::new(SpinLock::new(Vec::new()));
            let sleeper = {
                let (shared, woke) = (shared.clone(), woke.clone());
                priority::scheduler().spawn(ThreadBuilder::new("urgent"), 5, move || {
                    let start = keos::timer::now();
                    alarm(&shared).sleep_for(20);
                    record(&woke, (start, keos::timer::now()));
                })
            };
            // Busy: the clock only moves while this thread runs.
            while !sleeper.is_finished() {
                drop(InterruptGuard::new());
            }
            let mut woke = woke.lock();
            let (start, at) = woke.pop().unwrap();
            woke.unlock();
            assert!(
                (start + 20..=start + 22).contains(&at),
                "slept from {start} to {at}"
            );
        },
    );
    assert_eq!(code, Ok(0));
}
