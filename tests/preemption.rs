//! Timer driven preemption of threads that never yield.

mod common;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use altstack_threads::time::Instant;
use altstack_threads::{
    create, critical, exit_thread, join, shutdown, sleep, stats, yield_thread, SchedulerConfig,
};

fn preemptive(interval: Duration) -> SchedulerConfig {
    SchedulerConfig::builder()
        .preemption(true)
        .preemption_interval(interval)
        .build()
        .expect("config")
}

fn spin_for(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}

/// A thread that spins forever is taken off the CPU every period, so a
/// yielding neighbour still makes progress.
#[test]
fn test_spinner_is_preempted() {
    const TICKS: usize = 5;
    static SPINS: AtomicU64 = AtomicU64::new(0);
    static SEEN_AT: [AtomicU64; TICKS] = [const { AtomicU64::new(0) }; TICKS];

    fn spinner(_: usize) {
        loop {
            SPINS.fetch_add(1, Ordering::Relaxed);
            std::hint::spin_loop();
        }
    }

    fn ticker(_: usize) {
        for tick in SEEN_AT.iter() {
            tick.store(Instant::now().as_nanos(), Ordering::SeqCst);
            yield_thread();
        }
        exit_thread()
    }

    let _serial = common::serial();
    let interval = Duration::from_millis(20);
    common::reset(preemptive(interval));
    let before = stats();

    let _spinner = create(spinner, 0).expect("create spinner");
    let ticker = create(ticker, 0).expect("create ticker");
    join(&ticker).expect("join ticker");

    assert!(SPINS.load(Ordering::Relaxed) > 0);
    assert!(stats().preemptions - before.preemptions >= TICKS as u64);

    let times: Vec<u64> = SEEN_AT.iter().map(|t| t.load(Ordering::SeqCst)).collect();
    for pair in times.windows(2) {
        let gap = Duration::from_nanos(pair[1].saturating_sub(pair[0]));
        assert!(gap < interval * 25, "ticker starved for {:?}", gap);
    }

    assert_eq!(shutdown(), Ok(1));
}

/// Code inside `critical` runs to completion even across several ticks.
#[test]
fn test_critical_section_is_not_preempted() {
    static NEIGHBOUR_RUNS: AtomicUsize = AtomicUsize::new(0);
    static INTERRUPTED: AtomicBool = AtomicBool::new(true);
    static DONE: AtomicBool = AtomicBool::new(false);

    fn guarded(_: usize) {
        critical(|| {
            let before = NEIGHBOUR_RUNS.load(Ordering::SeqCst);
            spin_for(Duration::from_millis(60));
            let after = NEIGHBOUR_RUNS.load(Ordering::SeqCst);
            INTERRUPTED.store(before != after, Ordering::SeqCst);
        });
        DONE.store(true, Ordering::SeqCst);
        exit_thread()
    }

    fn neighbour(_: usize) {
        while !DONE.load(Ordering::SeqCst) {
            NEIGHBOUR_RUNS.fetch_add(1, Ordering::SeqCst);
            yield_thread();
        }
        exit_thread()
    }

    let _serial = common::serial();
    common::reset(preemptive(Duration::from_millis(10)));
    DONE.store(false, Ordering::SeqCst);
    INTERRUPTED.store(true, Ordering::SeqCst);

    let g = create(guarded, 0).expect("create");
    let n = create(neighbour, 0).expect("create");
    join(&g).expect("join guarded");
    join(&n).expect("join neighbour");

    assert!(!INTERRUPTED.load(Ordering::SeqCst));
}

/// A sleeper, a polite yielder and a CPU hog sharing the scheduler.
#[test]
fn test_sleeper_yielder_and_hog() {
    static EVENTS: Mutex<Vec<char>> = Mutex::new(Vec::new());

    fn record(event: char) {
        critical(|| {
            EVENTS
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(event)
        });
    }

    fn sleeper(_: usize) {
        for _ in 0..5 {
            record('A');
            sleep(Duration::from_millis(40));
        }
        exit_thread()
    }

    fn yielder(_: usize) {
        loop {
            record('B');
            yield_thread();
        }
    }

    fn hog(_: usize) {
        loop {
            record('C');
            spin_for(Duration::from_millis(5));
        }
    }

    let _serial = common::serial();
    common::reset(preemptive(Duration::from_millis(10)));
    EVENTS.lock().unwrap_or_else(|p| p.into_inner()).clear();

    let a = create(sleeper, 0).expect("create sleeper");
    create(yielder, 0).expect("create yielder");
    create(hog, 0).expect("create hog");
    join(&a).expect("join sleeper");
    assert_eq!(shutdown(), Ok(2));

    let events = EVENTS.lock().unwrap_or_else(|p| p.into_inner()).clone();
    assert_eq!(events.iter().filter(|&&e| e == 'A').count(), 5);
    assert!(events.contains(&'B'));
    assert!(events.contains(&'C'));

    // The hog never yields, so a 'B' after a 'C' means it was preempted.
    let first_hog = events.iter().position(|&e| e == 'C').expect("hog ran");
    assert!(events[first_hog..].contains(&'B'));

    // The others ran while the sleeper slept.
    let first_a = events.iter().position(|&e| e == 'A').expect("sleeper ran");
    let last_a = events.iter().rposition(|&e| e == 'A').expect("sleeper ran");
    assert!(events[first_a..last_a].iter().any(|&e| e != 'A'));
}

/// A timer signal that lands on another OS thread is passed on to the one
/// driving the scheduler.
#[test]
fn test_signal_on_other_os_thread_is_forwarded() {
    static SENDING: AtomicBool = AtomicBool::new(true);

    fn spinner(_: usize) {
        loop {
            std::hint::spin_loop();
        }
    }

    fn ticker(_: usize) {
        for _ in 0..3 {
            yield_thread();
        }
        exit_thread()
    }

    let _serial = common::serial();
    // Long enough that the timer itself never fires during the test.
    common::reset(preemptive(Duration::from_secs(60)));

    // Stray signals sent after the join restores this disposition are
    // ignored instead of killing the process.
    let previous = unsafe { libc::signal(libc::SIGALRM, libc::SIG_IGN) };
    SENDING.store(true, Ordering::SeqCst);
    let sender = std::thread::spawn(|| {
        while SENDING.load(Ordering::SeqCst) {
            unsafe { libc::raise(libc::SIGALRM) };
            std::thread::sleep(Duration::from_millis(5));
        }
    });

    let before = stats();
    create(spinner, 0).expect("create spinner");
    let ticker = create(ticker, 0).expect("create ticker");
    join(&ticker).expect("join ticker");
    let preempted = stats().preemptions - before.preemptions;

    SENDING.store(false, Ordering::SeqCst);
    sender.join().expect("sender thread");
    unsafe { libc::signal(libc::SIGALRM, previous) };

    assert!(preempted >= 4, "preempted {} times", preempted);
    assert_eq!(shutdown(), Ok(1));
}
