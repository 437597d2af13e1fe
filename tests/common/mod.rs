#![allow(dead_code)]

use std::sync::{Mutex, MutexGuard};

use altstack_threads::{configure, shutdown, SchedulerConfig};

static SERIAL: Mutex<()> = Mutex::new(());

/// Tests in one binary share the signal dispositions, the interval timer and
/// the scheduler, so they take turns.
pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drops whatever an earlier test left behind and installs `config`.
pub fn reset(config: SchedulerConfig) {
    shutdown().expect("shutdown from the host");
    configure(config).expect("configure from the host");
}

/// Cooperative scheduling only, for tests that need a deterministic order.
pub fn cooperative() -> SchedulerConfig {
    SchedulerConfig::builder()
        .preemption(false)
        .build()
        .expect("valid config")
}
