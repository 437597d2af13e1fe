#![no_std]

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
compile_error!("altstack-threads needs Linux with glibc (sigaltstack and the ucontext family)");

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod config;
pub mod context;
pub mod error;
pub mod preemption;
pub mod registry;
pub mod scheduler;
pub mod signal;
pub mod stack;
pub mod sync;
pub mod thread;
pub mod time;


pub use config::{ConfigBuilder, Reclaim, SchedulerConfig};
pub use context::{restore, save, switch, Capture, Context, Entry};
pub use error::{ThreadError, ThreadResult};
pub use scheduler::{Scheduler, SchedulerStats, SCHEDULER};
pub use sync::{
    configure, create, critical, exit_thread, join, last_exited, shutdown, sleep, spawn,
    stats, thread_id, yield_thread,
};
pub use thread::{ThreadBuilder, ThreadHandle, ThreadId, ThreadState};
