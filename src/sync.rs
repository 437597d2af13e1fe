//! The thread API used from application code.

use core::time::Duration;

use crate::config::SchedulerConfig;
use crate::error::ThreadResult;
use crate::scheduler::{self, SchedulerStats};
use crate::signal::PreemptionGuard;
use crate::thread::{ThreadBuilder, ThreadHandle, ThreadId};

/// Creates a thread that will run `function(arg)` once the scheduler reaches
/// it. `function` must end by calling [`exit_thread`]; returning aborts the
/// process.
pub fn create(function: fn(usize), arg: usize) -> ThreadResult<ThreadHandle> {
    ThreadBuilder::new().create(function, arg)
}

/// Creates a thread running `f`, exiting it when `f` returns.
pub fn spawn<F>(f: F) -> ThreadResult<ThreadHandle>
where
    F: FnOnce() + 'static,
{
    ThreadBuilder::new().spawn(f)
}

/// Id of the calling green thread, `None` outside one.
pub fn thread_id() -> Option<ThreadId> {
    scheduler::current_id()
}

/// Gives the CPU back to the scheduler. No-op outside a green thread.
pub fn yield_thread() {
    scheduler::yield_current();
}

/// Suspends the calling green thread for at least `duration`.
///
/// Outside a green thread this blocks the OS thread instead.
pub fn sleep(duration: Duration) {
    scheduler::sleep_current(duration);
}

/// Terminates the calling green thread. It is never scheduled again.
pub fn exit_thread() -> ! {
    scheduler::exit_current()
}

/// Runs the scheduler until the thread behind `handle` has exited.
///
/// Must be called from the host context. Preemption is armed for the
/// duration of the call according to the current [`SchedulerConfig`].
pub fn join(handle: &ThreadHandle) -> ThreadResult<()> {
    scheduler::join(handle)
}

/// Runs `f` with preemption signals masked, so it cannot be interrupted by a
/// timer tick. Use it around output or allocation that other threads share.
pub fn critical<R>(f: impl FnOnce() -> R) -> R {
    let _guard = PreemptionGuard::new();
    f()
}

/// Replaces the scheduler configuration. Affects threads created and joins
/// started afterwards.
pub fn configure(config: SchedulerConfig) -> ThreadResult<()> {
    scheduler::configure(config)
}

/// Releases every thread and its stack, finished or not, and returns how
/// many unfinished threads were abandoned. Ids keep increasing afterwards.
pub fn shutdown() -> ThreadResult<usize> {
    scheduler::shutdown()
}

pub fn stats() -> SchedulerStats {
    scheduler::stats()
}

/// Id recorded by the most recent [`exit_thread`].
pub fn last_exited() -> Option<ThreadId> {
    scheduler::last_exited()
}
