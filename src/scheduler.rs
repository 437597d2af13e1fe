use core::cell::UnsafeCell;

use log::{debug, trace, warn};
use portable_atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};

use crate::config::{Reclaim, SchedulerConfig};
use crate::context::{switch_raw, Context, Entry, RawContext};
use crate::error::{fatal, ThreadError, ThreadResult};
use crate::preemption::Preemption;
use crate::registry::{Registry, Slot};
use crate::signal::{self, PreemptionGuard};
use crate::thread::{ThreadHandle, ThreadId, ThreadState};
use crate::time::{self, Instant};

/// Context currently executing, 0 while the host runs. Cleared by the
/// thread itself right before it switches back to the host.
static RUNNING: AtomicUsize = AtomicUsize::new(0);
/// The host (join caller) context.
static HOST: AtomicUsize = AtomicUsize::new(0);
static CURRENT_ID: AtomicU64 = AtomicU64::new(0);
/// Kernel id of the OS thread inside `join`, 0 when nobody drives the scheduler.
static OWNER: AtomicI32 = AtomicI32::new(0);

static CREATED: AtomicU64 = AtomicU64::new(0);
static EXITED: AtomicU64 = AtomicU64::new(0);
static RECLAIMED: AtomicU64 = AtomicU64::new(0);
static DISPATCHES: AtomicU64 = AtomicU64::new(0);
static PREEMPTIONS: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerStats {
    pub created: u64,
    pub exited: u64,
    pub reclaimed: u64,
    pub dispatches: u64,
    pub preemptions: u64,
    /// Threads still in the ring, terminated ones included until reclaimed.
    pub live: usize,
}

pub struct Scheduler {
    config: SchedulerConfig,
    registry: Registry,
    host: Context,
    running: Option<Slot>,
    last_exited: Option<ThreadId>,
}

pub struct SchedulerCell(UnsafeCell<Option<Scheduler>>);

unsafe impl Sync for SchedulerCell {}

impl Default for SchedulerCell {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerCell {
    pub const fn new() -> Self {
        SchedulerCell(UnsafeCell::new(None))
    }

    /// # Safety
    /// Returns a mutable reference to the scheduler. The caller must not let it
    /// overlap another one; [`with_scheduler`] masks preemption to ensure that.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get(&self) -> &mut Scheduler {
        (*self.0.get()).get_or_insert_with(Scheduler::new)
    }
}

pub static SCHEDULER: SchedulerCell = SchedulerCell::new();

/// Runs `f` on the scheduler with preemption signals masked, so a timer tick
/// can never observe a half-done update.
pub(crate) fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    let _guard = PreemptionGuard::new();
    unsafe { f(SCHEDULER.get()) }
}

enum Step {
    Done,
    Continue,
    Dispatch(RawContext, RawContext, ThreadId),
    Idle(Instant),
}

impl Scheduler {
    fn new() -> Self {
        let host = Context::host();
        HOST.store(host.raw().addr(), Ordering::Release);
        Scheduler {
            config: SchedulerConfig::default(),
            registry: Registry::new(),
            host,
            running: None,
            last_exited: None,
        }
    }

    fn mark_current_asleep(&mut self, deadline: Instant) {
        let slot = self.current_slot();
        if let Some(tcb) = self.registry.get_mut(slot) {
            tcb.sleep_until(deadline);
        }
    }

    fn mark_current_exited(&mut self) -> ThreadId {
        let slot = self.current_slot();
        let tcb = match self.registry.get_mut(slot) {
            Some(tcb) => tcb,
            None => fatal("running thread missing from the registry"),
        };
        tcb.terminate();
        let id = tcb.id;
        self.last_exited = Some(id);
        id
    }

    fn current_slot(&self) -> Slot {
        match self.running {
            Some(slot) => slot,
            None => fatal("no green thread is running"),
        }
    }

    /// One iteration of the scan: visit the node under the cursor.
    fn step(&mut self, done: &mut impl FnMut(&Scheduler) -> bool) -> Step {
        if done(self) {
            return Step::Done;
        }
        let Some(slot) = self.registry.cursor() else {
            return Step::Done;
        };

        let now = Instant::now();
        let reclaim = self.config.reclaim;
        let tcb = match self.registry.get_mut(slot) {
            Some(tcb) => tcb,
            None => fatal("ring references an empty slot"),
        };
        if tcb.wake_if_due(now) {
            trace!("thread {} woke", tcb.id);
        }

        match tcb.state() {
            ThreadState::Ready => {
                let id = tcb.id;
                let context = tcb.context().raw();
                self.running = Some(slot);
                return Step::Dispatch(self.host.raw(), context, id);
            }
            ThreadState::Terminated if reclaim == Reclaim::Lazy => {
                if let Some(tcb) = self.registry.remove_at_cursor() {
                    RECLAIMED.fetch_add(1, Ordering::Relaxed);
                    debug!("reclaimed thread {}", tcb.id);
                }
                return Step::Continue;
            }
            _ => {}
        }

        self.registry.advance();

        if !self.registry.any_runnable() {
            if let Some(deadline) = self.registry.earliest_deadline() {
                if deadline > now {
                    return Step::Idle(deadline);
                }
            }
        }
        Step::Continue
    }

    fn finish_dispatch(&mut self) {
        self.running = None;
        self.registry.advance();
        DISPATCHES.fetch_add(1, Ordering::Relaxed);
    }
}

/// Switches from the host into `context` and returns once it hands the CPU
/// back (yield, sleep, exit or preemption).
fn dispatch(host: RawContext, context: RawContext, id: ThreadId) {
    let _guard = PreemptionGuard::new();
    CURRENT_ID.store(id, Ordering::Release);
    RUNNING.store(context.addr(), Ordering::Release);
    trace!("dispatching thread {}", id);
    unsafe { switch_raw(host, context) };
}

/// Runs the scan from the head of the ring until `done` holds.
fn run_until(mut done: impl FnMut(&Scheduler) -> bool) {
    with_scheduler(|s| s.registry.rewind());
    loop {
        match with_scheduler(|s| s.step(&mut done)) {
            Step::Done => return,
            Step::Continue => {}
            Step::Dispatch(host, context, id) => {
                dispatch(host, context, id);
                with_scheduler(Scheduler::finish_dispatch);
            }
            Step::Idle(deadline) => time::sleep_until(deadline),
        }
    }
}

/// Hands the CPU from the running thread back to the host.
///
/// # Safety
/// `this` must be the context of the calling green thread.
unsafe fn switch_to_host(this: RawContext) {
    let host = RawContext::from_addr(HOST.load(Ordering::Acquire));
    RUNNING.store(0, Ordering::Release);
    switch_raw(this, host);
}

fn running_context() -> Option<RawContext> {
    match RUNNING.load(Ordering::Acquire) {
        0 => None,
        addr => Some(unsafe { RawContext::from_addr(addr) }),
    }
}

pub(crate) fn create_thread(
    function: Entry,
    arg: usize,
    stack_size: Option<usize>,
    name: Option<&'static str>,
) -> ThreadResult<ThreadHandle> {
    let stack_size = match stack_size {
        Some(size) => size,
        None => with_scheduler(|s| s.config.stack_size),
    };
    let context = Context::create(function, arg, stack_size)?;
    let (id, _slot) = with_scheduler(|s| s.registry.insert(context, name))?;
    CREATED.fetch_add(1, Ordering::Relaxed);
    debug!("created thread {} ({})", id, name.unwrap_or("unnamed"));
    Ok(ThreadHandle::new(id))
}

pub(crate) fn current_id() -> Option<ThreadId> {
    running_context().map(|_| CURRENT_ID.load(Ordering::Acquire))
}

pub(crate) fn yield_current() {
    let _guard = PreemptionGuard::new();
    if let Some(this) = running_context() {
        unsafe { switch_to_host(this) };
    }
}

pub(crate) fn sleep_current(duration: core::time::Duration) {
    let deadline = Instant::now() + duration;
    let guard = PreemptionGuard::new();
    match running_context() {
        Some(this) => {
            with_scheduler(|s| s.mark_current_asleep(deadline));
            unsafe { switch_to_host(this) };
        }
        None => {
            drop(guard);
            while Instant::now() < deadline {
                time::sleep_until(deadline);
            }
        }
    }
}

pub(crate) fn exit_current() -> ! {
    let _guard = PreemptionGuard::new();
    let Some(this) = running_context() else {
        fatal("exit_thread called outside a green thread");
    };
    let id = with_scheduler(Scheduler::mark_current_exited);
    EXITED.fetch_add(1, Ordering::Relaxed);
    debug!("thread {} exited", id);
    unsafe { switch_to_host(this) };
    fatal("a terminated thread was switched into")
}

/// Timer tick. Async-signal-safe: touches only atomics and the two contexts.
pub(crate) fn preempt_from_signal() {
    let owner = OWNER.load(Ordering::Acquire);
    if owner == 0 {
        return;
    }
    if signal::os_thread_id() != owner {
        signal::signal_thread(owner, libc::SIGALRM);
        return;
    }
    if let Some(this) = running_context() {
        let saved_errno = crate::error::errno();
        PREEMPTIONS.fetch_add(1, Ordering::Relaxed);
        unsafe {
            switch_to_host(this);
            *libc::__errno_location() = saved_errno;
        }
    }
}

/// Marks the calling OS thread as the one driving the scheduler.
struct Ownership;

impl Ownership {
    /// A second claim from the owning OS thread can only come from one of its
    /// green threads.
    fn claim() -> ThreadResult<Self> {
        let me = signal::os_thread_id();
        match OWNER.compare_exchange(0, me, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(Ownership),
            Err(owner) if owner == me => Err(ThreadError::NotHostContext),
            Err(_) => Err(ThreadError::SchedulerBusy),
        }
    }
}

impl Drop for Ownership {
    fn drop(&mut self) {
        OWNER.store(0, Ordering::Release);
    }
}

pub(crate) fn join(handle: &ThreadHandle) -> ThreadResult<()> {
    let _owner = Ownership::claim()?;
    let target = handle.id();

    let status = with_scheduler(|s| s.registry.status(target));
    match status {
        None if with_scheduler(|s| s.registry.was_abandoned(target)) => {
            return Err(ThreadError::Abandoned(target));
        }
        None => return Err(ThreadError::InvalidThreadId(target)),
        Some(ThreadState::Terminated) => return Ok(()),
        Some(_) => {}
    }

    let (preempt, interval) =
        with_scheduler(|s| (s.config.preemption, s.config.preemption_interval));
    let mut preemption = Preemption::new();
    if preempt {
        unsafe { preemption.enable(interval)? };
    }

    run_until(|s| s.registry.status(target) == Some(ThreadState::Terminated));

    unsafe { preemption.disable() };
    debug!("joined thread {}", target);
    Ok(())
}

pub(crate) fn configure(config: SchedulerConfig) -> ThreadResult<()> {
    config.validate()?;
    let _owner = Ownership::claim()?;
    with_scheduler(|s| s.config = config);
    Ok(())
}

pub(crate) fn shutdown() -> ThreadResult<usize> {
    let _owner = Ownership::claim()?;
    let drained = with_scheduler(|s| {
        s.running = None;
        s.last_exited = None;
        s.registry.drain()
    });
    let abandoned = drained.iter().filter(|t| !t.is_terminated()).count();
    if abandoned > 0 {
        warn!("shutdown abandoned {} unfinished thread(s)", abandoned);
    }
    debug!("scheduler shut down, released {} thread(s)", drained.len());
    drop(drained);
    Ok(abandoned)
}

pub(crate) fn stats() -> SchedulerStats {
    SchedulerStats {
        created: CREATED.load(Ordering::Relaxed),
        exited: EXITED.load(Ordering::Relaxed),
        reclaimed: RECLAIMED.load(Ordering::Relaxed),
        dispatches: DISPATCHES.load(Ordering::Relaxed),
        preemptions: PREEMPTIONS.load(Ordering::Relaxed),
        live: with_scheduler(|s| s.registry.len()),
    }
}

pub(crate) fn last_exited() -> Option<ThreadId> {
    with_scheduler(|s| s.last_exited)
}
