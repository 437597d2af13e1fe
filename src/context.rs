//! Execution contexts with their own stacks.
//!
//! A new context gets its stack without any architecture specific code: the
//! stack is installed as the alternate signal stack, a signal is raised at the
//! calling thread, and the handler (now running on the new stack) captures its
//! own state. That capture outlives the handler's return, and switching into
//! it later lands in [`trampoline`], which parks the context until the
//! scheduler dispatches it for real.
//!
//! Capture and restore are the glibc `getcontext`/`setcontext`/`swapcontext`
//! family; `save` has the same frame-liveness rules as `setjmp`.

use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::fmt;
use core::ptr;

use portable_atomic::{AtomicI32, AtomicPtr, Ordering};
use spin::{Mutex, MutexGuard};

use crate::error::{fatal, ThreadError, ThreadResult};
use crate::signal::{self, PreemptionGuard, SigSet, BOOTSTRAP_SIGNAL};
use crate::stack::Stack;

extern "C" {
    fn getcontext(ucp: *mut libc::ucontext_t) -> libc::c_int;
    fn setcontext(ucp: *const libc::ucontext_t) -> libc::c_int;
    fn swapcontext(oucp: *mut libc::ucontext_t, ucp: *const libc::ucontext_t) -> libc::c_int;
}

/// Entry point of a context. Receives the untyped argument given at creation
/// and must never return.
pub type Entry = fn(usize);

/// Result of [`save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// The state was just captured.
    Fresh,
    /// Control arrived here again through [`restore`] or [`switch`].
    Resumed,
}

struct State {
    uc: libc::ucontext_t,
    resumed: bool,
}

/// Stable address of a context's captured state.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawContext(*mut State);

impl RawContext {
    /// Address form, so the handle can live in an atomic.
    pub(crate) fn addr(self) -> usize {
        self.0 as usize
    }

    /// # Safety
    /// `addr` must come from [`RawContext::addr`] of a context that is still alive.
    pub(crate) unsafe fn from_addr(addr: usize) -> Self {
        RawContext(addr as *mut State)
    }

    unsafe fn mark_resumed(self, resumed: bool) {
        ptr::write_volatile(ptr::addr_of_mut!((*self.0).resumed), resumed);
    }

    unsafe fn was_resumed(self) -> bool {
        ptr::read_volatile(ptr::addr_of!((*self.0).resumed))
    }

    unsafe fn uc(self) -> *mut libc::ucontext_t {
        ptr::addr_of_mut!((*self.0).uc)
    }
}

/// Captured execution state plus, for created contexts, the stack it runs on.
///
/// The platform state record points into itself, so it is boxed; a `Context`
/// value can be moved freely once created.
pub struct Context {
    state: Box<UnsafeCell<State>>,
    stack: Option<Stack>,
}

impl Context {
    /// A context with no stack of its own, used to capture an execution that
    /// is already running (the caller of `join`, a test's main flow, ...).
    pub fn host() -> Self {
        Context {
            state: Box::new(UnsafeCell::new(State {
                uc: unsafe { core::mem::zeroed() },
                resumed: false,
            })),
            stack: None,
        }
    }

    /// Creates a context that will run `entry(arg)` on a fresh stack of
    /// `stack_size` bytes the first time it is switched into (after the
    /// switch that completes its bootstrap, which happens inside this call).
    ///
    /// The caller's signal mask, `SIGUSR1` disposition and alternate signal
    /// stack are the same on return as on entry.
    pub fn create(entry: Entry, arg: usize, stack_size: usize) -> ThreadResult<Self> {
        let mut context = Context::host();
        context.stack = Some(Stack::new(stack_size)?);

        let _preemption = PreemptionGuard::new();
        let _lock = CreationLock::acquire()?;
        let creator = Context::host();

        unsafe { bootstrap(&context, &creator, entry, arg)? };
        Ok(context)
    }

    pub(crate) fn raw(&self) -> RawContext {
        RawContext(self.state.get())
    }

    /// Usable size of the owned stack, `None` for host contexts.
    pub fn stack_size(&self) -> Option<usize> {
        self.stack.as_ref().map(Stack::len)
    }

    /// Whether `addr` lies inside this context's stack.
    pub fn owns_address(&self, addr: usize) -> bool {
        self.stack.as_ref().is_some_and(|s| s.contains(addr))
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("state", &self.state.get())
            .field("stack_size", &self.stack_size())
            .finish()
    }
}

/// Captures the caller's registers, stack pointer, program counter and
/// signal mask into `ctx`.
///
/// # Safety
/// Like `setjmp`: the frame calling `save` must still be live when `ctx` is
/// later restored, and locals modified between the capture and the restore
/// must not be relied on unless they live in memory the compiler cannot cache.
#[inline(always)]
pub unsafe fn save(ctx: &Context) -> Capture {
    save_raw(ctx.raw())
}

#[inline(always)]
pub(crate) unsafe fn save_raw(ctx: RawContext) -> Capture {
    ctx.mark_resumed(false);
    if getcontext(ctx.uc()) == -1 {
        fatal("getcontext failed");
    }
    if ctx.was_resumed() {
        Capture::Resumed
    } else {
        Capture::Fresh
    }
}

/// Transfers control to the point `ctx` was captured.
///
/// # Safety
/// `ctx` must hold a capture whose frame (for [`save`]) or stack (for created
/// contexts) is still valid.
pub unsafe fn restore(ctx: &Context) -> ! {
    restore_raw(ctx.raw())
}

pub(crate) unsafe fn restore_raw(ctx: RawContext) -> ! {
    ctx.mark_resumed(true);
    setcontext(ctx.uc());
    fatal("setcontext failed")
}

/// Captures `old` and resumes `new`. Returns when something switches back
/// into `old`; preemption signals are unblocked at that point.
///
/// # Safety
/// `new` must hold a valid capture and `old` must stay alive until it is
/// resumed or discarded.
pub unsafe fn switch(old: &Context, new: &Context) {
    switch_raw(old.raw(), new.raw())
}

pub(crate) unsafe fn switch_raw(old: RawContext, new: RawContext) {
    old.mark_resumed(false);
    new.mark_resumed(true);
    if swapcontext(old.uc(), new.uc()) == -1 {
        fatal("swapcontext failed");
    }
    signal::unblock_preemption();
}

/// Everything the bootstrap handler and trampoline need for one creation.
/// Lives on the creator's stack for the duration of [`bootstrap`].
struct CreationRequest {
    target: RawContext,
    creator: RawContext,
    entry: Entry,
    arg: usize,
    original_mask: SigSet,
    creator_tid: libc::pid_t,
    captured: bool,
}

static PENDING: AtomicPtr<CreationRequest> = AtomicPtr::new(ptr::null_mut());
static CREATION: Mutex<()> = Mutex::new(());
static CREATOR_TID: AtomicI32 = AtomicI32::new(0);

/// Serializes creations across OS threads and refuses a nested creation on
/// the thread that already holds it.
struct CreationLock {
    _guard: MutexGuard<'static, ()>,
}

impl CreationLock {
    fn acquire() -> ThreadResult<Self> {
        let me = signal::os_thread_id();
        loop {
            if let Some(guard) = CREATION.try_lock() {
                CREATOR_TID.store(me, Ordering::Release);
                return Ok(CreationLock { _guard: guard });
            }
            if CREATOR_TID.load(Ordering::Acquire) == me {
                return Err(ThreadError::CreationInProgress);
            }
            core::hint::spin_loop();
        }
    }
}

impl Drop for CreationLock {
    fn drop(&mut self) {
        CREATOR_TID.store(0, Ordering::Release);
    }
}

unsafe fn bootstrap(
    target: &Context,
    creator: &Context,
    entry: Entry,
    arg: usize,
) -> ThreadResult<()> {
    let stack = match target.stack.as_ref() {
        Some(stack) => stack,
        None => fatal("bootstrap of a context without a stack"),
    };

    let original_mask = signal::block(&SigSet::of(&[BOOTSTRAP_SIGNAL]))?;

    let previous_action = match signal::install_handler(
        BOOTSTRAP_SIGNAL,
        on_bootstrap_signal,
        libc::SA_ONSTACK,
        &SigSet::empty(),
    ) {
        Ok(action) => action,
        Err(err) => {
            let _ = signal::set_mask(&original_mask);
            return Err(err);
        }
    };

    let alt = libc::stack_t {
        ss_sp: stack.bottom().cast(),
        ss_flags: 0,
        ss_size: stack.len(),
    };
    let mut previous_alt: libc::stack_t = core::mem::zeroed();
    if libc::sigaltstack(&alt, &mut previous_alt) == -1 {
        let errno = crate::error::errno();
        let _ = signal::restore_handler(BOOTSTRAP_SIGNAL, &previous_action);
        let _ = signal::set_mask(&original_mask);
        return Err(ThreadError::Signal {
            op: "sigaltstack",
            errno,
        });
    }

    let mut request = CreationRequest {
        target: target.raw(),
        creator: creator.raw(),
        entry,
        arg,
        original_mask,
        creator_tid: signal::os_thread_id(),
        captured: false,
    };
    PENDING.store(ptr::addr_of_mut!(request), Ordering::Release);

    // Pending until sigsuspend lets it through; the handler then runs on `alt`.
    libc::raise(BOOTSTRAP_SIGNAL);
    let mut wait = SigSet::full();
    wait.remove(BOOTSTRAP_SIGNAL);
    libc::sigsuspend(wait.as_raw());

    let disable = libc::stack_t {
        ss_sp: ptr::null_mut(),
        ss_flags: libc::SS_DISABLE,
        ss_size: 0,
    };
    libc::sigaltstack(&disable, ptr::null_mut());
    if previous_alt.ss_flags & libc::SS_DISABLE == 0 {
        libc::sigaltstack(&previous_alt, ptr::null_mut());
    }
    let restored = signal::restore_handler(BOOTSTRAP_SIGNAL, &previous_action)
        .and_then(|_| signal::set_mask(&original_mask).map(|_| ()));

    if !ptr::read_volatile(ptr::addr_of!(request.captured)) {
        PENDING.store(ptr::null_mut(), Ordering::Release);
        restored?;
        return Err(ThreadError::Signal {
            op: "sigsuspend",
            errno: crate::error::errno(),
        });
    }
    if let Err(err) = restored {
        PENDING.store(ptr::null_mut(), Ordering::Release);
        return Err(err);
    }

    // Second leg: run the trampoline up to its park point, then come back.
    switch_raw(request.creator, request.target);
    // `switch_raw` unblocked preemption; the caller's guard expects it blocked.
    if signal::set_mask(&request.original_mask).is_err() {
        fatal("unable to restore signal mask");
    }

    PENDING.store(ptr::null_mut(), Ordering::Release);
    Ok(())
}

extern "C" fn on_bootstrap_signal(_sig: libc::c_int) {
    let request = PENDING.load(Ordering::Acquire);
    if request.is_null() {
        return;
    }
    unsafe {
        if (*request).creator_tid != signal::os_thread_id() {
            return;
        }
        ptr::write_volatile(ptr::addr_of_mut!((*request).captured), true);
        if save_raw((*request).target) == Capture::Fresh {
            return;
        }
        trampoline(request)
    }
}

/// First code to run on a created context after the handler frame that
/// captured it has returned.
#[inline(never)]
unsafe fn trampoline(request: *const CreationRequest) -> ! {
    // The handler's mask had everything blocked.
    if signal::set_mask(&(*request).original_mask).is_err() {
        fatal("unable to restore signal mask");
    }

    let entry = (*request).entry;
    let arg = (*request).arg;
    let this = (*request).target;
    let creator = (*request).creator;

    // Park. `request` dies once the creator resumes; only locals are used below.
    switch_raw(this, creator);

    entry(arg);

    fatal("thread entry returned; green threads must end with exit_thread()")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::DEFAULT_STACK_SIZE;
    use std::time::Duration;

    static NESTED: Mutex<Option<ThreadResult<()>>> = Mutex::new(None);

    fn never(_: usize) {}

    extern "C" fn create_from_handler(_sig: libc::c_int) {
        let result = Context::create(never, 0, DEFAULT_STACK_SIZE).map(|_| ());
        *NESTED.lock() = Some(result);
    }

    #[test]
    fn nested_creation_on_same_thread_is_refused() {
        let _serial = crate::tests::serial();
        let lock = CreationLock::acquire().unwrap();
        assert_eq!(
            Context::create(never, 0, DEFAULT_STACK_SIZE).err(),
            Some(ThreadError::CreationInProgress)
        );
        drop(lock);
        assert!(Context::create(never, 0, DEFAULT_STACK_SIZE).is_ok());
    }

    #[test]
    fn creation_from_a_signal_handler_mid_creation_is_refused() {
        let _serial = crate::tests::serial();
        let previous =
            signal::install_handler(libc::SIGUSR2, create_from_handler, 0, &SigSet::empty())
                .unwrap();
        *NESTED.lock() = None;
        {
            let _lock = CreationLock::acquire().unwrap();
            unsafe { libc::raise(libc::SIGUSR2) };
        }
        signal::restore_handler(libc::SIGUSR2, &previous).unwrap();
        assert_eq!(*NESTED.lock(), Some(Err(ThreadError::CreationInProgress)));
    }

    #[test]
    fn creation_on_another_thread_waits_for_the_lock() {
        let _serial = crate::tests::serial();
        let lock = CreationLock::acquire().unwrap();
        let other = std::thread::spawn(|| Context::create(never, 0, DEFAULT_STACK_SIZE).is_ok());
        std::thread::sleep(Duration::from_millis(20));
        assert!(!other.is_finished());
        drop(lock);
        assert!(other.join().unwrap());
    }
}
