//! Signal mask helpers shared by the context primitive and the scheduler.

use core::mem::MaybeUninit;

use crate::error::{ThreadError, ThreadResult};

/// Signal used to run the context bootstrap on an alternate stack.
pub const BOOTSTRAP_SIGNAL: libc::c_int = libc::SIGUSR1;

/// Signals that drive preemption.
pub const PREEMPTION_SIGNALS: [libc::c_int; 2] = [libc::SIGALRM, libc::SIGVTALRM];

/// Thin owned wrapper over `sigset_t`.
#[derive(Clone, Copy)]
pub struct SigSet(libc::sigset_t);

impl SigSet {
    pub fn empty() -> Self {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        unsafe {
            libc::sigemptyset(set.as_mut_ptr());
            SigSet(set.assume_init())
        }
    }

    pub fn full() -> Self {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        unsafe {
            libc::sigfillset(set.as_mut_ptr());
            SigSet(set.assume_init())
        }
    }

    pub fn of(signals: &[libc::c_int]) -> Self {
        let mut set = Self::empty();
        for &sig in signals {
            set.add(sig);
        }
        set
    }

    pub fn add(&mut self, sig: libc::c_int) {
        unsafe {
            libc::sigaddset(&mut self.0, sig);
        }
    }

    pub fn remove(&mut self, sig: libc::c_int) {
        unsafe {
            libc::sigdelset(&mut self.0, sig);
        }
    }

    pub fn contains(&self, sig: libc::c_int) -> bool {
        unsafe { libc::sigismember(&self.0, sig) == 1 }
    }

    pub fn as_raw(&self) -> &libc::sigset_t {
        &self.0
    }
}

fn sigmask(how: libc::c_int, set: Option<&SigSet>) -> ThreadResult<SigSet> {
    let mut old = SigSet::empty();
    let set_ptr = set.map_or(core::ptr::null(), |s| s.as_raw() as *const _);
    let rc = unsafe { libc::pthread_sigmask(how, set_ptr, &mut old.0) };
    if rc != 0 {
        return Err(ThreadError::Signal {
            op: "pthread_sigmask",
            errno: rc,
        });
    }
    Ok(old)
}

/// Adds `set` to the calling thread's mask and returns the previous mask.
pub fn block(set: &SigSet) -> ThreadResult<SigSet> {
    sigmask(libc::SIG_BLOCK, Some(set))
}

/// Replaces the calling thread's mask and returns the previous mask.
pub fn set_mask(set: &SigSet) -> ThreadResult<SigSet> {
    sigmask(libc::SIG_SETMASK, Some(set))
}

pub fn current_mask() -> ThreadResult<SigSet> {
    sigmask(libc::SIG_BLOCK, None)
}

/// Unblocks the preemption signals for the calling thread.
///
/// Called after every context switch: a context captured inside a signal
/// handler carries the handler's mask, which has these signals blocked.
pub fn unblock_preemption() {
    let set = SigSet::of(&PREEMPTION_SIGNALS);
    unsafe {
        libc::pthread_sigmask(libc::SIG_UNBLOCK, set.as_raw(), core::ptr::null_mut());
    }
}

/// Masks the preemption signals until dropped, then restores the previous mask.
///
/// Guards nest: each one restores exactly the mask it found.
pub struct PreemptionGuard {
    previous: SigSet,
}

impl PreemptionGuard {
    pub fn new() -> Self {
        let previous = match block(&SigSet::of(&PREEMPTION_SIGNALS)) {
            Ok(previous) => previous,
            Err(_) => crate::error::fatal("unable to mask preemption signals"),
        };
        PreemptionGuard { previous }
    }
}

impl Default for PreemptionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PreemptionGuard {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_sigmask(
                libc::SIG_SETMASK,
                self.previous.as_raw(),
                core::ptr::null_mut(),
            );
        }
    }
}

/// Installs `handler` for `sig`, returning the disposition it replaced.
pub fn install_handler(
    sig: libc::c_int,
    handler: extern "C" fn(libc::c_int),
    flags: libc::c_int,
    mask: &SigSet,
) -> ThreadResult<libc::sigaction> {
    let mut action: libc::sigaction = unsafe { core::mem::zeroed() };
    action.sa_sigaction = handler as libc::sighandler_t;
    action.sa_flags = flags;
    action.sa_mask = *mask.as_raw();

    let mut previous: libc::sigaction = unsafe { core::mem::zeroed() };
    if unsafe { libc::sigaction(sig, &action, &mut previous) } == -1 {
        return Err(ThreadError::Signal {
            op: "sigaction",
            errno: crate::error::errno(),
        });
    }
    Ok(previous)
}

/// Puts back a disposition previously returned by [`install_handler`].
pub fn restore_handler(sig: libc::c_int, previous: &libc::sigaction) -> ThreadResult<()> {
    if unsafe { libc::sigaction(sig, previous, core::ptr::null_mut()) } == -1 {
        return Err(ThreadError::Signal {
            op: "sigaction",
            errno: crate::error::errno(),
        });
    }
    Ok(())
}

/// Kernel id of the calling OS thread.
pub fn os_thread_id() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// Sends `sig` to one OS thread of this process.
pub fn signal_thread(tid: libc::pid_t, sig: libc::c_int) {
    unsafe {
        libc::syscall(
            libc::SYS_tgkill,
            libc::getpid() as libc::c_long,
            tid as libc::c_long,
            sig as libc::c_long,
        );
    }
}
