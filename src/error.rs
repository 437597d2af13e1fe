use crate::thread::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ThreadError {
    #[error("failed to allocate a {size} byte stack (errno {errno})")]
    StackAllocation { size: usize, errno: i32 },

    #[error("invalid stack size: {size}, minimum is {min} bytes")]
    InvalidStackSize { size: usize, min: usize },

    #[error("thread registry could not grow")]
    RegistryExhausted,

    #[error("a context creation is already in progress on this thread")]
    CreationInProgress,

    #[error("{op} failed (errno {errno})")]
    Signal { op: &'static str, errno: i32 },

    #[error("interval timer setup failed (errno {errno})")]
    Timer { errno: i32 },

    #[error("no thread with id {0}")]
    InvalidThreadId(ThreadId),

    #[error("thread {0} was released by shutdown before it exited")]
    Abandoned(ThreadId),

    #[error("operation requires the host context, not a green thread")]
    NotHostContext,

    #[error("scheduler is being driven by another OS thread")]
    SchedulerBusy,

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

impl ThreadError {
    /// Whether the caller can reasonably retry or carry on after this error.
    pub fn is_recoverable(self) -> bool {
        match self {
            ThreadError::StackAllocation { .. }
            | ThreadError::RegistryExhausted
            | ThreadError::CreationInProgress
            | ThreadError::SchedulerBusy => true,
            ThreadError::InvalidStackSize { .. }
            | ThreadError::Signal { .. }
            | ThreadError::Timer { .. }
            | ThreadError::InvalidThreadId(_)
            | ThreadError::Abandoned(_)
            | ThreadError::NotHostContext
            | ThreadError::InvalidConfig(_) => false,
        }
    }
}

pub type ThreadResult<T> = Result<T, ThreadError>;

/// Last OS error for the calling thread.
pub(crate) fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

/// Reports an unrecoverable invariant violation and aborts.
///
/// Only uses `write(2)` and `abort(3)`, so it is safe to call from a signal
/// handler or from a context whose stack state is suspect.
pub(crate) fn fatal(msg: &str) -> ! {
    const PREFIX: &[u8] = b"altstack-threads: fatal: ";
    unsafe {
        libc::write(2, PREFIX.as_ptr().cast(), PREFIX.len());
        libc::write(2, msg.as_ptr().cast(), msg.len());
        libc::write(2, b"\n".as_ptr().cast(), 1);
        libc::abort()
    }
}
