use alloc::boxed::Box;

use crate::context::Context;
use crate::error::ThreadResult;
use crate::time::Instant;

pub type ThreadId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Asleep,
    Terminated,
}

pub struct ThreadControlBlock {
    pub id: ThreadId,
    pub name: Option<&'static str>,
    state: ThreadState,
    wake_at: Option<Instant>,
    context: Context,
}

impl ThreadControlBlock {
    pub fn new(id: ThreadId, context: Context, name: Option<&'static str>) -> Self {
        ThreadControlBlock {
            id,
            name,
            state: ThreadState::Ready,
            wake_at: None,
            context,
        }
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// Sleep deadline; only present while the thread is asleep.
    pub fn deadline(&self) -> Option<Instant> {
        self.wake_at
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn is_runnable(&self) -> bool {
        self.state == ThreadState::Ready
    }

    pub fn is_terminated(&self) -> bool {
        self.state == ThreadState::Terminated
    }

    pub fn sleep_until(&mut self, deadline: Instant) {
        if self.is_terminated() {
            crate::error::fatal("terminated thread asked to sleep");
        }
        self.state = ThreadState::Asleep;
        self.wake_at = Some(deadline);
    }

    /// Makes a sleeper ready again once `now` has reached its deadline.
    /// Returns whether the thread woke.
    pub fn wake_if_due(&mut self, now: Instant) -> bool {
        match (self.state, self.wake_at) {
            (ThreadState::Asleep, Some(deadline)) if now >= deadline => {
                self.state = ThreadState::Ready;
                self.wake_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn terminate(&mut self) {
        self.state = ThreadState::Terminated;
        self.wake_at = None;
    }
}

impl core::fmt::Debug for ThreadControlBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadControlBlock")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("wake_at", &self.wake_at)
            .finish()
    }
}

/// Returned by thread creation; identifies the thread for [`join`](crate::sync::join).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle {
    id: ThreadId,
}

impl ThreadHandle {
    pub(crate) fn new(id: ThreadId) -> Self {
        ThreadHandle { id }
    }

    /// Rebuilds a handle from an id, e.g. one passed through a thread's
    /// `usize` argument.
    pub fn from_id(id: ThreadId) -> Self {
        ThreadHandle { id }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }
}

/// Per-thread creation options, in the shape of `std::thread::Builder`.
#[derive(Debug, Clone, Default)]
pub struct ThreadBuilder {
    name: Option<&'static str>,
    stack_size: Option<usize>,
}

impl ThreadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name shown in log output.
    pub fn name(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }

    /// Overrides the configured stack size for this thread.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Creates a thread running `function(arg)`. `function` must finish by
    /// calling [`exit_thread`](crate::sync::exit_thread).
    pub fn create(self, function: fn(usize), arg: usize) -> ThreadResult<ThreadHandle> {
        crate::scheduler::create_thread(function, arg, self.stack_size, self.name)
    }

    /// Creates a thread running `f`; the thread exits when `f` returns.
    pub fn spawn<F>(self, f: F) -> ThreadResult<ThreadHandle>
    where
        F: FnOnce() + 'static,
    {
        let closure: Box<Box<dyn FnOnce()>> = Box::new(Box::new(f));
        let arg = Box::into_raw(closure) as usize;
        match self.create(run_closure, arg) {
            Ok(handle) => Ok(handle),
            Err(err) => {
                drop(unsafe { Box::from_raw(arg as *mut Box<dyn FnOnce()>) });
                Err(err)
            }
        }
    }
}

fn run_closure(arg: usize) {
    let closure = unsafe { Box::from_raw(arg as *mut Box<dyn FnOnce()>) };
    closure();
    crate::sync::exit_thread()
}
