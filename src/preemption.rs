use core::time::Duration;

use crate::error::{ThreadError, ThreadResult};
use crate::signal::{self, SigSet, PREEMPTION_SIGNALS};
use crate::time::to_timeval;

/// Shortest period `setitimer` can express; anything below would disarm it.
const MIN_INTERVAL: Duration = Duration::from_micros(1);

/// The periodic `ITIMER_REAL` timer and its `SIGALRM` handler.
pub struct Preemption {
    enabled: bool,
    previous: Option<libc::sigaction>,
}

impl Default for Preemption {
    fn default() -> Self {
        Self::new()
    }
}

impl Preemption {
    pub const fn new() -> Self {
        Preemption {
            enabled: false,
            previous: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// # Safety
    /// This installs a process-wide `SIGALRM` handler and arms `ITIMER_REAL`.
    /// Only one instance should manage preemption at a time, and nothing else
    /// in the process may rely on `SIGALRM` while it is enabled.
    pub unsafe fn enable(&mut self, interval: Duration) -> ThreadResult<()> {
        if self.enabled {
            return Ok(());
        }

        let previous = signal::install_handler(
            libc::SIGALRM,
            timer_handler,
            libc::SA_RESTART,
            &SigSet::of(&PREEMPTION_SIGNALS),
        )?;

        let period = to_timeval(interval.max(MIN_INTERVAL));
        let timer = libc::itimerval {
            it_interval: period,
            it_value: period,
        };
        if libc::setitimer(libc::ITIMER_REAL, &timer, core::ptr::null_mut()) == -1 {
            let errno = crate::error::errno();
            let _ = signal::restore_handler(libc::SIGALRM, &previous);
            return Err(ThreadError::Timer { errno });
        }

        self.previous = Some(previous);
        self.enabled = true;
        Ok(())
    }

    /// # Safety
    /// Disarms `ITIMER_REAL` and puts back the `SIGALRM` disposition found by
    /// [`enable`](Self::enable).
    pub unsafe fn disable(&mut self) {
        if !self.enabled {
            return;
        }

        let zero = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        let timer = libc::itimerval {
            it_interval: zero,
            it_value: zero,
        };
        libc::setitimer(libc::ITIMER_REAL, &timer, core::ptr::null_mut());

        if let Some(previous) = self.previous.take() {
            let _ = signal::restore_handler(libc::SIGALRM, &previous);
        }
        self.enabled = false;
    }
}

impl Drop for Preemption {
    fn drop(&mut self) {
        unsafe { self.disable() };
    }
}

extern "C" fn timer_handler(_sig: libc::c_int) {
    crate::scheduler::preempt_from_signal();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current_alarm_handler() -> libc::sighandler_t {
        let mut action: libc::sigaction = unsafe { core::mem::zeroed() };
        unsafe { libc::sigaction(libc::SIGALRM, core::ptr::null(), &mut action) };
        action.sa_sigaction
    }

    fn armed() -> bool {
        let mut value: libc::itimerval = unsafe { core::mem::zeroed() };
        unsafe { libc::getitimer(libc::ITIMER_REAL, &mut value) };
        value.it_value.tv_sec != 0 || value.it_value.tv_usec != 0
    }

    #[test]
    fn enable_then_disable_restores_disposition() {
        let _serial = crate::tests::serial();
        let before = current_alarm_handler();
        let mut preemption = Preemption::new();
        unsafe { preemption.enable(Duration::from_secs(60)).unwrap() };
        assert!(preemption.is_enabled());
        assert!(armed());
        assert_eq!(current_alarm_handler(), timer_handler as libc::sighandler_t);

        unsafe { preemption.disable() };
        assert!(!preemption.is_enabled());
        assert!(!armed());
        assert_eq!(current_alarm_handler(), before);
    }

    #[test]
    fn drop_disarms() {
        let _serial = crate::tests::serial();
        {
            let mut preemption = Preemption::new();
            unsafe { preemption.enable(Duration::from_secs(60)).unwrap() };
        }
        assert!(!armed());
    }
}
