//! Monotonic time for sleep deadlines.

use core::ops::Add;
use core::time::Duration;

/// A reading of `CLOCK_MONOTONIC`, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(u64);

impl Instant {
    pub fn now() -> Self {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } == -1 {
            crate::error::fatal("clock_gettime(CLOCK_MONOTONIC) failed");
        }
        Instant(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64)
    }

    pub const fn from_nanos(nanos: u64) -> Self {
        Instant(nanos)
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Time from `earlier` to `self`, zero if `earlier` is later.
    pub fn saturating_duration_since(self, earlier: Instant) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }

    pub fn elapsed(self) -> Duration {
        Instant::now().saturating_duration_since(self)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        let nanos = u64::try_from(rhs.as_nanos()).unwrap_or(u64::MAX);
        Instant(self.0.saturating_add(nanos))
    }
}

/// Blocks the OS thread until `deadline`, returning early if a signal
/// interrupts the wait.
pub(crate) fn sleep_until(deadline: Instant) {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return;
    }
    let ts = libc::timespec {
        tv_sec: remaining.as_secs() as libc::time_t,
        tv_nsec: remaining.subsec_nanos() as libc::c_long,
    };
    unsafe {
        libc::nanosleep(&ts, core::ptr::null_mut());
    }
}

/// Converts to the `timeval` shape used by `setitimer`.
pub(crate) fn to_timeval(d: Duration) -> libc::timeval {
    libc::timeval {
        tv_sec: d.as_secs() as libc::time_t,
        tv_usec: d.subsec_micros() as libc::suseconds_t,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_and_additive() {
        let a = Instant::now();
        let b = Instant::now();
        assert!(b >= a);
        let later = a + Duration::from_millis(5);
        assert_eq!(later.saturating_duration_since(a), Duration::from_millis(5));
        assert_eq!(a.saturating_duration_since(later), Duration::ZERO);
    }

    #[test]
    fn addition_saturates() {
        let far = Instant::from_nanos(u64::MAX - 1) + Duration::from_secs(10);
        assert_eq!(far.as_nanos(), u64::MAX);
    }

    #[test]
    fn timeval_split() {
        let tv = to_timeval(Duration::from_millis(2_500));
        assert_eq!(tv.tv_sec, 2);
        assert_eq!(tv.tv_usec, 500_000);
    }

    #[test]
    fn sleep_until_waits() {
        let start = Instant::now();
        sleep_until(start + Duration::from_millis(10));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
