#[cfg(test)]
use std::sync::atomic::{AtomicU64, Ordering};

pub const NANOS_PER_MILLI: u64 = 1_000_000;

/// Monotonic time source for tick timestamps and elapsed wallclock.
pub trait Clock: Send + Sync {
    /// Nanoseconds on a clock that never goes backwards.
    fn now_ns(&self) -> u64;
}

/// `CLOCK_MONOTONIC`, shared with any other process on the host, so a reader
/// can line sample timestamps up with its own clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // CLOCK_MONOTONIC cannot fail with a valid timespec pointer
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        (ts.tv_sec as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(ts.tv_nsec as u64)
    }
}

/// A clock that only moves when told to.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct ManualClock {
    now: AtomicU64,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn new(start_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ns),
        }
    }

    pub(crate) fn advance_ms(&self, ms: u64) {
        self.now.fetch_add(ms * NANOS_PER_MILLI, Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_never_goes_backwards() {
        let clock = MonotonicClock;
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn manual_clock_advances_in_millis() {
        let clock = ManualClock::new(5 * NANOS_PER_MILLI);
        clock.advance_ms(50);
        assert_eq!(clock.now_ns(), 55 * NANOS_PER_MILLI);
    }
}
