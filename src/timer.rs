//! Absolute-deadline periodic clock for drift-free frame pacing.
//!
//! The deadline chain is anchored once on CLOCK_MONOTONIC and advanced by
//! exactly one period per wait, so a late release never shifts later
//! releases. Alignment of the anchor to a wall-clock second boundary lets
//! several publishers on one segment emit smpCnt 0 at the same instant.

use log::warn;
use std::ptr;
use std::time::Duration;

const NSEC_PER_SEC: i64 = 1_000_000_000;

/// Periodic scheduling seam used by the transmit loop.
#[cfg_attr(test, mockall::automock)]
pub trait PeriodicClock {
    /// Block until the chosen wall-clock second boundary, then latch the
    /// monotonic base deadline.
    fn align_start(&mut self, period_ns: u64);

    /// Block until the current deadline, then advance it by `period_ns`
    /// regardless of how late the release was.
    fn wait_period(&mut self, period_ns: u64);
}

/// Advance a timespec by `ns`, normalising the nanosecond field.
fn add_ns(ts: &mut libc::timespec, ns: i64) {
    ts.tv_nsec += ns;
    while ts.tv_nsec >= NSEC_PER_SEC {
        ts.tv_sec += 1;
        ts.tv_nsec -= NSEC_PER_SEC;
    }
}

fn sleep_until(clock: libc::clockid_t, deadline: &libc::timespec) {
    loop {
        let ret = unsafe { libc::clock_nanosleep(clock, libc::TIMER_ABSTIME, deadline, ptr::null_mut()) };
        if ret == libc::EINTR {
            continue;
        }
        if ret != 0 {
            warn!("clock_nanosleep failed: {}", ret);
        }
        break;
    }
}

/// CLOCK_MONOTONIC implementation of `PeriodicClock`.
pub struct MonotonicClock {
    next: libc::timespec,
    guard_ns: i64,
}

impl MonotonicClock {
    /// Align strictly to the next wall-clock second.
    pub fn new() -> MonotonicClock {
        MonotonicClock {
            next: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            guard_ns: 0,
        }
    }

    /// Skip to the second after next when less than `guard` remains before
    /// the boundary, so startup work cannot overrun the alignment point.
    pub fn with_guard(guard: Duration) -> MonotonicClock {
        MonotonicClock {
            next: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            guard_ns: guard.as_nanos() as i64,
        }
    }

    /// Latch the monotonic base deadline at the current instant.
    fn prime(&mut self) {
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut self.next);
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        MonotonicClock::new()
    }
}

impl PeriodicClock for MonotonicClock {
    fn align_start(&mut self, _period_ns: u64) {
        let mut now = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
        }

        let mut target = libc::timespec {
            tv_sec: now.tv_sec + 1,
            tv_nsec: 0,
        };
        if NSEC_PER_SEC - now.tv_nsec < self.guard_ns {
            target.tv_sec += 1;
        }

        sleep_until(libc::CLOCK_REALTIME, &target);
        self.prime();
    }

    fn wait_period(&mut self, period_ns: u64) {
        sleep_until(libc::CLOCK_MONOTONIC, &self.next);
        add_ns(&mut self.next, period_ns as i64);
    }
}

// ============================================================================
// TESTS
// ============================================================================
