//! Hybrid high-resolution sleep used for packet pacing.
//!
//! Generic OS sleeps have roughly millisecond granularity (worse under
//! load), which at gigabit rates smears the per-burst pacing delay and
//! with it the target throughput.  The hybrid approach parks the thread
//! for the bulk of the wait and spins on the monotonic clock for the
//! tail, bounding overshoot to tens of microseconds at the cost of a
//! short busy-wait per call.
//!
//! On Windows the bulk wait uses a high-resolution waitable timer
//! (available since Windows 10 1803); elsewhere it falls back to
//! `std::thread::sleep` with a wider spin margin.

use std::time::{Duration, Instant};

/// Tail window handled by the spin loop.  The waitable timer is armed to
/// wake this far before the target so the spin can absorb its jitter.
const SPIN_TOLERANCE: Duration = Duration::from_micros(1020);

/// Below this the fixed cost of arming any timer exceeds the wait itself;
/// the whole sleep is a spin.
const MIN_TIMED_WAIT: Duration = Duration::from_micros(50);

/// Sleep for `duration` with sub-millisecond precision.
///
/// Returns no earlier than `duration` after entry.  Zero durations return
/// immediately.
pub fn precise_sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }

    let target = Instant::now() + duration;

    if duration >= MIN_TIMED_WAIT {
        coarse_wait(target);
    }

    while Instant::now() < target {
        std::hint::spin_loop();
    }
}

#[cfg(not(windows))]
fn coarse_wait(target: Instant) {
    // Leave room for the kernel tick to overshoot; the spin tail covers it.
    const COARSE_MARGIN: Duration = Duration::from_micros(1500);

    let remaining = target.saturating_duration_since(Instant::now());
    if let Some(bulk) = remaining.checked_sub(COARSE_MARGIN) {
        if !bulk.is_zero() {
            std::thread::sleep(bulk);
        }
    }
}

#[cfg(windows)]
fn coarse_wait(target: Instant) {
    timer::wait_until(target);
}

#[cfg(windows)]
mod timer {
    use super::{Instant, SPIN_TOLERANCE};
    use std::ptr;
    use std::time::Duration;

    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::System::Threading::{
        CreateWaitableTimerExW, SetWaitableTimer, WaitForSingleObject,
        CREATE_WAITABLE_TIMER_HIGH_RESOLUTION, INFINITE, TIMER_ALL_ACCESS,
    };

    /// A single arming is capped below the 10 ms scheduler period; longer
    /// due times can be rounded up to the next tick.
    const MAX_ARM: Duration = Duration::from_micros(9500);

    struct ThreadTimer(HANDLE);

    impl ThreadTimer {
        fn create() -> Option<Self> {
            let handle = unsafe {
                CreateWaitableTimerExW(
                    ptr::null(),
                    ptr::null(),
                    CREATE_WAITABLE_TIMER_HIGH_RESOLUTION,
                    TIMER_ALL_ACCESS,
                )
            };
            if handle.is_null() {
                None
            } else {
                Some(Self(handle))
            }
        }
    }

    impl Drop for ThreadTimer {
        fn drop(&mut self) {
            unsafe {
                CloseHandle(self.0);
            }
        }
    }

    thread_local! {
        static TIMER: Option<ThreadTimer> = ThreadTimer::create();
    }

    pub(super) fn wait_until(target: Instant) {
        TIMER.with(|timer| {
            let Some(timer) = timer else {
                // Pre-1803 systems lack the high-resolution timer; a coarse
                // sleep plus the caller's spin tail is the best available.
                let remaining = target.saturating_duration_since(Instant::now());
                if let Some(bulk) = remaining.checked_sub(Duration::from_micros(1500)) {
                    if !bulk.is_zero() {
                        std::thread::sleep(bulk);
                    }
                }
                return;
            };

            loop {
                let remaining = target.saturating_duration_since(Instant::now());
                if remaining <= SPIN_TOLERANCE {
                    return;
                }

                let arm = (remaining - SPIN_TOLERANCE).min(MAX_ARM);
                // Negative due time means relative, in 100 ns units.
                let due = -((arm.as_nanos() / 100) as i64);
                unsafe {
                    SetWaitableTimer(timer.0, &due, 0, None, ptr::null(), 0);
                    WaitForSingleObject(timer.0, INFINITE);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_duration_returns_immediately() {
        let start = Instant::now();
        precise_sleep(Duration::ZERO);
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[test]
    fn test_never_wakes_early() {
        for &micros in &[80, 500, 2_000, 7_500] {
            let d = Duration::from_micros(micros);
            let start = Instant::now();
            precise_sleep(d);
            assert!(
                start.elapsed() >= d,
                "woke {:?} early for a {:?} sleep",
                d.saturating_sub(start.elapsed()),
                d
            );
        }
    }

    #[test]
    fn test_overshoot_is_bounded() {
        // Loose bound: CI schedulers can preempt the spin tail, so only
        // assert that we are nowhere near the ~15 ms a naive sleep can cost.
        let d = Duration::from_millis(5);
        let start = Instant::now();
        precise_sleep(d);
        let elapsed = start.elapsed();
        assert!(
            elapsed < d + Duration::from_millis(10),
            "slept {:?} for a {:?} request",
            elapsed,
            d
        );
    }
}
