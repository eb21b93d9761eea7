//! Per-interface byte counting and windowed throughput measurement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Minimum measurement window.  A refresh before the window has elapsed
/// keeps the previously published rate.
const WINDOW: Duration = Duration::from_secs(1);

/// Byte counter and throughput window for one egress interface.
///
/// Workers hit only the atomic counter on the send path; everything else
/// sits behind a mutex and is touched at refresh/read frequency.  The
/// published Mbps is the rate over the most recently completed >= 1 s
/// window -- neither instantaneous nor cumulative.
pub struct InterfaceMeter {
    workers: u32,
    accum_bytes: AtomicU64,
    state: Mutex<WindowState>,
}

struct WindowState {
    /// Counter value at the start of the current window.
    window_bytes: u64,
    window_start: Instant,
    mbps: f64,
    target_mbps: f64,
}

impl InterfaceMeter {
    pub fn new(workers: u32, initial_target_mbps: f64) -> Self {
        Self {
            workers,
            accum_bytes: AtomicU64::new(0),
            state: Mutex::new(WindowState {
                window_bytes: 0,
                window_start: Instant::now(),
                mbps: 0.0,
                target_mbps: initial_target_mbps,
            }),
        }
    }

    /// Number of workers sharing this interface; fixed for the session.
    pub fn workers(&self) -> u32 {
        self.workers
    }

    /// Credit `n` bytes to the interface.  Lock-free; called per write.
    pub fn add_bytes(&self, n: u64) {
        self.accum_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Total bytes credited since the meter was created.
    pub fn total_bytes(&self) -> u64 {
        self.accum_bytes.load(Ordering::Relaxed)
    }

    /// Close the measurement window if it has run for at least a second
    /// and publish the rate over it.  Called at >= 1 Hz by the refresher.
    pub fn refresh(&self) {
        let total = self.accum_bytes.load(Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        let elapsed = state.window_start.elapsed();
        if elapsed >= WINDOW {
            let delta = total.saturating_sub(state.window_bytes);
            state.mbps = (delta as f64 * 8.0) / (elapsed.as_secs_f64() * 1_000_000.0);
            state.window_bytes = total;
            state.window_start = Instant::now();
        }
    }

    /// Rate over the last completed window, in Mbps.
    pub fn mbps(&self) -> f64 {
        self.state.lock().unwrap().mbps
    }

    /// Currently active target, in Mbps.  0 means unlimited.
    pub fn target_mbps(&self) -> f64 {
        self.state.lock().unwrap().target_mbps
    }

    /// Update the active target.  Visible to the next burst's pacing
    /// computation; this is the ramp controller's only mutation.
    pub fn set_target_mbps(&self, mbps: f64) {
        self.state.lock().unwrap().target_mbps = mbps;
    }
}
