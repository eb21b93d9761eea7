//! Per-packet pacing delay derivation.

use std::time::Duration;

/// Delays below this are skipped entirely; the timer floor makes pacing
/// at that granularity counterproductive.
const MIN_USEFUL_DELAY: Duration = Duration::from_micros(10);

/// Fraction of the raw delay actually slept, compensating for the
/// syscall and wakeup overhead of each send/sleep cycle.
const OVERHEAD_COMPENSATION: f64 = 0.95;

/// Compute the inter-packet delay one worker must apply to hold an
/// interface at `target_mbps` when `workers` workers share the load.
///
/// Returns [`Duration::ZERO`] for unlimited sending (no target, no
/// workers, or a rate too high for pacing to help).
pub fn packet_delay(target_mbps: f64, workers: u32, packet_bytes: usize) -> Duration {
    if target_mbps <= 0.0 || workers == 0 || packet_bytes == 0 {
        return Duration::ZERO;
    }

    // Mbps -> bytes/s, split across the interface's workers.
    let bytes_per_sec = target_mbps * 125_000.0 / workers as f64;
    let packets_per_sec = bytes_per_sec / packet_bytes as f64;
    if packets_per_sec <= 0.0 {
        return Duration::from_secs(1);
    }

    let raw = Duration::from_secs_f64(1.0 / packets_per_sec);
    if raw < MIN_USEFUL_DELAY {
        return Duration::ZERO;
    }

    raw.mul_f64(OVERHEAD_COMPENSATION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_when_no_target() {
        assert_eq!(packet_delay(0.0, 10, 1400), Duration::ZERO);
        assert_eq!(packet_delay(-5.0, 10, 1400), Duration::ZERO);
    }

    #[test]
    fn test_unlimited_when_no_workers() {
        assert_eq!(packet_delay(100.0, 0, 1400), Duration::ZERO);
    }

    #[test]
    fn test_delay_for_moderate_rate() {
        // 100 Mbps over 10 workers at 1400 B/packet:
        // 1_250_000 B/s per worker -> ~892.9 pkt/s -> 1.12 ms raw.
        let d = packet_delay(100.0, 10, 1400);
        let expected = Duration::from_secs_f64(1400.0 / 1_250_000.0).mul_f64(0.95);
        let diff = if d > expected { d - expected } else { expected - d };
        assert!(diff < Duration::from_micros(5), "got {:?}", d);
    }

    #[test]
    fn test_skip_threshold_at_high_rates() {
        // 10 Gbps over 4 workers at 1400 B: raw delay ~4.5 us, below the
        // floor where pacing helps.
        assert_eq!(packet_delay(10_000.0, 4, 1400), Duration::ZERO);
    }

    #[test]
    fn test_delay_scales_with_workers() {
        let one = packet_delay(50.0, 1, 1400);
        let four = packet_delay(50.0, 4, 1400);
        // Four workers each send a quarter of the packets, so each may
        // wait four times as long.
        assert!(four > one * 3 && four < one * 5);
    }
}
