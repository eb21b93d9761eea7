//! Mock power source for development and the test suite.

use std::sync::Mutex;

use anyhow::Result;
use rand::Rng;

use super::PowerSource;

const BASE_POWER_MW: f64 = 5000.0;
const MAX_STEP_MW: f64 = 500.0;

/// Random-walk power readings around a plausible idle wattage.
pub struct MockPowerSource {
    power_mw: Mutex<f64>,
}

impl MockPowerSource {
    pub fn new() -> Self {
        Self {
            power_mw: Mutex::new(BASE_POWER_MW),
        }
    }
}

impl Default for MockPowerSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerSource for MockPowerSource {
    fn probe(&self) -> Result<()> {
        Ok(())
    }

    fn current_power_mw(&self) -> Result<f64> {
        let mut power = self.power_mw.lock().unwrap();
        let step = rand::thread_rng().gen_range(-MAX_STEP_MW..=MAX_STEP_MW);
        *power = (*power + step).max(0.0);
        Ok(*power)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_never_fails() {
        assert!(MockPowerSource::new().probe().is_ok());
    }

    #[test]
    fn test_readings_stay_non_negative() {
        let source = MockPowerSource::new();
        for _ in 0..1000 {
            assert!(source.current_power_mw().unwrap() >= 0.0);
        }
    }
}
