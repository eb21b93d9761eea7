//! Power-meter capability and the adapters shipped with the daemon.
//!
//! The engine only ever sees the [`PowerSource`] trait; which adapter
//! sits behind it is a wiring decision made at startup.

pub mod http;
pub mod mock;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Settings;

/// A sampled power meter attached to the device under test.
///
/// Implementations may block (the runner reads through a blocking task)
/// but must bound their own I/O with timeouts.
pub trait PowerSource: Send + Sync {
    /// Reachability check; used by the CLI probe and the API.
    fn probe(&self) -> Result<()>;

    /// Current draw of the device under test, in milliwatts.
    fn current_power_mw(&self) -> Result<f64>;
}

/// Build the adapter selected by the settings.
pub fn from_settings(settings: &Settings) -> Result<Arc<dyn PowerSource>> {
    if settings.mock_power {
        info!("using mock power source");
        return Ok(Arc::new(mock::MockPowerSource::new()));
    }

    let url = settings
        .power_url
        .clone()
        .context("WATTBENCH_POWER_URL must be set when the mock power source is disabled")?;

    info!(%url, "using HTTP power source");
    let source = http::HttpPowerSource::new(
        url,
        settings.power_user.clone(),
        settings.power_password.clone(),
        settings.power_device_id.clone(),
    )?;
    Ok(Arc::new(source))
}
