//! Generic HTTP power-meter adapter.
//!
//! Covers smart plugs and PDUs fronted by a small exporter: a GET
//! against the configured URL (optionally with basic auth and a device
//! selector) returning `{"power_mw": <f64>}`.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use super::PowerSource;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpPowerSource {
    client: reqwest::blocking::Client,
    url: String,
    user: Option<String>,
    password: Option<String>,
    device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PowerReading {
    power_mw: f64,
}

impl HttpPowerSource {
    pub fn new(
        url: String,
        user: Option<String>,
        password: Option<String>,
        device_id: Option<String>,
    ) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build power meter HTTP client")?;
        Ok(Self {
            client,
            url,
            user,
            password,
            device_id,
        })
    }

    fn read(&self) -> Result<f64> {
        let mut request = self.client.get(&self.url);
        if let Some(device) = &self.device_id {
            request = request.query(&[("device", device.as_str())]);
        }
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_deref());
        }

        let response = request
            .send()
            .with_context(|| format!("power meter request to {} failed", self.url))?
            .error_for_status()
            .context("power meter returned an error status")?;

        let reading: PowerReading = response
            .json()
            .context("power meter returned malformed JSON")?;
        debug!(power_mw = reading.power_mw, "power reading");
        Ok(reading.power_mw)
    }
}

impl PowerSource for HttpPowerSource {
    fn probe(&self) -> Result<()> {
        self.read().map(|_| ())
    }

    fn current_power_mw(&self) -> Result<f64> {
        self.read()
    }
}
