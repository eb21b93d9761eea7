//! Three-phase test execution: idle baseline, load, idle tail.
//!
//! The runner owns the sampling ticker, the event bus, and the load
//! generator's lifecycle.  Each sampling tick reads the power meter,
//! snapshots per-interface throughput and targets (during the load
//! phase), drains pending events, and appends a [`DataPoint`] to the
//! in-memory result -- the authoritative record; live delivery through
//! the telemetry sink is best-effort.

pub mod events;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::loadgen::{LoadConfig, LoadGenerator, Protocol, MAX_UDP_PAYLOAD};
use crate::netif;
use crate::power::PowerSource;
use crate::telemetry::TelemetrySink;

use events::{Event, EventBus, EventSender, EventType};

/// Pause after cancelling the load session so in-flight writes surface
/// as counted bytes before the post baseline begins.
const LOAD_DRAIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Pre,
    Load,
    Post,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Pre => write!(f, "pre"),
            Phase::Load => write!(f, "load"),
            Phase::Post => write!(f, "post"),
        }
    }
}

/// Full description of one test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfig {
    /// Load phase length, seconds.
    pub duration_secs: f64,
    /// Sampling interval, seconds; must be positive.
    pub interval_secs: f64,
    /// Idle baseline before the load phase, seconds.
    #[serde(default)]
    pub pre_secs: f64,
    /// Idle tail after the load phase, seconds.
    #[serde(default)]
    pub post_secs: f64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub test_name: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub load_enabled: bool,
    #[serde(default)]
    pub load: LoadConfig,
}

impl TestConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs.max(0.0))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs.max(0.0))
    }

    pub fn pre(&self) -> Duration {
        Duration::from_secs_f64(self.pre_secs.max(0.0))
    }

    pub fn post(&self) -> Duration {
        Duration::from_secs_f64(self.post_secs.max(0.0))
    }

    /// Reject configurations that cannot produce a meaningful run.
    /// Called synchronously at start; nothing is spawned on failure.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.interval_secs > 0.0, "interval must be positive");
        anyhow::ensure!(self.duration_secs >= 0.0, "duration must not be negative");
        anyhow::ensure!(self.pre_secs >= 0.0, "pre duration must not be negative");
        anyhow::ensure!(self.post_secs >= 0.0, "post duration must not be negative");

        if !self.load_enabled {
            return Ok(());
        }

        let load = &self.load;
        anyhow::ensure!(load.packet_size > 0, "packet size must be positive");

        match load.protocol {
            Protocol::Udp => {
                anyhow::ensure!(!load.target_ip.is_empty(), "target IP is required for UDP");
                anyhow::ensure!(
                    load.packet_size <= MAX_UDP_PAYLOAD,
                    "UDP packet size {} exceeds {} and would fragment",
                    load.packet_size,
                    MAX_UDP_PAYLOAD
                );
            }
            Protocol::Tcp => {
                anyhow::ensure!(!load.target_ip.is_empty(), "target IP is required for TCP");
            }
            Protocol::L2 => {
                anyhow::ensure!(
                    !load.target_mac.is_empty(),
                    "target MAC is required for L2"
                );
                anyhow::ensure!(
                    load.target_mac.parse::<pnet::util::MacAddr>().is_ok(),
                    "invalid target MAC {:?}",
                    load.target_mac
                );
            }
        }

        if matches!(load.protocol, Protocol::Udp | Protocol::Tcp) {
            load.target_ip
                .parse::<std::net::IpAddr>()
                .map_err(|_| anyhow::anyhow!("invalid target IP {:?}", load.target_ip))?;
        }

        let mut seen = std::collections::HashSet::new();
        for ic in &load.effective_interfaces() {
            anyhow::ensure!(ic.workers >= 1, "interface {:?} needs at least one worker", ic.key());
            anyhow::ensure!(
                ic.target_throughput_mbps >= 0.0,
                "interface {:?} has a negative target",
                ic.key()
            );
            anyhow::ensure!(
                seen.insert(ic.key().to_string()),
                "interface {:?} configured twice",
                ic.key()
            );

            if !ic.name.is_empty() {
                let iface = netif::find_interface(&ic.name)?;
                match load.protocol {
                    Protocol::L2 => {
                        anyhow::ensure!(
                            iface.mac.is_some(),
                            "interface {} has no MAC address",
                            ic.name
                        );
                    }
                    _ => {
                        netif::first_ipv4(&iface)?;
                    }
                }
            } else {
                anyhow::ensure!(
                    load.protocol != Protocol::L2,
                    "an interface name is required for L2 load generation"
                );
            }
        }

        Ok(())
    }
}

/// One sample on the run timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPoint {
    pub timestamp: DateTime<Utc>,
    pub power_mw: f64,
    pub throughput_mbps: f64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub throughput_by_interface: HashMap<String, f64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub target_throughput_by_interface: HashMap<String, f64>,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<Event>,
}

/// Complete (or cancelled-partial) run output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub config: TestConfig,
    pub data_points: Vec<DataPoint>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Why a start request was refused.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("a test is already active")]
    AlreadyActive,
    #[error("invalid test configuration: {0}")]
    InvalidConfig(anyhow::Error),
}

struct ActiveRun {
    token: CancellationToken,
    events: EventSender,
}

/// The test-execution engine.  One instance serves the whole process;
/// at most one run is active at a time.
pub struct Runner {
    power: Arc<dyn PowerSource>,
    active: Mutex<Option<ActiveRun>>,
}

impl Runner {
    pub fn new(power: Arc<dyn PowerSource>) -> Self {
        Self {
            power,
            active: Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().unwrap().is_some()
    }

    /// Cancel the active run, if any.  Idempotent; a run that already
    /// finished is a no-op.
    pub fn stop(&self) {
        if let Some(run) = self.active.lock().unwrap().as_ref() {
            info!("stop requested, cancelling active test");
            run.token.cancel();
        }
    }

    /// Inject a custom marker into the active run's timeline.  Returns
    /// whether the marker was accepted; enqueueing is still subject to
    /// the bus's drop policy.
    pub fn add_marker(&self, message: &str) -> bool {
        if message.is_empty() {
            return false;
        }
        match self.active.lock().unwrap().as_ref() {
            Some(run) => {
                run.events.publish(EventType::Custom, message);
                true
            }
            None => false,
        }
    }

    /// Validate and launch a run.  Rejection is synchronous; on success
    /// the run drives itself and the returned handle resolves to the
    /// result (partial if cancelled).  `signal_done` fires exactly once,
    /// after the active flag clears.
    pub fn try_start(
        self: &Arc<Self>,
        config: TestConfig,
        sink: Arc<dyn TelemetrySink>,
    ) -> Result<tokio::task::JoinHandle<TestResult>, StartError> {
        config.validate().map_err(StartError::InvalidConfig)?;

        let bus = EventBus::new();
        let token = CancellationToken::new();
        {
            let mut active = self.active.lock().unwrap();
            if active.is_some() {
                bus.close();
                return Err(StartError::AlreadyActive);
            }
            *active = Some(ActiveRun {
                token: token.clone(),
                events: bus.sender(),
            });
        }

        let runner = Arc::clone(self);
        let run_id = Uuid::new_v4();
        info!(%run_id, test_name = %config.test_name, device = %config.device_name, "test accepted");

        Ok(tokio::spawn(async move {
            let result = runner.drive(&config, &bus, &token, sink.as_ref()).await;
            *runner.active.lock().unwrap() = None;
            bus.close();
            sink.signal_done();
            info!(%run_id, data_points = result.data_points.len(), "test finished");
            result
        }))
    }

    async fn drive(
        &self,
        config: &TestConfig,
        bus: &EventBus,
        token: &CancellationToken,
        sink: &dyn TelemetrySink,
    ) -> TestResult {
        let start_time = Utc::now();
        let mut points = Vec::new();

        let mut ticker = tokio::time::interval(config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // An interval fires immediately on creation; push the first tick
        // out one full period so every phase samples on the same cadence.
        ticker.reset();

        let finish = |points: Vec<DataPoint>| TestResult {
            config: config.clone(),
            data_points: points,
            start_time,
            end_time: Utc::now(),
        };

        // Phase 1: idle baseline.
        if !self
            .collect_phase(Phase::Pre, config.pre(), &mut ticker, token, bus, None, &mut points, sink)
            .await
        {
            return finish(points);
        }

        // Phase 2: load.
        let load_token = token.child_token();
        let mut load_gen: Option<Arc<LoadGenerator>> = None;
        if config.load_enabled {
            let generator = Arc::new(LoadGenerator::new());
            match generator.start(&load_token, &config.load, bus.sender()) {
                Ok(()) => load_gen = Some(generator),
                Err(e) => {
                    // The run keeps sampling; the interface simply never
                    // produces throughput.
                    error!(error = %e, "load generation failed to start");
                }
            }
        }

        let completed = self
            .collect_phase(
                Phase::Load,
                config.duration(),
                &mut ticker,
                token,
                bus,
                load_gen.as_deref(),
                &mut points,
                sink,
            )
            .await;

        load_token.cancel();
        if !completed {
            return finish(points);
        }
        if load_gen.is_some() {
            tokio::time::sleep(LOAD_DRAIN).await;
        }

        // Phase 3: idle tail.
        self.collect_phase(Phase::Post, config.post(), &mut ticker, token, bus, None, &mut points, sink)
            .await;

        finish(points)
    }

    /// Sample one phase until its timer fires.  Returns false if the run
    /// was cancelled mid-phase.
    #[allow(clippy::too_many_arguments)]
    async fn collect_phase(
        &self,
        phase: Phase,
        phase_duration: Duration,
        ticker: &mut Interval,
        token: &CancellationToken,
        bus: &EventBus,
        load_gen: Option<&LoadGenerator>,
        points: &mut Vec<DataPoint>,
        sink: &dyn TelemetrySink,
    ) -> bool {
        if phase_duration.is_zero() {
            return true;
        }

        bus.sender()
            .publish(EventType::Phase, format!("entering {} phase", phase));
        info!(%phase, duration_secs = phase_duration.as_secs_f64(), "phase started");

        let deadline = tokio::time::sleep(phase_duration);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    info!(%phase, "phase cancelled");
                    return false;
                }
                _ = &mut deadline => {
                    return true;
                }
                _ = ticker.tick() => {
                    let power = {
                        let source = Arc::clone(&self.power);
                        tokio::task::spawn_blocking(move || source.current_power_mw()).await
                    };
                    let power_mw = match power {
                        Ok(Ok(value)) => value,
                        Ok(Err(e)) => {
                            warn!(error = %e, "power read failed, skipping sample");
                            continue;
                        }
                        Err(e) => {
                            warn!(error = %e, "power read task failed, skipping sample");
                            continue;
                        }
                    };

                    let (throughput_by_interface, target_throughput_by_interface) = match load_gen {
                        Some(generator) => (
                            generator.throughput_by_interface(),
                            generator.target_by_interface(),
                        ),
                        None => (HashMap::new(), HashMap::new()),
                    };
                    // The total is derived from the same snapshot so the
                    // sum always matches the map.
                    let throughput_mbps = throughput_by_interface.values().sum();

                    let point = DataPoint {
                        timestamp: Utc::now(),
                        power_mw,
                        throughput_mbps,
                        throughput_by_interface,
                        target_throughput_by_interface,
                        phase,
                        events: bus.take_pending(),
                    };

                    points.push(point.clone());
                    sink.emit(&point);
                }
            }
        }
    }
}
