//! Multi-interface concurrent load generation.
//!
//! One [`LoadGenerator`] lives for exactly one load session.  It owns a
//! meter per configured interface and spawns, per interface: a
//! supervisor task (pre-delay, worker threads, teardown), an optional
//! ramp controller, and -- shared across interfaces -- a meter
//! refresher.  All of it winds down through a single cancellation
//! token; workers observe cancellation at burst boundaries.

pub mod layer2;
pub mod meter;
pub(crate) mod ramp;
pub mod rate;
pub mod sleep;
pub(crate) mod worker;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use pnet::util::MacAddr;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::netif;
use crate::runner::events::{EventSender, EventType};

use meter::InterfaceMeter;

/// Meter key for the unnamed, OS-routed interface.
pub const DEFAULT_IFACE_KEY: &str = "default";

/// Workers per interface when the config leaves the count out.
pub const DEFAULT_WORKERS: u32 = 10;

/// Largest UDP payload that fits a standard 1500 B MTU without
/// fragmenting (1500 - 20 IP - 8 UDP).
pub const MAX_UDP_PAYLOAD: usize = 1472;

/// How often meters are asked to close their measurement window.
const REFRESH_PERIOD: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
    L2,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Udp => write!(f, "udp"),
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::L2 => write!(f, "l2"),
        }
    }
}

/// Load-session configuration: one target, one transport, any number of
/// egress interfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    pub protocol: Protocol,
    /// Target address for UDP/TCP.
    #[serde(default)]
    pub target_ip: String,
    #[serde(default)]
    pub target_port: u16,
    /// Target MAC for L2.
    #[serde(default)]
    pub target_mac: String,
    /// Payload bytes per packet (write chunk for TCP).
    pub packet_size: usize,
    /// Empty means a single implicit interface using OS routing.
    #[serde(default)]
    pub interface_configs: Vec<InterfaceConfig>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Udp,
            target_ip: String::new(),
            target_port: 0,
            target_mac: String::new(),
            packet_size: 1400,
            interface_configs: Vec::new(),
        }
    }
}

impl LoadConfig {
    /// The configured interfaces, or the single implicit default.
    pub fn effective_interfaces(&self) -> Vec<InterfaceConfig> {
        if self.interface_configs.is_empty() {
            vec![InterfaceConfig::default()]
        } else {
            self.interface_configs.clone()
        }
    }

    fn target_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .target_ip
            .parse()
            .with_context(|| format!("invalid target IP {:?}", self.target_ip))?;
        Ok(SocketAddr::new(ip, self.target_port))
    }

    fn target_mac(&self) -> Result<MacAddr> {
        self.target_mac
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid target MAC {:?}", self.target_mac))
    }
}

/// Per-interface load settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// OS interface name; empty defers to OS routing with no bind.
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_workers")]
    pub workers: u32,
    /// 0 means unlimited.
    #[serde(default)]
    pub target_throughput_mbps: f64,
    /// 0 means no ramping.
    #[serde(default)]
    pub ramp_steps: u32,
    /// 0 with ramping enabled picks a default (see [`Self::ramp_duration`]).
    #[serde(default)]
    pub ramp_duration_secs: f64,
    /// Additional wait after the pre phase before this interface sends.
    #[serde(default)]
    pub pre_delay_secs: f64,
}

fn default_workers() -> u32 {
    DEFAULT_WORKERS
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            workers: DEFAULT_WORKERS,
            target_throughput_mbps: 0.0,
            ramp_steps: 0,
            ramp_duration_secs: 0.0,
            pre_delay_secs: 0.0,
        }
    }
}

impl InterfaceConfig {
    /// Meter key: the interface name, or the shared default sentinel.
    pub fn key(&self) -> &str {
        if self.name.is_empty() {
            DEFAULT_IFACE_KEY
        } else {
            &self.name
        }
    }

    pub fn pre_delay(&self) -> Duration {
        Duration::from_secs_f64(self.pre_delay_secs.max(0.0))
    }

    /// Configured ramp duration, or the default of
    /// `max(30 s, ramp_steps * 5 s)` when left at zero.
    pub fn ramp_duration(&self) -> Duration {
        if self.ramp_duration_secs > 0.0 {
            return Duration::from_secs_f64(self.ramp_duration_secs);
        }
        let spread = Duration::from_secs(u64::from(self.ramp_steps) * 5);
        spread.max(Duration::from_secs(30))
    }
}

/// Owns the meters and workers for one load session.
pub struct LoadGenerator {
    meters: Mutex<HashMap<String, Arc<InterfaceMeter>>>,
}

impl LoadGenerator {
    pub fn new() -> Self {
        Self {
            meters: Mutex::new(HashMap::new()),
        }
    }

    /// Register meters and spawn supervisors, ramp controllers, and the
    /// refresher.  Returns once everything is launched; per-interface
    /// prerequisites (address parsing, interface lookup) fail the whole
    /// start so a misconfiguration never half-runs.
    pub fn start(
        self: &Arc<Self>,
        token: &CancellationToken,
        config: &LoadConfig,
        events: EventSender,
    ) -> Result<()> {
        let interfaces = config.effective_interfaces();

        // Resolve every interface's send plan up front.
        let mut plans = Vec::with_capacity(interfaces.len());
        for ic in &interfaces {
            plans.push(SendPlan::resolve(config, ic)?);
        }

        {
            let mut meters = self.meters.lock().unwrap();
            for ic in &interfaces {
                // Ramped interfaces start at zero; the controller raises
                // the target step by step.
                let initial = if ic.ramp_steps > 0 && ic.target_throughput_mbps > 0.0 {
                    0.0
                } else {
                    ic.target_throughput_mbps
                };
                meters.insert(
                    ic.key().to_string(),
                    Arc::new(InterfaceMeter::new(ic.workers, initial)),
                );
            }
        }

        info!(
            protocol = %config.protocol,
            packet_size = config.packet_size,
            interfaces = interfaces.len(),
            "starting load generation"
        );

        let all_meters: Vec<Arc<InterfaceMeter>> =
            self.meters.lock().unwrap().values().cloned().collect();
        tokio::spawn(run_refresher(token.clone(), all_meters));

        for (ic, plan) in interfaces.into_iter().zip(plans) {
            let meter = self
                .meter(ic.key())
                .context("meter registered above is missing")?;
            tokio::spawn(run_interface(
                token.clone(),
                ic.clone(),
                plan,
                meter,
                events.clone(),
            ));

            if ic.ramp_steps > 0 && ic.target_throughput_mbps > 0.0 {
                tokio::spawn(ramp::run(
                    token.clone(),
                    Arc::clone(self),
                    ic,
                    events.clone(),
                ));
            }
        }

        Ok(())
    }

    fn meter(&self, key: &str) -> Option<Arc<InterfaceMeter>> {
        self.meters.lock().unwrap().get(key).cloned()
    }

    /// Sum of the per-interface window rates.
    pub fn total_mbps(&self) -> f64 {
        self.meters
            .lock()
            .unwrap()
            .values()
            .map(|m| m.mbps())
            .sum()
    }

    /// Snapshot of name -> measured Mbps.
    pub fn throughput_by_interface(&self) -> HashMap<String, f64> {
        self.meters
            .lock()
            .unwrap()
            .iter()
            .map(|(name, m)| (name.clone(), m.mbps()))
            .collect()
    }

    /// Snapshot of name -> active target Mbps.
    pub fn target_by_interface(&self) -> HashMap<String, f64> {
        self.meters
            .lock()
            .unwrap()
            .iter()
            .map(|(name, m)| (name.clone(), m.target_mbps()))
            .collect()
    }

    /// Update one interface's active target; the ramp controller's only
    /// mutating call.
    pub fn set_interface_target(&self, name: &str, mbps: f64) {
        let key = if name.is_empty() { DEFAULT_IFACE_KEY } else { name };
        match self.meter(key) {
            Some(meter) => meter.set_target_mbps(mbps),
            None => warn!(iface = %key, "set_interface_target: unknown interface"),
        }
    }
}

impl Default for LoadGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything resolved ahead of worker spawn for one interface.
enum SendPlan {
    Socket {
        /// Udp or Tcp; L2 takes the raw plan.
        protocol: Protocol,
        target: SocketAddr,
        bind_addr: Option<std::net::Ipv4Addr>,
        packet_size: usize,
    },
    Raw {
        iface: pnet::datalink::NetworkInterface,
        src_mac: MacAddr,
        dst_mac: MacAddr,
        payload_size: usize,
    },
}

impl SendPlan {
    fn resolve(config: &LoadConfig, ic: &InterfaceConfig) -> Result<Self> {
        match config.protocol {
            Protocol::Udp | Protocol::Tcp => {
                let bind_addr = if ic.name.is_empty() {
                    None
                } else {
                    let iface = netif::find_interface(&ic.name)?;
                    Some(netif::first_ipv4(&iface)?)
                };
                Ok(SendPlan::Socket {
                    protocol: config.protocol,
                    target: config.target_addr()?,
                    bind_addr,
                    packet_size: config.packet_size,
                })
            }
            Protocol::L2 => {
                anyhow::ensure!(
                    !ic.name.is_empty(),
                    "an interface name is required for L2 load generation"
                );
                let iface = netif::find_interface(&ic.name)?;
                let src_mac = iface
                    .mac
                    .with_context(|| format!("interface {} has no MAC address", ic.name))?;
                Ok(SendPlan::Raw {
                    iface,
                    src_mac,
                    dst_mac: config.target_mac()?,
                    payload_size: config.packet_size,
                })
            }
        }
    }
}

/// Per-interface supervisor: honors the pre-delay, announces the
/// interface, runs its worker threads, and joins them on cancellation.
async fn run_interface(
    token: CancellationToken,
    ic: InterfaceConfig,
    plan: SendPlan,
    meter: Arc<InterfaceMeter>,
    events: EventSender,
) {
    let key = ic.key().to_string();

    let pre_delay = ic.pre_delay();
    if !pre_delay.is_zero() {
        info!(iface = %key, delay_secs = pre_delay.as_secs_f64(), "waiting before interface start");
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(pre_delay) => {}
        }
    }

    events.publish(EventType::IfaceStart, format!("interface {} started", key));
    info!(iface = %key, workers = ic.workers, "interface sending");

    let mut handles = Vec::with_capacity(ic.workers as usize);
    for worker_id in 0..ic.workers {
        let spawned = std::thread::Builder::new()
            .name(format!("wattbench-tx-{}-{}", key, worker_id))
            .spawn(worker_entry(&token, worker_id, &key, &plan, &meter));
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(e) => warn!(iface = %key, worker = worker_id, error = %e, "failed to spawn worker thread"),
        }
    }

    token.cancelled().await;

    // Workers notice the token at their next burst boundary; wait for
    // them off the async runtime.
    let join = tokio::task::spawn_blocking(move || {
        for handle in handles {
            let _ = handle.join();
        }
    })
    .await;
    if let Err(e) = join {
        warn!(iface = %key, error = %e, "worker join task failed");
    }

    events.publish(EventType::IfaceStop, format!("interface {} stopped", key));
    info!(iface = %key, "interface stopped");
}

/// Build the closure one worker thread runs.
fn worker_entry(
    token: &CancellationToken,
    worker_id: u32,
    key: &str,
    plan: &SendPlan,
    meter: &Arc<InterfaceMeter>,
) -> impl FnOnce() + Send + 'static {
    let token = token.clone();
    let meter = Arc::clone(meter);
    let key = key.to_string();

    match plan {
        SendPlan::Socket {
            protocol,
            target,
            bind_addr,
            packet_size,
        } => {
            let ctx = worker::WorkerContext {
                id: worker_id,
                iface: key,
                bind_addr: *bind_addr,
                target: *target,
                packet_size: *packet_size,
                meter,
                token,
            };
            let tcp = matches!(protocol, Protocol::Tcp);
            Box::new(move || {
                if tcp {
                    worker::run_tcp_worker(ctx)
                } else {
                    worker::run_udp_worker(ctx)
                }
            }) as Box<dyn FnOnce() + Send + 'static>
        }
        SendPlan::Raw {
            iface,
            src_mac,
            dst_mac,
            payload_size,
        } => {
            let ctx = layer2::Layer2Context {
                id: worker_id,
                iface: iface.clone(),
                src_mac: *src_mac,
                dst_mac: *dst_mac,
                payload_size: *payload_size,
                meter,
                token,
            };
            Box::new(move || layer2::run_layer2_worker(ctx)) as Box<dyn FnOnce() + Send + 'static>
        }
    }
}

async fn run_refresher(token: CancellationToken, meters: Vec<Arc<InterfaceMeter>>) {
    let mut ticker = tokio::time::interval(REFRESH_PERIOD);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {
                for meter in &meters {
                    meter.refresh();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_interfaces_defaults_to_implicit() {
        let config = LoadConfig::default();
        let interfaces = config.effective_interfaces();
        assert_eq!(interfaces.len(), 1);
        assert_eq!(interfaces[0].key(), DEFAULT_IFACE_KEY);
        assert_eq!(interfaces[0].workers, DEFAULT_WORKERS);
    }

    #[test]
    fn test_ramp_duration_default_floor() {
        let ic = InterfaceConfig {
            ramp_steps: 3,
            ..Default::default()
        };
        // 3 steps * 5 s is below the 30 s floor.
        assert_eq!(ic.ramp_duration(), Duration::from_secs(30));

        let ic = InterfaceConfig {
            ramp_steps: 10,
            ..Default::default()
        };
        assert_eq!(ic.ramp_duration(), Duration::from_secs(50));

        let ic = InterfaceConfig {
            ramp_steps: 4,
            ramp_duration_secs: 8.0,
            ..Default::default()
        };
        assert_eq!(ic.ramp_duration(), Duration::from_secs(8));
    }

    #[test]
    fn test_set_target_on_unknown_interface_is_ignored() {
        let generator = LoadGenerator::new();
        // Must not panic or create a meter.
        generator.set_interface_target("ghost0", 100.0);
        assert!(generator.throughput_by_interface().is_empty());
    }

    #[test]
    fn test_interface_config_deserialization_defaults() {
        let ic: InterfaceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(ic.workers, DEFAULT_WORKERS);
        assert_eq!(ic.target_throughput_mbps, 0.0);
        assert_eq!(ic.key(), DEFAULT_IFACE_KEY);
    }

    #[test]
    fn test_protocol_wire_names() {
        assert_eq!(serde_json::to_string(&Protocol::Udp).unwrap(), "\"udp\"");
        assert_eq!(
            serde_json::from_str::<Protocol>("\"l2\"").unwrap(),
            Protocol::L2
        );
    }
}
