//! UDP and TCP send workers.
//!
//! Each worker is a dedicated OS thread that owns one long-lived send
//! handle and pushes randomized payloads at the interface's active
//! target rate.  Workers never propagate errors upward; a worker that
//! cannot keep its handle alive exits and the interface simply measures
//! less throughput.

use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::RngCore;
use socket2::{Domain, Protocol, Socket, Type};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::meter::InterfaceMeter;
use super::rate;
use super::sleep::precise_sleep;

/// Writes per pacing sleep for UDP; amortizes the sleep call.
const UDP_BURST: u32 = 10;

/// Send-side socket buffer, where the transport exposes one.
pub(crate) const SEND_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// A worker that fails this many sends in a row gives up.
pub(crate) const MAX_CONSECUTIVE_ERRORS: u32 = 100;

/// Backoff applied after a failed UDP/L2 send.
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A blocked TCP write wakes at least this often so cancellation is
/// observed even against a stalled receiver.
const TCP_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything one send thread needs; built by the interface supervisor.
pub(crate) struct WorkerContext {
    pub id: u32,
    /// Display key of the owning interface (for logs).
    pub iface: String,
    /// Source address to bind, when the interface is named.
    pub bind_addr: Option<Ipv4Addr>,
    pub target: SocketAddr,
    pub packet_size: usize,
    pub meter: Arc<InterfaceMeter>,
    pub token: CancellationToken,
}

impl WorkerContext {
    fn payload(&self) -> Vec<u8> {
        let mut payload = vec![0u8; self.packet_size];
        rand::thread_rng().fill_bytes(&mut payload);
        payload
    }
}

/// UDP send loop: bursts of writes on a connected socket, paced between
/// bursts by the interface's current target.
pub(crate) fn run_udp_worker(ctx: WorkerContext) {
    let socket = match open_udp_socket(&ctx) {
        Ok(socket) => socket,
        Err(e) => {
            warn!(worker = ctx.id, iface = %ctx.iface, error = %e, "UDP worker failed to open socket");
            return;
        }
    };

    let payload = ctx.payload();
    let mut consecutive_errors = 0u32;

    loop {
        if ctx.token.is_cancelled() {
            return;
        }

        let delay = rate::packet_delay(ctx.meter.target_mbps(), ctx.meter.workers(), ctx.packet_size);

        for _ in 0..UDP_BURST {
            match socket.send(&payload) {
                Ok(n) => {
                    ctx.meter.add_bytes(n as u64);
                    consecutive_errors = 0;
                }
                Err(e) => {
                    if ctx.token.is_cancelled() {
                        return;
                    }
                    consecutive_errors += 1;
                    if consecutive_errors > MAX_CONSECUTIVE_ERRORS {
                        warn!(worker = ctx.id, iface = %ctx.iface, error = %e, "too many consecutive send errors, stopping worker");
                        return;
                    }
                    debug!(worker = ctx.id, iface = %ctx.iface, error = %e, "UDP send error, backing off");
                    precise_sleep(ERROR_BACKOFF);
                }
            }
        }

        if !delay.is_zero() {
            precise_sleep(delay * UDP_BURST);
        }
    }
}

/// TCP send loop: single writes paced individually; the kernel's flow
/// control already batches on the wire.  A write failure ends the worker
/// -- there is no reconnect within a run.
pub(crate) fn run_tcp_worker(ctx: WorkerContext) {
    let mut stream = match open_tcp_stream(&ctx) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(worker = ctx.id, iface = %ctx.iface, error = %e, "TCP worker failed to connect");
            return;
        }
    };

    let payload = ctx.payload();

    loop {
        if ctx.token.is_cancelled() {
            return;
        }

        let delay = rate::packet_delay(ctx.meter.target_mbps(), ctx.meter.workers(), ctx.packet_size);
        if !delay.is_zero() {
            precise_sleep(delay);
        }

        match stream.write(&payload) {
            Ok(n) => ctx.meter.add_bytes(n as u64),
            Err(e) => {
                if !ctx.token.is_cancelled() {
                    warn!(worker = ctx.id, iface = %ctx.iface, error = %e, "TCP write failed, stopping worker");
                }
                return;
            }
        }
    }
}

fn open_udp_socket(ctx: &WorkerContext) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("failed to create UDP socket")?;

    if let Some(ip) = ctx.bind_addr {
        let local = SocketAddr::from((ip, 0));
        socket
            .bind(&local.into())
            .with_context(|| format!("failed to bind UDP socket to {}", ip))?;
        debug!(worker = ctx.id, iface = %ctx.iface, %ip, "bound UDP source address");
    }

    if let Err(e) = socket.set_send_buffer_size(SEND_BUFFER_BYTES) {
        debug!(error = %e, "could not enlarge UDP send buffer");
    }

    socket
        .connect(&ctx.target.into())
        .with_context(|| format!("failed to connect UDP socket to {}", ctx.target))?;

    Ok(socket.into())
}

fn open_tcp_stream(ctx: &WorkerContext) -> Result<std::net::TcpStream> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .context("failed to create TCP socket")?;

    if let Some(ip) = ctx.bind_addr {
        let local = SocketAddr::from((ip, 0));
        socket
            .bind(&local.into())
            .with_context(|| format!("failed to bind TCP socket to {}", ip))?;
        debug!(worker = ctx.id, iface = %ctx.iface, %ip, "bound TCP source address");
    }

    socket
        .connect_timeout(&ctx.target.into(), TCP_CONNECT_TIMEOUT)
        .with_context(|| format!("failed to connect to {}", ctx.target))?;

    socket.set_nodelay(true).context("failed to disable Nagle")?;
    if let Err(e) = socket.set_send_buffer_size(SEND_BUFFER_BYTES) {
        debug!(error = %e, "could not enlarge TCP send buffer");
    }
    socket
        .set_write_timeout(Some(TCP_WRITE_TIMEOUT))
        .context("failed to set write timeout")?;

    Ok(socket.into())
}
