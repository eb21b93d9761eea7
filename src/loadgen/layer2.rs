//! Raw Ethernet (L2) send workers.
//!
//! Used when the device under test is addressed by MAC rather than IP,
//! e.g. a switch port under load.  Frames are sent through a datalink
//! channel on the named interface; reported byte counts include the full
//! wire overhead so measured throughput reflects wire rate, not payload
//! rate.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use pnet::datalink::{self, Channel, DataLinkSender, NetworkInterface};
use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet::util::MacAddr;
use rand::RngCore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::meter::InterfaceMeter;
use super::rate;
use super::sleep::precise_sleep;
use super::worker::MAX_CONSECUTIVE_ERRORS;

/// Frames per pacing sleep.  Raw sends are cheap, so L2 uses a much
/// larger burst than UDP to keep the sleep overhead negligible.
const L2_BURST: u32 = 128;

/// Minimum Ethernet payload; shorter payloads are padded on the wire.
const MIN_PAYLOAD: usize = 46;

const ETH_HEADER: usize = 14;

/// Per-frame overhead that never reaches the payload: preamble (8),
/// FCS (4), inter-frame gap (12).
const FRAME_OVERHEAD: usize = 8 + 4 + 12;

/// Backoff applied after a failed raw send.
const ERROR_BACKOFF: Duration = Duration::from_micros(10);

pub(crate) struct Layer2Context {
    pub id: u32,
    pub iface: NetworkInterface,
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub payload_size: usize,
    pub meter: Arc<InterfaceMeter>,
    pub token: CancellationToken,
}

/// Bytes one frame occupies on the wire, including framing overhead.
pub(crate) fn wire_bytes(payload_size: usize) -> usize {
    ETH_HEADER + payload_size.max(MIN_PAYLOAD) + FRAME_OVERHEAD
}

/// Serialize one Ethernet frame with a randomized payload.
fn build_frame(src: MacAddr, dst: MacAddr, payload_size: usize) -> Result<Vec<u8>> {
    let payload_len = payload_size.max(MIN_PAYLOAD);
    let mut frame = vec![0u8; ETH_HEADER + payload_len];

    let mut eth = MutableEthernetPacket::new(&mut frame)
        .context("frame buffer too small for Ethernet header")?;
    eth.set_destination(dst);
    eth.set_source(src);
    eth.set_ethertype(EtherTypes::Ipv4);

    rand::thread_rng().fill_bytes(&mut frame[ETH_HEADER..]);
    Ok(frame)
}

fn open_channel(iface: &NetworkInterface) -> Result<Box<dyn DataLinkSender>> {
    let config = datalink::Config {
        write_buffer_size: super::worker::SEND_BUFFER_BYTES,
        ..Default::default()
    };
    match datalink::channel(iface, config) {
        Ok(Channel::Ethernet(tx, _rx)) => Ok(tx),
        Ok(_) => anyhow::bail!("interface {} does not expose an Ethernet channel", iface.name),
        Err(e) => {
            Err(e).with_context(|| format!("failed to open raw channel on {}", iface.name))
        }
    }
}

/// L2 send loop: large bursts of pre-serialized frames, byte counts
/// credited once per burst to keep atomic contention off the hot path.
pub(crate) fn run_layer2_worker(ctx: Layer2Context) {
    let mut tx = match open_channel(&ctx.iface) {
        Ok(tx) => tx,
        Err(e) => {
            warn!(worker = ctx.id, iface = %ctx.iface.name, error = %e, "L2 worker failed to open channel");
            return;
        }
    };

    let frame = match build_frame(ctx.src_mac, ctx.dst_mac, ctx.payload_size) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(worker = ctx.id, iface = %ctx.iface.name, error = %e, "L2 worker failed to build frame");
            return;
        }
    };

    let wire = wire_bytes(ctx.payload_size) as u64;
    let mut consecutive_errors = 0u32;

    loop {
        if ctx.token.is_cancelled() {
            return;
        }

        let delay = rate::packet_delay(
            ctx.meter.target_mbps(),
            ctx.meter.workers(),
            wire as usize,
        );

        let mut burst_bytes = 0u64;
        for _ in 0..L2_BURST {
            let sent = match tx.send_to(&frame, None) {
                Some(Ok(())) => true,
                Some(Err(e)) => {
                    if ctx.token.is_cancelled() {
                        return;
                    }
                    debug!(worker = ctx.id, iface = %ctx.iface.name, error = %e, "raw send error, backing off");
                    false
                }
                None => {
                    warn!(worker = ctx.id, iface = %ctx.iface.name, "datalink channel rejected frame, stopping worker");
                    return;
                }
            };

            if sent {
                burst_bytes += wire;
                consecutive_errors = 0;
            } else {
                consecutive_errors += 1;
                if consecutive_errors > MAX_CONSECUTIVE_ERRORS {
                    warn!(worker = ctx.id, iface = %ctx.iface.name, "too many consecutive raw send errors, stopping worker");
                    return;
                }
                precise_sleep(ERROR_BACKOFF);
            }
        }

        if burst_bytes > 0 {
            ctx.meter.add_bytes(burst_bytes);
        }

        if !delay.is_zero() {
            precise_sleep(delay * L2_BURST);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_bytes_includes_framing() {
        // 1000 B payload: 8 + 14 + 1000 + 4 + 12.
        assert_eq!(wire_bytes(1000), 1038);
    }

    #[test]
    fn test_wire_bytes_pads_short_payloads() {
        // Anything under 46 B is padded to the Ethernet minimum.
        assert_eq!(wire_bytes(10), wire_bytes(46));
        assert_eq!(wire_bytes(0), 8 + 14 + 46 + 4 + 12);
    }

    #[test]
    fn test_frame_layout() {
        let src = MacAddr::new(0x02, 0, 0, 0, 0, 1);
        let dst = MacAddr::new(0x02, 0, 0, 0, 0, 2);
        let frame = build_frame(src, dst, 100).unwrap();

        assert_eq!(frame.len(), ETH_HEADER + 100);
        assert_eq!(&frame[0..6], &[0x02, 0, 0, 0, 0, 2]);
        assert_eq!(&frame[6..12], &[0x02, 0, 0, 0, 0, 1]);
        // EtherType IPv4.
        assert_eq!(&frame[12..14], &[0x08, 0x00]);
    }

    #[test]
    fn test_short_frame_is_padded() {
        let src = MacAddr::new(0x02, 0, 0, 0, 0, 1);
        let dst = MacAddr::new(0x02, 0, 0, 0, 0, 2);
        let frame = build_frame(src, dst, 10).unwrap();
        assert_eq!(frame.len(), ETH_HEADER + MIN_PAYLOAD);
    }
}
