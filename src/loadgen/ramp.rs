//! Step-wise target advancement for a single interface.
//!
//! The ramp controller owns no state of its own; it drives the
//! interface's active target through [`LoadGenerator::set_interface_target`]
//! so the declared target stays observable alongside the measured
//! throughput even when the DUT cannot absorb the configured rate.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::runner::events::{EventSender, EventType};

use super::{InterfaceConfig, LoadGenerator};

/// Advance one interface's target through its configured ramp steps.
pub(crate) async fn run(
    token: CancellationToken,
    generator: Arc<LoadGenerator>,
    ic: InterfaceConfig,
    events: EventSender,
) {
    if ic.ramp_steps == 0 || ic.target_throughput_mbps <= 0.0 {
        return;
    }

    // The interface's own pre-delay gates the ramp as well.
    let pre_delay = ic.pre_delay();
    if !pre_delay.is_zero() {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(pre_delay) => {}
        }
    }

    let steps = ic.ramp_steps;
    let step_duration = ic.ramp_duration() / steps;
    let step_size = ic.target_throughput_mbps / steps as f64;
    let key = ic.key().to_string();

    info!(
        iface = %key,
        steps,
        step_mbps = step_size,
        target_mbps = ic.target_throughput_mbps,
        step_secs = step_duration.as_secs_f64(),
        "ramp starting"
    );

    for step in 1..=steps {
        // Land exactly on the configured target at the last step instead
        // of an accumulated float approximation.
        let target = if step == steps {
            ic.target_throughput_mbps
        } else {
            step_size * step as f64
        };

        generator.set_interface_target(&ic.name, target);
        events.publish(
            EventType::Ramp,
            format!("[{}] ramp {}/{}: {:.1} Mbps", key, step, steps, target),
        );
        debug!(iface = %key, step, target_mbps = target, "ramp step applied");

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(step_duration) => {}
        }
    }

    events.publish(
        EventType::Ramp,
        format!("[{}] ramp complete: {:.1} Mbps", key, ic.target_throughput_mbps),
    );
}
