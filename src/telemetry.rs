//! Telemetry fan-out: best-effort live delivery of data points.
//!
//! The sink must never couple the sampling loop to consumer speed; the
//! in-memory `TestResult` stays authoritative, and anything a slow
//! subscriber misses is simply gone from the live stream.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::runner::DataPoint;

/// Receives each data point and the terminal done signal for one run.
pub trait TelemetrySink: Send + Sync {
    /// Best-effort delivery; must not block.
    fn emit(&self, point: &DataPoint);
    /// Terminal signal, exactly once per run.
    fn signal_done(&self);
}

/// Message carried to live subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum StreamMessage {
    Point(DataPoint),
    Done,
}

/// Fans data points out to any number of subscribers over a lossy
/// broadcast channel.  Sends without subscribers, and sends that outrun
/// a subscriber, are dropped by construction.
pub struct BroadcastSink {
    tx: broadcast::Sender<StreamMessage>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamMessage> {
        self.tx.subscribe()
    }
}

impl TelemetrySink for BroadcastSink {
    fn emit(&self, point: &DataPoint) {
        let _ = self.tx.send(StreamMessage::Point(point.clone()));
    }

    fn signal_done(&self) {
        let _ = self.tx.send(StreamMessage::Done);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::Phase;
    use chrono::Utc;
    use std::collections::HashMap;

    fn point() -> DataPoint {
        DataPoint {
            timestamp: Utc::now(),
            power_mw: 4200.0,
            throughput_mbps: 0.0,
            throughput_by_interface: HashMap::new(),
            target_throughput_by_interface: HashMap::new(),
            phase: Phase::Pre,
            events: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_does_not_block() {
        let sink = BroadcastSink::new(4);
        for _ in 0..100 {
            sink.emit(&point());
        }
        sink.signal_done();
    }

    #[tokio::test]
    async fn test_subscriber_receives_points_and_done() {
        let sink = BroadcastSink::new(16);
        let mut rx = sink.subscribe();

        sink.emit(&point());
        sink.signal_done();

        assert!(matches!(rx.recv().await.unwrap(), StreamMessage::Point(_)));
        assert!(matches!(rx.recv().await.unwrap(), StreamMessage::Done));
    }
}
