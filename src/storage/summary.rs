//! Summary statistics computed when a run is stored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::runner::TestResult;

/// Aggregate statistics for a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub duration_secs: f64,
    pub total_data_points: usize,
    pub average_power_mw: f64,
    pub min_power_mw: f64,
    pub max_power_mw: f64,
    pub average_throughput_mbps: f64,
    pub max_throughput_mbps: f64,
    pub phases: BTreeMap<String, PhaseSummary>,
}

/// Statistics for one phase of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub duration_secs: f64,
    pub data_point_count: usize,
    pub average_power_mw: f64,
    pub power_std_dev_mw: f64,
    pub average_throughput_mbps: f64,
    pub throughput_std_dev_mbps: f64,
}

/// Mean and sample standard deviation.  SQLite rarely ships a stddev
/// extension, so this stays in Rust over the raw values.
fn mean_std_dev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let count = values.len() as f64;
    let mean = values.iter().sum::<f64>() / count;

    if values.len() < 2 {
        return (mean, 0.0);
    }
    let variance = values
        .iter()
        .map(|v| {
            let diff = v - mean;
            diff * diff
        })
        .sum::<f64>()
        / (count - 1.0);

    (mean, variance.sqrt())
}

/// Compute the stored summary for a finished run.
pub fn summarize(result: &TestResult) -> RunSummary {
    let points = &result.data_points;

    let power: Vec<f64> = points.iter().map(|p| p.power_mw).collect();
    let throughput: Vec<f64> = points.iter().map(|p| p.throughput_mbps).collect();

    let (average_power_mw, _) = mean_std_dev(&power);
    let (average_throughput_mbps, _) = mean_std_dev(&throughput);

    let mut phases = BTreeMap::new();
    for phase in points.iter().map(|p| p.phase).collect::<std::collections::BTreeSet<_>>() {
        let phase_points: Vec<_> = points.iter().filter(|p| p.phase == phase).collect();
        let phase_power: Vec<f64> = phase_points.iter().map(|p| p.power_mw).collect();
        let phase_throughput: Vec<f64> = phase_points.iter().map(|p| p.throughput_mbps).collect();

        let (average_power, power_std) = mean_std_dev(&phase_power);
        let (average_tp, tp_std) = mean_std_dev(&phase_throughput);

        let duration_secs = match (phase_points.first(), phase_points.last()) {
            (Some(first), Some(last)) => (last.timestamp - first.timestamp)
                .to_std()
                .unwrap_or_default()
                .as_secs_f64(),
            _ => 0.0,
        };

        phases.insert(
            phase.to_string(),
            PhaseSummary {
                duration_secs,
                data_point_count: phase_points.len(),
                average_power_mw: average_power,
                power_std_dev_mw: power_std,
                average_throughput_mbps: average_tp,
                throughput_std_dev_mbps: tp_std,
            },
        );
    }

    let min_power_mw = if power.is_empty() {
        0.0
    } else {
        power.iter().copied().fold(f64::INFINITY, f64::min)
    };

    RunSummary {
        duration_secs: (result.end_time - result.start_time)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64(),
        total_data_points: points.len(),
        average_power_mw,
        min_power_mw,
        max_power_mw: power.iter().copied().fold(0.0, f64::max),
        average_throughput_mbps,
        max_throughput_mbps: throughput.iter().copied().fold(0.0, f64::max),
        phases,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{DataPoint, Phase, TestConfig};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::collections::HashMap;

    fn point(phase: Phase, power_mw: f64, throughput_mbps: f64, offset_secs: i64) -> DataPoint {
        DataPoint {
            timestamp: Utc::now() + ChronoDuration::seconds(offset_secs),
            power_mw,
            throughput_mbps,
            throughput_by_interface: HashMap::new(),
            target_throughput_by_interface: HashMap::new(),
            phase,
            events: Vec::new(),
        }
    }

    fn result(points: Vec<DataPoint>) -> TestResult {
        TestResult {
            config: TestConfig {
                duration_secs: 4.0,
                interval_secs: 1.0,
                pre_secs: 2.0,
                post_secs: 2.0,
                description: String::new(),
                test_name: "t".to_string(),
                device_name: "d".to_string(),
                load_enabled: false,
                load: Default::default(),
            },
            data_points: points,
            start_time: Utc::now(),
            end_time: Utc::now() + ChronoDuration::seconds(8),
        }
    }

    #[test]
    fn test_summary_of_empty_run() {
        let summary = summarize(&result(Vec::new()));
        assert_eq!(summary.total_data_points, 0);
        assert_eq!(summary.average_power_mw, 0.0);
        assert!(summary.phases.is_empty());
    }

    #[test]
    fn test_overall_statistics() {
        let summary = summarize(&result(vec![
            point(Phase::Pre, 4000.0, 0.0, 0),
            point(Phase::Load, 6000.0, 100.0, 1),
            point(Phase::Load, 8000.0, 300.0, 2),
        ]));

        assert_eq!(summary.total_data_points, 3);
        assert!((summary.average_power_mw - 6000.0).abs() < 1e-9);
        assert_eq!(summary.min_power_mw, 4000.0);
        assert_eq!(summary.max_power_mw, 8000.0);
        assert!((summary.average_throughput_mbps - 400.0 / 3.0).abs() < 1e-9);
        assert_eq!(summary.max_throughput_mbps, 300.0);
    }

    #[test]
    fn test_per_phase_statistics() {
        let summary = summarize(&result(vec![
            point(Phase::Pre, 4000.0, 0.0, 0),
            point(Phase::Pre, 4200.0, 0.0, 1),
            point(Phase::Load, 9000.0, 500.0, 2),
            point(Phase::Load, 9000.0, 500.0, 5),
        ]));

        assert_eq!(summary.phases.len(), 2);

        let pre = &summary.phases["pre"];
        assert_eq!(pre.data_point_count, 2);
        assert!((pre.average_power_mw - 4100.0).abs() < 1e-9);
        assert!(pre.power_std_dev_mw > 0.0);
        assert_eq!(pre.average_throughput_mbps, 0.0);

        let load = &summary.phases["load"];
        assert_eq!(load.data_point_count, 2);
        assert_eq!(load.power_std_dev_mw, 0.0);
        assert!((load.duration_secs - 3.0).abs() < 0.5);
    }
}
