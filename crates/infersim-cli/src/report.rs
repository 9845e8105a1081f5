//! End-of-run aggregation: means, percentiles and rejection breakdowns over
//! the per-request records the core emits.

use std::collections::BTreeMap;

use serde::Serialize;

use infersim_core::{RequestMetrics, SimReport};

#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
    pub max: f64,
}

impl LatencySummary {
    fn from_samples(mut samples: Vec<f64>) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_by(|a, b| a.partial_cmp(b).expect("latency samples are finite"));
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        Some(Self {
            mean,
            p50: percentile(&samples, 0.50),
            p90: percentile(&samples, 0.90),
            p99: percentile(&samples, 0.99),
            max: *samples.last().expect("non-empty"),
        })
    }
}

/// Nearest-rank percentile over a sorted sample set.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let rank = ((sorted.len() as f64) * q).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub completed: usize,
    pub rejected: usize,
    pub final_clock_us: u64,
    pub steps_executed: u64,
    pub preemptions: u64,
    /// Completed requests per simulated second.
    pub throughput_rps: f64,
    pub ttft_us: Option<LatencySummary>,
    pub e2e_us: Option<LatencySummary>,
    pub itl_us: Option<LatencySummary>,
    pub rejections_by_reason: BTreeMap<String, usize>,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub summary: RunSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_request: Option<Vec<RequestMetrics>>,
}

pub fn summarize(report: SimReport, include_per_request: bool) -> RunReport {
    let ttft: Vec<f64> = report.completed.iter().map(|m| m.ttft() as f64).collect();
    let e2e: Vec<f64> = report.completed.iter().map(|m| m.e2e() as f64).collect();
    let itl: Vec<f64> = report
        .completed
        .iter()
        .filter(|m| m.output_len > 1)
        .map(RequestMetrics::itl)
        .collect();

    let mut rejections_by_reason = BTreeMap::new();
    for r in &report.rejected {
        *rejections_by_reason.entry(r.reason.clone()).or_insert(0) += 1;
    }

    let elapsed_secs = report.final_clock as f64 / 1e6;
    let throughput_rps = if elapsed_secs > 0.0 {
        report.completed.len() as f64 / elapsed_secs
    } else {
        0.0
    };

    RunReport {
        summary: RunSummary {
            completed: report.completed.len(),
            rejected: report.rejected.len(),
            final_clock_us: report.final_clock,
            steps_executed: report.steps_executed,
            preemptions: report.preemptions,
            throughput_rps,
            ttft_us: LatencySummary::from_samples(ttft),
            e2e_us: LatencySummary::from_samples(e2e),
            itl_us: LatencySummary::from_samples(itl),
            rejections_by_reason,
        },
        per_request: include_per_request.then_some(report.completed),
    }
}
