//! Per-request metric records emitted by the core.
//!
//! The core computes TTFT/E2E/ITL per request and appends records to a
//! `SimReport`; aggregation and percentile math belong to the consumer.

use serde::Serialize;

use crate::request::{Request, SloClass};
use crate::types::{InstanceId, RequestId, Tick};

/// Latency record captured when a request completes.
#[derive(Debug, Clone, Serialize)]
pub struct RequestMetrics {
    pub id: RequestId,
    pub slo_class: SloClass,
    pub instance: InstanceId,
    pub arrival_time: Tick,
    pub first_token_time: Tick,
    pub completion_time: Tick,
    pub input_len: usize,
    pub output_len: usize,
    pub cached_prefix_tokens: usize,
    pub preemptions: u32,
}

impl RequestMetrics {
    pub fn from_request(req: &Request, instance: InstanceId, completion_time: Tick) -> Self {
        Self {
            id: req.id().to_string(),
            slo_class: req.slo_class,
            instance,
            arrival_time: req.arrival_time(),
            first_token_time: req.first_token_time,
            completion_time,
            input_len: req.input_len(),
            output_len: req.output_len(),
            cached_prefix_tokens: req.cached_prefix_tokens,
            preemptions: req.preemptions,
        }
    }

    /// Time to first token, in ticks.
    pub fn ttft(&self) -> Tick {
        self.first_token_time.saturating_sub(self.arrival_time)
    }

    /// End-to-end latency, in ticks.
    pub fn e2e(&self) -> Tick {
        self.completion_time.saturating_sub(self.arrival_time)
    }

    /// Mean inter-token latency after the first token, in ticks.
    pub fn itl(&self) -> f64 {
        if self.output_len <= 1 {
            return 0.0;
        }
        let decode_span = self.completion_time.saturating_sub(self.first_token_time);
        decode_span as f64 / (self.output_len - 1) as f64
    }
}

/// Record of a request the admission layer turned away.
#[derive(Debug, Clone, Serialize)]
pub struct RejectionRecord {
    pub id: RequestId,
    pub slo_class: SloClass,
    pub reason: String,
    pub at: Tick,
}

/// Everything a run produces.
#[derive(Debug, Default, Serialize)]
pub struct SimReport {
    pub completed: Vec<RequestMetrics>,
    pub rejected: Vec<RejectionRecord>,
    pub final_clock: Tick,
    pub steps_executed: u64,
    pub preemptions: u64,
}

impl SimReport {
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.len()
    }
}
