//! The request record and its lifecycle.
//!
//! A request is created by the workload generator, admitted and routed by the
//! cluster, then driven through prefill and decode by its instance's step
//! loop. Token sequences are fixed at construction; everything else is
//! scheduler-owned mutable state.

use serde::{Deserialize, Serialize};

use crate::hash::BlockHash;
use crate::types::{InstanceId, RequestId, Tick};

/// Lifecycle state. Transitions are `Queued ↔ Running → Completed` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    Queued,
    Running,
    Completed,
}

/// Service-level objective class carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SloClass {
    Critical,
    Standard,
    Sheddable,
    Batch,
    Background,
    #[default]
    #[serde(rename = "")]
    Unspecified,
}

impl SloClass {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Self::Critical),
            "standard" => Some(Self::Standard),
            "sheddable" => Some(Self::Sheddable),
            "batch" => Some(Self::Batch),
            "background" => Some(Self::Background),
            "" => Some(Self::Unspecified),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Standard => "standard",
            Self::Sheddable => "sheddable",
            Self::Batch => "batch",
            Self::Background => "background",
            Self::Unspecified => "",
        }
    }
}

/// A single inference request flowing through the simulator.
#[derive(Debug, Clone)]
pub struct Request {
    id: RequestId,
    arrival_time: Tick,
    input_tokens: Vec<u32>,
    output_tokens: Vec<u32>,

    /// Lifecycle state; mutate through `set_running` / `set_queued` /
    /// `complete` so transitions stay legal.
    state: RequestState,

    /// Total tokens consumed so far: cached-prefix + prefilled + decoded.
    /// Monotone non-decreasing.
    progress: usize,

    pub ttft_set: bool,
    pub first_token_time: Tick,

    /// Tokens scheduled for this request in the current step.
    pub num_new_tokens: usize,

    pub slo_class: SloClass,
    pub tenant: Option<String>,
    pub assigned_instance: Option<InstanceId>,

    /// Score assigned by the instance priority policy each step.
    pub priority: f64,

    /// Output tokens emitted so far.
    pub decoded: usize,

    /// Input tokens satisfied from the prefix cache when first scheduled.
    pub cached_prefix_tokens: usize,

    /// Times this request was evicted from a running batch.
    pub preemptions: u32,

    /// Block-hash chain of the input tokens, computed once by the router at
    /// arrival and consumed everywhere hashes are compared.
    pub prefix_hashes: Vec<BlockHash>,
}

impl Request {
    pub fn new(
        id: RequestId,
        arrival_time: Tick,
        input_tokens: Vec<u32>,
        output_tokens: Vec<u32>,
        slo_class: SloClass,
        tenant: Option<String>,
    ) -> Self {
        Self {
            id,
            arrival_time,
            input_tokens,
            output_tokens,
            state: RequestState::Queued,
            progress: 0,
            ttft_set: false,
            first_token_time: 0,
            num_new_tokens: 0,
            slo_class,
            tenant,
            assigned_instance: None,
            priority: 0.0,
            decoded: 0,
            cached_prefix_tokens: 0,
            preemptions: 0,
            prefix_hashes: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn arrival_time(&self) -> Tick {
        self.arrival_time
    }

    pub fn input_tokens(&self) -> &[u32] {
        &self.input_tokens
    }

    pub fn output_tokens(&self) -> &[u32] {
        &self.output_tokens
    }

    pub fn input_len(&self) -> usize {
        self.input_tokens.len()
    }

    pub fn output_len(&self) -> usize {
        self.output_tokens.len()
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn progress(&self) -> usize {
        self.progress
    }

    /// Advance the progress index. Regression is an invariant violation.
    pub fn advance_progress(&mut self, tokens: usize) {
        self.progress += tokens;
    }

    /// Jump-start progress from a prefix-cache hit; only valid before any
    /// tokens were processed.
    pub fn set_cached_prefix(&mut self, tokens: usize) {
        assert_eq!(self.progress, 0, "cached prefix after progress began");
        self.progress = tokens;
        self.cached_prefix_tokens = tokens;
    }

    /// Still processing input tokens.
    pub fn in_prefill(&self) -> bool {
        self.progress < self.input_tokens.len()
    }

    pub fn remaining_prefill(&self) -> usize {
        self.input_tokens.len().saturating_sub(self.progress)
    }

    /// The next pre-determined output token to emit.
    pub fn next_output_token(&self) -> Option<u32> {
        self.output_tokens.get(self.decoded).copied()
    }

    pub fn is_finished(&self) -> bool {
        self.decoded >= self.output_tokens.len()
    }

    /// Flip the TTFT flag. Must happen exactly once.
    pub fn mark_first_token(&mut self, at: Tick) {
        assert!(!self.ttft_set, "TTFT set twice for request {}", self.id);
        self.ttft_set = true;
        self.first_token_time = at;
    }

    pub fn set_running(&mut self) {
        assert_eq!(self.state, RequestState::Queued, "running from non-queued");
        self.state = RequestState::Running;
    }

    /// Back to the wait queue on preemption.
    pub fn set_queued(&mut self) {
        assert_eq!(self.state, RequestState::Running, "queued from non-running");
        self.state = RequestState::Queued;
        self.preemptions += 1;
    }

    pub fn complete(&mut self) {
        assert_eq!(self.state, RequestState::Running, "completed from non-running");
        self.state = RequestState::Completed;
    }
}
