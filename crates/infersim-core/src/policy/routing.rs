//! Routing policies and their composable scorers.
//!
//! Every policy returns a `RoutingDecision` whose scores follow the
//! higher-is-better convention; argmax ties resolve to the first occurrence
//! in snapshot order.

use std::collections::HashMap;

use tracing::trace;

use super::{RejectionObserver, RoutingPolicy, Scorer};
use crate::cluster::RouterState;
use crate::config::ScorerSpec;
use crate::error::{Error, Result};
use crate::hash::{self, BlockHash};
use crate::request::Request;
use crate::types::InstanceId;

/// Where an admitted request goes, and why.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub target: InstanceId,
    pub reason: String,
    /// Per-instance scores, when the policy computes them.
    pub scores: Option<Vec<(InstanceId, f64)>>,
    /// One-shot priority hint; zero means none.
    pub priority: f64,
}

impl RoutingDecision {
    fn to(target: InstanceId, reason: impl Into<String>) -> Self {
        Self {
            target,
            reason: reason.into(),
            scores: None,
            priority: 0.0,
        }
    }
}

/// First index holding the maximum value.
fn argmax(scores: &[f64]) -> usize {
    let mut best = 0;
    for (i, &s) in scores.iter().enumerate().skip(1) {
        if s > scores[best] {
            best = i;
        }
    }
    best
}

/// First index holding the minimum effective load.
fn least_loaded_index(state: &RouterState) -> usize {
    let mut best = 0;
    for (i, snap) in state.snapshots.iter().enumerate().skip(1) {
        if snap.effective_load() < state.snapshots[best].effective_load() {
            best = i;
        }
    }
    best
}

/// Counter modulo fleet size.
pub struct RoundRobin {
    counter: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self { counter: 0 }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingPolicy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn route(&mut self, _request: &Request, state: &RouterState) -> RoutingDecision {
        let target = state.snapshots[self.counter % state.snapshots.len()].id;
        self.counter += 1;
        RoutingDecision::to(target, "round-robin")
    }
}

/// Argmin over `EffectiveLoad = QueueDepth + BatchSize + PendingRequests`.
pub struct LeastLoaded;

impl RoutingPolicy for LeastLoaded {
    fn name(&self) -> &'static str {
        "least-loaded"
    }

    fn route(&mut self, _request: &Request, state: &RouterState) -> RoutingDecision {
        let idx = least_loaded_index(state);
        let snap = &state.snapshots[idx];
        RoutingDecision::to(
            snap.id,
            format!("least-loaded (load {})", snap.effective_load()),
        )
    }
}

/// Min-max-normalised effective load, inverted so light instances score high.
pub struct QueueDepthScorer;

impl Scorer for QueueDepthScorer {
    fn name(&self) -> &'static str {
        "queue-depth"
    }

    fn score(&self, _request: &Request, state: &RouterState) -> Vec<f64> {
        let loads: Vec<f64> = state
            .snapshots
            .iter()
            .map(|s| s.effective_load() as f64)
            .collect();
        let min = loads.iter().copied().fold(f64::INFINITY, f64::min);
        let max = loads.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if max <= min {
            return vec![1.0; loads.len()];
        }
        loads.iter().map(|l| (max - l) / (max - min)).collect()
    }
}

/// Free KV share: `1 - utilisation`.
pub struct KvUtilizationScorer;

impl Scorer for KvUtilizationScorer {
    fn name(&self) -> &'static str {
        "kv-utilization"
    }

    fn score(&self, _request: &Request, state: &RouterState) -> Vec<f64> {
        state
            .snapshots
            .iter()
            .map(|s| 1.0 - s.kv_utilization)
            .collect()
    }
}

/// `1 / (1 + load)`: strictly decreasing in load, so argmax agrees with
/// least-loaded.
pub struct LoadBalanceScorer;

impl Scorer for LoadBalanceScorer {
    fn name(&self) -> &'static str {
        "load-balance"
    }

    fn score(&self, _request: &Request, state: &RouterState) -> Vec<f64> {
        state
            .snapshots
            .iter()
            .map(|s| 1.0 / (1.0 + s.effective_load() as f64))
            .collect()
    }
}

/// Fraction of the request's block-hash chain each instance has cached.
pub struct PrefixAffinityScorer;

impl Scorer for PrefixAffinityScorer {
    fn name(&self) -> &'static str {
        "prefix-affinity"
    }

    fn score(&self, request: &Request, state: &RouterState) -> Vec<f64> {
        let total = request.prefix_hashes.len();
        state
            .snapshots
            .iter()
            .map(|s| {
                if total == 0 {
                    0.0
                } else {
                    state
                        .prefix_index
                        .match_length(&request.prefix_hashes, s.id)
                        as f64
                        / total as f64
                }
            })
            .collect()
    }
}

/// Weighted sum of clamped scorer outputs; weights are validated and
/// normalised at construction.
pub struct WeightedScoring {
    scorers: Vec<(Box<dyn Scorer>, f64)>,
}

impl WeightedScoring {
    pub fn new(scorers: Vec<(Box<dyn Scorer>, f64)>) -> Result<Self> {
        if scorers.is_empty() {
            return Err(Error::ConfigError(
                "weighted routing requires at least one scorer".into(),
            ));
        }
        let mut total = 0.0;
        for (scorer, weight) in &scorers {
            if !(*weight > 0.0) || !weight.is_finite() {
                return Err(Error::ConfigError(format!(
                    "scorer '{}' weight must be a positive finite number",
                    scorer.name()
                )));
            }
            total += weight;
        }
        let scorers = scorers
            .into_iter()
            .map(|(s, w)| (s, w / total))
            .collect();
        Ok(Self { scorers })
    }

    pub fn from_specs(specs: &[ScorerSpec]) -> Result<Self> {
        let mut scorers = Vec::with_capacity(specs.len());
        for spec in specs {
            scorers.push((super::build_scorer(&spec.name)?, spec.weight));
        }
        Self::new(scorers)
    }

    fn combined(&self, request: &Request, state: &RouterState) -> Vec<f64> {
        let n = state.snapshots.len();
        let mut combined = vec![0.0; n];
        for (scorer, weight) in &self.scorers {
            let scores = scorer.score(request, state);
            debug_assert_eq!(scores.len(), n, "scorer output length mismatch");
            for (acc, s) in combined.iter_mut().zip(scores) {
                *acc += s.clamp(0.0, 1.0) * weight;
            }
        }
        combined
    }
}

impl RoutingPolicy for WeightedScoring {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn route(&mut self, request: &Request, state: &RouterState) -> RoutingDecision {
        let combined = self.combined(request, state);
        let idx = argmax(&combined);
        let target = state.snapshots[idx].id;
        trace!(request = request.id(), target, score = combined[idx], "weighted route");
        RoutingDecision {
            target,
            reason: format!("weighted (score {:.3})", combined[idx]),
            scores: Some(
                state
                    .snapshots
                    .iter()
                    .zip(&combined)
                    .map(|(s, &v)| (s.id, v))
                    .collect(),
            ),
            priority: 0.0,
        }
    }
}

/// Sticky full-prompt routing: a hash of the whole input maps to the
/// instance that served it last; misses fall back to least-loaded and learn.
pub struct PrefixAffinity {
    seen: HashMap<BlockHash, InstanceId>,
}

impl PrefixAffinity {
    pub fn new() -> Self {
        Self {
            seen: HashMap::new(),
        }
    }
}

impl Default for PrefixAffinity {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingPolicy for PrefixAffinity {
    fn name(&self) -> &'static str {
        "prefix-affinity"
    }

    fn route(&mut self, request: &Request, state: &RouterState) -> RoutingDecision {
        let key = hash::sequence_hash(request.input_tokens());
        if let Some(&target) = self.seen.get(&key) {
            if state.snapshots.iter().any(|s| s.id == target) {
                return RoutingDecision::to(target, "prefix-affinity-hit");
            }
        }
        let idx = least_loaded_index(state);
        let target = state.snapshots[idx].id;
        self.seen.insert(key, target);
        RoutingDecision::to(target, "prefix-affinity-miss")
    }
}

/// Exploit cache affinity while the workload shows prefix reuse, explore
/// otherwise. An EMA of per-request hit ratios detects non-prefix phases and
/// a load-headroom guard keeps hot instances from melting.
pub struct AdaptiveWeighted {
    pub ema_alpha: f64,
    pub exploit_threshold: f64,
    pub load_headroom: usize,
    hit_ema: f64,
    rr_counter: usize,
}

impl Default for AdaptiveWeighted {
    fn default() -> Self {
        Self {
            ema_alpha: 0.2,
            exploit_threshold: 0.1,
            load_headroom: 8,
            hit_ema: 0.0,
            rr_counter: 0,
        }
    }
}

impl AdaptiveWeighted {
    fn round_robin(&mut self, state: &RouterState, reason: &str) -> RoutingDecision {
        let target = state.snapshots[self.rr_counter % state.snapshots.len()].id;
        self.rr_counter += 1;
        RoutingDecision::to(target, reason)
    }
}

impl RoutingPolicy for AdaptiveWeighted {
    fn name(&self) -> &'static str {
        "adaptive-weighted"
    }

    fn route(&mut self, request: &Request, state: &RouterState) -> RoutingDecision {
        let total_blocks = request.prefix_hashes.len();
        let (best_idx, best_match) = state
            .snapshots
            .iter()
            .enumerate()
            .map(|(i, s)| {
                (
                    i,
                    state.prefix_index.match_length(&request.prefix_hashes, s.id),
                )
            })
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .unwrap_or((0, 0));

        let hit_ratio = if total_blocks == 0 {
            0.0
        } else {
            best_match as f64 / total_blocks as f64
        };
        self.hit_ema = self.ema_alpha * hit_ratio + (1.0 - self.ema_alpha) * self.hit_ema;

        if best_match == 0 || self.hit_ema < self.exploit_threshold {
            return self.round_robin(state, "explore (low prefix reuse)");
        }

        let cached = &state.snapshots[best_idx];
        let min_load = state.snapshots[least_loaded_index(state)].effective_load();
        if cached.effective_load() > min_load + self.load_headroom {
            return self.round_robin(state, "explore (cached instance overloaded)");
        }
        RoutingDecision::to(cached.id, format!("exploit (match {best_match} blocks)"))
    }
}

/// Weighted prefix-affinity + queue-depth routing whose weights adapt every
/// epoch to the observed admission-rejection rate.
pub struct EpochAdaptive {
    pub epoch_length: usize,
    pub high_rejection_rate: f64,
    pub low_rejection_rate: f64,
    pub adjust_factor: f64,
    pub min_weight: f64,
    pub max_weight: f64,
    /// Ceiling on prefix-affinity : queue-depth weight ratio.
    pub ratio_ceiling: f64,
    pa_weight: f64,
    qd_weight: f64,
    requests_in_epoch: usize,
    rejections_in_epoch: usize,
}

impl Default for EpochAdaptive {
    fn default() -> Self {
        Self {
            epoch_length: 64,
            high_rejection_rate: 0.10,
            low_rejection_rate: 0.01,
            adjust_factor: 1.25,
            min_weight: 0.05,
            max_weight: 0.95,
            ratio_ceiling: 4.0,
            pa_weight: 0.5,
            qd_weight: 0.5,
            requests_in_epoch: 0,
            rejections_in_epoch: 0,
        }
    }
}

impl EpochAdaptive {
    pub fn weights(&self) -> (f64, f64) {
        (self.pa_weight, self.qd_weight)
    }

    fn end_epoch(&mut self) {
        let rate = self.rejections_in_epoch as f64 / self.epoch_length as f64;
        if rate >= self.high_rejection_rate {
            // Rejections mean saturation: favour load spreading.
            self.qd_weight *= self.adjust_factor;
            self.pa_weight /= self.adjust_factor;
        } else if rate <= self.low_rejection_rate {
            // Headroom available: lean harder on cache affinity.
            self.pa_weight *= self.adjust_factor;
        }
        self.pa_weight = self.pa_weight.clamp(self.min_weight, self.max_weight);
        self.qd_weight = self.qd_weight.clamp(self.min_weight, self.max_weight);
        if self.pa_weight > self.qd_weight * self.ratio_ceiling {
            self.pa_weight = self.qd_weight * self.ratio_ceiling;
        }
        let total = self.pa_weight + self.qd_weight;
        self.pa_weight /= total;
        self.qd_weight /= total;
        trace!(
            pa = self.pa_weight,
            qd = self.qd_weight,
            rate,
            "epoch weights adjusted"
        );
        self.requests_in_epoch = 0;
        self.rejections_in_epoch = 0;
    }
}

impl RoutingPolicy for EpochAdaptive {
    fn name(&self) -> &'static str {
        "epoch-adaptive"
    }

    fn route(&mut self, request: &Request, state: &RouterState) -> RoutingDecision {
        self.requests_in_epoch += 1;
        if self.requests_in_epoch >= self.epoch_length {
            self.end_epoch();
        }

        let pa = PrefixAffinityScorer.score(request, state);
        let qd = QueueDepthScorer.score(request, state);
        let combined: Vec<f64> = pa
            .iter()
            .zip(&qd)
            .map(|(p, q)| {
                p.clamp(0.0, 1.0) * self.pa_weight + q.clamp(0.0, 1.0) * self.qd_weight
            })
            .collect();
        let idx = argmax(&combined);
        RoutingDecision {
            target: state.snapshots[idx].id,
            reason: format!(
                "epoch-adaptive (pa {:.2}, qd {:.2})",
                self.pa_weight, self.qd_weight
            ),
            scores: Some(
                state
                    .snapshots
                    .iter()
                    .zip(&combined)
                    .map(|(s, &v)| (s.id, v))
                    .collect(),
            ),
            priority: 0.0,
        }
    }

    fn rejection_observer(&mut self) -> Option<&mut dyn RejectionObserver> {
        Some(self)
    }
}

impl RejectionObserver for EpochAdaptive {
    fn on_rejection(&mut self, _request: &Request, _reason: &str) {
        self.rejections_in_epoch += 1;
    }
}
