//! Admission policies.

use super::AdmissionPolicy;
use crate::cluster::RouterState;
use crate::request::{Request, SloClass};
use crate::types::{Tick, TICKS_PER_SEC};

/// Outcome of an admission check: a verdict plus a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub admit: bool,
    pub reason: String,
}

impl AdmissionDecision {
    pub fn admit(reason: &str) -> Self {
        Self {
            admit: true,
            reason: reason.to_string(),
        }
    }

    pub fn reject(reason: &str) -> Self {
        Self {
            admit: false,
            reason: reason.to_string(),
        }
    }
}

/// Let everything in.
pub struct AlwaysAdmit;

impl AdmissionPolicy for AlwaysAdmit {
    fn name(&self) -> &'static str {
        "always"
    }

    fn admit(&mut self, _request: &Request, _state: &RouterState) -> AdmissionDecision {
        AdmissionDecision::admit("always")
    }
}

/// Pathological template: let nothing in.
pub struct RejectAll;

impl AdmissionPolicy for RejectAll {
    fn name(&self) -> &'static str {
        "reject-all"
    }

    fn admit(&mut self, _request: &Request, _state: &RouterState) -> AdmissionDecision {
        AdmissionDecision::reject("reject-all")
    }
}

/// Classic token bucket over input tokens: capacity `C`, refill `R`
/// tokens/sec, cost = prompt length.
pub struct TokenBucket {
    capacity: f64,
    refill_per_tick: f64,
    tokens: f64,
    last_refill: Tick,
}

impl TokenBucket {
    /// `refill_rate` is tokens per second; converted here, at the boundary.
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_per_tick: refill_rate / TICKS_PER_SEC,
            tokens: capacity,
            last_refill: 0,
        }
    }

    fn refill(&mut self, now: Tick) {
        let elapsed = now.saturating_sub(self.last_refill) as f64;
        self.tokens = (self.tokens + elapsed * self.refill_per_tick).min(self.capacity);
        self.last_refill = now;
    }
}

impl AdmissionPolicy for TokenBucket {
    fn name(&self) -> &'static str {
        "token-bucket"
    }

    fn admit(&mut self, request: &Request, state: &RouterState) -> AdmissionDecision {
        self.refill(state.clock);
        let cost = request.input_len() as f64;
        if self.tokens >= cost {
            self.tokens -= cost;
            AdmissionDecision::admit("token-bucket")
        } else {
            AdmissionDecision::reject("token-bucket-exhausted")
        }
    }
}

/// Queue-depth gates per SLO class: critical always passes, standard below
/// one threshold, everything sheddable below a stricter one.
pub struct SloGated {
    pub standard_queue_threshold: usize,
    pub sheddable_queue_threshold: usize,
}

impl Default for SloGated {
    fn default() -> Self {
        Self {
            standard_queue_threshold: 64,
            sheddable_queue_threshold: 16,
        }
    }
}

impl SloGated {
    pub fn new(standard: usize, sheddable: usize) -> Self {
        assert!(
            sheddable <= standard,
            "sheddable threshold must not exceed standard"
        );
        Self {
            standard_queue_threshold: standard,
            sheddable_queue_threshold: sheddable,
        }
    }
}

impl AdmissionPolicy for SloGated {
    fn name(&self) -> &'static str {
        "slo-gated"
    }

    fn admit(&mut self, request: &Request, state: &RouterState) -> AdmissionDecision {
        let max_depth = state
            .snapshots
            .iter()
            .map(|s| s.queue_depth)
            .max()
            .unwrap_or(0);
        match request.slo_class {
            SloClass::Critical => AdmissionDecision::admit("critical"),
            SloClass::Standard | SloClass::Unspecified => {
                if max_depth < self.standard_queue_threshold {
                    AdmissionDecision::admit("below-standard-threshold")
                } else {
                    AdmissionDecision::reject("standard-queue-threshold")
                }
            }
            SloClass::Sheddable | SloClass::Batch | SloClass::Background => {
                if max_depth < self.sheddable_queue_threshold {
                    AdmissionDecision::admit("below-sheddable-threshold")
                } else {
                    AdmissionDecision::reject("sheddable-queue-threshold")
                }
            }
        }
    }
}

/// Predicts the best-case TTFT across the fleet and admits only when the
/// request's class budget covers it. Prefixes nobody has seen bypass the
/// check so cold caches don't starve the cluster.
pub struct PredictiveSlo {
    /// TTFT budgets in ticks, per class. Zero or non-finite disables the gate
    /// for that class.
    pub budget_standard: f64,
    pub budget_sheddable: f64,
    pub budget_batch: f64,
    pub budget_background: f64,
    pub headroom: f64,
    /// Prefill-cost regression over cache-miss tokens.
    pub beta0: f64,
    pub beta1: f64,
    /// Observed mean step time, ticks.
    pub avg_step_time: f64,
    /// Decode slots per scheduling round.
    pub batch_capacity: usize,
}

impl Default for PredictiveSlo {
    fn default() -> Self {
        Self {
            budget_standard: 120_000.0,
            budget_sheddable: 300_000.0,
            budget_batch: 1_000_000.0,
            budget_background: 5_000_000.0,
            headroom: 1.0,
            beta0: 6_910.0,
            beta1: 17.67,
            avg_step_time: 7_000.0,
            batch_capacity: 32,
        }
    }
}

impl PredictiveSlo {
    fn budget_for(&self, class: SloClass) -> f64 {
        match class {
            SloClass::Critical => f64::INFINITY,
            SloClass::Standard | SloClass::Unspecified => self.budget_standard,
            SloClass::Sheddable => self.budget_sheddable,
            SloClass::Batch => self.budget_batch,
            SloClass::Background => self.budget_background,
        }
    }

    fn estimated_ttft(&self, request: &Request, state: &RouterState) -> f64 {
        state
            .snapshots
            .iter()
            .map(|snap| {
                let matched = state
                    .prefix_index
                    .match_length(&request.prefix_hashes, snap.id);
                let miss_tokens = request
                    .input_len()
                    .saturating_sub(matched * state.prefix_index.block_size())
                    as f64;
                let rounds = snap.queue_depth.div_ceil(self.batch_capacity.max(1)) as f64;
                rounds * self.avg_step_time + self.beta0 + self.beta1 * miss_tokens
            })
            .fold(f64::INFINITY, f64::min)
    }
}

impl AdmissionPolicy for PredictiveSlo {
    fn name(&self) -> &'static str {
        "predictive-slo"
    }

    fn admit(&mut self, request: &Request, state: &RouterState) -> AdmissionDecision {
        if request.slo_class == SloClass::Critical {
            return AdmissionDecision::admit("critical");
        }
        let seen_anywhere = state.snapshots.iter().any(|snap| {
            state
                .prefix_index
                .match_length(&request.prefix_hashes, snap.id)
                > 0
        });
        if !seen_anywhere {
            return AdmissionDecision::admit("cold-start-bypass");
        }
        let budget = self.budget_for(request.slo_class);
        // Degenerate budgets admit rather than crash.
        if !(budget > 0.0) || budget.is_infinite() || budget.is_nan() {
            return AdmissionDecision::admit("unbounded-budget");
        }
        let estimate = self.estimated_ttft(request, state);
        if estimate <= budget * self.headroom {
            AdmissionDecision::admit("predicted-within-budget")
        } else {
            AdmissionDecision::reject("predicted-ttft-exceeds-budget")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{InstanceSnapshot, PrefixCacheIndex};
    use crate::hash;

    fn snapshot(id: usize, queue_depth: usize) -> InstanceSnapshot {
        InstanceSnapshot {
            id,
            queue_depth,
            batch_size: 0,
            kv_utilization: 0.0,
            free_blocks: 1000,
            pending_requests: 0,
            cache_hit_rate: None,
        }
    }

    fn request(class: SloClass, input: usize) -> Request {
        let tokens: Vec<u32> = (0..input as u32).collect();
        let mut r = Request::new("r".into(), 0, tokens, vec![1], class, None);
        r.prefix_hashes = hash::block_hashes(r.input_tokens(), 16);
        r
    }

    fn state<'a>(
        snapshots: &'a [InstanceSnapshot],
        index: &'a PrefixCacheIndex,
        clock: Tick,
    ) -> RouterState<'a> {
        RouterState {
            snapshots,
            clock,
            prefix_index: index,
        }
    }

    #[test]
    fn slo_gate_thresholds() {
        let index = PrefixCacheIndex::new(16, 64);
        let mut snaps: Vec<InstanceSnapshot> = (0..8).map(|i| snapshot(i, 0)).collect();
        snaps[3].queue_depth = 6;
        let mut policy = SloGated::new(10, 5);

        let st = state(&snaps, &index, 0);
        let mut p = |class| policy.admit(&request(class, 16), &st).admit;
        assert!(!p(SloClass::Sheddable));
        assert!(p(SloClass::Standard));
        assert!(p(SloClass::Critical));
    }

    #[test]
    fn token_bucket_exhausts_and_refills() {
        let index = PrefixCacheIndex::new(16, 64);
        let snaps = vec![snapshot(0, 0)];
        let mut policy = TokenBucket::new(100.0, 1_000_000.0);

        let st0 = state(&snaps, &index, 0);
        assert!(policy.admit(&request(SloClass::Standard, 80), &st0).admit);
        assert!(!policy.admit(&request(SloClass::Standard, 80), &st0).admit);

        // One second later the bucket is full again.
        let st1 = state(&snaps, &index, 1_000_000);
        assert!(policy.admit(&request(SloClass::Standard, 80), &st1).admit);
    }

    #[test]
    fn predictive_cold_start_bypasses() {
        let index = PrefixCacheIndex::new(16, 64);
        let snaps: Vec<InstanceSnapshot> = (0..2).map(|i| snapshot(i, 1_000)).collect();
        let mut policy = PredictiveSlo {
            budget_sheddable: 300_000.0,
            headroom: 1.0,
            beta0: 6_910.0,
            beta1: 17.67,
            avg_step_time: 7_000.0,
            ..Default::default()
        };
        let st = state(&snaps, &index, 0);
        let decision = policy.admit(&request(SloClass::Sheddable, 100), &st);
        assert!(decision.admit);
        assert_eq!(decision.reason, "cold-start-bypass");
    }

    #[test]
    fn predictive_gates_warm_prefixes_by_budget() {
        let mut index = PrefixCacheIndex::new(16, 64);
        let req = request(SloClass::Sheddable, 100);
        index.record_blocks(&req.prefix_hashes[..2], 0);

        let mut policy = PredictiveSlo {
            budget_sheddable: 300_000.0,
            avg_step_time: 7_000.0,
            batch_capacity: 32,
            ..Default::default()
        };

        // Shallow queues: estimate well under budget.
        let snaps = vec![snapshot(0, 4), snapshot(1, 4)];
        let st = state(&snaps, &index, 0);
        assert!(policy.admit(&req, &st).admit);

        // Deep queues push the estimate past the budget.
        let snaps = vec![snapshot(0, 2_000), snapshot(1, 2_000)];
        let st = state(&snaps, &index, 0);
        let decision = policy.admit(&req, &st);
        assert!(!decision.admit);
        assert_eq!(decision.reason, "predicted-ttft-exceeds-budget");
    }

    #[test]
    fn degenerate_budget_admits() {
        let mut index = PrefixCacheIndex::new(16, 64);
        let req = request(SloClass::Sheddable, 100);
        index.record_blocks(&req.prefix_hashes[..1], 0);
        let snaps = vec![snapshot(0, 100_000)];
        let mut policy = PredictiveSlo {
            budget_sheddable: f64::NAN,
            ..Default::default()
        };
        let st = state(&snaps, &index, 0);
        assert!(policy.admit(&req, &st).admit);
    }

    #[test]
    fn reject_all_rejects() {
        let index = PrefixCacheIndex::new(16, 64);
        let snaps = vec![snapshot(0, 0)];
        let st = state(&snaps, &index, 0);
        assert!(!RejectAll.admit(&request(SloClass::Critical, 4), &st).admit);
    }
}
