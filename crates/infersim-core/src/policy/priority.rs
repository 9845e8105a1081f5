//! Request priority policies, recomputed for every queued request each step.

use super::{PriorityContext, PriorityPolicy};
use crate::request::{Request, SloClass};
use crate::types::Tick;

fn class_base(class: SloClass) -> f64 {
    match class {
        SloClass::Critical => 1000.0,
        SloClass::Standard | SloClass::Unspecified => 100.0,
        SloClass::Sheddable => 10.0,
        SloClass::Batch => 5.0,
        SloClass::Background => 1.0,
    }
}

fn age_ticks(request: &Request, now: Tick) -> f64 {
    now.saturating_sub(request.arrival_time()) as f64
}

/// Fixed score for every request.
pub struct Constant {
    pub value: f64,
}

impl Default for Constant {
    fn default() -> Self {
        Self { value: 1.0 }
    }
}

impl PriorityPolicy for Constant {
    fn name(&self) -> &'static str {
        "constant"
    }

    fn compute(&self, _request: &Request, _now: Tick, _ctx: &PriorityContext) -> f64 {
        self.value
    }
}

/// Class base plus linear ageing: `base + age · age_weight`.
pub struct SloBased {
    pub age_weight: f64,
}

impl Default for SloBased {
    fn default() -> Self {
        // One base-unit of boost per millisecond queued.
        Self { age_weight: 1e-3 }
    }
}

impl PriorityPolicy for SloBased {
    fn name(&self) -> &'static str {
        "slo"
    }

    fn compute(&self, request: &Request, now: Tick, _ctx: &PriorityContext) -> f64 {
        class_base(request.slo_class) + age_ticks(request, now) * self.age_weight
    }
}

/// Pathological template: the SLO ordering turned upside down.
pub struct InvertedSlo;

impl PriorityPolicy for InvertedSlo {
    fn name(&self) -> &'static str {
        "inverted-slo"
    }

    fn compute(&self, request: &Request, _now: Tick, _ctx: &PriorityContext) -> f64 {
        -class_base(request.slo_class)
    }
}

/// Class base plus piecewise-linear urgency once a class-specific queueing
/// deadline has been eaten into.
pub struct SloTiered {
    pub urgency_slope: f64,
}

impl Default for SloTiered {
    fn default() -> Self {
        Self { urgency_slope: 1e-2 }
    }
}

impl SloTiered {
    /// Age after which a class starts accruing urgency, in ticks.
    fn urgency_threshold(class: SloClass) -> f64 {
        match class {
            SloClass::Critical => 10_000.0,
            SloClass::Standard | SloClass::Unspecified => 100_000.0,
            SloClass::Sheddable => 500_000.0,
            SloClass::Batch => 2_000_000.0,
            SloClass::Background => 10_000_000.0,
        }
    }

    fn score(&self, request: &Request, now: Tick) -> f64 {
        let age = age_ticks(request, now);
        let over = (age - Self::urgency_threshold(request.slo_class)).max(0.0);
        class_base(request.slo_class) + over * self.urgency_slope
    }
}

impl PriorityPolicy for SloTiered {
    fn name(&self) -> &'static str {
        "slo-tiered"
    }

    fn compute(&self, request: &Request, now: Tick, _ctx: &PriorityContext) -> f64 {
        self.score(request, now)
    }
}

/// SLO-tiered score scaled with instance queue depth: no boost below
/// `low_depth`, full boost at `high_depth`, linear in between.
pub struct LoadAdaptive {
    pub tiered: SloTiered,
    pub low_depth: usize,
    pub high_depth: usize,
    pub max_boost: f64,
}

impl Default for LoadAdaptive {
    fn default() -> Self {
        Self {
            tiered: SloTiered::default(),
            low_depth: 4,
            high_depth: 64,
            max_boost: 4.0,
        }
    }
}

impl PriorityPolicy for LoadAdaptive {
    fn name(&self) -> &'static str {
        "load-adaptive"
    }

    fn compute(&self, request: &Request, now: Tick, ctx: &PriorityContext) -> f64 {
        let base = self.tiered.score(request, now);
        let depth = ctx.queue_depth as f64;
        let low = self.low_depth as f64;
        let high = self.high_depth as f64;
        let fraction = if high <= low {
            1.0
        } else {
            ((depth - low) / (high - low)).clamp(0.0, 1.0)
        };
        base * (1.0 + fraction * (self.max_boost - 1.0))
    }
}
