//! Pluggable admission, routing, priority and queue-ordering policies.
//!
//! Policies are trait objects built by name through the factories below;
//! unknown names fail fast at construction. Routing decisions score higher =
//! better and break ties on the lowest snapshot index.

pub mod admission;
pub mod priority;
pub mod queue;
pub mod routing;

pub use admission::AdmissionDecision;
pub use routing::RoutingDecision;

use std::collections::VecDeque;

use crate::cluster::RouterState;
use crate::config::{AdmissionSection, PrioritySection, RoutingSection};
use crate::error::{Error, Result};
use crate::request::Request;
use crate::types::Tick;

/// Gatekeeper consulted once per arrival.
pub trait AdmissionPolicy {
    fn name(&self) -> &'static str;

    fn admit(&mut self, request: &Request, state: &RouterState) -> AdmissionDecision;
}

/// Called by the cluster on every admission rejection; routing policies that
/// learn online opt in via `RoutingPolicy::rejection_observer`.
pub trait RejectionObserver {
    fn on_rejection(&mut self, request: &Request, reason: &str);
}

/// Picks a target instance for an admitted request.
pub trait RoutingPolicy {
    fn name(&self) -> &'static str;

    fn route(&mut self, request: &Request, state: &RouterState) -> RoutingDecision;

    /// Feature detection for online learning; the default opts out.
    fn rejection_observer(&mut self) -> Option<&mut dyn RejectionObserver> {
        None
    }
}

/// One dimension of a weighted-scoring routing pipeline. Returns one score
/// per snapshot, clamped to [0, 1] by the caller.
pub trait Scorer {
    fn name(&self) -> &'static str;

    fn score(&self, request: &Request, state: &RouterState) -> Vec<f64>;
}

/// Instance-side context handed to priority computation.
#[derive(Debug, Clone, Copy)]
pub struct PriorityContext {
    pub queue_depth: usize,
    pub batch_size: usize,
}

/// Recomputes a request's priority score each step.
pub trait PriorityPolicy {
    fn name(&self) -> &'static str;

    fn compute(&self, request: &Request, now: Tick, ctx: &PriorityContext) -> f64;
}

/// Orders the wait queue in place each step. Length-preserving.
pub trait InstanceScheduler {
    fn name(&self) -> &'static str;

    fn order_queue(&self, queue: &mut VecDeque<Request>, now: Tick);
}

/// Build an admission policy from its bundle section. Empty name selects the
/// default (`always`).
pub fn build_admission(section: &AdmissionSection) -> Result<Box<dyn AdmissionPolicy>> {
    match section.policy.as_str() {
        "" | "always" => Ok(Box::new(admission::AlwaysAdmit)),
        "token-bucket" => {
            let capacity = section.token_bucket_capacity.ok_or_else(|| {
                Error::ConfigError("token-bucket admission requires token_bucket_capacity".into())
            })?;
            let refill = section.token_bucket_refill_rate.ok_or_else(|| {
                Error::ConfigError(
                    "token-bucket admission requires token_bucket_refill_rate".into(),
                )
            })?;
            Ok(Box::new(admission::TokenBucket::new(capacity, refill)))
        }
        "slo-gated" => Ok(Box::new(admission::SloGated::default())),
        "predictive-slo" => Ok(Box::new(admission::PredictiveSlo::default())),
        "reject-all" => Ok(Box::new(admission::RejectAll)),
        other => Err(Error::UnknownPolicy(format!("admission '{other}'"))),
    }
}

/// Build a routing policy from its bundle section. Empty name selects the
/// default (`round-robin`).
pub fn build_routing(section: &RoutingSection) -> Result<Box<dyn RoutingPolicy>> {
    match section.policy.as_str() {
        "" | "round-robin" => Ok(Box::new(routing::RoundRobin::new())),
        "least-loaded" => Ok(Box::new(routing::LeastLoaded)),
        "weighted" => {
            let specs = section.scorers.as_deref().unwrap_or_default();
            Ok(Box::new(routing::WeightedScoring::from_specs(specs)?))
        }
        "prefix-affinity" => Ok(Box::new(routing::PrefixAffinity::new())),
        "adaptive-weighted" => Ok(Box::new(routing::AdaptiveWeighted::default())),
        "epoch-adaptive" => Ok(Box::new(routing::EpochAdaptive::default())),
        other => Err(Error::UnknownPolicy(format!("routing '{other}'"))),
    }
}

/// Build a scorer by name for weighted-scoring pipelines.
pub fn build_scorer(name: &str) -> Result<Box<dyn Scorer>> {
    match name {
        "queue-depth" => Ok(Box::new(routing::QueueDepthScorer)),
        "kv-utilization" => Ok(Box::new(routing::KvUtilizationScorer)),
        "load-balance" => Ok(Box::new(routing::LoadBalanceScorer)),
        "prefix-affinity" => Ok(Box::new(routing::PrefixAffinityScorer)),
        other => Err(Error::UnknownPolicy(format!("scorer '{other}'"))),
    }
}

/// Build a priority policy. Empty name selects the default (`constant`).
pub fn build_priority(section: &PrioritySection) -> Result<Box<dyn PriorityPolicy>> {
    match section.policy.as_str() {
        "" | "constant" => Ok(Box::new(priority::Constant::default())),
        "slo" => Ok(Box::new(priority::SloBased::default())),
        "inverted-slo" => Ok(Box::new(priority::InvertedSlo)),
        "slo-tiered" => Ok(Box::new(priority::SloTiered::default())),
        "load-adaptive" => Ok(Box::new(priority::LoadAdaptive::default())),
        other => Err(Error::UnknownPolicy(format!("priority '{other}'"))),
    }
}

/// Build an instance scheduler. Empty name selects the default (`fcfs`).
pub fn build_scheduler(name: &str) -> Result<Box<dyn InstanceScheduler>> {
    match name {
        "" | "fcfs" => Ok(Box::new(queue::Fcfs)),
        "priority-fcfs" => Ok(Box::new(queue::PriorityFcfs)),
        "sjf" => Ok(Box::new(queue::Sjf)),
        "reverse-priority" => Ok(Box::new(queue::ReversePriority)),
        other => Err(Error::UnknownPolicy(format!("scheduler '{other}'"))),
    }
}
