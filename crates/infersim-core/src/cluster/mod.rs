//! Cluster-level routing.
//!
//! The cluster owns the instances, the shared prefix-cache index and the
//! admission/routing policies. Every arrival flows through `dispatch`:
//! snapshot the fleet, consult admission, pick a target, hand the request to
//! that instance and record its prefix hashes in the index.

pub mod prefix_index;

pub use prefix_index::PrefixCacheIndex;

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{PolicyBundle, SimConfig};
use crate::engine::Instance;
use crate::error::Result;
use crate::event::{EventKind, EventQueue};
use crate::latency::LatencyModel;
use crate::metrics::RejectionRecord;
use crate::policy::{self, AdmissionPolicy, RoutingPolicy};
use crate::request::Request;
use crate::types::{InstanceId, Tick};

/// Synchronous, read-only projection of one instance's routable state.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub queue_depth: usize,
    pub batch_size: usize,
    pub kv_utilization: f64,
    pub free_blocks: usize,
    /// Requests routed here whose enqueue has not yet executed.
    pub pending_requests: usize,
    pub cache_hit_rate: Option<f64>,
}

impl InstanceSnapshot {
    /// The canonical load metric for routing.
    pub fn effective_load(&self) -> usize {
        self.queue_depth + self.batch_size + self.pending_requests
    }
}

/// Fleet state handed to policies; immutable from their perspective.
pub struct RouterState<'a> {
    pub snapshots: &'a [InstanceSnapshot],
    pub clock: Tick,
    pub prefix_index: &'a PrefixCacheIndex,
}

/// What `dispatch` did with an arrival.
#[derive(Debug)]
pub enum DispatchOutcome {
    Routed {
        target: InstanceId,
        reason: String,
    },
    Rejected(RejectionRecord),
}

pub struct Cluster {
    instances: Vec<Instance>,
    admission: Box<dyn AdmissionPolicy>,
    routing: Box<dyn RoutingPolicy>,
    prefix_index: PrefixCacheIndex,
}

impl Cluster {
    /// Build the fleet from configuration. Policy names are resolved here and
    /// unknown ones fail fast.
    pub fn build(
        config: &SimConfig,
        bundle: &PolicyBundle,
        latency: Arc<dyn LatencyModel>,
    ) -> Result<Self> {
        config.validate()?;
        bundle.validate()?;
        let mut instances = Vec::with_capacity(config.num_instances);
        for id in 0..config.num_instances {
            instances.push(Instance::new(
                id,
                &config.kv,
                &config.batch,
                policy::build_scheduler(&bundle.scheduler)?,
                policy::build_priority(&bundle.priority)?,
                Arc::clone(&latency),
            ));
        }
        let admission = policy::build_admission(&bundle.admission)?;
        let routing = policy::build_routing(&bundle.routing)?;
        info!(
            instances = config.num_instances,
            admission = admission.name(),
            routing = routing.name(),
            "cluster ready"
        );
        Ok(Self {
            instances,
            admission,
            routing,
            prefix_index: PrefixCacheIndex::new(config.kv.block_size, config.prefix_index_capacity),
        })
    }

    /// Assemble a cluster from parts; used by tests and custom harnesses.
    pub fn from_parts(
        instances: Vec<Instance>,
        admission: Box<dyn AdmissionPolicy>,
        routing: Box<dyn RoutingPolicy>,
        prefix_index: PrefixCacheIndex,
    ) -> Self {
        Self {
            instances,
            admission,
            routing,
            prefix_index,
        }
    }

    pub fn num_instances(&self) -> usize {
        self.instances.len()
    }

    pub fn instance(&self, id: InstanceId) -> &Instance {
        &self.instances[id]
    }

    pub fn prefix_index(&self) -> &PrefixCacheIndex {
        &self.prefix_index
    }

    pub fn snapshots(&self) -> Vec<InstanceSnapshot> {
        self.instances.iter().map(Instance::snapshot).collect()
    }

    /// Admit and route one arrival.
    pub fn dispatch(&mut self, mut request: Request, events: &mut EventQueue) -> DispatchOutcome {
        let clock = events.clock();
        // The hash chain is computed exactly once per arrival; every consumer
        // (admission scoring, routing scorers, the index, instance KV
        // allocation) reads it from the request.
        request.prefix_hashes = self
            .prefix_index
            .compute_block_hashes(request.input_tokens());

        let snapshots = self.snapshots();
        let state = RouterState {
            snapshots: &snapshots,
            clock,
            prefix_index: &self.prefix_index,
        };

        let admission = self.admission.admit(&request, &state);
        if !admission.admit {
            debug!(
                request = request.id(),
                reason = admission.reason.as_str(),
                "rejected"
            );
            if let Some(observer) = self.routing.rejection_observer() {
                observer.on_rejection(&request, &admission.reason);
            }
            events.schedule(
                clock,
                EventKind::Rejection {
                    request_id: request.id().to_string(),
                    class: request.slo_class,
                    reason: admission.reason.clone(),
                },
            );
            return DispatchOutcome::Rejected(RejectionRecord {
                id: request.id().to_string(),
                slo_class: request.slo_class,
                reason: admission.reason,
                at: clock,
            });
        }

        let decision = self.routing.route(&request, &state);
        let target = decision.target;
        assert!(target < self.instances.len(), "routed to unknown instance");
        debug!(
            request = request.id(),
            target,
            reason = decision.reason.as_str(),
            "routed"
        );

        request.assigned_instance = Some(target);
        if decision.priority != 0.0 {
            request.priority = decision.priority;
        }
        self.instances[target].note_routed();
        self.prefix_index
            .record_blocks(&request.prefix_hashes, target);
        events.schedule(
            clock,
            EventKind::Queued {
                instance: target,
                request: Box::new(request),
            },
        );
        DispatchOutcome::Routed {
            target,
            reason: decision.reason,
        }
    }

    /// A `Queued` event landed: enqueue and make sure a step is coming.
    pub fn handle_queued(&mut self, instance: InstanceId, request: Request, events: &mut EventQueue) {
        let inst = &mut self.instances[instance];
        inst.enqueue(request);
        if inst.arm_step() {
            events.schedule(events.clock(), EventKind::Step { instance });
        }
    }

    /// A `Step` event landed.
    pub fn handle_step(&mut self, instance: InstanceId, now: Tick, events: &mut EventQueue) {
        self.instances[instance].step(now, events);
    }

    /// Total preemptions across the fleet.
    pub fn preemption_count(&self) -> u64 {
        self.instances.iter().map(Instance::preemption_count).sum()
    }

    /// Total steps across the fleet.
    pub fn steps_executed(&self) -> u64 {
        self.instances.iter().map(Instance::steps_executed).sum()
    }
}
