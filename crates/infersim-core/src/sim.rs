//! The simulator: one event loop driving the cluster to a horizon.

use std::sync::Arc;

use tracing::{info, trace};

use crate::cluster::{Cluster, DispatchOutcome};
use crate::config::{PolicyBundle, SimConfig};
use crate::error::Result;
use crate::event::{EventKind, EventQueue};
use crate::latency::LatencyModel;
use crate::metrics::SimReport;
use crate::request::Request;
use crate::types::Tick;

pub struct Simulator {
    events: EventQueue,
    cluster: Cluster,
    horizon: Tick,
    report: SimReport,
}

impl Simulator {
    pub fn new(cluster: Cluster, horizon: Tick) -> Self {
        Self {
            events: EventQueue::new(),
            cluster,
            horizon,
            report: SimReport::default(),
        }
    }

    /// Build cluster and simulator straight from configuration.
    pub fn from_config(
        config: &SimConfig,
        bundle: &PolicyBundle,
        latency: Arc<dyn LatencyModel>,
    ) -> Result<Self> {
        let cluster = Cluster::build(config, bundle, latency)?;
        Ok(Self::new(cluster, config.horizon))
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Schedule arrivals for a batch of workload requests.
    pub fn inject(&mut self, requests: Vec<Request>) {
        for request in requests {
            self.events
                .schedule(request.arrival_time(), EventKind::Arrival(Box::new(request)));
        }
    }

    /// Run to the horizon and produce the report. Events scheduled past the
    /// horizon stay unexecuted; the clock rests at the last executed event.
    pub fn run(mut self) -> SimReport {
        while let Some(event) = self.events.pop_due(self.horizon) {
            match event.kind {
                EventKind::Arrival(request) => {
                    trace!(request = request.id(), at = event.at, "arrival");
                    match self.cluster.dispatch(*request, &mut self.events) {
                        DispatchOutcome::Routed { .. } => {}
                        DispatchOutcome::Rejected(record) => self.report.rejected.push(record),
                    }
                }
                EventKind::Queued { instance, request } => {
                    self.cluster
                        .handle_queued(instance, *request, &mut self.events);
                }
                EventKind::Step { instance } => {
                    self.cluster.handle_step(instance, event.at, &mut self.events);
                }
                EventKind::Completion(metrics) => {
                    trace!(request = metrics.id.as_str(), at = event.at, "completion");
                    self.report.completed.push(*metrics);
                }
                // Observability hooks.
                EventKind::Scheduled {
                    instance,
                    request_id,
                } => trace!(instance, request = request_id.as_str(), "scheduled"),
                EventKind::Preemption {
                    instance,
                    request_id,
                } => trace!(instance, request = request_id.as_str(), "preempted"),
                EventKind::RequestLeft {
                    instance,
                    request_id,
                } => trace!(instance, request = request_id.as_str(), "request left"),
                EventKind::Rejection {
                    request_id, reason, ..
                } => trace!(request = request_id.as_str(), reason = reason.as_str(), "rejected"),
            }
        }
        self.report.final_clock = self.events.clock();
        self.report.steps_executed = self.cluster.steps_executed();
        self.report.preemptions = self.cluster.preemption_count();
        info!(
            completed = self.report.completed.len(),
            rejected = self.report.rejected.len(),
            final_clock = self.report.final_clock,
            "run finished"
        );
        self.report
    }
}
