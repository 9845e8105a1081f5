//! Per-instance execution engine.
//!
//! Each instance owns a wait queue, a running batch and a KV cache, and
//! advances through `Step` events: refresh priorities, order the queue, form
//! a batch under token/slot/KV budgets (preempting from the running tail when
//! blocks run out), price the step, emit tokens, complete requests and re-arm
//! the next step while work remains.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::cluster::InstanceSnapshot;
use crate::config::{BatchConfig, KvConfig};
use crate::engine::kv_cache::KvCache;
use crate::event::{EventKind, EventQueue};
use crate::latency::{BatchComposition, LatencyModel};
use crate::metrics::RequestMetrics;
use crate::policy::{InstanceScheduler, PriorityContext, PriorityPolicy};
use crate::request::Request;
use crate::types::{InstanceId, Tick};

pub struct Instance {
    id: InstanceId,
    kv: KvCache,
    wait_queue: VecDeque<Request>,
    /// Running batch in admission order; the tail is the preemption victim.
    running: Vec<Request>,
    scheduler: Box<dyn InstanceScheduler>,
    priority: Box<dyn PriorityPolicy>,
    latency: Arc<dyn LatencyModel>,
    max_running_reqs: usize,
    max_scheduled_tokens: usize,
    /// A `Step` event is already on the queue.
    step_pending: bool,
    /// Requests routed here whose `Queued` event has not yet executed.
    pending_routed: usize,

    steps_executed: u64,
    preemption_count: u64,
    input_tokens_seen: u64,
    cached_prefix_tokens_seen: u64,
}

impl Instance {
    pub fn new(
        id: InstanceId,
        kv_config: &KvConfig,
        batch_config: &BatchConfig,
        scheduler: Box<dyn InstanceScheduler>,
        priority: Box<dyn PriorityPolicy>,
        latency: Arc<dyn LatencyModel>,
    ) -> Self {
        Self {
            id,
            kv: KvCache::new(kv_config.total_blocks, kv_config.block_size),
            wait_queue: VecDeque::new(),
            running: Vec::new(),
            scheduler,
            priority,
            latency,
            max_running_reqs: batch_config.max_running_reqs,
            max_scheduled_tokens: batch_config.max_scheduled_tokens,
            step_pending: false,
            pending_routed: 0,
            steps_executed: 0,
            preemption_count: 0,
            input_tokens_seen: 0,
            cached_prefix_tokens_seen: 0,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn kv(&self) -> &KvCache {
        &self.kv
    }

    pub fn wait_queue(&self) -> &VecDeque<Request> {
        &self.wait_queue
    }

    pub fn running(&self) -> &[Request] {
        &self.running
    }

    pub fn steps_executed(&self) -> u64 {
        self.steps_executed
    }

    pub fn preemption_count(&self) -> u64 {
        self.preemption_count
    }

    /// Synchronous projection of routable state.
    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.id,
            queue_depth: self.wait_queue.len(),
            batch_size: self.running.len(),
            kv_utilization: self.kv.utilization(),
            free_blocks: self.kv.free_blocks(),
            pending_requests: self.pending_routed,
            cache_hit_rate: if self.input_tokens_seen > 0 {
                Some(self.cached_prefix_tokens_seen as f64 / self.input_tokens_seen as f64)
            } else {
                None
            },
        }
    }

    /// Router dispatched a request here; its `Queued` event is in flight.
    pub fn note_routed(&mut self) {
        self.pending_routed += 1;
    }

    /// The `Queued` event landed: move the request onto the wait queue.
    pub fn enqueue(&mut self, request: Request) {
        assert!(self.pending_routed > 0, "enqueue without a routed request");
        self.pending_routed -= 1;
        self.wait_queue.push_back(request);
    }

    /// Whether a `Step` event needs scheduling; marks it pending if so.
    pub fn arm_step(&mut self) -> bool {
        if self.step_pending {
            false
        } else {
            self.step_pending = true;
            true
        }
    }

    /// Execute one engine step at simulated time `now`.
    pub fn step(&mut self, now: Tick, events: &mut EventQueue) {
        self.step_pending = false;
        self.steps_executed += 1;

        self.refresh_priorities(now);
        self.scheduler.order_queue(&mut self.wait_queue, now);

        let (preempted, deferred) = self.form_batch(now, events);

        // Preempted requests go back to the front (latest eviction first),
        // ahead of the candidates that were skipped, ahead of the rest.
        for r in deferred.into_iter().rev() {
            self.wait_queue.push_front(r);
        }
        for r in preempted {
            self.wait_queue.push_front(r);
        }

        let composition = self.composition();
        let dt = self.latency.step_time(&composition).max(1);
        let end = now + dt;
        trace!(
            instance = self.id,
            prefill = composition.prefill_tokens,
            decode = composition.decode_tokens,
            dt,
            "step"
        );

        self.apply_step(end, events);

        if !self.running.is_empty() || !self.wait_queue.is_empty() {
            self.step_pending = true;
            events.schedule(end, EventKind::Step { instance: self.id });
        }

        debug_assert!(self.kv.check_accounting(), "kv accounting violated");
    }

    fn refresh_priorities(&mut self, now: Tick) {
        let ctx = PriorityContext {
            queue_depth: self.wait_queue.len(),
            batch_size: self.running.len(),
        };
        for r in self.wait_queue.iter_mut() {
            r.priority = self.priority.compute(r, now, &ctx);
        }
    }

    /// Batch formation: keep running work, then admit wait-queue candidates
    /// until a budget runs out. Returns preempted requests in eviction order
    /// and skipped candidates in queue order.
    fn form_batch(
        &mut self,
        now: Tick,
        events: &mut EventQueue,
    ) -> (Vec<Request>, Vec<Request>) {
        let mut scheduled_tokens = 0usize;
        let mut preempted = Vec::new();
        let mut deferred = Vec::new();

        for r in self.running.iter_mut() {
            r.num_new_tokens = 0;
        }

        // Continuations for requests already in the batch.
        let mut i = 0;
        while i < self.running.len() {
            let avail = self.max_scheduled_tokens - scheduled_tokens;
            if avail == 0 {
                i += 1;
                continue;
            }
            let (progress, num_new, completes) = {
                let r = &self.running[i];
                let num_new = if r.in_prefill() {
                    r.remaining_prefill().min(avail)
                } else {
                    1
                };
                let completes = r.in_prefill() && num_new == r.remaining_prefill();
                (r.progress(), num_new, completes)
            };
            let target = progress + num_new + usize::from(completes);

            let mut admitted = false;
            loop {
                let r = &self.running[i];
                if self.kv.allocate(r, progress, target, &[]) {
                    admitted = true;
                    break;
                }
                if self.running.len() - 1 > i {
                    self.evict_tail(now, events, &mut scheduled_tokens, &mut preempted);
                } else {
                    break;
                }
            }
            if admitted {
                self.running[i].num_new_tokens = num_new;
                scheduled_tokens += num_new;
                i += 1;
            } else {
                // Not even the request's own continuation fits: evict it too.
                self.evict_tail(now, events, &mut scheduled_tokens, &mut preempted);
            }
        }

        // New work from the wait queue.
        while self.running.len() < self.max_running_reqs
            && scheduled_tokens < self.max_scheduled_tokens
        {
            let Some(mut cand) = self.wait_queue.pop_front() else {
                break;
            };

            if cand.progress() == 0 {
                let matched = self.kv.matched_blocks(&cand.prefix_hashes);
                let usable_blocks =
                    matched.min(cand.input_len().saturating_sub(1) / self.kv.block_size());
                if usable_blocks > 0 {
                    cand.set_cached_prefix(usable_blocks * self.kv.block_size());
                }
            }

            let avail = self.max_scheduled_tokens - scheduled_tokens;
            let num_new = if cand.in_prefill() {
                cand.remaining_prefill().min(avail)
            } else {
                1
            };
            let completes = cand.in_prefill() && num_new == cand.remaining_prefill();
            let target = cand.progress() + num_new + usize::from(completes);
            let covered_blocks =
                (cand.progress().min(cand.input_len()) / self.kv.block_size())
                    .min(cand.prefix_hashes.len());
            let shared = cand.prefix_hashes[..covered_blocks].to_vec();

            let mut admitted = false;
            loop {
                if self.kv.allocate(&cand, cand.progress(), target, &shared) {
                    admitted = true;
                    break;
                }
                if self.running.is_empty() {
                    break;
                }
                self.evict_tail(now, events, &mut scheduled_tokens, &mut preempted);
            }

            if admitted {
                // First admission feeds the cache-hit statistic exactly once.
                if cand.preemptions == 0 && cand.progress() == cand.cached_prefix_tokens {
                    self.input_tokens_seen += cand.input_len() as u64;
                    self.cached_prefix_tokens_seen += cand.cached_prefix_tokens as u64;
                }
                cand.num_new_tokens = num_new;
                scheduled_tokens += num_new;
                cand.set_running();
                events.schedule(
                    now,
                    EventKind::Scheduled {
                        instance: self.id,
                        request_id: cand.id().to_string(),
                    },
                );
                self.running.push(cand);
            } else {
                debug!(
                    instance = self.id,
                    request = cand.id(),
                    "kv blocks exhausted, request stays queued"
                );
                deferred.push(cand);
            }
        }

        (preempted, deferred)
    }

    /// Evict the running-batch tail: release its blocks in reverse order,
    /// refund its scheduled tokens and hand it back for re-queueing.
    fn evict_tail(
        &mut self,
        now: Tick,
        events: &mut EventQueue,
        scheduled_tokens: &mut usize,
        preempted: &mut Vec<Request>,
    ) {
        let mut victim = self.running.pop().expect("preemption needs a victim");
        *scheduled_tokens -= victim.num_new_tokens;
        victim.num_new_tokens = 0;
        self.kv.release(victim.id());
        victim.set_queued();
        self.preemption_count += 1;
        debug!(instance = self.id, request = victim.id(), "preempted");
        events.schedule(
            now,
            EventKind::Preemption {
                instance: self.id,
                request_id: victim.id().to_string(),
            },
        );
        preempted.push(victim);
    }

    fn composition(&self) -> BatchComposition {
        let mut comp = BatchComposition::default();
        for r in &self.running {
            if r.num_new_tokens == 0 {
                continue;
            }
            if r.in_prefill() {
                comp.prefill_tokens += r.num_new_tokens;
            } else {
                comp.decode_tokens += 1;
            }
            comp.context_tokens += r.progress() + r.num_new_tokens;
            comp.batch_size += 1;
        }
        comp
    }

    /// Advance every scheduled request by its step outcome and retire the
    /// finished ones.
    fn apply_step(&mut self, end: Tick, events: &mut EventQueue) {
        let mut idx = 0;
        while idx < self.running.len() {
            let r = &mut self.running[idx];
            if r.num_new_tokens == 0 {
                idx += 1;
                continue;
            }
            if r.in_prefill() {
                let completes = r.num_new_tokens == r.remaining_prefill();
                r.advance_progress(r.num_new_tokens);
                if completes {
                    r.mark_first_token(end);
                    if let Some(token) = r.next_output_token() {
                        let id = r.id().to_string();
                        r.decoded += 1;
                        r.advance_progress(1);
                        let appended = self.kv.append_token(&id, token);
                        assert!(appended, "emit slot was reserved at batch formation");
                    }
                }
            } else {
                let token = r.next_output_token().expect("decoding request has output left");
                let id = r.id().to_string();
                r.decoded += 1;
                r.advance_progress(1);
                let appended = self.kv.append_token(&id, token);
                assert!(appended, "emit slot was reserved at batch formation");
            }

            let r = &mut self.running[idx];
            if r.is_finished() {
                let mut done = self.running.remove(idx);
                done.complete();
                self.kv.release(done.id());
                let metrics = RequestMetrics::from_request(&done, self.id, end);
                events.schedule(
                    end,
                    EventKind::RequestLeft {
                        instance: self.id,
                        request_id: done.id().to_string(),
                    },
                );
                events.schedule(end, EventKind::Completion(Box::new(metrics)));
            } else {
                idx += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash;
    use crate::latency::BlackboxModel;
    use crate::policy;
    use crate::request::{RequestState, SloClass};

    const B: usize = 16;

    fn instance(total_blocks: usize, max_tokens: usize) -> Instance {
        let kv = KvConfig {
            total_blocks,
            block_size: B,
        };
        let batch = BatchConfig {
            max_running_reqs: 64,
            max_scheduled_tokens: max_tokens,
        };
        Instance::new(
            0,
            &kv,
            &batch,
            policy::build_scheduler("fcfs").unwrap(),
            policy::build_priority(&Default::default()).unwrap(),
            Arc::new(BlackboxModel::from_parts([100.0, 1.0, 100.0], 1000.0, 10.0, 5.0)),
        )
    }

    fn request(id: &str, input: usize, output: usize) -> Request {
        let tokens: Vec<u32> = (0..input as u32).map(|t| t + id.len() as u32 * 1000).collect();
        let mut r = Request::new(
            id.into(),
            0,
            tokens,
            (0..output as u32).map(|t| 50_000 + t).collect(),
            SloClass::Standard,
            None,
        );
        r.prefix_hashes = hash::block_hashes(r.input_tokens(), B);
        r
    }

    fn route_in(inst: &mut Instance, req: Request) {
        inst.note_routed();
        inst.enqueue(req);
    }

    #[test]
    fn single_request_prefills_then_decodes_to_completion() {
        let mut inst = instance(100, 8192);
        let mut events = EventQueue::new();
        route_in(&mut inst, request("a", 32, 2));

        // Step 1: prefill all 32 tokens, first token at end of step.
        inst.step(0, &mut events);
        assert_eq!(inst.running().len(), 1);
        let r = &inst.running()[0];
        assert!(r.ttft_set);
        assert_eq!(r.first_token_time, 1320);
        assert_eq!(r.decoded, 1);

        // Step 2 at t=1320: one decode token finishes the request.
        let mut saw_completion = false;
        while let Some(ev) = events.pop_due(u64::MAX) {
            match ev.kind {
                EventKind::Step { .. } => inst.step(ev.at, &mut events),
                EventKind::Completion(m) => {
                    saw_completion = true;
                    assert_eq!(m.id, "a");
                    assert_eq!(m.ttft(), 1320);
                    // Second step: 1000 + 5·1 = 1005.
                    assert_eq!(m.completion_time, 2325);
                }
                _ => {}
            }
        }
        assert!(saw_completion);
        assert_eq!(inst.running().len(), 0);
        assert_eq!(inst.kv().used_blocks(), 0);
    }

    #[test]
    fn token_budget_serialises_prefills() {
        let mut inst = instance(1000, 32);
        let mut events = EventQueue::new();
        route_in(&mut inst, request("a", 32, 2));
        route_in(&mut inst, request("b", 16, 1));

        inst.step(0, &mut events);
        // Only "a" fits under the 32-token budget.
        assert_eq!(inst.running().len(), 1);
        assert_eq!(inst.wait_queue().len(), 1);

        // Next step: a decodes (1) + b prefills (16); both finish (a's second
        // token, b's only token) at the end of it.
        inst.step(1320, &mut events);
        assert_eq!(inst.running().len(), 0);
        assert_eq!(inst.wait_queue().len(), 0);
        assert_eq!(inst.kv().used_blocks(), 0);
    }

    #[test]
    fn preemption_empties_batch_then_gives_up() {
        // Scenario: two blocks total; r1 holds one and decodes; r2 needs 13.
        let mut inst = instance(2, 8192);
        let mut events = EventQueue::new();
        route_in(&mut inst, request("r1", 8, 8));
        inst.step(0, &mut events);
        assert_eq!(inst.running().len(), 1);
        assert_eq!(inst.kv().used_blocks(), 1);

        route_in(&mut inst, request("r2", 200, 1));
        let now = events.clock();
        // Drive the pending step event.
        let mut stepped = false;
        while let Some(ev) = events.pop_due(u64::MAX) {
            if let EventKind::Step { .. } = ev.kind {
                inst.step(ev.at, &mut events);
                stepped = true;
                break;
            }
        }
        assert!(stepped, "a step was pending at {now}");

        // r1 was preempted, r2 still does not fit: batch empty, all blocks
        // free, both requests queued (r1 in front).
        assert_eq!(inst.running().len(), 0);
        assert_eq!(inst.kv().used_blocks(), 0);
        assert_eq!(inst.wait_queue().len(), 2);
        assert_eq!(inst.wait_queue()[0].id(), "r1");
        assert_eq!(inst.wait_queue()[0].state(), RequestState::Queued);
        assert_eq!(inst.wait_queue()[1].id(), "r2");
        assert!(inst.preemption_count() >= 1);
    }

    #[test]
    fn idle_instance_does_not_rearm() {
        let mut inst = instance(100, 8192);
        let mut events = EventQueue::new();
        route_in(&mut inst, request("a", 16, 1));
        inst.step(0, &mut events);
        // Drain: the request completes in one step, no further steps queue up.
        let mut step_events = 0;
        while let Some(ev) = events.pop_due(u64::MAX) {
            if let EventKind::Step { .. } = ev.kind {
                step_events += 1;
                inst.step(ev.at, &mut events);
            }
        }
        assert_eq!(step_events, 0, "one-step request must not re-arm");
        assert!(events.is_empty());
    }

    #[test]
    fn cached_prefix_skips_prefill_work() {
        let mut inst = instance(100, 8192);
        let mut events = EventQueue::new();
        let a = request("a", 32, 1);
        let prefix = a.prefix_hashes.clone();
        route_in(&mut inst, a);
        inst.step(0, &mut events);
        // a completed; its blocks are retained in the prefix map.
        assert_eq!(inst.kv().matched_blocks(&prefix), 2);

        // Same prompt again: one block (16 tokens) is reusable, the second is
        // capped so at least one token is computed.
        let b = {
            let mut b = request("a", 32, 1);
            b = Request::new(
                "b".into(),
                0,
                b.input_tokens().to_vec(),
                b.output_tokens().to_vec(),
                SloClass::Standard,
                None,
            );
            b.prefix_hashes = prefix.clone();
            b
        };
        route_in(&mut inst, b);
        inst.step(2000, &mut events);
        let r = &inst.running()[0];
        assert_eq!(r.cached_prefix_tokens, 16);
        let snap = inst.snapshot();
        assert!(snap.cache_hit_rate.unwrap() > 0.0);
    }
}
