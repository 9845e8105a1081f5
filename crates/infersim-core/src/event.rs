//! Discrete-event queue and simulated clock.
//!
//! Events are value records ordered by timestamp with insertion-order FIFO
//! tie-break; a single loop pops them and runs each to completion. The clock
//! only ever moves forward.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::metrics::RequestMetrics;
use crate::request::{Request, SloClass};
use crate::types::{InstanceId, RequestId, Tick};

/// Event variants. Only `Arrival` and `Step` materially advance simulation
/// state; the rest are observability hooks.
#[derive(Debug)]
pub enum EventKind {
    Arrival(Box<Request>),
    Queued {
        instance: InstanceId,
        request: Box<Request>,
    },
    Scheduled {
        instance: InstanceId,
        request_id: RequestId,
    },
    Preemption {
        instance: InstanceId,
        request_id: RequestId,
    },
    Step {
        instance: InstanceId,
    },
    RequestLeft {
        instance: InstanceId,
        request_id: RequestId,
    },
    Completion(Box<RequestMetrics>),
    Rejection {
        request_id: RequestId,
        class: SloClass,
        reason: String,
    },
}

/// A timestamped event popped from the queue.
#[derive(Debug)]
pub struct ScheduledEvent {
    pub at: Tick,
    pub kind: EventKind,
}

struct HeapEntry {
    at: Tick,
    seq: u64,
    kind: EventKind,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest timestamp (and the
        // earliest insertion among equals) pops first.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of events plus the simulation clock.
pub struct EventQueue {
    heap: BinaryHeap<HeapEntry>,
    next_seq: u64,
    clock: Tick,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
            clock: 0,
        }
    }

    pub fn clock(&self) -> Tick {
        self.clock
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Enqueue an event. Scheduling into the past leaves the simulation
    /// undefined, so it fails loudly.
    pub fn schedule(&mut self, at: Tick, kind: EventKind) {
        assert!(
            at >= self.clock,
            "event scheduled at {at} behind clock {}",
            self.clock
        );
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapEntry { at, seq, kind });
    }

    /// Pop the next event with timestamp ≤ `horizon`, advancing the clock to
    /// it. Returns `None` once the head lies beyond the horizon or the queue
    /// is drained.
    pub fn pop_due(&mut self, horizon: Tick) -> Option<ScheduledEvent> {
        if self.heap.peek()?.at > horizon {
            return None;
        }
        let entry = self.heap.pop()?;
        debug_assert!(entry.at >= self.clock, "clock regression");
        self.clock = entry.at;
        Some(ScheduledEvent {
            at: entry.at,
            kind: entry.kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(instance: InstanceId) -> EventKind {
        EventKind::Step { instance }
    }

    fn instance_of(kind: &EventKind) -> InstanceId {
        match kind {
            EventKind::Step { instance } => *instance,
            _ => panic!("not a step"),
        }
    }

    #[test]
    fn pops_in_timestamp_order() {
        let mut q = EventQueue::new();
        q.schedule(30, step(3));
        q.schedule(10, step(1));
        q.schedule(20, step(2));
        let order: Vec<Tick> = std::iter::from_fn(|| q.pop_due(u64::MAX).map(|e| e.at)).collect();
        assert_eq!(order, vec![10, 20, 30]);
    }

    #[test]
    fn equal_timestamps_pop_fifo() {
        let mut q = EventQueue::new();
        for i in 0..8 {
            q.schedule(100, step(i));
        }
        let order: Vec<InstanceId> =
            std::iter::from_fn(|| q.pop_due(u64::MAX).map(|e| instance_of(&e.kind))).collect();
        assert_eq!(order, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn horizon_bounds_popping() {
        let mut q = EventQueue::new();
        q.schedule(10, step(0));
        q.schedule(50, step(1));
        assert!(q.pop_due(20).is_some());
        assert!(q.pop_due(20).is_none());
        assert_eq!(q.len(), 1);
        assert_eq!(q.clock(), 10);
    }

    #[test]
    #[should_panic(expected = "behind clock")]
    fn scheduling_into_the_past_panics() {
        let mut q = EventQueue::new();
        q.schedule(10, step(0));
        q.pop_due(u64::MAX);
        q.schedule(5, step(1));
    }

    #[test]
    fn clock_advances_monotonically() {
        let mut q = EventQueue::new();
        q.schedule(5, step(0));
        q.schedule(5, step(1));
        q.schedule(7, step(2));
        let mut last = 0;
        while let Some(e) = q.pop_due(u64::MAX) {
            assert!(e.at >= last);
            last = e.at;
        }
        assert_eq!(q.clock(), 7);
    }
}
