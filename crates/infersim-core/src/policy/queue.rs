//! Wait-queue ordering policies.
//!
//! Each step the instance hands its wait queue to the configured scheduler
//! for an in-place stable sort. Length is always preserved.

use std::cmp::Ordering;
use std::collections::VecDeque;

use super::InstanceScheduler;
use crate::request::Request;
use crate::types::Tick;

/// First-come first-served: the queue is already in arrival order.
pub struct Fcfs;

impl InstanceScheduler for Fcfs {
    fn name(&self) -> &'static str {
        "fcfs"
    }

    fn order_queue(&self, _queue: &mut VecDeque<Request>, _now: Tick) {}
}

fn fcfs_tiebreak(a: &Request, b: &Request) -> Ordering {
    a.arrival_time()
        .cmp(&b.arrival_time())
        .then_with(|| a.id().cmp(b.id()))
}

/// Priority descending, then arrival ascending, then id ascending.
pub struct PriorityFcfs;

impl InstanceScheduler for PriorityFcfs {
    fn name(&self) -> &'static str {
        "priority-fcfs"
    }

    fn order_queue(&self, queue: &mut VecDeque<Request>, _now: Tick) {
        queue.make_contiguous().sort_by(|a, b| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap_or(Ordering::Equal)
                .then_with(|| fcfs_tiebreak(a, b))
        });
    }
}

/// Shortest job first by prompt length.
pub struct Sjf;

impl InstanceScheduler for Sjf {
    fn name(&self) -> &'static str {
        "sjf"
    }

    fn order_queue(&self, queue: &mut VecDeque<Request>, _now: Tick) {
        queue.make_contiguous().sort_by(|a, b| {
            a.input_len()
                .cmp(&b.input_len())
                .then_with(|| fcfs_tiebreak(a, b))
        });
    }
}

/// Pathological template: lowest priority first.
pub struct ReversePriority;

impl InstanceScheduler for ReversePriority {
    fn name(&self) -> &'static str {
        "reverse-priority"
    }

    fn order_queue(&self, queue: &mut VecDeque<Request>, _now: Tick) {
        queue.make_contiguous().sort_by(|a, b| {
            a.priority
                .partial_cmp(&b.priority)
                .unwrap_or(Ordering::Equal)
                .then_with(|| fcfs_tiebreak(a, b))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::SloClass;

    fn req(id: &str, arrival: Tick, input_len: usize, priority: f64) -> Request {
        let mut r = Request::new(
            id.into(),
            arrival,
            vec![7; input_len],
            vec![1],
            SloClass::Standard,
            None,
        );
        r.priority = priority;
        r
    }

    fn ids(queue: &VecDeque<Request>) -> Vec<&str> {
        queue.iter().map(Request::id).collect()
    }

    #[test]
    fn fcfs_keeps_arrival_order() {
        let mut q: VecDeque<Request> =
            [req("a", 0, 4, 0.0), req("b", 1, 2, 9.0), req("c", 2, 8, 5.0)].into();
        Fcfs.order_queue(&mut q, 10);
        assert_eq!(ids(&q), ["a", "b", "c"]);
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn priority_fcfs_sorts_desc_then_arrival_then_id() {
        let mut q: VecDeque<Request> = [
            req("b", 5, 4, 1.0),
            req("a", 5, 4, 1.0),
            req("c", 0, 4, 1.0),
            req("d", 9, 4, 7.0),
        ]
        .into();
        PriorityFcfs.order_queue(&mut q, 10);
        assert_eq!(ids(&q), ["d", "c", "a", "b"]);
    }

    #[test]
    fn sjf_sorts_by_prompt_length() {
        let mut q: VecDeque<Request> =
            [req("a", 0, 64, 0.0), req("b", 1, 8, 0.0), req("c", 2, 32, 0.0)].into();
        Sjf.order_queue(&mut q, 10);
        assert_eq!(ids(&q), ["b", "c", "a"]);
    }

    #[test]
    fn reverse_priority_is_the_inverse_of_priority_fcfs() {
        let mut q: VecDeque<Request> = [req("a", 0, 4, 3.0), req("b", 0, 4, 1.0)].into();
        ReversePriority.order_queue(&mut q, 10);
        assert_eq!(ids(&q), ["b", "a"]);
    }
}
