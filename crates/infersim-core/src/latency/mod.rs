//! Step-duration models.
//!
//! Given one step's batch composition, a latency model prices the step in
//! ticks. Two implementations: a fitted α/β regression ("blackbox") and a
//! roofline FLOPs/bandwidth model.

mod blackbox;
mod roofline;

pub use blackbox::{BlackboxCoefficients, BlackboxModel};
pub use roofline::{HardwareCalibration, ModelArchitecture, RooflineModel};

use crate::types::Tick;

/// Token totals of one step, summed over the running batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchComposition {
    /// Prefill tokens scheduled this step.
    pub prefill_tokens: usize,
    /// Decode tokens scheduled this step (one per decoding request).
    pub decode_tokens: usize,
    /// Context tokens attended over, summed across the batch.
    pub context_tokens: usize,
    /// Requests in the batch.
    pub batch_size: usize,
}

impl BatchComposition {
    pub fn is_empty(&self) -> bool {
        self.prefill_tokens == 0 && self.decode_tokens == 0
    }
}

/// Prices a batch step in simulated ticks.
pub trait LatencyModel {
    /// Duration of one engine step over `batch`.
    fn step_time(&self, batch: &BatchComposition) -> Tick;

    /// Modelled scheduling delay for a request of `input_len` tokens.
    fn queueing_time(&self, input_len: usize) -> Tick;

    /// Per-output-token post-processing time.
    fn output_token_time(&self) -> Tick;

    /// Placeholder overhead charged when a step forms a batch.
    fn scheduling_overhead(&self) -> Tick {
        0
    }

    /// Placeholder overhead charged per preemption.
    fn preemption_overhead(&self) -> Tick {
        0
    }
}

pub(crate) fn ticks_from(value: f64) -> Tick {
    if value <= 0.0 {
        0
    } else {
        value.round() as Tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_composition() {
        let b = BatchComposition::default();
        assert!(b.is_empty());
        let b2 = BatchComposition {
            decode_tokens: 1,
            ..Default::default()
        };
        assert!(!b2.is_empty());
    }
}
