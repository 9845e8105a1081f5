//! Fitted-regression latency model.
//!
//! Step time is a linear (optionally quadratic in prefill) fit:
//! `β₀ + β₁·prefill + β₂·decode (+ β₃·prefill²)`. The α vector models
//! scheduling delay (`α₀ + α₁·input_len`) and per-output-token processing
//! (`α₂`).

use serde::{Deserialize, Serialize};

use super::{ticks_from, BatchComposition, LatencyModel};
use crate::error::{Error, Result};
use crate::types::Tick;

/// Regression coefficients loaded from a calibration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlackboxCoefficients {
    /// α₀, α₁, α₂.
    pub alpha: Vec<f64>,
    /// β₀, β₁, β₂ and optionally β₃.
    pub beta: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct BlackboxModel {
    alpha: [f64; 3],
    beta: [f64; 4],
}

impl BlackboxModel {
    pub fn new(coefficients: &BlackboxCoefficients) -> Result<Self> {
        if coefficients.alpha.len() != 3 {
            return Err(Error::LatencyModelError(format!(
                "alpha must have 3 coefficients, got {}",
                coefficients.alpha.len()
            )));
        }
        if !(coefficients.beta.len() == 3 || coefficients.beta.len() == 4) {
            return Err(Error::LatencyModelError(format!(
                "beta must have 3 or 4 coefficients, got {}",
                coefficients.beta.len()
            )));
        }
        for (name, values) in [("alpha", &coefficients.alpha), ("beta", &coefficients.beta)] {
            if let Some(i) = values.iter().position(|v| !v.is_finite()) {
                return Err(Error::LatencyModelError(format!(
                    "{name}[{i}] is not finite"
                )));
            }
        }
        let mut alpha = [0.0; 3];
        alpha.copy_from_slice(&coefficients.alpha);
        let mut beta = [0.0; 4];
        beta[..coefficients.beta.len()].copy_from_slice(&coefficients.beta);
        Ok(Self { alpha, beta })
    }

    /// Convenience constructor for tests and hand-tuned setups.
    pub fn from_parts(alpha: [f64; 3], beta0: f64, beta1: f64, beta2: f64) -> Self {
        Self {
            alpha,
            beta: [beta0, beta1, beta2, 0.0],
        }
    }
}

impl LatencyModel for BlackboxModel {
    fn step_time(&self, batch: &BatchComposition) -> Tick {
        let prefill = batch.prefill_tokens as f64;
        let decode = batch.decode_tokens as f64;
        let t = self.beta[0]
            + self.beta[1] * prefill
            + self.beta[2] * decode
            + self.beta[3] * prefill * prefill;
        ticks_from(t)
    }

    fn queueing_time(&self, input_len: usize) -> Tick {
        ticks_from(self.alpha[0] + self.alpha[1] * input_len as f64)
    }

    fn output_token_time(&self) -> Tick {
        ticks_from(self.alpha[2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> BlackboxModel {
        BlackboxModel::from_parts([100.0, 1.0, 100.0], 1000.0, 10.0, 5.0)
    }

    #[test]
    fn prices_mixed_batch() {
        let m = model();
        let batch = BatchComposition {
            prefill_tokens: 16,
            decode_tokens: 1,
            context_tokens: 48,
            batch_size: 2,
        };
        assert_eq!(m.step_time(&batch), 1000 + 160 + 5);
    }

    #[test]
    fn alpha_surface() {
        let m = model();
        assert_eq!(m.queueing_time(32), 132);
        assert_eq!(m.output_token_time(), 100);
        assert_eq!(m.scheduling_overhead(), 0);
        assert_eq!(m.preemption_overhead(), 0);
    }

    #[test]
    fn quadratic_term_applies_when_present() {
        let coeffs = BlackboxCoefficients {
            alpha: vec![0.0, 0.0, 0.0],
            beta: vec![0.0, 0.0, 0.0, 2.0],
        };
        let m = BlackboxModel::new(&coeffs).unwrap();
        let batch = BatchComposition {
            prefill_tokens: 4,
            ..Default::default()
        };
        assert_eq!(m.step_time(&batch), 32);
    }

    #[test]
    fn rejects_bad_coefficients() {
        assert!(BlackboxModel::new(&BlackboxCoefficients {
            alpha: vec![0.0, 0.0],
            beta: vec![0.0, 0.0, 0.0],
        })
        .is_err());
        assert!(BlackboxModel::new(&BlackboxCoefficients {
            alpha: vec![0.0, 0.0, f64::NAN],
            beta: vec![0.0, 0.0, 0.0],
        })
        .is_err());
        assert!(BlackboxModel::new(&BlackboxCoefficients {
            alpha: vec![0.0, 0.0, 0.0],
            beta: vec![0.0, 0.0, 0.0, 0.0, 0.0],
        })
        .is_err());
    }

    #[test]
    fn step_time_is_monotone_in_tokens() {
        let m = model();
        let small = BatchComposition {
            prefill_tokens: 8,
            decode_tokens: 2,
            context_tokens: 20,
            batch_size: 3,
        };
        let large = BatchComposition {
            prefill_tokens: 64,
            decode_tokens: 6,
            context_tokens: 90,
            batch_size: 7,
        };
        assert!(m.step_time(&small) <= m.step_time(&large));
    }
}
