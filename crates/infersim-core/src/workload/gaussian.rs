//! Synthetic workload with Poisson arrivals and Gaussian lengths.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::DEFAULT_MAX_TOKEN_ID;
use crate::request::{Request, SloClass};
use crate::types::{Tick, TICKS_PER_SEC};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaussianWorkloadConfig {
    /// Mean arrival rate, requests per second.
    pub rate_per_sec: f64,
    /// Stop after this many requests (0 means horizon-bounded only).
    pub max_prompts: usize,
    pub prompt_len_mean: f64,
    pub prompt_len_std: f64,
    pub output_len_mean: f64,
    pub output_len_std: f64,
    /// Random prefix shared by every generated prompt, in tokens.
    pub shared_prefix_len: usize,
    pub max_token_id: u32,
}

impl Default for GaussianWorkloadConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: 4.0,
            max_prompts: 0,
            prompt_len_mean: 512.0,
            prompt_len_std: 128.0,
            output_len_mean: 128.0,
            output_len_std: 32.0,
            shared_prefix_len: 0,
            max_token_id: DEFAULT_MAX_TOKEN_ID,
        }
    }
}

pub struct GaussianWorkload {
    config: GaussianWorkloadConfig,
    rng: ChaCha8Rng,
    shared_prefix: Vec<u32>,
    rate_per_tick: f64,
}

impl GaussianWorkload {
    /// Panics on a non-positive rate: an arrival process that never fires
    /// would otherwise loop forever.
    pub fn new(config: GaussianWorkloadConfig, mut rng: ChaCha8Rng) -> Self {
        assert!(
            config.rate_per_sec > 0.0 && config.rate_per_sec.is_finite(),
            "workload rate must be positive, got {}",
            config.rate_per_sec
        );
        assert!(config.max_token_id > 0, "max_token_id must be positive");
        let shared_prefix = (0..config.shared_prefix_len)
            .map(|_| rng.gen_range(0..config.max_token_id))
            .collect();
        let rate_per_tick = config.rate_per_sec / TICKS_PER_SEC;
        Self {
            config,
            rng,
            shared_prefix,
            rate_per_tick,
        }
    }

    /// Generate all arrivals up to `horizon`. Arrival times are monotone
    /// non-decreasing by construction.
    pub fn generate(&mut self, horizon: Tick) -> Vec<Request> {
        let mut requests = Vec::new();
        let mut clock = 0.0f64;
        loop {
            if self.config.max_prompts > 0 && requests.len() >= self.config.max_prompts {
                break;
            }
            clock += self.exponential() / self.rate_per_tick;
            let arrival = clock.round() as Tick;
            if arrival > horizon {
                break;
            }
            let prompt_len = self.gaussian_len(
                self.config.prompt_len_mean,
                self.config.prompt_len_std,
            );
            let output_len = self.gaussian_len(
                self.config.output_len_mean,
                self.config.output_len_std,
            );
            let input_tokens = self.prompt_tokens(prompt_len);
            let output_tokens = (0..output_len)
                .map(|_| self.rng.gen_range(0..self.config.max_token_id))
                .collect();
            requests.push(Request::new(
                format!("req-{}", requests.len()),
                arrival,
                input_tokens,
                output_tokens,
                SloClass::Unspecified,
                None,
            ));
        }
        info!(count = requests.len(), "generated workload");
        requests
    }

    fn prompt_tokens(&mut self, len: usize) -> Vec<u32> {
        let mut tokens: Vec<u32> = self
            .shared_prefix
            .iter()
            .copied()
            .take(len)
            .collect();
        while tokens.len() < len {
            tokens.push(self.rng.gen_range(0..self.config.max_token_id));
        }
        tokens
    }

    /// Unit-mean exponential draw for Poisson inter-arrival gaps.
    fn exponential(&mut self) -> f64 {
        let u: f64 = self.rng.gen_range(f64::MIN_POSITIVE..1.0);
        -u.ln()
    }

    /// Gaussian sample via Box-Muller, clamped to at least one token.
    fn gaussian_len(&mut self, mean: f64, std: f64) -> usize {
        let u1: f64 = self.rng.gen_range(f64::MIN_POSITIVE..1.0);
        let u2: f64 = self.rng.gen();
        let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
        (mean + std * z).round().max(1.0) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::PartitionedRng;

    fn workload(config: GaussianWorkloadConfig, seed: u64) -> GaussianWorkload {
        GaussianWorkload::new(config, PartitionedRng::new(seed).substream("workload"))
    }

    #[test]
    #[should_panic(expected = "rate must be positive")]
    fn zero_rate_panics_at_construction() {
        workload(
            GaussianWorkloadConfig {
                rate_per_sec: 0.0,
                ..Default::default()
            },
            1,
        );
    }

    #[test]
    fn arrivals_are_monotone_and_bounded() {
        let mut w = workload(
            GaussianWorkloadConfig {
                rate_per_sec: 100.0,
                max_prompts: 50,
                ..Default::default()
            },
            42,
        );
        let requests = w.generate(10_000_000);
        assert!(!requests.is_empty());
        assert!(requests.len() <= 50);
        let mut last = 0;
        for r in &requests {
            assert!(r.arrival_time() >= last);
            last = r.arrival_time();
            assert!(r.input_len() >= 1);
            assert!(r.output_len() >= 1);
            assert!(r.input_tokens().iter().all(|&t| t < DEFAULT_MAX_TOKEN_ID));
        }
    }

    #[test]
    fn same_seed_reproduces_the_workload() {
        let cfg = GaussianWorkloadConfig {
            rate_per_sec: 50.0,
            max_prompts: 20,
            shared_prefix_len: 32,
            ..Default::default()
        };
        let a = workload(cfg.clone(), 7).generate(60_000_000);
        let b = workload(cfg, 7).generate(60_000_000);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.arrival_time(), y.arrival_time());
            assert_eq!(x.input_tokens(), y.input_tokens());
            assert_eq!(x.output_tokens(), y.output_tokens());
        }
    }

    #[test]
    fn shared_prefix_is_common_to_all_prompts() {
        let mut w = workload(
            GaussianWorkloadConfig {
                rate_per_sec: 100.0,
                max_prompts: 10,
                shared_prefix_len: 16,
                prompt_len_mean: 64.0,
                prompt_len_std: 8.0,
                ..Default::default()
            },
            3,
        );
        let requests = w.generate(10_000_000);
        let prefix: Vec<u32> = requests[0].input_tokens()[..16].to_vec();
        for r in &requests {
            assert_eq!(&r.input_tokens()[..16.min(r.input_len())], &prefix[..16.min(r.input_len())]);
        }
    }
}
