//! Roofline latency model.
//!
//! Prices a step as the slower of compute and memory traffic for a
//! transformer forward pass, per tensor-parallel shard, plus fixed kernel and
//! collective overheads. Calibration comes from a hardware file (peak FLOPS,
//! peak bandwidth, efficiency factors) and a model-architecture file.

use serde::{Deserialize, Serialize};

use super::{ticks_from, BatchComposition, LatencyModel};
use crate::error::{Error, Result};
use crate::types::{Tick, TICKS_PER_SEC};

/// Hardware calibration constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareCalibration {
    /// Peak throughput per device, FLOP/s.
    pub peak_flops: f64,
    /// Peak memory bandwidth per device, bytes/s.
    pub peak_bandwidth: f64,
    /// Achievable fraction of peak bandwidth, in (0, 1].
    pub bandwidth_efficiency: f64,
    /// Model FLOPs utilisation for GEMM kernels, in (0, 1]. Used when no
    /// measured MFU database is available.
    #[serde(default = "default_mfu")]
    pub mfu: f64,
    /// Fixed per-layer kernel launch overhead, µs.
    #[serde(default)]
    pub per_layer_overhead_us: f64,
    /// All-reduce overhead per collective, µs.
    #[serde(default)]
    pub all_reduce_overhead_us: f64,
    /// Fixed per-step overhead, µs.
    #[serde(default)]
    pub base_overhead_us: f64,
}

fn default_mfu() -> f64 {
    0.5
}

/// Model architecture dimensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArchitecture {
    pub num_layers: usize,
    pub hidden_size: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub bytes_per_param: f64,
}

/// Attention kernels run out of SRAM and see a near-fixed utilisation.
const SRAM_UTILISATION: f64 = 0.9;

#[derive(Debug, Clone)]
pub struct RooflineModel {
    hardware: HardwareCalibration,
    model: ModelArchitecture,
    tensor_parallel: usize,
    /// Derived: parameters per shard.
    shard_params: f64,
    /// Derived: K+V bytes per token per layer per shard.
    kv_bytes_per_token_layer: f64,
}

impl RooflineModel {
    pub fn new(
        hardware: HardwareCalibration,
        model: ModelArchitecture,
        tensor_parallel: usize,
    ) -> Result<Self> {
        if tensor_parallel == 0 {
            return Err(Error::LatencyModelError("tp must be positive".into()));
        }
        for (field, value) in [
            ("num_layers", model.num_layers),
            ("hidden_size", model.hidden_size),
            ("num_heads", model.num_heads),
            ("num_kv_heads", model.num_kv_heads),
            ("intermediate_size", model.intermediate_size),
            ("vocab_size", model.vocab_size),
        ] {
            if value == 0 {
                return Err(Error::LatencyModelError(format!(
                    "model.{field} must be positive"
                )));
            }
        }
        if model.hidden_size % model.num_heads != 0 {
            return Err(Error::LatencyModelError(
                "hidden_size must divide evenly into num_heads".into(),
            ));
        }
        if !(model.bytes_per_param > 0.0) || !model.bytes_per_param.is_finite() {
            return Err(Error::LatencyModelError(
                "model.bytes_per_param must be positive".into(),
            ));
        }
        for (field, value) in [
            ("peak_flops", hardware.peak_flops),
            ("peak_bandwidth", hardware.peak_bandwidth),
        ] {
            if !(value > 0.0) || !value.is_finite() {
                return Err(Error::LatencyModelError(format!(
                    "hardware.{field} must be positive"
                )));
            }
        }
        for (field, value) in [
            ("bandwidth_efficiency", hardware.bandwidth_efficiency),
            ("mfu", hardware.mfu),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(Error::LatencyModelError(format!(
                    "hardware.{field} must be in (0, 1], got {value}"
                )));
            }
        }
        for (field, value) in [
            ("per_layer_overhead_us", hardware.per_layer_overhead_us),
            ("all_reduce_overhead_us", hardware.all_reduce_overhead_us),
            ("base_overhead_us", hardware.base_overhead_us),
        ] {
            if !(value >= 0.0) || !value.is_finite() {
                return Err(Error::LatencyModelError(format!(
                    "hardware.{field} must be non-negative"
                )));
            }
        }

        let h = model.hidden_size as f64;
        let head_dim = h / model.num_heads as f64;
        let kv_dim = model.num_kv_heads as f64 * head_dim;
        let inter = model.intermediate_size as f64;
        let layers = model.num_layers as f64;
        // Attention projections (q, k, v, o) plus gated MLP, plus the
        // embedding/unembedding matrices.
        let layer_params = 2.0 * h * h + 2.0 * h * kv_dim + 3.0 * h * inter;
        let total_params = layers * layer_params + 2.0 * model.vocab_size as f64 * h;
        let tp = tensor_parallel as f64;
        Ok(Self {
            shard_params: total_params / tp,
            kv_bytes_per_token_layer: 2.0 * kv_dim * model.bytes_per_param / tp,
            hardware,
            model,
            tensor_parallel,
        })
    }

    pub fn tensor_parallel(&self) -> usize {
        self.tensor_parallel
    }
}

impl LatencyModel for RooflineModel {
    fn step_time(&self, batch: &BatchComposition) -> Tick {
        if batch.is_empty() {
            return ticks_from(self.hardware.base_overhead_us);
        }
        let new_tokens = (batch.prefill_tokens + batch.decode_tokens) as f64;
        let context = batch.context_tokens as f64;
        let h = self.model.hidden_size as f64;
        let layers = self.model.num_layers as f64;
        let tp = self.tensor_parallel as f64;

        // Dense projections: 2 FLOPs per parameter per token.
        let gemm_flops = 2.0 * self.shard_params * new_tokens;
        // Attention score/value kernels over the attended context.
        let sram_flops = layers * 4.0 * h * context / tp;
        let t_compute = gemm_flops / (self.hardware.peak_flops * self.hardware.mfu)
            + sram_flops / (self.hardware.peak_flops * SRAM_UTILISATION);

        let weight_bytes = self.shard_params * self.model.bytes_per_param;
        let dynamic_bytes = self.kv_bytes_per_token_layer * layers * (context + new_tokens);
        let t_memory = (weight_bytes + dynamic_bytes)
            / (self.hardware.peak_bandwidth * self.hardware.bandwidth_efficiency);

        let mut us = t_compute.max(t_memory) * TICKS_PER_SEC;
        us += self.hardware.per_layer_overhead_us * (layers / tp);
        if self.tensor_parallel > 1 {
            us += self.hardware.all_reduce_overhead_us * layers * 2.0;
        }
        us += self.hardware.base_overhead_us;
        ticks_from(us)
    }

    fn queueing_time(&self, _input_len: usize) -> Tick {
        0
    }

    fn output_token_time(&self) -> Tick {
        0
    }
}
