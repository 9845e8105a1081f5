//! Configuration types for the simulator.
//!
//! Policy bundles are parsed strictly: unknown fields are an error, absent
//! sections or empty policy names select the defaults.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Tick;

/// KV-cache sizing for one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    /// Fixed block-pool size.
    #[serde(default = "default_total_blocks")]
    pub total_blocks: usize,

    /// Tokens per block.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            total_blocks: default_total_blocks(),
            block_size: default_block_size(),
        }
    }
}

impl KvConfig {
    pub fn validate(&self) -> Result<()> {
        if self.total_blocks == 0 {
            return Err(Error::ConfigError("kv.total_blocks must be positive".into()));
        }
        if self.block_size == 0 {
            return Err(Error::ConfigError("kv.block_size must be positive".into()));
        }
        Ok(())
    }
}

/// Continuous-batching budgets for one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Running-batch slot budget.
    #[serde(default = "default_max_running_reqs")]
    pub max_running_reqs: usize,

    /// Scheduled-token budget per step.
    #[serde(default = "default_max_scheduled_tokens")]
    pub max_scheduled_tokens: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_running_reqs: default_max_running_reqs(),
            max_scheduled_tokens: default_max_scheduled_tokens(),
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_running_reqs == 0 {
            return Err(Error::ConfigError("max_running_reqs must be positive".into()));
        }
        if self.max_scheduled_tokens == 0 {
            return Err(Error::ConfigError(
                "max_scheduled_tokens must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Top-level simulation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Simulation-time bound, in ticks.
    #[serde(default = "default_horizon")]
    pub horizon: Tick,

    #[serde(default = "default_num_instances")]
    pub num_instances: usize,

    #[serde(default)]
    pub kv: KvConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    /// Per-instance prefix-index capacity, in blocks.
    #[serde(default = "default_prefix_index_capacity")]
    pub prefix_index_capacity: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            horizon: default_horizon(),
            num_instances: default_num_instances(),
            kv: KvConfig::default(),
            batch: BatchConfig::default(),
            prefix_index_capacity: default_prefix_index_capacity(),
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_instances == 0 {
            return Err(Error::ConfigError("num_instances must be positive".into()));
        }
        if self.prefix_index_capacity == 0 {
            return Err(Error::ConfigError(
                "prefix_index_capacity must be positive".into(),
            ));
        }
        self.kv.validate()?;
        self.batch.validate()
    }
}

fn default_seed() -> u64 {
    42
}

fn default_horizon() -> Tick {
    60 * 1_000_000
}

fn default_num_instances() -> usize {
    1
}

fn default_total_blocks() -> usize {
    1000
}

fn default_block_size() -> usize {
    16
}

fn default_max_running_reqs() -> usize {
    256
}

fn default_max_scheduled_tokens() -> usize {
    8192
}

fn default_prefix_index_capacity() -> usize {
    4096
}

/// One scorer line of a weighted-scoring routing section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScorerSpec {
    pub name: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdmissionSection {
    #[serde(default)]
    pub policy: String,

    #[serde(default)]
    pub token_bucket_capacity: Option<f64>,

    #[serde(default)]
    pub token_bucket_refill_rate: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingSection {
    #[serde(default)]
    pub policy: String,

    #[serde(default)]
    pub scorers: Option<Vec<ScorerSpec>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrioritySection {
    #[serde(default)]
    pub policy: String,
}

/// Strictly-parsed policy bundle. Unknown fields fail the parse.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyBundle {
    #[serde(default)]
    pub admission: AdmissionSection,

    #[serde(default)]
    pub routing: RoutingSection,

    #[serde(default)]
    pub priority: PrioritySection,

    #[serde(default)]
    pub scheduler: String,
}

impl PolicyBundle {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let bundle: PolicyBundle = serde_yaml::from_str(text)?;
        bundle.validate()?;
        Ok(bundle)
    }

    pub fn from_path(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Structural validation; policy names are checked by the factories.
    pub fn validate(&self) -> Result<()> {
        if let Some(scorers) = &self.routing.scorers {
            for spec in scorers {
                if !(spec.weight > 0.0) || !spec.weight.is_finite() {
                    return Err(Error::ConfigError(format!(
                        "scorer '{}' weight must be a positive finite number, got {}",
                        spec.name, spec.weight
                    )));
                }
            }
        }
        if let Some(cap) = self.admission.token_bucket_capacity {
            if !(cap > 0.0) || !cap.is_finite() {
                return Err(Error::ConfigError(format!(
                    "token_bucket_capacity must be a positive finite number, got {cap}"
                )));
            }
        }
        if let Some(rate) = self.admission.token_bucket_refill_rate {
            if !(rate > 0.0) || !rate.is_finite() {
                return Err(Error::ConfigError(format!(
                    "token_bucket_refill_rate must be a positive finite number, got {rate}"
                )));
            }
        }
        Ok(())
    }
}
