//! Infersim Core - Discrete-Event LLM Inference Fleet Simulator
//!
//! This crate predicts latency, throughput and resource utilisation for a
//! fleet of LLM inference instances under configurable admission, routing,
//! priority and scheduling policies.
//!
//! # Architecture
//!
//! The engine follows the serving-stack shape it simulates:
//! - A single min-heap event loop drives simulated time (1 tick = 1 µs)
//! - Per-instance continuous batching over a paged, prefix-deduplicated
//!   KV-block cache
//! - A cluster router with pluggable admission/routing/priority policies
//!   and a shared prefix-cache index for cache-aware scoring
//! - Deterministic, seed-partitioned RNG: identical seeds give bit-identical
//!   metrics
//!
//! # Example
//!
//! ```ignore
//! use infersim_core::{PolicyBundle, SimConfig, Simulator};
//!
//! let config = SimConfig::default();
//! let bundle = PolicyBundle::from_yaml("routing:\n  policy: least-loaded\n")?;
//! let mut sim = Simulator::from_config(&config, &bundle, latency)?;
//! sim.inject(workload);
//! let report = sim.run();
//! ```

pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod hash;
pub mod latency;
pub mod metrics;
pub mod policy;
pub mod request;
pub mod rng;
pub mod sim;
pub mod types;
pub mod workload;

pub use cluster::{Cluster, InstanceSnapshot, PrefixCacheIndex, RouterState};
pub use config::{BatchConfig, KvConfig, PolicyBundle, SimConfig};
pub use engine::{Instance, KvCache};
pub use error::{Error, Result};
pub use event::{EventKind, EventQueue};
pub use latency::{
    BatchComposition, BlackboxCoefficients, BlackboxModel, HardwareCalibration, LatencyModel,
    ModelArchitecture, RooflineModel,
};
pub use metrics::{RejectionRecord, RequestMetrics, SimReport};
pub use request::{Request, RequestState, SloClass};
pub use rng::PartitionedRng;
pub use sim::Simulator;
pub use types::{BlockId, InstanceId, RequestId, Tick};
pub use workload::{GaussianWorkload, GaussianWorkloadConfig};
