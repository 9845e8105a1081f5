//! Workload injection.
//!
//! Two sources: synthetic arrivals with Gaussian-sampled prompt/output
//! lengths, or a CSV trace. Both produce plain `Request` records; the
//! simulator turns them into `Arrival` events.

pub mod gaussian;
pub mod trace;

pub use gaussian::{GaussianWorkload, GaussianWorkloadConfig};
pub use trace::{read_trace, read_trace_file, TraceIngest};

/// Token ids must stay below this bound unless a workload overrides it.
pub const DEFAULT_MAX_TOKEN_ID: u32 = 128_000;
