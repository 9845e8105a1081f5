//! Shared identifier and time types.

/// Simulated time in ticks. One tick is one microsecond.
pub type Tick = u64;

/// Workload-assigned request identifier.
pub type RequestId = String;

/// Index of an instance within the cluster.
pub type InstanceId = usize;

/// Index of a KV block within an instance's block pool.
pub type BlockId = usize;

/// Ticks per second, for boundary rate conversions.
pub const TICKS_PER_SEC: f64 = 1_000_000.0;
