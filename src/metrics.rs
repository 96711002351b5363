//! Point-in-time snapshots of pool counters and gauges.

/// Snapshot of pool metrics, taken atomically under the pool monitor.
#[derive(Debug, Default, Clone, Copy)]
pub struct PoolStats {
    pub hits: u64,
    pub requests: u64,
    /// `hits / requests` rounded to three decimals; 1.0 when no request was
    /// ever made.
    pub efficiency: f64,
    /// Largest table size observed since construction.
    pub max_used_capacity: usize,

    // gauges captured at snapshot time
    pub open: usize,
    pub idle: usize,
    pub capacity: usize,
    pub limited_capacity: bool,
}
