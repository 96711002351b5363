//! Convenience re-exports for common pool usage.

pub use crate::backend::{FileBackendFactory, MemBackendFactory, RrdBackend, RrdBackendFactory};
pub use crate::db::RrdDb;
pub use crate::def::{ArcDef, ConsolFun, DsDef, RrdDef};
pub use crate::error::{PoolError, Result};
pub use crate::metrics::PoolStats;
pub use crate::pool::RrdDbPool;
