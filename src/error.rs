//! Error types for the rrdpool library.
//!
//! ## Key Components
//!
//! - [`PoolError`]: every failure the pool and its collaborators surface,
//!   one variant per error kind.
//! - [`Result`]: crate-wide result alias.
//!
//! All fallible public operations return [`Result`] and propagate with `?`.
//! The reclamation worker is the single exception to the propagation policy:
//! it reports close failures through `tracing` and keeps running.
//!
//! ## Example Usage
//!
//! ```
//! use rrdpool::error::PoolError;
//!
//! let err = PoolError::UnsupportedBackend { name: "MEMORY" };
//! assert!(err.to_string().contains("MEMORY"));
//! ```

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors surfaced by the pool and its file-handle collaborators.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Underlying open, close, read, write or canonicalisation failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Creation was requested for a path whose entry is currently live.
    #[error("cannot create new file: '{}' already in use", .path.display())]
    InUse { path: PathBuf },

    /// Release was called for a handle the pool did not issue, or whose
    /// lease was already fully returned.
    #[error("file '{}' not in the pool", .path.display())]
    NotInPool { path: PathBuf },

    /// Release was called for a handle that was closed outside the pool.
    #[error("file '{}' already closed", .path.display())]
    AlreadyClosed { path: PathBuf },

    /// The default backend factory is not file-based.
    #[error("pool cannot work with the '{name}' backend factory: not file-based")]
    UnsupportedBackend { name: &'static str },

    /// A waiter parked on the admission condition was cancelled because the
    /// pool shut down underneath it.
    #[error("request for file '{}' was interrupted", .path.display())]
    Interrupted { path: PathBuf },
}
