//! Storage backends and backend factories.
//!
//! ## Architecture
//!
//! ```text
//! RrdDb ──▶ Box<dyn RrdBackend>          one open storage unit per handle
//!              ▲
//!              │ open / create
//! RrdDbPool ──▶ Arc<dyn RrdBackendFactory>
//!              ▲
//!              │ default_factory() / set_default_factory()
//!         process-wide registry
//! ```
//!
//! ## Key Components
//!
//! - [`RrdBackend`]: one open storage unit behind a handle. Deliberately
//!   narrow: the pool only needs `path`, `write_header` and `close`; format
//!   parsing lives outside this crate.
//! - [`RrdBackendFactory`]: constructs backends for existing or new paths
//!   and declares whether its storage is file-based. The pool refuses to
//!   work with factories that are not.
//! - [`FileBackendFactory`]: the default, file-based factory.
//! - [`MemBackendFactory`]: in-process byte store. Not file-based, so the
//!   pool rejects it; useful on its own and in tests of that rejection.
//!
//! ## Example Usage
//!
//! ```
//! use rrdpool::backend::{MemBackendFactory, RrdBackendFactory};
//!
//! let factory = MemBackendFactory::default();
//! assert_eq!(factory.name(), "MEMORY");
//! assert!(!factory.is_file_based());
//! ```

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

/// One open storage unit behind an RRD handle.
pub trait RrdBackend: Send + std::fmt::Debug {
    /// Path this backend was opened or created for.
    fn path(&self) -> &Path;

    /// Writes the file header at the start of the storage unit.
    fn write_header(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Flushes and releases the storage unit. Idempotent.
    fn close(&mut self) -> io::Result<()>;
}

/// Constructs [`RrdBackend`] values for existing or new paths.
pub trait RrdBackendFactory: Send + Sync {
    /// Factory kind name, e.g. `"FILE"` or `"MEMORY"`.
    fn name(&self) -> &'static str;

    /// Whether backends produced by this factory are backed by real files.
    /// The pool only operates on file-based factories.
    fn is_file_based(&self) -> bool;

    /// Opens an existing storage unit.
    fn open(&self, path: &Path) -> io::Result<Box<dyn RrdBackend>>;

    /// Creates a new, empty storage unit, replacing any previous content.
    fn create(&self, path: &Path) -> io::Result<Box<dyn RrdBackend>>;
}

// ---------------------------------------------------------------------------
// File backend
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct FileBackend {
    path: PathBuf,
    file: Option<File>,
}

impl FileBackend {
    fn file_mut(&mut self) -> io::Result<&mut File> {
        self.file.as_mut().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("backend already closed: {}", self.path.display()),
            )
        })
    }
}

impl RrdBackend for FileBackend {
    fn path(&self) -> &Path {
        &self.path
    }

    fn write_header(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file_mut()?.write_all(bytes)
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

/// Factory producing read/write file-backed storage. The pool's required
/// kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileBackendFactory;

impl RrdBackendFactory for FileBackendFactory {
    fn name(&self) -> &'static str {
        "FILE"
    }

    fn is_file_based(&self) -> bool {
        true
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn RrdBackend>> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        debug!(path = %path.display(), "opened file backend");
        Ok(Box::new(FileBackend {
            path: path.to_path_buf(),
            file: Some(file),
        }))
    }

    fn create(&self, path: &Path) -> io::Result<Box<dyn RrdBackend>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        debug!(path = %path.display(), "created file backend");
        Ok(Box::new(FileBackend {
            path: path.to_path_buf(),
            file: Some(file),
        }))
    }
}

// ---------------------------------------------------------------------------
// Memory backend
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct MemBackend {
    path: PathBuf,
    buffer: Vec<u8>,
    store: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
}

impl RrdBackend for MemBackend {
    fn path(&self) -> &Path {
        &self.path
    }

    fn write_header(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        let buffer = mem::take(&mut self.buffer);
        self.store.lock().insert(self.path.clone(), buffer);
        Ok(())
    }
}

/// Factory keeping storage units in process memory. Not file-based.
#[derive(Debug, Default, Clone)]
pub struct MemBackendFactory {
    store: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
}

impl RrdBackendFactory for MemBackendFactory {
    fn name(&self) -> &'static str {
        "MEMORY"
    }

    fn is_file_based(&self) -> bool {
        false
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn RrdBackend>> {
        let buffer = self.store.lock().get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no in-memory unit at {}", path.display()),
            )
        })?;
        Ok(Box::new(MemBackend {
            path: path.to_path_buf(),
            buffer,
            store: Arc::clone(&self.store),
        }))
    }

    fn create(&self, path: &Path) -> io::Result<Box<dyn RrdBackend>> {
        Ok(Box::new(MemBackend {
            path: path.to_path_buf(),
            buffer: Vec::new(),
            store: Arc::clone(&self.store),
        }))
    }
}

// ---------------------------------------------------------------------------
// Default factory registry
// ---------------------------------------------------------------------------

static DEFAULT_FACTORY: RwLock<Option<Arc<dyn RrdBackendFactory>>> = RwLock::new(None);

/// Returns the process-wide default backend factory.
///
/// Starts out as [`FileBackendFactory`]; replaceable via
/// [`set_default_factory`].
pub fn default_factory() -> Arc<dyn RrdBackendFactory> {
    if let Some(factory) = DEFAULT_FACTORY.read().as_ref() {
        return Arc::clone(factory);
    }
    let mut slot = DEFAULT_FACTORY.write();
    Arc::clone(slot.get_or_insert_with(|| Arc::new(FileBackendFactory)))
}

/// Replaces the process-wide default backend factory.
pub fn set_default_factory(factory: Arc<dyn RrdBackendFactory>) {
    *DEFAULT_FACTORY.write() = Some(factory);
}
