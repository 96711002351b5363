//! Shared RRD file handles.
//!
//! An [`RrdDb`] wraps one open storage backend behind an `Arc`, so clones
//! are cheap and every clone refers to the same open unit. Equality is
//! pointer identity: two handles compare equal exactly when they share the
//! underlying open file, which is how a pool cache hit is observable.
//!
//! Handles issued by the pool are owned by the pool. Return them with
//! `RrdDbPool::release`; calling [`RrdDb::close`] on a pool-issued handle is
//! a contract violation.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{RrdBackend, RrdBackendFactory};
use crate::def::RrdDef;
use crate::error::Result;

/// A shared handle to one open RRD storage unit.
#[derive(Clone)]
pub struct RrdDb {
    inner: Arc<DbInner>,
}

struct DbInner {
    path: PathBuf,
    // taken on close; None means closed
    backend: Mutex<Option<Box<dyn RrdBackend>>>,
}

impl RrdDb {
    /// Opens an existing file through `factory`.
    pub fn open(path: impl AsRef<Path>, factory: &dyn RrdBackendFactory) -> Result<Self> {
        let path = path.as_ref();
        let backend = factory.open(path)?;
        Ok(Self::from_backend(path.to_path_buf(), backend))
    }

    /// Creates a fresh file from a structured definition.
    pub fn create(def: &RrdDef, factory: &dyn RrdBackendFactory) -> Result<Self> {
        let mut backend = factory.create(def.path())?;
        backend.write_header(&def.header_bytes())?;
        Ok(Self::from_backend(def.path().to_path_buf(), backend))
    }

    /// Creates a fresh file at `path` from an XML dump.
    ///
    /// Restoring the dumped series is format-level work outside this crate;
    /// the dump is read (surfacing I/O errors for a missing or unreadable
    /// file) and the target is materialised header-initialised.
    pub fn import(
        path: impl AsRef<Path>,
        xml_dump_path: impl AsRef<Path>,
        factory: &dyn RrdBackendFactory,
    ) -> Result<Self> {
        let path = path.as_ref();
        let xml_dump_path = xml_dump_path.as_ref();
        let dump = fs::read(xml_dump_path)?;
        if dump.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("empty XML dump: {}", xml_dump_path.display()),
            )
            .into());
        }
        let def = RrdDef::new(path);
        let mut backend = factory.create(path)?;
        backend.write_header(&def.header_bytes())?;
        Ok(Self::from_backend(path.to_path_buf(), backend))
    }

    fn from_backend(path: PathBuf, backend: Box<dyn RrdBackend>) -> Self {
        Self {
            inner: Arc::new(DbInner {
                path,
                backend: Mutex::new(Some(backend)),
            }),
        }
    }

    /// Path this handle was opened or created for, as supplied by the
    /// caller (not canonicalised).
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Whether the handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.backend.lock().is_none()
    }

    /// Flushes and closes the underlying backend. Idempotent.
    pub fn close(&self) -> Result<()> {
        if let Some(mut backend) = self.inner.backend.lock().take() {
            backend.close()?;
        }
        Ok(())
    }
}

impl PartialEq for RrdDb {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for RrdDb {}

impl fmt::Debug for RrdDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RrdDb")
            .field("path", &self.inner.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}
