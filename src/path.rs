//! Canonical path resolution.
//!
//! The pool keys its handle table by canonical path: two spellings that
//! resolve to the same file must map to the same entry, so every insert and
//! query canonicalises first. Caching by source path would be unsound when
//! two callers reach the same file via different spellings.
//!
//! Creation requests name files that do not exist yet; for those the parent
//! directory is resolved and the file name appended, mirroring what realpath
//! does for the deepest existing prefix.

use std::io;
use std::path::{Path, PathBuf};

/// Resolves a relative or absolute path to its canonical form.
///
/// Existing paths go through [`std::fs::canonicalize`] (symlinks, `.` and
/// `..` collapsed). A path whose final component does not exist yet is
/// resolved through its parent directory instead, so a file about to be
/// created canonicalises to the same key it will have once it exists.
pub fn canonical_path(path: impl AsRef<Path>) -> io::Result<PathBuf> {
    let path = path.as_ref();
    match path.canonicalize() {
        Ok(resolved) => Ok(resolved),
        Err(err) if err.kind() == io::ErrorKind::NotFound => canonicalize_nonexistent(path),
        Err(err) => Err(err),
    }
}

fn canonicalize_nonexistent(path: &Path) -> io::Result<PathBuf> {
    let file_name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path has no file name: {}", path.display()),
        )
    })?;
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(parent.canonicalize()?.join(file_name)),
        // bare file name, resolve against the current working directory
        _ => Ok(std::env::current_dir()?.join(file_name)),
    }
}
