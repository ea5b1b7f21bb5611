//! Durable filesystem primitives shared by the store, the logs and ingest.
//!
//! Every mutation of a persisted file goes through [`atomic_write`]: the new
//! bytes land in a temp file in the target's directory, are `fsync`ed, and are
//! renamed over the target before the directory itself is `fsync`ed. A reader
//! therefore observes either the complete old content or the complete new
//! content, never a prefix.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

/// Maximum length of a collection or lock name.
pub const MAX_COMPONENT_LENGTH: usize = 64;

/// Filesystem failure with a description of what was being attempted.
#[derive(Debug, thiserror::Error)]
#[error("{context}: {source}")]
pub struct FsError {
    /// Description of what was being attempted.
    pub context: String,
    /// Underlying I/O error.
    #[source]
    pub source: io::Error,
}

impl FsError {
    pub(crate) fn new(context: impl Into<String>, source: io::Error) -> Self {
        Self {
            context: context.into(),
            source,
        }
    }

    /// Whether the underlying error is `NotFound`.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.source.kind() == io::ErrorKind::NotFound
    }
}

/// Returns `true` when `name` is usable as a single path component for a
/// collection, lock or snapshot directory: ASCII alphanumerics, `_` and `-`,
/// at most [`MAX_COMPONENT_LENGTH`] bytes.
#[must_use]
pub fn is_safe_component(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_COMPONENT_LENGTH
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Create a directory (and parents) with mode 0700 on Unix.
///
/// Succeeds if the directory already exists. Fails if the path exists and is
/// not a directory.
pub fn create_dir_restricted(path: &Path) -> Result<(), FsError> {
    if let Ok(metadata) = fs::symlink_metadata(path) {
        if metadata.is_dir() {
            return Ok(());
        }
        return Err(FsError::new(
            format!("{} is occupied by a non-directory", path.display()),
            io::Error::from(io::ErrorKind::AlreadyExists),
        ));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(path)
            .map_err(|e| FsError::new(format!("creating directory {}", path.display()), e))
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(path)
            .map_err(|e| FsError::new(format!("creating directory {}", path.display()), e))
    }
}

/// `fsync` a directory so that a rename inside it is durable.
pub fn sync_dir(dir: &Path) -> Result<(), FsError> {
    #[cfg(unix)]
    {
        File::open(dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| FsError::new(format!("syncing directory {}", dir.display()), e))
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}

/// Atomic write: temp file in the same directory, `fsync`, rename, `fsync`
/// the directory. Missing parent directories are created.
pub fn atomic_write(target: &Path, data: &[u8]) -> Result<(), FsError> {
    if let Ok(metadata) = fs::symlink_metadata(target) {
        if metadata.is_dir() {
            return Err(FsError::new(
                format!("refusing to replace directory {}", target.display()),
                io::Error::from(io::ErrorKind::InvalidInput),
            ));
        }
    }
    let Some(parent) = target.parent() else {
        return Err(FsError::new(
            format!("{} has no parent directory", target.display()),
            io::Error::from(io::ErrorKind::InvalidInput),
        ));
    };
    create_dir_restricted(parent)?;

    let temp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| FsError::new(format!("creating temp file in {}", parent.display()), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = temp.as_file().set_permissions(fs::Permissions::from_mode(0o600)) {
            tracing::warn!(path = %temp.path().display(), err = %e, "could not restrict temp file mode");
        }
    }

    let mut out = temp.as_file();
    out.write_all(data)
        .map_err(|e| FsError::new(format!("writing temp file for {}", target.display()), e))?;
    out.sync_all()
        .map_err(|e| FsError::new(format!("syncing temp file for {}", target.display()), e))?;

    temp.persist(target)
        .map_err(|e| FsError::new(format!("publishing {}", target.display()), e.error))?;
    sync_dir(parent)
}

/// Read a file, refusing anything larger than `max_size` bytes.
pub fn bounded_read(path: &Path, max_size: u64) -> Result<Vec<u8>, FsError> {
    let file =
        File::open(path).map_err(|e| FsError::new(format!("opening {}", path.display()), e))?;
    let mut buf = Vec::new();
    file.take(max_size.saturating_add(1))
        .read_to_end(&mut buf)
        .map_err(|e| FsError::new(format!("reading {}", path.display()), e))?;
    if u64::try_from(buf.len()).unwrap_or(u64::MAX) > max_size {
        return Err(FsError::new(
            format!("{} is larger than {max_size} bytes", path.display()),
            io::Error::from(io::ErrorKind::InvalidData),
        ));
    }
    Ok(buf)
}

/// Open (creating if needed) a sidecar file used only as an `fs2` lock
/// target. The file content is never read.
pub fn open_lock_file(path: &Path) -> Result<File, FsError> {
    if let Some(dir) = path.parent() {
        create_dir_restricted(dir)?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| FsError::new(format!("opening lock file {}", path.display()), e))
}

/// Remove a file, treating `NotFound` as success.
pub fn remove_if_exists(path: &Path) -> Result<bool, FsError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(FsError::new(format!("removing {}", path.display()), e)),
    }
}
