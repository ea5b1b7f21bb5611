//! Validated, content-addressed file ingest.
//!
//! Uploaded PDFs and page images are checked ([`signature`]), renamed to a
//! storage-safe form ([`name`]), and copied atomically into a destination
//! directory. Each stored file gets a `<file>.b3` sidecar holding its BLAKE3
//! digest; a later upload with the same digest resolves to the existing file
//! instead of a second copy. A name collision with different content is
//! versioned as `<stem>_v2<ext>`, `<stem>_v3<ext>`, ...

pub mod name;
pub mod signature;

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

pub use name::safe_name;
pub use signature::{FileKind, IngestLimits};

use crate::config::IngestConfig;
use crate::fsutil::{self, FsError};

/// Extension appended to a stored file's name for its digest sidecar.
pub const SIDECAR_EXTENSION: &str = "b3";

/// Sidecars are a single hex digest; anything larger is not ours.
const MAX_SIDECAR_SIZE: u64 = 1024;

/// Copy buffer size.
const COPY_CHUNK: usize = 64 * 1024;

/// Attempts to claim a fresh name when a concurrent ingest takes it first.
const MAX_PLACEMENT_ATTEMPTS: usize = 8;

/// Highest `_v<N>` suffix tried before giving up.
const MAX_VERSION: usize = 10_000;

// ─────────────────────────────────────────────────────────────────────────────
// Error Types
// ─────────────────────────────────────────────────────────────────────────────

/// Why a file was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum InvalidFileReason {
    #[error("file is empty")]
    Empty,

    #[error("{kind} file is {size} bytes, limit is {max}")]
    TooLarge { kind: FileKind, size: u64, max: u64 },

    #[error("content does not match the {kind} signature")]
    BadSignature { kind: FileKind },

    #[error("unsupported file extension: {extension:?}")]
    UnsupportedExtension { extension: String },
}

/// Errors raised by [`FileIngest`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IngestError {
    #[error("invalid file: {0}")]
    InvalidFile(InvalidFileReason),

    /// The proposed name points outside the destination directory.
    #[error("unsafe file name {name:?}: {reason}")]
    UnsafeName {
        name: String,
        reason: &'static str,
    },

    /// The source changed between validation and copy.
    #[error("source file changed during ingest: {}", path.display())]
    SourceChanged { path: PathBuf },

    /// Every candidate name was taken by concurrent writers.
    #[error("no free name for {proposed} in {} after {attempts} attempts", dest_dir.display())]
    PlacementConflict {
        dest_dir: PathBuf,
        proposed: String,
        attempts: usize,
    },

    #[error("ingest I/O error: {context}: {source}")]
    Io {
        /// Description of what was being attempted.
        context: String,
        /// Underlying I/O error.
        source: io::Error,
    },
}

impl IngestError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<FsError> for IngestError {
    fn from(e: FsError) -> Self {
        Self::io(e.context, e.source)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Results
// ─────────────────────────────────────────────────────────────────────────────

/// A stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestedFile {
    pub path: PathBuf,
    /// Lowercase hex BLAKE3 digest.
    pub hash: String,
    pub size: u64,
    pub kind: FileKind,
    pub mime: &'static str,
    pub signature_ok: bool,
    /// `true` when an identical file already existed and was reused.
    pub deduplicated: bool,
}

/// Where a file with a given digest belongs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// An identical file is already stored here.
    Existing(PathBuf),
    /// Store the file at this (currently free) path.
    New(PathBuf),
}

/// One member of [`FileIngest::ingest_bundle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleItem {
    pub source: PathBuf,
    pub kind: FileKind,
    /// Proposed stored name, sanitized before use.
    pub name: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// FileIngest
// ─────────────────────────────────────────────────────────────────────────────

/// Validates and stores uploaded files.
#[derive(Debug, Clone)]
pub struct FileIngest {
    limits: IngestLimits,
    max_basename_len: usize,
}

impl FileIngest {
    #[must_use]
    pub fn new(config: &IngestConfig) -> Self {
        Self {
            limits: IngestLimits::from(config),
            max_basename_len: config.max_basename_len,
        }
    }

    #[must_use]
    pub const fn limits(&self) -> &IngestLimits {
        &self.limits
    }

    /// Check an in-memory upload against the limits and magic bytes of `kind`.
    pub fn validate(&self, bytes: &[u8], kind: FileKind) -> Result<(), IngestError> {
        signature::validate(bytes, kind, &self.limits)
    }

    /// Like [`validate`](Self::validate) for a file on disk; returns its size.
    pub fn validate_file(&self, path: &Path, kind: FileKind) -> Result<u64, IngestError> {
        signature::validate_file(path, kind, &self.limits)
    }

    /// Kind of `path` judged by its extension.
    pub fn detect_kind(path: &Path) -> Result<FileKind, IngestError> {
        FileKind::from_path(path).ok_or_else(|| {
            IngestError::InvalidFile(InvalidFileReason::UnsupportedExtension {
                extension: path
                    .extension()
                    .map(|e| e.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            })
        })
    }

    /// See [`name::safe_name`].
    pub fn safe_name(&self, original: &str) -> Result<String, IngestError> {
        name::safe_name(original, self.max_basename_len)
    }

    /// Streaming BLAKE3 digest of `path`, lowercase hex.
    pub fn hash_file(path: &Path) -> Result<String, IngestError> {
        let mut file = File::open(path)
            .map_err(|e| IngestError::io(format!("opening {}", path.display()), e))?;
        let mut hasher = blake3::Hasher::new();
        io::copy(&mut file, &mut hasher)
            .map_err(|e| IngestError::io(format!("hashing {}", path.display()), e))?;
        Ok(hasher.finalize().to_hex().to_string())
    }

    /// Resolve where content with digest `hash` should live in `dest_dir`.
    ///
    /// A sibling with the same extension whose sidecar holds `hash` is
    /// reused. Otherwise `proposed` is used if free, else the first free
    /// `<stem>_v<N><ext>` with `N >= 2`.
    pub fn dedup_or_version(
        dest_dir: &Path,
        hash: &str,
        proposed: &str,
    ) -> Result<Placement, IngestError> {
        if let Some(existing) = find_by_digest(dest_dir, hash, extension_of(proposed))? {
            return Ok(Placement::Existing(existing));
        }
        let (stem, ext) = split_extension(proposed);
        let candidates = std::iter::once(proposed.to_string())
            .chain((2..=MAX_VERSION).map(|n| format!("{stem}_v{n}{ext}")));
        for candidate in candidates {
            let path = dest_dir.join(&candidate);
            if !path.exists() && !sidecar_path(&path).exists() {
                return Ok(Placement::New(path));
            }
        }
        Err(IngestError::PlacementConflict {
            dest_dir: dest_dir.to_path_buf(),
            proposed: proposed.to_string(),
            attempts: MAX_VERSION,
        })
    }

    /// Copy `source` to the free path `dest`, hashing on the way, then write
    /// the digest sidecar. Returns the digest and byte count.
    ///
    /// The copy goes through a temp file in the destination directory and is
    /// linked into place without overwriting; an existing `dest` yields an
    /// `AlreadyExists` I/O error. On any failure nothing created by the call
    /// remains, including a destination directory it had to create.
    pub fn atomic_copy(source: &Path, dest: &Path) -> Result<(String, u64), IngestError> {
        let dir = dest.parent().ok_or_else(|| {
            IngestError::io(
                format!("destination has no parent: {}", dest.display()),
                io::Error::new(io::ErrorKind::InvalidInput, "no parent directory"),
            )
        })?;
        let created_dir = fs::symlink_metadata(dir).is_err();
        fsutil::create_dir_restricted(dir)?;

        let result = Self::copy_into(source, dest, dir);
        if result.is_err() && created_dir {
            if let Err(e) = fs::remove_dir(dir) {
                tracing::warn!(path = %dir.display(), err = %e, "failed to remove directory during rollback");
            }
        }
        result
    }

    fn copy_into(source: &Path, dest: &Path, dir: &Path) -> Result<(String, u64), IngestError> {
        let mut input = File::open(source)
            .map_err(|e| IngestError::io(format!("opening {}", source.display()), e))?;
        let mut temp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| IngestError::io(format!("creating temp file in {}", dir.display()), e))?;

        let mut hasher = blake3::Hasher::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; COPY_CHUNK];
        loop {
            let n = match input.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(IngestError::io(format!("reading {}", source.display()), e)),
            };
            hasher.update(&buf[..n]);
            temp.write_all(&buf[..n])
                .map_err(|e| IngestError::io(format!("writing copy of {}", source.display()), e))?;
            size += n as u64;
        }
        temp.as_file()
            .sync_all()
            .map_err(|e| IngestError::io(format!("syncing copy of {}", source.display()), e))?;
        temp.persist_noclobber(dest)
            .map_err(|e| IngestError::io(format!("placing {}", dest.display()), e.error))?;

        let hash = hasher.finalize().to_hex().to_string();
        let published = fsutil::sync_dir(dir)
            .and_then(|()| fsutil::atomic_write(&sidecar_path(dest), hash.as_bytes()));
        if let Err(e) = published {
            remove_stored(dest);
            return Err(e.into());
        }
        Ok((hash, size))
    }

    /// Validate `source` and store it in `dest_dir` under a sanitized form of
    /// `proposed`, reusing an identical stored file when one exists.
    pub fn ingest(
        &self,
        source: &Path,
        kind: FileKind,
        dest_dir: &Path,
        proposed: &str,
    ) -> Result<IngestedFile, IngestError> {
        self.validate_file(source, kind)?;
        let name = with_kind_extension(self.safe_name(proposed)?, kind);
        let hash = Self::hash_file(source)?;

        for _ in 0..MAX_PLACEMENT_ATTEMPTS {
            let dest = match Self::dedup_or_version(dest_dir, &hash, &name)? {
                Placement::Existing(path) => {
                    let size = fs::metadata(&path)
                        .map_err(|e| IngestError::io(format!("inspecting {}", path.display()), e))?
                        .len();
                    tracing::debug!(path = %path.display(), hash = %hash, "ingest deduplicated");
                    return Ok(IngestedFile {
                        path,
                        hash,
                        size,
                        kind,
                        mime: kind.mime(),
                        signature_ok: true,
                        deduplicated: true,
                    });
                },
                Placement::New(path) => path,
            };

            match Self::atomic_copy(source, &dest) {
                Ok((copied_hash, size)) => {
                    if copied_hash != hash {
                        remove_stored(&dest);
                        return Err(IngestError::SourceChanged {
                            path: source.to_path_buf(),
                        });
                    }
                    tracing::info!(path = %dest.display(), hash = %hash, size, "file ingested");
                    return Ok(IngestedFile {
                        path: dest,
                        hash,
                        size,
                        kind,
                        mime: kind.mime(),
                        signature_ok: true,
                        deduplicated: false,
                    });
                },
                Err(IngestError::Io { source: e, .. })
                    if e.kind() == io::ErrorKind::AlreadyExists =>
                {
                    tracing::debug!(path = %dest.display(), "destination taken concurrently, retrying");
                },
                Err(e) => return Err(e),
            }
        }
        Err(IngestError::PlacementConflict {
            dest_dir: dest_dir.to_path_buf(),
            proposed: name,
            attempts: MAX_PLACEMENT_ATTEMPTS,
        })
    }

    /// Ingest every item or none: on the first failure, files stored by this
    /// call are removed again. Reused (deduplicated) files are left alone.
    pub fn ingest_bundle(
        &self,
        items: &[BundleItem],
        dest_dir: &Path,
    ) -> Result<Vec<IngestedFile>, IngestError> {
        for item in items {
            self.validate_file(&item.source, item.kind)?;
        }

        let mut stored: Vec<IngestedFile> = Vec::with_capacity(items.len());
        for item in items {
            match self.ingest(&item.source, item.kind, dest_dir, &item.name) {
                Ok(file) => stored.push(file),
                Err(e) => {
                    for file in stored.iter().filter(|f| !f.deduplicated) {
                        remove_stored(&file.path);
                    }
                    tracing::warn!(dest_dir = %dest_dir.display(), err = %e, "bundle ingest rolled back");
                    return Err(e);
                },
            }
        }
        Ok(stored)
    }
}

/// `<file>.b3`
#[must_use]
pub fn sidecar_path(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_os_string();
    name.push(".");
    name.push(SIDECAR_EXTENSION);
    PathBuf::from(name)
}

fn find_by_digest(dir: &Path, hash: &str, ext: &str) -> Result<Option<PathBuf>, IngestError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(IngestError::io(format!("listing {}", dir.display()), e)),
    };
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();

    let sidecar_suffix = format!("{ext}.{SIDECAR_EXTENSION}");
    for name in names.iter().filter(|n| n.ends_with(&sidecar_suffix)) {
        let sidecar = dir.join(name);
        let stored_hash = match fsutil::bounded_read(&sidecar, MAX_SIDECAR_SIZE) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(path = %sidecar.display(), err = %e, "unreadable sidecar skipped");
                continue;
            },
        };
        if String::from_utf8_lossy(&stored_hash).trim() != hash {
            continue;
        }
        let stored = dir.join(&name[..name.len() - SIDECAR_EXTENSION.len() - 1]);
        if stored.is_file() {
            return Ok(Some(stored));
        }
    }
    Ok(None)
}

/// Extension including the dot, or `""`.
fn extension_of(name: &str) -> &str {
    split_extension(name).1
}

fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}

fn with_kind_extension(name: String, kind: FileKind) -> String {
    if FileKind::from_path(Path::new(&name)) == Some(kind) {
        name
    } else {
        format!("{name}.{}", kind.extension())
    }
}

/// Best-effort removal of a stored file and its sidecar.
fn remove_stored(path: &Path) {
    for target in [path.to_path_buf(), sidecar_path(path)] {
        if let Err(e) = fsutil::remove_if_exists(&target) {
            tracing::warn!(path = %target.display(), err = %e, "failed to remove file during rollback");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3, 4];

    fn pdf(marker: &str) -> Vec<u8> {
        format!("%PDF-1.4\n{marker}\n%%EOF\n").into_bytes()
    }

    fn write(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, bytes).expect("write source");
        path
    }

    fn ingest() -> FileIngest {
        FileIngest::new(&IngestConfig::default())
    }

    #[test]
    fn ingest_writes_file_and_sidecar() {
        let src = tempfile::tempdir().expect("src");
        let dest = tempfile::tempdir().expect("dest");
        let source = write(src.path(), "upload.pdf", &pdf("a"));

        let stored = ingest()
            .ingest(&source, FileKind::Pdf, dest.path(), "400_CS-501 thesis.pdf")
            .expect("ingest");
        assert_eq!(stored.path, dest.path().join("400_CS-501_thesis.pdf"));
        assert!(!stored.deduplicated);
        assert_eq!(stored.mime, "application/pdf");
        assert_eq!(fs::read(&stored.path).expect("read"), pdf("a"));
        let sidecar = fs::read_to_string(sidecar_path(&stored.path)).expect("sidecar");
        assert_eq!(sidecar, stored.hash);
        assert_eq!(stored.hash, FileIngest::hash_file(&source).expect("hash"));
    }

    #[test]
    fn failed_copy_removes_directory_it_created() {
        let src = tempfile::tempdir().expect("src");
        let dest = tempfile::tempdir().expect("dest");
        let fresh = dest.path().join("400").join("thesis");

        let err = FileIngest::atomic_copy(&src.path().join("missing.pdf"), &fresh.join("t.pdf"))
            .expect_err("missing source");
        assert!(matches!(err, IngestError::Io { .. }));
        assert!(!fresh.exists());
    }

    #[test]
    fn failed_sidecar_rolls_back_stored_file() {
        let src = tempfile::tempdir().expect("src");
        let dest = tempfile::tempdir().expect("dest");
        let source = write(src.path(), "upload.pdf", &pdf("a"));
        let target = dest.path().join("t.pdf");
        fs::create_dir(sidecar_path(&target)).expect("block sidecar");

        FileIngest::atomic_copy(&source, &target).expect_err("sidecar cannot be written");
        assert!(!target.exists());
        let left: Vec<_> = fs::read_dir(dest.path())
            .expect("list")
            .map(|e| e.expect("entry").file_name())
            .collect();
        assert_eq!(left, vec![std::ffi::OsString::from("t.pdf.b3")]);
    }

    #[test]
    fn multibyte_name_is_stored() {
        let src = tempfile::tempdir().expect("src");
        let dest = tempfile::tempdir().expect("dest");
        let source = write(src.path(), "upload.pdf", &pdf("a"));

        let proposed = format!("{}.pdf", "論".repeat(150));
        let stored = ingest()
            .ingest(&source, FileKind::Pdf, dest.path(), &proposed)
            .expect("ingest");
        assert!(stored.path.exists());
        assert!(sidecar_path(&stored.path).exists());
    }

    #[test]
    fn identical_content_is_deduplicated() {
        let src = tempfile::tempdir().expect("src");
        let dest = tempfile::tempdir().expect("dest");
        let source = write(src.path(), "cover.jpg", JPEG);
        let ing = ingest();

        let first = ing
            .ingest(&source, FileKind::Jpeg, dest.path(), "cover.jpg")
            .expect("first");
        let second = ing
            .ingest(&source, FileKind::Jpeg, dest.path(), "other-name.jpg")
            .expect("second");
        assert!(second.deduplicated);
        assert_eq!(second.path, first.path);
        assert_eq!(fs::read_dir(dest.path()).expect("list").count(), 2);
    }

    #[test]
    fn different_content_is_versioned() {
        let src = tempfile::tempdir().expect("src");
        let dest = tempfile::tempdir().expect("dest");
        let ing = ingest();
        let a = write(src.path(), "a.pdf", &pdf("a"));
        let b = write(src.path(), "b.pdf", &pdf("b"));
        let c = write(src.path(), "c.pdf", &pdf("c"));

        ing.ingest(&a, FileKind::Pdf, dest.path(), "thesis.pdf").expect("a");
        let second = ing.ingest(&b, FileKind::Pdf, dest.path(), "thesis.pdf").expect("b");
        let third = ing.ingest(&c, FileKind::Pdf, dest.path(), "thesis.pdf").expect("c");
        assert_eq!(second.path, dest.path().join("thesis_v2.pdf"));
        assert_eq!(third.path, dest.path().join("thesis_v3.pdf"));
    }

    #[test]
    fn missing_extension_is_added() {
        let src = tempfile::tempdir().expect("src");
        let dest = tempfile::tempdir().expect("dest");
        let source = write(src.path(), "last", JPEG);
        let stored = ingest()
            .ingest(&source, FileKind::Jpeg, dest.path(), "last_page")
            .expect("ingest");
        assert_eq!(stored.path, dest.path().join("last_page.jpg"));
    }

    #[test]
    fn invalid_source_stores_nothing() {
        let src = tempfile::tempdir().expect("src");
        let dest = tempfile::tempdir().expect("dest");
        let source = write(src.path(), "fake.pdf", b"not a pdf");
        let err = ingest()
            .ingest(&source, FileKind::Pdf, dest.path(), "fake.pdf")
            .unwrap_err();
        assert!(matches!(
            err,
            IngestError::InvalidFile(InvalidFileReason::BadSignature { .. })
        ));
        assert_eq!(fs::read_dir(dest.path()).expect("list").count(), 0);
    }

    #[test]
    fn atomic_copy_refuses_to_overwrite() {
        let src = tempfile::tempdir().expect("src");
        let dest = tempfile::tempdir().expect("dest");
        let source = write(src.path(), "a.pdf", &pdf("a"));
        let taken = write(dest.path(), "taken.pdf", b"keep me");

        let err = FileIngest::atomic_copy(&source, &taken).unwrap_err();
        assert!(matches!(err, IngestError::Io { ref source, .. } if source.kind() == io::ErrorKind::AlreadyExists));
        assert_eq!(fs::read(&taken).expect("read"), b"keep me");
        assert_eq!(fs::read_dir(dest.path()).expect("list").count(), 1);
    }

    #[test]
    fn bundle_rolls_back_on_failure() {
        let src = tempfile::tempdir().expect("src");
        let dest = tempfile::tempdir().expect("dest");
        let pdf_path = write(src.path(), "t.pdf", &pdf("t"));
        let cover = write(src.path(), "cover.jpg", JPEG);
        let ing = ingest();

        let items = vec![
            BundleItem {
                source: pdf_path.clone(),
                kind: FileKind::Pdf,
                name: "thesis.pdf".into(),
            },
            BundleItem {
                source: cover,
                kind: FileKind::Jpeg,
                name: "../cover.jpg".into(),
            },
        ];
        let err = ing.ingest_bundle(&items, dest.path()).unwrap_err();
        assert!(matches!(err, IngestError::UnsafeName { .. }));
        assert_eq!(fs::read_dir(dest.path()).expect("list").count(), 0);
    }

    #[test]
    fn bundle_stores_all() {
        let src = tempfile::tempdir().expect("src");
        let dest = tempfile::tempdir().expect("dest");
        let items = vec![
            BundleItem {
                source: write(src.path(), "t.pdf", &pdf("t")),
                kind: FileKind::Pdf,
                name: "400_thesis.pdf".into(),
            },
            BundleItem {
                source: write(src.path(), "f.jpg", JPEG),
                kind: FileKind::Jpeg,
                name: "400_first.jpg".into(),
            },
        ];
        let stored = ingest().ingest_bundle(&items, dest.path()).expect("bundle");
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|f| f.path.exists() && sidecar_path(&f.path).exists()));
    }

    #[test]
    fn detect_kind_rejects_unknown_extension() {
        assert_eq!(
            FileIngest::detect_kind(Path::new("a/b.JPEG")).expect("kind"),
            FileKind::Jpeg
        );
        assert!(matches!(
            FileIngest::detect_kind(Path::new("notes.docx")),
            Err(IngestError::InvalidFile(InvalidFileReason::UnsupportedExtension { .. }))
        ));
    }
}
