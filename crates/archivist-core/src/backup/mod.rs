//! Timestamped snapshots with retention, and the snapshot fallback chain used
//! when a collection file fails to parse.
//!
//! Snapshots of collection `<name>` live in their own directory:
//!
//! ```text
//! <backup_root>/<name>/<name>.20261018T093012.000417Z.json
//! <backup_root>/<name>/<name>.20261018T093012.000418Z.json
//! ```
//!
//! Stamps are UTC with microsecond resolution and strictly increasing per
//! collection (a stamp that would collide with or precede the newest one is
//! bumped by one microsecond), so lexical order is chronological order.

mod recovery;

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use thiserror::Error;

pub use recovery::{CorruptionRecovery, Recovered};

use crate::fsutil::{self, FsError};

/// Default number of snapshots kept per collection.
pub const DEFAULT_BACKUP_RETENTION: usize = 10;

/// Upper bound on a single snapshot read back during recovery.
pub const MAX_SNAPSHOT_SIZE: u64 = 256 * 1024 * 1024;

const STAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.6fZ";

/// Errors raised while snapshotting or recovering.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackupError {
    /// No snapshot of the collection could be parsed.
    #[error("no valid snapshot for {collection} ({tried} tried): {last_error}")]
    NoValidSnapshot {
        /// Collection being recovered.
        collection: String,
        /// Number of snapshots attempted.
        tried: usize,
        /// Parse error of the oldest snapshot tried, or why none were tried.
        last_error: String,
    },

    /// The collection name is not a safe path component.
    #[error("invalid collection name: {0:?}")]
    InvalidName(String),

    /// I/O error while copying, listing or pruning.
    #[error("backup I/O error: {context}: {source}")]
    Io {
        /// Description of what was being attempted.
        context: String,
        /// Underlying I/O error.
        source: io::Error,
    },
}

impl From<FsError> for BackupError {
    fn from(e: FsError) -> Self {
        Self::Io {
            context: e.context,
            source: e.source,
        }
    }
}

/// A snapshot file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Full path of the snapshot.
    pub path: PathBuf,
    /// Timestamp component of the file name.
    pub stamp: String,
}

/// Writes and prunes snapshots under a backup root.
#[derive(Debug, Clone)]
pub struct BackupRotator {
    backup_root: PathBuf,
    retention: usize,
}

impl BackupRotator {
    /// `retention == 0` keeps every snapshot.
    #[must_use]
    pub fn new(backup_root: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            backup_root: backup_root.into(),
            retention,
        }
    }

    /// Number of snapshots kept per collection (`0` means unbounded).
    #[must_use]
    pub const fn retention(&self) -> usize {
        self.retention
    }

    /// Directory holding the snapshots of `name`.
    #[must_use]
    pub fn snapshot_dir(&self, name: &str) -> PathBuf {
        self.backup_root.join(name)
    }

    /// Copy the file at `current` into a new snapshot of `name`, then prune.
    /// Returns `None` when `current` does not exist.
    pub fn snapshot(&self, name: &str, current: &Path) -> Result<Option<Snapshot>, BackupError> {
        let bytes = match std::fs::read(current) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(BackupError::Io {
                    context: format!("reading {}", current.display()),
                    source: e,
                });
            },
        };
        self.snapshot_bytes(name, &bytes).map(Some)
    }

    /// Store `bytes` as a new snapshot of `name`, then prune.
    pub fn snapshot_bytes(&self, name: &str, bytes: &[u8]) -> Result<Snapshot, BackupError> {
        validate_name(name)?;
        let dir = self.snapshot_dir(name);
        fsutil::create_dir_restricted(&dir)?;

        let newest = self.list_snapshots(name)?.into_iter().next();
        let stamp = next_stamp(Utc::now(), newest.as_ref().map(|s| s.stamp.as_str()));
        let path = dir.join(format!("{name}.{stamp}.json"));
        fsutil::atomic_write(&path, bytes)?;
        tracing::debug!(collection = %name, path = %path.display(), "snapshot written");

        self.prune(name)?;
        Ok(Snapshot { path, stamp })
    }

    /// Snapshots of `name`, newest first.
    pub fn list_snapshots(&self, name: &str) -> Result<Vec<Snapshot>, BackupError> {
        validate_name(name)?;
        let dir = self.snapshot_dir(name);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(BackupError::Io {
                    context: format!("listing {}", dir.display()),
                    source: e,
                });
            },
        };

        let prefix = format!("{name}.");
        let mut snapshots: Vec<Snapshot> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let file_name = entry.file_name().into_string().ok()?;
                let stamp = file_name.strip_prefix(&prefix)?.strip_suffix(".json")?;
                parse_stamp(stamp)?;
                Some(Snapshot {
                    stamp: stamp.to_string(),
                    path: entry.path(),
                })
            })
            .collect();
        snapshots.sort_by(|a, b| b.stamp.cmp(&a.stamp));
        Ok(snapshots)
    }

    /// Delete the oldest snapshots of `name` beyond the retention count.
    /// Returns how many were removed.
    pub fn prune(&self, name: &str) -> Result<usize, BackupError> {
        if self.retention == 0 {
            return Ok(0);
        }
        let snapshots = self.list_snapshots(name)?;
        let mut removed = 0;
        for stale in snapshots.iter().skip(self.retention) {
            if fsutil::remove_if_exists(&stale.path)? {
                removed += 1;
            }
        }
        if removed > 0 {
            fsutil::sync_dir(&self.snapshot_dir(name))?;
            tracing::info!(collection = %name, removed, retention = self.retention, "pruned snapshots");
        }
        Ok(removed)
    }
}

fn validate_name(name: &str) -> Result<(), BackupError> {
    if fsutil::is_safe_component(name) {
        Ok(())
    } else {
        Err(BackupError::InvalidName(name.to_string()))
    }
}

fn parse_stamp(stamp: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

fn format_stamp(ts: DateTime<Utc>) -> String {
    ts.format(STAMP_FORMAT).to_string()
}

/// A stamp for `now` that sorts strictly after `newest`.
fn next_stamp(now: DateTime<Utc>, newest: Option<&str>) -> String {
    let floor = newest
        .and_then(parse_stamp)
        .map(|prev| prev + ChronoDuration::microseconds(1));
    match floor {
        Some(floor) if now < floor => format_stamp(floor),
        _ => format_stamp(now),
    }
}
