//! Append-only line log with size-based rotation and retention.
//!
//! `audit.jsonl` rotates to `audit.000001.jsonl`, `audit.000002.jsonl`, ...
//! Sequence numbers only grow; the oldest rotated files beyond the retention
//! count are deleted.
//!
//! Appends are serialized in-process by a mutex and across processes by an
//! exclusive `fs2` lock on `<file>.lock`, so rotation and append never
//! interleave.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;

use super::LogError;
use crate::fsutil;

/// Default rotation threshold.
pub const DEFAULT_ROTATE_BYTES: u64 = 10 * 1024 * 1024;

/// Width of the zero-padded rotation sequence.
const SEQ_WIDTH: usize = 6;

/// Upper bound on a single log file read back into memory.
const MAX_READ_BYTES: u64 = 256 * 1024 * 1024;

/// When to rotate and how many rotated files to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    /// Rotate when the current size plus the pending line would exceed this.
    pub rotate_bytes: u64,
    /// Rotated files kept.
    pub retention: usize,
}

/// A single append-only log file plus its rotated predecessors.
#[derive(Debug)]
pub struct RotatingLog {
    path: PathBuf,
    stem: String,
    extension: String,
    policy: RotationPolicy,
    write_lock: Mutex<()>,
}

impl RotatingLog {
    /// # Errors
    ///
    /// [`LogError::InvalidPath`] if `path` has no UTF-8 file stem.
    pub fn new(path: impl Into<PathBuf>, policy: RotationPolicy) -> Result<Self, LogError> {
        let path = path.into();
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| LogError::InvalidPath(path.clone()))?
            .to_string();
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("log")
            .to_string();
        Ok(Self {
            path,
            stem,
            extension,
            policy,
            write_lock: Mutex::new(()),
        })
    }

    /// Path of the live file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn policy(&self) -> RotationPolicy {
        self.policy
    }

    fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    fn rotated_path(&self, seq: u64) -> PathBuf {
        self.dir().join(format!(
            "{}.{:0width$}.{}",
            self.stem,
            seq,
            self.extension,
            width = SEQ_WIDTH
        ))
    }

    /// Append `line` plus a newline and `fsync`, rotating first if needed.
    pub fn append_line(&self, line: &str) -> Result<(), LogError> {
        let _in_process = self.write_lock.lock().map_err(|_| LogError::Poisoned)?;
        let lock_path = self.lock_path();
        let lock_file = fsutil::open_lock_file(&lock_path)?;
        lock_file
            .lock_exclusive()
            .map_err(|e| LogError::io(format!("locking {}", lock_path.display()), e))?;

        let pending = line.len() as u64 + 1;
        if let Ok(meta) = fs::metadata(&self.path) {
            if meta.len() > 0 && meta.len() + pending > self.policy.rotate_bytes {
                self.rotate_locked()?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| LogError::io(format!("opening {}", self.path.display()), e))?;
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        file.write_all(&buf)
            .map_err(|e| LogError::io(format!("appending to {}", self.path.display()), e))?;
        file.sync_all()
            .map_err(|e| LogError::io(format!("syncing {}", self.path.display()), e))?;
        drop(lock_file);
        Ok(())
    }

    /// Rotated files, oldest first.
    pub fn rotated_files(&self) -> Result<Vec<(u64, PathBuf)>, LogError> {
        let dir = self.dir();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LogError::io(format!("listing {}", dir.display()), e)),
        };
        let prefix = format!("{}.", self.stem);
        let suffix = format!(".{}", self.extension);
        let mut rotated: Vec<(u64, PathBuf)> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let seq = name.strip_prefix(&prefix)?.strip_suffix(&suffix)?;
                if seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                Some((seq.parse().ok()?, entry.path()))
            })
            .collect();
        rotated.sort_by_key(|(seq, _)| *seq);
        Ok(rotated)
    }

    fn rotate_locked(&self) -> Result<(), LogError> {
        let rotated = self.rotated_files()?;
        let next = rotated.last().map_or(1, |(seq, _)| seq + 1);
        let target = self.rotated_path(next);
        fs::rename(&self.path, &target).map_err(|e| {
            LogError::io(
                format!(
                    "rotating {} -> {}",
                    self.path.display(),
                    target.display()
                ),
                e,
            )
        })?;
        tracing::debug!(path = %self.path.display(), rotated = %target.display(), "log rotated");

        let total = rotated.len() + 1;
        if total > self.policy.retention {
            for (_, old) in rotated.iter().take(total - self.policy.retention) {
                if let Err(e) = fsutil::remove_if_exists(old) {
                    tracing::warn!(path = %old.display(), err = %e, "failed to delete rotated log");
                }
            }
            // Retention 0 keeps no rotated file at all.
            if self.policy.retention == 0 {
                fsutil::remove_if_exists(&target)?;
            }
        }
        fsutil::sync_dir(self.dir())?;
        Ok(())
    }

    /// The last `max_lines` lines across the live file and, if it holds
    /// fewer, the newest rotated files. Oldest first.
    pub fn read_tail(&self, max_lines: usize) -> Result<Vec<String>, LogError> {
        let mut sources = vec![self.path.clone()];
        sources.extend(self.rotated_files()?.into_iter().rev().map(|(_, p)| p));

        let mut tail: Vec<String> = Vec::new();
        for source in sources {
            if tail.len() >= max_lines {
                break;
            }
            let bytes = match fsutil::bounded_read(&source, MAX_READ_BYTES) {
                Ok(bytes) => bytes,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };
            let text = String::from_utf8_lossy(&bytes);
            let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
            let take = (max_lines - tail.len()).min(lines.len());
            let mut older: Vec<String> = lines[lines.len() - take..]
                .iter()
                .map(|l| (*l).to_string())
                .collect();
            older.append(&mut tail);
            tail = older;
        }
        Ok(tail)
    }

    /// Delete the live file and every rotated file.
    pub fn purge(&self) -> Result<(), LogError> {
        let _in_process = self.write_lock.lock().map_err(|_| LogError::Poisoned)?;
        let lock_path = self.lock_path();
        let lock_file = fsutil::open_lock_file(&lock_path)?;
        lock_file
            .lock_exclusive()
            .map_err(|e| LogError::io(format!("locking {}", lock_path.display()), e))?;
        fsutil::remove_if_exists(&self.path)?;
        for (_, rotated) in self.rotated_files()? {
            fsutil::remove_if_exists(&rotated)?;
        }
        fsutil::sync_dir(self.dir())?;
        Ok(())
    }

    /// Atomically copy the live file to `dest`. A missing live file exports
    /// as empty.
    pub fn export(&self, dest: &Path) -> Result<u64, LogError> {
        let bytes = match fsutil::bounded_read(&self.path, MAX_READ_BYTES) {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        fsutil::atomic_write(dest, &bytes)?;
        Ok(bytes.len() as u64)
    }
}
