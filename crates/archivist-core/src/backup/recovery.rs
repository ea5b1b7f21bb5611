//! Fallback from a corrupt current file to the newest parseable snapshot.

use std::path::{Path, PathBuf};

use super::{BackupError, BackupRotator, MAX_SNAPSHOT_SIZE};
use crate::fsutil;

/// Suffix of the quarantined copy of a current file that failed to parse.
pub const QUARANTINE_SUFFIX: &str = "corrupt";

/// Outcome of a successful recovery.
#[derive(Debug, Clone)]
pub struct Recovered<T> {
    /// Parsed content of the snapshot that was restored.
    pub value: T,
    /// Snapshot the current file was restored from.
    pub snapshot: PathBuf,
    /// Newer snapshots that failed to parse and were skipped.
    pub skipped: usize,
}

/// Walks a collection's snapshots newest to oldest and restores the first
/// one that parses as the current file.
#[derive(Debug, Clone)]
pub struct CorruptionRecovery {
    backups: BackupRotator,
}

impl CorruptionRecovery {
    #[must_use]
    pub const fn new(backups: BackupRotator) -> Self {
        Self { backups }
    }

    /// Restore `current` from the newest snapshot of `name` that `parse`
    /// accepts.
    ///
    /// The unreadable current file (if any) is kept beside it as
    /// `<file>.corrupt`, replacing an earlier quarantined copy. The caller must
    /// hold the collection lock.
    ///
    /// # Errors
    ///
    /// [`BackupError::NoValidSnapshot`] when no snapshot parses. The current
    /// file is left untouched in that case.
    pub fn recover<T, F>(
        &self,
        name: &str,
        current: &Path,
        parse: F,
    ) -> Result<Recovered<T>, BackupError>
    where
        F: Fn(&[u8]) -> Result<T, String>,
    {
        let snapshots = self.backups.list_snapshots(name)?;
        let mut last_error = String::from("no snapshots exist");

        for (skipped, snapshot) in snapshots.iter().enumerate() {
            let bytes = match fsutil::bounded_read(&snapshot.path, MAX_SNAPSHOT_SIZE) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(collection = %name, path = %snapshot.path.display(), err = %e, "snapshot unreadable");
                    last_error = e.to_string();
                    continue;
                },
            };
            let value = match parse(&bytes) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(collection = %name, path = %snapshot.path.display(), err = %e, "snapshot does not parse");
                    last_error = e;
                    continue;
                },
            };

            quarantine(current)?;
            fsutil::atomic_write(current, &bytes)?;
            tracing::info!(
                collection = %name,
                snapshot = %snapshot.path.display(),
                skipped,
                "restored collection from snapshot"
            );
            return Ok(Recovered {
                value,
                snapshot: snapshot.path.clone(),
                skipped,
            });
        }

        Err(BackupError::NoValidSnapshot {
            collection: name.to_string(),
            tried: snapshots.len(),
            last_error,
        })
    }
}

fn quarantine(current: &Path) -> Result<(), BackupError> {
    if !current.exists() {
        return Ok(());
    }
    let mut target = current.as_os_str().to_owned();
    target.push(".");
    target.push(QUARANTINE_SUFFIX);
    let target = PathBuf::from(target);
    std::fs::rename(current, &target).map_err(|e| BackupError::Io {
        context: format!("quarantining {}", current.display()),
        source: e,
    })?;
    tracing::warn!(path = %current.display(), quarantined = %target.display(), "moved unreadable collection file aside");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn parse_array(bytes: &[u8]) -> Result<Vec<u32>, String> {
        serde_json::from_slice(bytes).map_err(|e| e.to_string())
    }

    #[test]
    fn restores_newest_parseable_snapshot() {
        let dir = tempfile::tempdir().expect("temp dir");
        let rotator = BackupRotator::new(dir.path().join("_bak"), 10);
        rotator.snapshot_bytes("courses", b"[1]").expect("snap");
        rotator.snapshot_bytes("courses", b"[1,2]").expect("snap");
        rotator.snapshot_bytes("courses", b"[1,2,").expect("snap");

        let current = dir.path().join("courses.json");
        fs::write(&current, b"[1,2,3").expect("write corrupt");

        let recovery = CorruptionRecovery::new(rotator);
        let recovered = recovery
            .recover("courses", &current, parse_array)
            .expect("recover");
        assert_eq!(recovered.value, vec![1, 2]);
        assert_eq!(recovered.skipped, 1);
        assert_eq!(fs::read(&current).expect("read"), b"[1,2]");
        assert_eq!(
            fs::read(dir.path().join("courses.json.corrupt")).expect("quarantine"),
            b"[1,2,3"
        );
    }

    #[test]
    fn fails_when_nothing_parses() {
        let dir = tempfile::tempdir().expect("temp dir");
        let rotator = BackupRotator::new(dir.path().join("_bak"), 10);
        rotator.snapshot_bytes("courses", b"{").expect("snap");

        let current = dir.path().join("courses.json");
        fs::write(&current, b"[").expect("write corrupt");

        let err = CorruptionRecovery::new(rotator)
            .recover("courses", &current, parse_array)
            .expect_err("unrecoverable");
        assert!(matches!(err, BackupError::NoValidSnapshot { tried: 1, .. }));
        assert_eq!(fs::read(&current).expect("untouched"), b"[");
    }
}
