//! File-backed record store: one JSON array file per collection.
//!
//! # Architecture
//!
//! ```text
//!  merge_upsert / register_unique / replace_record / migrate
//!        │
//!        ▼
//!  update_collection ──► LockManager::lock(collection)
//!        │                     │
//!        │               load (parse, or CorruptionRecovery)
//!        │                     │
//!        │               f(&mut Vec<R>)
//!        │                     │
//!        └──────────────► write: BackupRotator::snapshot ─► fsutil::atomic_write
//! ```
//!
//! Readers never take the lock: the current file is only ever replaced by an
//! atomic rename, so a reader sees either the complete old array or the
//! complete new one. The lock is taken on the read path only when the file
//! fails to parse and has to be restored from a snapshot.
//!
//! # Layout
//!
//! ```text
//! <data_dir>/<name>.json
//! <data_dir>/_bak/<name>/<name>.<stamp>.json
//! <data_dir>/_locks/<name>.lock
//! ```

mod record;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

pub use record::{deep_merge, Extra, Record, RecordKey};

use crate::backup::{BackupError, BackupRotator, CorruptionRecovery, Snapshot};
use crate::config::StoreConfig;
use crate::fsutil::{self, FsError};
use crate::lock::{LockError, LockGuard, LockManager, LockStatus, StaleLockReclaimed};

/// Upper bound on a collection file read into memory.
pub const MAX_COLLECTION_FILE_SIZE: u64 = 256 * 1024 * 1024;

/// Subdirectory of the data directory holding snapshots.
pub const BACKUP_DIR: &str = "_bak";

/// Subdirectory of the data directory holding lock tokens.
pub const LOCK_DIR: &str = "_locks";

/// Lock owner used when a reader has to restore a corrupt collection.
const RECOVERY_OWNER: &str = "archivist:recovery";

// ─────────────────────────────────────────────────────────────────────────────
// Error Types
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised by [`RecordStore`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The current file of a collection failed to parse. Reported through
    /// [`ReadOutcome::Recovered`] when a snapshot could stand in for it.
    #[error("collection {collection} is corrupt: {detail}")]
    Corruption {
        /// Affected collection.
        collection: String,
        /// Parse error.
        detail: String,
    },

    /// Neither the current file nor any snapshot parses.
    #[error("collection {collection} is unrecoverable ({tried} snapshots tried): {detail}")]
    Unrecoverable {
        /// Affected collection.
        collection: String,
        /// Snapshots attempted.
        tried: usize,
        /// Last parse error.
        detail: String,
    },

    /// A record with the same natural key already exists.
    #[error("duplicate key {key} in {collection}")]
    DuplicateKey {
        /// Affected collection.
        collection: String,
        /// Offending key.
        key: String,
    },

    /// No record with the given key exists.
    #[error("no record {key} in {collection}")]
    NotFound {
        /// Affected collection.
        collection: String,
        /// Missing key.
        key: String,
    },

    /// A patch tried to change a key field.
    #[error("patch for {key} in {collection} changes key field {field}")]
    KeyMismatch {
        /// Affected collection.
        collection: String,
        /// Key of the record being patched.
        key: String,
        /// Key field the patch contradicts.
        field: String,
    },

    /// A merged or supplied record does not fit the collection's schema.
    #[error("invalid record for {collection}: {detail}")]
    InvalidRecord {
        /// Affected collection.
        collection: String,
        /// What is wrong.
        detail: String,
    },

    /// A caller-supplied update closure rejected the change.
    #[error("update of {collection} rejected: {reason}")]
    Rejected {
        /// Affected collection.
        collection: String,
        /// Why.
        reason: String,
    },

    /// Lock acquisition failed.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Snapshot handling failed.
    #[error(transparent)]
    Backup(BackupError),

    /// I/O error on a collection file.
    #[error("store I/O error: {context}: {source}")]
    Io {
        /// Description of what was being attempted.
        context: String,
        /// Underlying I/O error.
        source: io::Error,
    },
}

impl From<FsError> for StoreError {
    fn from(e: FsError) -> Self {
        Self::Io {
            context: e.context,
            source: e.source,
        }
    }
}

impl From<BackupError> for StoreError {
    fn from(e: BackupError) -> Self {
        match e {
            BackupError::NoValidSnapshot {
                collection,
                tried,
                last_error,
            } => Self::Unrecoverable {
                collection,
                tried,
                detail: last_error,
            },
            other => Self::Backup(other),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Observer
// ─────────────────────────────────────────────────────────────────────────────

/// Noteworthy store events that callers may want to alert on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A lock abandoned by a crashed holder was replaced.
    StaleLockReclaimed(StaleLockReclaimed),
    /// A collection was restored from a snapshot after a parse failure.
    RecoveredFromSnapshot {
        collection: String,
        snapshot: PathBuf,
        cause: String,
    },
}

/// Receives [`StoreEvent`]s. Implementations must not call back into the
/// store that emitted the event.
pub trait StoreObserver: Send + Sync {
    fn on_event(&self, event: &StoreEvent);
}

// ─────────────────────────────────────────────────────────────────────────────
// Read results
// ─────────────────────────────────────────────────────────────────────────────

/// How a collection read was satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The current file parsed (or did not exist yet).
    Clean,
    /// The current file was unreadable and was restored from `snapshot`.
    Recovered { snapshot: PathBuf, cause: String },
}

/// Records of a collection together with how they were obtained.
#[derive(Debug, Clone)]
pub struct Loaded<R> {
    pub records: Vec<R>,
    pub outcome: ReadOutcome,
}

impl<R> Loaded<R> {
    const fn clean(records: Vec<R>) -> Self {
        Self {
            records,
            outcome: ReadOutcome::Clean,
        }
    }
}

enum Parsed<R> {
    Ok(Vec<R>),
    Missing,
    Corrupt(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────────────────────────────────────

/// Tunables of a [`RecordStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Lifetime of a lock token before it may be reclaimed.
    pub lock_ttl: Duration,
    /// How long a mutation waits for a held lock.
    pub lock_wait: Duration,
    /// Snapshots kept per collection; `0` keeps all.
    pub backup_retention: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lock_ttl: crate::lock::DEFAULT_LOCK_TTL,
            lock_wait: crate::lock::DEFAULT_LOCK_WAIT,
            backup_retention: crate::backup::DEFAULT_BACKUP_RETENTION,
        }
    }
}

impl From<&StoreConfig> for StoreOptions {
    fn from(config: &StoreConfig) -> Self {
        Self {
            lock_ttl: Duration::from_secs(config.lock_ttl_secs),
            lock_wait: Duration::from_millis(config.lock_wait_ms),
            backup_retention: config.backup_retention,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Record Store
// ─────────────────────────────────────────────────────────────────────────────

/// Crash-safe collection store rooted at a data directory.
#[derive(Clone)]
pub struct RecordStore {
    data_dir: PathBuf,
    locks: LockManager,
    backups: BackupRotator,
    recovery: CorruptionRecovery,
    options: StoreOptions,
    observer: Option<Arc<dyn StoreObserver>>,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("data_dir", &self.data_dir)
            .field("options", &self.options)
            .field("observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

impl RecordStore {
    /// Open (creating if needed) a store rooted at `data_dir`.
    pub fn open(data_dir: impl Into<PathBuf>, options: StoreOptions) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        fsutil::create_dir_restricted(&data_dir)?;
        let backups = BackupRotator::new(data_dir.join(BACKUP_DIR), options.backup_retention);
        Ok(Self {
            locks: LockManager::new(data_dir.join(LOCK_DIR)),
            recovery: CorruptionRecovery::new(backups.clone()),
            backups,
            data_dir,
            options,
            observer: None,
        })
    }

    /// Open a store as described by the `[store]` configuration section.
    pub fn from_config(config: &StoreConfig) -> Result<Self, StoreError> {
        Self::open(&config.data_dir, StoreOptions::from(config))
    }

    /// Attach an observer for [`StoreEvent`]s.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn StoreObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    #[must_use]
    pub const fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Path of the current file of collection `name`.
    #[must_use]
    pub fn collection_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{name}.json"))
    }

    /// Snapshots of `name`, newest first.
    pub fn snapshots(&self, name: &str) -> Result<Vec<Snapshot>, StoreError> {
        Ok(self.backups.list_snapshots(name)?)
    }

    /// Current lock holder of `name`, if any.
    pub fn lock_status(&self, name: &str) -> Result<Option<LockStatus>, StoreError> {
        Ok(self.locks.inspect(name)?)
    }

    // ── reads ───────────────────────────────────────────────────────────────

    /// All records of `R`'s collection, falling back to snapshots if the
    /// current file does not parse.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unrecoverable`] if neither the current file nor any
    /// snapshot parses. [`StoreError::InvalidRecord`] if the file is a valid
    /// JSON array but a record does not deserialize as `R`; the file and its
    /// snapshots are left as they are.
    pub fn read_collection<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        Ok(self.read_collection_with_outcome::<R>()?.records)
    }

    /// Like [`read_collection`](Self::read_collection), also reporting
    /// whether a recovery took place.
    pub fn read_collection_with_outcome<R: Record>(&self) -> Result<Loaded<R>, StoreError> {
        self.load::<R>(false)
    }

    /// The record with `key`, if present.
    pub fn find<R: Record>(&self, key: &RecordKey) -> Result<Option<R>, StoreError> {
        Ok(self
            .read_collection::<R>()?
            .into_iter()
            .find(|r| &r.key() == key))
    }

    // ── writes ──────────────────────────────────────────────────────────────

    /// Replace the whole collection with `records`.
    pub fn write_collection<R: Record>(&self, records: &[R], owner: &str) -> Result<(), StoreError> {
        let guard = self.lock(R::COLLECTION, owner)?;
        self.write_locked(records)?;
        guard.release()?;
        Ok(())
    }

    /// Locked read-modify-write of `R`'s collection. If `f` fails nothing is
    /// written.
    pub fn update_collection<R, T, F>(&self, owner: &str, f: F) -> Result<T, StoreError>
    where
        R: Record,
        F: FnOnce(&mut Vec<R>) -> Result<T, StoreError>,
    {
        let guard = self.lock(R::COLLECTION, owner)?;
        let mut records = self.load::<R>(true)?.records;
        let out = f(&mut records)?;
        self.write_locked(&records)?;
        guard.release()?;
        Ok(out)
    }

    /// Deep-merge `patch` into the record with `key`, creating it from the
    /// key fields if absent. Unknown fields already on the record are kept.
    ///
    /// # Errors
    ///
    /// [`StoreError::KeyMismatch`] if `patch` changes a key field,
    /// [`StoreError::InvalidRecord`] if the merged object does not
    /// deserialize as `R`.
    pub fn merge_upsert<R: Record>(
        &self,
        key: &RecordKey,
        patch: &Map<String, Value>,
        owner: &str,
    ) -> Result<R, StoreError> {
        check_key_fields::<R>(key, patch)?;
        self.update_collection::<R, R, _>(owner, |records| {
            let position = records.iter().position(|r| &r.key() == key);
            let mut object = match position {
                Some(i) => to_object::<R>(&records[i])?,
                None => key.seed_object(R::KEY_FIELDS),
            };
            deep_merge(&mut object, patch);
            let merged: R =
                serde_json::from_value(Value::Object(object)).map_err(|e| StoreError::InvalidRecord {
                    collection: R::COLLECTION.to_string(),
                    detail: e.to_string(),
                })?;
            match position {
                Some(i) => records[i] = merged.clone(),
                None => records.push(merged.clone()),
            }
            Ok(merged)
        })
    }

    /// Append `record`, failing if its key is already present.
    pub fn register_unique<R: Record>(&self, record: R, owner: &str) -> Result<R, StoreError> {
        self.update_collection::<R, R, _>(owner, |records| {
            let key = record.key();
            if records.iter().any(|r| r.key() == key) {
                return Err(StoreError::DuplicateKey {
                    collection: R::COLLECTION.to_string(),
                    key: key.to_string(),
                });
            }
            records.push(record.clone());
            Ok(record)
        })
    }

    /// Insert `record`, or replace the existing record with the same key in
    /// place.
    pub fn replace_record<R: Record>(&self, record: R, owner: &str) -> Result<(), StoreError> {
        self.update_collection::<R, (), _>(owner, |records| {
            let key = record.key();
            match records.iter_mut().find(|r| r.key() == key) {
                Some(slot) => *slot = record,
                None => records.push(record),
            }
            Ok(())
        })
    }

    /// Archive the `Src` record with `key` into `Dst`'s collection.
    ///
    /// The target is written with [`replace_record`](Self::replace_record),
    /// so repeating a migration is idempotent. The source record stays where
    /// it is.
    pub fn migrate<Src, Dst, F>(&self, key: &RecordKey, owner: &str, f: F) -> Result<Dst, StoreError>
    where
        Src: Record,
        Dst: Record,
        F: FnOnce(&Src) -> Result<Dst, StoreError>,
    {
        let source = self
            .find::<Src>(key)?
            .ok_or_else(|| StoreError::NotFound {
                collection: Src::COLLECTION.to_string(),
                key: key.to_string(),
            })?;
        let target = f(&source)?;
        if &target.key() != key {
            return Err(StoreError::InvalidRecord {
                collection: Dst::COLLECTION.to_string(),
                detail: format!("migrated record key {} differs from {key}", target.key()),
            });
        }
        self.replace_record(target.clone(), owner)?;
        tracing::info!(from = Src::COLLECTION, to = Dst::COLLECTION, key = %key, owner = %owner, "record migrated");
        Ok(target)
    }

    // ── internals ───────────────────────────────────────────────────────────

    fn lock(&self, name: &str, owner: &str) -> Result<LockGuard<'_>, StoreError> {
        let guard = self
            .locks
            .lock(name, owner, self.options.lock_ttl, self.options.lock_wait)?;
        if let Some(report) = guard.token().reclaimed() {
            self.notify(&StoreEvent::StaleLockReclaimed(report.clone()));
        }
        Ok(guard)
    }

    fn notify(&self, event: &StoreEvent) {
        if let Some(observer) = &self.observer {
            observer.on_event(event);
        }
    }

    fn parse_current<R: Record>(&self, path: &Path) -> Result<Parsed<R>, StoreError> {
        match fsutil::bounded_read(path, MAX_COLLECTION_FILE_SIZE) {
            // Only a file that is not a JSON array is corrupt. Well-formed
            // records that do not fit `R` are a caller schema problem and
            // must not roll the collection back.
            Ok(bytes) => match serde_json::from_slice::<Vec<Value>>(&bytes) {
                Ok(values) => typed_records::<R>(values).map(Parsed::Ok),
                Err(e) => Ok(Parsed::Corrupt(e.to_string())),
            },
            Err(e) if e.is_not_found() => Ok(Parsed::Missing),
            Err(e) if e.source.kind() == io::ErrorKind::InvalidData => {
                Ok(Parsed::Corrupt(e.to_string()))
            },
            Err(e) => Err(e.into()),
        }
    }

    fn load<R: Record>(&self, locked: bool) -> Result<Loaded<R>, StoreError> {
        let name = R::COLLECTION;
        let path = self.collection_path(name);
        let cause = match self.parse_current::<R>(&path)? {
            Parsed::Ok(records) => return Ok(Loaded::clean(records)),
            Parsed::Missing if self.backups.list_snapshots(name)?.is_empty() => {
                return Ok(Loaded::clean(Vec::new()));
            },
            Parsed::Missing => "collection file is missing".to_string(),
            Parsed::Corrupt(detail) => detail,
        };
        let corruption = StoreError::Corruption {
            collection: name.to_string(),
            detail: cause,
        };
        tracing::warn!(collection = %name, err = %corruption, "falling back to snapshots");

        if locked {
            return self.recover::<R>(&path, corruption.to_string());
        }
        // A concurrent writer or recovery may have repaired the file while we
        // waited for the lock.
        let guard = self.lock(name, RECOVERY_OWNER)?;
        let loaded = match self.parse_current::<R>(&path)? {
            Parsed::Ok(records) => Loaded::clean(records),
            _ => self.recover::<R>(&path, corruption.to_string())?,
        };
        guard.release()?;
        Ok(loaded)
    }

    fn recover<R: Record>(&self, path: &Path, cause: String) -> Result<Loaded<R>, StoreError> {
        let name = R::COLLECTION;
        let recovered = self.recovery.recover(name, path, parse_records::<R>)?;
        self.notify(&StoreEvent::RecoveredFromSnapshot {
            collection: name.to_string(),
            snapshot: recovered.snapshot.clone(),
            cause: cause.clone(),
        });
        Ok(Loaded {
            records: recovered.value,
            outcome: ReadOutcome::Recovered {
                snapshot: recovered.snapshot,
                cause,
            },
        })
    }

    /// Snapshot the outgoing file and atomically replace it. Caller holds
    /// the collection lock.
    fn write_locked<R: Record>(&self, records: &[R]) -> Result<(), StoreError> {
        let name = R::COLLECTION;
        let path = self.collection_path(name);

        match fsutil::bounded_read(&path, MAX_COLLECTION_FILE_SIZE) {
            Ok(outgoing) if serde_json::from_slice::<Vec<Value>>(&outgoing).is_ok() => {
                self.backups.snapshot_bytes(name, &outgoing)?;
            },
            Ok(_) => {
                tracing::warn!(collection = %name, "outgoing collection file is not a JSON array; not snapshotting it");
            },
            Err(e) if e.is_not_found() => {
                // Bootstrap so the first write also leaves a snapshot behind.
                self.backups.snapshot_bytes(name, b"[]")?;
            },
            Err(e) => return Err(e.into()),
        }

        let bytes = serde_json::to_vec_pretty(records).map_err(|e| StoreError::InvalidRecord {
            collection: name.to_string(),
            detail: e.to_string(),
        })?;
        fsutil::atomic_write(&path, &bytes)?;
        tracing::debug!(collection = %name, records = records.len(), "collection written");
        Ok(())
    }
}

fn parse_records<R: Record>(bytes: &[u8]) -> Result<Vec<R>, String> {
    serde_json::from_slice(bytes).map_err(|e| e.to_string())
}

fn typed_records<R: Record>(values: Vec<Value>) -> Result<Vec<R>, StoreError> {
    values
        .into_iter()
        .enumerate()
        .map(|(index, value)| {
            serde_json::from_value(value).map_err(|e| StoreError::InvalidRecord {
                collection: R::COLLECTION.to_string(),
                detail: format!("record {index}: {e}"),
            })
        })
        .collect()
}

fn to_object<R: Record>(record: &R) -> Result<Map<String, Value>, StoreError> {
    match serde_json::to_value(record) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::InvalidRecord {
            collection: R::COLLECTION.to_string(),
            detail: format!("record serializes to {other}, not an object"),
        }),
        Err(e) => Err(StoreError::InvalidRecord {
            collection: R::COLLECTION.to_string(),
            detail: e.to_string(),
        }),
    }
}

fn check_key_fields<R: Record>(key: &RecordKey, patch: &Map<String, Value>) -> Result<(), StoreError> {
    if key.parts().len() != R::KEY_FIELDS.len() {
        return Err(StoreError::InvalidRecord {
            collection: R::COLLECTION.to_string(),
            detail: format!(
                "key {key} has {} parts, expected {}",
                key.parts().len(),
                R::KEY_FIELDS.len()
            ),
        });
    }
    for (field, expected) in R::KEY_FIELDS.iter().zip(key.parts()) {
        match patch.get(*field) {
            None => {},
            Some(Value::String(actual)) if actual == expected => {},
            Some(_) => {
                return Err(StoreError::KeyMismatch {
                    collection: R::COLLECTION.to_string(),
                    key: key.to_string(),
                    field: (*field).to_string(),
                });
            },
        }
    }
    Ok(())
}
