//! Advisory per-collection locking with stale-lock reclamation.
//!
//! A lock is a small JSON token file at `<lock_dir>/<name>.lock` recording
//! the owner, a random nonce, the acquisition time and a TTL. A token older
//! than its TTL is considered abandoned (its holder crashed) and the next
//! acquirer replaces it.
//!
//! The read-check-create sequence on the token is itself serialized across
//! processes by an exclusive `fs2` lock on `<lock_dir>/<name>.guard`, so two
//! acquirers can never both observe "free" or both reclaim the same stale
//! token. The guard is held only for the duration of that sequence; the
//! token is what callers hold while they work.
//!
//! ```text
//!   acquire ──► flock(guard) ──► read token ──┬─ absent/expired ─► write token ─► unlock guard ─► LockToken
//!                                             └─ valid ──────────► unlock guard ─► sleep(poll+jitter) ─► retry
//! ```

use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fsutil::{self, FsError};
use crate::time::unix_millis;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Base interval between acquisition attempts while a lock is held.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Maximum random jitter added to each poll interval.
pub const LOCK_POLL_JITTER_MS: u64 = 25;

/// Default token time-to-live.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

/// Default wait budget for [`LockManager::acquire`].
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(10);

/// Token files are tiny; anything bigger is garbage.
pub const MAX_TOKEN_FILE_SIZE: u64 = 64 * 1024;

/// Owner recorded for a token file whose content could not be parsed.
const UNREADABLE_OWNER: &str = "<unreadable>";

// ─────────────────────────────────────────────────────────────────────────────
// Error Types
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised by [`LockManager`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LockError {
    /// The wait budget elapsed while another valid token existed.
    #[error(
        "lock acquisition timed out for {collection} after {waited_ms}ms (held by {holder})"
    )]
    Timeout {
        /// Collection that could not be locked.
        collection: String,
        /// Owner of the token that blocked us.
        holder: String,
        /// How long we waited.
        waited_ms: u64,
    },

    /// The lock name is not a safe path component.
    #[error("invalid lock name: {0:?}")]
    InvalidName(String),

    /// I/O error while manipulating the token or guard file.
    #[error("lock I/O error: {context}: {source}")]
    Io {
        /// Description of what was being attempted.
        context: String,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Token could not be serialized.
    #[error("lock token serialization error: {0}")]
    Serialization(String),
}

impl LockError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<FsError> for LockError {
    fn from(e: FsError) -> Self {
        Self::io(e.context, e.source)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Token Types
// ─────────────────────────────────────────────────────────────────────────────

/// On-disk content of a lock token file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Identity supplied by the acquirer.
    pub owner: String,
    /// Random value distinguishing this acquisition from any other.
    pub nonce: String,
    /// Acquisition time, milliseconds since the Unix epoch.
    pub acquired_at_ms: u64,
    /// Time-to-live in milliseconds.
    pub ttl_ms: u64,
}

impl TokenRecord {
    /// Age of the token at `now_ms`.
    #[must_use]
    pub const fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.acquired_at_ms)
    }

    /// A token older than its TTL belongs to a holder presumed dead.
    #[must_use]
    pub const fn is_expired(&self, now_ms: u64) -> bool {
        self.age_ms(now_ms) > self.ttl_ms
    }
}

/// Report attached to a token when acquiring it replaced an abandoned one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleLockReclaimed {
    /// Collection whose lock was reclaimed.
    pub collection: String,
    /// Owner recorded in the abandoned token.
    pub previous_owner: String,
    /// Age of the abandoned token when it was replaced.
    pub age_ms: u64,
    /// TTL the abandoned token declared.
    pub ttl_ms: u64,
}

impl fmt::Display for StaleLockReclaimed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reclaimed stale lock on {} from {} (age {}ms > ttl {}ms)",
            self.collection, self.previous_owner, self.age_ms, self.ttl_ms
        )
    }
}

/// Proof of holding a collection lock.
#[derive(Debug, Clone)]
pub struct LockToken {
    collection: String,
    record: TokenRecord,
    reclaimed: Option<StaleLockReclaimed>,
}

impl LockToken {
    /// Collection this token locks.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Owner identity recorded in the token.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.record.owner
    }

    /// Nonce identifying this acquisition.
    #[must_use]
    pub fn nonce(&self) -> &str {
        &self.record.nonce
    }

    /// Full on-disk record.
    #[must_use]
    pub const fn record(&self) -> &TokenRecord {
        &self.record
    }

    /// Set when this acquisition replaced an abandoned token.
    #[must_use]
    pub const fn reclaimed(&self) -> Option<&StaleLockReclaimed> {
        self.reclaimed.as_ref()
    }
}

/// Current state of a lock as seen by [`LockManager::inspect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockStatus {
    /// Token currently on disk.
    pub holder: TokenRecord,
    /// Age of the token at inspection time.
    pub age_ms: u64,
    /// Whether the next acquirer would reclaim it.
    pub expired: bool,
}

enum Attempt {
    Acquired(LockToken),
    Held(TokenRecord),
}

// ─────────────────────────────────────────────────────────────────────────────
// Lock Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Manages token files under a single lock directory.
#[derive(Debug, Clone)]
pub struct LockManager {
    lock_dir: PathBuf,
}

impl LockManager {
    /// Create a manager rooted at `lock_dir`. The directory is created lazily.
    #[must_use]
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
        }
    }

    /// Directory holding token and guard files.
    #[must_use]
    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Path of the token file for `name`.
    #[must_use]
    pub fn token_path(&self, name: &str) -> PathBuf {
        self.lock_dir.join(format!("{name}.lock"))
    }

    fn guard_path(&self, name: &str) -> PathBuf {
        self.lock_dir.join(format!("{name}.guard"))
    }

    /// Acquire the lock on `name`, polling with jitter until it is free or
    /// `wait` elapses. A zero `wait` makes exactly one attempt.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Timeout`] if another valid token exists for the
    /// whole wait budget, [`LockError::InvalidName`] for unsafe names, and
    /// [`LockError::Io`] on filesystem failures.
    pub fn acquire(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<LockToken, LockError> {
        validate_name(name)?;
        let start = Instant::now();
        loop {
            let holder = match self.attempt(name, owner, ttl)? {
                Attempt::Acquired(token) => return Ok(token),
                Attempt::Held(holder) => holder,
            };
            let elapsed = start.elapsed();
            if elapsed >= wait {
                return Err(LockError::Timeout {
                    collection: name.to_string(),
                    holder: holder.owner,
                    waited_ms: duration_millis(elapsed),
                });
            }
            let jitter_ms = rand::random::<u64>() % (LOCK_POLL_JITTER_MS + 1);
            let pause = (LOCK_POLL_INTERVAL + Duration::from_millis(jitter_ms)).min(wait - elapsed);
            std::thread::sleep(pause);
        }
    }

    /// Acquire the lock and wrap it in a guard that releases on drop.
    ///
    /// # Errors
    ///
    /// Same as [`LockManager::acquire`].
    pub fn lock(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<LockGuard<'_>, LockError> {
        let token = self.acquire(name, owner, ttl, wait)?;
        Ok(LockGuard {
            manager: self,
            token,
            released: false,
        })
    }

    /// Release a token. Idempotent: a token that was already released or
    /// reclaimed by someone else is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Io`] if the token file cannot be removed.
    pub fn release(&self, token: &LockToken) -> Result<(), LockError> {
        let name = token.collection();
        validate_name(name)?;
        let _guard = self.guard(name)?;
        let path = self.token_path(name);
        match read_token(&path)? {
            Some(Ok(current)) if current.nonce == token.nonce() => {
                fsutil::remove_if_exists(&path)?;
                fsutil::sync_dir(&self.lock_dir)?;
                tracing::debug!(collection = %name, owner = %token.owner(), "lock released");
            },
            _ => {
                tracing::debug!(
                    collection = %name,
                    owner = %token.owner(),
                    "lock already released or reclaimed; nothing to do"
                );
            },
        }
        Ok(())
    }

    /// Report the current holder of `name`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Io`] on filesystem failures.
    pub fn inspect(&self, name: &str) -> Result<Option<LockStatus>, LockError> {
        validate_name(name)?;
        let now = unix_millis();
        Ok(read_token(&self.token_path(name))?.map(|parsed| {
            let holder = parsed.unwrap_or_else(unreadable_record);
            LockStatus {
                age_ms: holder.age_ms(now),
                expired: holder.is_expired(now),
                holder,
            }
        }))
    }

    fn guard(&self, name: &str) -> Result<File, LockError> {
        let path = self.guard_path(name);
        let file = fsutil::open_lock_file(&path)?;
        file.lock_exclusive()
            .map_err(|e| LockError::io(format!("locking guard {}", path.display()), e))?;
        Ok(file)
    }

    fn attempt(&self, name: &str, owner: &str, ttl: Duration) -> Result<Attempt, LockError> {
        let _guard = self.guard(name)?;
        let path = self.token_path(name);
        let now = unix_millis();

        let reclaimed = match read_token(&path)? {
            None => None,
            Some(Ok(existing)) if !existing.is_expired(now) => {
                return Ok(Attempt::Held(existing));
            },
            Some(parsed) => {
                let stale = parsed.unwrap_or_else(unreadable_record);
                let report = StaleLockReclaimed {
                    collection: name.to_string(),
                    previous_owner: stale.owner.clone(),
                    age_ms: stale.age_ms(now),
                    ttl_ms: stale.ttl_ms,
                };
                tracing::warn!(
                    collection = %name,
                    owner = %owner,
                    previous_owner = %report.previous_owner,
                    age_ms = report.age_ms,
                    ttl_ms = report.ttl_ms,
                    "reclaiming stale lock"
                );
                Some(report)
            },
        };

        let record = TokenRecord {
            owner: owner.to_string(),
            nonce: uuid::Uuid::new_v4().to_string(),
            acquired_at_ms: now,
            ttl_ms: duration_millis(ttl),
        };
        let bytes =
            serde_json::to_vec(&record).map_err(|e| LockError::Serialization(e.to_string()))?;
        fsutil::atomic_write(&path, &bytes)?;
        tracing::debug!(collection = %name, owner = %owner, "lock acquired");

        Ok(Attempt::Acquired(LockToken {
            collection: name.to_string(),
            record,
            reclaimed,
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RAII Guard
// ─────────────────────────────────────────────────────────────────────────────

/// Holds a [`LockToken`] and releases it when dropped.
#[derive(Debug)]
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    token: LockToken,
    released: bool,
}

impl LockGuard<'_> {
    /// The held token.
    #[must_use]
    pub const fn token(&self) -> &LockToken {
        &self.token
    }

    /// Release explicitly, surfacing any error instead of logging it.
    ///
    /// # Errors
    ///
    /// Same as [`LockManager::release`].
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.manager.release(&self.token)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.manager.release(&self.token) {
            tracing::warn!(collection = %self.token.collection(), err = %e, "failed to release lock on drop");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn validate_name(name: &str) -> Result<(), LockError> {
    if fsutil::is_safe_component(name) {
        Ok(())
    } else {
        Err(LockError::InvalidName(name.to_string()))
    }
}

/// `None` when no token exists; `Some(Err(()))` when one exists but cannot
/// be parsed.
fn read_token(path: &Path) -> Result<Option<Result<TokenRecord, ()>>, LockError> {
    match fsutil::bounded_read(path, MAX_TOKEN_FILE_SIZE) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
            tracing::warn!(path = %path.display(), err = %e, "lock token is unreadable");
        }))),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) if e.source.kind() == io::ErrorKind::InvalidData => Ok(Some(Err(()))),
        Err(e) => Err(e.into()),
    }
}

/// An unparseable token is treated as abandoned long ago.
fn unreadable_record(_: ()) -> TokenRecord {
    TokenRecord {
        owner: UNREADABLE_OWNER.to_string(),
        nonce: String::new(),
        acquired_at_ms: 0,
        ttl_ms: 0,
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    fn manager() -> (tempfile::TempDir, LockManager) {
        let dir = tempfile::tempdir().expect("temp dir");
        let mgr = LockManager::new(dir.path().join("_locks"));
        (dir, mgr)
    }

    #[test]
    fn acquire_writes_token_and_release_removes_it() {
        let (_dir, mgr) = manager();
        let token = mgr
            .acquire("students", "alice", TTL, Duration::ZERO)
            .expect("acquire");
        assert_eq!(token.owner(), "alice");
        assert!(token.reclaimed().is_none());
        assert!(mgr.token_path("students").exists());

        mgr.release(&token).expect("release");
        assert!(!mgr.token_path("students").exists());
    }

    #[test]
    fn release_is_idempotent() {
        let (_dir, mgr) = manager();
        let token = mgr
            .acquire("students", "alice", TTL, Duration::ZERO)
            .expect("acquire");
        mgr.release(&token).expect("first release");
        mgr.release(&token).expect("second release");
    }

    #[test]
    fn held_lock_times_out() {
        let (_dir, mgr) = manager();
        let _held = mgr
            .acquire("courses", "alice", TTL, Duration::ZERO)
            .expect("acquire");

        let start = Instant::now();
        let err = mgr
            .acquire("courses", "bob", TTL, Duration::from_millis(120))
            .expect_err("must time out");
        assert!(start.elapsed() >= Duration::from_millis(120));
        match err {
            LockError::Timeout {
                collection, holder, ..
            } => {
                assert_eq!(collection, "courses");
                assert_eq!(holder, "alice");
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn expired_token_is_reclaimed_and_reported() {
        let (_dir, mgr) = manager();
        let _abandoned = mgr
            .acquire("theses", "crashed", Duration::from_millis(1), Duration::ZERO)
            .expect("acquire");
        std::thread::sleep(Duration::from_millis(20));

        let token = mgr
            .acquire("theses", "bob", TTL, Duration::ZERO)
            .expect("reclaim");
        let report = token.reclaimed().expect("reclaim report");
        assert_eq!(report.previous_owner, "crashed");
        assert!(report.age_ms > report.ttl_ms);
    }

    #[test]
    fn release_after_reclaim_does_not_remove_new_holder() {
        let (_dir, mgr) = manager();
        let stale = mgr
            .acquire("theses", "slow", Duration::from_millis(1), Duration::ZERO)
            .expect("acquire");
        std::thread::sleep(Duration::from_millis(20));
        let fresh = mgr
            .acquire("theses", "bob", TTL, Duration::ZERO)
            .expect("reclaim");

        mgr.release(&stale).expect("stale release is a no-op");
        let status = mgr.inspect("theses").expect("inspect").expect("still held");
        assert_eq!(status.holder.nonce, fresh.nonce());
    }

    #[test]
    fn garbage_token_is_reclaimed() {
        let (_dir, mgr) = manager();
        fsutil::atomic_write(&mgr.token_path("students"), b"{not json").expect("write");

        let token = mgr
            .acquire("students", "alice", TTL, Duration::ZERO)
            .expect("reclaim");
        assert_eq!(
            token.reclaimed().expect("report").previous_owner,
            UNREADABLE_OWNER
        );
    }

    #[test]
    fn inspect_reports_holder_and_expiry() {
        let (_dir, mgr) = manager();
        assert!(mgr.inspect("students").expect("inspect").is_none());

        let _token = mgr
            .acquire("students", "alice", TTL, Duration::ZERO)
            .expect("acquire");
        let status = mgr.inspect("students").expect("inspect").expect("held");
        assert_eq!(status.holder.owner, "alice");
        assert!(!status.expired);
    }

    #[test]
    fn guard_releases_on_drop() {
        let (_dir, mgr) = manager();
        {
            let guard = mgr
                .lock("students", "alice", TTL, Duration::ZERO)
                .expect("lock");
            assert_eq!(guard.token().owner(), "alice");
        }
        assert!(mgr.inspect("students").expect("inspect").is_none());
    }

    #[test]
    fn rejects_unsafe_names() {
        let (_dir, mgr) = manager();
        assert!(matches!(
            mgr.acquire("../etc", "alice", TTL, Duration::ZERO),
            Err(LockError::InvalidName(_))
        ));
    }

    #[test]
    fn contending_threads_are_mutually_exclusive() {
        let (_dir, mgr) = manager();
        let mgr = Arc::new(mgr);
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let mgr = Arc::clone(&mgr);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        let guard = mgr
                            .lock("shared", &format!("worker-{i}"), TTL, Duration::from_secs(10))
                            .expect("lock");
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(2));
                        inside.fetch_sub(1, Ordering::SeqCst);
                        guard.release().expect("release");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
