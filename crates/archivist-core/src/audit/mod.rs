//! Dual-stream audit log.
//!
//! Every entry is appended to two files in the audit directory:
//!
//! - `audit.log`: one pipe-delimited line per entry for humans,
//!   `ts | LEVEL    | actor        | action                   | outcome   | detail`,
//!   with secrets redacted and PII always masked.
//! - `audit.jsonl`: one JSON object per line for machines. Secrets are always
//!   redacted; PII follows [`StructuredPii`].
//!
//! Both files rotate independently by size.

use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use crate::config::StructuredPii;
use crate::config::AuditConfig;
use crate::log::redact::MAX_COLUMN_CHARS;
use crate::log::{redact_secrets, sanitize_column, strip_controls, LogError, Redactor, RotatingLog, RotationPolicy};
use crate::store::{StoreEvent, StoreObserver};

/// Version of the structured record layout.
pub const SCHEMA_VERSION: u32 = 1;

/// File name of the human-readable stream.
pub const HUMAN_LOG_FILE: &str = "audit.log";

/// File name of the structured stream.
pub const STRUCTURED_LOG_FILE: &str = "audit.jsonl";

/// Errors raised by [`AuditLog`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuditError {
    /// One of the two streams could not be written.
    #[error("audit {stream} stream write failed: {source}")]
    Write {
        /// `human` or `structured`.
        stream: &'static str,
        /// Underlying log error.
        source: LogError,
    },

    /// The structured record could not be serialized.
    #[error("audit record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The audit directory could not be prepared.
    #[error("audit I/O error: {context}: {source}")]
    Io {
        /// Description of what was being attempted.
        context: String,
        /// Underlying I/O error.
        source: io::Error,
    },

    #[error(transparent)]
    Log(#[from] LogError),
}

/// Severity of an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditLevel {
    Info,
    Warn,
    Error,
    /// Authentication and authorization events.
    Security,
}

impl AuditLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Security => "SECURITY",
        }
    }
}

impl fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for AuditLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INFO" => Ok(Self::Info),
            "WARN" | "WARNING" => Ok(Self::Warn),
            "ERROR" => Ok(Self::Error),
            "SECURITY" => Ok(Self::Security),
            _ => Err(format!("unknown audit level {s:?}")),
        }
    }
}

/// Result of the audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    Denied,
    /// The system repaired itself (stale lock, snapshot restore).
    Recovered,
}

impl Outcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Denied => "denied",
            Self::Recovered => "recovered",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "denied" => Ok(Self::Denied),
            "recovered" => Ok(Self::Recovered),
            _ => Err(format!("unknown outcome {s:?}")),
        }
    }
}

/// An entry to be audited.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub level: AuditLevel,
    pub actor: String,
    pub action: String,
    pub outcome: Outcome,
    pub detail: String,
    pub role: Option<String>,
    pub session: Option<String>,
    pub payload: Map<String, Value>,
}

impl AuditEntry {
    /// A successful `INFO` entry.
    #[must_use]
    pub fn info(actor: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            level: AuditLevel::Info,
            actor: actor.into(),
            action: action.into(),
            outcome: Outcome::Success,
            detail: String::new(),
            role: None,
            session: None,
            payload: Map::new(),
        }
    }

    #[must_use]
    pub fn warn(actor: impl Into<String>, action: impl Into<String>) -> Self {
        Self::info(actor, action).with_level(AuditLevel::Warn)
    }

    /// A failed `ERROR` entry.
    #[must_use]
    pub fn error(actor: impl Into<String>, action: impl Into<String>) -> Self {
        Self::info(actor, action)
            .with_level(AuditLevel::Error)
            .with_outcome(Outcome::Failure)
    }

    #[must_use]
    pub fn security(actor: impl Into<String>, action: impl Into<String>, outcome: Outcome) -> Self {
        Self::info(actor, action)
            .with_level(AuditLevel::Security)
            .with_outcome(outcome)
    }

    #[must_use]
    pub const fn with_level(mut self, level: AuditLevel) -> Self {
        self.level = level;
        self
    }

    #[must_use]
    pub const fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    #[must_use]
    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    /// Attach a payload field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

/// One line of `audit.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub schema_version: u32,
    pub ts: String,
    pub level: AuditLevel,
    pub actor: String,
    pub role: Option<String>,
    pub action: String,
    pub outcome: Outcome,
    pub detail: String,
    pub session: Option<String>,
    pub payload: Map<String, Value>,
}

/// Append-only dual-stream audit log.
#[derive(Debug)]
pub struct AuditLog {
    human: RotatingLog,
    structured: RotatingLog,
    redactor: Redactor,
    structured_pii: StructuredPii,
    dropped: AtomicU64,
}

impl AuditLog {
    /// Open the audit streams in `dir`, creating it if needed.
    pub fn open(dir: &Path, config: &AuditConfig) -> Result<Self, AuditError> {
        crate::fsutil::create_dir_restricted(dir).map_err(|e| AuditError::Io {
            context: e.context,
            source: e.source,
        })?;
        let policy = RotationPolicy {
            rotate_bytes: config.rotate_bytes,
            retention: config.retention,
        };
        Ok(Self {
            human: RotatingLog::new(dir.join(HUMAN_LOG_FILE), policy)?,
            structured: RotatingLog::new(dir.join(STRUCTURED_LOG_FILE), policy)?,
            redactor: Redactor::new(config.pii_min_digits),
            structured_pii: config.structured_pii,
            dropped: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn human_path(&self) -> &Path {
        self.human.path()
    }

    #[must_use]
    pub fn structured_path(&self) -> &Path {
        self.structured.path()
    }

    /// Appends that failed on at least one stream since this log was opened.
    #[must_use]
    pub fn dropped_writes(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// The last `max_lines` human-readable lines, oldest first.
    pub fn tail(&self, max_lines: usize) -> Result<Vec<String>, AuditError> {
        Ok(self.human.read_tail(max_lines)?)
    }

    /// Append `entry` to both streams.
    ///
    /// Both streams are attempted even if the first fails; the first failure
    /// is returned and counted in [`dropped_writes`](Self::dropped_writes).
    pub fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let ts = crate::time::now_rfc3339();
        let line = self.human_line(&ts, entry);
        let record = serde_json::to_string(&self.structured_record(ts, entry))?;

        let human = self
            .human
            .append_line(&line)
            .map_err(|source| AuditError::Write {
                stream: "human",
                source,
            });
        let structured = self
            .structured
            .append_line(&record)
            .map_err(|source| AuditError::Write {
                stream: "structured",
                source,
            });

        match (human, structured) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), _) | (Ok(()), Err(e)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(action = %entry.action, err = %e, "audit append failed");
                Err(e)
            },
        }
    }

    /// Render the human-readable line for `entry` at `ts`.
    #[must_use]
    pub fn human_line(&self, ts: &str, entry: &AuditEntry) -> String {
        let column = |s: &str| -> String {
            let scrubbed = self.redactor.scrub(s);
            sanitize_column(&scrubbed, MAX_COLUMN_CHARS).into_owned()
        };
        let mut detail = column(&entry.detail);
        if !entry.payload.is_empty() {
            let payload = Value::Object(entry.payload.clone()).to_string();
            if !detail.is_empty() {
                detail.push(' ');
            }
            detail.push_str(&column(&payload));
        }
        format!(
            "{ts} | {:<8} | {:<12} | {:<24} | {:<9} | {detail}",
            entry.level,
            column(&entry.actor),
            column(&entry.action),
            entry.outcome,
        )
    }

    fn structured_record(&self, ts: String, entry: &AuditEntry) -> AuditRecord {
        let text = |s: &str| self.structured_text(s);
        AuditRecord {
            schema_version: SCHEMA_VERSION,
            ts,
            level: entry.level,
            actor: text(&entry.actor),
            role: entry.role.as_deref().map(text),
            action: text(&entry.action),
            outcome: entry.outcome,
            detail: text(&entry.detail),
            session: entry.session.as_deref().map(text),
            payload: entry
                .payload
                .iter()
                .map(|(k, v)| (k.clone(), self.structured_value(v)))
                .collect(),
        }
    }

    fn structured_text(&self, s: &str) -> String {
        let cleaned = strip_controls(s);
        let redacted = redact_secrets(&cleaned);
        match self.structured_pii {
            StructuredPii::Mask => self.redactor.mask_pii(&redacted).into_owned(),
            StructuredPii::Raw => redacted.into_owned(),
        }
    }

    fn structured_value(&self, value: &Value) -> Value {
        scrub_value(value, &|s| self.structured_text(s))
    }
}

/// Apply `f` to every string inside `value`.
pub(crate) fn scrub_value(value: &Value, f: &dyn Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(s)),
        Value::Array(items) => Value::Array(items.iter().map(|v| scrub_value(v, f)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), scrub_value(v, f)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store observer
// ─────────────────────────────────────────────────────────────────────────────

/// Records store repairs in the audit log.
impl StoreObserver for AuditLog {
    fn on_event(&self, event: &StoreEvent) {
        let entry = match event {
            StoreEvent::StaleLockReclaimed(report) => AuditEntry::warn("store", "STALE_LOCK_RECLAIMED")
                .with_outcome(Outcome::Recovered)
                .with_detail(report.to_string())
                .with_field("collection", report.collection.as_str())
                .with_field("previous_owner", report.previous_owner.as_str())
                .with_field("age_ms", report.age_ms),
            StoreEvent::RecoveredFromSnapshot {
                collection,
                snapshot,
                cause,
            } => AuditEntry::warn("store", "COLLECTION_RECOVERED")
                .with_outcome(Outcome::Recovered)
                .with_detail(format!("{collection} restored from {}", snapshot.display()))
                .with_field("collection", collection.as_str())
                .with_field("cause", cause.as_str()),
        };
        if let Err(e) = self.append(&entry) {
            tracing::warn!(err = %e, "failed to audit store event");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use super::*;
    use crate::lock::StaleLockReclaimed;

    fn open(pii: StructuredPii) -> (tempfile::TempDir, AuditLog) {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = AuditConfig {
            structured_pii: pii,
            ..AuditConfig::default()
        };
        let log = AuditLog::open(&dir.path().join("audit"), &config).expect("open");
        (dir, log)
    }

    fn records(log: &AuditLog) -> Vec<AuditRecord> {
        fs::read_to_string(log.structured_path())
            .expect("read")
            .lines()
            .map(|l| serde_json::from_str(l).expect("record"))
            .collect()
    }

    #[test]
    fn levels_and_outcomes_parse() {
        assert_eq!("warning".parse::<AuditLevel>(), Ok(AuditLevel::Warn));
        assert_eq!("Security".parse::<AuditLevel>(), Ok(AuditLevel::Security));
        assert_eq!("DENIED".parse::<Outcome>(), Ok(Outcome::Denied));
        assert!("maybe".parse::<Outcome>().is_err());
    }

    #[test]
    fn tail_reads_human_lines() {
        let (_dir, log) = open(StructuredPii::Mask);
        for action in ["A", "B", "C"] {
            log.append(&AuditEntry::info("admin", action)).expect("append");
        }
        let tail = log.tail(2).expect("tail");
        assert_eq!(tail.len(), 2);
        assert!(tail[0].contains("| B "));
        assert!(tail[1].contains("| C "));
    }

    #[test]
    fn human_line_has_fixed_columns() {
        let (_dir, log) = open(StructuredPii::Mask);
        let entry = AuditEntry::info("admin", "LOGIN").with_detail("ok");
        assert_eq!(
            log.human_line("2026-10-18T09:00:00.000Z", &entry),
            "2026-10-18T09:00:00.000Z | INFO     | admin        | LOGIN                    | success   | ok"
        );
    }

    #[test]
    fn human_line_masks_and_sanitizes() {
        let (_dir, log) = open(StructuredPii::Raw);
        let entry = AuditEntry::security("sara@uni.ac.ir", "LOGIN_FAILED", Outcome::Denied)
            .with_detail("code 40012345678 | retry\nnext")
            .with_field("email", "sara@uni.ac.ir");
        let line = log.human_line("ts", &entry);
        assert!(!line.contains("sara@uni.ac.ir"));
        assert!(!line.contains("40012345678"));
        assert!(line.contains("sa***@***"));
        assert!(line.contains("40***"));
        assert!(!line.contains('\n'));
        assert_eq!(line.matches(" | ").count(), 5);
    }

    #[test]
    fn append_writes_both_streams() {
        let (_dir, log) = open(StructuredPii::Mask);
        log.append(&AuditEntry::info("admin", "REGISTER_STUDENT").with_role("admin"))
            .expect("append");
        log.append(&AuditEntry::error("repo", "WRITE")).expect("append");

        let human = fs::read_to_string(log.human_path()).expect("read");
        assert_eq!(human.lines().count(), 2);
        let structured = records(&log);
        assert_eq!(structured.len(), 2);
        assert_eq!(structured[0].schema_version, SCHEMA_VERSION);
        assert_eq!(structured[0].role.as_deref(), Some("admin"));
        assert_eq!(structured[1].level, AuditLevel::Error);
        assert_eq!(structured[1].outcome, Outcome::Failure);
        assert_eq!(log.dropped_writes(), 0);
    }

    #[test]
    fn structured_stream_masks_by_default() {
        let (_dir, log) = open(StructuredPii::Mask);
        log.append(
            &AuditEntry::info("admin", "UPDATE_EMAIL")
                .with_detail("to ali@example.com")
                .with_field("contact", serde_json::json!({"email": "ali@example.com"})),
        )
        .expect("append");
        let raw = fs::read_to_string(log.structured_path()).expect("read");
        assert!(!raw.contains("ali@example.com"));
        assert_eq!(
            records(&log)[0].payload["contact"]["email"],
            Value::from("al***@***")
        );
    }

    #[test]
    fn content_hashes_are_not_masked() {
        let (_dir, log) = open(StructuredPii::Mask);
        let hash = blake3::hash(b"thesis").to_hex().to_string();
        log.append(&AuditEntry::info("cli", "FILE_INGESTED").with_field("hash", hash.as_str()))
            .expect("append");
        assert_eq!(records(&log)[0].payload["hash"], Value::from(hash));
    }

    #[test]
    fn structured_stream_raw_keeps_pii_but_not_secrets() {
        let (_dir, log) = open(StructuredPii::Raw);
        log.append(
            &AuditEntry::info("admin", "UPDATE_EMAIL")
                .with_detail("to ali@example.com password=supersecret1"),
        )
        .expect("append");
        let record = &records(&log)[0];
        assert!(record.detail.contains("ali@example.com"));
        assert!(!record.detail.contains("supersecret1"));
        let human = fs::read_to_string(log.human_path()).expect("read");
        assert!(!human.contains("ali@example.com"));
    }

    #[test]
    fn failed_stream_is_counted() {
        let (dir, log) = open(StructuredPii::Mask);
        // A directory where the structured file should be makes its append fail.
        fs::create_dir_all(log.structured_path()).expect("block file");
        let err = log
            .append(&AuditEntry::info("admin", "X"))
            .expect_err("structured write fails");
        assert!(matches!(err, AuditError::Write { stream: "structured", .. }));
        assert_eq!(log.dropped_writes(), 1);
        assert_eq!(
            fs::read_to_string(log.human_path()).expect("read").lines().count(),
            1
        );
        drop(dir);
    }

    #[test]
    fn observer_records_store_events() {
        let (_dir, log) = open(StructuredPii::Mask);
        let log = Arc::new(log);
        log.on_event(&StoreEvent::StaleLockReclaimed(StaleLockReclaimed {
            collection: "theses".into(),
            previous_owner: "web-1".into(),
            age_ms: 120_000,
            ttl_ms: 60_000,
        }));
        let records = records(&log);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, "STALE_LOCK_RECLAIMED");
        assert_eq!(records[0].level, AuditLevel::Warn);
        assert_eq!(records[0].outcome, Outcome::Recovered);
    }
}
