//! Deduplicated, bounded notification log.
//!
//! Events are kept in an in-memory window of fixed capacity (oldest evicted
//! first) and mirrored line by line to `notifications.jsonl`. The window is a
//! cache: [`NotificationStore::open`] rebuilds it from the tail of the mirror.
//!
//! # Deduplication
//!
//! An event carrying a dedupe key and a non-zero dedupe window is suppressed
//! when the window already holds an event with the same `(event, dedupe_key)`
//! emitted less than `dedupe_window` ago. Suppressed events are neither
//! retained nor mirrored.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::audit::scrub_value;
use crate::config::{NotificationConfig, StructuredPii};
use crate::log::{redact_secrets, strip_controls, LogError, Redactor, RotatingLog, RotationPolicy};

/// Version of the persisted event layout.
pub const SCHEMA_VERSION: u32 = 1;

/// File name of the mirror.
pub const MIRROR_FILE: &str = "notifications.jsonl";

// ─────────────────────────────────────────────────────────────────────────────
// Error Types
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised by [`NotificationStore`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NotifyError {
    #[error(transparent)]
    Log(#[from] LogError),

    /// The event could not be serialized for the mirror.
    #[error("notification serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An earlier emitter panicked while holding the window lock.
    #[error("notification window lock poisoned")]
    Poisoned,

    /// The notification directory could not be prepared.
    #[error("notification I/O error: {context}: {source}")]
    Io {
        /// Description of what was being attempted.
        context: String,
        /// Underlying I/O error.
        source: io::Error,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Event Types
// ─────────────────────────────────────────────────────────────────────────────

/// Notification severity. Unknown level names read as [`Level::Info`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Success,
}

impl Level {
    /// Lenient parse: case-insensitive, `warning` accepted, anything else is
    /// `Info`.
    #[must_use]
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "debug" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            "success" => Self::Success,
            _ => Self::Info,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Success => "success",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::normalize(&raw))
    }
}

/// A stored notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: String,
    pub ts: String,
    pub event: String,
    #[serde(default)]
    pub level: Level,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub dedupe_key: Option<String>,
    /// Seconds; 0 disables suppression.
    #[serde(default)]
    pub dedupe_window_sec: u64,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

const fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl NotificationEvent {
    fn emitted_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.ts)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }

    fn same_identity(&self, other: &Self) -> bool {
        self.event == other.event && self.dedupe_key.is_some() && self.dedupe_key == other.dedupe_key
    }
}

/// A notification to emit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewNotification {
    pub event: String,
    pub level: Level,
    pub payload: Value,
    pub source: Option<String>,
    pub actor: Option<String>,
    pub topic: Option<String>,
    pub tags: Vec<String>,
    pub audience: Option<String>,
    pub correlation_id: Option<String>,
    pub dedupe_key: Option<String>,
    pub dedupe_window: Duration,
}

impl NewNotification {
    #[must_use]
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            payload: Value::Object(serde_json::Map::new()),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    #[must_use]
    pub fn audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    #[must_use]
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Suppress repeats of `(event, key)` within `window`.
    #[must_use]
    pub fn dedupe(mut self, key: impl Into<String>, window: Duration) -> Self {
        self.dedupe_key = Some(key.into());
        self.dedupe_window = window;
        self
    }
}

/// Result of [`NotificationStore::emit`].
#[derive(Debug, Clone, PartialEq)]
pub enum EmitOutcome {
    /// Stored and mirrored.
    Emitted(NotificationEvent),
    /// Dropped as a repeat of `duplicate_of` (an event id).
    Suppressed { duplicate_of: String },
}

impl EmitOutcome {
    #[must_use]
    pub const fn is_emitted(&self) -> bool {
        matches!(self, Self::Emitted(_))
    }
}

/// Criteria for [`NotificationStore::list_recent`]. Unset fields match
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationFilter {
    pub event: Option<String>,
    pub level: Option<Level>,
    pub actor: Option<String>,
    pub topic: Option<String>,
    pub correlation_id: Option<String>,
}

impl NotificationFilter {
    #[must_use]
    pub fn matches(&self, event: &NotificationEvent) -> bool {
        fn opt_eq(want: Option<&String>, have: Option<&String>) -> bool {
            want.map_or(true, |w| have == Some(w))
        }
        self.event.as_ref().map_or(true, |e| *e == event.event)
            && self.level.map_or(true, |l| l == event.level)
            && opt_eq(self.actor.as_ref(), event.actor.as_ref())
            && opt_eq(self.topic.as_ref(), event.topic.as_ref())
            && opt_eq(self.correlation_id.as_ref(), event.correlation_id.as_ref())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

/// Windowed, deduplicating notification log.
#[derive(Debug)]
pub struct NotificationStore {
    mirror: RotatingLog,
    window: Mutex<VecDeque<NotificationEvent>>,
    config: NotificationConfig,
    redactor: Redactor,
}

impl NotificationStore {
    /// Open the store in `dir` and rebuild the window from the mirror.
    pub fn open(dir: &Path, config: &NotificationConfig) -> Result<Self, NotifyError> {
        crate::fsutil::create_dir_restricted(dir).map_err(|e| NotifyError::Io {
            context: e.context,
            source: e.source,
        })?;
        let mirror = RotatingLog::new(
            dir.join(MIRROR_FILE),
            RotationPolicy {
                rotate_bytes: config.rotate_bytes,
                retention: config.retention,
            },
        )?;

        let mut window = VecDeque::with_capacity(config.capacity.min(4096));
        let mut skipped = 0usize;
        for line in mirror.read_tail(config.capacity)? {
            match serde_json::from_str::<NotificationEvent>(&line) {
                Ok(event) => window.push_back(event),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::warn!(path = %mirror.path().display(), skipped, "ignored malformed notification lines");
        }
        tracing::debug!(path = %mirror.path().display(), restored = window.len(), "notification window rebuilt");

        Ok(Self {
            mirror,
            window: Mutex::new(window),
            config: config.clone(),
            redactor: Redactor::new(config.pii_min_digits),
        })
    }

    #[must_use]
    pub fn mirror_path(&self) -> &Path {
        self.mirror.path()
    }

    /// Events currently held in the window.
    pub fn len(&self) -> Result<usize, NotifyError> {
        Ok(self.window.lock().map_err(|_| NotifyError::Poisoned)?.len())
    }

    pub fn is_empty(&self) -> Result<bool, NotifyError> {
        Ok(self.len()? == 0)
    }

    /// Emit `new` now.
    pub fn emit(&self, new: NewNotification) -> Result<EmitOutcome, NotifyError> {
        self.emit_at(new, Utc::now())
    }

    /// Emit `new` as if the current time were `now`.
    pub fn emit_at(&self, new: NewNotification, now: DateTime<Utc>) -> Result<EmitOutcome, NotifyError> {
        let event = self.build(new, now);
        let mut window = self.window.lock().map_err(|_| NotifyError::Poisoned)?;

        if let Some(prior) = find_duplicate(&window, &event, now) {
            tracing::debug!(event = %event.event, duplicate_of = %prior, "notification suppressed");
            return Ok(EmitOutcome::Suppressed {
                duplicate_of: prior,
            });
        }

        self.mirror.append_line(&serde_json::to_string(&event)?)?;
        window.push_back(event.clone());
        while window.len() > self.config.capacity {
            window.pop_front();
        }
        Ok(EmitOutcome::Emitted(event))
    }

    /// Matching events, most recent first, skipping `offset` and returning
    /// at most `limit`.
    pub fn list_recent(
        &self,
        filter: &NotificationFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<NotificationEvent>, NotifyError> {
        let window = self.window.lock().map_err(|_| NotifyError::Poisoned)?;
        Ok(window
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    /// Drop every event from the window and delete the mirror.
    pub fn purge(&self) -> Result<(), NotifyError> {
        let mut window = self.window.lock().map_err(|_| NotifyError::Poisoned)?;
        self.mirror.purge()?;
        window.clear();
        tracing::info!(path = %self.mirror.path().display(), "notifications purged");
        Ok(())
    }

    /// Atomically copy the live mirror to `dest`; returns bytes written.
    pub fn export(&self, dest: &Path) -> Result<u64, NotifyError> {
        let _window = self.window.lock().map_err(|_| NotifyError::Poisoned)?;
        Ok(self.mirror.export(dest)?)
    }

    fn build(&self, new: NewNotification, now: DateTime<Utc>) -> NotificationEvent {
        let text = |s: String| self.clean_text(&s);
        NotificationEvent {
            id: uuid::Uuid::new_v4().to_string(),
            ts: crate::time::format_rfc3339(now),
            event: strip_controls(&new.event).into_owned(),
            level: new.level,
            payload: self.clean_payload(&new.payload),
            source: new.source.map(text),
            actor: new.actor.map(text),
            topic: new.topic.map(text),
            tags: new.tags.into_iter().map(text).collect(),
            audience: new.audience.map(text),
            correlation_id: new.correlation_id,
            dedupe_key: new.dedupe_key,
            dedupe_window_sec: new.dedupe_window.as_secs(),
            schema_version: SCHEMA_VERSION,
        }
    }

    fn clean_text(&self, s: &str) -> String {
        let cleaned = strip_controls(s);
        let redacted = redact_secrets(&cleaned);
        match self.config.payload_pii {
            StructuredPii::Mask => self.redactor.mask_pii(&redacted).into_owned(),
            StructuredPii::Raw => redacted.into_owned(),
        }
    }

    /// Scrub strings, then replace oversized payloads by a bounded preview.
    fn clean_payload(&self, payload: &Value) -> Value {
        let scrubbed = scrub_value(payload, &|s| self.clean_text(s));
        let serialized = scrubbed.to_string();
        if serialized.len() <= self.config.payload_max_bytes {
            return scrubbed;
        }
        let preview: String = serialized
            .chars()
            .take(self.config.payload_preview_chars)
            .collect();
        json!({
            "_truncated": true,
            "size_bytes": serialized.len(),
            "preview": preview,
        })
    }
}

fn find_duplicate(
    window: &VecDeque<NotificationEvent>,
    event: &NotificationEvent,
    now: DateTime<Utc>,
) -> Option<String> {
    if event.dedupe_key.is_none() || event.dedupe_window_sec == 0 {
        return None;
    }
    let horizon = Duration::from_secs(event.dedupe_window_sec);
    window
        .iter()
        .rev()
        .filter(|prior| prior.same_identity(event))
        .find(|prior| {
            prior.emitted_at().is_some_and(|at| {
                (now - at).to_std().map_or(true, |elapsed| elapsed < horizon)
            })
        })
        .map(|prior| prior.id.clone())
}
