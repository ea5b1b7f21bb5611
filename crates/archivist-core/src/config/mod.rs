//! TOML configuration.
//!
//! ```toml
//! [store]
//! data_dir = "/var/lib/archivist"
//! lock_ttl_secs = 60
//! lock_wait_ms = 10000
//! backup_retention = 10
//!
//! [audit]
//! rotate_bytes = 10485760
//! retention = 7
//! pii_min_digits = 6
//! structured_pii = "mask"
//!
//! [notifications]
//! capacity = 2000
//!
//! [ingest]
//! pdf_max_bytes = 52428800
//! ```
//!
//! Every key is optional; missing keys take the defaults shown.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Overrides `store.data_dir`.
pub const DATA_DIR_ENV_VAR: &str = "ARCHIVIST_DATA_DIR";

/// Overrides `store.lock_ttl_secs`.
pub const LOCK_TTL_ENV_VAR: &str = "ARCHIVIST_LOCK_TTL_SECS";

/// Overrides `store.backup_retention`.
pub const BACKUP_RETENTION_ENV_VAR: &str = "ARCHIVIST_BACKUP_RETENTION";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchivistConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,

    #[serde(default)]
    pub ingest: IngestConfig,
}

/// `[store]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Directory holding collections, snapshots, locks and logs.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Seconds before an unreleased lock is considered abandoned.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// Milliseconds a mutation waits for a held lock.
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,

    /// Snapshots kept per collection; 0 keeps all.
    #[serde(default = "default_backup_retention")]
    pub backup_retention: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            lock_ttl_secs: default_lock_ttl_secs(),
            lock_wait_ms: default_lock_wait_ms(),
            backup_retention: default_backup_retention(),
        }
    }
}

/// Whether the structured audit stream and notification payloads carry
/// masked or raw PII. The human audit stream is always masked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StructuredPii {
    #[default]
    Mask,
    Raw,
}

/// `[audit]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    #[serde(default = "default_rotate_bytes")]
    pub rotate_bytes: u64,

    /// Rotated files kept per stream.
    #[serde(default = "default_audit_retention")]
    pub retention: usize,

    /// Shortest digit run treated as PII.
    #[serde(default = "default_pii_min_digits")]
    pub pii_min_digits: usize,

    #[serde(default)]
    pub structured_pii: StructuredPii,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            rotate_bytes: default_rotate_bytes(),
            retention: default_audit_retention(),
            pii_min_digits: default_pii_min_digits(),
            structured_pii: StructuredPii::default(),
        }
    }
}

/// `[notifications]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationConfig {
    /// Events held in memory.
    #[serde(default = "default_notification_capacity")]
    pub capacity: usize,

    #[serde(default = "default_rotate_bytes")]
    pub rotate_bytes: u64,

    #[serde(default = "default_notification_retention")]
    pub retention: usize,

    /// Serialized payloads above this size are replaced by a preview.
    #[serde(default = "default_payload_max_bytes")]
    pub payload_max_bytes: usize,

    #[serde(default = "default_payload_preview_chars")]
    pub payload_preview_chars: usize,

    #[serde(default = "default_pii_min_digits")]
    pub pii_min_digits: usize,

    #[serde(default)]
    pub payload_pii: StructuredPii,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            capacity: default_notification_capacity(),
            rotate_bytes: default_rotate_bytes(),
            retention: default_notification_retention(),
            payload_max_bytes: default_payload_max_bytes(),
            payload_preview_chars: default_payload_preview_chars(),
            pii_min_digits: default_pii_min_digits(),
            payload_pii: StructuredPii::default(),
        }
    }
}

/// `[ingest]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    #[serde(default = "default_pdf_max_bytes")]
    pub pdf_max_bytes: u64,

    #[serde(default = "default_image_max_bytes")]
    pub image_max_bytes: u64,

    /// Maximum characters in a stored file name, extension excluded.
    #[serde(default = "default_max_basename_len")]
    pub max_basename_len: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            pdf_max_bytes: default_pdf_max_bytes(),
            image_max_bytes: default_image_max_bytes(),
            max_basename_len: default_max_basename_len(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

const fn default_lock_ttl_secs() -> u64 {
    60
}

const fn default_lock_wait_ms() -> u64 {
    10_000
}

const fn default_backup_retention() -> usize {
    crate::backup::DEFAULT_BACKUP_RETENTION
}

const fn default_rotate_bytes() -> u64 {
    crate::log::rotate::DEFAULT_ROTATE_BYTES
}

const fn default_audit_retention() -> usize {
    7
}

const fn default_pii_min_digits() -> usize {
    crate::log::redact::DEFAULT_PII_MIN_DIGITS
}

const fn default_notification_capacity() -> usize {
    2000
}

const fn default_notification_retention() -> usize {
    5
}

const fn default_payload_max_bytes() -> usize {
    100_000
}

const fn default_payload_preview_chars() -> usize {
    4096
}

const fn default_pdf_max_bytes() -> u64 {
    50 * 1024 * 1024
}

const fn default_image_max_bytes() -> u64 {
    10 * 1024 * 1024
}

const fn default_max_basename_len() -> usize {
    120
}

impl ArchivistConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the components cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(bool, &str); 8] = [
            (self.store.lock_ttl_secs > 0, "store.lock_ttl_secs must be > 0"),
            (self.audit.rotate_bytes > 0, "audit.rotate_bytes must be > 0"),
            (self.audit.retention > 0, "audit.retention must be > 0"),
            (
                self.notifications.capacity > 0,
                "notifications.capacity must be > 0",
            ),
            (
                self.notifications.rotate_bytes > 0,
                "notifications.rotate_bytes must be > 0",
            ),
            (
                self.notifications.payload_max_bytes > 0,
                "notifications.payload_max_bytes must be > 0",
            ),
            (
                self.ingest.pdf_max_bytes > 0 && self.ingest.image_max_bytes > 0,
                "ingest size limits must be > 0",
            ),
            (
                self.ingest.max_basename_len >= 8,
                "ingest.max_basename_len must be >= 8",
            ),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, message)) => Err(ConfigError::Validation((*message).to_string())),
            None => Ok(()),
        }
    }

    /// Apply `ARCHIVIST_*` environment overrides from the process
    /// environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(DATA_DIR_ENV_VAR).filter(|v| !v.trim().is_empty()) {
            self.store.data_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup(LOCK_TTL_ENV_VAR) {
            self.store.lock_ttl_secs = parse_env(LOCK_TTL_ENV_VAR, &raw)?;
        }
        if let Some(raw) = lookup(BACKUP_RETENTION_ENV_VAR) {
            self.store.backup_retention = parse_env(BACKUP_RETENTION_ENV_VAR, &raw)?;
        }
        self.validate()
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Env {
        name: name.to_string(),
        value: raw.to_string(),
    })
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// I/O error reading the configuration file.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// File being read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// TOML parse error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// An environment override could not be parsed.
    #[error("invalid value {value:?} for {name}")]
    Env {
        /// Variable name.
        name: String,
        /// Offending value.
        value: String,
    },

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = ArchivistConfig::from_toml("").expect("parse");
        assert_eq!(config, ArchivistConfig::default());
        assert_eq!(config.store.data_dir, PathBuf::from("data"));
        assert_eq!(config.store.lock_ttl_secs, 60);
        assert_eq!(config.store.backup_retention, 10);
        assert_eq!(config.audit.retention, 7);
        assert_eq!(config.audit.structured_pii, StructuredPii::Mask);
        assert_eq!(config.notifications.capacity, 2000);
        assert_eq!(config.notifications.payload_max_bytes, 100_000);
        assert_eq!(config.ingest.pdf_max_bytes, 50 * 1024 * 1024);
        assert_eq!(config.ingest.max_basename_len, 120);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = ArchivistConfig::from_toml(
            r#"
            [store]
            data_dir = "/srv/archivist"
            backup_retention = 0

            [audit]
            structured_pii = "raw"
            "#,
        )
        .expect("parse");
        assert_eq!(config.store.data_dir, PathBuf::from("/srv/archivist"));
        assert_eq!(config.store.backup_retention, 0);
        assert_eq!(config.store.lock_wait_ms, 10_000);
        assert_eq!(config.audit.structured_pii, StructuredPii::Raw);
        assert_eq!(config.audit.pii_min_digits, 6);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            ArchivistConfig::from_toml("[store]\nlock_tll_secs = 5\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            ArchivistConfig::from_toml("[notifications]\ncapacity = 0\n"),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn toml_round_trip() {
        let mut config = ArchivistConfig::default();
        config.audit.structured_pii = StructuredPii::Raw;
        let text = config.to_toml().expect("serialize");
        assert_eq!(ArchivistConfig::from_toml(&text).expect("parse"), config);
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            (DATA_DIR_ENV_VAR, "/tmp/x"),
            (LOCK_TTL_ENV_VAR, "5"),
            (BACKUP_RETENTION_ENV_VAR, " 3 "),
        ]
        .into_iter()
        .collect();
        let mut config = ArchivistConfig::default();
        config
            .apply_overrides(|name| vars.get(name).map(|v| (*v).to_string()))
            .expect("overrides");
        assert_eq!(config.store.data_dir, PathBuf::from("/tmp/x"));
        assert_eq!(config.store.lock_ttl_secs, 5);
        assert_eq!(config.store.backup_retention, 3);
    }

    #[test]
    fn bad_env_override_is_reported() {
        let mut config = ArchivistConfig::default();
        let err = config
            .apply_overrides(|name| (name == LOCK_TTL_ENV_VAR).then(|| "soon".to_string()))
            .expect_err("bad value");
        assert!(matches!(err, ConfigError::Env { ref name, .. } if name == LOCK_TTL_ENV_VAR));
    }
}
