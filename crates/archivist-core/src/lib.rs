//! archivist-core - crash-safe persistence for a thesis-defense registry
//!
//! Records live in one JSON array file per collection. Every write takes a
//! per-collection lease lock, snapshots the outgoing file, and replaces it by
//! atomic rename; a file that fails to parse is restored from the newest
//! snapshot that does. Around the store sit an append-only audit log with
//! secret and PII redaction, a deduplicating notification log, and a file
//! ingest pipeline for uploaded PDFs and page images.
//!
//! Nothing here is global: every stateful component is an explicit value
//! built from an [`ArchivistConfig`] and a directory.
//!
//! # Modules
//!
//! - [`store`]: [`RecordStore`], the locked read-modify-write surface
//! - [`records`]: the registry's record types and collection names
//! - [`lock`]: TTL lease locks with stale reclamation
//! - [`backup`]: snapshot rotation and corruption recovery
//! - [`audit`]: human and structured audit streams
//! - [`notify`]: bounded, deduplicated notification window
//! - [`ingest`]: signature checks, safe names and content-addressed copies
//! - [`log`]: rotation and redaction shared by the two logs
//! - [`config`]: TOML configuration with environment overrides
//! - [`fsutil`]: atomic write and other durable filesystem primitives

pub mod audit;
pub mod backup;
pub mod config;
pub mod fsutil;
pub mod ingest;
pub mod lock;
pub mod log;
pub mod notify;
pub mod records;
pub mod store;
pub mod time;

pub use audit::{AuditEntry, AuditLevel, AuditLog, Outcome};
pub use config::ArchivistConfig;
pub use ingest::{FileIngest, FileKind, IngestedFile};
pub use lock::{LockManager, LockToken};
pub use notify::{NewNotification, NotificationFilter, NotificationStore};
pub use records::CollectionKind;
pub use store::{Record, RecordKey, RecordStore, StoreError, StoreOptions};
