//! Subcommand implementations.

pub mod audit;
pub mod collection;
pub mod ingest;
pub mod notify;

use std::sync::Arc;

use anyhow::{Context, Result};
use archivist_core::store::StoreObserver;
use archivist_core::{ArchivistConfig, AuditLog, NotificationStore, RecordStore};
use serde::Serialize;

/// Owner recorded on locks taken by this CLI.
pub const CLI_OWNER: &str = "archivist-cli";

pub fn open_audit(config: &ArchivistConfig) -> Result<AuditLog> {
    let dir = &config.store.data_dir;
    AuditLog::open(dir, &config.audit)
        .with_context(|| format!("opening audit log in {}", dir.display()))
}

pub fn open_notifications(config: &ArchivistConfig) -> Result<NotificationStore> {
    let dir = &config.store.data_dir;
    NotificationStore::open(dir, &config.notifications)
        .with_context(|| format!("opening notifications in {}", dir.display()))
}

/// A store whose repairs are recorded in the audit log.
pub fn open_store(config: &ArchivistConfig) -> Result<RecordStore> {
    let audit: Arc<dyn StoreObserver> = Arc::new(open_audit(config)?);
    let store = RecordStore::from_config(&config.store)
        .with_context(|| format!("opening store in {}", config.store.data_dir.display()))?;
    Ok(store.with_observer(audit))
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serializing output")?
    );
    Ok(())
}
