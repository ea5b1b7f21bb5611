//! `archivist notify`: emit, list, purge and export notifications.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use archivist_core::notify::{EmitOutcome, Level};
use archivist_core::{ArchivistConfig, NewNotification, NotificationFilter};
use clap::{Args, Subcommand};
use serde_json::Value;

use super::{open_notifications, print_json};

/// Arguments for `archivist notify`.
#[derive(Debug, Args)]
pub struct NotifyCommand {
    #[command(subcommand)]
    pub subcommand: NotifySubcommand,
}

#[derive(Debug, Subcommand)]
pub enum NotifySubcommand {
    /// List recent notifications, newest first.
    List(ListArgs),
    /// Emit a notification.
    Emit(EmitArgs),
    /// Delete every stored notification.
    Purge,
    /// Copy the notification log to a file.
    Export {
        dest: PathBuf,
    },
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    pub event: Option<String>,
    #[arg(long)]
    pub level: Option<String>,
    #[arg(long)]
    pub actor: Option<String>,
    #[arg(long)]
    pub topic: Option<String>,
    #[arg(long)]
    pub correlation_id: Option<String>,
    #[arg(long, default_value_t = 0)]
    pub offset: usize,
    #[arg(short = 'n', long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Debug, Args)]
pub struct EmitArgs {
    /// Event type, e.g. `thesis_submitted`
    pub event: String,
    /// debug, info, warn, error or success
    #[arg(long, default_value = "info")]
    pub level: String,
    /// JSON payload
    #[arg(long)]
    pub payload: Option<String>,
    #[arg(long)]
    pub actor: Option<String>,
    #[arg(long)]
    pub topic: Option<String>,
    #[arg(long)]
    pub correlation_id: Option<String>,
    #[arg(long)]
    pub dedupe_key: Option<String>,
    /// Suppress repeats of the dedupe key for this many seconds
    #[arg(long, default_value_t = 0)]
    pub dedupe_window_secs: u64,
}

pub fn run(config: &ArchivistConfig, cmd: &NotifyCommand) -> Result<()> {
    let store = open_notifications(config)?;
    match &cmd.subcommand {
        NotifySubcommand::List(args) => {
            let filter = NotificationFilter {
                event: args.event.clone(),
                level: args.level.as_deref().map(Level::normalize),
                actor: args.actor.clone(),
                topic: args.topic.clone(),
                correlation_id: args.correlation_id.clone(),
            };
            let events = store
                .list_recent(&filter, args.offset, args.limit)
                .context("listing notifications")?;
            print_json(&events)
        },
        NotifySubcommand::Emit(args) => {
            let mut new = NewNotification::new(&args.event).level(Level::normalize(&args.level));
            if let Some(raw) = &args.payload {
                let payload: Value = serde_json::from_str(raw).context("parsing --payload as JSON")?;
                new = new.payload(payload);
            }
            if let Some(actor) = &args.actor {
                new = new.actor(actor);
            }
            if let Some(topic) = &args.topic {
                new = new.topic(topic);
            }
            if let Some(id) = &args.correlation_id {
                new = new.correlation_id(id);
            }
            if let Some(key) = &args.dedupe_key {
                new = new.dedupe(key, Duration::from_secs(args.dedupe_window_secs));
            }
            match store.emit(new).context("emitting notification")? {
                EmitOutcome::Emitted(event) => print_json(&event),
                EmitOutcome::Suppressed { duplicate_of } => {
                    println!("suppressed: duplicate of {duplicate_of}");
                    Ok(())
                },
            }
        },
        NotifySubcommand::Purge => {
            store.purge().context("purging notifications")?;
            println!("notifications purged");
            Ok(())
        },
        NotifySubcommand::Export { dest } => {
            let bytes = store
                .export(dest)
                .with_context(|| format!("exporting to {}", dest.display()))?;
            println!("exported {bytes} bytes to {}", dest.display());
            Ok(())
        },
    }
}
