//! `archivist collection`: read, verify and inspect collections.

use anyhow::{Context, Result};
use archivist_core::records::CollectionKind;
use archivist_core::store::ReadOutcome;
use archivist_core::ArchivistConfig;
use clap::{Args, Subcommand};
use serde::Serialize;

use super::{open_store, print_json};

/// Arguments for `archivist collection`.
#[derive(Debug, Args)]
pub struct CollectionCommand {
    #[command(subcommand)]
    pub subcommand: CollectionSubcommand,
}

#[derive(Debug, Subcommand)]
pub enum CollectionSubcommand {
    /// Print every record of a collection as JSON.
    Show {
        /// students, teachers, courses, theses or defended_theses
        name: CollectionKind,
    },
    /// List snapshots, newest first.
    Snapshots {
        name: CollectionKind,
        /// Output machine-readable JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Parse a collection, restoring it from a snapshot if it is corrupt.
    Verify {
        name: CollectionKind,
    },
    /// Show who holds a collection lock.
    Lock {
        name: CollectionKind,
    },
}

#[derive(Debug, Serialize)]
struct SnapshotEntry {
    stamp: String,
    path: String,
}

pub fn run(config: &ArchivistConfig, cmd: &CollectionCommand) -> Result<()> {
    let store = open_store(config)?;
    match &cmd.subcommand {
        CollectionSubcommand::Show { name } => {
            let records = name
                .load(&store)
                .with_context(|| format!("reading {name}"))?;
            print_json(&records)
        },
        CollectionSubcommand::Snapshots { name, json } => {
            let snapshots: Vec<SnapshotEntry> = store
                .snapshots(name.name())
                .with_context(|| format!("listing snapshots of {name}"))?
                .into_iter()
                .map(|s| SnapshotEntry {
                    stamp: s.stamp,
                    path: s.path.display().to_string(),
                })
                .collect();
            if *json {
                return print_json(&snapshots);
            }
            if snapshots.is_empty() {
                println!("no snapshots of {name}");
            }
            for snapshot in &snapshots {
                println!("{}  {}", snapshot.stamp, snapshot.path);
            }
            Ok(())
        },
        CollectionSubcommand::Verify { name } => {
            match name
                .verify(&store)
                .with_context(|| format!("verifying {name}"))?
            {
                ReadOutcome::Clean => println!("{name}: ok"),
                ReadOutcome::Recovered { snapshot, cause } => {
                    println!("{name}: restored from {} ({cause})", snapshot.display());
                },
            }
            Ok(())
        },
        CollectionSubcommand::Lock { name } => {
            match store
                .lock_status(name.name())
                .with_context(|| format!("inspecting lock of {name}"))?
            {
                None => println!("{name}: unlocked"),
                Some(status) => println!(
                    "{name}: held by {} for {} ms (ttl {} ms){}",
                    status.holder.owner,
                    status.age_ms,
                    status.holder.ttl_ms,
                    if status.expired { ", expired" } else { "" }
                ),
            }
            Ok(())
        },
    }
}
