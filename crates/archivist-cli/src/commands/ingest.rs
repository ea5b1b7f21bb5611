//! `archivist ingest`: validate and store one file.

use std::path::PathBuf;

use anyhow::{Context, Result};
use archivist_core::{ArchivistConfig, AuditEntry, FileIngest, FileKind, Outcome};
use clap::Args;

use super::{open_audit, print_json, CLI_OWNER};

/// Arguments for `archivist ingest`.
#[derive(Debug, Args)]
pub struct IngestArgs {
    /// File to ingest
    pub source: PathBuf,

    /// Destination directory
    #[arg(long)]
    pub dest: PathBuf,

    /// Stored name (defaults to the source file name)
    #[arg(long)]
    pub name: Option<String>,

    /// pdf, jpg or png (defaults to the source extension)
    #[arg(long)]
    pub kind: Option<FileKind>,
}

pub fn run(config: &ArchivistConfig, args: &IngestArgs) -> Result<()> {
    let kind = match args.kind {
        Some(kind) => kind,
        None => FileIngest::detect_kind(&args.source)
            .with_context(|| format!("detecting kind of {}", args.source.display()))?,
    };
    let name = match &args.name {
        Some(name) => name.clone(),
        None => args
            .source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };

    let audit = open_audit(config)?;
    let ingest = FileIngest::new(&config.ingest);
    match ingest.ingest(&args.source, kind, &args.dest, &name) {
        Ok(stored) => {
            let entry = AuditEntry::info(CLI_OWNER, "FILE_INGESTED")
                .with_detail(stored.path.display().to_string())
                .with_field("hash", stored.hash.as_str())
                .with_field("deduplicated", stored.deduplicated);
            if let Err(e) = audit.append(&entry) {
                tracing::warn!(err = %e, "failed to audit ingest");
            }
            print_json(&stored)
        },
        Err(e) => {
            let entry = AuditEntry::warn(CLI_OWNER, "FILE_INGESTED")
                .with_outcome(Outcome::Failure)
                .with_detail(e.to_string());
            if let Err(audit_err) = audit.append(&entry) {
                tracing::warn!(err = %audit_err, "failed to audit ingest");
            }
            Err(e).with_context(|| format!("ingesting {}", args.source.display()))
        },
    }
}
