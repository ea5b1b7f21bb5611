//! `archivist audit`: append to and read the audit log.

use anyhow::{Context, Result};
use archivist_core::{ArchivistConfig, AuditEntry, AuditLevel, Outcome};
use clap::{Args, Subcommand};

use super::open_audit;

/// Arguments for `archivist audit`.
#[derive(Debug, Args)]
pub struct AuditCommand {
    #[command(subcommand)]
    pub subcommand: AuditSubcommand,
}

#[derive(Debug, Subcommand)]
pub enum AuditSubcommand {
    /// Append one entry to both audit streams.
    Append {
        actor: String,
        action: String,
        /// info, warn, error or security
        #[arg(long, default_value = "info")]
        level: AuditLevel,
        /// success, failure, denied or recovered
        #[arg(long, default_value = "success")]
        outcome: Outcome,
        #[arg(long, default_value = "")]
        detail: String,
        #[arg(long)]
        role: Option<String>,
    },
    /// Print the last lines of the human-readable stream.
    Tail {
        #[arg(short = 'n', long, default_value_t = 20)]
        lines: usize,
    },
}

pub fn run(config: &ArchivistConfig, cmd: &AuditCommand) -> Result<()> {
    let log = open_audit(config)?;
    match &cmd.subcommand {
        AuditSubcommand::Append {
            actor,
            action,
            level,
            outcome,
            detail,
            role,
        } => {
            let mut entry = AuditEntry::info(actor, action)
                .with_level(*level)
                .with_outcome(*outcome)
                .with_detail(detail);
            if let Some(role) = role {
                entry = entry.with_role(role);
            }
            log.append(&entry).context("appending audit entry")
        },
        AuditSubcommand::Tail { lines } => {
            for line in log.tail(*lines).context("reading audit log")? {
                println!("{line}");
            }
            Ok(())
        },
    }
}
