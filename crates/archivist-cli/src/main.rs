//! archivist - operator CLI for the thesis registry store
//!
//! Inspects and repairs collections, ingests files, and reads or writes the
//! audit and notification logs of a data directory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use archivist_core::ArchivistConfig;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;

/// Default configuration file, read only if present.
const DEFAULT_CONFIG_FILE: &str = "archivist.toml";

/// archivist - thesis registry store
#[derive(Parser, Debug)]
#[command(name = "archivist")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory (overrides config and environment)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Collection inspection and repair
    Collection(commands::collection::CollectionCommand),

    /// Validate and store an uploaded file
    Ingest(commands::ingest::IngestArgs),

    /// Notification log
    Notify(commands::notify::NotifyCommand),

    /// Audit log
    Audit(commands::audit::AuditCommand),

    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Collection(cmd) => commands::collection::run(&config, &cmd),
        Commands::Ingest(args) => commands::ingest::run(&config, &args),
        Commands::Notify(cmd) => commands::notify::run(&config, &cmd),
        Commands::Audit(cmd) => commands::audit::run(&config, &cmd),
        Commands::Config => {
            print!("{}", config.to_toml().context("rendering configuration")?);
            Ok(())
        },
    }
}

/// Config file (explicit, or `archivist.toml` if present, else defaults),
/// then environment overrides, then `--data-dir`.
fn load_config(cli: &Cli) -> Result<ArchivistConfig> {
    let mut config = match &cli.config {
        Some(path) => ArchivistConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default.exists() {
                ArchivistConfig::from_file(&default)
                    .with_context(|| format!("loading config {}", default.display()))?
            } else {
                ArchivistConfig::default()
            }
        },
    };
    config
        .apply_env_overrides()
        .context("applying environment overrides")?;
    if let Some(dir) = &cli.data_dir {
        config.store.data_dir.clone_from(dir);
    }
    config.validate().context("invalid configuration")?;
    tracing::debug!(data_dir = %config.store.data_dir.display(), "configuration loaded");
    Ok(config)
}
