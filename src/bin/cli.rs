//! Harvester CLI
//!
//! Local execution entry point.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::DateTime;
use clap::{Parser, Subcommand};
use harvester::{
    error::{AppError, Result},
    models::Config,
    pipeline::{self, Sources},
    services::{HttpPostStream, HttpSearchClient, PostStream, SearchClient},
    storage::{self, BucketedKey},
};
use tokio::sync::watch;

/// Harvester - microblog post ingestion
#[derive(Parser, Debug)]
#[command(
    name = "harvester",
    version,
    about = "Harvests microblog posts into a deduplicated two-tier store"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "harvester.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the workers and harvest until the budget ends or Ctrl-C
    Run,

    /// Validate the configuration file
    Validate,

    /// Show the term partition of each polling worker
    Plan,

    /// Decode a bucketed row key
    Key {
        /// The 32-character row key
        key: String,
    },
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load(path)?;
    if let Err(e) = config.validate() {
        log::error!("Config validation failed: {}", e);
        return Err(e);
    }
    Ok(config)
}

fn log_config(config: &Config) {
    let harvest = &config.harvest;
    log::info!(
        "Languages: {} | workers: {} | streaming: {} | buffer: {} | budget: {}",
        config.languages().join(", "),
        harvest.workers,
        harvest.streaming,
        harvest.buffer_size,
        match harvest.minutes {
            0 => "unbounded".to_string(),
            m => format!("{m} min"),
        }
    );
    log::info!(
        "Storage: {:?} | token: {}",
        config.storage.backend,
        if config.source.bearer_token.is_some() {
            "<redacted>"
        } else {
            "none"
        }
    );
}

fn build_sources(config: &Config) -> Result<Sources> {
    let search: Option<Arc<dyn SearchClient>> = if config.harvest.workers > 0 {
        Some(Arc::new(HttpSearchClient::new(&config.source)?))
    } else {
        None
    };
    let stream: Option<Box<dyn PostStream>> = if config.harvest.streaming {
        Some(Box::new(HttpPostStream::new(&config.source)?))
    } else {
        None
    };
    Ok(Sources { search, stream })
}

fn describe_key(raw: &str) -> Result<()> {
    let key = BucketedKey::parse(raw)?;
    let millis = key
        .timestamp_millis()
        .ok_or_else(|| AppError::invalid_argument("timestamp field is not numeric"))?;
    let when = DateTime::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "out of range".to_string());

    println!("bucket:    {}", key.bucket_prefix());
    println!("timestamp: {millis} ({when})");
    println!("source:    {}", key.source());
    println!("host salt: {}", key.host_salt());
    println!("suffix:    {}", key.suffix());
    println!("original:  {}", key.original());
    Ok(())
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Run => {
            log::info!("Harvester starting...");
            let config = load_config(&cli.config)?;
            log::info!("Loaded configuration from {}", cli.config.display());
            log_config(&config);

            let sources = build_sources(&config)?;
            let storage = storage::open(&config).await.inspect_err(|e| {
                log::error!("Storage connection failed: {}", e);
            })?;

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!("Ctrl-C received, draining workers...");
                    shutdown_tx.send(true).ok();
                }
            });

            let report = pipeline::run_harvest(&config, storage, sources, shutdown_rx).await?;
            let total = report.total();
            log::info!(
                "Accepted {} posts ({} duplicates, {} other languages), {} flushed",
                total.accepted,
                total.duplicates,
                total.rejected_language,
                total.posts_flushed
            );
        }

        Command::Validate => {
            log::info!("Validating configuration...");
            let config = load_config(&cli.config)?;
            log_config(&config);
            log::info!("All validations passed!");
        }

        Command::Plan => {
            let config = load_config(&cli.config)?;
            if config.harvest.workers == 0 {
                log::info!("Polling disabled (harvest.workers = 0)");
                return Ok(());
            }
            let assignments =
                pipeline::partition(&config.languages(), &config.terms, config.harvest.workers)?;
            for (index, assignment) in assignments.iter().enumerate() {
                println!("poller-{index}:");
                for (language, terms) in assignment {
                    println!("  {language}: {}", terms.join(", "));
                }
            }
        }

        Command::Key { key } => describe_key(&key)?,
    }

    log::info!("Done!");

    Ok(())
}
