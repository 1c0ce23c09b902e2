use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use encoder::{
    build_transcoder, Backend, CompressionProfile, Credentials, DateSelection, EncoderConfig, Orchestrator,
    ReportWriter, RunOptions, TrackingStore,
};
use humansize::{format_size, BINARY};
use log::{error, info, warn};
use tokio::sync::watch;

/// Shrink date-organized videos with a cloud transcoding service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Override the configured backend
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    /// Use the extreme compression profile
    #[arg(long)]
    extreme: bool,

    /// Process files even if the tracking file has them
    #[arg(long)]
    force: bool,

    /// Resubmit files whose last attempt failed
    #[arg(long)]
    retry_failed: bool,

    /// Scan and log what would be submitted without uploading anything
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Every YYYY/MM/DD folder under the videos root
    All,
    /// Today's folder
    Today,
    /// A single day
    Date { date: NaiveDate },
    /// An inclusive range of days
    Range { start: NaiveDate, end: NaiveDate },
    /// Show credential status and verify the selected backend
    Check,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum BackendArg {
    Cloudconvert,
    Cloudinary,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Cloudconvert => Backend::CloudConvert,
            BackendArg::Cloudinary => Backend::Cloudinary,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let mut cfg = EncoderConfig::load_config(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(backend) = args.backend {
        cfg.backend = backend.into();
    }
    if args.extreme {
        cfg.profile = CompressionProfile::Extreme;
    }
    cfg.retry_failed |= args.retry_failed;

    let selection = match args.command {
        Command::Check => return check(&cfg).await,
        Command::All => DateSelection::All,
        Command::Today => DateSelection::today(),
        Command::Date { date } => DateSelection::Day(date),
        Command::Range { start, end } => DateSelection::range(start, end).context("Invalid date range")?,
    };

    cfg.validate().context("Invalid configuration")?;

    info!("Cloud encoder starting");
    info!("  Videos root: {}", cfg.videos_root.display());
    info!("  Backend: {} ({:?} profile)", cfg.backend, cfg.profile);
    info!(
        "  Size window: {} - {}",
        format_size(cfg.min_bytes, BINARY),
        format_size(cfg.max_bytes, BINARY)
    );
    info!("  Concurrent jobs: {}", cfg.max_concurrent_jobs);

    let credentials = Credentials::from_env(cfg.backend).context("Missing backend credentials")?;
    let transcoder = build_transcoder(&cfg, credentials).context("Failed to set up backend")?;

    fs::create_dir_all(&cfg.temp_dir)
        .with_context(|| format!("Failed to create temp directory: {}", cfg.temp_dir.display()))?;

    let store = TrackingStore::load_or_reset(&cfg.tracking_file)
        .context("Failed to load tracking file")?
        .with_retry_failed(cfg.retry_failed);
    info!("Loaded {} tracking record(s) from {}", store.len(), store.path().display());

    let report = ReportWriter::open(&cfg.log_file, &cfg.csv_file)
        .with_context(|| format!("Failed to open report files: {}", cfg.csv_file.display()))?;
    info!(
        "Reporting to {} and {}",
        report.log_path().display(),
        report.csv_path().display()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupt received, cancelling in-flight jobs...");
                shutdown_tx.send(true).ok();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    let opts = RunOptions {
        force: args.force,
        dry_run: args.dry_run,
    };
    let orchestrator = Orchestrator::new(Arc::new(cfg), transcoder, store, report);
    let stats = orchestrator.run(selection, opts, shutdown_rx).await?;

    println!("{}", stats.summary());
    Ok(())
}

async fn check(cfg: &EncoderConfig) -> Result<()> {
    for backend in [Backend::CloudConvert, Backend::Cloudinary] {
        match Credentials::from_env(backend) {
            Ok(_) => println!("{:<12} credentials present", backend.to_string()),
            Err(e) => println!("{:<12} {}", backend.to_string(), e),
        }
    }

    let credentials = Credentials::from_env(cfg.backend).context("Missing backend credentials")?;
    let transcoder = build_transcoder(cfg, credentials).context("Failed to set up backend")?;
    transcoder
        .verify()
        .await
        .with_context(|| format!("{} rejected the credentials", cfg.backend))?;
    println!("{} OK", cfg.backend);
    Ok(())
}
