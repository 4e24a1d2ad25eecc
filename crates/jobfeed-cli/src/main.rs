use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use jobfeed_sync::{ConfigError, ConflictPolicy, SyncConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "jobfeed")]
#[command(about = "Bulk-import job-market CSV aggregates into the remote store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Synchronize one CSV export into the destination table.
    Import(ImportArgs),
}

#[derive(Debug, Args)]
struct ImportArgs {
    /// Path to the UTF-8 CSV export.
    #[arg(long)]
    csv: PathBuf,
    /// YAML file mapping CSV columns onto destination columns.
    #[arg(long, default_value = "mapping.yaml")]
    mapping: PathBuf,
    /// Category value this run is scoped to (e.g. a workstyle).
    #[arg(long)]
    partition_key: Option<String>,
    #[arg(long, default_value_t = 2_000)]
    batch_size: usize,
    #[arg(long, default_value_t = 100)]
    stmt_limit: usize,
    #[arg(long, default_value_t = 4)]
    workers: usize,
    /// Compute and print would-be counts without performing any writes.
    #[arg(long)]
    dry_run: bool,
    #[arg(long, value_enum, default_value_t = Mode::Insert)]
    mode: Mode,
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
    #[arg(long, env = "AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Skip rows whose content hash already exists at the destination.
    Insert,
    /// Overwrite rows that collide on the surrogate ID.
    Refresh,
}

impl From<Mode> for ConflictPolicy {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Insert => ConflictPolicy::IgnoreByHash,
            Mode::Refresh => ConflictPolicy::ReplaceById,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Import(args) => import(args).await,
    }
}

async fn import(args: ImportArgs) -> Result<ExitCode> {
    let database_url = args
        .database_url
        .ok_or(ConfigError::MissingEnv("DATABASE_URL"))?;
    let auth_token = args.auth_token.ok_or(ConfigError::MissingEnv("AUTH_TOKEN"))?;

    let mut config = SyncConfig::new(database_url, auth_token, args.csv);
    config.partition_key = args.partition_key;
    config.batch_size = args.batch_size;
    config.stmt_limit = args.stmt_limit;
    config.workers = args.workers;
    config.dry_run = args.dry_run;
    config.conflict = args.mode.into();

    let pipeline = SyncPipeline::from_files(config, &args.mapping)?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight batches");
            signal_cancel.cancel();
        }
    });

    let summary = pipeline.run_once(cancel).await?;

    if summary.dry_run {
        println!(
            "dry-run: {} csv rows, {} duplicates skipped, {} rows would upload in {} batches",
            summary.csv_rows, summary.skipped_duplicates, summary.unseen_rows, summary.batches
        );
        return Ok(ExitCode::SUCCESS);
    }

    if !summary.index_complete {
        warn!("identity index was incomplete; duplicate detection degraded for this run");
    }

    println!(
        "import complete: run_id={} rows={} inserted={} errored={} elapsed={:.1}s throughput={:.1} rows/s",
        summary.run_id,
        summary.unseen_rows,
        summary.inserted,
        summary.errored,
        summary.elapsed_secs,
        summary.rows_per_sec
    );

    if summary.failed_batches > 0 {
        eprintln!(
            "{} of {} batches failed after retries",
            summary.failed_batches, summary.batches
        );
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
