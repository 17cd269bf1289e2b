//! physical-backup CLI - transportable tablespace backup and restore for MariaDB.

use clap::{Parser, Subcommand};
use physical_backup::{
    BackupError, Config, DatabaseTarget, MarkerFileConfirmation, Orchestrator, RunReport,
    WorkflowPlan,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "physical-backup")]
#[command(about = "Physical backup and restore of MariaDB tables using transportable tablespaces")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export one source database into an archive
    Export {
        /// Archive to write (.tar.gz, .tgz or .tar)
        #[arg(long)]
        archive: PathBuf,

        /// Source database to export (required when several are configured)
        #[arg(long)]
        database: Option<String>,
    },

    /// Restore the target database from an archive
    Import {
        /// Archive to read
        #[arg(long)]
        archive: PathBuf,
    },

    /// Lock source databases while the data volume is snapshotted
    SnapshotExport {
        /// Where to write the handoff record [default: snapshot.handoff_path]
        #[arg(long)]
        handoff: Option<PathBuf>,

        /// Source databases to lock (default: all configured sources)
        #[arg(long = "database")]
        databases: Vec<String>,

        /// Seconds to wait for snapshot confirmation
        #[arg(long)]
        confirm_timeout: Option<u64>,

        /// Confirm by creating this file instead of pressing Enter
        #[arg(long)]
        marker_file: Option<PathBuf>,
    },

    /// Restore the target database from a mounted volume snapshot
    SnapshotImport {
        /// Handoff record written by snapshot-export [default: snapshot.handoff_path]
        #[arg(long)]
        handoff: Option<PathBuf>,

        /// Database in the handoff record to restore from
        #[arg(long)]
        source_database: String,

        /// Data directory of the mounted snapshot
        #[arg(long)]
        snapshot_data_dir: PathBuf,
    },

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), BackupError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format).map_err(BackupError::Config)?;

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    let cancel_token = setup_signal_handler()?;

    match cli.command {
        Commands::Export { archive, database } => {
            let source = select_source(&config, database.as_deref())?;
            let mut orchestrator = Orchestrator::new(config)?;
            let plan = WorkflowPlan::ArchiveExport { source, archive };
            let report = orchestrator.run(plan, cancel_token).await?;
            print_report(&report, cli.output_json)?;
        }

        Commands::Import { archive } => {
            let target = require_target(&config)?;
            let mut orchestrator = Orchestrator::new(config)?;
            let plan = WorkflowPlan::ArchiveImport { target, archive };
            let report = orchestrator.run(plan, cancel_token).await?;
            print_report(&report, cli.output_json)?;
        }

        Commands::SnapshotExport {
            handoff,
            databases,
            confirm_timeout,
            marker_file,
        } => {
            if let Some(secs) = confirm_timeout {
                config.snapshot.confirm_timeout_secs = secs;
                config.validate()?;
            }
            let sources = if databases.is_empty() {
                config.sources.clone()
            } else {
                databases
                    .iter()
                    .map(|name| select_source(&config, Some(name)))
                    .collect::<Result<Vec<_>, _>>()?
            };
            if sources.is_empty() {
                return Err(BackupError::Config(
                    "no source databases configured".to_string(),
                ));
            }
            let handoff = handoff.unwrap_or_else(|| config.snapshot.handoff_path.clone());

            let mut orchestrator = Orchestrator::new(config)?;
            if let Some(path) = marker_file {
                orchestrator =
                    orchestrator.with_snapshot_signal(Box::new(MarkerFileConfirmation::new(path)));
            }
            let plan = WorkflowPlan::LiveSnapshotExport { sources, handoff };
            let report = orchestrator.run(plan, cancel_token).await?;
            print_report(&report, cli.output_json)?;
        }

        Commands::SnapshotImport {
            handoff,
            source_database,
            snapshot_data_dir,
        } => {
            let target = require_target(&config)?;
            let handoff = handoff.unwrap_or_else(|| config.snapshot.handoff_path.clone());
            let mut orchestrator = Orchestrator::new(config)?;
            let plan = WorkflowPlan::LiveSnapshotImport {
                target,
                handoff,
                source_database,
                snapshot_data_dir,
            };
            let report = orchestrator.run(plan, cancel_token).await?;
            print_report(&report, cli.output_json)?;
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::new(config)?;
            let result = orchestrator.health_check().await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                for db in &result.databases {
                    println!(
                        "  {} {} ({}:{}): {} ({}ms)",
                        db.role,
                        db.database,
                        db.host,
                        db.port,
                        if db.connected { "OK" } else { "FAILED" },
                        db.latency_ms
                    );
                    if let Some(ref err) = db.error {
                        println!("    Error: {}", err);
                    }
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(BackupError::Config("Health check failed".to_string()));
            }
        }
    }

    Ok(())
}

/// The configured source named `name`, or the only source when no name is given.
fn select_source(config: &Config, name: Option<&str>) -> Result<DatabaseTarget, BackupError> {
    match name {
        Some(name) => config.source(name).cloned().ok_or_else(|| {
            BackupError::Config(format!("source database {} is not configured", name))
        }),
        None => match config.sources.as_slice() {
            [only] => Ok(only.clone()),
            [] => Err(BackupError::Config(
                "no source databases configured".to_string(),
            )),
            _ => Err(BackupError::Config(
                "several source databases configured; choose one with --database".to_string(),
            )),
        },
    }
}

fn require_target(config: &Config) -> Result<DatabaseTarget, BackupError> {
    config
        .target
        .clone()
        .ok_or_else(|| BackupError::Config("no target database configured".to_string()))
}

fn print_report(report: &RunReport, json: bool) -> Result<(), BackupError> {
    if json {
        println!("{}", report.to_json()?);
        return Ok(());
    }

    println!("\n{} completed!", report.variant);
    println!("  Run ID: {}", report.run_id);
    println!("  Duration: {:.2}s", report.duration_seconds);
    for db in &report.databases {
        println!(
            "  {}: {} transactional, {} flat-file tables, {} files restored",
            db.database, db.transactional_tables, db.flat_file_tables, db.files_restored
        );
    }
    if let Some(ref archive) = report.archive {
        match report.archive_entries {
            Some(entries) => println!("  Archive: {} ({} entries)", archive.display(), entries),
            None => println!("  Archive: {}", archive.display()),
        }
    }
    if let Some(ref handoff) = report.handoff {
        println!("  Handoff record: {}", handoff.display());
    }
    if !report.tables_drop_skipped.is_empty() {
        println!("  Drop skipped: {:?}", report.tables_drop_skipped);
    }
    if !report.indexes_recovered.is_empty() {
        println!("  Indexes recovered: {:?}", report.indexes_recovered);
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(format!("unknown verbosity: {}", other)),
    };

    // Logs go to stderr; stdout carries the report
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("unknown log format: {}", other)),
    }

    Ok(())
}

/// Cancel the run on SIGINT (Ctrl-C) or SIGTERM.
///
/// Locks are released and sessions closed before the process exits.
#[cfg(unix)]
fn setup_signal_handler() -> Result<CancellationToken, BackupError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!("\nReceived {}. Releasing locks and shutting down...", name);
        token.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler() -> Result<CancellationToken, BackupError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Releasing locks and shutting down...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
