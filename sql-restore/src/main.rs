//! sql-restore - Main entry point
//!
//! Restores SQL Server backups from the configured backup path.

use anyhow::Result;
use clap::{Parser, Subcommand};
use sql_restore::catalog::{self, BackupCatalog, BackupFileDescriptor};
use sql_restore::daemon::shutdown::ShutdownCoordinator;
use sql_restore::db::connector::DbConnector;
use sql_restore::db::tds::TdsDriver;
use sql_restore::restore::batch_summary;
use sql_restore::{utils, Config, RestoreEvent, RestoreOutcome, RestoreService};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Print events and listings as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the backup candidates in the local backup path
    List,

    /// Check that the configured SQL server accepts a login
    TestConnection,

    /// Restore the given backup files, or every candidate when none are given
    Restore {
        #[arg(value_name = "FILE")]
        files: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::debug!("Starting sql-restore v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::List => list(&config, args.json),
        Command::TestConnection => test_connection(&config).await,
        Command::Restore { files } => restore(&config, files, args.json).await,
    }
}

fn list(config: &Config, json: bool) -> Result<ExitCode> {
    let backups = load_catalog(Path::new(&config.paths.local_path))?;
    for file in backups.files() {
        if json {
            println!("{}", serde_json::to_string(file)?);
        } else {
            println!(
                "{:<40} {:>12} {}  {}",
                file.filename,
                utils::paths::format_bytes(file.size),
                file.modified.format("%Y-%m-%d %H:%M"),
                if file.compressed { "zip" } else { "bak" }
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn test_connection(config: &Config) -> Result<ExitCode> {
    let params = config.connect_params()?;
    let connector = DbConnector::new(Arc::new(TdsDriver));

    let check = tokio::spawn(async move { connector.test_connection(&params).await });
    match check.await? {
        Ok(()) => {
            println!("Connection successful.");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("Connection failed: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn restore(config: &Config, files: Vec<String>, json: bool) -> Result<ExitCode> {
    let settings = config.restore_settings()?;
    let candidates = select_candidates(Path::new(&settings.local_path), &files)?;
    if candidates.is_empty() {
        eprintln!("No backup files to restore.");
        return Ok(ExitCode::FAILURE);
    }

    let connector = Arc::new(DbConnector::new(Arc::new(TdsDriver)));
    let service = RestoreService::start(connector, settings)?;
    let mut events = service.subscribe();

    if service.queue_restores(candidates).await == 0 {
        eprintln!("No backup files to restore.");
        return Ok(ExitCode::FAILURE);
    }

    let shutdown = ShutdownCoordinator::new();
    let signal = shutdown.wait_for_signal();
    tokio::pin!(signal);
    let mut interrupted = false;

    let outcomes: Vec<RestoreOutcome> = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(RestoreEvent::BatchComplete { outcomes }) => {
                    if json {
                        print_json(&RestoreEvent::BatchComplete { outcomes: outcomes.clone() });
                    }
                    break outcomes;
                }
                Some(event) => print_event(&event, json),
                None => break Vec::new(),
            },
            _ = &mut signal, if !interrupted => {
                interrupted = true;
                shutdown.stop_restores(&service).await;
            }
        }
    };

    println!("{}", batch_summary(&outcomes));
    if !outcomes.is_empty() && outcomes.iter().all(|o| o.success) {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn load_catalog(local_path: &Path) -> Result<BackupCatalog> {
    let scanned = catalog::scan_directory(local_path)?;
    let mut backups = BackupCatalog::new();
    let changes = backups.apply(scanned);
    tracing::debug!(files = changes.added.len(), path = %local_path.display(), "Scanned backup path");
    Ok(backups)
}

/// Candidates named on the command line, or every file in the backup path.
fn select_candidates(local_path: &Path, files: &[String]) -> Result<Vec<BackupFileDescriptor>> {
    let backups = load_catalog(local_path)?;
    if files.is_empty() {
        return Ok(backups.files().cloned().collect());
    }

    let mut selected = Vec::new();
    for name in files {
        match backups.get(name) {
            Some(descriptor) => selected.push(descriptor.clone()),
            None => eprintln!("Skipping {}: not a backup file in {}", name, local_path.display()),
        }
    }
    Ok(selected)
}

fn print_event(event: &RestoreEvent, json: bool) {
    if json {
        print_json(event);
        return;
    }
    match event {
        RestoreEvent::HeaderAll(text) | RestoreEvent::HeaderCurrent(text) => println!("{}", text),
        RestoreEvent::StatusCurrent(text) => println!("  {}", text),
        RestoreEvent::JobFailed { errors, .. } => {
            for line in errors {
                eprintln!("  {}", line);
            }
        }
        _ => {}
    }
}

fn print_json(event: &RestoreEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::warn!("Failed to serialize event: {}", e),
    }
}
