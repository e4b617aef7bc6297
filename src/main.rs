//! Streaming PostgreSQL backups to S3-compatible storage
//!
//! Runs `pg_dump` on a cron schedule and uploads its output while it is produced, or
//! replays a stored dump through `psql`.

// pgdumps3/src/main.rs
mod backup;
mod config;
mod errors;
mod outcome;
mod restore;
mod scheduler;
mod storage;
mod toolchain;
mod utils;

use anyhow::{Context, Result, bail};
use config::AppConfig;
use outcome::PipelineReport;
use scheduler::BackupJob;
use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use storage::{ObjectStore, S3Store};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use utils::logging;
use utils::process::StderrMode;

/// What this invocation does, from the first argument or `RESTORE_KEY`.
#[derive(Debug, PartialEq, Eq)]
enum Mode {
    Serve,
    Backup,
    Restore(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    match run_app().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "pgdumps3 stopped with an error");
            eprintln!("Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let config = AppConfig::load().context("Failed to load configuration")?;
    logging::init(&config.log_level, config.log_format);

    let args: Vec<String> = env::args().skip(1).collect();
    let mode = select_mode(&args, config.restore_key.as_deref())?;
    info!(?mode, target = ?config.target, s3 = ?config.s3, "pgdumps3 starting");

    let binding = toolchain::resolve(&config.target, &config.bin_dirs)
        .await
        .context("Failed to select PostgreSQL client tools")?;
    let store: Arc<dyn ObjectStore> = Arc::new(S3Store::connect(&config.s3).await);
    let stderr_mode = StderrMode::from_active_filter(config.verbose());

    match mode {
        Mode::Restore(key) => {
            let force = CancellationToken::new();
            watch_signals(force.clone(), force.clone());
            let started = Instant::now();
            let result = restore::restore(
                &binding,
                &config.target,
                &key,
                store.as_ref(),
                stderr_mode,
                &force,
            )
            .await;
            print_report(&PipelineReport::new("restore", &key, &result, started.elapsed()))?;
            if result.as_ref().is_err_and(|e| e.is_decompression()) {
                error!(key = %key, "stored dump is corrupt, restore an earlier backup instead");
            }
            result.with_context(|| format!("Restore of {} failed", key))?;
        }
        Mode::Backup => {
            let force = CancellationToken::new();
            watch_signals(force.clone(), force.clone());
            let job = BackupJob::new(
                binding,
                config.target.clone(),
                config.naming.clone(),
                store,
                stderr_mode,
                force,
            );
            let started = Instant::now();
            if let Some((key, result)) = job.run_once().await {
                print_report(&PipelineReport::new("dump", &key, &result, started.elapsed()))?;
                result.context("Backup failed")?;
            }
        }
        Mode::Serve => {
            let schedule = scheduler::parse_schedule(&config.cron_schedule)?;
            let shutdown = CancellationToken::new();
            let force = CancellationToken::new();
            watch_signals(shutdown.clone(), force.clone());
            let job = Arc::new(BackupJob::new(
                binding,
                config.target.clone(),
                config.naming.clone(),
                store,
                stderr_mode,
                force,
            ));
            scheduler::run(
                job,
                schedule,
                config.naming.time_zone,
                shutdown,
                config.backup_on_shutdown,
            )
            .await;
        }
    }

    Ok(())
}

fn select_mode(args: &[String], restore_key: Option<&str>) -> Result<Mode> {
    match args.first().map(|a| a.trim()) {
        Some("backup") => Ok(Mode::Backup),
        Some("restore") => match args.get(1).map(String::as_str).or(restore_key) {
            Some(key) => Ok(Mode::Restore(key.to_string())),
            None => bail!("restore needs an object key argument or RESTORE_KEY"),
        },
        Some("serve") => Ok(Mode::Serve),
        Some(other) => bail!(
            "unknown command {:?}; expected 'serve', 'backup' or 'restore [key]'",
            other
        ),
        None => Ok(match restore_key {
            Some(key) => Mode::Restore(key.to_string()),
            None => Mode::Serve,
        }),
    }
}

fn print_report(report: &PipelineReport) -> Result<()> {
    println!("{}", serde_json::to_string(report)?);
    Ok(())
}

/// First SIGINT/SIGTERM cancels `shutdown`, the second cancels `force`.
fn watch_signals(shutdown: CancellationToken, force: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!(error = %e, "could not listen for shutdown signals");
            return;
        }
        warn!("Shutdown signal received. Send it again to force exit");
        shutdown.cancel();

        if shutdown_signal().await.is_ok() {
            warn!("Force exiting, terminating any running dump");
            force.cancel();
        }
    });
}

async fn shutdown_signal() -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}
