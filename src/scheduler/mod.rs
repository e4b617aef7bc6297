// pgdumps3/src/scheduler/mod.rs
use anyhow::{Context, Result};
use chrono::Utc;
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use tokio::select;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backup::{self, db_dump};
use crate::config::{BackupTarget, DumpNaming};
use crate::errors::PipelineError;
use crate::outcome::PipelineOutcome;
use crate::storage::ObjectStore;
use crate::toolchain::ToolBinding;
use crate::utils::process::StderrMode;

/// Everything a dump needs, shared by the cron loop and the shutdown path.
pub struct BackupJob {
    pub binding: ToolBinding,
    pub target: BackupTarget,
    pub naming: DumpNaming,
    pub store: Arc<dyn ObjectStore>,
    pub stderr_mode: StderrMode,
    /// Fired on a second shutdown signal; kills whatever dump is running.
    pub force: CancellationToken,
    slot: Arc<Semaphore>,
}

impl BackupJob {
    pub fn new(
        binding: ToolBinding,
        target: BackupTarget,
        naming: DumpNaming,
        store: Arc<dyn ObjectStore>,
        stderr_mode: StderrMode,
        force: CancellationToken,
    ) -> Self {
        BackupJob {
            binding,
            target,
            naming,
            store,
            stderr_mode,
            force,
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    /// Runs one dump for a cron tick. A tick that arrives while a dump is running is dropped.
    ///
    /// Returns `None` when the tick was skipped.
    pub async fn on_schedule(&self) -> Option<Result<PipelineOutcome, PipelineError>> {
        let Ok(_permit) = self.slot.clone().try_acquire_owned() else {
            warn!(db = %self.target.database, "previous backup still running, skipping this run");
            return None;
        };
        let result = self.dump_now().await;
        if let Err(e) = &result {
            error!(db = %self.target.database, error = %e, "scheduled backup failed");
        }
        Some(result)
    }

    /// Waits for any running dump, then takes a final one when asked to.
    pub async fn on_shutdown(&self, run_final_backup: bool) -> Option<Result<PipelineOutcome, PipelineError>> {
        let Ok(_permit) = self.slot.clone().acquire_owned().await else {
            return None;
        };
        if !run_final_backup {
            return None;
        }
        info!(db = %self.target.database, "running final backup before shutdown");
        let result = self.dump_now().await;
        if let Err(e) = &result {
            error!(db = %self.target.database, error = %e, "shutdown backup failed");
        }
        Some(result)
    }

    /// Object key for a dump started now.
    pub fn next_key(&self) -> String {
        db_dump::generate_dump_name(
            &self.naming,
            &self.target.database,
            self.binding.major_version,
            Utc::now(),
        )
    }

    /// Runs one dump immediately. Callers are responsible for holding the slot.
    async fn dump_now(&self) -> Result<PipelineOutcome, PipelineError> {
        let key = self.next_key();
        self.dump_to(&key).await
    }

    async fn dump_to(&self, key: &str) -> Result<PipelineOutcome, PipelineError> {
        backup::dump(
            &self.binding,
            &self.target,
            key,
            self.store.as_ref(),
            self.stderr_mode,
            &self.force,
        )
        .await
    }

    /// One-shot dump for the `backup` command, still single-flight with anything else.
    /// Returns the key it wrote to along with the result.
    pub async fn run_once(&self) -> Option<(String, Result<PipelineOutcome, PipelineError>)> {
        let Ok(_permit) = self.slot.clone().acquire_owned().await else {
            return None;
        };
        let key = self.next_key();
        let result = self.dump_to(&key).await;
        Some((key, result))
    }
}

/// Parses a cron expression. Classic 5-field expressions get a leading seconds field;
/// `@daily` style macros pass through.
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let expr = expr.trim();
    let normalized = if expr.starts_with('@') || expr.split_whitespace().count() != 5 {
        expr.to_string()
    } else {
        format!("0 {}", expr)
    };
    Schedule::from_str(&normalized).with_context(|| format!("invalid CRON_SCHEDULE {:?}", expr))
}

/// Triggers `job` on every tick of `schedule` until `shutdown` fires, then runs the shutdown hook.
///
/// Ticks already fired when shutdown arrives are allowed to finish before the hook runs.
pub async fn run(
    job: Arc<BackupJob>,
    schedule: Schedule,
    time_zone: Tz,
    shutdown: CancellationToken,
    backup_on_shutdown: bool,
) {
    info!(time_zone = %time_zone, "Starting backup scheduler");
    let mut ticks = JoinSet::new();

    loop {
        let Some(next) = schedule.upcoming(time_zone).next() else {
            warn!("schedule has no future runs, waiting for shutdown");
            shutdown.cancelled().await;
            break;
        };
        info!(next_run = %next, "next backup scheduled");
        let wait = (next.with_timezone(&Utc) - Utc::now())
            .to_std()
            .unwrap_or_default();

        select! {
            _ = sleep(wait) => {
                let job = job.clone();
                // Not awaited here so a long dump never delays the next tick's skip decision.
                ticks.spawn(async move {
                    job.on_schedule().await;
                });
            }
            Some(_) = ticks.join_next(), if !ticks.is_empty() => {}
            _ = shutdown.cancelled() => {
                info!("Scheduler shutdown requested");
                break;
            }
        }
    }

    while ticks.join_next().await.is_some() {}
    job.on_shutdown(backup_on_shutdown).await;
    info!("Scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::test_support::{fake_tools, target};
    use crate::storage::memory::MemoryStore;
    use std::time::Duration;

    fn naming() -> DumpNaming {
        DumpNaming {
            prefix: "backups".to_string(),
            infix: String::new(),
            suffix: ".sql.gz".to_string(),
            time_zone: chrono_tz::UTC,
        }
    }

    fn job(dump_script: &str, store: Arc<MemoryStore>) -> (tempfile::TempDir, Arc<BackupJob>) {
        let (dir, binding) = fake_tools(dump_script, "cat >/dev/null");
        let job = BackupJob::new(
            binding,
            target(),
            naming(),
            store,
            StderrMode::Quiet,
            CancellationToken::new(),
        );
        (dir, Arc::new(job))
    }

    #[test]
    fn five_field_expression_gains_seconds() {
        let schedule = parse_schedule("30 2 * * *").unwrap();
        let next = schedule.upcoming(chrono_tz::UTC).next().unwrap();
        assert_eq!(next.format("%H:%M:%S").to_string(), "02:30:00");
    }

    #[test]
    fn macros_and_six_field_expressions_pass_through() {
        assert!(parse_schedule("@daily").is_ok());
        assert!(parse_schedule("@hourly").is_ok());
        assert!(parse_schedule("0 */5 * * * *").is_ok());
    }

    #[test]
    fn garbage_expression_is_rejected() {
        let err = parse_schedule("every tuesday").unwrap_err();
        assert!(err.to_string().contains("CRON_SCHEDULE"));
    }

    #[tokio::test]
    async fn overlapping_ticks_never_run_concurrently() {
        let store = Arc::new(MemoryStore::new());
        let (_dir, job) = job("sleep 0.5; echo data", store.clone());

        let first = tokio::spawn({
            let job = job.clone();
            async move { job.on_schedule().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = job.on_schedule().await;

        assert!(second.is_none(), "second tick should have been skipped");
        assert!(first.await.unwrap().unwrap().is_ok());
        assert_eq!(store.max_concurrent_puts(), 1);
        assert_eq!(store.puts_started(), 1);
    }

    #[tokio::test]
    async fn failed_tick_does_not_block_the_next() {
        let store = Arc::new(MemoryStore::new());
        let (_dir, job) = job("exit 1", store.clone());

        assert!(job.on_schedule().await.unwrap().is_err());
        assert!(job.on_schedule().await.is_some());
    }

    #[tokio::test]
    async fn shutdown_waits_for_running_dump_then_takes_final_one() {
        let store = Arc::new(MemoryStore::new());
        let (_dir, job) = job("sleep 0.5; echo data", store.clone());

        let running = tokio::spawn({
            let job = job.clone();
            async move { job.on_schedule().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let final_dump = job.on_shutdown(true).await;

        assert!(running.await.unwrap().unwrap().is_ok());
        assert!(final_dump.unwrap().is_ok());
        assert_eq!(store.puts_started(), 2);
        assert_eq!(store.max_concurrent_puts(), 1);
    }

    #[tokio::test]
    async fn shutdown_without_final_backup_dumps_nothing() {
        let store = Arc::new(MemoryStore::new());
        let (_dir, job) = job("echo data", store.clone());

        assert!(job.on_shutdown(false).await.is_none());
        assert_eq!(store.puts_started(), 0);
    }

    #[tokio::test]
    async fn run_returns_after_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let (_dir, job) = job("echo data", store.clone());
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        tokio::time::timeout(
            Duration::from_secs(5),
            run(job, parse_schedule("@yearly").unwrap(), chrono_tz::UTC, shutdown, true),
        )
        .await
        .expect("scheduler ignored shutdown");

        assert_eq!(store.keys().len(), 1);
        assert!(store.keys()[0].starts_with("backups/pg16_mydb_"));
    }

    #[tokio::test]
    async fn run_once_reports_the_key_it_wrote() {
        let store = Arc::new(MemoryStore::new());
        let (_dir, job) = job("echo data", store.clone());

        let (key, result) = job.run_once().await.unwrap();

        assert_eq!(result.unwrap().key, key);
        assert_eq!(store.object(&key).unwrap(), b"data\n");
    }

    #[tokio::test]
    async fn shutdown_lets_fired_ticks_finish() {
        let store = Arc::new(MemoryStore::new());
        let (_dir, job) = job("sleep 0.3; echo data", store.clone());
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            trigger.cancel();
        });

        tokio::time::timeout(
            Duration::from_secs(10),
            run(job, parse_schedule("* * * * * *").unwrap(), chrono_tz::UTC, shutdown, false),
        )
        .await
        .expect("scheduler ignored shutdown");

        // Every upload that started also completed; none was cut off by returning early.
        assert!(store.puts_started() >= 1);
        assert_eq!(store.keys().len(), store.puts_started());
    }
}
