pub(crate) mod db_dump;
mod logic;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::BackupTarget;
use crate::errors::Result;
use crate::outcome::PipelineOutcome;
use crate::storage::ObjectStore;
use crate::toolchain::ToolBinding;
use crate::utils::process::StderrMode;

/// Dumps `target` with the bound `pg_dump` and streams the compressed output to `key`.
///
/// Callers must not run two dumps at once; see `scheduler::BackupJob`.
pub async fn dump(
    binding: &ToolBinding,
    target: &BackupTarget,
    key: &str,
    store: &dyn ObjectStore,
    stderr_mode: StderrMode,
    cancel: &CancellationToken,
) -> Result<PipelineOutcome> {
    info!(bucket = store.bucket(), key, "Starting pg_dump to S3");
    let command = db_dump::dump_command(binding, target);
    logic::stream_to_store(command, "pg_dump", key, store, stderr_mode, cancel).await
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;

    #[tokio::test]
    async fn dump_runs_bound_tool_with_credentials_in_env() {
        let (_dir, binding) = test_support::fake_tools(r#"echo "pw=$PGPASSWORD args=$*""#, "cat >/dev/null");
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();

        let outcome = dump(
            &binding,
            &test_support::target(),
            "backups/pg16_mydb.sql.gz",
            &store,
            StderrMode::Quiet,
            &cancel,
        )
        .await
        .unwrap();

        let body = String::from_utf8(store.object("backups/pg16_mydb.sql.gz").unwrap()).unwrap();
        assert_eq!(
            body,
            "pw=hunter2 args=-h db.internal -p 5432 -U postgres -d mydb --no-password --verbose --clean --if-exists --create -Z 6\n"
        );
        assert_eq!(outcome.key, "backups/pg16_mydb.sql.gz");
    }
}
