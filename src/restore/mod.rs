pub(crate) mod db_restore;
mod decompress;
mod logic;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::BackupTarget;
use crate::errors::Result;
use crate::outcome::PipelineOutcome;
use crate::storage::ObjectStore;
use crate::toolchain::ToolBinding;
use crate::utils::process::StderrMode;

/// Replays the dump stored under `key` into the server with the bound `psql`.
///
/// The dump recreates its database, so whatever currently exists under that name is dropped.
pub async fn restore(
    binding: &ToolBinding,
    target: &BackupTarget,
    key: &str,
    store: &dyn ObjectStore,
    stderr_mode: StderrMode,
    cancel: &CancellationToken,
) -> Result<PipelineOutcome> {
    info!(bucket = store.bucket(), key, "starting pg_restore");
    let command = db_restore::restore_command(binding, target);
    let outcome = logic::stream_from_store(command, "psql", key, store, stderr_mode, cancel).await?;
    info!(
        db = %target.database,
        key,
        bytes = outcome.bytes_transferred,
        "successfully restored database"
    );
    Ok(outcome)
}
