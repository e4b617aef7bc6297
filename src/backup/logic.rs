// pgdumps3/src/backup/logic.rs
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::{PipelineError, Result};
use crate::outcome::PipelineOutcome;
use crate::storage::ObjectStore;
use crate::utils::process::{StderrMode, Supervised, drain_output};

/// Runs `command` and uploads its stdout to `key` while it is still producing.
///
/// The upload decides whether bytes made it to the bucket; the exit status decides whether
/// those bytes are a backup. Both must succeed. If the upload fails the child is killed
/// before returning so it cannot block forever on a pipe nobody drains.
pub(crate) async fn stream_to_store(
    mut command: Command,
    tool: &'static str,
    key: &str,
    store: &dyn ObjectStore,
    stderr_mode: StderrMode,
    cancel: &CancellationToken,
) -> Result<PipelineOutcome> {
    let started = Instant::now();

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = command.spawn().map_err(|source| PipelineError::Spawn {
        program: tool.to_string(),
        source,
    })?;

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(PipelineError::Io(std::io::Error::other(format!(
            "{} started without captured output",
            tool
        ))));
    };
    let stderr_task = drain_output(stderr, tool, stderr_mode);
    let mut process = Supervised::new(child);

    let upload = tokio::select! {
        result = store.put_stream(key, Box::new(stdout)) => Some(result),
        _ = cancel.cancelled() => None,
    };

    let receipt = match upload {
        Some(Ok(receipt)) => receipt,
        Some(Err(upload_err)) => {
            process.kill();
            match process.wait().await {
                Ok(status) => warn!(tool, %status, "terminated after upload failure"),
                Err(e) => warn!(tool, error = %e, "could not reap after upload failure"),
            }
            let stderr = stderr_task.await.unwrap_or_default();
            error!(key, error = %upload_err, stderr = %stderr.trim(), "upload to S3 failed");
            return Err(PipelineError::Transfer(upload_err));
        }
        None => {
            process.kill();
            let _ = process.wait().await;
            let _ = stderr_task.await;
            warn!(key, "dump cancelled, object was not completed");
            return Err(PipelineError::Cancelled);
        }
    };

    let status = process.wait().await?;
    let stderr = stderr_task.await.unwrap_or_default();
    if !status.success() {
        warn!(
            key,
            %status,
            bytes = receipt.bytes,
            "uploaded object is not a valid backup, {} failed",
            tool
        );
        return Err(PipelineError::Execution {
            tool,
            status,
            stderr,
        });
    }

    info!(
        location = %receipt.location,
        key,
        bytes = receipt.bytes,
        "Successfully uploaded backup to S3"
    );
    Ok(PipelineOutcome {
        key: key.to_string(),
        location: Some(receipt.location),
        bytes_transferred: receipt.bytes,
        elapsed: started.elapsed(),
    })
}
