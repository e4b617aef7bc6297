// pgdumps3/src/restore/logic.rs
use std::io;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::decompress::{FeedError, feed_decompressed};
use crate::errors::{PipelineError, Result, StorageError};
use crate::outcome::PipelineOutcome;
use crate::storage::ObjectStore;
use crate::utils::process::{StderrMode, Supervised, drain_output};

const STDIN_RESOURCE: &str = "restore tool stdin";

/// Downloads `key`, decompresses it on the fly and pipes the result into `command`'s stdin.
///
/// On a corrupt or unreadable object the child is killed before its stdin is closed, so it
/// never sees a clean EOF and cannot commit a partially replayed script.
pub(crate) async fn stream_from_store(
    mut command: Command,
    tool: &'static str,
    key: &str,
    store: &dyn ObjectStore,
    stderr_mode: StderrMode,
    cancel: &CancellationToken,
) -> Result<PipelineOutcome> {
    let started = Instant::now();
    let body = store.get_stream(key).await?;

    let stdout_mode = match stderr_mode {
        StderrMode::Verbose => Stdio::piped(),
        StderrMode::Quiet => Stdio::null(),
    };
    command
        .stdin(Stdio::piped())
        .stdout(stdout_mode)
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = command.spawn().map_err(|source| PipelineError::Spawn {
        program: tool.to_string(),
        source,
    })?;

    let (Some(stdin), Some(stderr)) = (child.stdin.take(), child.stderr.take()) else {
        return Err(PipelineError::Io(io::Error::other(format!(
            "{} started without captured stdio",
            tool
        ))));
    };
    let drains = Drains {
        stderr: drain_output(stderr, tool, stderr_mode),
        stdout: child
            .stdout
            .take()
            .map(|stdout| drain_output(stdout, tool, StderrMode::Verbose)),
    };
    let mut process = Supervised::new(child);

    // Bridges must be created on the runtime; they only block inside the worker below.
    let source = SyncIoBridge::new(body);
    let sink = SyncIoBridge::new(stdin);
    let mut feed = tokio::task::spawn_blocking(move || {
        let mut sink = sink;
        let fed = feed_decompressed(source, &mut sink);
        let closed = fed.is_ok().then(|| sink.shutdown());
        (fed, closed, sink)
    });

    let joined = tokio::select! {
        joined = &mut feed => Some(joined),
        _ = cancel.cancelled() => None,
    };

    let (fed, closed, sink) = match joined {
        Some(Ok(parts)) => parts,
        Some(Err(join_err)) => {
            process.kill();
            let _ = process.wait().await;
            drains.finish().await;
            return Err(PipelineError::Io(io::Error::other(join_err)));
        }
        None => {
            // Killing the child breaks the pipe, which unblocks the worker.
            process.kill();
            let _ = process.wait().await;
            let _ = feed.await;
            drains.finish().await;
            warn!(key, "restore cancelled, {} was terminated", tool);
            return Err(PipelineError::Cancelled);
        }
    };

    let bytes = match fed {
        Ok(bytes) => bytes,
        Err(FeedError::Source(e)) => {
            abort_child(process, sink, tool, key).await;
            let stderr = drains.finish().await;
            error!(key, error = %e, stderr = %stderr.trim(), "reading backup object failed");
            return Err(PipelineError::Transfer(StorageError::Read(e)));
        }
        Err(FeedError::Decompress(e)) => {
            abort_child(process, sink, tool, key).await;
            let stderr = drains.finish().await;
            error!(key, error = %e, stderr = %stderr.trim(), "backup object is not valid gzip");
            return Err(PipelineError::Decompression(e));
        }
        Err(FeedError::Sink(e)) => {
            // The child stopped reading; its exit status is the real story.
            drop(sink);
            let status = process.wait().await?;
            let stderr = drains.finish().await;
            if status.success() {
                return Err(PipelineError::Io(e));
            }
            error!(key, %status, "{} exited before consuming the dump", tool);
            return Err(PipelineError::Execution {
                tool,
                status,
                stderr,
            }
            .with_secondary(Some(PipelineError::ResourceRelease {
                resource: STDIN_RESOURCE,
                source: e,
            })));
        }
    };

    drop(sink);
    let status = process.wait().await?;
    let stderr = drains.finish().await;
    let close_err = closed
        .and_then(|closed| closed.err())
        .map(|source| PipelineError::ResourceRelease {
            resource: STDIN_RESOURCE,
            source,
        });

    if !status.success() {
        error!(key, %status, "{} failed while replaying the dump", tool);
        return Err(PipelineError::Execution {
            tool,
            status,
            stderr,
        }
        .with_secondary(close_err));
    }
    if let Some(err) = close_err {
        return Err(err);
    }

    Ok(PipelineOutcome {
        key: key.to_string(),
        location: None,
        bytes_transferred: bytes,
        elapsed: started.elapsed(),
    })
}

/// Kills the child while `sink` still holds its stdin open, then releases the pipe.
async fn abort_child<S>(mut process: Supervised, sink: S, tool: &'static str, key: &str) {
    process.kill();
    match process.wait().await {
        Ok(status) => warn!(key, tool, %status, "terminated before end of input"),
        Err(e) => warn!(key, tool, error = %e, "could not reap after aborted restore"),
    }
    drop(sink);
}

struct Drains {
    stderr: JoinHandle<String>,
    stdout: Option<JoinHandle<String>>,
}

impl Drains {
    /// Waits for both output streams to close and returns the captured stderr.
    async fn finish(self) -> String {
        if let Some(stdout) = self.stdout {
            let _ = stdout.await;
        }
        self.stderr.await.unwrap_or_default()
    }
}
