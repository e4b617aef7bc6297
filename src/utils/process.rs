// pgdumps3/src/utils/process.rs
use std::collections::VecDeque;
use std::io;
use std::process::ExitStatus;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{Level, debug};

/// Lines of child stderr kept for error reports.
const STDERR_TAIL_LINES: usize = 200;

/// What happens to a child's stderr while it runs. The tail is kept for error reports either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrMode {
    /// Mirror every line to the log at debug level as it arrives.
    Verbose,
    /// Only keep the tail.
    Quiet,
}

impl StderrMode {
    /// `Verbose` only when the installed subscriber would actually emit the mirrored lines.
    pub fn from_active_filter(requested_verbose: bool) -> Self {
        if requested_verbose && tracing::enabled!(Level::DEBUG) {
            StderrMode::Verbose
        } else {
            StderrMode::Quiet
        }
    }
}

/// Drains a child's output stream until EOF, returning its last lines.
pub fn drain_output<R>(output: R, tool: &'static str, mode: StderrMode) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(output);
        let mut tail: VecDeque<String> = VecDeque::new();
        let mut dropped = 0usize;
        let mut line = Vec::new();

        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(tool, error = %e, "stopped reading child output");
                    break;
                }
            }
            let text = String::from_utf8_lossy(&line).trim_end().to_string();
            if mode == StderrMode::Verbose {
                debug!(tool, "{}", text);
            }
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
                dropped += 1;
            }
            tail.push_back(text);
        }

        let mut captured = String::new();
        if dropped > 0 {
            captured.push_str(&format!("... {} earlier lines omitted\n", dropped));
        }
        for line in tail {
            captured.push_str(&line);
            captured.push('\n');
        }
        captured
    })
}

/// A child process watched by its own task, which can be told to kill it.
pub struct Supervised {
    kill: Option<oneshot::Sender<()>>,
    exit: JoinHandle<io::Result<ExitStatus>>,
}

impl Supervised {
    pub fn new(mut child: Child) -> Self {
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let exit = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => status,
                Ok(()) = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        debug!(error = %e, "kill signal not delivered, child already exited");
                    }
                    child.wait().await
                }
            }
        });
        Supervised {
            kill: Some(kill_tx),
            exit,
        }
    }

    /// Requests termination. Has no effect once the child has exited.
    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    /// Waits for the child to reach a terminal state.
    pub async fn wait(self) -> io::Result<ExitStatus> {
        self.exit.await.map_err(io::Error::other)?
    }
}
