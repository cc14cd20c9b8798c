// ABOUTME: Launches one worker process and streams its decoded events.
// ABOUTME: Launcher is the seam; ProcessLauncher runs a real subprocess via tokio.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::events::{EventDecoder, WorkerEvent};
use crate::error::SpawnError;

/// Time between the graceful termination signal and a forced kill.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// A fully resolved worker invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

/// Progress reported while a worker runs.
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchEvent {
    Started { pid: u32 },
    Event(WorkerEvent),
}

/// How a worker run ended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerRun {
    /// `None` when killed by a signal.
    pub exit_code: Option<i32>,
    pub stderr: String,
    pub cancelled: bool,
}

impl WorkerRun {
    pub fn succeeded(&self) -> bool {
        !self.cancelled && self.exit_code == Some(0)
    }
}

/// Starts a worker and reports its events until it exits.
///
/// Implementations send events on `events` as they arrive and return once
/// the worker has exited and its output is drained. When `cancel` fires they
/// stop the worker and return a run with `cancelled` set.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(
        &self,
        spec: &LaunchSpec,
        events: mpsc::UnboundedSender<LaunchEvent>,
        cancel: CancellationToken,
    ) -> Result<WorkerRun, SpawnError>;
}

/// Runs workers as child processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    grace: Duration,
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self {
            grace: TERMINATE_GRACE,
        }
    }
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the wait between graceful and forced termination.
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(
        &self,
        spec: &LaunchSpec,
        events: mpsc::UnboundedSender<LaunchEvent>,
        cancel: CancellationToken,
    ) -> Result<WorkerRun, SpawnError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SpawnError::Launch {
            program: spec.program.clone(),
            message: e.to_string(),
        })?;

        if let Some(pid) = child.id() {
            debug!(pid, program = %spec.program, "Worker started");
            let _ = events.send(LaunchEvent::Started { pid });
        }

        let stdout = child.stdout.take().ok_or(SpawnError::Pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(SpawnError::Pipe("stderr"))?;

        let reader = tokio::spawn(pump_events(stdout, events));
        let stderr_reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut stderr = stderr;
            let _ = stderr.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        });

        let mut cancelled = false;
        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                cancelled = true;
                terminate(&mut child, self.grace).await?
            }
        };

        let _ = reader.await;
        let stderr = stderr_reader.await.unwrap_or_default();

        Ok(WorkerRun {
            exit_code: status.code(),
            stderr,
            cancelled,
        })
    }
}

async fn pump_events<R>(mut stdout: R, events: mpsc::UnboundedSender<LaunchEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = EventDecoder::new();
    let mut buf = vec![0u8; 8192];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for event in decoder.push(&buf[..n]) {
                    let _ = events.send(LaunchEvent::Event(event));
                }
            }
            Err(e) => {
                debug!(error = %e, "Worker stdout read failed");
                break;
            }
        }
    }
    if let Some(event) = decoder.finish() {
        let _ = events.send(LaunchEvent::Event(event));
    }
}

/// Ask the child to stop, then kill it if it is still running after `grace`.
async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    request_stop(child)?;
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(pid = ?child.id(), "Worker ignored termination, killing");
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn request_stop(child: &mut Child) -> std::io::Result<()> {
    let Some(pid) = child.id().and_then(|p| i32::try_from(p).ok()) else {
        return Ok(());
    };
    // SAFETY: plain signal delivery to our own child.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    Ok(())
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}
