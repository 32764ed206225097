//! Process table entries.
//!
//! Every helper a session starts, child process or tokio task, is wrapped in
//! a [`ProcessHandle`] so it can be waited on, peeked at, or terminated. A
//! handle that is dropped while its helper still runs kills or aborts it.

use std::collections::VecDeque;
use std::future::Future;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ltacp_checksum::ChecksumPair;

use crate::error::TransferError;

/// Lines of stderr kept for error reports.
const STDERR_TAIL: usize = 20;

/// How long a reaped child's output readers may take to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a killed child may take to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// What a helper produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutput {
    /// A child process exited.
    Exited { status: ExitStatus, stderr: String },
    /// Bytes moved through the relay or into a pipe.
    Bytes(u64),
    Checksum(ChecksumPair),
}

pub type StageResult = Result<StageOutput, TransferError>;

impl StageOutput {
    pub fn into_checksum(self, stage: &str) -> Result<ChecksumPair, TransferError> {
        match self {
            Self::Checksum(pair) => Ok(pair),
            other => Err(unexpected(stage, &other)),
        }
    }

    pub fn into_bytes(self, stage: &str) -> Result<u64, TransferError> {
        match self {
            Self::Bytes(n) => Ok(n),
            other => Err(unexpected(stage, &other)),
        }
    }
}

fn unexpected(stage: &str, output: &StageOutput) -> TransferError {
    TransferError::LocalProcessPrematureExit {
        stage: stage.to_string(),
        detail: format!("unexpected stage output {output:?}"),
    }
}

/// First failure among a session's broker-side stages.
///
/// Stages record themselves before they finish, so a waiter woken by the
/// token always finds the cause.
#[derive(Debug, Clone, Default)]
pub struct LocalFailure {
    token: CancellationToken,
    first: Arc<Mutex<Option<(String, String)>>>,
}

impl LocalFailure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure; only the first one is kept.
    pub fn record(&self, stage: &str, detail: &str) {
        if let Ok(mut first) = self.first.lock()
            && first.is_none()
        {
            *first = Some((stage.to_string(), detail.to_string()));
        }
        self.token.cancel();
    }

    pub fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The recorded failure, if any.
    pub fn cause(&self) -> Option<TransferError> {
        let first = self.first.lock().ok()?;
        first
            .as_ref()
            .map(|(stage, detail)| TransferError::LocalProcessPrematureExit {
                stage: stage.clone(),
                detail: detail.clone(),
            })
    }

    /// Resolves once a failure is recorded.
    pub async fn failed(&self) -> TransferError {
        self.token.cancelled().await;
        self.cause()
            .unwrap_or_else(|| TransferError::LocalProcessPrematureExit {
                stage: "local stage".into(),
                detail: "failed".into(),
            })
    }
}

/// Result of a non-blocking check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    /// Finished; the outcome has not been collected yet.
    Finished,
    /// Finished and collected by [`ProcessHandle::join`].
    Collected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Task,
    Child,
}

/// A tracked helper.
#[derive(Debug)]
pub struct ProcessHandle {
    description: String,
    pid: Option<u32>,
    kind: Kind,
    task: Option<JoinHandle<StageResult>>,
    kill: CancellationToken,
    exited: CancellationToken,
    outcome: Option<StageResult>,
}

impl ProcessHandle {
    /// Runs `fut` as a tracked task.
    pub fn spawn_task<F>(description: impl Into<String>, fut: F) -> Self
    where
        F: Future<Output = StageResult> + Send + 'static,
    {
        let exited = CancellationToken::new();
        let task = tokio::spawn({
            let exited = exited.clone();
            async move {
                let result = fut.await;
                exited.cancel();
                result
            }
        });
        Self {
            description: description.into(),
            pid: None,
            kind: Kind::Task,
            task: Some(task),
            kill: CancellationToken::new(),
            exited,
            outcome: None,
        }
    }

    /// Spawns a child process and a task reaping it.
    ///
    /// Output lines are forwarded to the log. When `fail_fast` is given, a
    /// non-zero exit becomes [`TransferError::LocalProcessPrematureExit`]
    /// and is recorded there; otherwise the exit status is returned as is.
    pub fn spawn_child(
        description: impl Into<String>,
        command: std::process::Command,
        fail_fast: Option<LocalFailure>,
    ) -> Result<Self, TransferError> {
        let description = description.into();
        let program = command.get_program().to_string_lossy().into_owned();

        let mut command = tokio::process::Command::from(command);
        command.kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|source| TransferError::Spawn { program, source })?;
        let pid = child.id();
        debug!(stage = %description, pid, "child spawned");

        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward_lines(description.clone(), "stdout", out)));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(forward_lines(description.clone(), "stderr", err)));

        let kill = CancellationToken::new();
        let exited = CancellationToken::new();
        let task = tokio::spawn({
            let reaped = reap(
                description.clone(),
                child,
                stdout,
                stderr,
                kill.clone(),
                fail_fast,
            );
            let exited = exited.clone();
            async move {
                let result = reaped.await;
                exited.cancel();
                result
            }
        });

        Ok(Self {
            description,
            pid,
            kind: Kind::Child,
            task: Some(task),
            kill,
            exited,
            outcome: None,
        })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// OS process id, for child processes.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Cancelled once the helper has finished, whatever its outcome.
    /// Aborted tasks never signal.
    pub fn exited(&self) -> CancellationToken {
        self.exited.clone()
    }

    /// Checks liveness without blocking.
    pub fn peek(&self) -> Liveness {
        match &self.task {
            Some(task) if task.is_finished() => Liveness::Finished,
            Some(_) => Liveness::Running,
            None => Liveness::Collected,
        }
    }

    /// Waits for the helper to finish and records its outcome.
    pub async fn join(&mut self) {
        let Some(task) = self.task.as_mut() else {
            return;
        };
        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(TransferError::LocalProcessPrematureExit {
                stage: self.description.clone(),
                detail: if e.is_cancelled() {
                    "terminated".into()
                } else {
                    "panicked".into()
                },
            }),
        };
        self.task = None;
        self.outcome = Some(result);
    }

    /// Outcome recorded by [`join`](Self::join), if not yet taken.
    pub fn outcome(&self) -> Option<&StageResult> {
        self.outcome.as_ref()
    }

    /// Waits for the helper and takes its outcome.
    pub async fn wait(&mut self) -> StageResult {
        self.join().await;
        self.outcome
            .take()
            .unwrap_or_else(|| {
                Err(TransferError::LocalProcessPrematureExit {
                    stage: self.description.clone(),
                    detail: "outcome already collected".into(),
                })
            })
    }

    /// Forcibly stops the helper: children are killed and reaped, tasks
    /// aborted. No-op once finished.
    pub async fn terminate(&mut self) {
        let Some(task) = self.task.as_mut() else {
            return;
        };
        if task.is_finished() {
            self.join().await;
            return;
        }

        debug!(stage = %self.description, pid = self.pid, "terminating");
        match self.kind {
            Kind::Child => {
                self.kill.cancel();
                if tokio::time::timeout(REAP_TIMEOUT, &mut *task).await.is_err() {
                    warn!(stage = %self.description, pid = self.pid, "child not reaped in time");
                    task.abort();
                }
            }
            Kind::Task => {
                task.abort();
                let _ = (&mut *task).await;
            }
        }
        self.task = None;
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            // Aborting the reaper drops the child, which kills it.
            self.kill.cancel();
            task.abort();
        }
    }
}

async fn reap(
    stage: String,
    mut child: tokio::process::Child,
    stdout: Option<JoinHandle<VecDeque<String>>>,
    stderr: Option<JoinHandle<VecDeque<String>>>,
    kill: CancellationToken,
    fail_fast: Option<LocalFailure>,
) -> StageResult {
    let status = tokio::select! {
        biased;
        status = child.wait() => status?,
        _ = kill.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!(%stage, error = %e, "failed to kill child");
            }
            for reader in stdout.iter().chain(stderr.iter()) {
                reader.abort();
            }
            return Err(TransferError::LocalProcessPrematureExit {
                stage,
                detail: "terminated".into(),
            });
        }
    };

    if let Some(reader) = stdout {
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, reader).await;
    }
    let stderr = match stderr {
        Some(reader) => match tokio::time::timeout(DRAIN_TIMEOUT, reader).await {
            Ok(Ok(lines)) => Vec::from(lines).join("\n"),
            _ => String::new(),
        },
        None => String::new(),
    };
    debug!(%stage, %status, "child exited");

    match fail_fast {
        Some(failed) if !status.success() => {
            let detail = if stderr.is_empty() {
                status.to_string()
            } else {
                format!("{status}: {stderr}")
            };
            failed.record(&stage, &detail);
            Err(TransferError::LocalProcessPrematureExit { stage, detail })
        }
        _ => Ok(StageOutput::Exited { status, stderr }),
    }
}

/// Logs each line of `reader` and keeps the last few.
async fn forward_lines<R>(stage: String, stream: &'static str, reader: R) -> VecDeque<String>
where
    R: AsyncRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(STDERR_TAIL);
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(%stage, stream, "{line}");
                if tail.len() == STDERR_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(%stage, stream, error = %e, "output reader stopped");
                break;
            }
        }
    }
    tail
}
