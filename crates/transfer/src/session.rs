//! Per-attempt resource ownership.
//!
//! A [`TransferSession`] owns everything one attempt acquires: the two
//! ports, the local and remote named pipes, and the process table. The
//! coordinator releases it all with [`TransferSession::teardown`]; dropping
//! a session that was not torn down (panic, dropped future) kills and aborts
//! whatever is left, removes the local pipe and fires a detached removal of
//! the remote pipe.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ltacp_remote::{PreparedCommand, RemoteAgent};

use crate::error::TransferError;
use crate::pipe::LocalPipe;
use crate::process::{Liveness, LocalFailure, ProcessHandle, StageOutput, StageResult};
use crate::types::{TransferRequest, TransferState};

/// Which host a tracked helper works for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Broker stages: listeners, relay, sinks, pipe writer, upload client.
    Local,
    /// Shell sessions running commands on the source host.
    Remote,
}

/// Index into a session's process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleId(usize);

#[derive(Debug)]
struct Entry {
    handle: ProcessHandle,
    side: Side,
}

/// Resources of one transfer attempt.
pub struct TransferSession {
    id: Uuid,
    request: TransferRequest,
    state: TransferState,
    data_port: Option<u16>,
    checksum_port: Option<u16>,
    local_pipe: Option<LocalPipe>,
    remote_pipe: Option<RemoteAgent>,
    processes: Vec<Entry>,
    local_failure: LocalFailure,
    cancel: CancellationToken,
    torn_down: bool,
}

impl TransferSession {
    /// Creates an idle session. `parent` cancels the session's listeners.
    pub fn new(request: TransferRequest, parent: &CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            state: TransferState::Idle,
            data_port: None,
            checksum_port: None,
            local_pipe: None,
            remote_pipe: None,
            processes: Vec::new(),
            local_failure: LocalFailure::new(),
            cancel: parent.child_token(),
            torn_down: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request(&self) -> &TransferRequest {
        &self.request
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Moves to `next`, rejecting steps outside the pipeline order.
    pub fn transition(&mut self, next: TransferState) -> Result<(), TransferError> {
        if !self.state.can_transition_to(next) {
            return Err(TransferError::InvalidState {
                from: self.state,
                to: next,
            });
        }
        info!(session = %self.id, from = %self.state, to = %next, "state transition");
        self.state = next;
        Ok(())
    }

    pub fn set_ports(&mut self, data_port: u16, checksum_port: u16) {
        self.data_port = Some(data_port);
        self.checksum_port = Some(checksum_port);
    }

    pub fn data_port(&self) -> Option<u16> {
        self.data_port
    }

    pub fn checksum_port(&self) -> Option<u16> {
        self.checksum_port
    }

    /// Token cancelled by teardown or by the caller.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Pipe file name shared by the local and remote pipe:
    /// `ltacp-<source host>-<data port>-<session>.fifo`.
    pub fn pipe_name(&self) -> Result<String, TransferError> {
        let port = self.data_port.ok_or(TransferError::InvalidState {
            from: self.state,
            to: TransferState::RemoteAgentLaunched,
        })?;
        let host: String = self
            .request
            .source_host
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let short = self.id.simple().to_string();
        Ok(format!("ltacp-{host}-{port}-{}.fifo", &short[..8]))
    }

    /// Creates the local named pipe.
    pub fn create_local_pipe(&mut self, path: &Path) -> Result<PathBuf, TransferError> {
        let pipe = LocalPipe::create(path)?;
        let path = pipe.path().to_path_buf();
        self.local_pipe = Some(pipe);
        Ok(path)
    }

    pub fn local_pipe(&self) -> Option<&Path> {
        self.local_pipe.as_ref().map(LocalPipe::path)
    }

    /// Creates the remote named pipe; the session removes it on teardown.
    pub async fn create_remote_pipe(&mut self, agent: RemoteAgent) -> Result<(), TransferError> {
        agent.create_pipe().await?;
        debug!(session = %self.id, pipe = agent.fifo_path(), "remote pipe created");
        self.remote_pipe = Some(agent);
        Ok(())
    }

    /// Runs a broker stage as a tracked task.
    ///
    /// A failing stage is recorded as the session's local failure before its
    /// task finishes.
    pub fn spawn_stage<F, E>(&mut self, description: &str, fut: F) -> HandleId
    where
        F: Future<Output = Result<StageOutput, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let failure = self.local_failure.clone();
        let stage = description.to_string();
        let handle = ProcessHandle::spawn_task(description, async move {
            fut.await.map_err(|e| {
                let detail = e.to_string();
                failure.record(&stage, &detail);
                TransferError::LocalProcessPrematureExit { stage, detail }
            })
        });
        self.register(handle, Side::Local)
    }

    /// Spawns a child process. Local children fail fast on non-zero exit;
    /// remote ones report their status to the waiter.
    pub fn spawn_process(
        &mut self,
        description: &str,
        command: std::process::Command,
        side: Side,
    ) -> Result<HandleId, TransferError> {
        let fail_fast = match side {
            Side::Local => Some(self.local_failure.clone()),
            Side::Remote => None,
        };
        let handle = ProcessHandle::spawn_child(description, command, fail_fast)?;
        Ok(self.register(handle, side))
    }

    fn register(&mut self, handle: ProcessHandle, side: Side) -> HandleId {
        debug!(
            session = %self.id,
            stage = handle.description(),
            pid = handle.pid(),
            ?side,
            "registered helper"
        );
        self.processes.push(Entry { handle, side });
        HandleId(self.processes.len() - 1)
    }

    pub fn handle(&self, id: HandleId) -> Option<&ProcessHandle> {
        self.processes.get(id.0).map(|e| &e.handle)
    }

    /// Non-blocking liveness of one helper.
    pub fn peek(&self, id: HandleId) -> Option<Liveness> {
        self.handle(id).map(ProcessHandle::peek)
    }

    /// Helpers still running.
    pub fn live_processes(&self) -> usize {
        self.processes
            .iter()
            .filter(|e| e.handle.peek() == Liveness::Running)
            .count()
    }

    fn live_on(&self, side: Side) -> usize {
        self.processes
            .iter()
            .filter(|e| e.side == side && e.handle.peek() == Liveness::Running)
            .count()
    }

    /// Waits for one helper.
    ///
    /// Returns early with the cause if any broker stage fails first.
    pub async fn wait(&mut self, id: HandleId) -> StageResult {
        let failure = self.local_failure.clone();
        let entry = self
            .processes
            .get_mut(id.0)
            .ok_or_else(|| TransferError::InvalidRequest(format!("unknown process handle {}", id.0)))?;
        tokio::select! {
            biased;
            result = entry.handle.wait() => result,
            cause = failure.failed() => Err(cause),
        }
    }

    /// The first broker stage failure, if one happened.
    pub fn local_failure_cause(&self) -> Option<TransferError> {
        self.local_failure.cause()
    }

    /// Releases every resource. Safe to call more than once.
    pub async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.cancel.cancel();

        if let Some(pipe) = &self.local_pipe {
            pipe.unblock_writer();
        }
        debug!(
            session = %self.id,
            local = self.live_on(Side::Local),
            remote = self.live_on(Side::Remote),
            "terminating helpers"
        );
        // Remote commands were registered last and stop first.
        for entry in self.processes.iter_mut().rev() {
            entry.handle.terminate().await;
        }

        // An aborted writer task may leave its blocking open behind.
        if let Some(pipe) = &self.local_pipe {
            pipe.unblock_writer();
        }
        if let Some(mut pipe) = self.local_pipe.take()
            && let Err(e) = pipe.remove()
        {
            warn!(session = %self.id, error = %e, "failed to remove local pipe");
        }
        if let Some(agent) = &self.remote_pipe {
            match agent.remove_pipe().await {
                Ok(()) => debug!(session = %self.id, pipe = agent.fifo_path(), "remote pipe removed"),
                Err(e) => warn!(session = %self.id, error = %e, "failed to remove remote pipe"),
            }
        }
        self.remote_pipe = None;
        self.torn_down = true;
        info!(session = %self.id, state = %self.state, "session torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        warn!(session = %self.id, state = %self.state, "session dropped without teardown");
        self.cancel.cancel();
        if let Some(pipe) = &self.local_pipe {
            pipe.unblock_writer();
        }
        // Handles kill and abort their helpers on drop.
        self.processes.clear();
        self.local_pipe = None;
        if let Some(agent) = self.remote_pipe.take() {
            remove_remote_pipe_detached(agent.cleanup_command());
        }
    }
}

fn remove_remote_pipe_detached(prepared: PreparedCommand) {
    let PreparedCommand {
        command,
        description,
    } = prepared;
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                let mut command = tokio::process::Command::from(command);
                match command.output().await {
                    Ok(out) if out.status.success() => debug!(%description, "remote pipe removed"),
                    Ok(out) => warn!(%description, status = %out.status, "remote pipe removal failed"),
                    Err(e) => warn!(%description, error = %e, "remote pipe removal failed"),
                }
            });
        }
        Err(_) => {
            let mut command = command;
            if let Err(e) = command.spawn() {
                warn!(%description, error = %e, "remote pipe removal failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ltacp_remote::{NetworkSend, RemoteConfig, RemoteShell, Transport};

    use super::*;

    fn request() -> TransferRequest {
        TransferRequest::new("node 7", "obs", "/data/x", "srm://h/x")
    }

    fn have(tool: &str) -> bool {
        std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(tool).is_file()))
            .unwrap_or(false)
    }

    fn local_agent(fifo: &Path) -> RemoteAgent {
        let config = RemoteConfig {
            transport: Transport::Local,
            ..RemoteConfig::default()
        };
        let shell = RemoteShell::new(&config, "", "localhost");
        RemoteAgent::new(
            shell,
            "/data/x",
            fifo.to_str().unwrap(),
            "127.0.0.1",
            NetworkSend::DevTcp,
        )
    }

    #[test]
    fn pipe_name_uses_host_and_port() {
        let mut session = TransferSession::new(request(), &CancellationToken::new());
        assert!(session.pipe_name().is_err());

        session.set_ports(50123, 50124);
        let name = session.pipe_name().unwrap();
        assert!(name.starts_with("ltacp-node_7-50123-"), "{name}");
        assert!(name.ends_with(".fifo"));
    }

    #[test]
    fn illegal_transition_rejected() {
        let mut session = TransferSession::new(request(), &CancellationToken::new());
        let err = session.transition(TransferState::Verifying).unwrap_err();
        assert!(matches!(
            err,
            TransferError::InvalidState {
                from: TransferState::Idle,
                to: TransferState::Verifying
            }
        ));
        assert_eq!(session.state(), TransferState::Idle);
        session.transition(TransferState::PortsAllocated).unwrap();
        session.transition(TransferState::Failed).unwrap();
        assert!(session.transition(TransferState::Succeeded).is_err());
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        if !have("bash") || !have("mkfifo") {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let mut session = TransferSession::new(request(), &CancellationToken::new());
        session.set_ports(50123, 50124);
        let name = session.pipe_name().unwrap();

        let local = session.create_local_pipe(&dir.path().join(format!("local-{name}"))).unwrap();
        let remote = dir.path().join(format!("remote-{name}"));
        session.create_remote_pipe(local_agent(&remote)).await.unwrap();
        assert!(local.exists());
        assert!(remote.exists());

        let stuck = session.spawn_stage("stuck", async {
            std::future::pending::<()>().await;
            Ok::<_, std::io::Error>(StageOutput::Bytes(0))
        });
        assert_eq!(session.peek(stuck), Some(Liveness::Running));

        session.teardown().await;
        assert!(session.is_torn_down());
        assert!(!local.exists());
        assert!(!remote.exists());
        assert_eq!(session.live_processes(), 0);
        assert!(session.cancel_token().is_cancelled());

        // Nothing left to release the second time.
        session.teardown().await;
        assert!(session.local_pipe().is_none());
    }

    #[tokio::test]
    async fn teardown_releases_blocked_pipe_writer() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = TransferSession::new(request(), &CancellationToken::new());
        let path = session.create_local_pipe(&dir.path().join("w.fifo")).unwrap();

        let mut splitter = ltacp_data_channel::RelaySplitter::new(16, 1);
        let tap = splitter.tap();
        session.spawn_stage(
            "pipe writer",
            crate::stages::pipe_writer(path.clone(), tap, CancellationToken::new()),
        );
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        tokio::time::timeout(std::time::Duration::from_secs(10), session.teardown())
            .await
            .expect("teardown must not hang on the pipe writer");
        assert!(!path.exists());
        drop(splitter);
    }

    #[tokio::test]
    async fn local_failure_interrupts_wait() {
        let mut session = TransferSession::new(request(), &CancellationToken::new());
        let slow = session.spawn_stage("slow", async {
            std::future::pending::<()>().await;
            Ok::<_, std::io::Error>(StageOutput::Bytes(0))
        });
        session.spawn_stage("pipe writer", async {
            Err::<StageOutput, _>(std::io::Error::other("broken pipe"))
        });

        let err = session.wait(slow).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::LocalProcessPrematureExit { ref stage, .. } if stage == "pipe writer"
        ));
        session.teardown().await;
    }

    #[tokio::test]
    async fn dropped_session_removes_local_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.fifo");
        {
            let mut session = TransferSession::new(request(), &CancellationToken::new());
            session.create_local_pipe(&path).unwrap();
            session.spawn_stage("stuck", async {
                std::future::pending::<()>().await;
                Ok::<_, std::io::Error>(StageOutput::Bytes(0))
            });
        }
        assert!(!path.exists());
    }
}
