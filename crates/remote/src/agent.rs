//! Remote agent: the commands run on the source host for one session.
//!
//! The data command streams the source (a tar archive for directories, raw
//! bytes for files) through `tee` into a session pipe and over the network
//! to the broker's data port. The checksum command reads the same pipe,
//! computes MD5, and sends the digest to the broker's checksum port.

use std::path::Path;
use std::process::ExitStatus;

use tracing::{debug, warn};

use crate::command::{Script, ShellCommand, operand};
use crate::shell::{NetworkSend, RemoteShell};
use crate::{RemoteError, RemoteStep};

/// What the source path points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    File,
    Directory,
}

/// A process ready to spawn, with a description for the process table.
#[derive(Debug)]
pub struct PreparedCommand {
    pub command: std::process::Command,
    pub description: String,
}

/// Commands for one source path on one host.
#[derive(Debug, Clone)]
pub struct RemoteAgent {
    shell: RemoteShell,
    source_path: String,
    fifo_path: String,
    broker_host: String,
    send: NetworkSend,
}

impl RemoteAgent {
    pub fn new(
        shell: RemoteShell,
        source_path: impl Into<String>,
        fifo_path: impl Into<String>,
        broker_host: impl Into<String>,
        send: NetworkSend,
    ) -> Self {
        Self {
            shell,
            source_path: source_path.into(),
            fifo_path: fifo_path.into(),
            broker_host: broker_host.into(),
            send,
        }
    }

    pub fn shell(&self) -> &RemoteShell {
        &self.shell
    }

    /// Session pipe path on the source host.
    pub fn fifo_path(&self) -> &str {
        &self.fifo_path
    }

    pub fn probe_script(&self) -> Script {
        ShellCommand::new("test")
            .args(["-d".to_string(), operand(&self.source_path)])
            .into()
    }

    pub fn mkfifo_script(&self) -> Script {
        ShellCommand::new("mkfifo")
            .arg(operand(&self.fifo_path))
            .into()
    }

    /// `<source> | tee <fifo> | <send> <broker> <port>`
    pub fn data_script(&self, kind: SourceKind, data_port: u16) -> Result<Script, RemoteError> {
        let source = match kind {
            SourceKind::File => ShellCommand::new("cat")
                .arg(operand(&self.source_path))
                .into(),
            SourceKind::Directory => {
                let (parent, child) = split_source(&self.source_path)?;
                Script::subshell(Script::and_then([
                    ShellCommand::new("cd").arg(operand(&parent)).into(),
                    ShellCommand::new("tar")
                        .args(["-c", "-f", "-"])
                        .arg(operand(&child))
                        .into(),
                ]))
            }
        };

        Ok(Script::pipeline([
            source,
            ShellCommand::new("tee").arg(operand(&self.fifo_path)).into(),
            self.send.to_command(&self.broker_host, data_port).into(),
        ]))
    }

    /// `cat <fifo> | md5sum | <send> <broker> <port>`
    pub fn checksum_script(&self, checksum_port: u16) -> Script {
        Script::pipeline([
            ShellCommand::new("cat").arg(operand(&self.fifo_path)).into(),
            ShellCommand::new("md5sum").into(),
            self.send.to_command(&self.broker_host, checksum_port).into(),
        ])
    }

    /// `if test -e <fifo> ; then rm -f <fifo> ; fi`
    pub fn cleanup_script(&self) -> Script {
        let fifo = operand(&self.fifo_path);
        Script::if_then(
            ShellCommand::new("test").args(["-e".to_string(), fifo.clone()]).into(),
            ShellCommand::new("rm").args(["-f".to_string(), fifo]).into(),
        )
    }

    /// Determines whether the source is a directory.
    ///
    /// Anything that is not a directory is streamed as a file; a missing
    /// path surfaces later as a data stream failure.
    pub async fn probe(&self) -> Result<SourceKind, RemoteError> {
        let output = self.run(RemoteStep::Probe, &self.probe_script()).await?;
        match output.status.code() {
            Some(0) => Ok(SourceKind::Directory),
            Some(1) => Ok(SourceKind::File),
            _ => Err(failure(RemoteStep::Probe, output.status, &output.stderr)),
        }
    }

    /// Creates the session pipe on the source host.
    pub async fn create_pipe(&self) -> Result<(), RemoteError> {
        let output = self.run(RemoteStep::CreatePipe, &self.mkfifo_script()).await?;
        check(RemoteStep::CreatePipe, output)
    }

    /// Removes the session pipe if it still exists.
    pub async fn remove_pipe(&self) -> Result<(), RemoteError> {
        let output = self.run(RemoteStep::Cleanup, &self.cleanup_script()).await?;
        check(RemoteStep::Cleanup, output)
    }

    pub fn data_command(
        &self,
        kind: SourceKind,
        data_port: u16,
    ) -> Result<PreparedCommand, RemoteError> {
        let script = self.data_script(kind, data_port)?;
        Ok(self.prepare(&script))
    }

    pub fn checksum_command(&self, checksum_port: u16) -> PreparedCommand {
        self.prepare(&self.checksum_script(checksum_port))
    }

    /// Pipe removal as a plain process, for contexts that cannot await.
    pub fn cleanup_command(&self) -> PreparedCommand {
        self.prepare(&self.cleanup_script())
    }

    fn prepare(&self, script: &Script) -> PreparedCommand {
        PreparedCommand {
            command: self.shell.command(script),
            description: self.shell.describe(script),
        }
    }

    async fn run(
        &self,
        step: RemoteStep,
        script: &Script,
    ) -> Result<std::process::Output, RemoteError> {
        debug!(%step, command = %self.shell.describe(script), "running remote command");
        let mut cmd = tokio::process::Command::from(self.shell.command(script));
        cmd.kill_on_drop(true);
        cmd.output().await.map_err(|source| RemoteError::Spawn {
            program: self.shell.program().to_string(),
            source,
        })
    }
}

/// Splits a directory path into the directory to `cd` into and the entry
/// to archive, so archive members are relative.
fn split_source(path: &str) -> Result<(String, String), RemoteError> {
    let trimmed = path.trim_end_matches('/');
    let p = Path::new(trimmed);
    let child = p
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| RemoteError::InvalidSource(path.to_string()))?;
    let parent = match p.parent().and_then(|p| p.to_str()) {
        Some("") | None => ".".to_string(),
        Some(parent) => parent.to_string(),
    };
    Ok((parent, child.to_string()))
}

fn check(step: RemoteStep, output: std::process::Output) -> Result<(), RemoteError> {
    if output.status.success() {
        Ok(())
    } else {
        Err(failure(step, output.status, &output.stderr))
    }
}

fn failure(step: RemoteStep, status: ExitStatus, stderr: &[u8]) -> RemoteError {
    let stderr = String::from_utf8_lossy(stderr).trim().to_string();
    warn!(%step, %status, %stderr, "remote command failed");
    RemoteError::CommandFailed {
        step,
        status,
        stderr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::{RemoteConfig, Transport};

    fn agent(source: &str, fifo: &str) -> RemoteAgent {
        let shell = RemoteShell::new(&RemoteConfig::default(), "obs", "h1");
        RemoteAgent::new(shell, source, fifo, "broker", NetworkSend::default())
    }

    fn local_agent(source: &str, fifo: &str) -> RemoteAgent {
        let config = RemoteConfig {
            transport: Transport::Local,
            ..RemoteConfig::default()
        };
        let shell = RemoteShell::new(&config, "", "localhost");
        RemoteAgent::new(shell, source, fifo, "127.0.0.1", NetworkSend::DevTcp)
    }

    fn have(tool: &str) -> bool {
        std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(tool).is_file()))
            .unwrap_or(false)
    }

    #[test]
    fn split_absolute_directory() {
        assert_eq!(
            split_source("/data/obs1").unwrap(),
            ("/data".to_string(), "obs1".to_string())
        );
        assert_eq!(
            split_source("/data/obs1/").unwrap(),
            ("/data".to_string(), "obs1".to_string())
        );
    }

    #[test]
    fn split_relative_directory() {
        assert_eq!(
            split_source("obs1").unwrap(),
            (".".to_string(), "obs1".to_string())
        );
    }

    #[test]
    fn split_root_rejected() {
        assert!(matches!(
            split_source("/"),
            Err(RemoteError::InvalidSource(_))
        ));
    }

    #[test]
    fn file_data_script() {
        let a = agent("/data/obs1.tar", "/tmp/ltacp-h1-50000.fifo");
        let script = a.data_script(SourceKind::File, 50000).unwrap();
        assert_eq!(
            script.render(),
            "cat /data/obs1.tar | tee /tmp/ltacp-h1-50000.fifo | nc -q 0 broker 50000"
        );
    }

    #[test]
    fn directory_data_script() {
        let a = agent("/data/run 7", "/tmp/f");
        let script = a.data_script(SourceKind::Directory, 50000).unwrap();
        assert_eq!(
            script.render(),
            "( cd /data && tar -c -f - 'run 7' ) | tee /tmp/f | nc -q 0 broker 50000"
        );
    }

    #[test]
    fn checksum_and_cleanup_scripts() {
        let a = agent("/data/x", "/tmp/f");
        assert_eq!(
            a.checksum_script(50001).render(),
            "cat /tmp/f | md5sum | nc -q 0 broker 50001"
        );
        assert_eq!(
            a.cleanup_script().render(),
            "if test -e /tmp/f ; then rm -f /tmp/f ; fi"
        );
        assert_eq!(a.mkfifo_script().render(), "mkfifo /tmp/f");
        assert_eq!(a.probe_script().render(), "test -d /data/x");
    }

    #[test]
    fn hostile_path_is_inert() {
        let a = agent("/data/x; rm -rf ~", "/tmp/f");
        let script = a.data_script(SourceKind::File, 1).unwrap();
        assert!(script.render().starts_with("cat '/data/x; rm -rf ~' | "));
    }

    #[test]
    fn prepared_command_describes_destination() {
        let a = agent("/data/x", "/tmp/f");
        let prepared = a.checksum_command(50001);
        assert!(prepared.description.starts_with("obs@h1: cat /tmp/f"));
    }

    #[tokio::test]
    async fn local_probe_distinguishes_kinds() {
        if !have("bash") {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("payload.bin");
        std::fs::write(&file, b"x").unwrap();

        let fifo = dir.path().join("unused.fifo");
        let fifo = fifo.to_str().unwrap();

        let dir_agent = local_agent(dir.path().to_str().unwrap(), fifo);
        assert_eq!(dir_agent.probe().await.unwrap(), SourceKind::Directory);

        let file_agent = local_agent(file.to_str().unwrap(), fifo);
        assert_eq!(file_agent.probe().await.unwrap(), SourceKind::File);
    }

    #[tokio::test]
    async fn local_pipe_lifecycle() {
        if !have("bash") || !have("mkfifo") {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("session.fifo");
        let a = local_agent("/unused", fifo.to_str().unwrap());

        a.create_pipe().await.unwrap();
        assert!(fifo.exists());

        // A second mkfifo on the same path fails.
        let err = a.create_pipe().await.unwrap_err();
        assert!(matches!(
            err,
            RemoteError::CommandFailed {
                step: RemoteStep::CreatePipe,
                ..
            }
        ));

        a.remove_pipe().await.unwrap();
        assert!(!fifo.exists());

        // Removal is a no-op once the pipe is gone.
        a.remove_pipe().await.unwrap();
    }
}
