//! Remote side of the relay.
//!
//! Builds the shell scripts that run on the source host (named pipe setup,
//! payload streaming, checksum reporting, cleanup) from typed parts with
//! every argument escaped, and executes them over ssh or, for loopback
//! operation, a local shell.

pub mod agent;
pub mod command;
pub mod shell;

pub use agent::{PreparedCommand, RemoteAgent, SourceKind};
pub use command::{Script, ShellCommand, quote};
pub use shell::{NetworkSend, RemoteConfig, RemoteShell, Transport};

use std::fmt;
use std::process::ExitStatus;

/// Remote steps, used to name failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStep {
    Probe,
    CreatePipe,
    DataStream,
    Checksum,
    Cleanup,
}

impl fmt::Display for RemoteStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Probe => "source probe",
            Self::CreatePipe => "pipe creation",
            Self::DataStream => "data stream",
            Self::Checksum => "checksum",
            Self::Cleanup => "pipe cleanup",
        })
    }
}

/// Errors produced by remote command execution.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("remote {step} failed ({status}): {stderr}")]
    CommandFailed {
        step: RemoteStep,
        status: ExitStatus,
        stderr: String,
    },

    #[error("invalid source path: {0}")]
    InvalidSource(String),
}
