//! Transfer error types.

use std::fmt;
use std::process::ExitStatus;

use serde::Serialize;

use ltacp_checksum::ChecksumPair;
use ltacp_data_channel::DataChannelError;
use ltacp_remote::{RemoteError, RemoteStep};
use ltacp_storage::StorageError;

use crate::types::TransferState;

/// Which comparison failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    /// Source host MD5 against broker MD5.
    Transit,
    /// Broker Adler32 against the value recorded by storage.
    Storage,
}

impl fmt::Display for MismatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transit => "transit",
            Self::Storage => "storage",
        })
    }
}

/// Errors produced by a transfer attempt.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("no free port after {attempts} bind attempts")]
    PortBindFailure { attempts: u32 },

    #[error("remote {step} failed ({status}){}", stderr_suffix(.stderr))]
    RemoteCommandFailure {
        step: RemoteStep,
        status: ExitStatus,
        stderr: String,
    },

    #[error("{kind} checksum mismatch: expected {expected}, got {}", or_absent(.actual))]
    ChecksumMismatch {
        kind: MismatchKind,
        expected: ChecksumPair,
        actual: Option<ChecksumPair>,
    },

    #[error("{stage} ended prematurely: {detail}")]
    LocalProcessPrematureExit { stage: String, detail: String },

    #[error("URL translation failed: {0}")]
    UrlTranslation(#[source] StorageError),

    #[error("storage error: {0}")]
    Storage(#[source] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,

    #[error("invalid state transition {from} -> {to}")]
    InvalidState {
        from: TransferState,
        to: TransferState,
    },

    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

fn or_absent(actual: &Option<ChecksumPair>) -> String {
    actual
        .as_ref()
        .map_or_else(|| "nothing".to_string(), ToString::to_string)
}

impl From<RemoteError> for TransferError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::CommandFailed {
                step,
                status,
                stderr,
            } => Self::RemoteCommandFailure {
                step,
                status,
                stderr,
            },
            RemoteError::Spawn { program, source } => Self::Spawn { program, source },
            RemoteError::InvalidSource(path) => {
                Self::InvalidRequest(format!("invalid source path {path:?}"))
            }
            RemoteError::Io(e) => Self::Io(e),
        }
    }
}

impl TransferError {
    /// Maps a bind error from the port allocator.
    pub(crate) fn from_bind(e: DataChannelError) -> Self {
        match e {
            DataChannelError::PortExhausted { attempts, .. } => Self::PortBindFailure { attempts },
            DataChannelError::Io(e) => Self::Io(e),
            other => Self::InvalidRequest(other.to_string()),
        }
    }

    /// Whether the error names a stage on the broker.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::LocalProcessPrematureExit { .. })
    }
}
