//! Verified transfer of a remote file or directory into archive storage.
//!
//! A [`TransferCoordinator`] opens two listeners, has the source host push
//! the payload and its MD5 over them, fans the payload out to local
//! checksums and the upload client, then compares both digests before
//! reporting success.

mod config;
mod coordinator;
mod error;
mod pipe;
mod process;
mod session;
mod stages;
mod types;

pub use config::TransferConfig;
pub use coordinator::TransferCoordinator;
pub use error::{MismatchKind, TransferError};
pub use pipe::LocalPipe;
pub use process::{Liveness, LocalFailure, ProcessHandle, StageOutput, StageResult};
pub use session::{HandleId, Side, TransferSession};
pub use stages::checksum_sink;
pub use types::{TransferRequest, TransferState, VerifiedChecksums};
