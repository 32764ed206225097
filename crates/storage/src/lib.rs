//! Archival storage collaborators.
//!
//! The relay never talks to archival storage directly. Storage URLs (SURLs)
//! are mapped to transfer URLs (TURLs) by a [`UrlTranslator`], bytes are
//! pushed by an external upload client driven through [`UploadSink`], and
//! directory creation, checksum listing and removal go through a
//! [`StorageClient`].

mod command;
mod template;
mod translate;
mod upload;

pub use command::{CommandStorageClient, StorageCommands};
pub use template::expand;
pub use translate::{StaticUrlTable, UrlMapping, parent_url};
pub use upload::{UploadClientConfig, UploadSink, write_pipe};

use std::future::Future;
use std::pin::Pin;
use std::process::ExitStatus;

use ltacp_checksum::{ChecksumAlgorithm, ChecksumError, ChecksumPair};

/// Boxed future returned by [`StorageClient`] methods.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// Errors produced by storage collaborators.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("storage {operation} failed ({status}): {stderr}")]
    CommandFailed {
        operation: &'static str,
        status: ExitStatus,
        stderr: String,
    },

    #[error("storage {0} is not configured")]
    NotConfigured(&'static str),

    #[error("invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("no translation for {0}")]
    Untranslatable(String),

    #[error("invalid command template: {0}")]
    Template(String),

    #[error("relay error: {0}")]
    Relay(#[from] ltacp_data_channel::DataChannelError),

    #[error(transparent)]
    Checksum(#[from] ChecksumError),
}

/// Maps storage URLs to the URLs the upload client writes to.
pub trait UrlTranslator: Send + Sync {
    fn translate(&self, surl: &str) -> Result<String, StorageError>;
}

/// Operations on archival storage other than the upload itself.
///
/// Implemented on top of whatever tooling the storage system offers;
/// tests use in-memory mocks.
pub trait StorageClient: Send + Sync {
    /// Returns the checksum storage recorded for `surl`, or `None` if the
    /// object or its checksum is absent.
    fn query_checksum<'a>(
        &'a self,
        surl: &'a str,
        algorithm: ChecksumAlgorithm,
    ) -> StorageFuture<'a, Option<ChecksumPair>>;

    /// Creates every missing directory above `surl`.
    fn create_missing_parent_directories<'a>(&'a self, surl: &'a str) -> StorageFuture<'a, ()>;

    /// Removes the object at `surl`.
    fn remove_object<'a>(&'a self, surl: &'a str) -> StorageFuture<'a, ()>;
}
