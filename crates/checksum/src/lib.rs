//! Streaming MD5 and Adler32 digests for relay verification.
//!
//! MD5 is computed on both sides of the network hop (source host and broker),
//! Adler32 on the broker and by the archival storage after the upload. Both
//! are rendered in a canonical lowercase hex form so values coming from
//! different tools compare equal.

mod digest;
mod report;

pub use digest::{
    ChecksumAlgorithm, ChecksumPair, StreamingChecksum, canonicalize, checksum_bytes,
    checksum_reader,
};
pub use report::{parse_md5sum_report, parse_trailing_checksum};

/// Errors produced by the checksum crate.
#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid {algorithm} value: {value:?}")]
    InvalidValue {
        algorithm: ChecksumAlgorithm,
        value: String,
    },

    #[error("unknown checksum algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("empty checksum report")]
    EmptyReport,
}
