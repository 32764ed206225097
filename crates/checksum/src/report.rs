//! Parsers for checksum values printed by external tools.

use crate::{ChecksumAlgorithm, ChecksumError, ChecksumPair};

/// Parses `md5sum` output for standard input: `<32 hex digits>  -`.
pub fn parse_md5sum_report(report: &str) -> Result<ChecksumPair, ChecksumError> {
    let digest = report
        .split_whitespace()
        .next()
        .ok_or(ChecksumError::EmptyReport)?;
    ChecksumPair::parse(ChecksumAlgorithm::Md5, digest)
}

/// Parses the last whitespace-separated token of a tool's output.
///
/// Storage listing tools print `<url> <checksum>`; only the final token is
/// the value.
pub fn parse_trailing_checksum(
    algorithm: ChecksumAlgorithm,
    output: &str,
) -> Result<ChecksumPair, ChecksumError> {
    let value = output
        .split_whitespace()
        .last()
        .ok_or(ChecksumError::EmptyReport)?;
    ChecksumPair::parse(algorithm, value)
}
