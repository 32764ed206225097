//! Broker-side stages of a transfer, each run as a tracked task.

use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use ltacp_checksum::{ChecksumAlgorithm, ChecksumPair, StreamingChecksum, parse_md5sum_report};
use ltacp_data_channel::{
    ChunkStream, DataChannelError, Listener, REPORT_LIMIT, RelaySplitter, read_report,
};
use ltacp_storage::write_pipe;

use crate::pipe::unblock_writer_at;
use crate::process::StageOutput;

pub(crate) type StageError = Box<dyn std::error::Error + Send + Sync>;

/// Accepts the payload connection and fans it out to every consumer.
pub(crate) async fn relay(
    listener: Listener,
    splitter: RelaySplitter,
    timeout: Duration,
    cancel: CancellationToken,
) -> Result<StageOutput, StageError> {
    let stream = listener.accept_one(timeout, &cancel).await?;
    let total = splitter.run(stream).await?;
    Ok(StageOutput::Bytes(total))
}

/// Accepts the checksum connection and parses the `md5sum` report.
pub(crate) async fn checksum_report(
    listener: Listener,
    timeout: Duration,
    cancel: CancellationToken,
) -> Result<StageOutput, StageError> {
    let stream = listener.accept_one(timeout, &cancel).await?;
    let report = read_report(stream, REPORT_LIMIT).await?;
    debug!(report = %report.trim(), "checksum report received");
    Ok(StageOutput::Checksum(parse_md5sum_report(&report)?))
}

/// Digests a relay consumer to its end.
///
/// A relay that stops before end of stream is an error, never a digest of
/// the bytes seen so far.
pub async fn checksum_sink(
    algorithm: ChecksumAlgorithm,
    mut stream: ChunkStream,
) -> Result<ChecksumPair, DataChannelError> {
    let mut digest = StreamingChecksum::new(algorithm);
    while let Some(chunk) = stream.next_chunk().await? {
        digest.update(&chunk);
    }
    debug!(%algorithm, bytes = digest.bytes(), "checksum sink finished");
    Ok(digest.finalize())
}

pub(crate) async fn checksum(
    algorithm: ChecksumAlgorithm,
    stream: ChunkStream,
) -> Result<StageOutput, StageError> {
    Ok(StageOutput::Checksum(checksum_sink(algorithm, stream).await?))
}

/// Feeds the local pipe until end of stream.
///
/// The reader must outlive the writer: once `reader_exited` fires while
/// bytes are still owed, the stage fails and releases its own pending open.
pub(crate) async fn pipe_writer(
    path: PathBuf,
    stream: ChunkStream,
    reader_exited: CancellationToken,
) -> Result<StageOutput, StageError> {
    tokio::select! {
        biased;
        written = write_pipe(&path, stream) => Ok(StageOutput::Bytes(written?)),
        _ = reader_exited.cancelled() => {
            unblock_writer_at(&path);
            Err("upload client exited before consuming the stream".into())
        }
    }
}
