//! Stream fan-out.
//!
//! A [`RelaySplitter`] reads its input once and hands every chunk to each
//! consumer through a bounded queue. A fast consumer runs ahead of a slow one
//! by at most `queue_depth` chunks; the payload is never buffered whole.
//!
//! Consumers tell a clean end of stream from an aborted relay: when the input
//! fails or any consumer goes away, the relay is marked aborted before the
//! queues close, and every remaining [`ChunkStream`] yields
//! [`DataChannelError::RelayAborted`] instead of `None`.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::DataChannelError;

/// Fans one byte stream out to several consumers.
pub struct RelaySplitter {
    outputs: Vec<mpsc::Sender<Bytes>>,
    chunk_size: usize,
    queue_depth: usize,
    aborted: CancellationToken,
    completed: bool,
}

/// Receiving end of one relay consumer.
pub struct ChunkStream {
    index: usize,
    rx: mpsc::Receiver<Bytes>,
    aborted: CancellationToken,
}

impl RelaySplitter {
    pub fn new(chunk_size: usize, queue_depth: usize) -> Self {
        Self {
            outputs: Vec::new(),
            chunk_size: chunk_size.max(1),
            queue_depth: queue_depth.max(1),
            aborted: CancellationToken::new(),
            completed: false,
        }
    }

    /// Adds a consumer. All taps must be taken before [`run`](Self::run).
    pub fn tap(&mut self) -> ChunkStream {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let index = self.outputs.len();
        self.outputs.push(tx);
        ChunkStream {
            index,
            rx,
            aborted: self.aborted.clone(),
        }
    }

    /// Number of consumers.
    pub fn consumers(&self) -> usize {
        self.outputs.len()
    }

    /// Relays `input` to every consumer until end of stream.
    ///
    /// Returns the number of bytes relayed.
    pub async fn run<R: AsyncRead + Unpin>(mut self, input: R) -> Result<u64, DataChannelError> {
        let result = self.pump(input).await;
        match &result {
            Ok(total) => {
                self.completed = true;
                debug!(total, consumers = self.outputs.len(), "relay complete");
            }
            Err(e) => warn!(error = %e, "relay aborted"),
        }
        result
    }

    async fn pump<R: AsyncRead + Unpin>(&mut self, mut input: R) -> Result<u64, DataChannelError> {
        let mut total: u64 = 0;
        loop {
            let mut buf = BytesMut::with_capacity(self.chunk_size);
            let n = input.read_buf(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }

            let chunk = buf.freeze();
            for (index, tx) in self.outputs.iter().enumerate() {
                if tx.send(chunk.clone()).await.is_err() {
                    return Err(DataChannelError::ConsumerClosed(index));
                }
            }
            total += n as u64;
        }
    }
}

impl Drop for RelaySplitter {
    fn drop(&mut self) {
        // Mark before the senders close so consumers never mistake a failed
        // or interrupted relay for end of stream.
        if !self.completed {
            self.aborted.cancel();
        }
    }
}

impl ChunkStream {
    /// Position of this consumer in the splitter.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Receives the next chunk; `None` marks a clean end of stream.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, DataChannelError> {
        match self.rx.recv().await {
            Some(chunk) => Ok(Some(chunk)),
            None if self.aborted.is_cancelled() => Err(DataChannelError::RelayAborted),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn drain(mut stream: ChunkStream) -> Result<Vec<u8>, DataChannelError> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn every_consumer_sees_identical_bytes() {
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 253) as u8).collect();
        let mut splitter = RelaySplitter::new(1024, 4);
        let taps: Vec<_> = (0..3).map(|_| splitter.tap()).collect();
        assert_eq!(splitter.consumers(), 3);

        let consumers: Vec<_> = taps.into_iter().map(|t| tokio::spawn(drain(t))).collect();
        let total = splitter.run(&data[..]).await.unwrap();
        assert_eq!(total, data.len() as u64);

        for handle in consumers {
            assert_eq!(handle.await.unwrap().unwrap(), data);
        }
    }

    #[tokio::test]
    async fn empty_input_ends_cleanly() {
        let mut splitter = RelaySplitter::new(1024, 4);
        let tap = splitter.tap();
        let consumer = tokio::spawn(drain(tap));

        assert_eq!(splitter.run(&b""[..]).await.unwrap(), 0);
        assert!(consumer.await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn closed_consumer_aborts_the_rest() {
        let data = vec![7u8; 64 * 1024];
        let mut splitter = RelaySplitter::new(1024, 2);
        let healthy = splitter.tap();
        let failing = splitter.tap();
        drop(failing);

        let consumer = tokio::spawn(drain(healthy));
        let result = splitter.run(&data[..]).await;
        assert!(matches!(result, Err(DataChannelError::ConsumerClosed(1))));

        let drained = tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .expect("remaining consumer must not block")
            .unwrap();
        assert!(matches!(drained, Err(DataChannelError::RelayAborted)));
    }

    #[tokio::test]
    async fn dropped_splitter_aborts_consumers() {
        let mut splitter = RelaySplitter::new(1024, 2);
        let tap = splitter.tap();
        drop(splitter);

        assert!(matches!(drain(tap).await, Err(DataChannelError::RelayAborted)));
    }

    #[tokio::test]
    async fn slow_consumer_bounds_fast_one() {
        let data = vec![1u8; 32 * 1024];
        let mut splitter = RelaySplitter::new(1024, 2);
        let mut slow = splitter.tap();
        let fast = splitter.tap();

        let fast_task = tokio::spawn(drain(fast));
        let relay = tokio::spawn(splitter.run(std::io::Cursor::new(data.clone())));

        // While the slow consumer reads nothing the relay cannot finish.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!relay.is_finished());

        let mut received = 0;
        while let Some(chunk) = slow.next_chunk().await.unwrap() {
            received += chunk.len();
        }
        assert_eq!(received, data.len());
        assert_eq!(relay.await.unwrap().unwrap(), data.len() as u64);
        assert_eq!(fast_task.await.unwrap().unwrap().len(), data.len());
    }
}
