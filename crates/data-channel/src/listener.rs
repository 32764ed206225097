//! Single-connection TCP listener (broker side).
//!
//! Each listener is bound by the [`PortAllocator`](crate::PortAllocator),
//! accepts exactly one connection and is closed right after.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::DataChannelError;

/// A bound listener waiting for its one inbound connection.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    pub(crate) fn new(inner: TcpListener) -> Result<Self, DataChannelError> {
        let local_addr = inner.local_addr()?;
        Ok(Self { inner, local_addr })
    }

    /// Port the listener is bound to.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts a single connection, then drops the listening socket.
    pub async fn accept_one(
        self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<TcpStream, DataChannelError> {
        let port = self.port();
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(DataChannelError::Cancelled);
            }
            result = tokio::time::timeout(timeout, self.inner.accept()) => {
                match result {
                    Ok(Ok((stream, addr))) => {
                        info!(port, %addr, "connection accepted");
                        stream
                    }
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => return Err(DataChannelError::Timeout),
                }
            }
        };

        // Only one connection per listener.
        drop(self.inner);

        Ok(stream)
    }
}

/// Reads a short report (such as `md5sum` output) to end of stream.
///
/// Fails if the peer sends more than `limit` bytes or non-UTF-8 data.
pub async fn read_report<R: AsyncRead + Unpin>(
    reader: R,
    limit: usize,
) -> Result<String, DataChannelError> {
    let mut buf = Vec::new();
    reader.take(limit as u64 + 1).read_to_end(&mut buf).await?;
    if buf.len() > limit {
        return Err(DataChannelError::Protocol(format!(
            "report exceeds {limit} bytes"
        )));
    }
    String::from_utf8(buf)
        .map_err(|e| DataChannelError::Protocol(format!("invalid UTF-8 report: {e}")))
}
