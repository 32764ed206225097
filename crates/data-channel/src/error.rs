//! Error types for the data channel.

/// Errors produced by the TCP data channel.
#[derive(Debug, thiserror::Error)]
pub enum DataChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no free port in {start}..={end} after {attempts} attempts")]
    PortExhausted { start: u16, end: u16, attempts: u32 },

    #[error("invalid port range {start}..={end}")]
    InvalidRange { start: u16, end: u16 },

    #[error("connection timed out")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("relay aborted before end of stream")]
    RelayAborted,

    #[error("relay consumer {0} closed before end of stream")]
    ConsumerClosed(usize),

    #[error("protocol error: {0}")]
    Protocol(String),
}
