//! TCP data channel for the relay broker.
//!
//! The broker receives the payload and the remote checksum report on two
//! ephemeral ports, each accepting exactly one connection. The payload
//! connection is fanned out to several consumers through a
//! [`RelaySplitter`] so it is read from the network once and never held
//! in full.

pub mod error;
pub mod listener;
pub mod port;
pub mod relay;

pub use error::DataChannelError;
pub use listener::{Listener, read_report};
pub use port::PortAllocator;
pub use relay::{ChunkStream, RelaySplitter};

use std::time::Duration;

/// Relay chunk size (256 KB).
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Chunks buffered per consumer before the relay waits for it.
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

/// Timeout for the single inbound connection.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(300);

/// Upper bound for a checksum report payload.
pub const REPORT_LIMIT: usize = 4096;
