//! Transfer configuration.

use std::net::{IpAddr, Ipv4Addr};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use ltacp_data_channel::port::{DEFAULT_MAX_ATTEMPTS, DEFAULT_PORT_RANGE};
use ltacp_data_channel::{DEFAULT_ACCEPT_TIMEOUT, DEFAULT_CHUNK_SIZE, DEFAULT_QUEUE_DEPTH};
use ltacp_remote::RemoteConfig;
use ltacp_storage::UploadClientConfig;

/// Settings for every transfer run by one coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// First port of the candidate range.
    pub port_range_start: u16,
    /// Last port of the candidate range (inclusive).
    pub port_range_end: u16,
    /// Bind attempts before a transfer fails.
    pub max_bind_attempts: u32,
    /// Fixed seed for port candidates; derived per request when unset.
    pub port_seed: Option<u64>,
    /// Address the listeners bind to.
    pub bind_address: IpAddr,
    /// Name the source host uses to reach the broker. Defaults to the
    /// machine hostname.
    pub broker_host: Option<String>,
    pub accept_timeout_secs: u64,
    pub chunk_size: usize,
    pub queue_depth: usize,
    /// Directory holding the local named pipe.
    pub local_pipe_dir: PathBuf,
    pub remote: RemoteConfig,
    pub upload: UploadClientConfig,
    /// Remove the stored object when its checksum does not match.
    pub remove_corrupt_object: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            port_range_start: *DEFAULT_PORT_RANGE.start(),
            port_range_end: *DEFAULT_PORT_RANGE.end(),
            max_bind_attempts: DEFAULT_MAX_ATTEMPTS,
            port_seed: None,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            broker_host: None,
            accept_timeout_secs: DEFAULT_ACCEPT_TIMEOUT.as_secs(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            local_pipe_dir: std::env::temp_dir(),
            remote: RemoteConfig::default(),
            upload: UploadClientConfig::default(),
            remove_corrupt_object: true,
        }
    }
}

impl TransferConfig {
    pub fn port_range(&self) -> RangeInclusive<u16> {
        self.port_range_start..=self.port_range_end
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_secs(self.accept_timeout_secs)
    }

    /// Broker name handed to the source host.
    pub fn broker_host(&self) -> String {
        if let Some(host) = &self.broker_host {
            return host.clone();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".into())
    }
}
