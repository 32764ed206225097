//! Ephemeral port negotiation.
//!
//! Concurrent sessions pick ports independently, so candidates are drawn
//! from a generator seeded with request-specific entropy. A collision shows
//! up as `AddrInUse` from the bind call itself and the next candidate is
//! tried, up to a fixed budget.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::error::DataChannelError;
use crate::listener::Listener;

/// Default candidate range (IANA dynamic ports).
pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 49152..=65535;

/// Default number of bind attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 32;

/// Picks and binds free ports from a range.
pub struct PortAllocator {
    bind_ip: IpAddr,
    range: RangeInclusive<u16>,
    max_attempts: u32,
    rng: StdRng,
}

impl PortAllocator {
    /// Creates an allocator drawing candidates from `range`.
    ///
    /// The same `seed` yields the same candidate sequence.
    pub fn new(
        bind_ip: IpAddr,
        range: RangeInclusive<u16>,
        max_attempts: u32,
        seed: u64,
    ) -> Result<Self, DataChannelError> {
        let (start, end) = (*range.start(), *range.end());
        if start == 0 || start > end {
            return Err(DataChannelError::InvalidRange { start, end });
        }
        Ok(Self {
            bind_ip,
            range,
            max_attempts: max_attempts.max(1),
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Derives a seed from request-specific strings and the wall clock.
    pub fn seed_from(parts: &[&str]) -> u64 {
        let mut hasher = DefaultHasher::new();
        parts.hash(&mut hasher);
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default()
            .hash(&mut hasher);
        std::process::id().hash(&mut hasher);
        hasher.finish()
    }

    /// Draws the next candidate port.
    pub fn next_candidate(&mut self) -> u16 {
        self.rng.gen_range(self.range.clone())
    }

    /// Binds the first free candidate.
    ///
    /// Ports already in use (or reserved) are skipped; any other bind error
    /// is returned immediately.
    pub async fn bind(&mut self) -> Result<Listener, DataChannelError> {
        for attempt in 1..=self.max_attempts {
            let port = self.next_candidate();
            let addr = SocketAddr::new(self.bind_ip, port);
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    info!(port, attempt, "listener bound");
                    return Listener::new(listener);
                }
                Err(e) if matches!(e.kind(), ErrorKind::AddrInUse | ErrorKind::PermissionDenied) => {
                    debug!(port, attempt, error = %e, "port unavailable, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(DataChannelError::PortExhausted {
            start: *self.range.start(),
            end: *self.range.end(),
            attempts: self.max_attempts,
        })
    }
}
