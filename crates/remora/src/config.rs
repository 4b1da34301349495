use std::path::PathBuf;
use std::time::Duration;

/// Tunables for a download session. Defaults match the wire-protocol
/// conventions; tests shrink the timing knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory the torrent contents are written under.
    pub output_dir: PathBuf,
    /// Port reported to the tracker. We never listen on it.
    pub port: u16,
    /// How many peers to ask the tracker for.
    pub numwant: u32,
    /// Cap on concurrently dialed peers.
    pub max_peers: usize,
    /// Outstanding block requests allowed per peer.
    pub max_requests_per_peer: usize,
    /// A block request unanswered for this long is reclaimed.
    pub request_timeout: Duration,
    /// Hard deadline for reading the 68-byte handshake reply.
    pub handshake_timeout: Duration,
    /// TCP connect deadline per peer.
    pub connect_timeout: Duration,
    /// Cadence of the zero-length keep-alive frame.
    pub keepalive_interval: Duration,
    /// Scheduler tick period.
    pub tick_interval: Duration,
}

impl EngineConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            port: 6881,
            numwant: 50,
            max_peers: 15,
            max_requests_per_peer: 5,
            request_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(120),
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new("downloads")
    }
}
