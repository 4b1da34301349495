use thiserror::Error;

/// Engine-wide error type.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake error: {0}")]
    Handshake(#[from] remora_proto::HandshakeError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("bencode decode error: {0}")]
    Bencode(String),
    #[error("tracker error: {0}")]
    Tracker(String),
    #[error("invalid metainfo: {0}")]
    Metainfo(String),
    #[error("could not connect to any peer")]
    NoPeers,
    #[error("piece index {0} out of range")]
    InvalidPieceIndex(u32),
    #[error("invalid block offset {offset} in piece {piece}")]
    InvalidOffset { piece: u32, offset: u32 },
    #[error("block length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: u32, actual: usize },
    #[error("duplicate request for piece {piece} offset {offset}")]
    DuplicateRequest { piece: u32, offset: u32 },
    #[error("peer has no request capacity left")]
    PeerSaturated,
}

impl EngineError {
    pub fn info_hash_mismatch(expected: [u8; 20], received: [u8; 20]) -> Self {
        let msg = format!(
            "info-hash mismatch expected={} received={}",
            hex::encode(expected),
            hex::encode(received)
        );
        Self::Protocol(msg)
    }
}

impl From<bendy::decoding::Error> for EngineError {
    fn from(e: bendy::decoding::Error) -> Self {
        Self::Bencode(e.to_string())
    }
}

impl From<remora_proto::WireError> for EngineError {
    fn from(e: remora_proto::WireError) -> Self {
        Self::Protocol(e.to_string())
    }
}
