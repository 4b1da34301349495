use rand::RngCore;
use thiserror::Error;

pub const PROTOCOL_STR: &str = "BitTorrent protocol";
pub const RESERVED_BYTES: usize = 8;
pub const HASH_LEN: usize = 20;
pub const PEER_ID_LEN: usize = 20;
pub const HANDSHAKE_LEN: usize = 49 + PROTOCOL_STR.len();
/// Client identifier sent in the first eight bytes of our peer id.
pub const PEER_ID_PREFIX: &[u8] = b"-BC0100-";

// Frame layout:
// <1: pstrlen> <19: pstr> <8: reserved> <20: info_hash> <20: peer_id>
const PSTR_END: usize = 1 + PROTOCOL_STR.len();
const RESERVED_END: usize = PSTR_END + RESERVED_BYTES;
const INFO_HASH_END: usize = RESERVED_END + HASH_LEN;

/// The fixed-size message that opens every peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; RESERVED_BYTES],
    pub info_hash: [u8; HASH_LEN],
    pub peer_id: [u8; PEER_ID_LEN],
}

impl Handshake {
    pub fn new(info_hash: [u8; HASH_LEN], peer_id: [u8; PEER_ID_LEN]) -> Self {
        Self {
            reserved: [0; RESERVED_BYTES],
            info_hash,
            peer_id,
        }
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut frame = [0u8; HANDSHAKE_LEN];
        frame[0] = PROTOCOL_STR.len() as u8;
        frame[1..PSTR_END].copy_from_slice(PROTOCOL_STR.as_bytes());
        frame[PSTR_END..RESERVED_END].copy_from_slice(&self.reserved);
        frame[RESERVED_END..INFO_HASH_END].copy_from_slice(&self.info_hash);
        frame[INFO_HASH_END..].copy_from_slice(&self.peer_id);
        frame
    }

    pub fn decode(frame: &[u8]) -> Result<Self, HandshakeError> {
        if frame.len() < HANDSHAKE_LEN {
            return Err(HandshakeError::Length(frame.len()));
        }
        if frame[0] as usize != PROTOCOL_STR.len()
            || &frame[1..PSTR_END] != PROTOCOL_STR.as_bytes()
        {
            return Err(HandshakeError::ProtocolString);
        }
        let mut handshake = Self::new([0; HASH_LEN], [0; PEER_ID_LEN]);
        handshake
            .reserved
            .copy_from_slice(&frame[PSTR_END..RESERVED_END]);
        handshake
            .info_hash
            .copy_from_slice(&frame[RESERVED_END..INFO_HASH_END]);
        handshake
            .peer_id
            .copy_from_slice(&frame[INFO_HASH_END..HANDSHAKE_LEN]);
        Ok(handshake)
    }
}

/// Generate a fresh peer id: the client prefix followed by random bytes.
pub fn random_peer_id() -> [u8; PEER_ID_LEN] {
    let mut peer_id = [0u8; PEER_ID_LEN];
    peer_id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
    rand::thread_rng().fill_bytes(&mut peer_id[PEER_ID_PREFIX.len()..]);
    peer_id
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("invalid handshake length: {0}")]
    Length(usize),
    #[error("invalid protocol string")]
    ProtocolString,
}
