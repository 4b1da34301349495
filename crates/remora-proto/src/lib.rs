pub mod handshake;
pub mod message;

pub use handshake::{
    random_peer_id,
    Handshake,
    HandshakeError,
    HANDSHAKE_LEN,
    HASH_LEN,
    PEER_ID_LEN,
    PEER_ID_PREFIX,
    PROTOCOL_STR,
    RESERVED_BYTES,
};

pub use message::{Message, WireError, BLOCK_SIZE, MAX_FRAME_LEN};
