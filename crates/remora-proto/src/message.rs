use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Standard block size (16 KB); the unit of wire transfer.
pub const BLOCK_SIZE: u32 = 16384;

/// Largest frame we are willing to buffer. The biggest legal message is a
/// Piece frame carrying one block; bitfields for very large torrents still
/// fit comfortably under this cap.
pub const MAX_FRAME_LEN: usize = 64 * 1024 + 13;

/// BitTorrent peer wire protocol messages.
///
/// Every frame is a 4-byte big-endian length prefix, a 1-byte id when the
/// length is nonzero, and `length - 1` payload bytes. A zero length is the
/// keep-alive frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Keep-alive (no id, no payload)
    KeepAlive,
    /// Stop sending data to the peer
    Choke,
    /// Resume sending data to the peer
    Unchoke,
    /// Declare interest in the peer's pieces
    Interested,
    /// Declare lack of interest
    NotInterested,
    /// Peer acquired a piece (piece_index)
    Have(u32),
    /// Packed per-piece availability bits, MSB-first per byte
    Bitfield(Bytes),
    /// Request a block: (piece_index, block_offset, block_length)
    Request { index: u32, begin: u32, length: u32 },
    /// Deliver a block: (piece_index, block_offset, data)
    Piece { index: u32, begin: u32, data: Bytes },
    /// Cancel a request: (piece_index, block_offset, block_length)
    Cancel { index: u32, begin: u32, length: u32 },
    /// DHT port announcement; ignored by this client
    Port(u16),
    /// Message id we do not understand; skipped, never sent
    Unknown(u8),
}

/// Decode failure. Anything here is a protocol violation that closes the
/// link; incomplete frames are not errors (`decode` returns `None`).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("frame length {0} exceeds limit")]
    Oversized(usize),
    #[error("message id {id} with bad payload length {len}")]
    BadLength { id: u8, len: usize },
}

impl Message {
    /// Encode the message into a ready-to-write frame.
    pub fn encode(&self) -> BytesMut {
        match self {
            Message::KeepAlive => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u32(0);
                buf
            }
            Message::Choke => encode_simple(0),
            Message::Unchoke => encode_simple(1),
            Message::Interested => encode_simple(2),
            Message::NotInterested => encode_simple(3),
            Message::Have(piece_index) => {
                let mut buf = BytesMut::with_capacity(9);
                buf.put_u32(5);
                buf.put_u8(4);
                buf.put_u32(*piece_index);
                buf
            }
            Message::Bitfield(data) => {
                let len = 1 + data.len();
                let mut buf = BytesMut::with_capacity(4 + len);
                buf.put_u32(len as u32);
                buf.put_u8(5);
                buf.put_slice(data);
                buf
            }
            Message::Request { index, begin, length } => {
                let mut buf = BytesMut::with_capacity(17);
                buf.put_u32(13);
                buf.put_u8(6);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
                buf
            }
            Message::Piece { index, begin, data } => {
                let len = 9 + data.len();
                let mut buf = BytesMut::with_capacity(4 + len);
                buf.put_u32(len as u32);
                buf.put_u8(7);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
                buf
            }
            Message::Cancel { index, begin, length } => {
                let mut buf = BytesMut::with_capacity(17);
                buf.put_u32(13);
                buf.put_u8(8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
                buf
            }
            Message::Port(port) => {
                let mut buf = BytesMut::with_capacity(7);
                buf.put_u32(3);
                buf.put_u8(9);
                buf.put_u16(*port);
                buf
            }
            Message::Unknown(id) => encode_simple(*id),
        }
    }

    /// Decode one message from the front of `buf`.
    ///
    /// Returns `(message, bytes_consumed)`, or `None` when more data is
    /// needed. Payload lengths that do not match the message id are
    /// protocol errors.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, WireError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if length > MAX_FRAME_LEN {
            return Err(WireError::Oversized(length));
        }
        let total_len = 4 + length;
        if buf.len() < total_len {
            return Ok(None);
        }

        if length == 0 {
            return Ok(Some((Message::KeepAlive, 4)));
        }

        let msg_id = buf[4];
        let payload = &buf[5..total_len];

        let message = match msg_id {
            0 => fixed(msg_id, payload, 0, Message::Choke)?,
            1 => fixed(msg_id, payload, 0, Message::Unchoke)?,
            2 => fixed(msg_id, payload, 0, Message::Interested)?,
            3 => fixed(msg_id, payload, 0, Message::NotInterested)?,
            4 => {
                check_len(msg_id, payload, 4)?;
                Message::Have(read_u32(payload, 0))
            }
            5 => Message::Bitfield(Bytes::copy_from_slice(payload)),
            6 => {
                check_len(msg_id, payload, 12)?;
                Message::Request {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    length: read_u32(payload, 8),
                }
            }
            7 => {
                if payload.len() < 8 {
                    return Err(WireError::BadLength { id: msg_id, len: payload.len() });
                }
                Message::Piece {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    data: Bytes::copy_from_slice(&payload[8..]),
                }
            }
            8 => {
                check_len(msg_id, payload, 12)?;
                Message::Cancel {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    length: read_u32(payload, 8),
                }
            }
            9 => {
                check_len(msg_id, payload, 2)?;
                Message::Port(u16::from_be_bytes([payload[0], payload[1]]))
            }
            other => Message::Unknown(other),
        };

        Ok(Some((message, total_len)))
    }
}

fn encode_simple(id: u8) -> BytesMut {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u32(1);
    buf.put_u8(id);
    buf
}

fn fixed(id: u8, payload: &[u8], want: usize, msg: Message) -> Result<Message, WireError> {
    check_len(id, payload, want)?;
    Ok(msg)
}

fn check_len(id: u8, payload: &[u8], want: usize) -> Result<(), WireError> {
    if payload.len() != want {
        return Err(WireError::BadLength { id, len: payload.len() });
    }
    Ok(())
}

fn read_u32(payload: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
}
