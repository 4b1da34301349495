use bytes::{Bytes, BytesMut};
use remora_proto::{Handshake, Message, HANDSHAKE_LEN};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::ledger::PeerKey;

/// Everything a peer task reports to the scheduler. The scheduler is the
/// only consumer; peers never talk to each other or to the inventory
/// directly.
#[derive(Debug)]
pub enum PeerEvent {
    /// Handshake completed; carries the sender for commanding this peer.
    Connected {
        key: PeerKey,
        remote_peer_id: [u8; 20],
        commands: mpsc::Sender<PeerCommand>,
    },
    /// First bitfield arrived, already unpacked and length-checked.
    Bitfield { key: PeerKey, bits: Vec<bool> },
    /// Peer announced one more piece.
    Have { key: PeerKey, piece: u32 },
    Choked { key: PeerKey },
    Unchoked { key: PeerKey },
    /// A block of piece data arrived.
    Block {
        key: PeerKey,
        piece: u32,
        offset: u32,
        data: Bytes,
    },
    /// The link is gone, for whatever reason; no more events will follow.
    Closed { key: PeerKey },
}

/// Scheduler-to-peer commands.
#[derive(Debug)]
pub enum PeerCommand {
    Interested,
    Request { piece: u32, offset: u32, length: u32 },
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Handshaking,
    Ready,
    Closed,
}

/// One TCP connection to a remote peer: handshake, framed codec loop,
/// and the peer-side protocol state. Owned entirely by its own task.
pub struct PeerLink {
    stream: TcpStream,
    remote_addr: SocketAddr,
    remote_peer_id: [u8; 20],
    piece_count: u32,
    state: LinkState,
    am_choked: bool,
    am_interested: bool,
    peer_choked: bool,
    peer_interested: bool,
    bitfield: Option<Vec<bool>>,
    saw_first_message: bool,
    read_buf: BytesMut,
    events: mpsc::Sender<PeerEvent>,
    keepalive_interval: Duration,
}

impl PeerLink {
    /// Dial a peer and run the handshake: send ours, then read exactly 68
    /// bytes under the handshake deadline and verify protocol string and
    /// info-hash. The remote peer id is recorded but not checked.
    pub async fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        piece_count: u32,
        config: &EngineConfig,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Self, EngineError> {
        let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| timeout_error("connect timed out"))??;
        stream.set_nodelay(true).ok();

        let mut link = Self {
            stream,
            remote_addr: addr,
            remote_peer_id: [0u8; 20],
            piece_count,
            state: LinkState::Handshaking,
            am_choked: true,
            am_interested: false,
            peer_choked: true,
            peer_interested: false,
            bitfield: None,
            saw_first_message: false,
            read_buf: BytesMut::with_capacity(32 * 1024),
            events,
            keepalive_interval: config.keepalive_interval,
        };
        link.handshake(info_hash, peer_id, config.handshake_timeout)
            .await?;
        Ok(link)
    }

    async fn handshake(
        &mut self,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        deadline: Duration,
    ) -> Result<(), EngineError> {
        let ours = Handshake::new(info_hash, peer_id);
        self.stream.write_all(&ours.encode()).await?;

        let mut buf = [0u8; HANDSHAKE_LEN];
        timeout(deadline, self.stream.read_exact(&mut buf))
            .await
            .map_err(|_| timeout_error("handshake timed out"))??;
        let theirs = Handshake::decode(&buf)?;
        if theirs.info_hash != info_hash {
            return Err(EngineError::info_hash_mismatch(info_hash, theirs.info_hash));
        }
        self.remote_peer_id = theirs.peer_id;
        self.state = LinkState::Ready;
        info!(
            remote_addr = %self.remote_addr,
            remote_peer_id = %hex::encode(theirs.peer_id),
            "handshake completed"
        );
        Ok(())
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn remote_peer_id(&self) -> [u8; 20] {
        self.remote_peer_id
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn am_choked(&self) -> bool {
        self.am_choked
    }

    pub fn am_interested(&self) -> bool {
        self.am_interested
    }

    pub fn peer_choked(&self) -> bool {
        self.peer_choked
    }

    pub fn peer_interested(&self) -> bool {
        self.peer_interested
    }

    /// Drive the link until the peer hangs up, a protocol error occurs,
    /// the scheduler closes us, or shutdown is signalled. Always emits a
    /// final `Closed` event.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let key = self.remote_addr;
        let (command_tx, mut commands) = mpsc::channel(32);
        let connected = PeerEvent::Connected {
            key,
            remote_peer_id: self.remote_peer_id,
            commands: command_tx,
        };
        if self.events.send(connected).await.is_err() {
            return;
        }

        if let Err(error) = self.drive(&mut commands, &mut shutdown).await {
            debug!(remote_addr = %key, error = %error, "peer link failed");
        }
        self.state = LinkState::Closed;
        let _ = self.events.send(PeerEvent::Closed { key }).await;
    }

    async fn drive(
        &mut self,
        commands: &mut mpsc::Receiver<PeerCommand>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + self.keepalive_interval,
            self.keepalive_interval,
        );
        loop {
            tokio::select! {
                read = async {
                    let mut chunk = vec![0u8; 8192];
                    let n = self.stream.read(&mut chunk).await?;
                    chunk.truncate(n);
                    Ok::<_, std::io::Error>(chunk)
                } => {
                    let chunk = read?;
                    if chunk.is_empty() {
                        debug!(remote_addr = %self.remote_addr, "peer closed connection");
                        return Ok(());
                    }
                    self.read_buf.extend_from_slice(&chunk);
                    while let Some((message, consumed)) = Message::decode(&self.read_buf)? {
                        let _ = self.read_buf.split_to(consumed);
                        self.handle_message(message).await?;
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(PeerCommand::Interested) => self.send_interested().await?,
                        Some(PeerCommand::Request { piece, offset, length }) => {
                            self.send_request(piece, offset, length).await?;
                        }
                        Some(PeerCommand::Close) | None => return Ok(()),
                    }
                }
                _ = keepalive.tick() => {
                    self.send_message(Message::KeepAlive).await?;
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    async fn handle_message(&mut self, message: Message) -> Result<(), EngineError> {
        let key = self.remote_addr;
        match &message {
            Message::KeepAlive => return Ok(()),
            Message::Choke => {
                self.am_choked = true;
                self.forward(PeerEvent::Choked { key }).await?;
            }
            Message::Unchoke => {
                self.am_choked = false;
                self.forward(PeerEvent::Unchoked { key }).await?;
            }
            Message::Interested => self.peer_interested = true,
            Message::NotInterested => self.peer_interested = false,
            Message::Have(piece) => {
                let piece = *piece;
                if piece >= self.piece_count {
                    return Err(EngineError::Protocol(format!(
                        "have for piece {} of {}",
                        piece, self.piece_count
                    )));
                }
                let count = self.piece_count as usize;
                let bits = self.bitfield.get_or_insert_with(|| vec![false; count]);
                bits[piece as usize] = true;
                self.forward(PeerEvent::Have { key, piece }).await?;
            }
            Message::Bitfield(data) => {
                if self.saw_first_message {
                    return Err(EngineError::Protocol(
                        "bitfield after first message".into(),
                    ));
                }
                let expected = (self.piece_count as usize).div_ceil(8);
                if data.len() != expected {
                    return Err(EngineError::Protocol(format!(
                        "bitfield length {} for {} pieces",
                        data.len(),
                        self.piece_count
                    )));
                }
                let bits = unpack_bitfield(data, self.piece_count as usize);
                self.bitfield = Some(bits.clone());
                self.forward(PeerEvent::Bitfield { key, bits }).await?;
            }
            Message::Request { index, begin, length } => {
                // Leech-only: we never serve data.
                debug!(remote_addr = %key, piece = index, offset = begin, length, "ignoring upload request");
            }
            Message::Cancel { .. } => {
                debug!(remote_addr = %key, "ignoring cancel");
            }
            Message::Piece { index, begin, data } => {
                self.forward(PeerEvent::Block {
                    key,
                    piece: *index,
                    offset: *begin,
                    data: data.clone(),
                })
                .await?;
            }
            Message::Port(port) => {
                debug!(remote_addr = %key, port, "peer announced DHT port");
            }
            Message::Unknown(id) => {
                debug!(remote_addr = %key, id, "skipping unknown message id");
            }
        }
        self.saw_first_message = true;
        Ok(())
    }

    async fn forward(&self, event: PeerEvent) -> Result<(), EngineError> {
        self.events
            .send(event)
            .await
            .map_err(|_| EngineError::Protocol("engine shut down".into()))
    }

    async fn send_interested(&mut self) -> Result<(), EngineError> {
        self.am_interested = true;
        self.send_message(Message::Interested).await
    }

    async fn send_request(
        &mut self,
        piece: u32,
        offset: u32,
        length: u32,
    ) -> Result<(), EngineError> {
        if self.am_choked {
            // The choke raced the scheduler; it will reconcile via the
            // Choked event and reissue elsewhere.
            debug!(remote_addr = %self.remote_addr, piece, offset, "dropping request while choked");
            return Ok(());
        }
        self.send_message(Message::Request {
            index: piece,
            begin: offset,
            length,
        })
        .await
    }

    async fn send_message(&mut self, message: Message) -> Result<(), EngineError> {
        self.stream.write_all(&message.encode()).await?;
        Ok(())
    }
}

fn timeout_error(what: &str) -> EngineError {
    EngineError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, what))
}

/// Unpack an MSB-first bitfield into per-piece booleans, ignoring the
/// trailing pad bits.
fn unpack_bitfield(data: &[u8], piece_count: usize) -> Vec<bool> {
    let mut bits = vec![false; piece_count];
    for (i, bit) in bits.iter_mut().enumerate() {
        let byte = data[i / 8];
        let mask = 1u8 << (7 - (i % 8));
        *bit = byte & mask != 0;
    }
    bits
}

/// Pack per-piece booleans into wire format, MSB of byte 0 first.
pub fn pack_bitfield(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; bits.len().div_ceil(8)];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            out[i / 8] |= 1u8 << (7 - (i % 8));
        }
    }
    out
}
