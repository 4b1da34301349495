use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use remora_proto::BLOCK_SIZE;
use sha1::{Digest, Sha1};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::error::EngineError;
use crate::ledger::RequestLedger;
use crate::metainfo::TorrentMeta;

/// Download state of one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    /// Nothing received, nothing requested.
    Missing,
    /// At least one request recorded or block received, not yet verified.
    InFlight,
    /// Hash-verified and persisted.
    Have,
}

/// A plannable block: the unit of wire transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

/// Result of feeding one received block to the inventory.
#[derive(Debug)]
pub enum AcceptOutcome {
    /// Block already present (or piece already done); bytes discarded.
    Duplicate,
    /// Block stored, piece still incomplete.
    Progress,
    /// All blocks present and the SHA-1 matched. The assembled buffer is
    /// handed out so the caller can persist it without blocking the
    /// inventory, then publish with [`PieceInventory::commit`].
    Verified(Vec<u8>),
    /// All blocks were present but the hash did not match; the piece has
    /// been rolled back to `Missing`.
    Corrupt,
}

/// Read-only download progress snapshot.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    pub pieces_have: u32,
    pub pieces_total: u32,
    pub bytes_downloaded: u64,
    pub elapsed: Duration,
}

impl Progress {
    /// Bytes per second since engine start.
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes_downloaded as f64 / secs
    }

    pub fn percent(&self) -> f64 {
        if self.pieces_total == 0 {
            return 100.0;
        }
        self.pieces_have as f64 / self.pieces_total as f64 * 100.0
    }
}

struct PieceSlot {
    expected_hash: [u8; 20],
    length: u32,
    block_count: u32,
    received: Vec<bool>,
    received_count: u32,
    buffer: Option<Vec<u8>>,
    state: PieceState,
}

impl PieceSlot {
    fn block_length(&self, block_index: u32) -> u32 {
        let begin = block_index * BLOCK_SIZE;
        BLOCK_SIZE.min(self.length - begin)
    }
}

/// Authoritative state of every piece: block bitmaps, assembly buffers,
/// SHA-1 verification, and the block selection policy.
pub struct PieceInventory {
    pieces: Vec<PieceSlot>,
    have_count: u32,
    bytes_downloaded: u64,
    started_at: Instant,
    rng: StdRng,
}

impl PieceInventory {
    pub fn new(meta: &TorrentMeta) -> Self {
        let mut pieces = Vec::with_capacity(meta.piece_count() as usize);
        for index in 0..meta.piece_count() {
            let length = meta.piece_size(index);
            let block_count = length.div_ceil(BLOCK_SIZE).max(1);
            pieces.push(PieceSlot {
                expected_hash: *meta.piece_hash(index).unwrap_or(&[0u8; 20]),
                length,
                block_count,
                received: vec![false; block_count as usize],
                received_count: 0,
                buffer: None,
                state: PieceState::Missing,
            });
        }
        // Seeded from the wall clock; restarts must not replay the same
        // pick sequence.
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos() as u64;
        Self {
            pieces,
            have_count: 0,
            bytes_downloaded: 0,
            started_at: Instant::now(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn piece_count(&self) -> u32 {
        self.pieces.len() as u32
    }

    pub fn have_count(&self) -> u32 {
        self.have_count
    }

    pub fn is_complete(&self) -> bool {
        self.have_count as usize == self.pieces.len()
    }

    pub fn state(&self, piece: u32) -> Option<PieceState> {
        self.pieces.get(piece as usize).map(|p| p.state)
    }

    pub fn has_received_blocks(&self, piece: u32) -> bool {
        self.pieces
            .get(piece as usize)
            .map(|p| p.received_count > 0)
            .unwrap_or(false)
    }

    pub fn progress(&self) -> Progress {
        Progress {
            pieces_have: self.have_count,
            pieces_total: self.piece_count(),
            bytes_downloaded: self.bytes_downloaded,
            elapsed: self.started_at.elapsed(),
        }
    }

    /// Pick the next block to request from a peer advertising
    /// `peer_bits`, or `None` if the peer has nothing useful right now.
    ///
    /// Selection policy: finish partially downloaded pieces the peer has
    /// before starting new ones; when starting fresh, pick uniformly at
    /// random until the first piece lands (bootstrap), then rarest-first
    /// by `availability` with random tie-break. Within a piece, lowest
    /// unrequested block first. Blocks with a live ledger entry are never
    /// handed out twice.
    pub fn plan_block(
        &mut self,
        peer_bits: &[bool],
        availability: &[u32],
        ledger: &RequestLedger,
    ) -> Option<Block> {
        // Finish what we started.
        for index in 0..self.pieces.len() {
            if self.pieces[index].state != PieceState::InFlight {
                continue;
            }
            if !peer_bits.get(index).copied().unwrap_or(false) {
                continue;
            }
            if let Some(block) = self.next_needed_block(index as u32, ledger) {
                return Some(block);
            }
        }

        // Start a new piece the peer has.
        let candidates: Vec<u32> = (0..self.pieces.len() as u32)
            .filter(|&i| {
                self.pieces[i as usize].state == PieceState::Missing
                    && peer_bits.get(i as usize).copied().unwrap_or(false)
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let chosen = if self.have_count == 0 {
            // bootstrap mode: uniform random until the first piece lands
            candidates[self.rng.gen_range(0..candidates.len())]
        } else {
            let rarest = candidates
                .iter()
                .map(|&i| availability.get(i as usize).copied().unwrap_or(0))
                .min()
                .unwrap_or(0);
            let ties: Vec<u32> = candidates
                .into_iter()
                .filter(|&i| availability.get(i as usize).copied().unwrap_or(0) == rarest)
                .collect();
            ties[self.rng.gen_range(0..ties.len())]
        };

        self.pieces[chosen as usize].state = PieceState::InFlight;
        self.next_needed_block(chosen, ledger)
    }

    fn next_needed_block(&self, piece: u32, ledger: &RequestLedger) -> Option<Block> {
        let slot = &self.pieces[piece as usize];
        for block_index in 0..slot.block_count {
            if slot.received[block_index as usize] {
                continue;
            }
            let offset = block_index * BLOCK_SIZE;
            if ledger.contains_block(piece, offset) {
                continue;
            }
            return Some(Block {
                piece,
                offset,
                length: slot.block_length(block_index),
            });
        }
        None
    }

    /// Store one received block. When the last block lands, the assembled
    /// buffer is hashed; a match hands the buffer out for persistence, a
    /// mismatch rolls the piece back to `Missing`.
    pub fn accept_block(
        &mut self,
        piece: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<AcceptOutcome, EngineError> {
        let slot = self
            .pieces
            .get_mut(piece as usize)
            .ok_or(EngineError::InvalidPieceIndex(piece))?;

        if offset % BLOCK_SIZE != 0 || offset >= slot.length {
            return Err(EngineError::InvalidOffset { piece, offset });
        }
        let block_index = offset / BLOCK_SIZE;
        let expected = slot.block_length(block_index);
        if data.len() != expected as usize {
            return Err(EngineError::LengthMismatch {
                expected,
                actual: data.len(),
            });
        }

        if slot.state == PieceState::Have || slot.received[block_index as usize] {
            return Ok(AcceptOutcome::Duplicate);
        }

        let piece_len = slot.length as usize;
        let buffer = slot.buffer.get_or_insert_with(|| vec![0u8; piece_len]);
        buffer[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        slot.received[block_index as usize] = true;
        slot.received_count += 1;
        slot.state = PieceState::InFlight;
        self.bytes_downloaded += data.len() as u64;

        if slot.received_count < slot.block_count {
            return Ok(AcceptOutcome::Progress);
        }

        let buffer = slot.buffer.take().unwrap_or_default();
        let mut hasher = Sha1::new();
        hasher.update(&buffer);
        let digest = hasher.finalize();
        if digest.as_slice() == slot.expected_hash {
            // State stays InFlight until the caller persists the bytes
            // and calls commit.
            Ok(AcceptOutcome::Verified(buffer))
        } else {
            debug!(piece, "piece failed hash verification");
            slot.received.iter_mut().for_each(|b| *b = false);
            slot.received_count = 0;
            slot.state = PieceState::Missing;
            Ok(AcceptOutcome::Corrupt)
        }
    }

    /// Publish a verified and persisted piece as `Have`.
    pub fn commit(&mut self, piece: u32) {
        if let Some(slot) = self.pieces.get_mut(piece as usize) {
            if slot.state != PieceState::Have {
                slot.state = PieceState::Have;
                slot.buffer = None;
                self.have_count += 1;
            }
        }
    }

    /// Roll a piece back to `Missing`, releasing its buffer and bitmap.
    /// Ledger entries for the piece must be purged by the caller.
    pub fn reset_piece(&mut self, piece: u32) {
        if let Some(slot) = self.pieces.get_mut(piece as usize) {
            if slot.state == PieceState::Have {
                return;
            }
            slot.state = PieceState::Missing;
            slot.buffer = None;
            slot.received.iter_mut().for_each(|b| *b = false);
            slot.received_count = 0;
        }
    }
}
