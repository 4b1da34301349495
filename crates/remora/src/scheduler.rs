use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::inventory::{AcceptOutcome, PieceInventory, Progress};
use crate::ledger::{PeerKey, Request, RequestLedger};
use crate::peer::{PeerCommand, PeerEvent};
use crate::store::FileStore;

/// Consecutive disk failures tolerated before the download is declared
/// dead rather than retrying piece by piece.
const MAX_STORE_FAILURES: u32 = 3;

/// What the scheduler knows about one connected peer, assembled entirely
/// from that peer's events. The peer task owns the live protocol state.
struct PeerView {
    commands: mpsc::Sender<PeerCommand>,
    bitfield: Option<Vec<bool>>,
    choked: bool,
    interested_sent: bool,
}

/// The control loop that mediates between peer tasks and the shared piece
/// state. Runs until the torrent completes, an external stop arrives, or
/// every peer is gone.
pub struct Scheduler {
    inventory: PieceInventory,
    ledger: RequestLedger,
    store: FileStore,
    availability: Vec<u32>,
    peers: HashMap<PeerKey, PeerView>,
    rotation: VecDeque<PeerKey>,
    events: mpsc::Receiver<PeerEvent>,
    peer_stop: watch::Sender<bool>,
    stop: watch::Receiver<bool>,
    progress: watch::Sender<Progress>,
    tick_interval: Duration,
    request_timeout: Duration,
    store_failures: u32,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        inventory: PieceInventory,
        ledger: RequestLedger,
        store: FileStore,
        events: mpsc::Receiver<PeerEvent>,
        peer_stop: watch::Sender<bool>,
        stop: watch::Receiver<bool>,
        progress: watch::Sender<Progress>,
        config: &EngineConfig,
    ) -> Self {
        let piece_count = inventory.piece_count() as usize;
        Self {
            inventory,
            ledger,
            store,
            availability: vec![0; piece_count],
            peers: HashMap::new(),
            rotation: VecDeque::new(),
            events,
            peer_stop,
            stop,
            progress,
            tick_interval: config.tick_interval,
            request_timeout: config.request_timeout,
            store_failures: 0,
        }
    }

    pub async fn run(mut self) -> Result<(), EngineError> {
        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut stop_alive = true;

        let outcome = loop {
            if self.inventory.is_complete() {
                break Ok(());
            }
            tokio::select! {
                _ = tick.tick() => {
                    self.sweep_timeouts();
                    if self.inventory.is_complete() {
                        break Ok(());
                    }
                    self.dispatch_all().await;
                    self.publish_progress();
                }
                event = self.events.recv() => {
                    match event {
                        Some(event) => {
                            if let Err(error) = self.handle_event(event).await {
                                break Err(error);
                            }
                        }
                        // Every event sender is gone: no peers remain and
                        // none will come back.
                        None => {
                            break if self.inventory.is_complete() {
                                Ok(())
                            } else {
                                Err(EngineError::NoPeers)
                            };
                        }
                    }
                }
                changed = self.stop.changed(), if stop_alive => {
                    match changed {
                        Ok(()) if *self.stop.borrow() => {
                            info!("shutdown requested");
                            break Ok(());
                        }
                        Ok(()) => {}
                        // Sender gone; external stop can never fire now.
                        Err(_) => stop_alive = false,
                    }
                }
            }
        };

        let _ = self.peer_stop.send(true);
        self.publish_progress();
        self.store.flush().await?;
        outcome
    }

    async fn handle_event(&mut self, event: PeerEvent) -> Result<(), EngineError> {
        match event {
            PeerEvent::Connected { key, remote_peer_id, commands } => {
                debug!(peer = %key, remote_peer_id = %hex::encode(remote_peer_id), "peer registered");
                self.peers.insert(
                    key,
                    PeerView {
                        commands,
                        bitfield: None,
                        choked: true,
                        interested_sent: false,
                    },
                );
                self.rotation.push_back(key);
            }
            PeerEvent::Bitfield { key, bits } => {
                for (piece, &has) in bits.iter().enumerate() {
                    if has {
                        self.availability[piece] += 1;
                    }
                }
                if let Some(view) = self.peers.get_mut(&key) {
                    view.bitfield = Some(bits);
                }
                self.express_interest(key).await;
                self.dispatch_peer(key).await;
            }
            PeerEvent::Have { key, piece } => {
                let newly_set = match self.peers.get_mut(&key) {
                    Some(view) => {
                        let count = self.availability.len();
                        let bits = view.bitfield.get_or_insert_with(|| vec![false; count]);
                        let bit = &mut bits[piece as usize];
                        let fresh = !*bit;
                        *bit = true;
                        fresh
                    }
                    None => false,
                };
                if newly_set {
                    self.availability[piece as usize] += 1;
                }
                self.express_interest(key).await;
                self.dispatch_peer(key).await;
            }
            PeerEvent::Choked { key } => {
                if let Some(view) = self.peers.get_mut(&key) {
                    view.choked = true;
                }
                // Everything outstanding to this peer is abandoned.
                let removed = self.ledger.drop_peer(&key);
                self.rollback_pieces(&removed, false);
            }
            PeerEvent::Unchoked { key } => {
                if let Some(view) = self.peers.get_mut(&key) {
                    view.choked = false;
                }
                self.dispatch_peer(key).await;
            }
            PeerEvent::Block { key, piece, offset, data } => {
                self.handle_block(key, piece, offset, &data).await?;
            }
            PeerEvent::Closed { key } => {
                debug!(peer = %key, "peer link removed");
                if let Some(view) = self.peers.remove(&key) {
                    if let Some(bits) = view.bitfield {
                        for (piece, &has) in bits.iter().enumerate() {
                            if has && self.availability[piece] > 0 {
                                self.availability[piece] -= 1;
                            }
                        }
                    }
                }
                self.rotation.retain(|k| k != &key);
                let removed = self.ledger.drop_peer(&key);
                // Only in-flight-only pieces roll back; partial data stays
                // usable through other peers.
                self.rollback_pieces(&removed, true);
            }
        }
        Ok(())
    }

    async fn handle_block(
        &mut self,
        key: PeerKey,
        piece: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<(), EngineError> {
        if self.ledger.remove(&key, piece, offset).is_none() {
            debug!(peer = %key, piece, offset, "discarding stray block");
            return Ok(());
        }

        match self.inventory.accept_block(piece, offset, data) {
            Ok(AcceptOutcome::Duplicate) => {
                debug!(peer = %key, piece, offset, "duplicate block discarded");
            }
            Ok(AcceptOutcome::Progress) => {}
            Ok(AcceptOutcome::Corrupt) => {
                warn!(piece, "piece failed verification, rolling back");
                self.ledger.drop_piece(piece);
                self.inventory.reset_piece(piece);
            }
            Ok(AcceptOutcome::Verified(bytes)) => {
                match self.store.write_piece(piece, &bytes).await {
                    Ok(()) => {
                        self.store_failures = 0;
                        self.inventory.commit(piece);
                        info!(
                            piece,
                            have = self.inventory.have_count(),
                            total = self.inventory.piece_count(),
                            "piece verified and stored"
                        );
                        self.publish_progress();
                        // completion changes planner choices for every peer
                        self.dispatch_all().await;
                    }
                    Err(error) => {
                        self.store_failures += 1;
                        warn!(piece, %error, "disk write failed, resetting piece");
                        self.ledger.drop_piece(piece);
                        self.inventory.reset_piece(piece);
                        if self.store_failures >= MAX_STORE_FAILURES {
                            return Err(EngineError::Io(error));
                        }
                    }
                }
            }
            Err(error) => {
                warn!(peer = %key, piece, offset, %error, "discarding invalid block");
            }
        }

        self.dispatch_peer(key).await;
        Ok(())
    }

    /// Reset pieces whose requests were just purged. With
    /// `spare_partial`, pieces that already hold received blocks are kept
    /// in flight so another peer can finish them; without it (the choke
    /// path) affected pieces are rolled back whenever no other peer still
    /// has requests on them.
    fn rollback_pieces(&mut self, removed: &[Request], spare_partial: bool) {
        let mut pieces: Vec<u32> = removed.iter().map(|r| r.piece).collect();
        pieces.sort_unstable();
        pieces.dedup();
        for piece in pieces {
            if self.ledger.piece_has_requests(piece) {
                continue;
            }
            if spare_partial && self.inventory.has_received_blocks(piece) {
                continue;
            }
            debug!(piece, "rolling back piece");
            self.inventory.reset_piece(piece);
        }
    }

    fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let reaped = self.ledger.reap_timeouts(now, self.request_timeout);
        if reaped.is_empty() {
            return;
        }
        for request in &reaped {
            warn!(
                peer = %request.peer,
                piece = request.piece,
                offset = request.offset,
                "request timed out"
            );
            self.ledger.remove(&request.peer, request.piece, request.offset);
        }
        self.rollback_pieces(&reaped, true);
    }

    async fn express_interest(&mut self, key: PeerKey) {
        let Some(view) = self.peers.get(&key) else {
            return;
        };
        if view.interested_sent {
            return;
        }
        let Some(bits) = view.bitfield.as_ref() else {
            return;
        };
        let useful = bits.iter().enumerate().any(|(piece, &has)| {
            has && self.inventory.state(piece as u32) != Some(crate::inventory::PieceState::Have)
        });
        if !useful {
            return;
        }
        let sender = view.commands.clone();
        if sender.send(PeerCommand::Interested).await.is_ok() {
            if let Some(view) = self.peers.get_mut(&key) {
                view.interested_sent = true;
            }
        }
    }

    /// One dispatch pass over every peer, rotating the starting point so
    /// no peer is starved.
    async fn dispatch_all(&mut self) {
        if let Some(front) = self.rotation.pop_front() {
            self.rotation.push_back(front);
        }
        let order: Vec<PeerKey> = self.rotation.iter().copied().collect();
        for key in order {
            self.dispatch_peer(key).await;
        }
    }

    /// Keep issuing requests to one peer until it is saturated or the
    /// planner has nothing left for it.
    async fn dispatch_peer(&mut self, key: PeerKey) {
        loop {
            let Some(view) = self.peers.get(&key) else {
                return;
            };
            if view.choked {
                return;
            }
            let Some(bits) = view.bitfield.as_ref() else {
                return;
            };
            if !self.ledger.may_issue(&key) {
                return;
            }
            let Some(block) =
                self.inventory.plan_block(bits, &self.availability, &self.ledger)
            else {
                return;
            };
            let sender = view.commands.clone();
            let request = Request {
                peer: key,
                piece: block.piece,
                offset: block.offset,
                length: block.length,
                issued_at: Instant::now(),
            };
            if let Err(error) = self.ledger.insert(request) {
                debug!(peer = %key, %error, "planner produced unrecordable request");
                self.maybe_rollback(block.piece);
                return;
            }
            let command = PeerCommand::Request {
                piece: block.piece,
                offset: block.offset,
                length: block.length,
            };
            if sender.send(command).await.is_err() {
                // Link is going away; its Closed event finishes cleanup.
                self.ledger.remove(&key, block.piece, block.offset);
                self.maybe_rollback(block.piece);
                return;
            }
        }
    }

    /// A piece left in flight with no requests and no received blocks
    /// goes back to `Missing`.
    fn maybe_rollback(&mut self, piece: u32) {
        if !self.ledger.piece_has_requests(piece) && !self.inventory.has_received_blocks(piece) {
            self.inventory.reset_piece(piece);
        }
    }

    fn publish_progress(&self) {
        let _ = self.progress.send(self.inventory.progress());
    }
}
