use std::net::SocketAddr;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::inventory::{PieceInventory, Progress};
use crate::ledger::RequestLedger;
use crate::metainfo::TorrentMeta;
use crate::peer::PeerLink;
use crate::piece_map::PieceMap;
use crate::scheduler::Scheduler;
use crate::store::FileStore;
use crate::tracker::http as tracker_http;
use crate::tracker::{AnnounceEvent, AnnounceRequest};

/// One download run: tracker announce, peer dialing, and the scheduler
/// that drives everything to completion.
pub struct Session {
    meta: TorrentMeta,
    config: EngineConfig,
    peer_id: [u8; 20],
    progress_tx: watch::Sender<Progress>,
    progress_rx: watch::Receiver<Progress>,
}

impl Session {
    pub fn new(meta: TorrentMeta, config: EngineConfig) -> Self {
        let (progress_tx, progress_rx) = watch::channel(Progress::default());
        Self {
            meta,
            config,
            peer_id: remora_proto::random_peer_id(),
            progress_tx,
            progress_rx,
        }
    }

    pub fn meta(&self) -> &TorrentMeta {
        &self.meta
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Live download progress; updated by the scheduler.
    pub fn progress(&self) -> watch::Receiver<Progress> {
        self.progress_rx.clone()
    }

    /// Announce to the tracker and return its peer list. Errors here are
    /// fatal for the run, including an empty peer list.
    pub async fn announce(&self) -> Result<Vec<SocketAddr>, EngineError> {
        let request = AnnounceRequest {
            info_hash: self.meta.info_hash(),
            peer_id: self.peer_id,
            port: self.config.port,
            uploaded: 0,
            downloaded: 0,
            left: self.meta.total_length(),
            numwant: self.config.numwant,
            event: Some(AnnounceEvent::Started),
        };
        let url = tracker_http::build_announce_url(self.meta.announce(), &request);
        let response = tracker_http::announce(&url).await?;
        if response.peers.is_empty() {
            return Err(EngineError::Tracker("tracker returned no peers".into()));
        }
        info!(
            interval = response.interval,
            peers = response.peers.len(),
            "tracker announce ok"
        );
        Ok(response.peers)
    }

    /// Download the torrent from `peers`, blocking until every piece is
    /// verified and persisted, `stop` is signalled, or the run fails.
    pub async fn download(
        self,
        peers: &[SocketAddr],
        stop: watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        let map = PieceMap::new(&self.meta);
        let store = FileStore::create(&self.config.output_dir, &self.meta, map).await?;
        let inventory = PieceInventory::new(&self.meta);
        let ledger = RequestLedger::new(self.config.max_requests_per_peer);

        let (events_tx, events_rx) = mpsc::channel(256);
        let (peer_stop_tx, peer_stop_rx) = watch::channel(false);
        drop(peer_stop_rx);

        let dial_targets: Vec<SocketAddr> =
            peers.iter().take(self.config.max_peers).copied().collect();
        let mut dials = JoinSet::new();
        for addr in dial_targets {
            let info_hash = self.meta.info_hash();
            let peer_id = self.peer_id;
            let piece_count = self.meta.piece_count();
            let config = self.config.clone();
            let events = events_tx.clone();
            let shutdown = peer_stop_tx.subscribe();
            dials.spawn(async move {
                match PeerLink::connect(addr, info_hash, peer_id, piece_count, &config, events)
                    .await
                {
                    Ok(link) => {
                        tokio::spawn(link.run(shutdown));
                        true
                    }
                    Err(error) => {
                        warn!(peer = %addr, %error, "could not reach peer");
                        false
                    }
                }
            });
        }
        drop(events_tx);

        let scheduler = Scheduler::new(
            inventory,
            ledger,
            store,
            events_rx,
            peer_stop_tx,
            stop,
            self.progress_tx.clone(),
            &self.config,
        );
        let engine = tokio::spawn(scheduler.run());

        let mut connected = 0usize;
        while let Some(result) = dials.join_next().await {
            if matches!(result, Ok(true)) {
                connected += 1;
            }
        }
        info!(connected, "peer dialing finished");

        engine
            .await
            .map_err(|e| EngineError::Protocol(format!("engine task failed: {e}")))?
    }
}
