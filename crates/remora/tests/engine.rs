//! End-to-end download scenarios against scripted in-process peers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use remora::metainfo::FileEntry;
use remora::peer::pack_bitfield;
use remora::{EngineConfig, EngineError, Session, TorrentMeta};
use remora_proto::{Handshake, Message, HANDSHAKE_LEN};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;

fn sha1_of(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn content_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn build_meta(content: &[u8], piece_length: u32, files: Vec<(u64, &str)>) -> TorrentMeta {
    let entries: Vec<FileEntry> = files
        .into_iter()
        .map(|(length, name)| FileEntry {
            length,
            path: vec![name.to_string()],
        })
        .collect();
    let hashes: Vec<[u8; 20]> = content
        .chunks(piece_length as usize)
        .map(sha1_of)
        .collect();
    TorrentMeta::from_parts(
        "http://127.0.0.1:1/announce".into(),
        "scenario".into(),
        sha1_of(content),
        piece_length,
        hashes,
        entries,
    )
    .unwrap()
}

fn fast_config(dir: &std::path::Path) -> EngineConfig {
    let mut config = EngineConfig::new(dir);
    config.tick_interval = Duration::from_millis(25);
    config.request_timeout = Duration::from_secs(30);
    config.connect_timeout = Duration::from_secs(2);
    config.handshake_timeout = Duration::from_secs(2);
    config
}

/// How a scripted peer answers block requests.
#[derive(Clone)]
enum ServeRule {
    /// Serve every request faithfully.
    Honest,
    /// Serve faithfully but flip a byte in the block at this offset for
    /// the first `close_after` answers, then drop the connection.
    CorruptThenClose { corrupt_offset: u32, close_after: usize },
    /// Serve this many requests, then send Choke and ignore the rest.
    ServeThenChoke { serve: usize },
    /// Never answer a request.
    Silent,
}

struct MockPeer {
    addr: SocketAddr,
    served: Arc<AtomicUsize>,
}

/// Spawn a one-connection scripted peer. It handshakes, sends its
/// bitfield, unchokes after `unchoke_delay`, and then serves block
/// requests according to `rule`.
async fn spawn_peer(
    content: Arc<Vec<u8>>,
    piece_length: u32,
    info_hash: [u8; 20],
    bitfield: Vec<bool>,
    unchoke_delay: Duration,
    rule: ServeRule,
) -> MockPeer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let served = Arc::new(AtomicUsize::new(0));
    let served_counter = served.clone();

    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };

        let mut hs = [0u8; HANDSHAKE_LEN];
        if stream.read_exact(&mut hs).await.is_err() {
            return;
        }
        let theirs = Handshake::decode(&hs).expect("client handshake");
        assert_eq!(theirs.info_hash, info_hash, "info-hash mismatch in test");
        let ours = Handshake::new(info_hash, *b"-MK0001-abcdefghijkl");
        if stream.write_all(&ours.encode()).await.is_err() {
            return;
        }

        let packed = pack_bitfield(&bitfield);
        if stream
            .write_all(&Message::Bitfield(Bytes::from(packed)).encode())
            .await
            .is_err()
        {
            return;
        }

        let unchoke_at = tokio::time::Instant::now() + unchoke_delay;
        let mut unchoked = false;
        let mut served_count = 0usize;
        let mut choked_them = false;
        let mut read_buf = BytesMut::new();

        loop {
            if !unchoked && tokio::time::Instant::now() >= unchoke_at {
                if stream.write_all(&Message::Unchoke.encode()).await.is_err() {
                    return;
                }
                unchoked = true;
            }

            let mut chunk = [0u8; 4096];
            let n = if unchoked {
                match stream.read(&mut chunk).await {
                    Ok(n) => n,
                    Err(_) => return,
                }
            } else {
                match tokio::time::timeout_at(unchoke_at, stream.read(&mut chunk)).await {
                    Ok(Ok(n)) => n,
                    Ok(Err(_)) => return,
                    Err(_) => continue,
                }
            };
            if n == 0 {
                return;
            }
            read_buf.extend_from_slice(&chunk[..n]);

            while let Ok(Some((message, consumed))) = Message::decode(&read_buf) {
                let _ = read_buf.split_to(consumed);
                let Message::Request { index, begin, length } = message else {
                    continue;
                };
                if choked_them {
                    continue;
                }
                let start = index as usize * piece_length as usize + begin as usize;
                let mut data = content[start..start + length as usize].to_vec();

                match &rule {
                    ServeRule::Silent => continue,
                    ServeRule::Honest => {}
                    ServeRule::CorruptThenClose { corrupt_offset, close_after } => {
                        if begin == *corrupt_offset && served_count < *close_after {
                            data[0] ^= 0xFF;
                        }
                    }
                    ServeRule::ServeThenChoke { serve } => {
                        if served_count >= *serve {
                            continue;
                        }
                    }
                }

                let piece = Message::Piece {
                    index,
                    begin,
                    data: Bytes::from(data),
                };
                if stream.write_all(&piece.encode()).await.is_err() {
                    return;
                }
                served_count += 1;
                served_counter.fetch_add(1, Ordering::SeqCst);

                match &rule {
                    ServeRule::CorruptThenClose { close_after, .. } => {
                        if served_count >= *close_after {
                            return;
                        }
                    }
                    ServeRule::ServeThenChoke { serve } => {
                        if served_count >= *serve {
                            if stream.write_all(&Message::Choke.encode()).await.is_err() {
                                return;
                            }
                            choked_them = true;
                        }
                    }
                    _ => {}
                }
            }
        }
    });

    MockPeer { addr, served }
}

async fn run_download(
    meta: TorrentMeta,
    config: EngineConfig,
    peers: &[SocketAddr],
) -> Result<(), EngineError> {
    let session = Session::new(meta, config);
    let (_stop_tx, stop_rx) = watch::channel(false);
    timeout(Duration::from_secs(20), session.download(peers, stop_rx))
        .await
        .expect("download did not finish in time")
}

#[tokio::test]
async fn single_peer_happy_path() {
    let content = Arc::new(content_bytes(100));
    let meta = build_meta(&content, 100, vec![(100, "payload.bin")]);
    let dir = tempfile::tempdir().unwrap();

    let peer = spawn_peer(
        content.clone(),
        100,
        meta.info_hash(),
        vec![true],
        Duration::ZERO,
        ServeRule::Honest,
    )
    .await;

    run_download(meta, fast_config(dir.path()), &[peer.addr])
        .await
        .unwrap();

    let written = std::fs::read(dir.path().join("payload.bin")).unwrap();
    assert_eq!(written, *content);
    assert_eq!(peer.served.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn corrupt_piece_is_refetched_from_second_peer() {
    // One piece of four blocks; peer A flips a byte in block 2 and hangs
    // up after the first full round, peer B serves clean data.
    let content = Arc::new(content_bytes(65536));
    let meta = build_meta(&content, 65536, vec![(65536, "payload.bin")]);
    let dir = tempfile::tempdir().unwrap();

    let peer_a = spawn_peer(
        content.clone(),
        65536,
        meta.info_hash(),
        vec![true],
        Duration::ZERO,
        ServeRule::CorruptThenClose { corrupt_offset: 32768, close_after: 4 },
    )
    .await;
    let peer_b = spawn_peer(
        content.clone(),
        65536,
        meta.info_hash(),
        vec![true],
        Duration::from_millis(600),
        ServeRule::Honest,
    )
    .await;

    run_download(meta, fast_config(dir.path()), &[peer_a.addr, peer_b.addr])
        .await
        .unwrap();

    let written = std::fs::read(dir.path().join("payload.bin")).unwrap();
    assert_eq!(written, *content);
    assert_eq!(peer_b.served.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn blocks_are_never_requested_twice() {
    // One piece of three blocks split across two willing peers: exactly
    // three block transfers happen in total.
    let content = Arc::new(content_bytes(49152));
    let meta = build_meta(&content, 49152, vec![(49152, "payload.bin")]);
    let dir = tempfile::tempdir().unwrap();

    let peer_a = spawn_peer(
        content.clone(),
        49152,
        meta.info_hash(),
        vec![true],
        Duration::ZERO,
        ServeRule::Honest,
    )
    .await;
    let peer_b = spawn_peer(
        content.clone(),
        49152,
        meta.info_hash(),
        vec![true],
        Duration::ZERO,
        ServeRule::Honest,
    )
    .await;

    run_download(meta, fast_config(dir.path()), &[peer_a.addr, peer_b.addr])
        .await
        .unwrap();

    let written = std::fs::read(dir.path().join("payload.bin")).unwrap();
    assert_eq!(written, *content);
    let total = peer_a.served.load(Ordering::SeqCst) + peer_b.served.load(Ordering::SeqCst);
    assert_eq!(total, 3);
}

#[tokio::test]
async fn timed_out_request_is_reassigned() {
    // Peer A accepts the request and never answers; after the request
    // timeout the block must land via peer B.
    let content = Arc::new(content_bytes(16384));
    let meta = build_meta(&content, 16384, vec![(16384, "payload.bin")]);
    let dir = tempfile::tempdir().unwrap();

    let mut config = fast_config(dir.path());
    config.request_timeout = Duration::from_millis(410);

    let peer_a = spawn_peer(
        content.clone(),
        16384,
        meta.info_hash(),
        vec![true],
        Duration::ZERO,
        ServeRule::Silent,
    )
    .await;
    let peer_b = spawn_peer(
        content.clone(),
        16384,
        meta.info_hash(),
        vec![true],
        Duration::from_millis(800),
        ServeRule::Honest,
    )
    .await;

    run_download(meta, config, &[peer_a.addr, peer_b.addr])
        .await
        .unwrap();

    let written = std::fs::read(dir.path().join("payload.bin")).unwrap();
    assert_eq!(written, *content);
    assert_eq!(peer_a.served.load(Ordering::SeqCst), 0);
    assert_eq!(peer_b.served.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn choke_mid_piece_rolls_back_and_reassigns() {
    // Peer A serves one block of a four-block piece and then chokes;
    // the piece is rolled back and fully served by peer B.
    let content = Arc::new(content_bytes(65536));
    let meta = build_meta(&content, 65536, vec![(65536, "payload.bin")]);
    let dir = tempfile::tempdir().unwrap();

    let peer_a = spawn_peer(
        content.clone(),
        65536,
        meta.info_hash(),
        vec![true],
        Duration::ZERO,
        ServeRule::ServeThenChoke { serve: 1 },
    )
    .await;
    let peer_b = spawn_peer(
        content.clone(),
        65536,
        meta.info_hash(),
        vec![true],
        Duration::from_millis(600),
        ServeRule::Honest,
    )
    .await;

    run_download(meta, fast_config(dir.path()), &[peer_a.addr, peer_b.addr])
        .await
        .unwrap();

    let written = std::fs::read(dir.path().join("payload.bin")).unwrap();
    assert_eq!(written, *content);
    assert_eq!(peer_a.served.load(Ordering::SeqCst), 1);
    assert_eq!(peer_b.served.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn multi_file_piece_boundary() {
    // Files of 100 and 50 bytes with piece length 80: piece 1 spans the
    // file boundary and both files must receive their exact bytes.
    let content = Arc::new(content_bytes(150));
    let meta = build_meta(&content, 80, vec![(100, "a.bin"), (50, "b.bin")]);
    let dir = tempfile::tempdir().unwrap();

    let peer = spawn_peer(
        content.clone(),
        80,
        meta.info_hash(),
        vec![true, true],
        Duration::ZERO,
        ServeRule::Honest,
    )
    .await;

    run_download(meta, fast_config(dir.path()), &[peer.addr])
        .await
        .unwrap();

    let base = dir.path().join("scenario");
    let a = std::fs::read(base.join("a.bin")).unwrap();
    let b = std::fs::read(base.join("b.bin")).unwrap();
    assert_eq!(a, content[..100]);
    assert_eq!(b, content[100..]);
    assert_eq!(peer.served.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn no_reachable_peer_is_fatal() {
    let content = Arc::new(content_bytes(100));
    let meta = build_meta(&content, 100, vec![(100, "payload.bin")]);
    let dir = tempfile::tempdir().unwrap();

    // A listener that accepts and immediately closes: handshake fails.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });

    let result = run_download(meta, fast_config(dir.path()), &[addr]).await;
    assert!(matches!(result, Err(EngineError::NoPeers)));
}

#[tokio::test]
async fn external_stop_interrupts_download() {
    // Peer never unchokes; the stop signal must end the run cleanly.
    let content = Arc::new(content_bytes(100));
    let meta = build_meta(&content, 100, vec![(100, "payload.bin")]);
    let dir = tempfile::tempdir().unwrap();

    let peer = spawn_peer(
        content.clone(),
        100,
        meta.info_hash(),
        vec![true],
        Duration::from_secs(60),
        ServeRule::Silent,
    )
    .await;

    let session = Session::new(meta, fast_config(dir.path()));
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = stop_tx.send(true);
    });

    timeout(
        Duration::from_secs(10),
        session.download(&[peer.addr], stop_rx),
    )
    .await
    .expect("stop was not honored")
    .unwrap();
}
