use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use remora::{EngineConfig, EngineError, Session, TorrentMeta};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "remora", about = "Leech-only BitTorrent client", version)]
struct Args {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// Directory to download into
    #[arg(default_value = ".")]
    output_dir: PathBuf,

    /// Port reported to the tracker
    #[arg(long, env = "REMORA_PORT", default_value_t = 6881)]
    port: u16,

    /// How many peers to request from the tracker
    #[arg(long, default_value_t = 50)]
    numwant: u32,
}

async fn run(args: Args) -> Result<(), EngineError> {
    let meta = TorrentMeta::load(&args.torrent)?;
    info!(
        name = meta.name(),
        size = meta.total_length(),
        pieces = meta.piece_count(),
        announce = meta.announce(),
        "torrent loaded"
    );

    let mut config = EngineConfig::new(&args.output_dir);
    config.port = args.port;
    config.numwant = args.numwant;

    let session = Session::new(meta, config);
    let peers = session.announce().await?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        let _ = stop_tx.send(true);
    });

    let final_progress = session.progress();

    // Periodic progress report while the download runs.
    let mut progress = session.progress();
    let reporter = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        tick.tick().await;
        loop {
            tick.tick().await;
            if progress.changed().await.is_err() {
                break;
            }
            let snapshot = progress.borrow_and_update().clone();
            info!(
                percent = format!("{:.1}", snapshot.percent()),
                pieces = format!("{}/{}", snapshot.pieces_have, snapshot.pieces_total),
                rate_kibps = format!("{:.1}", snapshot.rate() / 1024.0),
                "progress"
            );
        }
    });

    let result = session.download(&peers, stop_rx).await;
    reporter.abort();
    result?;

    let snapshot = final_progress.borrow().clone();
    if snapshot.pieces_have == snapshot.pieces_total {
        info!(
            bytes = snapshot.bytes_downloaded,
            "download complete"
        );
    } else {
        info!(
            pieces = format!("{}/{}", snapshot.pieces_have, snapshot.pieces_total),
            "stopped before completion"
        );
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!(error = %e, "fatal");
        std::process::exit(1);
    }
}
