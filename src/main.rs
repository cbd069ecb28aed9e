use crate::{
    downloader::{Canceller, DownloadResult, Outcome, PeerLink, PieceDownloader},
    error::ApplicationError,
    manager::PieceManager,
    peer::{Peer, PeerConnection, PeerHandle},
    piece::{FileSink, Piece, PieceSink},
    torrent::Torrent,
    tracker::Tracker,
};

use futures::{StreamExt, stream};
use std::{
    collections::HashMap,
    fs::OpenOptions,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::mpsc, task};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod compact;
mod downloader;
mod error;
mod manager;
mod peer;
mod piece;
mod protocol;
mod torrent;
mod tracker;

const BLOCK_SIZE: u32         = 16 * 1024;
const CONCURRENCY: usize      = 10;
const PIECES_PER_PEER: usize  = 4;
const RESULT_QUEUE: usize     = 64;
const LISTEN_PORT: u16        = 6881;
const IDLE_WAIT: Duration     = Duration::from_secs(1);
const MAX_IDLE_ROUNDS: usize  = 30;
const CHOKE_TIMEOUT: Duration = Duration::from_secs(20);
const PEER_ID: [u8; 20]       = *b"-RU0001-123456789010";

#[tokio::main]
async fn main() -> Result<(), ApplicationError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let path     = args.next().unwrap_or_else(|| "test.torrent".to_string());

    // Load torrent file and fetch the peers
    let torrent = Torrent::from_file(&path)?;
    torrent.log_info();
    let output = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&torrent.info.name));

    let peers = Tracker.announce(&torrent, PEER_ID, LISTEN_PORT).await?;
    if peers.is_empty() {
        return Err(ApplicationError::ProtocolError("no peers".into()));
    }
    info!(count = peers.len(), "tracker returned peers");

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&output)
        .map_err(|e| ApplicationError::WorkerError(format!("{}: {}", output.display(), e)))?;
    file.set_len(torrent.total_size() as u64)
        .map_err(|e| ApplicationError::WorkerError(e.to_string()))?;
    let file = Arc::new(Mutex::new(file));

    let manager = PieceManager::new(&torrent, BLOCK_SIZE, |_, offset| {
        Arc::new(FileSink::new(file.clone(), offset)) as Arc<dyn PieceSink>
    })?;

    let connections = connect_all(peers, torrent.info_hash()).await;
    if connections.is_empty() {
        return Err(ApplicationError::PeerError("could not connect to any peer".into()));
    }

    download_loop(manager, connections).await?;

    info!(output = %output.display(), "download complete");
    Ok(())
}

/// Connects to up to `CONCURRENCY` peers at a time and starts their read loops.
async fn connect_all(peers: Vec<Peer>, info_hash: [u8; 20]) -> Vec<Arc<PeerHandle>> {
    stream::iter(peers)
        .map(|peer| async move {
            let addr = peer.addr();
            match PeerConnection::connect(peer, info_hash, PEER_ID).await {
                Ok((handle, conn)) => {
                    info!(peer = %addr, "connected");
                    task::spawn(async move {
                        if let Err(e) = conn.run().await {
                            warn!(peer = %addr, error = %e, "connection failed");
                        }
                    });
                    Some(handle)
                }
                Err(e) => {
                    warn!(peer = %addr, error = %e, "could not connect");
                    None
                }
            }
        })
        .buffer_unordered(CONCURRENCY)
        .filter_map(|handle| async move { handle })
        .collect()
        .await
}

/// Keeps every unchoked peer busy with up to `PIECES_PER_PEER` downloaders
/// and feeds their results back into the manager.
///
/// Peers are rescanned on every result and at least every `IDLE_WAIT`.
/// Downloads on a peer that has choked us for `CHOKE_TIMEOUT` go back to
/// the queue.
async fn download_loop(
    mut manager: PieceManager,
    peers:       Vec<Arc<PeerHandle>>,
) -> Result<(), ApplicationError> {
    let (results_tx, mut results_rx) = mpsc::channel(RESULT_QUEUE);
    let mut active: HashMap<(SocketAddr, u32), Canceller> = HashMap::new();
    let mut idle_rounds = 0;

    loop {
        for peer in &peers {
            if peer.choked_for().is_some_and(|d| d >= CHOKE_TIMEOUT) {
                release_peer(&mut manager, &mut active, peer);
            }
        }

        for peer in &peers {
            let addr = peer.addr();
            if peer.is_closed() || peer.is_choking() || manager.is_banned(addr) {
                continue;
            }

            while active.keys().filter(|(a, _)| *a == addr).count() < PIECES_PER_PEER {
                let Some(piece) = manager.next_piece(addr, |i| peer.has_piece(i)) else {
                    break;
                };
                let index     = piece.index;
                let canceller = spawn_downloader(piece, peer.clone(), results_tx.clone());
                active.insert((addr, index), canceller);
            }
        }

        if manager.is_complete() {
            return Ok(());
        }

        if active.is_empty() {
            idle_rounds += 1;
            if idle_rounds > MAX_IDLE_ROUNDS {
                return Err(ApplicationError::WorkerError(format!(
                    "no peer can serve the remaining {} pieces",
                    manager.remaining()
                )));
            }
            tokio::time::sleep(IDLE_WAIT).await;
            continue;
        }
        idle_rounds = 0;

        tokio::select! {
            result = results_rx.recv() => {
                let Some(result) = result else {
                    return Err(ApplicationError::WorkerError("result queue closed".into()));
                };
                handle_result(&mut manager, &mut active, result);
            }
            _ = tokio::time::sleep(IDLE_WAIT) => {}
        }
    }
}

fn spawn_downloader(
    piece:   Arc<Piece>,
    peer:    Arc<PeerHandle>,
    results: mpsc::Sender<DownloadResult<PeerHandle>>,
) -> Canceller {
    let (downloader, handle) = PieceDownloader::new(piece.clone(), peer.clone(), results);
    peer.register(piece, handle.events);
    task::spawn(downloader.run());
    handle.canceller
}

fn handle_result(
    manager: &mut PieceManager,
    active:  &mut HashMap<(SocketAddr, u32), Canceller>,
    result:  DownloadResult<PeerHandle>,
) {
    let addr  = result.peer.addr();
    let index = result.piece.index;

    // The piece may already be back in the queue or with another peer.
    if active.remove(&(addr, index)).is_none() && result.outcome != Outcome::Succeeded {
        debug!(piece = index, peer = %addr, outcome = ?result.outcome, "ignoring stale result");
        return;
    }
    result.peer.deregister(index);

    if manager.handle_result(&result) {
        warn!(peer = %addr, "banning peer after protocol violation");
        release_peer(manager, active, &result.peer);
    }
}

/// Cancels every download running on `peer` and requeues its pieces.
fn release_peer(
    manager: &mut PieceManager,
    active:  &mut HashMap<(SocketAddr, u32), Canceller>,
    peer:    &PeerHandle,
) {
    let addr = peer.addr();
    let owned: Vec<_> = active.keys().filter(|(a, _)| *a == addr).copied().collect();
    if !owned.is_empty() {
        debug!(peer = %addr, count = owned.len(), "releasing downloads");
    }
    for key in owned {
        if let Some(canceller) = active.remove(&key) {
            canceller.cancel();
            peer.deregister(key.1);
            manager.requeue(key.1);
        }
    }
}
