//! Downloads every block of one piece from one peer.
//!
//! A `PieceDownloader` is created per (piece, peer) attempt and consumed by
//! `run`. It pipelines up to `MAX_QUEUED_BLOCKS` requests, copies arriving
//! blocks into a buffer sized to the piece, verifies the SHA-1 once every
//! block is in, writes the piece to its sink and reports exactly one
//! `DownloadResult` to the shared results queue.
//!
//! Events from the peer arrive on a single channel and are handled one at a
//! time, so none of the bookkeeping below needs locking.

use std::{collections::HashSet, fmt, future, net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::{mpsc, oneshot, watch},
};
use tracing::{debug, info, warn};

use crate::{error::DownloadError, piece::Piece, protocol::Message};

/// Maximum number of outstanding block requests per downloader
pub const MAX_QUEUED_BLOCKS: usize = 10;

/// Capacity of the per-downloader event channel
const EVENT_QUEUE: usize = 32;

/// Outbound side of a peer connection.
///
/// `send_message` is called concurrently by every downloader bound to the
/// same peer and must not block.
pub trait PeerLink: Send + Sync + 'static {
    fn addr(&self) -> SocketAddr;
    fn send_message(&self, msg: Message);
}

/// Released when dropped, telling the connection it may reuse the buffer
/// backing a block payload.
pub struct TransferSlot(Option<oneshot::Sender<()>>);

impl TransferSlot {
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), rx)
    }

    /// A slot nobody waits on
    #[cfg(test)]
    pub fn detached() -> Self {
        Self(None)
    }
}

impl Drop for TransferSlot {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

/// Payload of a `piece` message, still to be read.
pub struct BlockData {
    pub block:  u32,
    pub begin:  u32,
    pub length: u32,
    pub source: Box<dyn AsyncRead + Send + Unpin>,
    pub slot:   TransferSlot,
}

impl fmt::Debug for BlockData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockData")
            .field("block", &self.block)
            .field("begin", &self.begin)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// Everything the peer can tell a downloader.
#[derive(Debug)]
pub enum PeerEvent {
    Block(BlockData),
    /// The peer will not serve the request for this block index
    Reject(u32),
    Choke,
    Unchoke,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed(DownloadError),
    Cancelled,
}

/// The single record a downloader hands to the aggregator.
pub struct DownloadResult<P> {
    pub peer:    Arc<P>,
    pub piece:   Arc<Piece>,
    pub outcome: Outcome,
}

impl<P> fmt::Debug for DownloadResult<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadResult")
            .field("piece", &self.piece.index)
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}

/// Stops a running downloader.
///
/// `cancel` consumes the canceller: cancelling twice is not something a
/// caller can express.
#[derive(Debug)]
pub struct Canceller(watch::Sender<bool>);

impl Canceller {
    pub fn cancel(self) {
        let _ = self.0.send(true);
    }
}

/// What the spawner keeps after handing the downloader to a task.
#[derive(Debug)]
pub struct DownloaderHandle {
    pub events:    mpsc::Sender<PeerEvent>,
    pub canceller: Canceller,
}

pub struct PieceDownloader<P: PeerLink> {
    piece:      Arc<Piece>,
    peer:       Arc<P>,
    buffer:     Vec<u8>,
    next_block: usize,
    requested:  HashSet<u32>,
    done:       HashSet<u32>,
    choked:     bool,
    events:     mpsc::Receiver<PeerEvent>,
    cancel:     watch::Receiver<bool>,
    results:    mpsc::Sender<DownloadResult<P>>,
}

impl<P: PeerLink> PieceDownloader<P> {
    pub fn new(
        piece:   Arc<Piece>,
        peer:    Arc<P>,
        results: mpsc::Sender<DownloadResult<P>>,
    ) -> (Self, DownloaderHandle) {
        let (events_tx, events) = mpsc::channel(EVENT_QUEUE);
        let (cancel_tx, cancel) = watch::channel(false);

        let downloader = Self {
            buffer: vec![0u8; piece.length as usize],
            piece,
            peer,
            next_block: 0,
            requested: HashSet::new(),
            done: HashSet::new(),
            choked: false,
            events,
            cancel,
            results,
        };

        let handle = DownloaderHandle {
            events:    events_tx,
            canceller: Canceller(cancel_tx),
        };

        (downloader, handle)
    }

    /// Drives the download to its end and returns how it ended.
    ///
    /// Unless cancelled, the same outcome is offered to the results queue;
    /// if cancellation wins that race the record is dropped.
    pub async fn run(mut self) -> Outcome {
        debug!(piece = self.piece.index, peer = %self.peer.addr(), "starting piece download");

        self.request_blocks();
        let outcome = if self.all_done() {
            self.finish()
        } else {
            self.event_loop().await
        };

        if outcome != Outcome::Cancelled {
            self.deliver(outcome.clone()).await;
        }
        outcome
    }

    async fn event_loop(&mut self) -> Outcome {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => return Outcome::Cancelled,
                event = self.events.recv() => event,
            };

            let Some(event) = event else {
                return Outcome::Failed(DownloadError::PeerDisconnected);
            };

            if let Some(outcome) = self.handle(event).await {
                return outcome;
            }
        }
    }

    async fn handle(&mut self, event: PeerEvent) -> Option<Outcome> {
        match event {
            PeerEvent::Block(data) => self.on_block(data).await,
            PeerEvent::Reject(block) => self.on_reject(block),
            PeerEvent::Choke => {
                debug!(piece = self.piece.index, dropped = self.requested.len(), "choked");
                self.choked = true;
                self.requested.clear();
                self.next_block = 0;
                None
            }
            PeerEvent::Unchoke => {
                debug!(piece = self.piece.index, "unchoked");
                self.choked = false;
                self.request_blocks();
                None
            }
        }
    }

    async fn on_block(&mut self, data: BlockData) -> Option<Outcome> {
        let BlockData { block, begin, length, mut source, slot } = data;

        if !self.requested.remove(&block) {
            warn!(piece = self.piece.index, block, "peer sent unrequested block");
            return Some(Outcome::Failed(DownloadError::UnrequestedBlock { block }));
        }

        let copied = self.copy_block(block, begin, length, &mut source).await;
        drop(slot);

        if let Err(reason) = copied {
            warn!(piece = self.piece.index, block, %reason, "block transfer failed");
            return Some(Outcome::Failed(DownloadError::TransferError { block, reason }));
        }

        self.done.insert(block);
        debug!(
            piece = self.piece.index,
            block,
            done = self.done.len(),
            total = self.piece.blocks.len(),
            "block received"
        );

        if self.all_done() {
            return Some(self.finish());
        }

        self.request_blocks();
        None
    }

    fn on_reject(&mut self, block: u32) -> Option<Outcome> {
        if !self.requested.remove(&block) {
            warn!(piece = self.piece.index, block, "peer rejected unrequested block");
            return Some(Outcome::Failed(DownloadError::UnrequestedReject { block }));
        }

        debug!(piece = self.piece.index, block, "request rejected");
        self.next_block = 0;
        self.request_blocks();
        None
    }

    async fn copy_block(
        &mut self,
        block:  u32,
        begin:  u32,
        length: u32,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), String> {
        let layout = self
            .piece
            .blocks
            .get(block as usize)
            .copied()
            .ok_or_else(|| format!("no block {} in piece", block))?;

        if layout.begin != begin || layout.length != length {
            return Err(format!(
                "got {} bytes at {}, expected {} at {}",
                length, begin, layout.length, layout.begin
            ));
        }

        let start = begin as usize;
        let end   = start + length as usize;
        source
            .read_exact(&mut self.buffer[start..end])
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    /// Queues requests for blocks neither done nor outstanding, starting at
    /// the cursor, until the pipeline is full.
    fn request_blocks(&mut self) {
        if self.choked {
            return;
        }

        while self.next_block < self.piece.blocks.len() && self.requested.len() < MAX_QUEUED_BLOCKS {
            let block = self.piece.blocks[self.next_block];
            self.next_block += 1;

            if self.done.contains(&block.index) || self.requested.contains(&block.index) {
                continue;
            }

            self.requested.insert(block.index);
            self.peer.send_message(Message::Request {
                index:  self.piece.index,
                begin:  block.begin,
                length: block.length,
            });
        }
    }

    fn all_done(&self) -> bool {
        self.done.len() == self.piece.blocks.len()
    }

    fn finish(&self) -> Outcome {
        if !self.piece.verify_hash(&self.buffer) {
            warn!(piece = self.piece.index, peer = %self.peer.addr(), "received corrupt piece");
            return Outcome::Failed(DownloadError::CorruptPiece);
        }

        match self.piece.sink.write_piece(&self.buffer) {
            Ok(()) => {
                info!(piece = self.piece.index, bytes = self.buffer.len(), "piece verified");
                Outcome::Succeeded
            }
            Err(e) => {
                warn!(piece = self.piece.index, error = %e, "failed to write piece");
                Outcome::Failed(DownloadError::SinkWriteError(e.to_string()))
            }
        }
    }

    async fn deliver(&mut self, outcome: Outcome) {
        let result = DownloadResult {
            peer:  self.peer.clone(),
            piece: self.piece.clone(),
            outcome,
        };

        tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => {
                debug!(piece = self.piece.index, "cancelled before result was delivered");
            }
            sent = self.results.send(result) => {
                if sent.is_err() {
                    warn!(piece = self.piece.index, "result queue closed");
                }
            }
        }
    }
}

/// Resolves once cancellation was requested; never resolves if the
/// canceller was dropped without cancelling.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|c| *c).await.is_err();
    if closed {
        future::pending::<()>().await;
    }
}
