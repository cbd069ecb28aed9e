use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use crate::downloader::{DownloadResult, Outcome, PeerLink};
use crate::error::ApplicationError;
use crate::piece::{Piece, PieceSink};
use crate::torrent::Torrent;

/// Hands pieces out to downloaders and collects their results.
pub struct PieceManager {
    pieces:    Vec<Arc<Piece>>,
    queue:     VecDeque<u32>,
    in_flight: HashSet<u32>,
    completed: HashSet<u32>,
    banned:    HashSet<SocketAddr>,
}

impl PieceManager {
    /// Lays out every piece of the torrent. `sink_for(index, offset)` gives
    /// the sink for the piece starting at byte `offset` of the content.
    pub fn new<F>(torrent: &Torrent, block_size: u32, sink_for: F) -> Result<Self, ApplicationError>
    where
        F: Fn(u32, u64) -> Arc<dyn PieceSink>,
    {
        let piece_length = torrent.piece_length() as u64;
        let pieces = torrent
            .piece_hashes()
            .into_iter()
            .enumerate()
            .map(|(i, hash)| {
                let index = u32::try_from(i)
                    .map_err(|_| ApplicationError::ParserError("too many pieces".into()))?;
                let sink = sink_for(index, i as u64 * piece_length);
                Ok(Arc::new(Piece::layout(
                    index,
                    torrent.piece_size(i),
                    hash,
                    block_size,
                    sink,
                )))
            })
            .collect::<Result<Vec<_>, ApplicationError>>()?;

        Ok(Self::from_pieces(pieces))
    }

    pub fn from_pieces(pieces: Vec<Arc<Piece>>) -> Self {
        let queue = pieces.iter().map(|p| p.index).collect();
        Self {
            pieces,
            queue,
            in_flight: HashSet::new(),
            completed: HashSet::new(),
            banned:    HashSet::new(),
        }
    }

    /// Takes the first queued piece the peer has, unless the peer is banned.
    pub fn next_piece(&mut self, peer: SocketAddr, has: impl Fn(u32) -> bool) -> Option<Arc<Piece>> {
        if self.banned.contains(&peer) {
            return None;
        }

        let pos   = self.queue.iter().position(|&i| has(i))?;
        let index = self.queue.remove(pos)?;
        self.in_flight.insert(index);
        self.pieces.get(index as usize).cloned()
    }

    /// Puts a piece whose downloader ended without a result back in the queue.
    pub fn requeue(&mut self, index: u32) {
        if self.in_flight.remove(&index) {
            self.queue.push_back(index);
        }
    }

    /// Records a downloader's result. Returns `true` if the peer just got
    /// banned for breaking the protocol.
    pub fn handle_result<P: PeerLink>(&mut self, result: &DownloadResult<P>) -> bool {
        let index = result.piece.index;
        let addr  = result.peer.addr();

        match &result.outcome {
            Outcome::Succeeded => {
                // A cancelled download may still have finished; drop any requeued copy.
                self.in_flight.remove(&index);
                self.queue.retain(|&i| i != index);
                self.completed.insert(index);
                info!(
                    piece = index,
                    done = self.completed.len(),
                    total = self.pieces.len(),
                    "piece complete"
                );
                false
            }
            Outcome::Failed(e) => {
                warn!(piece = index, peer = %addr, error = %e, "piece download failed");
                self.requeue(index);
                e.is_protocol_violation() && self.banned.insert(addr)
            }
            Outcome::Cancelled => {
                self.requeue(index);
                false
            }
        }
    }

    pub fn is_banned(&self, peer: SocketAddr) -> bool {
        self.banned.contains(&peer)
    }

    pub fn is_complete(&self) -> bool {
        self.completed.len() == self.pieces.len()
    }

    pub fn remaining(&self) -> usize {
        self.pieces.len() - self.completed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DownloadError;
    use crate::piece::MemorySink;
    use crate::protocol::Message;

    struct Addr(SocketAddr);

    impl PeerLink for Addr {
        fn addr(&self) -> SocketAddr {
            self.0
        }

        fn send_message(&self, _msg: Message) {}
    }

    fn manager(n: u32) -> PieceManager {
        let sink: Arc<dyn PieceSink> = Arc::new(MemorySink::new());
        PieceManager::from_pieces(
            (0..n)
                .map(|i| Arc::new(Piece::layout(i, 4, [0u8; 20], 4, sink.clone())))
                .collect(),
        )
    }

    fn result(piece: Arc<Piece>, port: u16, outcome: Outcome) -> DownloadResult<Addr> {
        DownloadResult {
            peer: Arc::new(Addr(addr(port))),
            piece,
            outcome,
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn hands_out_only_pieces_the_peer_has() {
        let mut m = manager(3);
        let p = m.next_piece(addr(1), |i| i == 2).unwrap();
        assert_eq!(p.index, 2);
        assert!(m.next_piece(addr(1), |i| i == 2).is_none());
        assert_eq!(m.next_piece(addr(1), |_| true).unwrap().index, 0);
    }

    #[test]
    fn success_completes_and_failure_requeues() {
        let mut m = manager(2);
        let a = m.next_piece(addr(1), |_| true).unwrap();
        let b = m.next_piece(addr(1), |_| true).unwrap();

        assert!(!m.handle_result(&result(a, 1, Outcome::Succeeded)));
        let failure = Outcome::Failed(DownloadError::TransferError {
            block:  0,
            reason: "eof".into(),
        });
        assert!(!m.handle_result(&result(b, 1, failure)));

        assert!(!m.is_complete());
        assert_eq!(m.remaining(), 1);
        assert_eq!(m.next_piece(addr(1), |_| true).unwrap().index, 1);
    }

    #[test]
    fn protocol_violation_bans_peer() {
        let mut m = manager(2);
        let p = m.next_piece(addr(7), |_| true).unwrap();

        let banned = m.handle_result(&result(
            p,
            7,
            Outcome::Failed(DownloadError::UnrequestedBlock { block: 0 }),
        ));
        assert!(banned);
        assert!(m.is_banned(addr(7)));
        assert!(m.next_piece(addr(7), |_| true).is_none());
        assert_eq!(m.next_piece(addr(8), |_| true).unwrap().index, 1);
    }

    #[test]
    fn requeue_ignores_pieces_not_in_flight() {
        let mut m = manager(1);
        m.requeue(0);
        let p = m.next_piece(addr(1), |_| true).unwrap();
        assert!(m.next_piece(addr(1), |_| true).is_none());
        m.requeue(p.index);
        assert_eq!(m.next_piece(addr(1), |_| true).unwrap().index, 0);
    }

    #[test]
    fn complete_after_all_pieces_succeed() {
        let mut m = manager(2);
        while let Some(p) = m.next_piece(addr(1), |_| true) {
            m.handle_result(&result(p, 1, Outcome::Succeeded));
        }
        assert!(m.is_complete());
        assert_eq!(m.remaining(), 0);
    }
}
