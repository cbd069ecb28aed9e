use std::{
    collections::{HashMap, HashSet},
    io::Cursor,
    net::{IpAddr, SocketAddr, SocketAddrV4},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::mpsc,
    time::{Instant, timeout},
};
use tracing::{debug, warn};

use crate::{
    downloader::{BlockData, PeerEvent, PeerLink, TransferSlot},
    error::ApplicationError,
    piece::Piece,
    protocol::{HANDSHAKE_LEN, Handshake, MAX_FRAME_LEN, Message},
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Represents a peer in the BitTorrent network
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    pub ip:   IpAddr,
    pub port: u16,
}

impl Peer {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddrV4> for Peer {
    fn from(addr: SocketAddrV4) -> Self {
        Peer {
            ip:   IpAddr::V4(*addr.ip()),
            port: addr.port(),
        }
    }
}

/// A downloader listening on this connection for one piece
struct Route {
    piece:  Arc<Piece>,
    events: mpsc::Sender<PeerEvent>,
}

/// `(index, begin, length)` of a block request
type RequestKey = (u32, u32, u32);

#[derive(Default)]
struct LinkState {
    routes:       HashMap<u32, Route>,
    available:    HashSet<u32>,
    choking:      bool,
    choked_since: Option<Instant>,
    closed:       bool,
    /// Requests sent and not yet answered
    pending:      HashSet<RequestKey>,
    /// Requests a choke took from the downloaders while the peer may still
    /// answer them (fast extension)
    voided:       HashSet<RequestKey>,
}

/// The shared side of a connection: the outbound queue plus what we know
/// about the remote peer. Downloaders hold it as their `PeerLink`.
pub struct PeerHandle {
    peer:     Peer,
    /// Both sides announced the fast extension
    fast:     bool,
    outbound: mpsc::UnboundedSender<Message>,
    state:    Mutex<LinkState>,
}

impl PeerHandle {
    pub(crate) fn new(peer: Peer, fast: bool, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            peer,
            fast,
            outbound,
            state: Mutex::new(LinkState {
                choking: true,
                choked_since: Some(Instant::now()),
                ..LinkState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.state().available.contains(&index)
    }

    pub fn is_choking(&self) -> bool {
        self.state().choking
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// How long the peer has been choking us, `None` while unchoked.
    pub fn choked_for(&self) -> Option<Duration> {
        self.state().choked_since.map(|since| since.elapsed())
    }

    /// Routes wire events for `piece` to a downloader.
    ///
    /// On a closed connection the sender is dropped right away, so the
    /// downloader sees the disconnect instead of waiting forever.
    pub fn register(&self, piece: Arc<Piece>, events: mpsc::Sender<PeerEvent>) {
        let mut state = self.state();
        if state.closed {
            return;
        }
        state.routes.insert(piece.index, Route { piece, events });
    }

    pub fn deregister(&self, index: u32) {
        let mut state = self.state();
        state.routes.remove(&index);
        state.pending.retain(|&(i, _, _)| i != index);
        state.voided.retain(|&(i, _, _)| i != index);
    }

    fn route(&self, index: u32) -> Option<(Arc<Piece>, mpsc::Sender<PeerEvent>)> {
        self.state()
            .routes
            .get(&index)
            .map(|r| (r.piece.clone(), r.events.clone()))
    }

    /// Records the peer's choke state and returns the downloaders to tell.
    ///
    /// A choke makes every downloader forget its outstanding requests. With
    /// the fast extension the peer still answers them, so they are kept as
    /// voided until that answer arrives.
    pub(crate) fn set_choking(&self, choking: bool) -> Vec<mpsc::Sender<PeerEvent>> {
        let mut state = self.state();
        if choking {
            let pending = std::mem::take(&mut state.pending);
            if self.fast {
                state.voided.extend(pending);
            }
            if !state.choking {
                state.choked_since = Some(Instant::now());
            }
        } else {
            state.choked_since = None;
        }
        state.choking = choking;
        state.routes.values().map(|r| r.events.clone()).collect()
    }

    /// Matches a block or reject from the peer against our requests.
    /// Returns `false` when it answers a request voided by a choke, in which
    /// case no downloader is waiting for it.
    fn settle(&self, key: RequestKey) -> bool {
        let mut state = self.state();
        if state.voided.remove(&key) {
            return false;
        }
        state.pending.remove(&key);
        true
    }

    pub(crate) fn mark_available(&self, pieces: impl IntoIterator<Item = u32>) {
        self.state().available.extend(pieces);
    }

    fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.routes.clear();
        state.pending.clear();
        state.voided.clear();
    }
}

impl PeerLink for PeerHandle {
    fn addr(&self) -> SocketAddr {
        self.peer.addr()
    }

    fn send_message(&self, msg: Message) {
        if let Message::Request { index, begin, length } = msg {
            self.state().pending.insert((index, begin, length));
        }
        if self.outbound.send(msg).is_err() {
            debug!(peer = %self.peer.addr(), "dropping message for closed connection");
        }
    }
}

/// Inbound side of a connection; `run` turns wire messages into events
/// for the registered downloaders.
pub struct PeerConnection {
    handle: Arc<PeerHandle>,
    reader: BufReader<ReadHalf<TcpStream>>,
}

impl PeerConnection {
    /// Connects, exchanges handshakes, declares interest and starts the
    /// writer task.
    pub async fn connect(
        peer:      Peer,
        info_hash: [u8; 20],
        peer_id:   [u8; 20],
    ) -> Result<(Arc<PeerHandle>, Self), ApplicationError> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(peer.addr()))
            .await
            .map_err(|_| ApplicationError::PeerError(format!("{}: connect timed out", peer.addr())))?
            .map_err(|e| ApplicationError::PeerError(e.to_string()))?;

        let (rh, wh)   = tokio::io::split(stream);
        let mut reader = BufReader::new(rh);
        let mut writer = BufWriter::new(wh);

        writer
            .write_all(&Handshake::new(info_hash, peer_id).encode())
            .await
            .map_err(|e| ApplicationError::PeerError(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| ApplicationError::PeerError(e.to_string()))?;

        let mut buf = [0u8; HANDSHAKE_LEN];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|e| ApplicationError::PeerError(e.to_string()))?;

        let handshake = Handshake::decode(&buf)?;
        if handshake.info_hash != info_hash {
            return Err(ApplicationError::ProtocolError("invalid info_hash".into()));
        }
        if !handshake.fast {
            debug!(peer = %peer.addr(), "peer does not support the fast extension");
        }

        let (outbound, queue) = mpsc::unbounded_channel();
        let addr   = peer.addr();
        let handle = Arc::new(PeerHandle::new(peer, handshake.fast, outbound));
        tokio::spawn(write_loop(addr, writer, queue));

        handle.send_message(Message::Interested);

        Ok((handle.clone(), Self { handle, reader }))
    }

    /// Reads until the peer hangs up or breaks the framing. Every registered
    /// downloader loses its route when this returns.
    pub async fn run(mut self) -> Result<(), ApplicationError> {
        let result = self.read_loop().await;
        self.handle.close();
        result
    }

    async fn read_loop(&mut self) -> Result<(), ApplicationError> {
        while let Some(frame) = read_frame(&mut self.reader).await? {
            if let Some(msg) = Message::decode(&frame)? {
                self.dispatch(msg).await;
            }
        }
        debug!(peer = %self.handle.addr(), "connection closed by peer");
        Ok(())
    }

    async fn dispatch(&self, msg: Message) {
        match msg {
            Message::Choke => broadcast(self.handle.set_choking(true), || PeerEvent::Choke).await,
            Message::Unchoke => {
                broadcast(self.handle.set_choking(false), || PeerEvent::Unchoke).await
            }
            Message::Have(index) => self.handle.mark_available([index]),
            Message::Bitfield(bytes) => self.handle.mark_available(bitfield_pieces(&bytes)),
            Message::Piece { index, begin, block } => self.deliver_block(index, begin, block).await,
            Message::Reject { index, begin, length } => {
                if !self.handle.settle((index, begin, length)) {
                    debug!(piece = index, begin, "reject for request voided by choke");
                    return;
                }
                let Some((piece, events)) = self.handle.route(index) else {
                    debug!(piece = index, begin, "reject for unregistered piece");
                    return;
                };
                match piece.block_for(begin, length) {
                    Some(b) => {
                        let _ = events.send(PeerEvent::Reject(b.index)).await;
                    }
                    None => warn!(piece = index, begin, length, "reject for unknown block"),
                }
            }
            other => debug!(peer = %self.handle.addr(), message = ?other, "ignoring message"),
        }
    }

    async fn deliver_block(&self, index: u32, begin: u32, block: Vec<u8>) {
        if !self.handle.settle((index, begin, block.len() as u32)) {
            debug!(piece = index, begin, "block for request voided by choke");
            return;
        }
        let Some((piece, events)) = self.handle.route(index) else {
            debug!(piece = index, begin, "block for unregistered piece");
            return;
        };
        let Some(b) = piece.block_at(begin) else {
            warn!(piece = index, begin, "block at unknown offset");
            return;
        };

        let (slot, released) = TransferSlot::new();
        let data = BlockData {
            block:  b.index,
            begin,
            length: block.len() as u32,
            source: Box::new(Cursor::new(block)),
            slot,
        };

        if events.send(PeerEvent::Block(data)).await.is_ok() {
            let _ = released.await;
        }
    }
}

async fn broadcast(targets: Vec<mpsc::Sender<PeerEvent>>, event: impl Fn() -> PeerEvent) {
    for events in targets {
        let _ = events.send(event()).await;
    }
}

/// Returns the piece indices set in a bitfield, high bit first
fn bitfield_pieces(bytes: &[u8]) -> Vec<u32> {
    bytes
        .iter()
        .enumerate()
        .flat_map(|(i, byte)| {
            (0..8u32)
                .filter(move |bit| byte & (0b1000_0000 >> bit) != 0)
                .map(move |bit| i as u32 * 8 + bit)
        })
        .collect()
}

/// Reads one length-prefixed frame, prefix included. `None` when the peer
/// hangs up between frames.
async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, ApplicationError> {
    let mut length = [0u8; 4];
    let mut filled = 0;
    while filled < length.len() {
        let n = reader
            .read(&mut length[filled..])
            .await
            .map_err(|e| ApplicationError::PeerError(e.to_string()))?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ApplicationError::PeerError(format!(
                "connection closed after {} bytes of a frame header",
                filled
            )));
        }
        filled += n;
    }

    let size = u32::from_be_bytes(length);
    if size > MAX_FRAME_LEN {
        return Err(ApplicationError::ProtocolError(format!(
            "frame of {} bytes exceeds limit",
            size
        )));
    }

    let mut frame = vec![0u8; 4 + size as usize];
    frame[..4].copy_from_slice(&length);
    reader
        .read_exact(&mut frame[4..])
        .await
        .map_err(|e| ApplicationError::PeerError(e.to_string()))?;

    Ok(Some(frame))
}

async fn write_loop(
    addr:       SocketAddr,
    mut writer: BufWriter<WriteHalf<TcpStream>>,
    mut queue:  mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = queue.recv().await {
        if let Err(e) = writer.write_all(&msg.encode()).await {
            warn!(peer = %addr, error = %e, "write failed");
            return;
        }
        if queue.is_empty() {
            if let Err(e) = writer.flush().await {
                warn!(peer = %addr, error = %e, "flush failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::{Outcome, PieceDownloader};
    use crate::error::DownloadError;
    use crate::piece::MemorySink;
    use sha1::{Digest, Sha1};
    use tokio::net::TcpListener;

    fn handle() -> (Arc<PeerHandle>, mpsc::UnboundedReceiver<Message>) {
        fast_handle(true)
    }

    fn fast_handle(fast: bool) -> (Arc<PeerHandle>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Peer::from("10.0.0.1:6881".parse::<SocketAddrV4>().unwrap());
        (Arc::new(PeerHandle::new(peer, fast, tx)), rx)
    }

    /// A connection whose reader is never used; tests call `dispatch` directly.
    async fn connection(handle: Arc<PeerHandle>) -> PeerConnection {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stream, _) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (rh, _wh) = tokio::io::split(stream.unwrap());
        PeerConnection { handle, reader: BufReader::new(rh) }
    }

    fn digest_of(data: &[u8]) -> [u8; 20] {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&Sha1::digest(data));
        hash
    }

    async fn next_request(rx: &mut mpsc::UnboundedReceiver<Message>) -> (u32, u32) {
        match rx.recv().await {
            Some(Message::Request { index, begin, .. }) => (index, begin),
            other => panic!("expected a request, got {:?}", other),
        }
    }

    #[test]
    fn bitfield_is_msb_first() {
        assert_eq!(bitfield_pieces(&[0b1000_0001, 0b0100_0000]), vec![0, 7, 9]);
        assert!(bitfield_pieces(&[0, 0]).is_empty());
    }

    #[test]
    fn peer_from_compact_address() {
        let peer = Peer::from("192.168.1.1:6881".parse::<SocketAddrV4>().unwrap());
        assert_eq!(peer.addr(), "192.168.1.1:6881".parse().unwrap());
    }

    #[test]
    fn new_connection_is_choked() {
        let (h, _rx) = handle();
        assert!(h.is_choking());
        assert!(!h.is_closed());
        assert!(!h.has_piece(0));

        h.mark_available([3, 5]);
        assert!(h.has_piece(3));
        assert!(!h.has_piece(4));
    }

    #[test]
    fn send_message_queues_for_writer() {
        let (h, mut rx) = handle();
        h.send_message(Message::Interested);
        assert_eq!(rx.try_recv().unwrap(), Message::Interested);
    }

    #[tokio::test]
    async fn close_drops_routes() {
        let (h, _rx) = handle();
        let piece = Arc::new(Piece::layout(1, 8, [0u8; 20], 4, Arc::new(MemorySink::new())));
        let (tx, mut events) = mpsc::channel(4);

        h.register(piece.clone(), tx);
        assert!(h.route(1).is_some());

        h.close();
        assert!(h.route(1).is_none());
        assert!(events.recv().await.is_none());

        let (tx, mut late) = mpsc::channel(4);
        h.register(piece, tx);
        assert!(late.recv().await.is_none());
    }

    #[tokio::test]
    async fn choke_reaches_every_route() {
        let (h, _rx) = handle();
        let sink = Arc::new(MemorySink::new());
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        h.register(Arc::new(Piece::layout(1, 4, [0u8; 20], 4, sink.clone())), tx1);
        h.register(Arc::new(Piece::layout(2, 4, [0u8; 20], 4, sink)), tx2);

        broadcast(h.set_choking(false), || PeerEvent::Unchoke).await;
        assert!(!h.is_choking());
        assert!(matches!(rx1.recv().await, Some(PeerEvent::Unchoke)));
        assert!(matches!(rx2.recv().await, Some(PeerEvent::Unchoke)));
    }

    #[tokio::test]
    async fn rejects_after_choke_are_absorbed_with_fast_extension() {
        let (h, mut rx) = handle();
        let conn = connection(h.clone()).await;
        let content = b"abcdefgh";
        let sink = Arc::new(MemorySink::new());
        let piece = Arc::new(Piece::layout(3, 8, digest_of(content), 4, sink.clone()));

        let (results_tx, mut results) = mpsc::channel(1);
        let (downloader, dh) = PieceDownloader::new(piece.clone(), h.clone(), results_tx);
        h.register(piece, dh.events);
        let task = tokio::spawn(downloader.run());

        assert_eq!(next_request(&mut rx).await, (3, 0));
        assert_eq!(next_request(&mut rx).await, (3, 4));

        conn.dispatch(Message::Choke).await;
        conn.dispatch(Message::Reject { index: 3, begin: 0, length: 4 }).await;
        conn.dispatch(Message::Reject { index: 3, begin: 4, length: 4 }).await;
        conn.dispatch(Message::Unchoke).await;

        assert_eq!(next_request(&mut rx).await, (3, 0));
        assert_eq!(next_request(&mut rx).await, (3, 4));
        conn.dispatch(Message::Piece { index: 3, begin: 4, block: b"efgh".to_vec() }).await;
        conn.dispatch(Message::Piece { index: 3, begin: 0, block: b"abcd".to_vec() }).await;

        assert_eq!(task.await.unwrap(), Outcome::Succeeded);
        assert_eq!(results.recv().await.unwrap().outcome, Outcome::Succeeded);
        assert_eq!(sink.contents().unwrap(), content.to_vec());
    }

    #[tokio::test]
    async fn reject_after_choke_without_fast_extension_reaches_downloader() {
        let (h, mut rx) = fast_handle(false);
        let conn = connection(h.clone()).await;
        let piece = Arc::new(Piece::layout(1, 8, [0u8; 20], 4, Arc::new(MemorySink::new())));

        let (results_tx, _results) = mpsc::channel(1);
        let (downloader, dh) = PieceDownloader::new(piece.clone(), h.clone(), results_tx);
        h.register(piece, dh.events);
        let task = tokio::spawn(downloader.run());

        next_request(&mut rx).await;
        next_request(&mut rx).await;
        conn.dispatch(Message::Choke).await;
        conn.dispatch(Message::Reject { index: 1, begin: 0, length: 4 }).await;

        assert_eq!(
            task.await.unwrap(),
            Outcome::Failed(DownloadError::UnrequestedReject { block: 0 })
        );
    }

    #[test]
    fn voided_requests_are_forgotten_with_their_route() {
        let (h, _rx) = handle();
        h.send_message(Message::Request { index: 2, begin: 0, length: 4 });
        h.set_choking(true);
        h.deregister(2);
        assert!(h.settle((2, 0, 4)));
    }

    #[test]
    fn choke_duration_is_tracked() {
        let (h, _rx) = handle();
        assert!(h.choked_for().is_some());
        h.set_choking(false);
        assert!(h.choked_for().is_none());
        h.set_choking(true);
        assert!(h.choked_for().is_some());
    }

    #[tokio::test]
    async fn eof_between_frames_ends_cleanly() {
        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty).await.unwrap().is_none());

        let mut one: &[u8] = &[0, 0, 0, 1, 1];
        assert_eq!(read_frame(&mut one).await.unwrap(), Some(vec![0, 0, 0, 1, 1]));
        assert!(read_frame(&mut one).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_frame_header_is_an_error() {
        let mut truncated: &[u8] = &[0, 0];
        assert!(matches!(
            read_frame(&mut truncated).await,
            Err(ApplicationError::PeerError(_))
        ));
    }
}
