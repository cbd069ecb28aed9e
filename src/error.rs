/// Process-level errors raised while loading a torrent, talking to the
/// tracker or driving a peer connection.
#[derive(Debug, thiserror::Error)]
pub enum ApplicationError {
    #[error("parser error: {0}")]
    ParserError(String),
    #[error("tracker error: {0}")]
    TrackerError(String),
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("peer error: {0}")]
    PeerError(String),
    #[error("worker error: {0}")]
    WorkerError(String),
    #[error("compact peer list: {0}")]
    Compact(#[from] CompactError),
}

/// Terminal failure of a single piece download from a single peer.
///
/// Every variant ends the downloader that produced it. The scheduler decides
/// whether to retry the piece elsewhere or to stop talking to the peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DownloadError {
    #[error("peer sent unrequested block {block}")]
    UnrequestedBlock { block: u32 },
    #[error("peer rejected unrequested block {block}")]
    UnrequestedReject { block: u32 },
    #[error("transfer of block {block} failed: {reason}")]
    TransferError { block: u32, reason: String },
    #[error("received corrupt piece")]
    CorruptPiece,
    #[error("writing piece to sink failed: {0}")]
    SinkWriteError(String),
    #[error("peer disconnected before the piece completed")]
    PeerDisconnected,
}

impl DownloadError {
    /// Whether the failure is the peer breaking the wire protocol rather
    /// than a transport or local problem.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            DownloadError::UnrequestedBlock { .. }
                | DownloadError::UnrequestedReject { .. }
                | DownloadError::CorruptPiece
        )
    }
}

/// Malformed compact peer data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompactError {
    #[error("invalid compact peer length: {0}")]
    InvalidRecordLength(usize),
    #[error("invalid peer list length: {0}")]
    InvalidListLength(usize),
    #[error("address {0} is not IPv4")]
    NotIpv4(std::net::SocketAddr),
}
