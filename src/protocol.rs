use byteorder::{BigEndian, ReadBytesExt};
use std::io::{self, Read};

use crate::error::ApplicationError;

/// The BitTorrent protocol identifier string
pub const PROTOCOL_STR: &str = "BitTorrent protocol";

/// Length of the full handshake message (always 68 bytes)
pub const HANDSHAKE_LEN: usize = 68;

/// Reserved-bits flag advertising the fast extension (BEP 6), which is
/// what gives us `reject` messages.
const FAST_EXTENSION: u8 = 0x04;

/// Upper bound on a single frame; a 16 KiB block plus headers fits easily.
pub const MAX_FRAME_LEN: u32 = 1 << 17;

/// The first 68 bytes exchanged on a connection.
pub struct Handshake {
    /// SHA-1 hash of the info dictionary from the .torrent file
    pub info_hash: [u8; 20],
    /// 20-byte string used to identify the client
    pub peer_id: [u8; 20],
    /// Whether the sender supports the fast extension
    pub fast: bool,
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id, fast: true }
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_STR.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_STR.as_bytes());
        if self.fast {
            buf[27] |= FAST_EXTENSION;
        }
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ApplicationError> {
        if buf.len() != HANDSHAKE_LEN {
            return Err(ApplicationError::ParserError(format!(
                "invalid handshake length {}",
                buf.len()
            )));
        }

        if buf[0] as usize != PROTOCOL_STR.len() || &buf[1..20] != PROTOCOL_STR.as_bytes() {
            return Err(ApplicationError::ParserError(
                "invalid protocol string".into(),
            ));
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self {
            info_hash,
            peer_id,
            fast: buf[27] & FAST_EXTENSION != 0,
        })
    }
}

/// Messages exchanged after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    /// Fast extension: the peer will not serve a previously sent request
    Reject { index: u32, begin: u32, length: u32 },
}

impl Message {
    fn id(&self) -> u8 {
        match self {
            Message::Choke              => 0,
            Message::Unchoke            => 1,
            Message::Interested         => 2,
            Message::NotInterested      => 3,
            Message::Have(_)            => 4,
            Message::Bitfield(_)        => 5,
            Message::Request { .. }     => 6,
            Message::Piece { .. }       => 7,
            Message::Cancel { .. }      => 8,
            Message::Reject { .. }      => 16,
        }
    }

    /// Serializes the message with its 4-byte length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have(index) => payload.extend_from_slice(&index.to_be_bytes()),
            Message::Bitfield(bitfield) => payload.extend_from_slice(bitfield),
            Message::Request { index, begin, length }
            | Message::Cancel { index, begin, length }
            | Message::Reject { index, begin, length } => {
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece { index, begin, block } => {
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
            }
        }

        let mut buf = Vec::with_capacity(5 + payload.len());
        buf.extend_from_slice(&(1 + payload.len() as u32).to_be_bytes());
        buf.push(self.id());
        buf.extend_from_slice(&payload);
        buf
    }

    /// Parses one length-prefixed frame.
    ///
    /// Returns `Ok(None)` for a keep-alive (length 0).
    pub fn decode(mut buf: &[u8]) -> Result<Option<Self>, ApplicationError> {
        let len = buf.read_u32::<BigEndian>().map_err(parse_error)?;
        if len == 0 {
            return Ok(None);
        }

        if buf.len() < len as usize {
            return Err(ApplicationError::ParserError(
                "incomplete message data".into(),
            ));
        }

        let id = buf.read_u8().map_err(parse_error)?;
        let payload_len = len as usize - 1;

        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                expect_len("have", payload_len, 4)?;
                Message::Have(buf.read_u32::<BigEndian>().map_err(parse_error)?)
            }
            5 => {
                let mut bitfield = vec![0u8; payload_len];
                buf.read_exact(&mut bitfield).map_err(parse_error)?;
                Message::Bitfield(bitfield)
            }
            6 | 8 | 16 => {
                expect_len("request", payload_len, 12)?;
                let (index, begin, length) = read_triple(&mut buf)?;
                match id {
                    6 => Message::Request { index, begin, length },
                    8 => Message::Cancel { index, begin, length },
                    _ => Message::Reject { index, begin, length },
                }
            }
            7 => {
                if payload_len < 8 {
                    return Err(ApplicationError::ParserError(
                        "invalid piece message length".into(),
                    ));
                }
                let index = buf.read_u32::<BigEndian>().map_err(parse_error)?;
                let begin = buf.read_u32::<BigEndian>().map_err(parse_error)?;
                let mut block = vec![0u8; payload_len - 8];
                buf.read_exact(&mut block).map_err(parse_error)?;
                Message::Piece { index, begin, block }
            }
            _ => {
                return Err(ApplicationError::ParserError(format!(
                    "unknown message id: {}",
                    id
                )));
            }
        };

        Ok(Some(msg))
    }
}

fn parse_error(e: io::Error) -> ApplicationError {
    ApplicationError::ParserError(format!("protocol: {}", e))
}

fn expect_len(kind: &str, actual: usize, expected: usize) -> Result<(), ApplicationError> {
    if actual != expected {
        return Err(ApplicationError::ParserError(format!(
            "invalid {} message length {}",
            kind, actual
        )));
    }
    Ok(())
}

fn read_triple(buf: &mut &[u8]) -> Result<(u32, u32, u32), ApplicationError> {
    let index  = buf.read_u32::<BigEndian>().map_err(parse_error)?;
    let begin  = buf.read_u32::<BigEndian>().map_err(parse_error)?;
    let length = buf.read_u32::<BigEndian>().map_err(parse_error)?;
    Ok((index, begin, length))
}
