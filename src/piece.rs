use sha1::{Digest, Sha1};
use std::{
    fmt,
    fs::File,
    io::{self, Seek, SeekFrom, Write},
    sync::{Arc, Mutex},
};

/// A contiguous block of data within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// Position of the block inside the piece (0-based, dense)
    pub index: u32,
    /// Offset (in bytes) from the start of the piece
    pub begin: u32,
    /// Length of the block in bytes
    pub length: u32,
}

/// Destination of a verified piece.
///
/// A downloader calls `write_piece` at most once, and only after the
/// assembled bytes matched the expected digest.
pub trait PieceSink: Send + Sync {
    fn write_piece(&self, data: &[u8]) -> io::Result<()>;
}

/// A piece of the torrent file, composed of one or more blocks
pub struct Piece {
    /// Index of the piece (0-based)
    pub index: u32,
    /// Total length of the piece in bytes
    pub length: u32,
    /// Blocks that make up this piece, ordered by `begin`
    pub blocks: Vec<Block>,
    /// SHA-1 of the assembled piece
    pub hash: [u8; 20],
    /// Where the verified bytes go
    pub sink: Arc<dyn PieceSink>,
}

impl fmt::Debug for Piece {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Piece")
            .field("index", &self.index)
            .field("length", &self.length)
            .field("blocks", &self.blocks.len())
            .field("hash", &hex::encode(self.hash))
            .finish()
    }
}

impl Piece {
    /// Splits `[0, length)` into `block_size` blocks; the last one may be shorter.
    pub fn layout(
        index:      u32,
        length:     u32,
        hash:       [u8; 20],
        block_size: u32,
        sink:       Arc<dyn PieceSink>,
    ) -> Self {
        let blocks = (0..length)
            .step_by(block_size.max(1) as usize)
            .enumerate()
            .map(|(i, begin)| Block {
                index:  i as u32,
                begin,
                length: block_size.min(length - begin),
            })
            .collect();

        Self {
            index,
            length,
            blocks,
            hash,
            sink,
        }
    }

    /// Returns the block starting at `begin`, if any
    pub fn block_at(&self, begin: u32) -> Option<&Block> {
        self.blocks
            .binary_search_by_key(&begin, |b| b.begin)
            .ok()
            .map(|i| &self.blocks[i])
    }

    /// Returns the block at `begin` only if its length matches as well
    pub fn block_for(&self, begin: u32, length: u32) -> Option<&Block> {
        self.block_at(begin).filter(|b| b.length == length)
    }

    pub fn verify_hash(&self, data: &[u8]) -> bool {
        Sha1::digest(data).as_slice() == self.hash
    }
}

/// Keeps the written piece in memory
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemorySink {
    data:   Mutex<Option<Vec<u8>>>,
    writes: Mutex<usize>,
}

#[cfg(test)]
impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last written buffer, `None` if nothing was written
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.data.lock().ok().and_then(|d| d.clone())
    }

    pub fn writes(&self) -> usize {
        self.writes.lock().map(|w| *w).unwrap_or(0)
    }
}

#[cfg(test)]
impl PieceSink for MemorySink {
    fn write_piece(&self, data: &[u8]) -> io::Result<()> {
        let mut slot = self
            .data
            .lock()
            .map_err(|_| io::Error::other("memory sink poisoned"))?;
        *slot = Some(data.to_vec());
        if let Ok(mut writes) = self.writes.lock() {
            *writes += 1;
        }
        Ok(())
    }
}

/// Writes a piece at a fixed offset of a shared output file
#[derive(Debug, Clone)]
pub struct FileSink {
    file:   Arc<Mutex<File>>,
    offset: u64,
}

impl FileSink {
    pub fn new(file: Arc<Mutex<File>>, offset: u64) -> Self {
        Self { file, offset }
    }
}

impl PieceSink for FileSink {
    fn write_piece(&self, data: &[u8]) -> io::Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("output file lock poisoned"))?;
        file.seek(SeekFrom::Start(self.offset))?;
        file.write_all(data)?;
        file.flush()
    }
}
