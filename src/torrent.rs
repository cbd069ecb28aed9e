use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::info;

use crate::error::ApplicationError;

/// Represents a parsed .torrent file
#[derive(Debug, Serialize, Deserialize)]
pub struct Torrent {
    pub announce: String,
    pub info:     Info,
    #[serde(skip)]
    pub info_raw_bytes: Vec<u8>,
}

/// Fields inside the 'info' dictionary of a .torrent file
#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: i64,
    pub pieces: ByteBuf,
    pub length: Option<i64>,
    pub files:  Option<Vec<TorrentFile>>,
}

/// A file entry in a multi-file torrent
#[derive(Debug, Serialize, Deserialize)]
pub struct TorrentFile {
    pub length: i64,
    pub path:   Vec<String>,
}

/// Represents a file with its full path and length
#[derive(Debug)]
pub struct FileEntry {
    pub length: i64,
    pub path:   PathBuf,
}

impl Torrent {
    /// Reads a `.torrent` file from disk and parses it into a [`Torrent`] struct
    pub fn from_file(path: &str) -> Result<Self, ApplicationError> {
        let data = fs::read(path)
            .map_err(|e| ApplicationError::ParserError(format!("{}: {}", path, e)))?;
        Self::from_bytes(&data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ApplicationError> {
        // The info hash must be taken over the info dictionary as bencode
        let bencoded_map: BTreeMap<String, serde_bencode::value::Value> =
            serde_bencode::from_bytes(data)
                .map_err(|e| ApplicationError::ParserError(format!("{}", e)))?;

        let info_value = bencoded_map
            .get("info")
            .ok_or_else(|| ApplicationError::ParserError("missing info".into()))?;

        let info_raw_bytes = serde_bencode::to_bytes(info_value)
            .map_err(|e| ApplicationError::ParserError(format!("{}", e)))?;

        let torrent: Torrent = serde_bencode::from_bytes(data)
            .map_err(|e| ApplicationError::ParserError(format!("{}", e)))?;

        if torrent.info.piece_length <= 0 || torrent.info.piece_length > u32::MAX as i64 {
            return Err(ApplicationError::ParserError(format!(
                "invalid piece length {}",
                torrent.info.piece_length
            )));
        }
        if torrent.info.pieces.len() % 20 != 0 {
            return Err(ApplicationError::ParserError(
                "pieces is not a multiple of 20 bytes".into(),
            ));
        }

        Ok(Torrent {
            info_raw_bytes,
            ..torrent
        })
    }

    /// Computes the SHA1 hash of the bencoded `info` dictionary
    pub fn info_hash(&self) -> [u8; 20] {
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&Sha1::digest(&self.info_raw_bytes));
        arr
    }

    /// Calculates the total size of all files described by the torrent
    pub fn total_size(&self) -> i64 {
        self.files().iter().map(|f| f.length).sum()
    }

    /// Returns all files in the torrent with their full paths and sizes
    pub fn files(&self) -> Vec<FileEntry> {
        if let Some(files) = &self.info.files {
            files
                .iter()
                .map(|f| FileEntry {
                    length: f.length,
                    path:   {
                        let mut pb = PathBuf::from(&self.info.name);
                        for p in &f.path {
                            pb.push(p);
                        }
                        pb
                    },
                })
                .collect()
        } else {
            vec![FileEntry {
                length: self.info.length.unwrap_or(0),
                path:   PathBuf::from(&self.info.name),
            }]
        }
    }

    pub fn pieces_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// Returns the declared length of each piece (in bytes)
    ///
    /// The last piece may be shorter.
    pub fn piece_length(&self) -> i64 {
        self.info.piece_length
    }

    /// Length of piece `index`, accounting for a short last piece
    pub fn piece_size(&self, index: usize) -> u32 {
        let start = index as i64 * self.piece_length();
        let left  = (self.total_size() - start).max(0);
        left.min(self.piece_length()) as u32
    }

    /// Returns the SHA1 hash of each piece
    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut arr = [0u8; 20];
                arr.copy_from_slice(chunk);
                arr
            })
            .collect()
    }

    pub fn log_info(&self) {
        info!(
            name = %self.info.name,
            announce = %self.announce,
            info_hash = %hex::encode(self.info_hash()),
            piece_length = self.piece_length(),
            pieces = self.pieces_count(),
            total_size = self.total_size(),
            "loaded torrent"
        );

        for file in self.files() {
            info!(path = %file.path.display(), length = file.length, "file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Vec<u8>, Vec<u8>) {
        let mut info = Vec::new();
        info.extend_from_slice(b"d6:lengthi10e4:name4:file12:piece lengthi4e6:pieces60:");
        info.extend_from_slice(&[7u8; 60]);
        info.push(b'e');

        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce17:http://t/announce4:info");
        data.extend_from_slice(&info);
        data.push(b'e');
        (data, info)
    }

    #[test]
    fn parses_single_file_torrent() {
        let (data, _) = sample();
        let torrent = Torrent::from_bytes(&data).unwrap();

        assert_eq!(torrent.announce, "http://t/announce");
        assert_eq!(torrent.total_size(), 10);
        assert_eq!(torrent.pieces_count(), 3);
        assert_eq!(torrent.piece_hashes(), vec![[7u8; 20]; 3]);
        assert_eq!(
            (0..3).map(|i| torrent.piece_size(i)).collect::<Vec<_>>(),
            vec![4, 4, 2]
        );
    }

    #[test]
    fn info_hash_covers_raw_info_dictionary() {
        let (data, info) = sample();
        let torrent = Torrent::from_bytes(&data).unwrap();

        let mut expected = [0u8; 20];
        expected.copy_from_slice(&Sha1::digest(&info));
        assert_eq!(torrent.info_hash(), expected);
    }

    #[test]
    fn missing_info_is_an_error() {
        assert!(Torrent::from_bytes(b"d8:announce1:xe").is_err());
    }
}
