//! Compact peer records.
//!
//! Trackers answering with `compact=1` return the peer list as one byte
//! string. Each peer takes exactly 6 bytes: the IPv4 address followed by the
//! port, both big-endian, with no separator and no count prefix.

use byteorder::{BigEndian, ReadBytesExt};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::error::CompactError;

/// Size of one compact peer record
pub const RECORD_LEN: usize = 6;

/// Encodes an IPv4 socket address into its 6-byte record.
pub fn encode(addr: &SocketAddr) -> Result<[u8; RECORD_LEN], CompactError> {
    let ip = match addr.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(_)  => return Err(CompactError::NotIpv4(*addr)),
    };

    let mut buf = [0u8; RECORD_LEN];
    buf[..4].copy_from_slice(&ip.octets());
    buf[4..].copy_from_slice(&addr.port().to_be_bytes());
    Ok(buf)
}

/// Decodes exactly one 6-byte record.
pub fn decode(mut buf: &[u8]) -> Result<SocketAddrV4, CompactError> {
    if buf.len() != RECORD_LEN {
        return Err(CompactError::InvalidRecordLength(buf.len()));
    }

    let ip = buf
        .read_u32::<BigEndian>()
        .map_err(|_| CompactError::InvalidRecordLength(RECORD_LEN))?;
    let port = buf
        .read_u16::<BigEndian>()
        .map_err(|_| CompactError::InvalidRecordLength(RECORD_LEN))?;

    Ok(SocketAddrV4::new(Ipv4Addr::from(ip), port))
}

/// Decodes a flat list of records, preserving their order.
pub fn decode_list(buf: &[u8]) -> Result<Vec<SocketAddrV4>, CompactError> {
    if buf.len() % RECORD_LEN != 0 {
        return Err(CompactError::InvalidListLength(buf.len()));
    }

    buf.chunks_exact(RECORD_LEN).map(decode).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_address_big_endian() {
        let addr: SocketAddr = "192.168.1.1:6881".parse().unwrap();
        assert_eq!(encode(&addr).unwrap(), [192, 168, 1, 1, 26, 225]);
    }

    #[test]
    fn decode_inverts_encode() {
        for text in ["0.0.0.0:0", "10.0.0.7:80", "255.255.255.255:65535"] {
            let addr: SocketAddr = text.parse().unwrap();
            let record = encode(&addr).unwrap();
            assert_eq!(SocketAddr::V4(decode(&record).unwrap()), addr);
        }
    }

    #[test]
    fn rejects_ipv6() {
        let addr: SocketAddr = "[::1]:6881".parse().unwrap();
        assert_eq!(encode(&addr), Err(CompactError::NotIpv4(addr)));
    }

    #[test]
    fn decode_requires_six_bytes() {
        assert_eq!(decode(&[1, 2, 3, 4, 5]), Err(CompactError::InvalidRecordLength(5)));
        assert_eq!(
            decode(&[1, 2, 3, 4, 5, 6, 7]),
            Err(CompactError::InvalidRecordLength(7))
        );
    }

    #[test]
    fn decode_list_keeps_order() {
        let buf = [
            127, 0, 0, 1, 0x1a, 0xe1, //
            10, 1, 2, 3, 0, 80, //
            8, 8, 8, 8, 0x01, 0xbb,
        ];
        let peers = decode_list(&buf).unwrap();
        assert_eq!(
            peers,
            vec![
                "127.0.0.1:6881".parse::<SocketAddrV4>().unwrap(),
                "10.1.2.3:80".parse().unwrap(),
                "8.8.8.8:443".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn decode_list_rejects_partial_record() {
        assert_eq!(
            decode_list(&[0u8; 13]),
            Err(CompactError::InvalidListLength(13))
        );
    }

    #[test]
    fn decode_list_of_empty_input_is_empty() {
        assert!(decode_list(&[]).unwrap().is_empty());
    }
}
