use crate::compact;
use crate::error::ApplicationError;
use crate::peer::Peer;
use crate::torrent::Torrent;
use percent_encoding::{NON_ALPHANUMERIC, percent_encode};
use reqwest::Client;
use serde::Deserialize;
use serde_bencode::de;
use serde_bencode::value::Value;
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;
use url::Url;

/// Handles communication with a BitTorrent tracker
pub struct Tracker;

/// Represents the response returned by a tracker announce request
#[derive(Debug, Deserialize)]
pub struct AnnounceResponse {
    #[serde(rename = "peers")]
    pub peers_data: Option<Value>,
    pub interval:   Option<i64>,
    #[serde(rename = "failure reason")]
    pub failure_reason: Option<String>,
}

impl AnnounceResponse {
    pub fn parse(raw: &[u8]) -> Result<Self, ApplicationError> {
        de::from_bytes(raw).map_err(|e| ApplicationError::TrackerError(format!("{}", e)))
    }

    /// Peers from either the compact byte string or the list of dictionaries
    pub fn peers(&self) -> Result<Vec<Peer>, ApplicationError> {
        if let Some(reason) = &self.failure_reason {
            return Err(ApplicationError::TrackerError(reason.clone()));
        }

        match &self.peers_data {
            Some(Value::Bytes(data)) => Ok(compact::decode_list(data)?
                .into_iter()
                .map(Peer::from)
                .collect()),
            Some(Value::List(list)) => Ok(list.iter().filter_map(dict_peer).collect()),
            Some(_) => Err(ApplicationError::TrackerError(
                "unexpected peers encoding".into(),
            )),
            None => Ok(Vec::new()),
        }
    }
}

/// One entry of the non-compact form: `{"ip": "1.2.3.4", "port": 6881}`
fn dict_peer(item: &Value) -> Option<Peer> {
    let Value::Dict(dict) = item else {
        return None;
    };

    let ip = dict
        .get(&b"ip".to_vec())
        .and_then(|v| match v {
            Value::Bytes(b) => String::from_utf8(b.clone()).ok(),
            _ => None,
        })
        .and_then(|s| s.parse::<Ipv4Addr>().ok())
        .map(IpAddr::V4)?;

    let port = dict.get(&b"port".to_vec()).and_then(|v| match v {
        Value::Int(n) => u16::try_from(*n).ok(),
        _ => None,
    })?;

    Some(Peer { ip, port })
}

impl Tracker {
    /// Sends an announce request to the tracker and returns the list of peers
    pub async fn announce(
        &self,
        torrent: &Torrent,
        peer_id: [u8; 20],
        port:    u16,
    ) -> Result<Vec<Peer>, ApplicationError> {
        let url = Self::announce_url(torrent, peer_id, port)?;
        debug!(%url, "announcing");

        let raw = Client::new()
            .get(url)
            .send()
            .await
            .map_err(|e| ApplicationError::TrackerError(format!("{}", e)))?
            .bytes()
            .await
            .map_err(|e| ApplicationError::TrackerError(format!("{}", e)))?;

        let resp = AnnounceResponse::parse(&raw)?;
        debug!(interval = ?resp.interval, "tracker responded");
        resp.peers()
    }

    fn announce_url(torrent: &Torrent, peer_id: [u8; 20], port: u16) -> Result<String, ApplicationError> {
        let base_url = Url::parse(&torrent.announce)
            .map_err(|e| ApplicationError::TrackerError(format!("{}", e)))?;

        let params = [
            ("info_hash",  percent_encode(&torrent.info_hash(), NON_ALPHANUMERIC).to_string()),
            ("peer_id",    percent_encode(&peer_id, NON_ALPHANUMERIC).to_string()),
            ("port",       port.to_string()),
            ("uploaded",   "0".to_string()),
            ("downloaded", "0".to_string()),
            ("left",       torrent.total_size().to_string()),
            ("compact",    "1".to_string()),
            ("event",      "started".to_string()),
        ];

        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let sep = if base_url.query().is_some() { '&' } else { '?' };
        Ok(format!("{}{}{}", base_url, sep, query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompactError;

    #[test]
    fn compact_peers_are_decoded_in_order() {
        let mut raw = b"d8:intervali1800e5:peers12:".to_vec();
        raw.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0, 80]);
        raw.push(b'e');

        let resp = AnnounceResponse::parse(&raw).unwrap();
        assert_eq!(resp.interval, Some(1800));
        let peers = resp.peers().unwrap();
        assert_eq!(
            peers.iter().map(|p| p.addr().to_string()).collect::<Vec<_>>(),
            vec!["127.0.0.1:6881", "10.0.0.2:80"]
        );
    }

    #[test]
    fn truncated_compact_list_is_rejected() {
        let raw = b"d5:peers7:abcdefge";
        let resp = AnnounceResponse::parse(raw).unwrap();
        assert!(matches!(
            resp.peers(),
            Err(ApplicationError::Compact(CompactError::InvalidListLength(7)))
        ));
    }

    #[test]
    fn dictionary_peers_are_accepted() {
        let raw = b"d5:peersld2:ip8:10.1.1.14:porti51413eeee";
        let peers = AnnounceResponse::parse(raw).unwrap().peers().unwrap();
        assert_eq!(peers, vec![Peer { ip: "10.1.1.1".parse().unwrap(), port: 51413 }]);
    }

    #[test]
    fn failure_reason_becomes_error() {
        let raw = b"d14:failure reason9:not founde";
        let resp = AnnounceResponse::parse(raw).unwrap();
        assert!(matches!(resp.peers(), Err(ApplicationError::TrackerError(r)) if r == "not found"));
    }
}
