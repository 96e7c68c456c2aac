//! # Tracker Peer Discovery
//!
//! This module asks the HTTP tracker for the swarm of a torrent. The
//! request announces what we have (nothing) and what we still need; the
//! response is a bencoded dictionary whose `peers` entry is a compact
//! binary peer list.

use crate::peer::{self, Peer};

use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_bencode::de;
use serde_bytes::ByteBuf;
use url::Url;

use std::time::Duration;

// Port we announce to the tracker (we never actually listen)
const PORT: u16 = 6881;

const TRACKER_TIMEOUT: Duration = Duration::from_secs(15);

/// Bencoded tracker response.
#[derive(Debug, Deserialize)]
struct BencodeTracker {
    // Interval in seconds until the peer list should be refreshed;
    // unused, downloads are one-shot
    #[serde(default)]
    #[allow(dead_code)]
    interval: u32,
    // Compact binary peer list
    peers: ByteBuf,
}

/// Query the tracker and decode the peers it returns.
///
/// # Arguments
///
/// * `announce` - The tracker URL.
/// * `info_hash` - The 20-byte SHA-1 hash of the info dictionary.
/// * `left` - Number of bytes this client still needs.
///
pub fn discover_peers(announce: &str, info_hash: &[u8; 20], left: u32) -> Result<Vec<Peer>> {
    let url = build_tracker_url(announce, info_hash, &peer::gen_peer_id(), PORT, left)?;

    debug!("requesting tracker: {}", url);

    // Build blocking HTTP client
    let client = reqwest::blocking::Client::builder()
        .timeout(TRACKER_TIMEOUT)
        .build()
        .map_err(|e| anyhow!("could not build tracker client: {}", e))?;

    // Send GET request to the tracker
    let response = client
        .get(&url)
        .send()
        .and_then(|response| response.bytes())
        .map_err(|e| anyhow!("tracker unavailable: {}", e))?;

    // Deserialize bencoded tracker response
    let tracker = de::from_bytes::<BencodeTracker>(&response)
        .map_err(|_| anyhow!("malformed tracker response"))?;

    peer::parse_compact(&tracker.peers)
}

/// Build the announce URL with the standard query parameters.
fn build_tracker_url(
    announce: &str,
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
    port: u16,
    left: u32,
) -> Result<String> {
    // Each byte is encoded as %XX where XX is the hexadecimal representation
    fn percent_encode_binary(data: &[u8]) -> String {
        const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
        let mut encoded = String::with_capacity(data.len() * 3);

        for &byte in data {
            encoded.push('%');
            encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
            encoded.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
        }

        encoded
    }

    // Parse tracker URL from torrent
    let base_url =
        Url::parse(announce).map_err(|_| anyhow!("could not parse tracker url {:?}", announce))?;

    // Build query string manually so the raw info hash bytes survive
    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1",
        percent_encode_binary(info_hash),
        percent_encode_binary(peer_id),
        port,
        left
    );

    let mut url = base_url.to_string();
    if url.contains('?') {
        url.push('&');
    } else {
        url.push('?');
    }
    url.push_str(&query);

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_url_carries_all_parameters() {
        let info_hash = [0u8; 20];
        let peer_id = [b'a'; 20];

        let url =
            build_tracker_url("http://tracker.test/announce", &info_hash, &peer_id, 6881, 1024)
                .unwrap();

        assert!(url.starts_with("http://tracker.test/announce?"));
        assert!(url.contains(&format!("info_hash={}", "%00".repeat(20))));
        assert!(url.contains(&format!("peer_id={}", "%61".repeat(20))));
        assert!(url.contains("port=6881"));
        assert!(url.contains("uploaded=0"));
        assert!(url.contains("downloaded=0"));
        assert!(url.contains("left=1024"));
        assert!(url.contains("compact=1"));
    }

    #[test]
    fn tracker_url_percent_encodes_raw_hash_bytes() {
        let mut info_hash = [0u8; 20];
        info_hash[0] = 0xDE;
        info_hash[1] = 0xAD;

        let url =
            build_tracker_url("http://tracker.test/announce", &info_hash, &[b'a'; 20], 6881, 1)
                .unwrap();

        assert!(url.contains("info_hash=%DE%AD"));
    }

    #[test]
    fn tracker_url_appends_to_existing_query() {
        let url = build_tracker_url(
            "http://tracker.test/announce?key=abc",
            &[0; 20],
            &[b'a'; 20],
            6881,
            1,
        )
        .unwrap();

        assert!(url.contains("announce?key=abc&info_hash="));
    }

    #[test]
    fn tracker_url_rejects_invalid_announce() {
        assert!(build_tracker_url("not a url", &[0; 20], &[b'a'; 20], 6881, 1).is_err());
    }
}
