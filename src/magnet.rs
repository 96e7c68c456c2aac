//! # Magnet Link Parsing
//!
//! A magnet link carries just enough to join a swarm without a torrent
//! file: the info-hash, a display name, and a tracker URL. The metadata
//! itself is then fetched from a peer over the extension protocol.

use anyhow::{anyhow, bail, Result};
use url::Url;

/// The fields of a v1 magnet link.
#[derive(Debug, Clone)]
pub struct Magnet {
    /// 20-byte info-hash decoded from the `xt` parameter
    pub info_hash: [u8; 20],
    /// Display name from the `dn` parameter
    pub display_name: String,
    /// Tracker URL from the `tr` parameter, percent-decoded
    pub tracker_url: String,
}

impl Magnet {
    /// Parse a magnet link of the form
    /// `magnet:?xt=urn:btih:<hex>&dn=<name>&tr=<tracker>`.
    pub fn parse(link: &str) -> Result<Magnet> {
        let url = Url::parse(link).map_err(|_| anyhow!("invalid magnet link: {}", link))?;
        if url.scheme() != "magnet" {
            bail!("invalid magnet link: scheme is {:?}", url.scheme());
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut tracker_url = None;

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => info_hash = Some(parse_info_hash(&value)?),
                "dn" => display_name = Some(value.into_owned()),
                "tr" => tracker_url = Some(value.into_owned()),
                other => debug!("ignoring magnet parameter {:?}", other),
            }
        }

        let info_hash = info_hash.ok_or_else(|| anyhow!("magnet link is missing the xt parameter"))?;
        let display_name =
            display_name.ok_or_else(|| anyhow!("magnet link is missing the dn parameter"))?;
        let tracker_url =
            tracker_url.ok_or_else(|| anyhow!("magnet link is missing the tr parameter"))?;

        Ok(Magnet {
            info_hash,
            display_name,
            tracker_url,
        })
    }
}

/// Decode an `xt` value of the form `urn:btih:<40 hex digits>`.
fn parse_info_hash(xt: &str) -> Result<[u8; 20]> {
    let hash_hex = xt
        .strip_prefix("urn:btih:")
        .ok_or_else(|| anyhow!("unsupported xt parameter {:?}", xt))?;

    let bytes = hex::decode(hash_hex).map_err(|_| anyhow!("invalid info hash {:?}", hash_hex))?;

    bytes
        .try_into()
        .map_err(|_| anyhow!("info hash {:?} is not 20 bytes", hash_hex))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINK: &str = "magnet:?xt=urn:btih:ad42ce8109f54c99613ce38f9b4d87e70f24a165&dn=sample.gif&tr=http%3A%2F%2Ftracker.example.com%3A6969%2Fannounce";

    #[test]
    fn parses_a_complete_link() {
        let magnet = Magnet::parse(LINK).unwrap();

        assert_eq!(
            hex::encode(magnet.info_hash),
            "ad42ce8109f54c99613ce38f9b4d87e70f24a165"
        );
        assert_eq!(magnet.display_name, "sample.gif");
        // The tracker URL comes back percent-decoded.
        assert_eq!(
            magnet.tracker_url,
            "http://tracker.example.com:6969/announce"
        );
    }

    #[test]
    fn rejects_non_magnet_schemes() {
        assert!(Magnet::parse("http:?xt=urn:btih:ad42ce8109f54c99613ce38f9b4d87e70f24a165").is_err());
        assert!(Magnet::parse("not a url at all").is_err());
    }

    #[test]
    fn rejects_missing_info_hash() {
        assert!(Magnet::parse("magnet:?dn=file.gif&tr=http%3A%2F%2Ft.example%2Fannounce").is_err());
    }

    #[test]
    fn rejects_missing_display_name() {
        assert!(Magnet::parse(
            "magnet:?xt=urn:btih:ad42ce8109f54c99613ce38f9b4d87e70f24a165&tr=http%3A%2F%2Ft.example%2Fannounce"
        )
        .is_err());
    }

    #[test]
    fn rejects_missing_tracker() {
        assert!(Magnet::parse(
            "magnet:?xt=urn:btih:ad42ce8109f54c99613ce38f9b4d87e70f24a165&dn=file.gif"
        )
        .is_err());
    }

    #[test]
    fn rejects_malformed_hashes() {
        // Not hex
        assert!(Magnet::parse("magnet:?xt=urn:btih:zz42ce8109f54c99613ce38f9b4d87e70f24a165&dn=f&tr=http%3A%2F%2Ft").is_err());
        // Wrong length
        assert!(Magnet::parse("magnet:?xt=urn:btih:ad42ce81&dn=f&tr=http%3A%2F%2Ft").is_err());
        // Wrong urn type
        assert!(Magnet::parse("magnet:?xt=urn:sha1:ad42ce8109f54c99613ce38f9b4d87e70f24a165&dn=f&tr=http%3A%2F%2Ft").is_err());
    }
}
