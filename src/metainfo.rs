//! # Torrent Metainfo
//!
//! Parsing and validation of the torrent description, whether it comes
//! from a `.torrent` file or from metadata fetched over the extension
//! protocol.
//!
//! ## Info-Hash
//!
//! The info-hash is the SHA-1 of the canonical bencoding of the `info`
//! dictionary. It is computed from the re-encoded *decoded* dictionary, so
//! keys this client does not know about still contribute to the hash and
//! the hash matches what the rest of the swarm expects.

use crate::bencode::{self, Value};

use anyhow::{anyhow, bail, Context, Result};
use boring::sha::Sha1;

use std::fs::File;
use std::path::Path;

// Size of a SHA-1 hash in bytes
const SHA1_HASH_SIZE: usize = 20;

/// Metadata of the single file described by a torrent.
#[derive(Debug, Clone)]
pub struct MetaInfo {
    /// Suggested filename from the torrent metadata
    pub name: String,
    /// Size of each piece in bytes (except possibly the last)
    pub piece_length: u32,
    /// Total size of the file in bytes
    pub length: u32,
    /// Hex-encoded SHA-1 hash per piece, in piece order
    pub piece_hashes: Vec<String>,
    /// 20-byte SHA-1 hash of the bencoded info dictionary
    pub info_hash: [u8; 20],
}

impl MetaInfo {
    /// Build a `MetaInfo` from a decoded info dictionary.
    ///
    /// Validates the required keys and derives the info-hash and the
    /// per-piece hashes.
    pub fn from_value(info: &Value) -> Result<MetaInfo> {
        let name = info.get("name")?.as_str().context("info name")?.to_string();

        let piece_length = info.get("piece length")?.as_int().context("info piece length")?;
        if piece_length <= 0 {
            bail!("invalid metainfo: piece length {} is not positive", piece_length);
        }

        let length = info.get("length")?.as_int().context("info length")?;
        if length <= 0 {
            bail!("invalid metainfo: length {} is not positive", length);
        }

        let pieces = info.get("pieces")?.as_bytes().context("info pieces")?;
        if !pieces.len().is_multiple_of(SHA1_HASH_SIZE) {
            bail!(
                "invalid metainfo: pieces blob of {} bytes is not a multiple of {}",
                pieces.len(),
                SHA1_HASH_SIZE
            );
        }

        let piece_hashes: Vec<String> = pieces.chunks(SHA1_HASH_SIZE).map(hex::encode).collect();

        // Every byte of the file must be covered by exactly one hash
        let piece_count = (length as u64).div_ceil(piece_length as u64) as usize;
        if piece_count != piece_hashes.len() {
            bail!(
                "invalid metainfo: {} piece hashes for {} pieces",
                piece_hashes.len(),
                piece_count
            );
        }

        // Hash the canonical re-encoding of the full info dictionary
        let mut hasher = Sha1::new();
        hasher.update(&bencode::encode(info));
        let info_hash = hasher.finish();

        Ok(MetaInfo {
            name,
            piece_length: piece_length as u32,
            length: length as u32,
            piece_hashes,
            info_hash,
        })
    }

    /// Number of pieces in the torrent.
    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Length in bytes of the piece at `index`.
    ///
    /// All pieces share the nominal piece length except the last, which
    /// covers whatever remains of the file.
    pub fn piece_len_at(&self, index: u32) -> u32 {
        let begin = index * self.piece_length;
        let end = (begin + self.piece_length).min(self.length);

        end - begin
    }
}

/// A parsed torrent description: tracker URL plus file metadata.
#[derive(Debug, Clone)]
pub struct MetaFile {
    /// URL of the tracker
    pub announce: String,
    /// Metadata of the described file
    pub info: MetaInfo,
}

impl MetaFile {
    /// Parse a `.torrent` file.
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<MetaFile> {
        let file = File::open(&path)
            .map_err(|e| anyhow!("could not open torrent file {:?}: {}", path.as_ref(), e))?;

        let decoded = bencode::decode_reader(file).context("could not decode torrent file")?;

        Self::from_value(&decoded)
    }

    /// Build a `MetaFile` from a decoded torrent dictionary.
    pub fn from_value(decoded: &Value) -> Result<MetaFile> {
        let announce = decoded
            .get("announce")?
            .as_str()
            .context("announce URL")?
            .to_string();

        let info = MetaInfo::from_value(decoded.get("info")?)?;

        Ok(MetaFile { announce, info })
    }

    /// Build a `MetaFile` from a tracker URL and a raw info dictionary,
    /// as fetched over the extension protocol.
    pub fn from_parts(announce: &str, info: &Value) -> Result<MetaFile> {
        Ok(MetaFile {
            announce: announce.to_string(),
            info: MetaInfo::from_value(info)?,
        })
    }
}
