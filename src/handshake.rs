//! # BitTorrent Handshake Frames
//!
//! This module implements the fixed 68-byte handshake exchanged right after
//! the TCP connection is established.
//!
//! ## Frame Format
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte - Length of the protocol string (19)
//! - **pstr**: 19 bytes - The literal "BitTorrent protocol"
//! - **reserved**: 8 bytes - Capability flags
//! - **info_hash**: 20 bytes - SHA-1 of the torrent's info dictionary
//! - **peer_id**: 20 bytes - Identifier of the sending peer
//!
//! ## Extension Protocol Flag
//!
//! A client that supports the extension protocol sets bit `0x10` in
//! reserved byte 5. Both sides must set it for the extension handshake to
//! proceed.

use anyhow::{anyhow, Result};

const PROTOCOL_ID: &[u8] = b"BitTorrent protocol";

/// Total size of a handshake frame on the wire.
pub const HANDSHAKE_SIZE: usize = 68;

// Low-4 bit of reserved byte 5 advertises the extension protocol
const EXTENSION_BYTE: usize = 5;
const EXTENSION_BIT: u8 = 0x10;

/// A BitTorrent handshake frame.
pub struct Handshake {
    /// 8 reserved capability bytes
    pub reserved: [u8; 8],
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    pub info_hash: [u8; 20],
    /// 20-byte identifier of the sending peer
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Build a plain handshake with all reserved bytes cleared.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Handshake {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    /// Build a handshake advertising extension protocol support.
    pub fn with_extensions(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0; 8];
        reserved[EXTENSION_BYTE] |= EXTENSION_BIT;

        Handshake {
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Whether the handshake advertises extension protocol support.
    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
    }

    /// Serialize the handshake into its 68-byte wire form.
    pub fn serialize(&self) -> Vec<u8> {
        let mut serialized = Vec::with_capacity(HANDSHAKE_SIZE);

        serialized.push(PROTOCOL_ID.len() as u8);
        serialized.extend_from_slice(PROTOCOL_ID);
        serialized.extend_from_slice(&self.reserved);
        serialized.extend_from_slice(&self.info_hash);
        serialized.extend_from_slice(&self.peer_id);

        serialized
    }

    /// Deserialize a received 68-byte handshake frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame has the wrong size or does not carry
    /// the BitTorrent protocol string.
    pub fn deserialize(buf: &[u8]) -> Result<Handshake> {
        if buf.len() != HANDSHAKE_SIZE {
            return Err(anyhow!("invalid handshake length {}", buf.len()));
        }
        if buf[0] as usize != PROTOCOL_ID.len() || &buf[1..20] != PROTOCOL_ID {
            return Err(anyhow!("peer does not speak the BitTorrent protocol"));
        }

        let mut handshake = Handshake::new([0; 20], [0; 20]);
        handshake.reserved.copy_from_slice(&buf[20..28]);
        handshake.info_hash.copy_from_slice(&buf[28..48]);
        handshake.peer_id.copy_from_slice(&buf[48..68]);

        Ok(handshake)
    }
}
