//! # Peer Endpoints
//!
//! This module defines the `Peer` endpoint type and the decoding of the
//! compact peer list returned by trackers.
//!
//! ## Compact Peer Format
//!
//! The tracker returns peers as a binary string of 6-byte entries:
//!
//! ```text
//! <IP: 4 bytes><Port: 2 bytes>
//! ```
//!
//! Both fields are in network byte order (big-endian). Only the IPv4
//! compact form is supported.

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};
use rand::distributions::Alphanumeric;
use rand::Rng;

use std::fmt;
use std::io::Cursor;
use std::net::Ipv4Addr;
use std::str::FromStr;

const PEER_SIZE: usize = 6;

/// A peer endpoint in the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    /// IPv4 address of the peer
    pub ip: Ipv4Addr,
    /// Port number for connecting to the peer
    pub port: u16,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for Peer {
    type Err = anyhow::Error;

    /// Parse a peer endpoint from an `ip:port` literal.
    fn from_str(addr: &str) -> Result<Peer> {
        let (ip, port) = addr
            .split_once(':')
            .ok_or_else(|| anyhow!("invalid peer address {:?}", addr))?;

        let ip: Ipv4Addr = ip
            .parse()
            .map_err(|_| anyhow!("invalid peer IP address {:?}", ip))?;
        let port: u16 = port
            .parse()
            .map_err(|_| anyhow!("invalid peer port {:?}", port))?;

        Ok(Peer { ip, port })
    }
}

/// Decode a compact peer list received from the tracker.
///
/// # Arguments
///
/// * `raw` - Binary peer list, 6 bytes per peer.
///
pub fn parse_compact(raw: &[u8]) -> Result<Vec<Peer>> {
    // Check tracker peers are valid
    if !raw.len().is_multiple_of(PEER_SIZE) {
        return Err(anyhow!("received invalid peers from tracker"));
    }

    let mut peers = Vec::with_capacity(raw.len() / PEER_SIZE);

    for entry in raw.chunks_exact(PEER_SIZE) {
        let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);

        // Port is a big-endian 16-bit integer
        let mut port_cursor = Cursor::new(&entry[4..6]);
        let port = port_cursor.read_u16::<BigEndian>()?;

        peers.push(Peer { ip, port });
    }

    Ok(peers)
}

/// Generate a fresh 20-byte URL-safe peer id.
pub fn gen_peer_id() -> [u8; 20] {
    let mut peer_id = [0; 20];
    let mut rng = rand::thread_rng();
    for byte in peer_id.iter_mut() {
        *byte = rng.sample(Alphanumeric);
    }

    peer_id
}
