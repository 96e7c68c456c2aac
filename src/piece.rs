//! # Piece Work Items
//!
//! Structures passed between the download scheduler and its workers. A
//! `PieceWork` describes one piece to fetch; a `PieceResult` carries the
//! verified bytes back; a `PieceOutcome` is what a worker reports for each
//! attempt.

use anyhow::Error;

/// One piece to download, as circulated on the work queue.
#[derive(Debug, Clone)]
pub struct PieceWork {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Hex-encoded SHA-1 hash the downloaded piece must match
    pub hash: String,
    /// Length of the piece in bytes (shorter for the final piece)
    pub length: u32,
    /// Number of failed attempts so far
    pub retries: u32,
}

impl PieceWork {
    pub fn new(index: u32, hash: String, length: u32) -> PieceWork {
        PieceWork {
            index,
            hash,
            length,
            retries: 0,
        }
    }
}

/// A fully downloaded and verified piece.
#[derive(Debug)]
pub struct PieceResult {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Complete piece data
    pub data: Vec<u8>,
}

/// What a worker reports back to the scheduler for one attempt.
#[derive(Debug)]
pub enum PieceOutcome {
    /// The piece downloaded and its hash verified
    Done(PieceResult),
    /// The attempt failed; the scheduler decides whether to requeue
    Failed(PieceWork, Error),
}
