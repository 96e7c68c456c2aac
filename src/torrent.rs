//! # Swarm Download Scheduler
//!
//! This module coordinates a full-file download across the swarm: peer
//! discovery, one connection per usable peer, and a shared work queue
//! drained by one worker thread per connection.
//!
//! ## Scheduling Model
//!
//! The scheduler alone owns the sending side of the work queue. It fills
//! the queue with one work item per piece, then listens on the outcome
//! channel:
//!
//! - a successful piece is stored in its slot of the assembly array,
//! - a failed piece goes back on the queue until its retry budget is
//!   spent, at which point the whole download fails.
//!
//! Closing the queue (by dropping the sender) and raising the shared
//! cancellation flag is how the scheduler stops its workers, on success
//! and on fatal errors alike. Workers write to disjoint piece slots, so
//! assembly needs no locking: the scheduler drains the slots in index
//! order once every piece is accounted for.

use crate::client::Client;
use crate::metainfo::MetaFile;
use crate::peer::Peer;
use crate::piece::{PieceOutcome, PieceWork};
use crate::tracker;
use crate::worker::Worker;

use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{bounded, unbounded};
use indicatif::{ProgressBar, ProgressStyle};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// How many times a piece may fail before the download is abandoned.
pub const PIECE_DOWNLOAD_RETRIES: u32 = 5;

/// A torrent being downloaded: its metadata and the open peer connections.
pub struct Torrent {
    mf: MetaFile,
    clients: Vec<Client>,
}

impl Torrent {
    /// Discover the swarm and connect to its peers.
    pub fn new(mf: MetaFile) -> Result<Torrent> {
        let peers = tracker::discover_peers(&mf.announce, &mf.info.info_hash, mf.info.length)?;

        Self::with_peers(mf, &peers)
    }

    /// Connect to the given peers, one after another.
    ///
    /// Peers that cannot be dialled or handshaken are skipped; at least
    /// one connection must survive.
    pub fn with_peers(mf: MetaFile, peers: &[Peer]) -> Result<Torrent> {
        let mut clients = Vec::new();

        for &peer in peers {
            match Client::connect(peer, mf.info.info_hash) {
                Ok(client) => clients.push(client),
                Err(e) => warn!("skipping peer {}: {:#}", peer, e),
            }
        }

        if clients.is_empty() {
            bail!("could not connect to any peer");
        }

        Ok(Torrent { mf, clients })
    }

    /// Download the whole file and return its bytes.
    pub fn download(self) -> Result<Vec<u8>> {
        let info = &self.mf.info;
        let piece_count = info.piece_count() as usize;

        println!("Downloading {:?} ({} pieces)", info.name, piece_count);

        // The queue holds every piece at once, so sends never block
        let (work_tx, work_rx) = bounded::<PieceWork>(piece_count);
        let (outcome_tx, outcome_rx) = unbounded::<PieceOutcome>();
        let cancel = Arc::new(AtomicBool::new(false));

        for index in 0..info.piece_count() {
            let work = PieceWork::new(
                index,
                info.piece_hashes[index as usize].clone(),
                info.piece_len_at(index),
            );
            work_tx
                .send(work)
                .map_err(|_| anyhow!("could not fill the work queue"))?;
        }

        // One worker per connection
        let mut handles = Vec::with_capacity(self.clients.len());
        for client in self.clients {
            let worker = Worker::new(
                client,
                work_rx.clone(),
                outcome_tx.clone(),
                Arc::clone(&cancel),
            );
            handles.push(thread::spawn(move || worker.run()));
        }

        // The scheduler keeps only its own ends: the queue stays open for
        // retries, and the outcome channel closes once all workers exit
        drop(work_rx);
        drop(outcome_tx);

        // Create progress bar
        let progress = ProgressBar::new(info.length as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")
                .unwrap()
                .progress_chars("#>-"),
        );

        let mut pieces: Vec<Option<Vec<u8>>> = vec![None; piece_count];
        let mut remaining = piece_count;
        let mut outcome_of_run = Ok(());

        while remaining > 0 {
            let outcome = match outcome_rx.recv() {
                Ok(outcome) => outcome,
                Err(_) => {
                    outcome_of_run =
                        Err(anyhow!("all peers failed with {} pieces missing", remaining));
                    break;
                }
            };

            match outcome {
                PieceOutcome::Done(result) => {
                    let index = result.index as usize;
                    progress.inc(result.data.len() as u64);

                    if pieces[index].is_none() {
                        remaining -= 1;
                    }
                    pieces[index] = Some(result.data);
                }
                PieceOutcome::Failed(mut work, error) => {
                    if work.retries < PIECE_DOWNLOAD_RETRIES {
                        work.retries += 1;
                        debug!(
                            "requeueing piece {} (attempt {} of {})",
                            work.index, work.retries, PIECE_DOWNLOAD_RETRIES
                        );

                        if work_tx.send(work).is_err() {
                            outcome_of_run = Err(anyhow!("the work queue closed unexpectedly"));
                            break;
                        }
                    } else {
                        outcome_of_run = Err(anyhow!(
                            "piece {} failed after {} retries: {:#}",
                            work.index,
                            PIECE_DOWNLOAD_RETRIES,
                            error
                        ));
                        break;
                    }
                }
            }
        }

        // Stop the swarm: raise the flag, close the queue, collect the
        // workers (each drops its connection on the way out)
        cancel.store(true, Ordering::Relaxed);
        drop(work_tx);
        for handle in handles {
            let _ = handle.join();
        }

        progress.finish_and_clear();

        outcome_of_run?;

        // Assemble the file from the piece slots, in index order
        let mut data = Vec::with_capacity(info.length as usize);
        for (index, piece) in pieces.into_iter().enumerate() {
            let piece = piece.ok_or_else(|| anyhow!("piece {} missing after download", index))?;
            data.extend_from_slice(&piece);
        }

        Ok(data)
    }
}
