//! # Download Worker
//!
//! One worker runs per peer connection, on its own thread. It prepares the
//! connection once, then loops: take a piece off the work queue, download
//! it, and report the outcome to the scheduler.
//!
//! A failed piece is always reported back so the scheduler can hand it to
//! another peer. After a hash mismatch the connection is still in a known
//! state and the worker keeps going; after any other failure (timeout,
//! short read, protocol violation) the connection is suspect, so the
//! worker drops it and exits.

use crate::client::{Client, HashMismatch};
use crate::piece::{PieceOutcome, PieceResult, PieceWork};

use crossbeam_channel::{Receiver, Sender};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Downloads pieces from a single peer.
pub struct Worker {
    /// Connection this worker exclusively owns
    client: Client,
    /// Receiving end of the shared work queue
    work_queue: Receiver<PieceWork>,
    /// Where piece outcomes are reported
    outcomes: Sender<PieceOutcome>,
    /// Set by the scheduler when the download is over
    cancel: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        client: Client,
        work_queue: Receiver<PieceWork>,
        outcomes: Sender<PieceOutcome>,
        cancel: Arc<AtomicBool>,
    ) -> Worker {
        Worker {
            client,
            work_queue,
            outcomes,
            cancel,
        }
    }

    /// Run the download loop until the queue closes, the scheduler
    /// cancels, or the connection fails.
    ///
    /// Dropping `self.client` on the way out closes the socket.
    pub fn run(mut self) {
        let peer = self.client.peer();

        debug!("worker for peer {} started", peer);

        if let Err(e) = self.client.pre_download() {
            warn!("worker for peer {} could not start downloading: {:#}", peer, e);
            return;
        }

        loop {
            if self.cancel.load(Ordering::Relaxed) {
                debug!("worker for peer {} cancelled", peer);
                break;
            }

            // A closed queue means the download is complete or aborted
            let work = match self.work_queue.recv() {
                Ok(work) => work,
                Err(_) => break,
            };

            let index = work.index;
            match self.client.download_piece(&work) {
                Ok(data) => {
                    let outcome = PieceOutcome::Done(PieceResult { index, data });
                    if self.outcomes.send(outcome).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("downloading piece {} from peer {} failed: {:#}", index, peer, e);

                    // A hash mismatch leaves the connection usable; any
                    // other failure means it can no longer be trusted
                    let connection_intact = e.downcast_ref::<HashMismatch>().is_some();

                    if self.outcomes.send(PieceOutcome::Failed(work, e)).is_err() {
                        break;
                    }
                    if !connection_intact {
                        break;
                    }
                }
            }
        }

        debug!("worker for peer {} finished", peer);
    }
}
