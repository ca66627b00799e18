//! Hands pieces out to the peer workers and assembles the verified ones.
//!
//! Pieces waiting to be downloaded live in the [`PendingPool`]. A worker owns
//! a piece from the moment it pulls it until it either hands it back verified
//! through the results channel, or requeues it after a failure. When every
//! byte is verified the pool is closed and the workers are cancelled.

use std::{net::SocketAddr, sync::Arc};

use tokio::{
    sync::{mpsc, Notify, RwLock},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    bitfield::{Bitfield, PieceBitfield},
    config::Config,
    error::Error,
    metainfo::{InfoHash, MetaInfo},
    peer::{run_peer, PeerId, PeerStats},
    piece::{self, PieceDescriptor},
};

/// Pieces that nobody is downloading right now.
///
/// A multi-producer, multi-consumer queue: every worker pulls from it and
/// pushes failed pieces back. A pull hands a piece to exactly one worker.
#[derive(Clone, Debug)]
pub struct PendingPool {
    tx: async_channel::Sender<PieceDescriptor>,
    rx: async_channel::Receiver<PieceDescriptor>,
    /// Wakes the workers waiting for a piece held by someone else.
    changed: Arc<Notify>,
}

impl PendingPool {
    pub fn new(pieces: impl IntoIterator<Item = PieceDescriptor>) -> Self {
        let (tx, rx) = async_channel::unbounded();
        let pool = Self { tx, rx, changed: Arc::new(Notify::new()) };
        for piece in pieces {
            pool.requeue(piece);
        }
        pool
    }

    /// Wait for a piece. Returns `None` once the pool is closed and empty.
    pub async fn pull(&self) -> Option<PieceDescriptor> {
        self.rx.recv().await.ok()
    }

    /// Give a piece back so another worker, or the same one, can retry it.
    /// A closed pool drops the piece, the download is over.
    pub fn requeue(&self, piece: PieceDescriptor) {
        match self.tx.try_send(piece) {
            Ok(()) => self.changed.notify_waiters(),
            Err(e) => debug!("pool is closed, dropping piece {}", e.into_inner().index),
        }
    }

    /// Put back a piece the peer of this worker does not have. Idle workers
    /// are not woken up, the pool is the same as before the pull.
    pub fn skip(&self, piece: PieceDescriptor) {
        if let Err(e) = self.tx.try_send(piece) {
            debug!("pool is closed, dropping piece {}", e.into_inner().index);
        }
    }

    /// Resolves on the next [`requeue`](Self::requeue) or
    /// [`wake`](Self::wake).
    pub async fn changed(&self) {
        self.changed.notified().await
    }

    /// Wake the idle workers, the set of missing pieces changed.
    pub fn wake(&self) {
        self.changed.notify_waiters();
    }

    /// Close the pool, pending and future pulls return `None` once it is
    /// empty.
    pub fn close(&self) -> bool {
        let closed = self.tx.close();
        self.changed.notify_waiters();
        closed
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// What every worker of a download shares.
#[derive(Debug)]
pub struct DownloadCtx {
    pub info_hash: InfoHash,
    pub local_peer_id: PeerId,
    pub config: Config,
    pub pool: PendingPool,
    /// Pieces not verified yet, pending or in flight.
    pub missing: RwLock<Bitfield>,
    pub cancel: CancellationToken,
}

/// Downloads the pieces of one torrent from a list of peers.
#[derive(Debug)]
pub struct Scheduler {
    ctx: Arc<DownloadCtx>,
    pieces: Vec<PieceDescriptor>,
    piece_length: u32,
    length: u64,
}

impl Scheduler {
    /// # Errors
    ///
    /// Fails if the pieces do not cover exactly `length` bytes in pieces of
    /// `piece_length`.
    pub fn new(
        info_hash: InfoHash,
        local_peer_id: PeerId,
        pieces: Vec<PieceDescriptor>,
        piece_length: u32,
        length: u64,
        config: Config,
    ) -> Result<Self, Error> {
        piece::validate(&pieces, piece_length, length)?;

        let ctx = Arc::new(DownloadCtx {
            info_hash,
            local_peer_id,
            config,
            pool: PendingPool::new(Vec::new()),
            missing: RwLock::new(Bitfield::repeat(true, pieces.len())),
            cancel: CancellationToken::new(),
        });

        Ok(Self { ctx, pieces, piece_length, length })
    }

    pub fn from_meta_info(
        meta_info: &MetaInfo,
        local_peer_id: PeerId,
        config: Config,
    ) -> Result<Self, Error> {
        Self::new(
            meta_info.info_hash(),
            local_peer_id,
            meta_info.descriptors()?,
            meta_info.info.piece_length,
            meta_info.info.length,
            config,
        )
    }

    /// Download every piece from `peers`, returning the whole content.
    ///
    /// # Errors
    ///
    /// [`Error::IncompleteDownload`] if every worker ended before all pieces
    /// were verified. A truncated buffer is never returned.
    #[tracing::instrument(skip_all, fields(info_hash = %self.ctx.info_hash))]
    pub async fn download(self, peers: Vec<SocketAddr>) -> Result<Vec<u8>, Error> {
        let count = self.pieces.len();
        let mut output = vec![0u8; self.length as usize];

        if count == 0 {
            return Ok(output);
        }

        let pool = &self.ctx.pool;
        for piece in &self.pieces {
            pool.requeue(piece.clone());
        }

        let max_peers = match self.ctx.config.max_peers {
            0 => peers.len(),
            max => max,
        };
        info!(
            "downloading {} bytes in {count} pieces from {} peers",
            self.length,
            peers.len().min(max_peers)
        );

        let (results_tx, mut results_rx) = mpsc::unbounded_channel();
        let mut workers = JoinSet::new();

        for remote in peers.into_iter().take(max_peers) {
            workers.spawn(run_peer(remote, self.ctx.clone(), results_tx.clone()));
        }
        // the channel closes when the last worker ends
        drop(results_tx);

        let mut done = 0;
        let mut downloaded = 0u64;

        while downloaded < self.length {
            let Some(piece) = results_rx.recv().await else {
                let remaining: Vec<usize> = self.ctx.missing.read().await.iter_ones().collect();
                warn!("every peer is gone, {} pieces missing", remaining.len());
                self.stop(&mut workers).await;
                return Err(Error::IncompleteDownload { remaining });
            };

            let Some(descriptor) = self.pieces.get(piece.index) else {
                warn!("ignoring unknown piece {}", piece.index);
                continue;
            };
            if !self.ctx.missing.read().await.has_piece(piece.index) {
                warn!("ignoring piece {} delivered twice", piece.index);
                continue;
            }
            if piece.len() != descriptor.length as usize {
                warn!(
                    "piece {} has {} bytes instead of {}, requeueing",
                    piece.index,
                    piece.len(),
                    descriptor.length
                );
                pool.requeue(descriptor.clone());
                continue;
            }

            let begin = piece.index as u64 * self.piece_length as u64;
            let end = (begin + piece.len() as u64).min(self.length);
            output[begin as usize..end as usize]
                .copy_from_slice(&piece.data[..(end - begin) as usize]);

            self.ctx.missing.write().await.set(piece.index, false);
            pool.wake();
            downloaded += end - begin;
            done += 1;

            info!(
                "piece {} verified, {done}/{count} ({:.1}%)",
                piece.index,
                downloaded as f64 / self.length as f64 * 100.0
            );
        }

        self.stop(&mut workers).await;
        info!("download complete, {downloaded} bytes");

        Ok(output)
    }

    /// Close the pool, cancel the workers parked on a read, and wait for all
    /// of them.
    async fn stop(&self, workers: &mut JoinSet<PeerStats>) {
        self.ctx.pool.close();
        self.ctx.cancel.cancel();

        let mut total = PeerStats::default();
        while let Some(r) = workers.join_next().await {
            match r {
                Ok(stats) => {
                    total.pieces += stats.pieces;
                    total.failed_pieces += stats.failed_pieces;
                    total.downloaded += stats.downloaded;
                }
                Err(e) => warn!("peer worker panicked: {e}"),
            }
        }

        debug!(
            "workers done, {} pieces, {} failed, {} bytes",
            total.pieces, total.failed_pieces, total.downloaded
        );
    }
}
