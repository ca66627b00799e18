//! A remote peer in the network that we download pieces from.
//!
//! Each peer is driven by its own worker task, which pulls pieces from the
//! [`PendingPool`](crate::scheduler::PendingPool), downloads them block by
//! block and hands the verified ones to the scheduler.
pub mod session;
mod types;

// re-exports
pub use types::*;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    select,
    sync::mpsc,
    time::{sleep, timeout, timeout_at, Instant},
};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::{
    bitfield::PieceBitfield,
    error::Error,
    peer::session::{ConnectionState, PieceDownload, Session},
    piece::{verify, CompletedPiece, PieceDescriptor},
    scheduler::DownloadCtx,
    tcp_wire::{perform_handshake, Core, CoreCodec},
};

/// How often an idle worker looks at the pool again, when no requeue woke
/// it up before.
static POOL_POLL: Duration = Duration::from_millis(500);

/// Outcome of looking for a piece in the pool.
enum Claim {
    /// A piece the peer has, owned by this worker until it is delivered or
    /// requeued.
    Piece(PieceDescriptor),
    /// The peer has none of the pieces in the pool.
    Unavailable,
    /// The pool is closed or the download was cancelled.
    Closed,
}

/// What an idle worker waits for, under a single read deadline.
#[derive(Clone, Copy, Debug)]
enum Wait {
    Unchoke,
    /// A `have` of a piece that is still missing.
    MissingPiece,
}

/// A connection with a remote peer, after a successful handshake.
pub struct Peer<S> {
    pub remote: SocketAddr,
    pub session: Session,
    pub stats: PeerStats,
    socket: Framed<S, CoreCodec>,
    ctx: Arc<DownloadCtx>,
    results: mpsc::UnboundedSender<CompletedPiece>,
}

/// Connect to `remote` and download pieces from it until the pool is
/// closed or the connection fails. Failures end this worker only, the
/// download goes on with the other peers.
pub async fn run_peer(
    remote: SocketAddr,
    ctx: Arc<DownloadCtx>,
    results: mpsc::UnboundedSender<CompletedPiece>,
) -> PeerStats {
    let cancel = ctx.cancel.clone();

    let mut peer = select! {
        _ = cancel.cancelled() => return PeerStats::default(),
        peer = Peer::connect(remote, ctx, results) => match peer {
            Ok(peer) => peer,
            Err(e) => {
                debug!("{remote} could not start a session: {e}");
                return PeerStats::default();
            }
        },
    };

    if let Err(e) = peer.run().await {
        let state = peer.session.connection;
        if e.is_transport_fault() {
            debug!("{remote} connection lost while {state:?}: {e}");
        } else {
            warn!("{remote} dropping connection while {state:?}: {e}");
        }
    }

    peer.session.connection = ConnectionState::Closed;
    debug!(
        "{remote} closed, {} pieces, {} failed, {} bytes",
        peer.stats.pieces, peer.stats.failed_pieces, peer.stats.downloaded
    );

    peer.stats
}

impl Peer<TcpStream> {
    /// Dial the peer and perform the handshake, each under its own deadline.
    pub async fn connect(
        remote: SocketAddr,
        ctx: Arc<DownloadCtx>,
        results: mpsc::UnboundedSender<CompletedPiece>,
    ) -> Result<Self, Error> {
        let session = Session::default();
        debug!("{remote} {:?}", session.connection);

        let socket = timeout(ctx.config.connect_timeout(), TcpStream::connect(remote))
            .await
            .map_err(|_| Error::ConnectTimeout)??;

        Self::start(remote, socket, session, ctx, results).await
    }
}

impl<S> Peer<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Exchange handshakes on an open socket and wait for the bitfield of
    /// the peer, which must be its first message.
    pub async fn handshake(
        remote: SocketAddr,
        socket: S,
        ctx: Arc<DownloadCtx>,
        results: mpsc::UnboundedSender<CompletedPiece>,
    ) -> Result<Self, Error> {
        Self::start(remote, socket, Session::default(), ctx, results).await
    }

    async fn start(
        remote: SocketAddr,
        socket: S,
        mut session: Session,
        ctx: Arc<DownloadCtx>,
        results: mpsc::UnboundedSender<CompletedPiece>,
    ) -> Result<Self, Error> {
        session.connection = ConnectionState::Handshaking;
        debug!("{remote} {:?}", session.connection);

        let (mut socket, theirs) = timeout(
            ctx.config.handshake_timeout(),
            perform_handshake(socket, ctx.local_peer_id.clone(), ctx.info_hash.clone()),
        )
        .await
        .map_err(|_| Error::HandshakeTimeout)??;

        session.connection = ConnectionState::AwaitingBitfield;
        debug!("{remote} handshake ok, peer id {}", theirs.peer_id);

        let pieces = loop {
            let msg = match timeout(ctx.config.read_timeout(), socket.next()).await {
                Err(_) => return Err(Error::MessageTimeout),
                Ok(None) => return Err(Error::PeerClosedSocket),
                Ok(Some(msg)) => msg?,
            };

            match msg {
                Core::KeepAlive => continue,
                Core::Bitfield(pieces) => break pieces,
                other => {
                    return Err(Error::ProtocolFraming(format!(
                        "expected a bitfield, got {:?}",
                        other.id()
                    )));
                }
            }
        };

        debug!("{remote} < bitfield with {} pieces", pieces.count_ones());

        session.pieces = pieces;
        session.connection = ConnectionState::Ready;

        Ok(Self { remote, session, stats: PeerStats::default(), socket, ctx, results })
    }

    /// Download pieces until the pool is closed or the download cancelled.
    ///
    /// # Errors
    ///
    /// Any connection or protocol error. A piece held at that moment was
    /// already given back to the pool.
    pub async fn run(&mut self) -> Result<(), Error> {
        let remote = self.remote;

        debug!("{remote} > interested");
        self.socket.send(Core::Interested).await?;
        self.session.am_interested = true;

        debug!("{remote} > unchoke");
        self.socket.send(Core::Unchoke).await?;

        loop {
            if self.session.peer_choking {
                if !self.wait_for(Wait::Unchoke).await? {
                    return Ok(());
                }
                continue;
            }

            match self.claim_piece().await {
                Claim::Closed => return Ok(()),
                Claim::Unavailable => {
                    let alive = if self.has_missing_piece().await {
                        debug!("{remote} waiting for a piece held by another peer");
                        self.wait_for_requeue().await?
                    } else {
                        debug!("{remote} has none of the missing pieces, waiting");
                        self.wait_for(Wait::MissingPiece).await?
                    };
                    if !alive {
                        return Ok(());
                    }
                }
                Claim::Piece(piece) => match self.download_piece(piece).await {
                    Ok(()) | Err(Error::PieceInvalid(_)) => {}
                    Err(Error::Cancelled) => return Ok(()),
                    Err(e) => return Err(e),
                },
            }
        }
    }

    /// Pull pieces until one that the peer has is found. Pieces the peer
    /// does not have go back to the pool right away.
    async fn claim_piece(&mut self) -> Claim {
        let mut skipped = 0;

        loop {
            let piece = select! {
                _ = self.ctx.cancel.cancelled() => return Claim::Closed,
                piece = self.ctx.pool.pull() => match piece {
                    Some(piece) => piece,
                    None => return Claim::Closed,
                },
            };

            if self.session.pieces.has_piece(piece.index) {
                return Claim::Piece(piece);
            }

            self.ctx.pool.skip(piece);
            skipped += 1;

            // went around the whole pool
            if skipped >= self.ctx.pool.len().max(1) {
                return Claim::Unavailable;
            }
        }
    }

    /// Whether the peer has a piece that is not verified yet, pending or in
    /// the hands of another worker.
    async fn has_missing_piece(&self) -> bool {
        let missing = self.ctx.missing.read().await;
        missing.iter_ones().any(|index| self.session.pieces.has_piece(index))
    }

    /// Download, assemble and verify one piece. The whole piece must arrive
    /// within one read deadline, keep-alives or stray blocks do not extend
    /// it.
    ///
    /// # Errors
    ///
    /// [`Error::PieceInvalid`] when the hash does not match, the connection
    /// is still usable. Any other error means the connection is not. In both
    /// cases the piece is back in the pool.
    async fn download_piece(&mut self, piece: PieceDescriptor) -> Result<(), Error> {
        let remote = self.remote;
        let index = piece.index;
        debug!("{remote} downloading piece {index}");

        let mut download = PieceDownload::new(piece, self.ctx.config.block_len());

        let filled = timeout(self.ctx.config.read_timeout(), self.fill_piece(&mut download))
            .await
            .unwrap_or(Err(Error::PieceTimeout(index)));

        if let Err(e) = filled {
            self.ctx.pool.requeue(download.into_piece());
            return Err(e);
        }

        let (piece, data) = download.finish();

        if !verify(&data, &piece.hash) {
            warn!("{remote} piece {index} failed the hash check");
            self.stats.failed_pieces += 1;
            self.ctx.pool.requeue(piece);
            return Err(Error::PieceInvalid(index));
        }

        self.stats.pieces += 1;
        self.stats.downloaded += data.len() as u64;

        if self.results.send(CompletedPiece { index, data }).is_err() {
            debug!("{remote} scheduler is gone, dropping piece {index}");
        }

        Ok(())
    }

    /// Request blocks and read frames until every block of the piece
    /// arrived.
    async fn fill_piece(&mut self, download: &mut PieceDownload) -> Result<(), Error> {
        let remote = self.remote;

        while !download.is_complete() {
            if !self.session.peer_choking {
                let requests = download.next_requests(self.ctx.config.max_pipeline());
                if !requests.is_empty() {
                    debug!(
                        "{remote} > {} requests of piece {}",
                        requests.len(),
                        download.piece().index
                    );
                    for block_info in requests {
                        self.socket.feed(Core::Request(block_info)).await?;
                    }
                    self.socket.flush().await?;
                }
            }

            let Some(msg) = self.next_frame().await? else {
                return Err(Error::Cancelled);
            };
            self.handle_msg(msg, Some(download))?;
        }

        Ok(())
    }

    /// Read frames while holding no piece until `wait` is satisfied. One
    /// read deadline covers all of them. Returns false if the download was
    /// cancelled.
    async fn wait_for(&mut self, wait: Wait) -> Result<bool, Error> {
        let deadline = Instant::now() + self.ctx.config.read_timeout();

        loop {
            let ready = match wait {
                Wait::Unchoke => !self.session.peer_choking,
                Wait::MissingPiece => self.has_missing_piece().await,
            };
            if ready {
                return Ok(true);
            }

            let frame = timeout_at(deadline, self.next_frame())
                .await
                .map_err(|_| Error::MessageTimeout)??;

            match frame {
                Some(msg) => self.handle_msg(msg, None)?,
                None => return Ok(false),
            }
        }
    }

    /// The peer has pieces we miss, but other workers hold them. Stay
    /// connected until a piece goes back to the pool, or a frame arrives.
    /// A silent peer is not a fault here. Returns false if the download was
    /// cancelled.
    async fn wait_for_requeue(&mut self) -> Result<bool, Error> {
        select! {
            _ = self.ctx.cancel.cancelled() => Ok(false),
            _ = self.ctx.pool.changed() => Ok(true),
            _ = sleep(POOL_POLL) => Ok(true),
            msg = self.socket.next() => match msg {
                None => Err(Error::PeerClosedSocket),
                Some(msg) => {
                    self.handle_msg(msg?, None)?;
                    Ok(true)
                }
            },
        }
    }

    /// Read the next frame under the read deadline. Returns `None` if the
    /// download was cancelled meanwhile.
    async fn next_frame(&mut self) -> Result<Option<Core>, Error> {
        let read_timeout = self.ctx.config.read_timeout();

        select! {
            _ = self.ctx.cancel.cancelled() => Ok(None),
            msg = timeout(read_timeout, self.socket.next()) => match msg {
                Err(_) => Err(Error::MessageTimeout),
                Ok(None) => Err(Error::PeerClosedSocket),
                Ok(Some(msg)) => msg.map(Some),
            },
        }
    }

    fn handle_msg(
        &mut self,
        msg: Core,
        download: Option<&mut PieceDownload>,
    ) -> Result<(), Error> {
        let remote = self.remote;

        match msg {
            Core::KeepAlive => {
                debug!("{remote} < keepalive");
            }
            Core::Choke => {
                debug!("{remote} < choke");
                self.session.peer_choking = true;
                if let Some(download) = download {
                    download.free_pending_blocks();
                }
            }
            Core::Unchoke => {
                debug!("{remote} < unchoke");
                self.session.peer_choking = false;
            }
            Core::Interested => {
                debug!("{remote} < interested, we do not upload");
            }
            Core::NotInterested => {
                debug!("{remote} < not interested");
            }
            Core::Have(index) => {
                debug!("{remote} < have {index}");
                self.session.pieces.set_piece(index as usize);
            }
            Core::Bitfield(_) => {
                warn!("{remote} < bitfield after the first message, ignoring");
            }
            Core::Request(block_info) => {
                debug!("{remote} < request {block_info:?}, we do not upload");
            }
            Core::Cancel(block_info) => {
                debug!("{remote} < cancel {block_info:?}");
            }
            Core::Piece(block) => match download {
                Some(download) => download.handle_block(block)?,
                None => {
                    debug!(
                        "{remote} < block of piece {} with no piece in flight",
                        block.index
                    );
                }
            },
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream},
        sync::RwLock,
    };
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        bitfield::Bitfield,
        config::Config,
        metainfo::InfoHash,
        piece::hash,
        scheduler::PendingPool,
        tcp_wire::{handshake::HANDSHAKE_LEN, Block, Handshake},
    };

    #[derive(Clone, Copy, PartialEq)]
    enum Behaviour {
        Honest,
        CorruptFirst,
        ChokeFirst,
        /// Starts with an empty bitfield and announces the piece later.
        HaveLater,
        /// Chokes on the first request and only sends keep-alives after.
        ChokeAndHold,
    }

    fn remote() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    fn ctx(data: &[u8], config: Config) -> Arc<DownloadCtx> {
        let piece = PieceDescriptor { index: 0, hash: hash(data), length: data.len() as u32 };

        Arc::new(DownloadCtx {
            info_hash: InfoHash([7u8; 20]),
            local_peer_id: PeerId::from([1u8; 20]),
            config,
            pool: PendingPool::new(vec![piece]),
            missing: RwLock::new(Bitfield::repeat(true, 1)),
            cancel: CancellationToken::new(),
        })
    }

    /// Answer the handshake of the worker and send `first` right after.
    async fn accept(mut remote: DuplexStream, first: Core) -> Framed<DuplexStream, CoreCodec> {
        let mut theirs = [0u8; HANDSHAKE_LEN];
        remote.read_exact(&mut theirs).await.unwrap();

        let ours = Handshake::new([7u8; 20], [2u8; 20]).serialize().unwrap();
        remote.write_all(&ours).await.unwrap();

        let mut socket = Framed::new(remote, CoreCodec);
        socket.send(first).await.unwrap();
        socket
    }

    async fn serve(remote: DuplexStream, data: Vec<u8>, behaviour: Behaviour) {
        let pieces = match behaviour {
            Behaviour::HaveLater => Bitfield::from_vec(vec![0]),
            _ => Bitfield::from_vec(vec![0b1000_0000]),
        };
        let mut socket = accept(remote, Core::Bitfield(pieces)).await;
        let _ = socket.send(Core::Unchoke).await;

        if behaviour == Behaviour::HaveLater {
            sleep(Duration::from_millis(100)).await;
            let _ = socket.send(Core::Have(0)).await;
        }

        let mut requests = 0;

        while let Some(Ok(msg)) = socket.next().await {
            let Core::Request(info) = msg else { continue };
            requests += 1;

            if behaviour == Behaviour::ChokeFirst && requests == 1 {
                let _ = socket.send(Core::Choke).await;
                let _ = socket.send(Core::Unchoke).await;
                continue;
            }

            if behaviour == Behaviour::ChokeAndHold {
                let _ = socket.send(Core::Choke).await;
                loop {
                    sleep(Duration::from_millis(300)).await;
                    if socket.send(Core::KeepAlive).await.is_err() {
                        return;
                    }
                }
            }

            let begin = info.begin as usize;
            let mut block = data[begin..begin + info.len as usize].to_vec();
            if behaviour == Behaviour::CorruptFirst && requests == 1 {
                block[0] ^= 0xff;
            }

            let _ = socket
                .send(Core::Piece(Block { index: info.index, begin: info.begin, block }))
                .await;
        }
    }

    async fn download(
        data: &[u8],
        config: Config,
        behaviour: Behaviour,
    ) -> (PeerStats, CompletedPiece) {
        let ctx = ctx(data, config);
        let (results, mut rx) = mpsc::unbounded_channel();
        let (local, remote_io) = duplex(1 << 16);

        tokio::spawn(serve(remote_io, data.to_vec(), behaviour));

        let mut peer = Peer::handshake(remote(), local, ctx.clone(), results).await.unwrap();
        assert_eq!(peer.session.connection, ConnectionState::Ready);

        let worker = tokio::spawn(async move {
            let r = peer.run().await;
            (r, peer.stats)
        });

        let piece = rx.recv().await.unwrap();
        ctx.pool.close();

        let (r, stats) = worker.await.unwrap();
        assert!(r.is_ok());
        (stats, piece)
    }

    #[tokio::test]
    async fn downloads_a_piece_in_blocks() {
        let data = b"abcdefghij".to_vec();
        let config = Config { block_len: 4, ..Default::default() };

        let (stats, piece) = download(&data, config, Behaviour::Honest).await;

        assert_eq!(piece, CompletedPiece { index: 0, data: data.clone() });
        assert_eq!(stats, PeerStats { pieces: 1, failed_pieces: 0, downloaded: 10 });
    }

    #[tokio::test]
    async fn corrupted_piece_is_retried() {
        let data = b"abcdef".to_vec();
        let config = Config { block_len: 4, ..Default::default() };

        let (stats, piece) = download(&data, config, Behaviour::CorruptFirst).await;

        assert_eq!(piece.data, data);
        assert_eq!(stats.failed_pieces, 1);
        assert_eq!(stats.pieces, 1);
    }

    #[tokio::test]
    async fn choke_in_the_middle_of_a_piece() {
        let data = b"wxyz".to_vec();

        let (stats, piece) = download(&data, Config::default(), Behaviour::ChokeFirst).await;

        assert_eq!(piece.data, data);
        assert_eq!(stats.downloaded, 4);
    }

    #[tokio::test]
    async fn have_makes_a_piece_claimable() {
        let data = b"abcdef".to_vec();
        let config = Config { read_timeout_secs: 5, ..Default::default() };

        let (stats, piece) = download(&data, config, Behaviour::HaveLater).await;

        assert_eq!(piece, CompletedPiece { index: 0, data });
        assert_eq!(stats.pieces, 1);
    }

    #[tokio::test]
    async fn choked_holder_gives_the_piece_back() {
        let data = b"abcd".to_vec();
        let config = Config { read_timeout_secs: 1, ..Default::default() };
        let ctx = ctx(&data, config);
        let (results, _rx) = mpsc::unbounded_channel();
        let (local, remote_io) = duplex(1024);

        let seeder = tokio::spawn(serve(remote_io, data, Behaviour::ChokeAndHold));

        let mut peer = Peer::handshake(remote(), local, ctx.clone(), results).await.unwrap();
        let r = timeout(Duration::from_secs(5), peer.run()).await.unwrap();

        assert!(matches!(r, Err(Error::PieceTimeout(0))));
        assert_eq!(ctx.pool.len(), 1);
        seeder.abort();
    }

    #[tokio::test]
    async fn first_message_must_be_bitfield() {
        let ctx = ctx(b"abcd", Config::default());
        let (results, _rx) = mpsc::unbounded_channel();
        let (local, remote_io) = duplex(1024);

        tokio::spawn(async move {
            let _socket = accept(remote_io, Core::Unchoke).await;
            sleep(Duration::from_secs(5)).await;
        });

        let r = Peer::handshake(remote(), local, ctx, results).await;
        assert!(matches!(r, Err(Error::ProtocolFraming(_))));
    }

    #[tokio::test]
    async fn peer_without_pieces_times_out_holding_nothing() {
        let config = Config { read_timeout_secs: 1, ..Default::default() };
        let ctx = ctx(b"abcd", config);
        let (results, _rx) = mpsc::unbounded_channel();
        let (local, remote_io) = duplex(1024);

        let seeder = tokio::spawn(async move {
            let empty = Core::Bitfield(Bitfield::from_vec(vec![0]));
            let mut socket = accept(remote_io, empty).await;
            socket.send(Core::Unchoke).await.unwrap();
            // keep-alives do not extend the wait for a useful piece
            loop {
                sleep(Duration::from_millis(300)).await;
                if socket.send(Core::KeepAlive).await.is_err() {
                    return;
                }
            }
        });

        let mut peer = Peer::handshake(remote(), local, ctx.clone(), results).await.unwrap();
        let r = timeout(Duration::from_secs(5), peer.run()).await.unwrap();

        assert!(matches!(r, Err(Error::MessageTimeout)));
        assert_eq!(ctx.pool.len(), 1);
        seeder.abort();
    }
}
