use tracing::debug;

use crate::{
    bitfield::{Bitfield, PieceBitfield},
    error::Error,
    piece::PieceDescriptor,
    tcp_wire::{Block, BlockInfo},
};

/// The life of a connection with a peer, in order. Any failure jumps
/// straight to `Closed`.
#[derive(Clone, Default, Copy, Debug, PartialEq)]
pub enum ConnectionState {
    /// Dialing the TCP connection.
    #[default]
    Connecting,

    /// Exchanging handshakes.
    Handshaking,

    /// Waiting for the bitfield, which must be the first message.
    AwaitingBitfield,

    /// Requesting and receiving pieces, choked or not.
    Ready,

    /// The socket was released.
    Closed,
}

/// Holds the state of a peer session, owned by the worker of the
/// connection and never shared.
#[derive(Debug)]
pub struct Session {
    /// The current state of the connection.
    pub connection: ConnectionState,

    /// If we're choked, peer doesn't allow us to download pieces from them.
    pub peer_choking: bool,

    /// If we're interested, peer has pieces that we don't have.
    pub am_interested: bool,

    /// Pieces the peer has, from its bitfield and the `have`s that followed.
    pub pieces: Bitfield,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            connection: ConnectionState::default(),
            peer_choking: true,
            am_interested: false,
            pieces: Bitfield::new(),
        }
    }
}

/// A piece being assembled from blocks.
///
/// Blocks are tracked by slot, `begin / block_len`, so a block that arrives
/// twice (a late answer after a choke, for example) is only counted once.
#[derive(Debug)]
pub struct PieceDownload {
    piece: PieceDescriptor,
    block_len: u32,
    buf: Vec<u8>,
    /// Slots that were asked for, and not forgotten by a choke.
    requested: Bitfield,
    /// Slots that arrived.
    received: Bitfield,
    /// Requests in flight.
    pub outgoing_requests: Vec<BlockInfo>,
    /// Bytes received so far.
    pub downloaded: u32,
}

impl PieceDownload {
    pub fn new(piece: PieceDescriptor, block_len: u32) -> Self {
        let blocks = piece.length.div_ceil(block_len) as usize;

        Self {
            buf: vec![0; piece.length as usize],
            requested: Bitfield::from_piece(blocks),
            received: Bitfield::from_piece(blocks),
            outgoing_requests: Vec::new(),
            downloaded: 0,
            block_len,
            piece,
        }
    }

    pub fn piece(&self) -> &PieceDescriptor {
        &self.piece
    }

    fn block_info(&self, slot: usize) -> BlockInfo {
        let begin = slot as u32 * self.block_len;
        BlockInfo {
            index: self.piece.index as u32,
            begin,
            len: self.block_len.min(self.piece.length - begin),
        }
    }

    /// Pick the next blocks to request, so that at most `max_pipeline`
    /// requests are in flight. The returned requests are already counted
    /// as outgoing.
    pub fn next_requests(&mut self, max_pipeline: usize) -> Vec<BlockInfo> {
        let capacity = max_pipeline.saturating_sub(self.outgoing_requests.len());

        let slots: Vec<usize> = self
            .requested
            .iter_zeros()
            .filter(|slot| !self.received.has_piece(*slot))
            .take(capacity)
            .collect();

        let mut requests = Vec::with_capacity(slots.len());
        for slot in slots {
            self.requested.set(slot, true);
            let block_info = self.block_info(slot);
            self.outgoing_requests.push(block_info.clone());
            requests.push(block_info);
        }
        requests
    }

    /// The peer choked us and discarded our requests. Nothing that was in
    /// flight is assumed delivered, those blocks will be requested again.
    pub fn free_pending_blocks(&mut self) {
        debug!(
            "freeing {} requests of piece {}",
            self.outgoing_requests.len(),
            self.piece.index
        );
        self.outgoing_requests.clear();
        self.requested = self.received.clone();
    }

    /// Copy a block into the piece buffer.
    ///
    /// # Errors
    ///
    /// A block that does not fit in the piece is a framing error.
    pub fn handle_block(&mut self, block: Block) -> Result<(), Error> {
        if block.index as usize != self.piece.index {
            debug!(
                "ignoring block of piece {} while downloading piece {}",
                block.index, self.piece.index
            );
            return Ok(());
        }

        if block.end() > self.piece.length as u64 {
            return Err(Error::ProtocolFraming(format!(
                "block at {} with {} bytes overflows piece {} of {} bytes",
                block.begin,
                block.block.len(),
                self.piece.index,
                self.piece.length
            )));
        }

        let info = BlockInfo::from(&block);
        self.outgoing_requests.retain(|v| *v != info);

        let slot = (block.begin / self.block_len) as usize;
        if block.begin % self.block_len != 0 || self.block_info(slot) != info {
            debug!("ignoring unrequested block {info:?}");
            return Ok(());
        }
        if self.received.has_piece(slot) {
            debug!("ignoring duplicated block {info:?}");
            return Ok(());
        }

        let begin = block.begin as usize;
        self.buf[begin..begin + block.block.len()].copy_from_slice(&block.block);
        self.received.set_piece(slot);
        self.requested.set_piece(slot);
        self.downloaded += info.len;

        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded == self.piece.length
    }

    /// Give up on the piece, the assembled bytes are discarded.
    pub fn into_piece(self) -> PieceDescriptor {
        self.piece
    }

    /// The piece and its assembled bytes.
    pub fn finish(self) -> (PieceDescriptor, Vec<u8>) {
        (self.piece, self.buf)
    }
}
